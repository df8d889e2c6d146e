//! # Meshtastic Event Classification
//!
//! Radio events arrive from the upstream subscription as JSON objects in the
//! shape the Meshtastic client libraries emit:
//!
//! ```text
//! { "id": 1234, "fromId": "!a1b2c3d4", "toId": "^all", "hopsAway": 1,
//!   "rxSnr": 6.25, "rxRssi": -92, "rxTime": 1700000000,
//!   "decoded": { "portnum": "TEXT_MESSAGE_APP", "text": "hello" } }
//! ```
//!
//! [`classify`] turns one [`RawEvent`] into a typed [`Packet`]: it picks the
//! [`PacketKind`] from `decoded.portnum`, extracts the sender and timestamp
//! and normalizes field names and units (integer coordinates to degrees,
//! quarter-dB SNR to dB, node numbers to `!xxxxxxxx` ids). Anything it cannot
//! make sense of is an [`EventError`] which the ingestor counts and drops.
//!
//! Protocol decoding itself happens upstream; this module never sees bytes.

pub mod reader;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::storage::TelemetryMetrics;
use crate::validation::node_id_from_num;

/// Broadcast destination as a node number
pub const BROADCAST_NUM: u32 = 0xffff_ffff;

/// SNR value meaning "unknown" in route discovery payloads
const UNKNOWN_SNR: i64 = -128;

/// One event as handed over by the radio subscription.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub payload: Value,
    /// When the bridge received it; `rxTime` in the payload takes precedence
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn at(payload: Value, received_at: DateTime<Utc>) -> Self {
        Self { payload, received_at }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Text,
    Telemetry,
    Position,
    NodeInfo,
    Routing,
    Admin,
}

impl PacketKind {
    /// Map a Meshtastic port name or number.
    pub fn from_port(port: &Value) -> Option<(Self, String)> {
        let name = match port {
            Value::String(s) => s.clone(),
            Value::Number(n) => match n.as_u64()? {
                1 => "TEXT_MESSAGE_APP",
                3 => "POSITION_APP",
                4 => "NODEINFO_APP",
                5 => "ROUTING_APP",
                6 => "ADMIN_APP",
                67 => "TELEMETRY_APP",
                70 => "TRACEROUTE_APP",
                _ => return None,
            }
            .to_string(),
            _ => return None,
        };
        let kind = match name.as_str() {
            "TEXT_MESSAGE_APP" => PacketKind::Text,
            "TELEMETRY_APP" => PacketKind::Telemetry,
            "POSITION_APP" => PacketKind::Position,
            "NODEINFO_APP" => PacketKind::NodeInfo,
            "ROUTING_APP" | "TRACEROUTE_APP" => PacketKind::Routing,
            "ADMIN_APP" => PacketKind::Admin,
            _ => return None,
        };
        Some((kind, name))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacketKind::Text => "text",
            PacketKind::Telemetry => "telemetry",
            PacketKind::Position => "position",
            PacketKind::NodeInfo => "node_info",
            PacketKind::Routing => "routing",
            PacketKind::Admin => "admin",
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfo {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<String>,
}

/// Route discovery result; SNR values are in dB, `None` where unknown.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteTrace {
    pub route: Vec<String>,
    pub route_back: Vec<String>,
    pub snr_towards: Vec<Option<f64>>,
    pub snr_back: Vec<Option<f64>>,
}

impl RouteTrace {
    /// `from -> hop (snr) -> ... -> to` on one line.
    pub fn summary(&self, from: &str, to: &str) -> String {
        let mut out = from.to_string();
        for (i, hop) in self.route.iter().enumerate() {
            out.push_str(" -> ");
            out.push_str(hop);
            if let Some(Some(snr)) = self.snr_towards.get(i) {
                out.push_str(&format!(" ({:.1}dB)", snr));
            }
        }
        out.push_str(" -> ");
        out.push_str(to);
        if self.snr_towards.len() > self.route.len() {
            if let Some(Some(snr)) = self.snr_towards.last() {
                out.push_str(&format!(" ({:.1}dB)", snr));
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Text { text: String },
    Telemetry { metrics: TelemetryMetrics },
    Position { fix: PositionFix },
    NodeInfo { info: NodeInfo },
    Routing { trace: Option<RouteTrace> },
    Admin,
}

/// Classified, normalized radio packet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Packet {
    pub id: Option<u32>,
    pub kind: PacketKind,
    pub port: String,
    pub from: String,
    pub from_num: Option<u32>,
    /// `None` for broadcast
    pub to: Option<String>,
    pub channel: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub hops_away: Option<u32>,
    pub snr: Option<f64>,
    pub rssi: Option<i32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventError {
    #[error("event is not a JSON object")]
    NotAnObject,

    #[error("event has no sender id")]
    MissingSender,

    #[error("event has no decoded payload (encrypted or undecodable)")]
    NotDecoded,

    #[error("unrecognized port {0}")]
    UnknownPort(String),

    #[error("{kind} event is missing its {field} payload")]
    MissingPayload { kind: PacketKind, field: &'static str },
}

fn obj<'a>(v: &'a Value, key: &str) -> Option<&'a Map<String, Value>> {
    v.get(key).and_then(Value::as_object)
}

fn f64_of(m: &Map<String, Value>, key: &str) -> Option<f64> {
    m.get(key).and_then(Value::as_f64).filter(|v| v.is_finite())
}

fn u32_of(v: &Value, key: &str) -> Option<u32> {
    v.get(key).and_then(Value::as_u64).and_then(|n| u32::try_from(n).ok())
}

fn str_of(m: &Map<String, Value>, key: &str) -> Option<String> {
    m.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Node id from either the string form or the numeric form of a field pair.
fn node_ref(v: &Value, id_key: &str, num_key: &str) -> (Option<String>, Option<u32>) {
    let num = u32_of(v, num_key);
    let id = v
        .get(id_key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| num.map(node_id_from_num));
    (id, num)
}

fn route_ids(list: Option<&Value>) -> Vec<String> {
    list.and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|n| n.as_u64().and_then(|n| u32::try_from(n).ok()))
                .map(node_id_from_num)
                .collect()
        })
        .unwrap_or_default()
}

fn route_snrs(list: Option<&Value>) -> Vec<Option<f64>> {
    list.and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .map(|s| s.as_i64().filter(|s| *s != UNKNOWN_SNR).map(|s| s as f64 / 4.0))
                .collect()
        })
        .unwrap_or_default()
}

fn telemetry_metrics(t: &Map<String, Value>) -> TelemetryMetrics {
    let mut m = TelemetryMetrics::default();
    if let Some(d) = t.get("deviceMetrics").and_then(Value::as_object) {
        m.battery_level = f64_of(d, "batteryLevel");
        m.voltage = f64_of(d, "voltage");
        m.channel_utilization = f64_of(d, "channelUtilization");
        m.air_util_tx = f64_of(d, "airUtilTx");
        m.uptime_seconds = d.get("uptimeSeconds").and_then(Value::as_i64);
    }
    if let Some(e) = t.get("environmentMetrics").and_then(Value::as_object) {
        m.temperature = f64_of(e, "temperature");
        m.humidity = f64_of(e, "relativeHumidity");
        m.pressure = f64_of(e, "barometricPressure");
        m.gas_resistance = f64_of(e, "gasResistance");
        m.iaq = f64_of(e, "iaq");
    }
    if let Some(a) = t.get("airQualityMetrics").and_then(Value::as_object) {
        m.pm10 = f64_of(a, "pm10Environmental");
        m.pm25 = f64_of(a, "pm25Environmental");
        m.pm100 = f64_of(a, "pm100Environmental");
        if m.iaq.is_none() {
            m.iaq = f64_of(a, "aqi");
        }
    }
    m
}

fn position_fix(p: &Map<String, Value>) -> Option<PositionFix> {
    let coord = |deg: &str, int_a: &str, int_b: &str| {
        f64_of(p, deg).or_else(|| {
            p.get(int_a)
                .or_else(|| p.get(int_b))
                .and_then(Value::as_i64)
                .map(|v| v as f64 / 1e7)
        })
    };
    let latitude = coord("latitude", "latitudeI", "latitude_i")?;
    let longitude = coord("longitude", "longitudeI", "longitude_i")?;
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    Some(PositionFix {
        latitude,
        longitude,
        altitude: f64_of(p, "altitude"),
        speed: f64_of(p, "groundSpeed").or_else(|| f64_of(p, "ground_speed")),
        heading: f64_of(p, "groundTrack").or_else(|| f64_of(p, "ground_track")),
        accuracy: f64_of(p, "precisionBits").or_else(|| f64_of(p, "precision_bits")),
    })
}

/// Classify and normalize one raw event.
pub fn classify(raw: &RawEvent) -> Result<Packet, EventError> {
    let v = &raw.payload;
    if !v.is_object() {
        return Err(EventError::NotAnObject);
    }

    let (from, from_num) = node_ref(v, "fromId", "from");
    let from = from.ok_or(EventError::MissingSender)?;
    let (to, to_num) = node_ref(v, "toId", "to");
    let to = match (to, to_num) {
        (_, Some(BROADCAST_NUM)) => None,
        (Some(id), _) if id == "^all" || id.eq_ignore_ascii_case("!ffffffff") => None,
        (id, _) => id,
    };

    let decoded = v.get("decoded").filter(|d| d.is_object()).ok_or(EventError::NotDecoded)?;
    let port_value = decoded.get("portnum").ok_or(EventError::NotDecoded)?;
    let (kind, port) = PacketKind::from_port(port_value)
        .ok_or_else(|| {
            EventError::UnknownPort(port_value.to_string().trim_matches('"').to_string())
        })?;

    let timestamp = v
        .get("rxTime")
        .and_then(Value::as_i64)
        .filter(|t| *t > 0)
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
        .unwrap_or(raw.received_at);

    let hops_away = u32_of(v, "hopsAway").or_else(|| {
        let start = u32_of(v, "hopStart")?;
        let limit = u32_of(v, "hopLimit")?;
        start.checked_sub(limit)
    });
    let snr = v
        .get("rxSnr")
        .or_else(|| v.get("snr"))
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite());
    let rssi = v
        .get("rxRssi")
        .or_else(|| v.get("rssi"))
        .and_then(Value::as_i64)
        .and_then(|r| i32::try_from(r).ok())
        .filter(|r| *r != 0);

    let missing = |field| EventError::MissingPayload { kind, field };
    let payload = match kind {
        PacketKind::Text => {
            let text = decoded
                .get("text")
                .or_else(|| decoded.get("payload"))
                .and_then(Value::as_str)
                .ok_or_else(|| missing("text"))?;
            Payload::Text { text: text.to_string() }
        }
        PacketKind::Telemetry => {
            let metrics = obj(decoded, "telemetry")
                .map(telemetry_metrics)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| missing("telemetry"))?;
            Payload::Telemetry { metrics }
        }
        PacketKind::Position => {
            let fix = obj(decoded, "position")
                .and_then(position_fix)
                .ok_or_else(|| missing("position"))?;
            Payload::Position { fix }
        }
        PacketKind::NodeInfo => {
            let user = obj(decoded, "user").ok_or_else(|| missing("user"))?;
            Payload::NodeInfo {
                info: NodeInfo {
                    long_name: str_of(user, "longName"),
                    short_name: str_of(user, "shortName"),
                    hw_model: str_of(user, "hwModel"),
                },
            }
        }
        PacketKind::Routing => {
            let discovery = decoded
                .get("routing")
                .and_then(|r| r.get("routeDiscovery"))
                .or_else(|| decoded.get("traceroute"))
                .filter(|d| d.is_object());
            Payload::Routing {
                trace: discovery.map(|d| RouteTrace {
                    route: route_ids(d.get("route")),
                    route_back: route_ids(d.get("routeBack")),
                    snr_towards: route_snrs(d.get("snrTowards")),
                    snr_back: route_snrs(d.get("snrBack")),
                }),
            }
        }
        PacketKind::Admin => Payload::Admin,
    };

    Ok(Packet {
        id: u32_of(v, "id").filter(|id| *id != 0),
        kind,
        port,
        from,
        from_num,
        to,
        channel: u32_of(v, "channel"),
        timestamp,
        hops_away,
        snr,
        rssi,
        payload,
    })
}
