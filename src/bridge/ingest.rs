//! # Packet Ingestion
//!
//! The radio subscription runs on its own thread and must never block, so it
//! only ever touches an [`IngestHandle`]: `submit` is a non-blocking push into
//! a bounded queue. A full queue evicts its oldest event, counts the overflow
//! and reports it to both the producer and the worker that dequeues next.
//! A pool of tokio workers drains the queue and runs every event through
//! [`Ingestor::ingest`]:
//!
//! 1. classify and normalize (malformed events are counted and dropped)
//! 2. persist the node sighting and the kind-specific record in one transaction
//! 3. positions go through the [`MovementDetector`]
//! 4. append a summary to the [`LiveBuffer`]
//! 5. text messages ask the [`DedupRateLimiter`] whether to relay
//!
//! The result is a [`RelayDecision`]; admitted text and any notices (new
//! node, movement) are forwarded to the chat sink as [`ChatEvent`]s.

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;

use super::dedup::{Admission, DedupRateLimiter, Fingerprint};
use super::live::{LiveBuffer, LiveEntry, LiveKind};
use super::movement::{MovementDetector, MovementEvent};
use super::{blocking, retry_once};
use crate::config::BridgeConfig;
use crate::logutil::{escape_log, preview};
use crate::meshtastic::{classify, Packet, PacketKind, Payload, RawEvent};
use crate::metrics::Metrics;
use crate::storage::{
    lock, messages, nodes, telemetry, Direction, Message, NodeSighting, Position, StorageError,
    Store, TelemetryMetrics, TelemetrySample,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("ingest is closed")]
    Closed,
}

/// Outcome of a successful [`IngestHandle::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    /// The queue was full; its oldest pending event was dropped to make room.
    EvictedOldest,
}

/// An event taken off the queue, with the number of older events evicted
/// since the previous one was taken.
#[derive(Debug)]
pub struct Dequeued {
    pub event: RawEvent,
    pub evicted: u64,
}

struct QueueState {
    events: VecDeque<RawEvent>,
    evicted: u64,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    capacity: usize,
    ready: Notify,
}

/// Producer-side handle. Cheap to clone; every clone feeds the same queue and
/// `close` on any of them closes it for all.
#[derive(Clone)]
pub struct IngestHandle {
    shared: Arc<Shared>,
    metrics: Arc<Metrics>,
}

/// Consumer side of the ingest queue, shared by the worker pool.
#[derive(Clone)]
pub struct IngestQueue {
    shared: Arc<Shared>,
}

/// Bounded ingest queue holding at most `capacity` pending events.
pub fn channel(capacity: usize, metrics: Arc<Metrics>) -> (IngestHandle, IngestQueue) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            events: VecDeque::with_capacity(capacity),
            evicted: 0,
            closed: false,
        }),
        capacity,
        ready: Notify::new(),
    });
    (
        IngestHandle {
            shared: Arc::clone(&shared),
            metrics,
        },
        IngestQueue { shared },
    )
}

impl IngestHandle {
    /// Hand one event to the async side without blocking. A full queue
    /// evicts its oldest pending event.
    pub fn submit(&self, event: RawEvent) -> Result<Submitted, SubmitError> {
        let outcome = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return Err(SubmitError::Closed);
            }
            let outcome = if state.events.len() >= self.shared.capacity {
                state.events.pop_front();
                state.evicted += 1;
                Submitted::EvictedOldest
            } else {
                Submitted::Queued
            };
            state.events.push_back(event);
            outcome
        };
        self.metrics.inc_received();
        if outcome == Submitted::EvictedOldest {
            self.metrics.inc_queue_overflow();
            warn!(
                "Ingest queue full ({} pending), evicted oldest radio event",
                self.shared.capacity
            );
        }
        self.shared.ready.notify_one();
        Ok(outcome)
    }

    /// Count an event the producer could not even parse.
    pub fn record_malformed(&self) {
        self.metrics.inc_received();
        self.metrics.inc_malformed();
    }

    /// Stop accepting events. Events already queued are still processed.
    pub fn close(&self) {
        let newly_closed = {
            let mut state = lock(&self.shared.state);
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            self.shared.ready.notify_waiters();
            debug!("Ingest handle closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// Events waiting for a worker.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).events.len()
    }
}

impl IngestQueue {
    /// Next event in arrival order. `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<Dequeued> {
        loop {
            let notified = self.shared.ready.notified();
            {
                let mut state = lock(&self.shared.state);
                if let Some(event) = state.events.pop_front() {
                    let evicted = std::mem::take(&mut state.evicted);
                    return Some(Dequeued { event, evicted });
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Why an event was or was not relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RelayReason {
    Relayed,
    Duplicate { age_ms: u64 },
    RateLimited,
    /// Only text is relayed; other kinds are persisted and shown live
    NotRelayable { kind: PacketKind },
    /// Text sent by the bridge's own node
    OwnMessage,
    Malformed { error: String },
}

impl std::fmt::Display for RelayReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayReason::Relayed => write!(f, "relayed"),
            RelayReason::Duplicate { age_ms } => {
                write!(f, "duplicate ({} ms after the first)", age_ms)
            }
            RelayReason::RateLimited => write!(f, "rate limit reached"),
            RelayReason::NotRelayable { kind } => write!(f, "{} is not relayed", kind),
            RelayReason::OwnMessage => write!(f, "sent by this bridge"),
            RelayReason::Malformed { error } => write!(f, "malformed: {}", error),
        }
    }
}

/// Normalized record handed to the chat side for rendering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayRecord {
    pub kind: PacketKind,
    pub sender: String,
    pub sender_name: String,
    pub to: Option<String>,
    pub channel: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub hops_away: Option<u32>,
    pub snr: Option<f64>,
    pub rssi: Option<i32>,
    /// The text was a ping; the chat side may answer it
    pub ping: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    NewNode {
        node_id: String,
        display_name: String,
    },
    Movement {
        display_name: String,
        event: MovementEvent,
    },
}

/// Everything the chat side receives from the ingest path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatEvent {
    Relay(RelayRecord),
    Notice(Notice),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayDecision {
    pub admit: bool,
    pub reason: RelayReason,
    pub kind: Option<PacketKind>,
    /// Set exactly when `admit` is true
    pub record: Option<RelayRecord>,
    pub notices: Vec<Notice>,
}

impl RelayDecision {
    fn rejected(reason: RelayReason, kind: Option<PacketKind>) -> Self {
        Self {
            admit: false,
            reason,
            kind,
            record: None,
            notices: Vec::new(),
        }
    }

    /// The chat events this decision produces, notices first.
    pub fn into_chat_events(self) -> Vec<ChatEvent> {
        let mut out: Vec<ChatEvent> = self.notices.into_iter().map(ChatEvent::Notice).collect();
        if let Some(record) = self.record {
            out.push(ChatEvent::Relay(record));
        }
        out
    }
}

/// Outcome of the per-packet transaction.
struct Persisted {
    created: bool,
    display_name: String,
}

fn sighting_for(packet: &Packet) -> NodeSighting {
    let mut s = NodeSighting::new(packet.from.clone(), packet.timestamp);
    s.node_num = packet.from_num;
    s.hops_away = packet.hops_away;
    if let Payload::NodeInfo { info } = &packet.payload {
        s.long_name = info.long_name.clone();
        s.short_name = info.short_name.clone();
        s.hw_model = info.hw_model.clone();
    }
    s
}

/// Node upsert plus the kind-specific row, atomically. Positions are
/// written by the movement detector under its per-node lock instead.
fn persist_packet(store: &Store, packet: &Packet) -> Result<Persisted, StorageError> {
    store.with_write(|tx| {
        let created = nodes::upsert(tx, &sighting_for(packet))?;
        match &packet.payload {
            Payload::Text { text } => {
                messages::insert(
                    tx,
                    &Message {
                        id: None,
                        direction: Direction::MeshToChat,
                        from_node_id: packet.from.clone(),
                        to_node_id: packet.to.clone(),
                        timestamp: packet.timestamp,
                        text: text.clone(),
                        port_num: Some(packet.port.clone()),
                        channel: packet.channel,
                        hops_away: packet.hops_away,
                        snr: packet.snr,
                        rssi: packet.rssi,
                    },
                )?;
            }
            Payload::Telemetry { metrics } => {
                telemetry::insert(
                    tx,
                    &TelemetrySample {
                        node_id: packet.from.clone(),
                        timestamp: packet.timestamp,
                        metrics: metrics.clone(),
                        snr: packet.snr,
                        rssi: packet.rssi,
                    },
                )?;
            }
            _ => {}
        }
        let display_name = nodes::get(tx, &packet.from)?
            .map(|n| n.display_name().to_string())
            .unwrap_or_else(|| packet.from.clone());
        Ok(Persisted { created, display_name })
    })
}

fn position_for(packet: &Packet) -> Option<Position> {
    let Payload::Position { fix } = &packet.payload else {
        return None;
    };
    let mut p = Position::new(packet.from.clone(), packet.timestamp, fix.latitude, fix.longitude);
    p.altitude = fix.altitude;
    p.speed = fix.speed;
    p.heading = fix.heading;
    p.accuracy = fix.accuracy;
    p.hops_away = packet.hops_away;
    p.snr = packet.snr;
    p.rssi = packet.rssi;
    Some(p)
}

fn telemetry_summary(m: &TelemetryMetrics) -> String {
    let mut parts = Vec::new();
    if let Some(v) = m.battery_level {
        parts.push(format!("battery {:.0}%", v));
    }
    if let Some(v) = m.voltage {
        parts.push(format!("{:.2}V", v));
    }
    if let Some(v) = m.temperature {
        parts.push(format!("{:.1}°C", v));
    }
    if let Some(v) = m.humidity {
        parts.push(format!("{:.0}% rh", v));
    }
    if let Some(v) = m.pressure {
        parts.push(format!("{:.1} hPa", v));
    }
    if let Some(v) = m.iaq {
        parts.push(format!("iaq {:.0}", v));
    }
    if let Some(v) = m.pm25 {
        parts.push(format!("pm2.5 {:.0}", v));
    }
    if parts.is_empty() {
        "telemetry".to_string()
    } else {
        parts.join(", ")
    }
}

/// One-line description for the live monitor.
fn live_summary(packet: &Packet) -> String {
    match &packet.payload {
        Payload::Text { text } => escape_log(&preview(text, 120)),
        Payload::Telemetry { metrics } => telemetry_summary(metrics),
        Payload::Position { fix } => match fix.altitude {
            Some(alt) => format!("{:.5}, {:.5} at {:.0} m", fix.latitude, fix.longitude, alt),
            None => format!("{:.5}, {:.5}", fix.latitude, fix.longitude),
        },
        Payload::NodeInfo { info } => {
            let mut s = info.long_name.clone().unwrap_or_else(|| packet.from.clone());
            if let Some(short) = &info.short_name {
                s.push_str(&format!(" ({})", short));
            }
            if let Some(hw) = &info.hw_model {
                s.push_str(&format!(" {}", hw));
            }
            escape_log(&s)
        }
        Payload::Routing { trace: Some(trace) } => {
            trace.summary(&packet.from, packet.to.as_deref().unwrap_or("broadcast"))
        }
        Payload::Routing { trace: None } => "routing".to_string(),
        Payload::Admin => "admin".to_string(),
    }
}

fn is_ping(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("ping")
}

pub struct Ingestor {
    store: Store,
    detector: MovementDetector,
    limiter: DedupRateLimiter,
    live: Arc<LiveBuffer>,
    metrics: Arc<Metrics>,
    own_node_id: Option<String>,
}

impl Ingestor {
    pub fn new(
        store: Store,
        config: &BridgeConfig,
        live: Arc<LiveBuffer>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let own_node_id = Some(config.node_id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        Self {
            detector: MovementDetector::new(store.clone(), config.movement_threshold_meters),
            limiter: DedupRateLimiter::new(config.dedup_window(), config.relay_rate_per_minute),
            store,
            live,
            metrics,
            own_node_id,
        }
    }

    pub fn limiter(&self) -> &DedupRateLimiter {
        &self.limiter
    }

    fn push_live(&self, entry: LiveEntry) {
        if self.live.push(entry) {
            self.metrics.inc_live_overflow();
        }
    }

    /// Process one radio event. Never fails: malformed events and store
    /// errors are logged and counted.
    pub async fn ingest(&self, raw: RawEvent) -> RelayDecision {
        let packet = match classify(&raw) {
            Ok(p) => p,
            Err(e) => {
                self.metrics.inc_malformed();
                debug!("Dropping malformed radio event: {}", e);
                let reason = RelayReason::Malformed {
                    error: e.to_string(),
                };
                return RelayDecision::rejected(reason, None);
            }
        };
        trace!("Ingesting {} from {}", packet.kind, packet.from);

        let persisted = retry_once(&self.metrics, "packet", || {
            let store = self.store.clone();
            let packet = packet.clone();
            blocking(move || persist_packet(&store, &packet))
        })
        .await;

        let mut notices = Vec::new();
        let display_name = match persisted {
            Ok(p) => {
                self.metrics.inc_persisted();
                if p.created {
                    self.metrics.inc_new_nodes();
                    info!("New node heard: {} ({})", escape_log(&p.display_name), packet.from);
                    notices.push(Notice::NewNode {
                        node_id: packet.from.clone(),
                        display_name: p.display_name.clone(),
                    });
                }
                p.display_name
            }
            Err(e) => {
                self.metrics.inc_persist_failures();
                error!("Failed to persist {} from {}: {}", packet.kind, packet.from, e);
                packet.from.clone()
            }
        };

        if let Some(position) = position_for(&packet) {
            let moved = retry_once(&self.metrics, "position", || {
                self.detector.check_and_record(position.clone())
            })
            .await;
            match moved {
                Ok(Some(event)) => {
                    self.metrics.inc_movement_events();
                    self.push_live(LiveEntry {
                        kind: LiveKind::Movement,
                        from: packet.from.clone(),
                        at: packet.timestamp,
                        summary: format!(
                            "moved {:.0} m, bearing {:.0}°",
                            event.distance_m, event.bearing_deg
                        ),
                        hops_away: packet.hops_away,
                        snr: packet.snr,
                        rssi: packet.rssi,
                    });
                    notices.push(Notice::Movement {
                        display_name: display_name.clone(),
                        event,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.inc_persist_failures();
                    error!("Failed to record position from {}: {}", packet.from, e);
                }
            }
        }

        self.push_live(LiveEntry {
            kind: LiveKind::Packet(packet.kind),
            from: packet.from.clone(),
            at: packet.timestamp,
            summary: live_summary(&packet),
            hops_away: packet.hops_away,
            snr: packet.snr,
            rssi: packet.rssi,
        });

        let Payload::Text { text } = &packet.payload else {
            let reason = RelayReason::NotRelayable { kind: packet.kind };
            return RelayDecision {
                notices,
                ..RelayDecision::rejected(reason, Some(packet.kind))
            };
        };

        if self.own_node_id.as_deref() == Some(packet.from.as_str()) {
            return RelayDecision {
                notices,
                ..RelayDecision::rejected(RelayReason::OwnMessage, Some(packet.kind))
            };
        }

        let fingerprint = Fingerprint::of_text(&packet.from, text);
        let reason = match self.limiter.admit(fingerprint, Instant::now()) {
            Admission::Admitted => {
                self.metrics.inc_relayed();
                RelayReason::Relayed
            }
            Admission::Duplicate { age_ms } => {
                self.metrics.inc_duplicates();
                RelayReason::Duplicate { age_ms }
            }
            Admission::RateLimited => {
                self.metrics.inc_rate_limited();
                RelayReason::RateLimited
            }
        };
        if reason != RelayReason::Relayed {
            return RelayDecision {
                notices,
                ..RelayDecision::rejected(reason, Some(packet.kind))
            };
        }

        debug!("Relaying text from {}: {}", packet.from, escape_log(&preview(text, 80)));
        RelayDecision {
            admit: true,
            reason,
            kind: Some(packet.kind),
            record: Some(RelayRecord {
                kind: packet.kind,
                sender: packet.from.clone(),
                sender_name: display_name,
                to: packet.to.clone(),
                channel: packet.channel,
                timestamp: packet.timestamp,
                text: text.clone(),
                hops_away: packet.hops_away,
                snr: packet.snr,
                rssi: packet.rssi,
                ping: is_ping(text),
            }),
            notices,
        }
    }
}

/// Start `workers` tasks draining `queue` into `ingestor`, forwarding chat
/// events to `sink`. Each task ends when the queue is closed and empty.
pub fn spawn_workers(
    ingestor: Arc<Ingestor>,
    queue: IngestQueue,
    workers: usize,
    sink: mpsc::Sender<ChatEvent>,
) -> JoinSet<()> {
    let mut pool = JoinSet::new();
    for worker in 0..workers.max(1) {
        let ingestor = Arc::clone(&ingestor);
        let queue = queue.clone();
        let sink = sink.clone();
        pool.spawn(async move {
            while let Some(Dequeued { event, evicted }) = queue.recv().await {
                if evicted > 0 {
                    warn!("{} radio events were evicted unprocessed before this one", evicted);
                }
                let decision = ingestor.ingest(event).await;
                for chat_event in decision.into_chat_events() {
                    if sink.send(chat_event).await.is_err() {
                        trace!("Chat sink closed, event discarded");
                    }
                }
            }
            debug!("Ingest worker {} stopped", worker);
        });
    }
    pool
}
