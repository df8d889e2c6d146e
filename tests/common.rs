//! Test utilities & fixtures.
//! Builds temp stores and radio events in the shape the mesh subscription emits.

use chrono::{DateTime, TimeZone, Utc};
use meshbridge::meshtastic::RawEvent;
use meshbridge::storage::{Store, StoreOptions};
use serde_json::{json, Value};

/// A fresh store in its own temp dir. Keep the dir alive for the store's lifetime.
pub fn temp_store() -> (tempfile::TempDir, Store) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store =
        Store::open(tmp.path().join("mesh.db"), StoreOptions::default()).expect("open store");
    (tmp, store)
}

#[allow(dead_code)]
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
}

#[allow(dead_code)]
pub fn text(from: &str, body: &str) -> RawEvent {
    RawEvent::new(json!({
        "fromId": from, "toId": "^all", "hopsAway": 1, "rxSnr": 6.0, "rxRssi": -90,
        "decoded": {"portnum": "TEXT_MESSAGE_APP", "text": body}
    }))
}

#[allow(dead_code)]
pub fn position(from: &str, lat: f64, lon: f64, rx_time: i64) -> RawEvent {
    RawEvent::new(json!({
        "fromId": from, "rxTime": rx_time,
        "decoded": {"portnum": "POSITION_APP", "position": {"latitude": lat, "longitude": lon}}
    }))
}

#[allow(dead_code)]
pub fn telemetry(from: &str, battery: f64, rx_time: i64) -> RawEvent {
    RawEvent::new(json!({
        "fromId": from, "rxTime": rx_time,
        "decoded": {"portnum": "TELEMETRY_APP", "telemetry": {
            "deviceMetrics": {"batteryLevel": battery, "voltage": 3.9}
        }}
    }))
}

#[allow(dead_code)]
pub fn node_info(from: &str, long_name: &str, rx_time: i64) -> RawEvent {
    RawEvent::new(json!({
        "fromId": from, "rxTime": rx_time,
        "decoded": {"portnum": "NODEINFO_APP", "user": {"longName": long_name, "shortName": "N1"}}
    }))
}

#[allow(dead_code)]
pub fn raw(v: Value) -> RawEvent {
    RawEvent::new(v)
}
