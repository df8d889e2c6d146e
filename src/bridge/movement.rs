//! Significant-movement detection.
//!
//! For each position report the detector reads the node's last stored
//! position, measures the great-circle distance to the new one and stores the
//! new one. Those three steps hold a per-node lock, so two reports for the
//! same node can never both compare against the same old position, while
//! reports for different nodes run in parallel.

use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::blocking;
use crate::storage::{lock, Position, StorageError, Store};

/// Mean earth radius used for haversine distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Initial bearing from point 1 to point 2, degrees clockwise from north.
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dl = (lon2 - lon1).to_radians();
    let y = dl.sin() * p2.cos();
    let x = p1.cos() * p2.sin() - p1.sin() * p2.cos() * dl.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementEvent {
    pub node_id: String,
    pub distance_m: f64,
    pub bearing_deg: f64,
    /// Seconds between the two fixes (0 if they arrived out of order)
    pub elapsed_seconds: i64,
    pub from_lat: f64,
    pub from_lon: f64,
    pub to_lat: f64,
    pub to_lon: f64,
}

/// Compare two fixes. `None` when there is no baseline or the move is within
/// `threshold_m`.
pub fn evaluate(
    previous: Option<&Position>,
    current: &Position,
    threshold_m: f64,
) -> Option<MovementEvent> {
    let prev = previous?;
    let (lat1, lon1) = (prev.latitude, prev.longitude);
    let (lat2, lon2) = (current.latitude, current.longitude);
    let distance_m = haversine_m(lat1, lon1, lat2, lon2);
    if distance_m <= threshold_m {
        return None;
    }
    Some(MovementEvent {
        node_id: current.node_id.clone(),
        distance_m,
        bearing_deg: bearing_deg(lat1, lon1, lat2, lon2),
        elapsed_seconds: (current.timestamp - prev.timestamp).num_seconds().max(0),
        from_lat: prev.latitude,
        from_lon: prev.longitude,
        to_lat: current.latitude,
        to_lon: current.longitude,
    })
}

/// Async mutex per key, created on demand and dropped when nobody holds or
/// waits for it.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub struct KeyGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let entry = {
            let mut map = lock(&self.locks);
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        let guard = entry.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        lock(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = lock(&self.owner.locks);
        if let Some(entry) = map.get(&self.key) {
            // only the map's own reference is left
            if Arc::strong_count(entry) == 1 {
                map.remove(&self.key);
            }
        }
    }
}

pub struct MovementDetector {
    store: Store,
    threshold_m: f64,
    locks: KeyedLocks,
}

impl MovementDetector {
    pub fn new(store: Store, threshold_m: f64) -> Self {
        Self {
            store,
            threshold_m,
            locks: KeyedLocks::new(),
        }
    }

    /// Check `position` against the node's last stored fix, then store it.
    ///
    /// The first fix for a node only establishes the baseline. A (0, 0) fix
    /// means "no GPS lock" and is neither compared nor stored.
    pub async fn check_and_record(
        &self,
        position: Position,
    ) -> Result<Option<MovementEvent>, StorageError> {
        if position.is_null_island() {
            debug!("Ignoring (0,0) position from {}", position.node_id);
            return Ok(None);
        }

        let _node = self.locks.lock(&position.node_id).await;

        let store = self.store.clone();
        let node_id = position.node_id.clone();
        let previous = blocking(move || store.last_position(&node_id)).await?;

        let event = evaluate(previous.as_ref(), &position, self.threshold_m);

        let store = self.store.clone();
        blocking(move || store.record_position(&position)).await?;

        if let Some(ev) = &event {
            info!(
                "Node {} moved {:.0} m (bearing {:.0}°) over {} s",
                ev.node_id, ev.distance_m, ev.bearing_deg, ev.elapsed_seconds
            );
        }
        Ok(event)
    }
}
