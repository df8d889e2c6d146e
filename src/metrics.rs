//! Pipeline counters.
//!
//! One `Metrics` instance is created by the bridge at startup and shared by
//! reference with the ingestion path, the command path and the live buffer.
//! Counters are plain relaxed atomics; `snapshot()` gives a consistent-enough
//! view for the `status` command and periodic stats logging.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    received: AtomicU64,
    malformed: AtomicU64,
    queue_overflow: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    persist_retries: AtomicU64,
    relayed: AtomicU64,
    duplicates: AtomicU64,
    rate_limited: AtomicU64,
    movement_events: AtomicU64,
    new_nodes: AtomicU64,
    cooldown_rejections: AtomicU64,
    outbound_rejected: AtomicU64,
    live_overflow: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_received, received);
    counter!(inc_malformed, malformed);
    counter!(inc_queue_overflow, queue_overflow);
    counter!(inc_persisted, persisted);
    counter!(inc_persist_failures, persist_failures);
    counter!(inc_persist_retries, persist_retries);
    counter!(inc_relayed, relayed);
    counter!(inc_duplicates, duplicates);
    counter!(inc_rate_limited, rate_limited);
    counter!(inc_movement_events, movement_events);
    counter!(inc_new_nodes, new_nodes);
    counter!(inc_cooldown_rejections, cooldown_rejections);
    counter!(inc_outbound_rejected, outbound_rejected);
    counter!(inc_live_overflow, live_overflow);

    pub fn snapshot(&self) -> Snapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Snapshot {
            received: load(&self.received),
            malformed: load(&self.malformed),
            queue_overflow: load(&self.queue_overflow),
            persisted: load(&self.persisted),
            persist_failures: load(&self.persist_failures),
            persist_retries: load(&self.persist_retries),
            relayed: load(&self.relayed),
            duplicates: load(&self.duplicates),
            rate_limited: load(&self.rate_limited),
            movement_events: load(&self.movement_events),
            new_nodes: load(&self.new_nodes),
            cooldown_rejections: load(&self.cooldown_rejections),
            outbound_rejected: load(&self.outbound_rejected),
            live_overflow: load(&self.live_overflow),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub received: u64,
    pub malformed: u64,
    pub queue_overflow: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub persist_retries: u64,
    pub relayed: u64,
    pub duplicates: u64,
    pub rate_limited: u64,
    pub movement_events: u64,
    pub new_nodes: u64,
    pub cooldown_rejections: u64,
    pub outbound_rejected: u64,
    pub live_overflow: u64,
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "received={} malformed={} queue_overflow={} persisted={} persist_failures={} relayed={} duplicates={} rate_limited={} movement={} new_nodes={} cooldown_rejections={} live_overflow={}",
            self.received,
            self.malformed,
            self.queue_overflow,
            self.persisted,
            self.persist_failures,
            self.relayed,
            self.duplicates,
            self.rate_limited,
            self.movement_events,
            self.new_nodes,
            self.cooldown_rejections,
            self.live_overflow
        )
    }
}
