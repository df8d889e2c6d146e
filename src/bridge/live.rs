//! Live traffic monitor.
//!
//! [`LiveBuffer`] keeps the most recent normalized packets in a FIFO of fixed
//! capacity; when full, the oldest record is evicted and an overflow counter
//! goes up. [`LiveSession`] is a time-boxed observer over that buffer that
//! streams new records to its owner and can be stopped early.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::meshtastic::PacketKind;
use crate::storage::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveKind {
    Packet(PacketKind),
    Movement,
}

impl std::fmt::Display for LiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveKind::Packet(k) => write!(f, "{}", k),
            LiveKind::Movement => write!(f, "movement"),
        }
    }
}

/// What the ingestor hands to the buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveEntry {
    pub kind: LiveKind,
    pub from: String,
    pub at: DateTime<Utc>,
    pub summary: String,
    pub hops_away: Option<u32>,
    pub snr: Option<f64>,
    pub rssi: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveRecord {
    pub seq: u64,
    #[serde(flatten)]
    pub entry: LiveEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveSnapshot {
    pub records: Vec<LiveRecord>,
    /// Records evicted before this reader saw them
    pub overflow: u64,
}

struct Ring {
    records: VecDeque<LiveRecord>,
    next_seq: u64,
    overflow: u64,
    total_overflow: u64,
}

pub struct LiveBuffer {
    cap: usize,
    ring: Mutex<Ring>,
}

impl LiveBuffer {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            cap,
            ring: Mutex::new(Ring {
                records: VecDeque::with_capacity(cap.min(4096)),
                next_seq: 1,
                overflow: 0,
                total_overflow: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Append, evicting the oldest record when full. Returns `true` if a
    /// record was evicted.
    pub fn push(&self, entry: LiveEntry) -> bool {
        let mut ring = lock(&self.ring);
        let seq = ring.next_seq;
        ring.next_seq += 1;
        ring.records.push_back(LiveRecord { seq, entry });
        if ring.records.len() > self.cap {
            ring.records.pop_front();
            ring.overflow += 1;
            ring.total_overflow += 1;
            true
        } else {
            false
        }
    }

    /// Take everything buffered plus the overflow count since the last drain.
    pub fn drain(&self) -> LiveSnapshot {
        let mut ring = lock(&self.ring);
        let overflow = std::mem::take(&mut ring.overflow);
        LiveSnapshot {
            records: ring.records.drain(..).collect(),
            overflow,
        }
    }

    /// Non-destructive read of records newer than `after_seq`. `overflow` is
    /// how many such records were already evicted.
    pub fn since(&self, after_seq: u64) -> LiveSnapshot {
        let ring = lock(&self.ring);
        let first_kept = ring.records.front().map(|r| r.seq).unwrap_or(ring.next_seq);
        let overflow = first_kept.saturating_sub(after_seq + 1);
        LiveSnapshot {
            records: ring
                .records
                .iter()
                .filter(|r| r.seq > after_seq)
                .cloned()
                .collect(),
            overflow,
        }
    }

    /// Sequence number of the newest record (0 when nothing was ever pushed).
    pub fn last_seq(&self) -> u64 {
        lock(&self.ring).next_seq - 1
    }

    pub fn len(&self) -> usize {
        lock(&self.ring).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_overflow(&self) -> u64 {
        lock(&self.ring).total_overflow
    }

    pub fn clear(&self) {
        let mut ring = lock(&self.ring);
        ring.records.clear();
        ring.overflow = 0;
    }
}

/// Batch delivered to a session owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveUpdate {
    pub records: Vec<LiveRecord>,
    pub missed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveReport {
    pub records_seen: u64,
    pub missed: u64,
    pub stopped_early: bool,
    pub elapsed_ms: u64,
}

pub struct LiveSession {
    stop_tx: Option<oneshot::Sender<()>>,
    updates: mpsc::Receiver<LiveUpdate>,
    handle: JoinHandle<LiveReport>,
}

const UPDATE_QUEUE: usize = 32;

impl LiveSession {
    /// Observe `buffer` for `duration`, polling every `poll`. Only records
    /// pushed after the session starts are reported.
    pub fn start(buffer: Arc<LiveBuffer>, duration: Duration, poll: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (tx, updates) = mpsc::channel(UPDATE_QUEUE);
        let mut cursor = buffer.last_seq();

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let deadline = started + duration;
            let mut report = LiveReport::default();
            let mut ticker = time::interval(poll.max(Duration::from_millis(10)));
            info!("Live monitor started for {:?}", duration);

            let collect = |cursor: &mut u64, report: &mut LiveReport| {
                let snap = buffer.since(*cursor);
                if let Some(last) = snap.records.last() {
                    *cursor = last.seq;
                } else if snap.overflow > 0 {
                    *cursor += snap.overflow;
                }
                report.records_seen += snap.records.len() as u64;
                report.missed += snap.overflow;
                if snap.records.is_empty() && snap.overflow == 0 {
                    return;
                }
                let update = LiveUpdate {
                    missed: snap.overflow,
                    records: snap.records,
                };
                if let Err(mpsc::error::TrySendError::Full(u)) = tx.try_send(update) {
                    // observer is behind; count it as missed rather than wait
                    report.missed += u.records.len() as u64;
                    report.records_seen -= u.records.len() as u64;
                }
            };

            loop {
                tokio::select! {
                    _ = time::sleep_until(deadline) => break,
                    _ = &mut stop_rx => {
                        report.stopped_early = true;
                        break;
                    }
                    _ = ticker.tick() => collect(&mut cursor, &mut report),
                }
            }
            collect(&mut cursor, &mut report);
            report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            debug!(
                "Live monitor finished: {} records, {} missed{}",
                report.records_seen,
                report.missed,
                if report.stopped_early { " (stopped early)" } else { "" }
            );
            report
        });

        Self {
            stop_tx: Some(stop_tx),
            updates,
            handle,
        }
    }

    /// Next batch, or `None` once the session has ended and everything was
    /// delivered.
    pub async fn next_update(&mut self) -> Option<LiveUpdate> {
        self.updates.recv().await
    }

    /// Ask the session to end before its deadline.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the session to end and return its report.
    pub async fn finish(self) -> LiveReport {
        drop(self.updates);
        self.handle.await.unwrap_or_default()
    }
}
