//! Relay admission: windowed duplicate suppression plus a global token bucket.
//!
//! Mesh rebroadcasts and multi-path delivery routinely hand us the same text
//! several times within seconds. Each relay-worthy event is reduced to a
//! [`Fingerprint`]; one admitted within the dedup window blocks identical
//! ones, and a token bucket caps the overall relay rate. Both checks and the
//! stale-entry purge happen under one lock so concurrent bursts cannot both
//! slip through.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::storage::lock;

const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_ECMA_182);

/// Content fingerprint of a relay candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Sender id plus text, compared case-insensitively with whitespace runs
    /// collapsed.
    pub fn of_text(sender: &str, text: &str) -> Self {
        let normalized = text
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        let mut digest = CRC64.digest();
        digest.update(sender.as_bytes());
        digest.update(&[0]);
        digest.update(normalized.as_bytes());
        Fingerprint(digest.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    /// Same fingerprint admitted `age_ms` ago, inside the window
    Duplicate { age_ms: u64 },
    RateLimited,
}

impl std::fmt::Display for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Admission::Admitted => write!(f, "admitted"),
            Admission::Duplicate { age_ms } => {
                write!(f, "duplicate of message relayed {} ms ago", age_ms)
            }
            Admission::RateLimited => write!(f, "relay rate limit reached"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub admitted: u64,
    pub duplicates: u64,
    pub rate_limited: u64,
    pub tracked_fingerprints: usize,
}

struct State {
    seen: HashMap<Fingerprint, Instant>,
    tokens: f64,
    last_refill: Option<Instant>,
    stats: DedupStats,
}

pub struct DedupRateLimiter {
    window: Duration,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<State>,
}

impl DedupRateLimiter {
    /// `rate_per_minute` is both the bucket size and its refill per minute.
    pub fn new(window: Duration, rate_per_minute: u32) -> Self {
        let capacity = f64::from(rate_per_minute.max(1));
        Self {
            window,
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(State {
                seen: HashMap::new(),
                tokens: capacity,
                last_refill: None,
                stats: DedupStats::default(),
            }),
        }
    }

    pub fn admit(&self, fingerprint: Fingerprint, now: Instant) -> Admission {
        let mut guard = lock(&self.state);
        let st = &mut *guard;

        let window = self.window;
        st.seen.retain(|_, seen| now.saturating_duration_since(*seen) < window);

        if let Some(&seen) = st.seen.get(&fingerprint) {
            let age = now.saturating_duration_since(seen);
            let age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX);
            st.stats.duplicates += 1;
            debug!(
                "Relay duplicate suppressed (fingerprint {:016x}, {} ms old)",
                fingerprint.0, age_ms
            );
            return Admission::Duplicate { age_ms };
        }

        if let Some(last) = st.last_refill {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            st.tokens = (st.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        }
        st.last_refill = Some(match st.last_refill {
            Some(last) if last > now => last,
            _ => now,
        });

        if st.tokens < 1.0 {
            st.stats.rate_limited += 1;
            warn!(
                "Relay rate limit reached ({:.0}/min), dropping event ({} dropped so far)",
                self.capacity, st.stats.rate_limited
            );
            return Admission::RateLimited;
        }

        st.tokens -= 1.0;
        st.seen.insert(fingerprint, now);
        st.stats.admitted += 1;
        Admission::Admitted
    }

    pub fn stats(&self) -> DedupStats {
        let st = lock(&self.state);
        DedupStats {
            tracked_fingerprints: st.seen.len(),
            ..st.stats
        }
    }

    /// Forget all fingerprints and refill the bucket.
    pub fn reset(&self) {
        let mut st = lock(&self.state);
        st.seen.clear();
        st.tokens = self.capacity;
        st.last_refill = None;
    }
}
