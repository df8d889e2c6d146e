//! Per-invoker command cooldown.

use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::storage::lock;

/// Minimum spacing between commands from the same invoker. Each invoker has
/// its own clock; one user's cooldown never delays another.
pub struct CommandCooldown {
    interval: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl CommandCooldown {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// `true` and records the invocation if `invoker` is outside its cooldown.
    /// A rejected attempt does not restart the cooldown.
    pub fn allow(&self, invoker: &str, now: Instant) -> bool {
        let mut last = lock(&self.last);
        if let Some(prev) = last.get(invoker) {
            let since = now.saturating_duration_since(*prev);
            if since < self.interval {
                debug!(
                    "Command from {} rejected, {:?} left in cooldown",
                    invoker,
                    self.interval - since
                );
                return false;
            }
        }
        last.insert(invoker.to_string(), now);
        true
    }

    /// Time left before `invoker` may run another command.
    pub fn remaining(&self, invoker: &str, now: Instant) -> Duration {
        lock(&self.last)
            .get(invoker)
            .map(|prev| self.interval.saturating_sub(now.saturating_duration_since(*prev)))
            .unwrap_or_default()
    }

    /// Forget invokers whose cooldown has passed. Returns how many.
    pub fn purge(&self, now: Instant) -> usize {
        let mut last = lock(&self.last);
        let before = last.len();
        let interval = self.interval;
        last.retain(|_, prev| now.saturating_duration_since(*prev) < interval);
        before - last.len()
    }

    pub fn tracked(&self) -> usize {
        lock(&self.last).len()
    }
}
