//! Time-windowed sampling for API security schema extraction.
//!
//! A key is a hit the first time it is seen and then at most once per
//! period. The table is bounded: when full, keys outside the window are
//! dropped first, then the least recently reported ones.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

const MAX_ITEMS: usize = 4096;

#[derive(Debug)]
pub struct SchemaSampler {
    period: Duration,
    reported: Mutex<HashMap<u64, Instant>>,
}

impl SchemaSampler {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            reported: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `key` should be extracted now.
    pub fn hit(&self, key: u64) -> bool {
        self.hit_at(key, Instant::now())
    }

    fn hit_at(&self, key: u64, now: Instant) -> bool {
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(last) = reported.get_mut(&key) {
            if now.saturating_duration_since(*last) < self.period {
                return false;
            }
            *last = now;
            return true;
        }

        if reported.len() >= MAX_ITEMS {
            self.shrink(&mut reported, now);
        }
        reported.insert(key, now);
        true
    }

    fn shrink(&self, reported: &mut HashMap<u64, Instant>, now: Instant) {
        let before = reported.len();
        reported.retain(|_, last| now.saturating_duration_since(*last) < self.period);

        if reported.len() > MAX_ITEMS * 2 / 3 {
            let mut by_age: Vec<(Instant, u64)> =
                reported.iter().map(|(key, last)| (*last, *key)).collect();
            by_age.sort_unstable();
            let excess = reported.len() - MAX_ITEMS * 2 / 3;
            for (_, key) in by_age.into_iter().take(excess) {
                reported.remove(&key);
            }
        }
        debug!(before, after = reported.len(), "schema sampler table shrunk");
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
