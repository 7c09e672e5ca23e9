//! Traffic shaping: fixed latency + jitter plus a token-bucket style byte
//! rate limit, applied per matched policy.
//!
//! The latency/jitter half is lifted from the connection table's existing
//! `compute_shaping_delay`/`fast_jitter` (xorshift32, avoids a syscall per
//! packet); the byte-rate half is new, modeled as a virtual "next release
//! instant" per reservation key rather than a literal bucket of tokens,
//! which keeps the hot path to a single hashmap lookup.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use super::ShapingConfig;

const RETENTION: Duration = Duration::from_secs(5);
const MAX_RESERVATIONS: usize = 512;

pub struct Shaper {
    reservations: Mutex<HashMap<u64, Instant>>,
    jitter_state: AtomicU32,
}

impl Default for Shaper {
    fn default() -> Self {
        Self::new()
    }
}

impl Shaper {
    pub fn new() -> Self {
        Self {
            reservations: Mutex::new(HashMap::new()),
            jitter_state: AtomicU32::new(0x9E37_79B9),
        }
    }

    /// Reserves `packet_bytes` worth of budget for `key` under `config` and
    /// returns how long the caller should hold the packet before sending.
    /// `key` identifies the shaped flow (its handle is a natural choice).
    pub fn reserve(&self, key: u64, config: &ShapingConfig, packet_bytes: usize, now: Instant) -> Duration {
        let mut rate_delay = Duration::ZERO;
        if let Some(bytes_per_second) = config.bytes_per_second.filter(|bps| *bps > 0) {
            let mut guard = self.reservations.lock();
            prune(&mut guard, now);
            let duration_for_bytes =
                Duration::from_secs_f64(packet_bytes as f64 / bytes_per_second as f64);
            let earliest_start = guard.get(&key).copied().unwrap_or(now).max(now);
            let release_at = earliest_start + duration_for_bytes;
            guard.insert(key, release_at);
            rate_delay = release_at.saturating_duration_since(now);
        }

        let mut fixed_delay = Duration::from_millis(config.latency_ms as u64);
        if config.jitter_ms > 0 {
            fixed_delay += Duration::from_millis(self.next_jitter(config.jitter_ms) as u64);
        }

        rate_delay + fixed_delay
    }

    #[inline]
    fn next_jitter(&self, max: u32) -> u32 {
        let mut x = self.jitter_state.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.jitter_state.store(x, Ordering::Relaxed);
        x % (max + 1)
    }

    pub fn forget(&self, key: u64) {
        self.reservations.lock().remove(&key);
    }
}

fn prune(guard: &mut HashMap<u64, Instant>, now: Instant) {
    guard.retain(|_, release_at| now.saturating_duration_since(*release_at) < RETENTION);
    while guard.len() > MAX_RESERVATIONS {
        let Some(oldest) = guard
            .iter()
            .min_by_key(|(_, release_at)| **release_at)
            .map(|(key, _)| *key)
        else {
            break;
        };
        guard.remove(&oldest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_latency_applies_without_rate_limit() {
        let shaper = Shaper::new();
        let config = ShapingConfig { latency_ms: 50, jitter_ms: 0, bytes_per_second: None };
        let now = Instant::now();
        let delay = shaper.reserve(1, &config, 1024, now);
        assert_eq!(delay, Duration::from_millis(50));
    }

    #[test]
    fn byte_rate_limit_serializes_back_to_back_reservations() {
        let shaper = Shaper::new();
        let config = ShapingConfig { latency_ms: 0, jitter_ms: 0, bytes_per_second: Some(1000) };
        let now = Instant::now();
        let first = shaper.reserve(7, &config, 1000, now);
        let second = shaper.reserve(7, &config, 1000, now);
        assert_eq!(first, Duration::ZERO);
        assert!(second >= Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_configured_bound() {
        let shaper = Shaper::new();
        let config = ShapingConfig { latency_ms: 0, jitter_ms: 10, bytes_per_second: None };
        let now = Instant::now();
        for _ in 0..50 {
            let delay = shaper.reserve(3, &config, 1, now);
            assert!(delay <= Duration::from_millis(10));
        }
    }

    #[test]
    fn forget_drops_the_reservation_state() {
        let shaper = Shaper::new();
        let config = ShapingConfig { latency_ms: 0, jitter_ms: 0, bytes_per_second: Some(10) };
        let now = Instant::now();
        shaper.reserve(1, &config, 100, now);
        shaper.forget(1);
        let delay = shaper.reserve(1, &config, 100, now);
        assert_eq!(delay, Duration::ZERO);
    }
}
