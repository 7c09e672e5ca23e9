//! Monotonic/wall clocks and the 64-bit flow/handle allocator.
//!
//! Kept as a dedicated leaf module (no dependents among the other leaves)
//! so every subsystem allocates identifiers and reads the clock the same
//! way instead of each reaching for `Instant::now()`/`SystemTime::now()`
//! directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic instant, re-exported so callers don't need `std::time` directly.
pub type Monotonic = Instant;

pub fn monotonic_now() -> Monotonic {
    Instant::now()
}

/// Milliseconds since the Unix epoch, saturating on clocks before 1970.
pub fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn wall_clock_seconds_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Monotonically increasing 64-bit identifier allocator. Wraparound is
/// defined as `wrapping_add(1)` but operationally unreachable.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_increments_monotonically() {
        let alloc = IdAllocator::starting_at(1);
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
        assert_eq!(alloc.next(), 3);
    }

    #[test]
    fn allocator_wraps_without_panicking() {
        let alloc = IdAllocator::starting_at(u64::MAX);
        assert_eq!(alloc.next(), u64::MAX);
        assert_eq!(alloc.next(), 0);
    }
}
