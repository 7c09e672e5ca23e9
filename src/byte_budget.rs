//! Global memory admission control: a hard byte ceiling shared across all
//! flows so one connection table cannot exhaust host memory under load.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::logger::{self, BreadcrumbFlags};

const WARN_THRESHOLD: f64 = 0.85;
const WARN_INTERVAL: Duration = Duration::from_secs(5);

pub struct ByteBudget {
    limit: u64,
    used: AtomicU64,
    last_warning: Mutex<Option<Instant>>,
}

impl ByteBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: limit.max(1),
            used: AtomicU64::new(0),
            last_warning: Mutex::new(None),
        }
    }

    /// Attempts to reserve `bytes`; returns whether the reservation fit
    /// under the limit. Reservations never partially succeed.
    pub fn reserve(&self, bytes: u64) -> bool {
        loop {
            let current = self.used.load(Ordering::Acquire);
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.limit {
                return false;
            }
            if self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.maybe_warn(next);
                return true;
            }
        }
    }

    /// Releases a previous reservation. Saturates at zero so a double
    /// release can't underflow the counter into a huge value.
    pub fn release(&self, bytes: u64) {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn utilization(&self) -> f64 {
        self.used.load(Ordering::Relaxed) as f64 / self.limit as f64
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn maybe_warn(&self, used: u64) {
        let utilization = used as f64 / self.limit as f64;
        if utilization < WARN_THRESHOLD {
            return;
        }
        let now = Instant::now();
        let mut last = self.last_warning.lock();
        if last.map(|t| now.duration_since(t) < WARN_INTERVAL).unwrap_or(false) {
            return;
        }
        *last = Some(now);
        logger::breadcrumb(
            BreadcrumbFlags::METRICS,
            format!("byte budget at {:.1}% ({used}/{} bytes)", utilization * 100.0, self.limit),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_fails_once_limit_reached() {
        let budget = ByteBudget::new(100);
        assert!(budget.reserve(60));
        assert!(budget.reserve(40));
        assert!(!budget.reserve(1));
    }

    #[test]
    fn release_frees_capacity_for_later_reservations() {
        let budget = ByteBudget::new(100);
        assert!(budget.reserve(100));
        budget.release(50);
        assert!(budget.reserve(50));
        assert!(!budget.reserve(1));
    }

    #[test]
    fn release_saturates_instead_of_underflowing() {
        let budget = ByteBudget::new(100);
        budget.release(1000);
        assert_eq!(budget.used(), 0);
        assert!(budget.reserve(100));
    }

    #[test]
    fn utilization_reflects_current_usage_fraction() {
        let budget = ByteBudget::new(200);
        budget.reserve(50);
        assert!((budget.utilization() - 0.25).abs() < f64::EPSILON);
    }
}
