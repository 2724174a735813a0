//! The slice of a game player the connection layer needs: its time budget.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// A player whose cumulative compute time is charged by its client.
///
/// The balance is signed nanoseconds and may go negative when a timer fire
/// races a pause; the engine decides what a negative balance means.
pub trait Player: Send + Sync {
    /// Nanoseconds of compute time left for the rest of the match.
    fn time_remaining(&self) -> i64;

    /// Charge `nanos` against the balance.
    fn deduct_time(&self, nanos: i64);
}

/// Lock-free running balance, shared between a client and the engine.
#[derive(Debug, Default)]
pub struct TimeBudget {
    remaining: AtomicI64,
}

impl TimeBudget {
    /// Budget starting at `nanos`.
    #[must_use]
    pub const fn new(nanos: i64) -> Self {
        Self {
            remaining: AtomicI64::new(nanos),
        }
    }

    /// Budget starting at `duration`, saturating at `i64::MAX` nanoseconds.
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        Self::new(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }

    /// Credit time, e.g. the per-turn increment some games award.
    pub fn add_time(&self, nanos: i64) {
        self.remaining.fetch_add(nanos, Ordering::AcqRel);
    }
}

impl Player for TimeBudget {
    fn time_remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    fn deduct_time(&self, nanos: i64) {
        self.remaining.fetch_sub(nanos, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_a_running_balance() {
        let budget = TimeBudget::new(1_000);
        budget.deduct_time(300);
        budget.add_time(50);
        budget.deduct_time(900);
        assert_eq!(budget.time_remaining(), -150);
    }

    #[test]
    fn test_from_duration_saturates() {
        let budget = TimeBudget::from_duration(Duration::from_secs(u64::MAX));
        assert_eq!(budget.time_remaining(), i64::MAX);
    }
}
