//! Compute-budget ledger: one-shot timers owned by RAII guards.
//!
//! A client is *ticking* while a [`TickRecord`] exists. The record holds both
//! the start instant and the timer task, so the two are present together or
//! not at all, and dropping the record on any path cancels the timer.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Converts a signed nanosecond balance into a timer delay, rounding up to
/// whole milliseconds. An exhausted balance fires on the next tick.
#[must_use]
pub fn budget_to_delay(remaining_nanos: i64) -> Duration {
    let Ok(nanos) = u64::try_from(remaining_nanos) else {
        return Duration::ZERO;
    };
    Duration::from_millis(nanos.div_ceil(1_000_000))
}

/// Converts an elapsed duration into the ledger's signed nanoseconds.
#[must_use]
pub fn elapsed_nanos(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)
}

/// Aborts the timer task when dropped, unless disarmed first.
#[derive(Debug)]
struct TimerGuard {
    handle: Option<JoinHandle<()>>,
}

impl TimerGuard {
    /// Releases the task without aborting it. Used by the task itself when it
    /// fires, since aborting the running task would cancel its own teardown.
    fn disarm(mut self) {
        self.handle.take();
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Debug)]
struct TickRecord {
    started: Instant,
    generation: u64,
    timer: TimerGuard,
}

/// Ticking state for one client.
#[derive(Debug, Default)]
pub(crate) struct Ticker {
    record: Option<TickRecord>,
    generation: u64,
}

impl Ticker {
    pub(crate) const fn is_ticking(&self) -> bool {
        self.record.is_some()
    }

    /// Starts the clock and schedules `on_expire` after `delay`.
    ///
    /// Returns false, leaving the running timer untouched, if already ticking.
    /// `on_expire` receives the generation it must present to [`Self::expire`].
    pub(crate) fn start<F, Fut>(&mut self, delay: Duration, on_expire: F) -> bool
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.record.is_some() {
            return false;
        }

        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let expired = on_expire(generation);
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(started + delay).await;
            expired.await;
        });

        self.record = Some(TickRecord {
            started,
            generation,
            timer: TimerGuard {
                handle: Some(handle),
            },
        });
        true
    }

    /// Stops the clock, cancelling the timer. Returns the time spent ticking.
    pub(crate) fn stop(&mut self) -> Option<Duration> {
        let record = self.record.take()?;
        Some(record.started.elapsed())
    }

    /// Called from the timer task. Claims the record only if it is still the
    /// one that scheduled this timer, so a fire that lost a race with
    /// [`Self::stop`] (or a later restart) does nothing.
    pub(crate) fn expire(&mut self, generation: u64) -> Option<Duration> {
        if self.record.as_ref()?.generation != generation {
            return None;
        }
        let record = self.record.take()?;
        let elapsed = record.started.elapsed();
        record.timer.disarm();
        Some(elapsed)
    }
}
