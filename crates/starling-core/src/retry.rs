//! Backoff computation and the node-level timer group.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;

/// Ceiling on any computed retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Jitter factor applied to computed delays.
pub const RETRY_JITTER: f64 = 0.1;

/// Exponential backoff with jitter, optionally overridden by a fixed
/// delay schedule.
#[derive(Clone, Debug)]
pub struct Backoff {
    base_delay: Duration,
    /// Absolute per-attempt delays; when set, the curve is ignored and
    /// attempts beyond the schedule reuse its last entry.
    schedule: Option<Vec<Duration>>,
}

impl Backoff {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            schedule: None,
        }
    }

    pub fn with_schedule(schedule: Vec<Duration>) -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            schedule: Some(schedule),
        }
    }

    /// Delay before retry `attempt` (0-based):
    /// `min(base · 2^attempt · (1 + U(−jitter, +jitter)), 30 s)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        if let Some(schedule) = &self.schedule {
            return match schedule.get(attempt as usize).or(schedule.last()) {
                Some(d) => (*d).min(MAX_RETRY_DELAY),
                None => Duration::ZERO,
            };
        }

        let base = self.base_delay.as_millis() as f64;
        let exp = base * 2f64.powi(attempt.min(16) as i32);
        let jitter: f64 = rand::thread_rng().gen_range(-RETRY_JITTER..=RETRY_JITTER);
        let jittered = exp * (1.0 + jitter);
        let capped = jittered.min(MAX_RETRY_DELAY.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

struct TimerGroupInner {
    timers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
}

/// A group of one-shot timers released together on node shutdown.
///
/// Each scheduled timer is a spawned task; [`TimerHandle::cancel`]
/// guarantees the callback will not fire afterwards, even if the timer
/// already elapsed but has not yet claimed its slot.
#[derive(Clone)]
pub struct TimerGroup {
    inner: Arc<TimerGroupInner>,
}

impl TimerGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimerGroupInner {
                timers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Schedule `f` to run once after `delay`. Must be called within a
    /// tokio runtime.
    pub fn schedule(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        // The lock spans spawn + insert so the task's claim cannot run
        // before the slot exists.
        let mut timers = self.inner.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Claiming the slot decides the race against cancel().
            let claimed = inner.timers.lock().remove(&id).is_some();
            if claimed {
                f();
            }
        });
        timers.insert(id, handle);
        drop(timers);
        TimerHandle {
            id,
            group: Arc::downgrade(&self.inner),
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn active(&self) -> usize {
        self.inner.timers.lock().len()
    }

    /// Cancel every pending timer.
    pub fn cancel_all(&self) {
        let timers: Vec<_> = {
            let mut map = self.inner.timers.lock();
            map.drain().collect()
        };
        for (_, handle) in timers {
            handle.abort();
        }
    }
}

impl Default for TimerGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation handle for one scheduled timer.
pub struct TimerHandle {
    id: u64,
    group: Weak<TimerGroupInner>,
}

impl TimerHandle {
    /// Cancel the timer. Returns false if it already fired or was
    /// cancelled.
    pub fn cancel(&self) -> bool {
        let Some(inner) = self.group.upgrade() else {
            return false;
        };
        let removed = inner.timers.lock().remove(&self.id);
        match removed {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn backoff_respects_bounds() {
        let backoff = Backoff::new(Duration::from_millis(1000));
        for attempt in 0..12 {
            let cap = (1000u128 << attempt).min(MAX_RETRY_DELAY.as_millis());
            let lo = (cap as f64 * (1.0 - RETRY_JITTER)) as u128;
            let hi = MAX_RETRY_DELAY.as_millis().min((cap as f64 * (1.0 + RETRY_JITTER)) as u128);
            for _ in 0..50 {
                let d = backoff.delay(attempt).as_millis();
                assert!(d <= MAX_RETRY_DELAY.as_millis(), "attempt {}: {}ms", attempt, d);
                assert!(d >= lo && d <= hi, "attempt {}: {}ms not in [{}, {}]", attempt, d, lo, hi);
            }
        }
    }

    #[test]
    fn backoff_schedule_overrides_curve() {
        let backoff = Backoff::with_schedule(vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(5),
        ]);
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(5));
        // Past the schedule, the last entry repeats.
        assert_eq!(backoff.delay(7), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_once() {
        let group = TimerGroup::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        group.schedule(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(group.active(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(group.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let group = TimerGroup::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let handle = group.schedule(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_releases_every_timer() {
        let group = TimerGroup::new();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let f = Arc::clone(&fired);
            group.schedule(Duration::from_millis(50), move || {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        group.cancel_all();
        assert_eq!(group.active(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
