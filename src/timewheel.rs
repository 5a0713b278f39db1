use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_SLOTS: usize = 3600;

/// Callback run once when its task comes due. Runs on the ticker task, so it
/// must not block; anything slow should be spawned.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    key: String,
    /// Full revolutions still to wait once the cursor reaches the slot.
    circle: usize,
    job: Job,
}

struct Wheel {
    slots: Vec<Vec<Task>>,
    /// task key -> slot index
    positions: HashMap<String, usize>,
    cursor: usize,
}

impl Wheel {
    fn remove(&mut self, key: &str) -> bool {
        let Some(pos) = self.positions.remove(key) else {
            return false;
        };
        let slot = &mut self.slots[pos];
        if let Some(i) = slot.iter().position(|t| t.key == key) {
            slot.swap_remove(i);
        }
        true
    }

    /// Advance one slot and pull out everything due there.
    fn advance(&mut self) -> Vec<Task> {
        self.cursor = (self.cursor + 1) % self.slots.len();
        let slot = std::mem::take(&mut self.slots[self.cursor]);
        let mut due = Vec::new();
        for mut task in slot {
            if task.circle > 0 {
                task.circle -= 1;
                self.slots[self.cursor].push(task);
            } else {
                self.positions.remove(&task.key);
                due.push(task);
            }
        }
        due
    }
}

/// Hashed timing wheel for delayed one-shot tasks keyed by name.
///
/// A task fires on the first tick at least `delay` after it was registered,
/// and at most one tick later than that.
pub struct TimeWheel {
    interval: Duration,
    wheel: Mutex<Wheel>,
}

impl TimeWheel {
    pub fn new(interval: Duration, slots: usize) -> Self {
        let slots = slots.max(1);
        TimeWheel {
            interval,
            wheel: Mutex::new(Wheel {
                slots: (0..slots).map(|_| Vec::new()).collect(),
                positions: HashMap::new(),
                cursor: 0,
            }),
        }
    }

    /// Create a wheel and spawn its ticker. The ticker exits once the last
    /// strong reference to the wheel is gone.
    pub fn start(interval: Duration, slots: usize) -> Arc<Self> {
        let wheel = Arc::new(Self::new(interval, slots));
        wheel.spawn_ticker(Arc::downgrade(&wheel));
        wheel
    }

    fn spawn_ticker(&self, weak: Weak<TimeWheel>) -> JoinHandle<()> {
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                ticker.tick().await;
                let Some(wheel) = weak.upgrade() else {
                    debug!("Time wheel dropped, ticker exiting");
                    break;
                };
                wheel.tick();
            }
        })
    }

    /// Run `job` after `delay`. Replaces any pending task with the same key.
    pub fn delay(&self, delay: Duration, key: impl Into<String>, job: Job) {
        let key = key.into();
        let ticks = (delay.as_nanos().div_ceil(self.interval.as_nanos().max(1)) as usize).saturating_add(1);
        let mut wheel = self.wheel.lock();
        wheel.remove(&key);
        let n = wheel.slots.len();
        let pos = (wheel.cursor + ticks % n) % n;
        let circle = (ticks - 1) / n;
        wheel.positions.insert(key.clone(), pos);
        wheel.slots[pos].push(Task { key, circle, job });
    }

    /// Run `job` at a wall-clock instant; instants in the past fire on the
    /// next tick.
    pub fn at(&self, when: SystemTime, key: impl Into<String>, job: Job) {
        let delay = when
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
        self.delay(delay, key, job);
    }

    /// Returns true if a pending task was removed.
    pub fn cancel(&self, key: &str) -> bool {
        self.wheel.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.wheel.lock().positions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.wheel.lock().positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance one tick and run the due jobs outside the wheel lock.
    pub fn tick(&self) {
        let due = self.wheel.lock().advance();
        for task in due {
            if catch_unwind(AssertUnwindSafe(task.job)).is_err() {
                error!(task = %task.key, "Delayed task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_manual_ticks_respect_delay() {
        let wheel = TimeWheel::new(Duration::from_millis(10), 8);
        let fired = Arc::new(AtomicUsize::new(0));
        wheel.delay(Duration::from_millis(30), "a", counter_job(&fired));
        for _ in 0..3 {
            wheel.tick();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wheel.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_delay_longer_than_one_revolution() {
        let wheel = TimeWheel::new(Duration::from_millis(10), 4);
        let fired = Arc::new(AtomicUsize::new(0));
        // 10 ticks on a 4-slot wheel
        wheel.delay(Duration::from_millis(90), "long", counter_job(&fired));
        for _ in 0..9 {
            wheel.tick();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        wheel.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_key_replaces() {
        let wheel = TimeWheel::new(Duration::from_millis(10), 16);
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        wheel.delay(Duration::from_millis(10), "k", counter_job(&first));
        wheel.delay(Duration::from_millis(50), "k", counter_job(&second));
        assert_eq!(wheel.len(), 1);
        for _ in 0..10 {
            wheel.tick();
        }
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_and_panicking_job() {
        let wheel = TimeWheel::new(Duration::from_millis(10), 16);
        let fired = Arc::new(AtomicUsize::new(0));
        wheel.delay(Duration::from_millis(10), "cancelled", counter_job(&fired));
        wheel.delay(Duration::from_millis(10), "boom", Box::new(|| panic!("boom")));
        wheel.delay(Duration::from_millis(10), "ok", counter_job(&fired));
        assert!(wheel.cancel("cancelled"));
        assert!(!wheel.cancel("cancelled"));
        for _ in 0..3 {
            wheel.tick();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_fires_in_window() {
        let wheel = TimeWheel::start(Duration::from_millis(100), 64);
        let fired = Arc::new(AtomicUsize::new(0));
        wheel.delay(Duration::from_secs(1), "t", counter_job(&fired));

        tokio::time::sleep(Duration::from_millis(950)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
