use parking_lot::{Condvar, Mutex};

/// Stop-the-world barrier for whole-table operations.
///
/// Per-key operations `enter()` and hold the returned pass while they touch
/// the table. `raise()` blocks new entrants and waits for the passes already
/// handed out to drain; `lower()` lets entrants through again. The common
/// path is one uncontended mutex check and a counter bump.
#[derive(Default)]
pub struct StopWorld {
    state: Mutex<BarrierState>,
    changed: Condvar,
}

#[derive(Default)]
struct BarrierState {
    raised: bool,
    active: usize,
}

pub struct Pass<'a> {
    barrier: &'a StopWorld,
}

/// Held by the operation that raised the barrier; lowers it on drop.
pub struct Raised<'a> {
    barrier: &'a StopWorld,
}

impl StopWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> Pass<'_> {
        let mut state = self.state.lock();
        while state.raised {
            self.changed.wait(&mut state);
        }
        state.active += 1;
        Pass { barrier: self }
    }

    pub fn raise(&self) -> Raised<'_> {
        let mut state = self.state.lock();
        // a second whole-table operation queues behind the first
        while state.raised {
            self.changed.wait(&mut state);
        }
        state.raised = true;
        while state.active > 0 {
            self.changed.wait(&mut state);
        }
        Raised { barrier: self }
    }

    pub fn is_raised(&self) -> bool {
        self.state.lock().raised
    }
}

impl Drop for Pass<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock();
        state.active -= 1;
        if state.active == 0 && state.raised {
            self.barrier.changed.notify_all();
        }
    }
}

impl Drop for Raised<'_> {
    fn drop(&mut self) {
        self.barrier.state.lock().raised = false;
        self.barrier.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_raise_waits_for_active_passes() {
        let barrier = Arc::new(StopWorld::new());
        let finished = Arc::new(AtomicBool::new(false));

        let pass = barrier.enter();
        let handle = {
            let barrier = barrier.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                let _raised = barrier.raise();
                finished.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!finished.load(Ordering::SeqCst));
        drop(pass);
        handle.join().unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert!(!barrier.is_raised());
    }

    #[test]
    fn test_enter_blocks_while_raised() {
        let barrier = Arc::new(StopWorld::new());
        let raised = barrier.raise();
        let entered = Arc::new(AtomicBool::new(false));
        let handle = {
            let barrier = barrier.clone();
            let entered = entered.clone();
            std::thread::spawn(move || {
                let _pass = barrier.enter();
                entered.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(raised);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
