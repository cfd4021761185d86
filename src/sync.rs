use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Cooperative safepoint set for the marking workers. A worker joins the
/// set while it does marking work and leaves it before blocking on any
/// barrier or condition, otherwise a safepoint request would deadlock
/// against the blocked worker.
pub struct SuspendibleThreadSet {
    joined: AtomicUsize,
    state: Mutex<StsState>,
    changed: Condvar,
}

#[derive(Default)]
struct StsState {
    yield_requested: bool,
    parked: usize,
}

impl SuspendibleThreadSet {
    pub fn new() -> Self {
        Self {
            joined: AtomicUsize::new(0),
            state: Mutex::new(StsState::default()),
            changed: Condvar::new(),
        }
    }

    pub fn join(&self) {
        self.joined.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leave(&self) {
        let prev = self.joined.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        self.changed.notify_all();
    }

    /// Polled from the marking clock. True once a suspension has been
    /// requested; the worker reacts by aborting its step and yielding.
    pub fn should_yield(&self) -> bool {
        self.state.lock().yield_requested
    }

    /// Park until the requester resumes the set.
    pub fn yield_now(&self) {
        let mut state = self.state.lock();
        if !state.yield_requested {
            return;
        }
        state.parked += 1;
        self.changed.notify_all();
        while state.yield_requested {
            self.changed.wait(&mut state);
        }
        state.parked -= 1;
    }

    /// Request the joined workers to park at their next yield check.
    pub fn request_yield(&self) {
        self.state.lock().yield_requested = true;
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.yield_requested = false;
        self.changed.notify_all();
    }

    pub fn joined_count(&self) -> usize {
        self.joined.load(Ordering::Acquire)
    }
}

impl Default for SuspendibleThreadSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Cyclic rendezvous for N workers with abort support. `enter` blocks
/// until all expected workers have entered and then releases the whole
/// generation at once; `abort` releases current and future waiters with a
/// failure indication, needed because a safepoint request can race the
/// barrier.
pub struct BarrierSync {
    state: Mutex<BarrierState>,
    released: Condvar,
}

struct BarrierState {
    n_workers: usize,
    n_entered: usize,
    generation: usize,
    aborted: bool,
}

impl BarrierSync {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                n_workers: 0,
                n_entered: 0,
                generation: 0,
                aborted: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Also clears a previous abort; called once per phase setup.
    pub fn set_n_workers(&self, n: usize) {
        let mut state = self.state.lock();
        debug_assert!(state.n_entered == 0, "barrier reconfigured while occupied");
        state.n_workers = n;
        state.aborted = false;
    }

    /// Returns false when the barrier was aborted instead of released.
    pub fn enter(&self) -> bool {
        let mut state = self.state.lock();
        if state.aborted {
            return false;
        }
        state.n_entered += 1;
        if state.n_entered == state.n_workers {
            state.n_entered = 0;
            state.generation += 1;
            self.released.notify_all();
            return true;
        }
        let my_generation = state.generation;
        while state.generation == my_generation && !state.aborted {
            self.released.wait(&mut state);
        }
        !state.aborted
    }

    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.n_entered = 0;
        self.released.notify_all();
    }
}

impl Default for BarrierSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Offer-termination protocol across the marking workers. A worker with
/// no work decrements the live count and waits; it retracts the offer
/// when `should_exit` reports that work reappeared (a non-empty global
/// stack) or the phase is being torn down.
pub struct Terminator {
    n_workers: AtomicUsize,
    idle: AtomicUsize,
}

impl Terminator {
    pub fn new(n_workers: usize) -> Self {
        Self {
            n_workers: AtomicUsize::new(n_workers),
            idle: AtomicUsize::new(0),
        }
    }

    pub fn reset_for_reuse(&self, n_workers: usize) {
        self.n_workers.store(n_workers, Ordering::Relaxed);
        self.idle.store(0, Ordering::Relaxed);
    }

    /// Returns true when all workers offered termination together, false
    /// when the caller must go back and look for work.
    pub fn offer_termination(&self, mut should_exit: impl FnMut() -> bool) -> bool {
        let n = self.n_workers.load(Ordering::Relaxed);
        if n == 1 {
            return !should_exit();
        }

        let idle = self.idle.fetch_add(1, Ordering::AcqRel) + 1;
        if idle == n {
            return true;
        }

        loop {
            if self.idle.load(Ordering::Acquire) >= n {
                return true;
            }
            if should_exit() {
                // Retract the offer unless everyone got idle in the
                // meantime, in which case termination already won.
                let mut idle = self.idle.load(Ordering::Acquire);
                loop {
                    if idle >= n {
                        return true;
                    }
                    match self.idle.compare_exchange(
                        idle,
                        idle - 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return false,
                        Err(actual) => idle = actual,
                    }
                }
            }
            thread::sleep(Duration::from_micros(1));
        }
    }
}
