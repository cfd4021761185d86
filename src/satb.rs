use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::object::ObjectHeader;

/// Closure the marking core hands to the SATB machinery; `do_buffer`
/// receives a flat array of object pointers captured by the write
/// barrier.
pub trait SatbBufferClosure {
    fn do_buffer(&mut self, buffer: &[*mut ObjectHeader]);
}

struct CompletedBuffer(Vec<*mut ObjectHeader>);

unsafe impl Send for CompletedBuffer {}

/// Queue of completed snapshot-at-the-beginning buffers. The host's write
/// barrier fills and enqueues buffers; the marking workers drain them
/// during remark (and opportunistically while marking) through
/// [`SatbBufferClosure`].
pub struct SatbQueueSet {
    completed: Mutex<VecDeque<CompletedBuffer>>,
    completed_count: AtomicUsize,
    active: AtomicBool,
}

impl SatbQueueSet {
    pub fn new() -> Self {
        Self {
            completed: Mutex::new(VecDeque::new()),
            completed_count: AtomicUsize::new(0),
            active: AtomicBool::new(false),
        }
    }

    /// Toggle barrier activity at a cycle boundary. The expected state
    /// check catches cycles that overlap.
    pub fn set_active_all_threads(&self, new_active: bool, expected_active: bool) {
        let prev = self.active.swap(new_active, Ordering::AcqRel);
        assert!(
            prev == expected_active,
            "SATB active state was {}, expected {}",
            prev,
            expected_active
        );
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn enqueue_completed_buffer(&self, buffer: Vec<*mut ObjectHeader>) {
        if buffer.is_empty() {
            return;
        }
        let mut completed = self.completed.lock();
        completed.push_back(CompletedBuffer(buffer));
        self.completed_count.store(completed.len(), Ordering::Release);
    }

    /// Claim one completed buffer and run the closure over it. Returns
    /// false when none remain.
    pub fn apply_closure_to_completed_buffer(&self, cl: &mut dyn SatbBufferClosure) -> bool {
        let buffer = {
            let mut completed = self.completed.lock();
            let buffer = completed.pop_front();
            self.completed_count.store(completed.len(), Ordering::Release);
            buffer
        };
        match buffer {
            Some(buffer) => {
                cl.do_buffer(&buffer.0);
                true
            }
            None => false,
        }
    }

    pub fn completed_buffers_num(&self) -> usize {
        self.completed_count.load(Ordering::Acquire)
    }

    /// Racy availability check used by the marking clock.
    pub fn process_completed_buffers(&self) -> bool {
        self.completed_buffers_num() > 0
    }

    /// Drop all captured buffers, used when a cycle is abandoned.
    pub fn abandon_partial_marking(&self) {
        let mut completed = self.completed.lock();
        completed.clear();
        self.completed_count.store(0, Ordering::Release);
    }
}

impl Default for SatbQueueSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<usize>);

    impl SatbBufferClosure for Collect {
        fn do_buffer(&mut self, buffer: &[*mut ObjectHeader]) {
            self.0.extend(buffer.iter().map(|p| *p as usize));
        }
    }

    #[test]
    fn buffers_drain_in_order() {
        let set = SatbQueueSet::new();
        set.set_active_all_threads(true, false);
        set.enqueue_completed_buffer(vec![0x10 as _, 0x20 as _]);
        set.enqueue_completed_buffer(vec![0x30 as _]);
        assert_eq!(set.completed_buffers_num(), 2);

        let mut cl = Collect(vec![]);
        assert!(set.apply_closure_to_completed_buffer(&mut cl));
        assert!(set.apply_closure_to_completed_buffer(&mut cl));
        assert!(!set.apply_closure_to_completed_buffer(&mut cl));
        assert_eq!(cl.0, vec![0x10, 0x20, 0x30]);
        assert_eq!(set.completed_buffers_num(), 0);

        set.set_active_all_threads(false, true);
    }

    #[test]
    #[should_panic]
    fn activity_transition_is_checked() {
        let set = SatbQueueSet::new();
        set.set_active_all_threads(true, true);
    }

    #[test]
    fn empty_buffers_are_dropped() {
        let set = SatbQueueSet::new();
        set.enqueue_completed_buffer(vec![]);
        assert_eq!(set.completed_buffers_num(), 0);
    }
}
