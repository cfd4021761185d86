use crossbeam_deque::{Steal, Stealer, Worker};
use crossbeam_queue::SegQueue;
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;

use crate::task_entry::TaskEntry;

/// A marking worker's local deque. The owner pushes and pops the hot end
/// without synchronization, other workers steal from the cold end.
///
/// The Chase-Lev deque underneath grows on demand, so the capacity here
/// is a soft bound: `push_local` reports "full" and the caller relieves
/// pressure by moving a batch to the global overflow stack.
pub struct MarkDeque {
    worker: Worker<TaskEntry>,
    capacity: usize,
}

impl MarkDeque {
    pub fn new(capacity: usize) -> Self {
        Self {
            worker: Worker::new_lifo(),
            capacity,
        }
    }

    pub fn stealer(&self) -> Stealer<TaskEntry> {
        self.worker.stealer()
    }

    #[inline]
    pub fn push_local(&self, entry: TaskEntry) -> bool {
        if self.worker.len() >= self.capacity {
            return false;
        }
        self.worker.push(entry);
        true
    }

    #[inline]
    pub fn pop_local(&self) -> Option<TaskEntry> {
        self.worker.pop()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.worker.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    #[inline]
    pub fn max_elems(&self) -> usize {
        self.capacity
    }
}

/// The stealer half of every worker deque, owned by the global mark state.
pub struct MarkDequeSet {
    stealers: Vec<Stealer<TaskEntry>>,
}

impl MarkDequeSet {
    /// Create `n` deques and the shared stealer set.
    pub fn new(n: usize, capacity: usize) -> (Self, Vec<MarkDeque>) {
        let mut queues = Vec::with_capacity(n);
        let mut stealers = Vec::with_capacity(n);
        for _ in 0..n {
            let q = MarkDeque::new(capacity);
            stealers.push(q.stealer());
            queues.push(q);
        }
        (Self { stealers }, queues)
    }

    /// Steal one entry for `worker_id` from a random victim, retrying a
    /// bounded number of times before reporting starvation.
    pub fn steal(&self, worker_id: usize) -> Option<TaskEntry> {
        if self.stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut victim = worker_id;
            while victim == worker_id {
                victim = range.sample(&mut rng);
            }

            loop {
                match self.stealers[victim].steal() {
                    Steal::Empty => break,
                    Steal::Success(entry) => return Some(entry),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Discard every queued entry. Only called during the overflow
    /// rendezvous, when all owners are parked at the barrier.
    pub fn set_empty(&self) {
        for stealer in &self.stealers {
            loop {
                match stealer.steal() {
                    Steal::Empty => break,
                    Steal::Success(_) => continue,
                    Steal::Retry => continue,
                }
            }
        }
    }

    pub fn queue_size(&self, worker_id: usize) -> usize {
        self.stealers[worker_id].len()
    }

    pub fn all_empty(&self) -> bool {
        self.stealers.iter().all(|s| s.is_empty())
    }
}

/// Per-region queue of cross-region reference roots, filled by the
/// collaborating barrier/GC machinery and drained by the worker that
/// claims the region.
pub struct TargetObjQueue {
    entries: SegQueue<TaskEntry>,
}

impl TargetObjQueue {
    pub fn new() -> Self {
        Self {
            entries: SegQueue::new(),
        }
    }

    #[inline]
    pub fn push(&self, entry: TaskEntry) {
        self.entries.push(entry);
    }

    #[inline]
    pub fn pop(&self) -> Option<TaskEntry> {
        self.entries.pop()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for TargetObjQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectHeader;

    fn obj(addr: usize) -> TaskEntry {
        TaskEntry::from_obj(addr as *mut ObjectHeader)
    }

    #[test]
    fn push_reports_full_at_capacity() {
        let q = MarkDeque::new(4);
        for i in 1..=4 {
            assert!(q.push_local(obj(i * 8)));
        }
        assert!(!q.push_local(obj(0x100)));
        assert_eq!(q.size(), 4);
        // LIFO on the owner's end.
        assert_eq!(q.pop_local(), Some(obj(32)));
        assert!(q.push_local(obj(0x100)));
    }

    #[test]
    fn steal_moves_work_between_queues() {
        let (set, queues) = MarkDequeSet::new(2, 64);
        for i in 1..=16 {
            queues[0].push_local(obj(i * 8));
        }
        let mut stolen = 0;
        while set.steal(1).is_some() {
            stolen += 1;
        }
        assert_eq!(stolen, 16);
        assert!(queues[0].is_empty());
    }

    #[test]
    fn set_empty_discards_everything() {
        let (set, queues) = MarkDequeSet::new(3, 64);
        for q in &queues {
            for i in 1..=5 {
                q.push_local(obj(i * 8));
            }
        }
        assert!(!set.all_empty());
        set.set_empty();
        assert!(set.all_empty());
        assert!(queues.iter().all(|q| q.is_empty()));
    }
}
