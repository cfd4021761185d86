use std::fmt;
use std::mem::size_of;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::task_entry::TaskEntry;
use crate::utils::{align_up, lcm};

pub const ENTRIES_PER_CHUNK: usize = 1023;

#[repr(C)]
struct TaskEntryChunk {
    next: *mut TaskEntryChunk,
    // Padding keeps the chunk a power of two, so the capacity granule
    // stays at exactly one chunk per page multiple.
    _pad: usize,
    data: [TaskEntry; ENTRIES_PER_CHUNK],
}

const _: () = assert!(size_of::<TaskEntryChunk>().is_power_of_two());

/// Process-wide overflow stack absorbing spill from the worker deques.
///
/// Work moves through it in whole chunks. Chunks are carved out of one
/// contiguous backing mapping by a lock-free high-water mark and recycled
/// through a free list; the full-chunk list and the free list are each a
/// mutex-protected singly-linked list spliced in O(1).
///
/// Lock order is chunk list before free list, and neither nests with any
/// other lock in the marking core.
pub struct MarkStack {
    backing: Option<MmapMut>,
    base: *mut TaskEntryChunk,
    chunk_capacity: usize,
    max_chunk_capacity: usize,
    hwm: AtomicUsize,
    chunk_list: Mutex<*mut TaskEntryChunk>,
    chunks_in_chunk_list: AtomicUsize,
    free_list: Mutex<*mut TaskEntryChunk>,
}

unsafe impl Send for MarkStack {}
unsafe impl Sync for MarkStack {}

/// The backing reservation could not be made at initialization.
#[derive(Debug)]
pub struct MarkStackInitError {
    pub chunks: usize,
    pub bytes: usize,
}

impl fmt::Display for MarkStackInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to reserve overflow mark stack with {} chunks ({} bytes)",
            self.chunks, self.bytes
        )
    }
}

impl std::error::Error for MarkStackInitError {}

impl MarkStack {
    pub fn new() -> Self {
        Self {
            backing: None,
            base: null_mut(),
            chunk_capacity: 0,
            max_chunk_capacity: 0,
            hwm: AtomicUsize::new(0),
            chunk_list: Mutex::new(null_mut()),
            chunks_in_chunk_list: AtomicUsize::new(0),
            free_list: Mutex::new(null_mut()),
        }
    }

    /// Capacity granularity in entries: requests are rounded up so the
    /// backing is both page and chunk aligned.
    pub fn capacity_alignment() -> usize {
        lcm(4096, size_of::<TaskEntryChunk>()) / size_of::<TaskEntry>()
    }

    /// Reserve the initial backing. Capacities are in entries.
    pub fn initialize(
        &mut self,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<(), MarkStackInitError> {
        assert!(self.max_chunk_capacity == 0, "already initialized");

        let chunk_size_in_entries = size_of::<TaskEntryChunk>() / size_of::<TaskEntry>();

        self.max_chunk_capacity =
            align_up(max_capacity, Self::capacity_alignment()) / chunk_size_in_entries;
        let initial_chunk_capacity =
            align_up(initial_capacity, Self::capacity_alignment()) / chunk_size_in_entries;

        assert!(
            initial_chunk_capacity <= self.max_chunk_capacity,
            "maximum chunk capacity {} smaller than initial capacity {}",
            self.max_chunk_capacity,
            initial_chunk_capacity
        );

        debug!(
            "initialize mark stack with {} chunks, maximum {}",
            initial_chunk_capacity, self.max_chunk_capacity
        );

        if self.resize(initial_chunk_capacity) {
            Ok(())
        } else {
            Err(MarkStackInitError {
                chunks: initial_chunk_capacity,
                bytes: initial_chunk_capacity * size_of::<TaskEntryChunk>(),
            })
        }
    }

    fn resize(&mut self, new_capacity: usize) -> bool {
        assert!(self.is_empty(), "only resize when stack is empty");
        assert!(
            new_capacity <= self.max_chunk_capacity,
            "resize to {} chunks over maximum {}",
            new_capacity,
            self.max_chunk_capacity
        );

        let bytes = new_capacity * size_of::<TaskEntryChunk>();
        let new_backing = match MmapMut::map_anon(bytes) {
            Ok(m) => m,
            Err(_) => {
                warn!(
                    "failed to reserve memory for new overflow mark stack with {} chunks and size {}B",
                    new_capacity, bytes
                );
                return false;
            }
        };

        // Release the old mapping only after the new one is installed.
        let old_backing = self.backing.take();
        self.base = new_backing.as_ptr() as *mut TaskEntryChunk;
        self.backing = Some(new_backing);
        self.chunk_capacity = new_capacity;
        self.set_empty();
        drop(old_backing);
        true
    }

    /// Double the capacity, bounded by the configured maximum. Only legal
    /// while the stack is empty, which the overflow protocol guarantees.
    pub fn expand(&mut self) {
        if self.chunk_capacity == self.max_chunk_capacity {
            debug!(
                "can not expand overflow mark stack further, already at maximum capacity of {} chunks",
                self.chunk_capacity
            );
            return;
        }
        let old_capacity = self.chunk_capacity;
        let new_capacity = (old_capacity * 2).min(self.max_chunk_capacity);

        if self.resize(new_capacity) {
            debug!(
                "expanded mark stack capacity from {} to {} chunks",
                old_capacity, new_capacity
            );
        } else {
            warn!(
                "failed to expand mark stack capacity from {} to {} chunks",
                old_capacity, new_capacity
            );
        }
    }

    fn add_chunk_to_chunk_list(&self, elem: *mut TaskEntryChunk) {
        let mut list = self.chunk_list.lock();
        unsafe {
            (*elem).next = *list;
        }
        *list = elem;
        self.chunks_in_chunk_list.fetch_add(1, Ordering::Relaxed);
    }

    fn add_chunk_to_free_list(&self, elem: *mut TaskEntryChunk) {
        let mut list = self.free_list.lock();
        unsafe {
            (*elem).next = *list;
        }
        *list = elem;
    }

    fn remove_chunk_from_chunk_list(&self) -> *mut TaskEntryChunk {
        let mut list = self.chunk_list.lock();
        let result = *list;
        if !result.is_null() {
            *list = unsafe { (*result).next };
            self.chunks_in_chunk_list.fetch_sub(1, Ordering::Relaxed);
        }
        result
    }

    fn remove_chunk_from_free_list(&self) -> *mut TaskEntryChunk {
        let mut list = self.free_list.lock();
        let result = *list;
        if !result.is_null() {
            *list = unsafe { (*result).next };
        }
        result
    }

    fn allocate_new_chunk(&self) -> *mut TaskEntryChunk {
        // Dirty pre-check so hwm stays bounded by capacity + #threads and
        // cannot wrap around.
        if self.hwm.load(Ordering::Relaxed) >= self.chunk_capacity {
            return null_mut();
        }

        let cur_idx = self.hwm.fetch_add(1, Ordering::Relaxed);
        if cur_idx >= self.chunk_capacity {
            return null_mut();
        }

        unsafe {
            let result = self.base.add(cur_idx);
            (*result).next = null_mut();
            result
        }
    }

    /// Push one full batch. Returns false only when both the free list
    /// and the backing allocator are exhausted; the caller reacts by
    /// raising the global overflow flag.
    pub fn par_push_chunk(&self, ptr_arr: &[TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        let mut new_chunk = self.remove_chunk_from_free_list();
        if new_chunk.is_null() {
            new_chunk = self.allocate_new_chunk();
            if new_chunk.is_null() {
                return false;
            }
        }

        unsafe {
            (*new_chunk).data.copy_from_slice(ptr_arr);
        }
        self.add_chunk_to_chunk_list(new_chunk);
        true
    }

    /// Pop one batch into `ptr_arr`. Unused slots at the tail are null
    /// entries.
    pub fn par_pop_chunk(&self, ptr_arr: &mut [TaskEntry; ENTRIES_PER_CHUNK]) -> bool {
        let cur = self.remove_chunk_from_chunk_list();
        if cur.is_null() {
            return false;
        }

        unsafe {
            ptr_arr.copy_from_slice(&(*cur).data);
        }
        self.add_chunk_to_free_list(cur);
        true
    }

    pub fn set_empty(&self) {
        self.chunks_in_chunk_list.store(0, Ordering::Relaxed);
        self.hwm.store(0, Ordering::Relaxed);
        *self.chunk_list.lock() = null_mut();
        *self.free_list.lock() = null_mut();
    }

    /// Number of full chunks. Racy by design, used for drain targets.
    #[inline]
    pub fn size(&self) -> usize {
        self.chunks_in_chunk_list.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Chunks ever carved out of the backing since the last reset.
    #[inline]
    pub fn allocated_chunks(&self) -> usize {
        self.hwm.load(Ordering::Relaxed).min(self.chunk_capacity)
    }
}

impl Default for MarkStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectHeader;

    fn batch(tag: usize) -> [TaskEntry; ENTRIES_PER_CHUNK] {
        let mut b = [TaskEntry::null(); ENTRIES_PER_CHUNK];
        for (i, e) in b.iter_mut().enumerate().take(100) {
            *e = TaskEntry::from_obj(((tag << 16) | (i + 1) << 4) as *mut ObjectHeader);
        }
        b
    }

    #[test]
    fn push_pop_round_trips_batches() {
        let mut stack = MarkStack::new();
        stack.initialize(16 * 1024, 64 * 1024).unwrap();

        assert!(stack.par_push_chunk(&batch(1)));
        assert!(stack.par_push_chunk(&batch(2)));
        assert_eq!(stack.size(), 2);

        let mut out = [TaskEntry::null(); ENTRIES_PER_CHUNK];
        assert!(stack.par_pop_chunk(&mut out));
        // LIFO across chunks.
        assert_eq!(out, batch(2));
        assert!(stack.par_pop_chunk(&mut out));
        assert_eq!(out, batch(1));
        assert!(!stack.par_pop_chunk(&mut out));
        assert!(stack.is_empty());
    }

    #[test]
    fn pushes_fail_when_full() {
        let mut stack = MarkStack::new();
        // One alignment granule of capacity.
        let granule = MarkStack::capacity_alignment();
        stack.initialize(granule, granule).unwrap();

        let mut pushed = 0;
        while stack.par_push_chunk(&batch(pushed)) {
            pushed += 1;
            assert!(pushed < 10_000);
        }
        assert_eq!(pushed, stack.capacity());

        // Recycling a chunk through the free list makes room again.
        let mut out = [TaskEntry::null(); ENTRIES_PER_CHUNK];
        assert!(stack.par_pop_chunk(&mut out));
        assert!(stack.par_push_chunk(&batch(7)));
    }

    #[test]
    fn expand_doubles_up_to_max() {
        let granule = MarkStack::capacity_alignment();
        let mut stack = MarkStack::new();
        stack.initialize(granule, granule * 4).unwrap();
        let initial = stack.capacity();

        stack.expand();
        assert_eq!(stack.capacity(), initial * 2);
        stack.expand();
        assert_eq!(stack.capacity(), initial * 4);
        // Saturated at the maximum.
        stack.expand();
        assert_eq!(stack.capacity(), initial * 4);
    }

    #[test]
    fn concurrent_pushes_and_pops_balance() {
        let mut stack = MarkStack::new();
        stack.initialize(64 * 1024, 256 * 1024).unwrap();
        let stack = &stack;
        let popped = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for t in 0..4 {
                s.spawn(move || {
                    for i in 0..50 {
                        let b = batch(t * 100 + i);
                        // Backing may be transiently full until a popper
                        // recycles a chunk.
                        while !stack.par_push_chunk(&b) {
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..2 {
                s.spawn(|| {
                    let mut out = [TaskEntry::null(); ENTRIES_PER_CHUNK];
                    loop {
                        if stack.par_pop_chunk(&mut out) {
                            popped.fetch_add(1, Ordering::Relaxed);
                        } else if popped.load(Ordering::Relaxed) + stack.size() >= 200
                            && stack.is_empty()
                        {
                            break;
                        }
                        std::hint::spin_loop();
                    }
                });
            }
        });

        assert_eq!(popped.load(Ordering::Relaxed) + stack.size(), 200);
    }
}
