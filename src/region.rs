use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::bitmap::MarkBitmap;
use crate::task_queue::TargetObjQueue;
use crate::utils::HEAP_WORD_SIZE;

/*
 Region type transitions are guarded by the heap lock. A region is Free
 until first allocation, Active (Young/Survivor/Old or a Humongous run)
 while it carries data, and returns to Free through reclamation. Archive
 regions hold immortal data and never change type. Humongous
 continuations follow their start region and are never scanned on their
 own.
*/
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum RegionKind {
    Free,
    Young,
    Survivor,
    Old,
    HumongousStart,
    HumongousCont,
    Archive,
}

impl RegionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RegionKind::Free => "FREE",
            RegionKind::Young => "YOUNG",
            RegionKind::Survivor => "SURV",
            RegionKind::Old => "OLD",
            RegionKind::HumongousStart => "HUMS",
            RegionKind::HumongousCont => "HUMC",
            RegionKind::Archive => "ARC",
        }
    }
}

/// A fixed-size span of the heap, the unit of claiming and reclamation.
///
/// The marking core reads `bottom`, `ntams` and the bitmap bindings
/// concurrently; everything else is mutated either at a safepoint or
/// under the owning set's lock.
pub struct HeapRegion {
    index: u32,
    bottom: *mut u8,
    end: *mut u8,
    top: AtomicPtr<u8>,
    /// Top captured when the current marking cycle started. Objects at or
    /// above are implicitly live and never marked.
    ntams: AtomicPtr<u8>,
    kind: RegionKind,

    /// Projection of the heap's next mark bitmap, bound at cycle start.
    alive_bitmap: AtomicPtr<MarkBitmap>,
    /// For the compaction collaborator; carried, not consulted here.
    dest_bitmap: AtomicPtr<MarkBitmap>,

    /// Cross-region reference roots into this region.
    target_obj_queue: TargetObjQueue,

    /// Link in the collection-set chain the claim cursor walks.
    cset_next: AtomicPtr<HeapRegion>,

    // Intrusive free-list links, owned by the containing set.
    next: *mut HeapRegion,
    prev: *mut HeapRegion,
    containing_set: *const (),
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new(index: u32, bottom: *mut u8, end: *mut u8) -> Self {
        Self {
            index,
            bottom,
            end,
            top: AtomicPtr::new(bottom),
            ntams: AtomicPtr::new(bottom),
            kind: RegionKind::Free,
            alive_bitmap: AtomicPtr::new(null_mut()),
            dest_bitmap: AtomicPtr::new(null_mut()),
            target_obj_queue: TargetObjQueue::new(),
            cset_next: AtomicPtr::new(null_mut()),
            next: null_mut(),
            prev: null_mut(),
            containing_set: core::ptr::null(),
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        self.bottom
    }
    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.end
    }
    #[inline]
    pub fn top(&self) -> *mut u8 {
        self.top.load(Ordering::Relaxed)
    }
    pub fn set_top(&self, top: *mut u8) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top, Ordering::Relaxed);
    }

    #[inline]
    pub fn ntams(&self) -> *mut u8 {
        self.ntams.load(Ordering::Acquire)
    }

    /// Capture NTAMS and bind the cycle's alive bitmap. Safepoint only;
    /// NTAMS then stays fixed for the whole cycle.
    pub fn note_start_of_marking(&self, alive_bitmap: *const MarkBitmap) {
        self.ntams.store(self.top(), Ordering::Release);
        self.alive_bitmap
            .store(alive_bitmap as *mut MarkBitmap, Ordering::Release);
    }

    #[inline]
    pub fn alive_bitmap(&self) -> *const MarkBitmap {
        self.alive_bitmap.load(Ordering::Acquire)
    }

    pub fn set_dest_bitmap(&self, bitmap: *const MarkBitmap) {
        self.dest_bitmap.store(bitmap as *mut MarkBitmap, Ordering::Release);
    }
    #[inline]
    pub fn dest_bitmap(&self) -> *const MarkBitmap {
        self.dest_bitmap.load(Ordering::Acquire)
    }

    #[inline]
    pub fn target_obj_queue(&self) -> &TargetObjQueue {
        &self.target_obj_queue
    }

    #[inline]
    pub fn cset_next(&self) -> *mut HeapRegion {
        self.cset_next.load(Ordering::Acquire)
    }
    pub fn set_cset_next(&self, next: *mut HeapRegion) {
        self.cset_next.store(next, Ordering::Release);
    }

    #[inline]
    pub fn is_in_reserved(&self, addr: *const u8) -> bool {
        (addr as usize) >= self.bottom as usize && (addr as usize) < self.end as usize
    }

    /// True for objects allocated after the cycle's NTAMS snapshot; those
    /// are implicitly live and must not be marked.
    #[inline]
    pub fn obj_allocated_since_next_marking(&self, addr: *const u8) -> bool {
        addr as usize >= self.ntams() as usize
    }

    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }
    pub fn set_kind(&mut self, kind: RegionKind) {
        self.kind = kind;
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.kind == RegionKind::Free
    }
    #[inline]
    pub fn is_young(&self) -> bool {
        self.kind == RegionKind::Young
    }
    #[inline]
    pub fn is_survivor(&self) -> bool {
        self.kind == RegionKind::Survivor
    }
    #[inline]
    pub fn is_old(&self) -> bool {
        self.kind == RegionKind::Old
    }
    #[inline]
    pub fn is_archive(&self) -> bool {
        self.kind == RegionKind::Archive
    }
    #[inline]
    pub fn is_humongous(&self) -> bool {
        matches!(self.kind, RegionKind::HumongousStart | RegionKind::HumongousCont)
    }
    #[inline]
    pub fn is_starts_humongous(&self) -> bool {
        self.kind == RegionKind::HumongousStart
    }
    #[inline]
    pub fn is_continues_humongous(&self) -> bool {
        self.kind == RegionKind::HumongousCont
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    pub fn used(&self) -> usize {
        self.top() as usize - self.bottom as usize
    }

    pub fn capacity(&self) -> usize {
        self.end as usize - self.bottom as usize
    }

    pub fn capacity_words(&self) -> usize {
        self.capacity() / HEAP_WORD_SIZE
    }

    #[inline]
    pub fn next(&self) -> *mut HeapRegion {
        self.next
    }
    #[inline]
    pub fn prev(&self) -> *mut HeapRegion {
        self.prev
    }
    pub fn set_next(&mut self, next: *mut HeapRegion) {
        self.next = next;
    }
    pub fn set_prev(&mut self, prev: *mut HeapRegion) {
        self.prev = prev;
    }

    #[inline]
    pub fn containing_set(&self) -> *const () {
        self.containing_set
    }

    /// Transitions go through null so that moving a region between sets
    /// without removing it first trips an assert.
    pub fn set_containing_set(&mut self, set: *const ()) {
        debug_assert!(
            set.is_null() != self.containing_set.is_null(),
            "region {} containing set changed from {:p} to {:p}",
            self.index,
            self.containing_set,
            set
        );
        self.containing_set = set;
    }
}
