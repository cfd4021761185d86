use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::config::RegionOptions;
use crate::object::{ObjectHeader, ObjectKind};
use crate::region::{HeapRegion, RegionKind};
use crate::region_set::{set_unrealistically_long_length, FreeRegionList};
use crate::utils::HEAP_WORD_SIZE;

/// The host side of the marking core: one contiguous reservation carved
/// into fixed-size regions, plus the master free list and the collection
/// set chain the claim cursor walks.
///
/// Object allocation here is the plain bump-pointer used by the tests and
/// the root builders; the production allocators live with the host.
pub struct RegionHeap {
    storage: MmapMut,
    opts: RegionOptions,
    regions: Box<[HeapRegion]>,
    free_list: Mutex<FreeRegionList>,
    cset_head: AtomicPtr<HeapRegion>,
}

unsafe impl Send for RegionHeap {}
unsafe impl Sync for RegionHeap {}

impl RegionHeap {
    pub fn new(opts: RegionOptions) -> Box<Self> {
        let storage = MmapMut::map_anon(opts.max_heap_size).expect("failed to reserve heap");
        let base = storage.as_ptr() as *mut u8;

        let regions = (0..opts.region_count)
            .map(|i| unsafe {
                let bottom = base.add(i * opts.region_size_bytes);
                HeapRegion::new(i as u32, bottom, bottom.add(opts.region_size_bytes))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        set_unrealistically_long_length(opts.region_count as u32 * 2 + 1);

        Box::new(Self {
            storage,
            opts,
            regions,
            free_list: Mutex::new(FreeRegionList::new("Master Free List")),
            cset_head: AtomicPtr::new(null_mut()),
        })
    }

    #[inline]
    pub fn options(&self) -> &RegionOptions {
        &self.opts
    }

    #[inline]
    pub fn reserved_begin(&self) -> *mut u8 {
        self.storage.as_ptr() as *mut u8
    }

    #[inline]
    pub fn reserved_end(&self) -> *mut u8 {
        unsafe { self.reserved_begin().add(self.opts.max_heap_size) }
    }

    #[inline]
    pub fn is_in_reserved(&self, addr: *const u8) -> bool {
        addr as usize >= self.reserved_begin() as usize
            && (addr as usize) < self.reserved_end() as usize
    }

    #[inline]
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn max_regions(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn region_at(&self, index: usize) -> *mut HeapRegion {
        debug_assert!(index < self.regions.len());
        &self.regions[index] as *const HeapRegion as *mut HeapRegion
    }

    #[inline]
    pub fn addr_to_region_index(&self, addr: *const u8) -> u32 {
        debug_assert!(self.is_in_reserved(addr));
        ((addr as usize - self.reserved_begin() as usize) >> self.opts.region_size_bytes_shift)
            as u32
    }

    #[inline]
    pub fn heap_region_containing(&self, addr: *const u8) -> *mut HeapRegion {
        self.region_at(self.addr_to_region_index(addr) as usize)
    }

    pub fn humongous_obj_size_in_regions(&self, word_size: usize) -> usize {
        (word_size * HEAP_WORD_SIZE + self.opts.region_size_bytes - 1) / self.opts.region_size_bytes
    }

    /// Bump-allocate one object in the given region. Host/test side only.
    pub fn alloc_obj(
        &self,
        region_index: usize,
        kind: ObjectKind,
        ref_len: usize,
        word_size: usize,
    ) -> *mut ObjectHeader {
        unsafe {
            let r = &mut *self.region_at(region_index);
            assert!(!r.is_humongous(), "humongous regions use alloc_humongous");
            let top = r.top();
            let new_top = top.add(word_size * HEAP_WORD_SIZE);
            assert!(
                new_top as usize <= r.end() as usize,
                "region {} overflow allocating {} words",
                region_index,
                word_size
            );
            r.set_top(new_top);

            let obj = top as *mut ObjectHeader;
            obj.write(ObjectHeader::new(word_size, ref_len, kind));
            obj
        }
    }

    /// Allocate one object spanning whole regions starting at
    /// `first_index`. Tags the run HumongousStart / HumongousCont.
    pub fn alloc_humongous(
        &self,
        first_index: usize,
        kind: ObjectKind,
        ref_len: usize,
        word_size: usize,
    ) -> *mut ObjectHeader {
        let num_regions = self.humongous_obj_size_in_regions(word_size);
        assert!(num_regions >= 1);
        assert!(first_index + num_regions <= self.num_regions());
        assert!(
            word_size >= self.opts.humongous_threshold_words,
            "object of {} words is not humongous",
            word_size
        );

        unsafe {
            let mut remaining_bytes = word_size * HEAP_WORD_SIZE;
            for i in 0..num_regions {
                let r = &mut *self.region_at(first_index + i);
                assert!(r.is_free() && r.is_empty());
                r.set_kind(if i == 0 {
                    RegionKind::HumongousStart
                } else {
                    RegionKind::HumongousCont
                });
                let fill = remaining_bytes.min(r.capacity());
                r.set_top(r.bottom().add(fill));
                remaining_bytes -= fill;
            }
            debug_assert!(remaining_bytes == 0);

            let obj = (*self.region_at(first_index)).bottom() as *mut ObjectHeader;
            obj.write(ObjectHeader::new(word_size, ref_len, kind));
            obj
        }
    }

    /// Chain the given regions into the collection set the claim cursor
    /// hands out. Called at a safepoint before the cycle starts.
    pub fn build_collection_set(&self, indices: &[usize]) {
        let mut prev: *mut HeapRegion = null_mut();
        for &i in indices.iter().rev() {
            let r = self.region_at(i);
            unsafe {
                (*r).set_cset_next(prev);
            }
            prev = r;
        }
        self.cset_head.store(prev, Ordering::Release);
    }

    #[inline]
    pub fn collection_set_head(&self) -> *mut HeapRegion {
        self.cset_head.load(Ordering::Acquire)
    }

    /// Return a region to the free state and stick it on `list`. The
    /// caller owns the transition (remark cleanup).
    pub fn free_region(&self, hr: *mut HeapRegion, list: &mut FreeRegionList) {
        unsafe {
            let r = &mut *hr;
            r.set_kind(RegionKind::Free);
            r.set_top(r.bottom());
            list.add_ordered(hr);
        }
    }

    /// Splice a local cleanup list into the master free list under one
    /// lock acquisition.
    pub fn prepend_to_freelist(&self, list: &mut FreeRegionList) {
        let mut master = self.free_list.lock();
        master.add_ordered_list(list);
    }

    pub fn with_free_list<R>(&self, f: impl FnOnce(&mut FreeRegionList) -> R) -> R {
        f(&mut self.free_list.lock())
    }
}

/// One-shot claimer so a worker gang can partition region iteration.
/// Workers start at an offset proportional to their id and wrap, claiming
/// each region exactly once across the gang.
pub struct HeapRegionClaimer {
    claims: Box<[AtomicU8]>,
    n_workers: usize,
}

impl HeapRegionClaimer {
    pub fn new(num_regions: usize, n_workers: usize) -> Self {
        assert!(n_workers > 0);
        Self {
            claims: (0..num_regions).map(|_| AtomicU8::new(0)).collect(),
            n_workers,
        }
    }

    pub fn claim_region(&self, index: usize) -> bool {
        self.claims[index].swap(1, Ordering::AcqRel) == 0
    }

    pub fn offset_for_worker(&self, worker_id: usize) -> usize {
        self.claims.len() * worker_id / self.n_workers
    }
}

impl RegionHeap {
    /// Visit every region not yet claimed, starting at the worker's
    /// offset. The closure returns true to abort the iteration.
    pub fn par_iterate_regions_from_worker_offset(
        &self,
        claimer: &HeapRegionClaimer,
        worker_id: usize,
        mut f: impl FnMut(*mut HeapRegion) -> bool,
    ) {
        let n = self.num_regions();
        let start = claimer.offset_for_worker(worker_id);
        for i in 0..n {
            let index = (start + i) % n;
            if !claimer.claim_region(index) {
                continue;
            }
            if f(self.region_at(index)) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> Box<RegionHeap> {
        let opts = RegionOptions::setup_sizes(4 * 1024 * 1024, None, Some(64), None);
        RegionHeap::new(opts)
    }

    #[test]
    fn regions_tile_the_reservation() {
        let heap = small_heap();
        assert_eq!(heap.num_regions(), heap.options().region_count);
        unsafe {
            for i in 0..heap.num_regions() {
                let r = &*heap.region_at(i);
                assert_eq!(r.index() as usize, i);
                assert_eq!(r.capacity(), heap.options().region_size_bytes);
                assert_eq!(heap.addr_to_region_index(r.bottom()), i as u32);
                assert_eq!(heap.addr_to_region_index(r.end().sub(1)), i as u32);
            }
        }
    }

    #[test]
    fn bump_allocation_and_region_lookup() {
        let heap = small_heap();
        let obj = heap.alloc_obj(3, ObjectKind::Normal, 2, 8);
        unsafe {
            assert_eq!((*obj).word_size(), 8);
            let r = heap.heap_region_containing(obj as *const u8);
            assert_eq!((*r).index(), 3);
            assert_eq!((*r).used(), 8 * HEAP_WORD_SIZE);
        }
    }

    #[test]
    fn humongous_run_is_tagged_and_filled() {
        let heap = small_heap();
        let region_words = heap.options().region_size_words;
        let word_size = region_words + region_words / 2;
        let obj = heap.alloc_humongous(1, ObjectKind::PrimArray, 0, word_size);
        unsafe {
            assert!((*heap.region_at(1)).is_starts_humongous());
            assert!((*heap.region_at(2)).is_continues_humongous());
            assert!(!(*heap.region_at(3)).is_humongous());
            assert_eq!((*heap.region_at(1)).used(), heap.options().region_size_bytes);
            assert_eq!(
                (*heap.region_at(2)).used(),
                (word_size - region_words) * HEAP_WORD_SIZE
            );
            assert_eq!(obj as usize, (*heap.region_at(1)).bottom() as usize);
        }
        assert_eq!(heap.humongous_obj_size_in_regions(word_size), 2);
    }

    #[test]
    fn collection_set_chain_links_in_order() {
        let heap = small_heap();
        heap.build_collection_set(&[2, 5, 9]);
        unsafe {
            let head = heap.collection_set_head();
            assert_eq!((*head).index(), 2);
            let second = (*head).cset_next();
            assert_eq!((*second).index(), 5);
            let third = (*second).cset_next();
            assert_eq!((*third).index(), 9);
            assert!((*third).cset_next().is_null());
        }
    }

    #[test]
    fn claimer_hands_each_region_to_one_worker() {
        let heap = small_heap();
        let claimer = HeapRegionClaimer::new(heap.num_regions(), 4);
        let counts: Vec<AtomicU8> = (0..heap.num_regions()).map(|_| AtomicU8::new(0)).collect();
        std::thread::scope(|s| {
            for worker in 0..4 {
                let claimer = &claimer;
                let heap = &heap;
                let counts = &counts;
                s.spawn(move || {
                    heap.par_iterate_regions_from_worker_offset(claimer, worker, |r| {
                        counts[unsafe { (*r).index() } as usize].fetch_add(1, Ordering::Relaxed);
                        false
                    });
                });
            }
        });
        assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    }
}
