use atomic::Atomic;
use atomic::Ordering;
use core::fmt;
use memmap2::MmapMut;
use std::mem::size_of;

use crate::object::ObjectHeader;
use crate::utils::{round_up_u64, HEAP_WORD_SIZE};

const BITS_PER_INTPTR: usize = size_of::<usize>() * 8;

/// Bit-per-heap-word map over a contiguous address range. Bit `i` covers
/// the word at `heap_begin + i * HEAP_WORD_SIZE`.
///
/// One instance covers the whole reserved heap; a region's alive bitmap
/// is the projection of this map onto the region's address range, so no
/// per-region storage exists.
#[allow(dead_code)]
pub struct MarkBitmap {
    mem_map: MmapMut,
    bitmap_begin: *mut Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

unsafe impl Send for MarkBitmap {}
unsafe impl Sync for MarkBitmap {}

impl MarkBitmap {
    #[inline]
    pub fn get_name(&self) -> &'static str {
        self.name
    }
    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }
    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }
    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        let offset = (obj as usize).wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        index < (self.bitmap_size / size_of::<usize>())
    }
    #[inline]
    pub fn index_to_offset(index: usize) -> usize {
        index * HEAP_WORD_SIZE * BITS_PER_INTPTR
    }
    #[inline]
    pub fn offset_to_index(offset: usize) -> usize {
        offset / HEAP_WORD_SIZE / BITS_PER_INTPTR
    }
    #[inline]
    pub fn offset_bit_index(offset: usize) -> usize {
        (offset / HEAP_WORD_SIZE) % BITS_PER_INTPTR
    }
    #[inline]
    pub fn offset_to_mask(offset: usize) -> usize {
        1 << Self::offset_bit_index(offset)
    }

    pub fn compute_bitmap_size(capacity: u64) -> usize {
        let bytes_covered_per_word = (HEAP_WORD_SIZE * BITS_PER_INTPTR) as u64;
        ((round_up_u64(capacity, bytes_covered_per_word) / bytes_covered_per_word)
            * size_of::<usize>() as u64) as usize
    }

    pub fn create(name: &'static str, heap_begin: *mut u8, heap_capacity: usize) -> Self {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity as u64);
        let mem_map = MmapMut::map_anon(bitmap_size).expect("failed to reserve mark bitmap");
        let bitmap_begin = mem_map.as_ptr() as *mut u8;
        Self {
            name,
            mem_map,
            bitmap_begin: bitmap_begin.cast(),
            bitmap_size,
            heap_begin: heap_begin as usize,
            heap_limit: heap_begin as usize + heap_capacity,
        }
    }

    #[inline]
    fn word(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(
            index < self.bitmap_size / size_of::<usize>(),
            "bitmap_size: {}",
            self.bitmap_size
        );
        unsafe { &*self.bitmap_begin.add(index) }
    }

    /// Atomically set the bit for `addr`. Returns true iff this caller
    /// flipped it from 0 to 1, which is the dedup gate for discovery.
    #[inline]
    pub fn par_mark(&self, addr: *const u8) -> bool {
        let offset = (addr as usize).wrapping_sub(self.heap_begin);
        debug_assert!(self.has_address(addr), "invalid address {:p}", addr);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let entry = self.word(index);

        let mut old_word;
        while {
            old_word = entry.load(Ordering::Relaxed);
            if (old_word & mask) != 0 {
                return false;
            }
            entry
                .compare_exchange_weak(
                    old_word,
                    old_word | mask,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_err()
        } {}

        true
    }

    #[inline]
    pub fn is_marked(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        debug_assert!(self.heap_begin <= addr);
        let offset = addr.wrapping_sub(self.heap_begin);
        (self.word(Self::offset_to_index(offset)).load(Ordering::Relaxed)
            & Self::offset_to_mask(offset))
            != 0
    }

    #[inline]
    fn modify<const SET_BIT: bool>(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        debug_assert!(addr >= self.heap_begin);
        let offset = addr.wrapping_sub(self.heap_begin);
        let index = Self::offset_to_index(offset);
        let mask = Self::offset_to_mask(offset);
        let entry = self.word(index);
        let old_word = entry.load(Ordering::Relaxed);
        if SET_BIT {
            if (old_word & mask) == 0 {
                entry.store(old_word | mask, Ordering::Relaxed);
            }
        } else {
            entry.store(old_word & !mask, Ordering::Relaxed);
        }
        (old_word & mask) != 0
    }

    /// Non-atomic set, only sound at a safepoint.
    #[inline(always)]
    pub fn mark(&self, addr: *const u8) -> bool {
        self.modify::<true>(addr)
    }

    #[inline(always)]
    pub fn clear(&self, addr: *const u8) -> bool {
        self.modify::<false>(addr)
    }

    /// Clear every bit covering `[begin, end)`.
    pub fn clear_range(&self, begin: *const u8, end: *const u8) {
        let mut begin_offset = begin as usize - self.heap_begin;
        let mut end_offset = end as usize - self.heap_begin;
        // Trim the partial edge words bit by bit, then blank whole words.
        while begin_offset < end_offset && Self::offset_bit_index(begin_offset) != 0 {
            self.clear((self.heap_begin + begin_offset) as _);
            begin_offset += HEAP_WORD_SIZE;
        }
        while begin_offset < end_offset && Self::offset_bit_index(end_offset) != 0 {
            end_offset -= HEAP_WORD_SIZE;
            self.clear((self.heap_begin + end_offset) as _);
        }
        let index_start = Self::offset_to_index(begin_offset);
        let index_end = Self::offset_to_index(end_offset);
        for i in index_start..index_end {
            self.word(i).store(0, Ordering::Relaxed);
        }
    }

    pub fn clear_all(&self) {
        for i in 0..self.bitmap_size / size_of::<usize>() {
            self.word(i).store(0, Ordering::Relaxed);
        }
    }

    /// Visit marked addresses in `[visit_begin, visit_end)` in ascending
    /// order. The visitor returns false to abort the walk (yield points in
    /// concurrent clearing); the return value is false iff aborted.
    ///
    /// Bits may be flipped concurrently; each word is loaded once and its
    /// set bits walked from the snapshot.
    pub fn visit_marked_range(
        &self,
        visit_begin: *const u8,
        visit_end: *const u8,
        mut visitor: impl FnMut(*mut ObjectHeader) -> bool,
    ) -> bool {
        let offset_start = visit_begin as usize - self.heap_begin;
        let offset_end = visit_end as usize - self.heap_begin;

        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);
        let bit_start = Self::offset_bit_index(offset_start);
        let bit_end = Self::offset_bit_index(offset_end);

        for i in index_start..=index_end {
            if i == index_end && bit_end == 0 {
                break;
            }
            let mut w = self.word(i).load(Ordering::Relaxed);
            if i == index_start {
                w &= !((1usize << bit_start) - 1);
            }
            if i == index_end {
                w &= (1usize << bit_end) - 1;
            }
            let ptr_base = Self::index_to_offset(i) + self.heap_begin;
            while w != 0 {
                let shift = w.trailing_zeros() as usize;
                let obj = (ptr_base + shift * HEAP_WORD_SIZE) as *mut ObjectHeader;
                if !visitor(obj) {
                    return false;
                }
                w ^= 1 << shift;
            }
        }
        true
    }
}

impl fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} begin={:p},end={:p}]",
            self.name, self.heap_begin as *const (), self.heap_limit as *const ()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_bitmap(capacity: usize) -> (MmapMut, MarkBitmap) {
        let heap = MmapMut::map_anon(capacity).unwrap();
        let begin = heap.as_ptr() as *mut u8;
        (heap, MarkBitmap::create("test", begin, capacity))
    }

    #[test]
    fn par_mark_flips_once() {
        let (_heap, bm) = test_bitmap(64 * 1024);
        let addr = (bm.heap_begin() + 64) as *const u8;
        assert!(!bm.is_marked(addr));
        assert!(bm.par_mark(addr));
        assert!(!bm.par_mark(addr));
        assert!(bm.is_marked(addr));
    }

    #[test]
    fn par_mark_unique_across_threads() {
        let (_heap, bm) = test_bitmap(1024 * 1024);
        let wins = AtomicUsize::new(0);
        let base = bm.heap_begin();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for i in 0..1000 {
                        if bm.par_mark((base + i * HEAP_WORD_SIZE) as _) {
                            wins.fetch_add(1, atomic::Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(wins.load(atomic::Ordering::Relaxed), 1000);
    }

    #[test]
    fn visit_marked_range_ascending_and_abortable() {
        let (_heap, bm) = test_bitmap(64 * 1024);
        let base = bm.heap_begin();
        for i in [3usize, 17, 64, 65, 200, 1000] {
            bm.mark((base + i * HEAP_WORD_SIZE) as _);
        }
        let mut seen = vec![];
        let complete = bm.visit_marked_range(base as _, (base + 64 * 1024) as _, |obj| {
            seen.push((obj as usize - base) / HEAP_WORD_SIZE);
            true
        });
        assert!(complete);
        assert_eq!(seen, vec![3, 17, 64, 65, 200, 1000]);

        let mut count = 0;
        let complete = bm.visit_marked_range(base as _, (base + 64 * 1024) as _, |_| {
            count += 1;
            count < 3
        });
        assert!(!complete);
        assert_eq!(count, 3);
    }

    #[test]
    fn clear_range_spans_words() {
        let (_heap, bm) = test_bitmap(64 * 1024);
        let base = bm.heap_begin();
        for i in 0..512 {
            bm.mark((base + i * HEAP_WORD_SIZE) as _);
        }
        bm.clear_range((base + 5 * HEAP_WORD_SIZE) as _, (base + 300 * HEAP_WORD_SIZE) as _);
        for i in 0..512 {
            let marked = bm.is_marked((base + i * HEAP_WORD_SIZE) as _);
            assert_eq!(marked, !(5..300).contains(&i), "word {}", i);
        }
    }
}
