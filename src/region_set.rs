use std::ptr::null_mut;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::region::HeapRegion;

// Cycle detection bound for list verification. Set once at heap init to
// something comfortably above the maximum possible region count.
static UNREALISTICALLY_LONG_LENGTH: AtomicU32 = AtomicU32::new(0);

pub fn set_unrealistically_long_length(len: u32) {
    // Several heaps may coexist in one process; the bound only has to
    // stay above the largest of them.
    UNREALISTICALLY_LONG_LENGTH.fetch_max(len, Ordering::Relaxed);
}

/// A named set of regions linked into a doubly-linked list sorted
/// strictly ascending by region index. Operations that walk the list are
/// kept off hot paths; the typical uses are adding or removing one region
/// at a time and splicing whole lists.
///
/// Every member's containing-set back-reference points at this list, and
/// membership transitions always pass through "no set".
pub struct FreeRegionList {
    name: &'static str,
    head: *mut HeapRegion,
    tail: *mut HeapRegion,
    // Insertion hint, tracks the most recently added node so that runs of
    // ascending adds do not rescan from the head.
    last: *mut HeapRegion,
    length: u32,
}

unsafe impl Send for FreeRegionList {}

impl FreeRegionList {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            head: null_mut(),
            tail: null_mut(),
            last: null_mut(),
            length: 0,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline]
    fn as_set_ptr(&self) -> *const () {
        self as *const Self as *const ()
    }

    pub fn contains(&self, hr: *const HeapRegion) -> bool {
        unsafe { (*hr).containing_set() == self.as_set_ptr() }
    }

    #[cfg(debug_assertions)]
    fn verify_region(&self, hr: *mut HeapRegion) {
        unsafe {
            let hr = &*hr;
            assert!(
                hr.containing_set() == self.as_set_ptr(),
                "[{}] inconsistent containing set for {}",
                self.name,
                hr.index()
            );
            assert!(!hr.is_young(), "[{}] adding young region {}", self.name, hr.index());
            assert!(
                !hr.is_free() || hr.is_empty(),
                "[{}] free region {} is not empty",
                self.name,
                hr.index()
            );
            assert!(
                !hr.is_empty() || hr.is_free() || hr.is_archive(),
                "[{}] empty region {} is not free or archive",
                self.name,
                hr.index()
            );
        }
    }

    #[cfg(not(debug_assertions))]
    fn verify_region(&self, _hr: *mut HeapRegion) {}

    fn clear(&mut self) {
        self.length = 0;
        self.head = null_mut();
        self.tail = null_mut();
        self.last = null_mut();
    }

    /// Add `hr` keeping the index order. The region must not belong to
    /// any set.
    pub fn add_ordered(&mut self, hr: *mut HeapRegion) {
        unsafe {
            assert!(
                (*hr).next().is_null() && (*hr).prev().is_null(),
                "[{}] region {} still linked",
                self.name,
                (*hr).index()
            );
            (*hr).set_containing_set(self.as_set_ptr());
            self.verify_region(hr);
            self.length += 1;

            if self.is_empty_links() {
                self.head = hr;
                self.tail = hr;
                self.last = hr;
                return;
            }

            // Start from the hint when it is still below the new index.
            let mut curr = if !self.last.is_null() && (*self.last).index() < (*hr).index() {
                self.last
            } else {
                self.head
            };
            while !curr.is_null() && (*curr).index() < (*hr).index() {
                curr = (*curr).next();
            }

            if curr.is_null() {
                // New tail.
                (*self.tail).set_next(hr);
                (*hr).set_prev(self.tail);
                self.tail = hr;
            } else {
                debug_assert!(
                    (*curr).index() != (*hr).index(),
                    "[{}] duplicate region index {}",
                    self.name,
                    (*hr).index()
                );
                let prev = (*curr).prev();
                (*hr).set_next(curr);
                (*hr).set_prev(prev);
                if prev.is_null() {
                    self.head = hr;
                } else {
                    (*prev).set_next(hr);
                }
                (*curr).set_prev(hr);
            }
            self.last = hr;
        }
    }

    fn is_empty_links(&self) -> bool {
        debug_assert!(
            (self.head.is_null()) == (self.tail.is_null()),
            "[{}] half linked",
            self.name
        );
        self.head.is_null()
    }

    /// Splice `from_list` into this list in one pass over both lists,
    /// preserving the ascending order. `from_list` is empty afterwards.
    pub fn add_ordered_list(&mut self, from_list: &mut FreeRegionList) {
        if from_list.is_empty() {
            return;
        }

        unsafe {
            // Re-point the members at their new set, through null to
            // satisfy the transition check.
            let mut curr = from_list.head;
            while !curr.is_null() {
                (*curr).set_containing_set(core::ptr::null());
                (*curr).set_containing_set(self.as_set_ptr());
                curr = (*curr).next();
            }

            if self.is_empty_links() {
                self.head = from_list.head;
                self.tail = from_list.tail;
            } else {
                let mut curr_to = self.head;
                let mut curr_from = from_list.head;

                while !curr_from.is_null() {
                    while !curr_to.is_null() && (*curr_to).index() < (*curr_from).index() {
                        curr_to = (*curr_to).next();
                    }

                    if curr_to.is_null() {
                        // The rest of the from list goes after the tail.
                        (*self.tail).set_next(curr_from);
                        (*curr_from).set_prev(self.tail);
                        curr_from = null_mut();
                    } else {
                        let next_from = (*curr_from).next();

                        (*curr_from).set_next(curr_to);
                        (*curr_from).set_prev((*curr_to).prev());
                        if (*curr_to).prev().is_null() {
                            self.head = curr_from;
                        } else {
                            (*(*curr_to).prev()).set_next(curr_from);
                        }
                        (*curr_to).set_prev(curr_from);

                        curr_from = next_from;
                    }
                }

                if (*self.tail).index() < (*from_list.tail).index() {
                    self.tail = from_list.tail;
                }
            }
        }

        self.length += from_list.length();
        from_list.clear();
    }

    /// Unlink `num_regions` successive members starting at `first` and
    /// clear their set membership. Supports removal at the head, at the
    /// tail, in the middle and of the entire list.
    pub fn remove_starting_at(&mut self, first: *mut HeapRegion, num_regions: u32) {
        assert!(num_regions >= 1, "[{}] pre-condition", self.name);
        assert!(!self.is_empty(), "[{}] pre-condition", self.name);

        let old_length = self.length;

        unsafe {
            let mut curr = first;
            let mut count = 0;
            while count < num_regions {
                assert!(!curr.is_null(), "[{}] ran off the list", self.name);
                self.verify_region(curr);
                let next = (*curr).next();
                let prev = (*curr).prev();

                if prev.is_null() {
                    debug_assert!(self.head == curr, "[{}] invariant", self.name);
                    self.head = next;
                } else {
                    debug_assert!(self.head != curr, "[{}] invariant", self.name);
                    (*prev).set_next(next);
                }
                if next.is_null() {
                    debug_assert!(self.tail == curr, "[{}] invariant", self.name);
                    self.tail = prev;
                } else {
                    debug_assert!(self.tail != curr, "[{}] invariant", self.name);
                    (*next).set_prev(prev);
                }
                if self.last == curr {
                    self.last = null_mut();
                }

                (*curr).set_next(null_mut());
                (*curr).set_prev(null_mut());
                (*curr).set_containing_set(core::ptr::null());
                self.length -= 1;

                count += 1;
                curr = next;
            }
        }

        debug_assert!(
            self.length + num_regions == old_length,
            "[{}] new length {} inconsistent with old length {} minus {}",
            self.name,
            self.length,
            old_length,
            num_regions
        );
    }

    /// Remove one region from the head or the tail.
    pub fn remove_region(&mut self, from_head: bool) -> *mut HeapRegion {
        let hr = if from_head { self.head } else { self.tail };
        if hr.is_null() {
            return null_mut();
        }
        self.remove_starting_at(hr, 1);
        hr
    }

    /// Unlink every member and clear its membership.
    pub fn remove_all(&mut self) {
        unsafe {
            let mut curr = self.head;
            while !curr.is_null() {
                self.verify_region(curr);
                let next = (*curr).next();
                (*curr).set_next(null_mut());
                (*curr).set_prev(null_mut());
                (*curr).set_containing_set(core::ptr::null());
                curr = next;
            }
        }
        self.clear();
    }

    /// Number of members whose index falls into `[start, end]`.
    pub fn num_of_regions_in_range(&self, start: u32, end: u32) -> u32 {
        let mut cur = self.head;
        let mut num = 0;
        unsafe {
            while !cur.is_null() {
                let index = (*cur).index();
                if index > end {
                    break;
                } else if index >= start {
                    num += 1;
                }
                cur = (*cur).next();
            }
        }
        num
    }

    pub fn head(&self) -> *mut HeapRegion {
        self.head
    }

    pub fn tail(&self) -> *mut HeapRegion {
        self.tail
    }

    pub fn iter(&self) -> FreeRegionListIterator {
        FreeRegionListIterator { curr: self.head }
    }

    /// Re-derive the length by walking the list and check the sort order,
    /// the prev/next symmetry and the cycle bound.
    pub fn verify(&self) {
        assert!(
            (self.is_empty() && self.length() == 0) || (!self.is_empty() && self.length() > 0),
            "[{}] invariant",
            self.name
        );

        let bound = UNREALISTICALLY_LONG_LENGTH.load(Ordering::Relaxed);
        let mut count = 0u32;
        let mut last_index = 0u32;
        let mut prev0: *mut HeapRegion = null_mut();
        let mut curr = self.head;

        unsafe {
            assert!(
                self.head.is_null() || (*self.head).prev().is_null(),
                "[{}] head should not have a prev",
                self.name
            );
            while !curr.is_null() {
                self.verify_region(curr);

                count += 1;
                assert!(
                    bound == 0 || count < bound,
                    "[{}] the calculated length {} seems very long, is there maybe a cycle?",
                    self.name,
                    count
                );

                if !(*curr).next().is_null() {
                    assert!(
                        (*(*curr).next()).prev() == curr,
                        "[{}] next or prev pointers messed up",
                        self.name
                    );
                }
                assert!(
                    (*curr).index() == 0 || (*curr).index() > last_index,
                    "[{}] list should be sorted",
                    self.name
                );
                last_index = (*curr).index();

                prev0 = curr;
                curr = (*curr).next();
            }

            assert!(self.tail == prev0, "[{}] tail mismatch", self.name);
            assert!(
                self.tail.is_null() || (*self.tail).next().is_null(),
                "[{}] tail should not have a next",
                self.name
            );
            assert!(
                self.length() == count,
                "[{}] count mismatch, expected {}, actual {}",
                self.name,
                self.length(),
                count
            );
        }
    }
}

pub struct FreeRegionListIterator {
    curr: *mut HeapRegion,
}

impl Iterator for FreeRegionListIterator {
    type Item = *mut HeapRegion;

    fn next(&mut self) -> Option<*mut HeapRegion> {
        if self.curr.is_null() {
            return None;
        }
        let hr = self.curr;
        self.curr = unsafe { (*hr).next() };
        Some(hr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionKind;

    fn make_regions(indices: &[u32]) -> Vec<Box<HeapRegion>> {
        indices
            .iter()
            .map(|&i| {
                // Liveness of the fake backing does not matter, the list
                // never dereferences bottom.
                let base = 0x10_0000 + (i as usize) * 0x1000;
                let mut r = Box::new(HeapRegion::new(
                    i,
                    base as *mut u8,
                    (base + 0x1000) as *mut u8,
                ));
                r.set_kind(RegionKind::Free);
                r
            })
            .collect()
    }

    fn indices_of(list: &FreeRegionList) -> Vec<u32> {
        list.iter().map(|r| unsafe { (*r).index() }).collect()
    }

    #[test]
    fn add_ordered_sorts_and_tracks_membership() {
        let mut regions = make_regions(&[5, 1, 9, 3, 7]);
        let mut list = FreeRegionList::new("test");
        for r in regions.iter_mut() {
            list.add_ordered(r.as_mut() as *mut _);
        }
        assert_eq!(list.length(), 5);
        assert_eq!(indices_of(&list), vec![1, 3, 5, 7, 9]);
        for r in regions.iter() {
            assert!(list.contains(r.as_ref()));
        }
        list.verify();
    }

    #[test]
    fn ordered_merge_splices_in_one_pass() {
        let mut l_regions = make_regions(&[2, 5, 9]);
        let mut m_regions = make_regions(&[1, 7, 10]);
        let mut l = FreeRegionList::new("L");
        let mut m = FreeRegionList::new("M");
        for r in l_regions.iter_mut() {
            l.add_ordered(r.as_mut() as *mut _);
        }
        for r in m_regions.iter_mut() {
            m.add_ordered(r.as_mut() as *mut _);
        }

        l.add_ordered_list(&mut m);

        assert_eq!(indices_of(&l), vec![1, 2, 5, 7, 9, 10]);
        assert_eq!(l.length(), 6);
        assert!(m.is_empty());
        unsafe {
            assert_eq!((*l.tail()).index(), 10);
        }
        for r in m_regions.iter() {
            assert!(l.contains(r.as_ref()));
        }
        l.verify();
        m.verify();
    }

    #[test]
    fn merge_into_empty_list() {
        let mut m_regions = make_regions(&[4, 6]);
        let mut l = FreeRegionList::new("L");
        let mut m = FreeRegionList::new("M");
        for r in m_regions.iter_mut() {
            m.add_ordered(r.as_mut() as *mut _);
        }
        l.add_ordered_list(&mut m);
        assert_eq!(indices_of(&l), vec![4, 6]);
        l.verify();
    }

    #[test]
    fn remove_starting_at_boundaries() {
        // Head removal.
        let mut regions = make_regions(&[1, 2, 3, 4, 5]);
        let mut list = FreeRegionList::new("test");
        for r in regions.iter_mut() {
            list.add_ordered(r.as_mut() as *mut _);
        }
        let first = regions[0].as_mut() as *mut HeapRegion;
        list.remove_starting_at(first, 2);
        assert_eq!(indices_of(&list), vec![3, 4, 5]);
        assert!(regions[0].containing_set().is_null());
        assert!(regions[0].next().is_null() && regions[0].prev().is_null());
        list.verify();

        // Middle removal.
        let fourth = regions[3].as_mut() as *mut HeapRegion;
        list.remove_starting_at(fourth, 1);
        assert_eq!(indices_of(&list), vec![3, 5]);
        list.verify();

        // Tail removal.
        let fifth = regions[4].as_mut() as *mut HeapRegion;
        list.remove_starting_at(fifth, 1);
        assert_eq!(indices_of(&list), vec![3]);
        list.verify();

        // Remove the entire remaining list.
        let third = regions[2].as_mut() as *mut HeapRegion;
        list.remove_starting_at(third, 1);
        assert!(list.is_empty());
        assert!(list.head().is_null() && list.tail().is_null());
        list.verify();
    }

    #[test]
    fn remove_all_clears_links() {
        let mut regions = make_regions(&[1, 2, 3]);
        let mut list = FreeRegionList::new("test");
        for r in regions.iter_mut() {
            list.add_ordered(r.as_mut() as *mut _);
        }
        list.remove_all();
        assert!(list.is_empty());
        for r in regions.iter() {
            assert!(r.containing_set().is_null());
            assert!(r.next().is_null() && r.prev().is_null());
        }
        list.verify();
    }

    #[test]
    fn count_in_range_is_inclusive() {
        let mut regions = make_regions(&[1, 3, 5, 7, 9]);
        let mut list = FreeRegionList::new("test");
        for r in regions.iter_mut() {
            list.add_ordered(r.as_mut() as *mut _);
        }
        assert_eq!(list.num_of_regions_in_range(3, 7), 3);
        assert_eq!(list.num_of_regions_in_range(0, 100), 5);
        assert_eq!(list.num_of_regions_in_range(4, 4), 0);
        assert_eq!(list.num_of_regions_in_range(9, 9), 1);
    }
}
