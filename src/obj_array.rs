use crate::object::ObjectHeader;

/// Upper bound on reference-array elements scanned in one go. Larger
/// arrays are cut into slice entries so one huge array cannot stall a
/// worker between clock checks, and so slices are stealable.
pub const SLICE_STEP: usize = 128;

/// Whole reference arrays above this go through the slice path.
pub fn should_be_sliced(obj: *const ObjectHeader) -> bool {
    unsafe { (*obj).is_obj_array() && (*obj).ref_len() >= 2 * SLICE_STEP }
}

/// Cut the next step off a pending range. Returns the end of the range
/// to scan now and the tail slice to re-push, if any remains.
#[inline]
pub fn split_slice(from: u32, remaining: u32) -> (u32, Option<(u32, u32)>) {
    debug_assert!(remaining > 0);
    let bound = remaining.min(SLICE_STEP as u32);
    let tail = if remaining > bound {
        Some((from + bound, remaining - bound))
    } else {
        None
    };
    (from + bound, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    #[test]
    fn slicing_threshold() {
        let small = ObjectHeader::new(2 * SLICE_STEP, 2 * SLICE_STEP - 1, ObjectKind::ObjArray);
        assert!(!should_be_sliced(&small));
        let large = ObjectHeader::new(2 * SLICE_STEP + 1, 2 * SLICE_STEP, ObjectKind::ObjArray);
        assert!(should_be_sliced(&large));
        let prim = ObjectHeader::new(10_000, 0, ObjectKind::PrimArray);
        assert!(!should_be_sliced(&prim));
    }

    #[test]
    fn slices_cover_array_without_overlap() {
        let len = 1000u32;
        let mut covered = vec![false; len as usize];
        let mut pending = vec![(0u32, len)];
        let mut visits = 0;
        while let Some((from, remaining)) = pending.pop() {
            visits += 1;
            let (to, tail) = split_slice(from, remaining);
            for i in from..to {
                assert!(!covered[i as usize], "element {} scanned twice", i);
                covered[i as usize] = true;
            }
            if let Some(tail) = tail {
                pending.push(tail);
            }
        }
        assert!(covered.iter().all(|&c| c));
        assert_eq!(visits, (len as usize + SLICE_STEP - 1) / SLICE_STEP);
    }
}
