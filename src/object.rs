use modular_bitfield::prelude::*;

use crate::utils::HEAP_WORD_SIZE;

// ObjectHeader is the one word of metadata prepended to every heap
// object. The marker treats objects as opaque records; all it needs is
// the total size, the reference layout and the coarse kind tag.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | word size       |   30 | Total size including the header, words.  |
// +-----------------+------+------------------------------------------+
// | ref len         |   30 | Normal: count of leading reference slots.|
// |                 |      | ObjArray: element count.                 |
// |                 |      | PrimArray: 0.                            |
// +-----------------+------+------------------------------------------+
// | kind            |    2 |                                          |
// | unused          |    2 |                                          |
// +-----------------+------+------------------------------------------+
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ObjectHeader {
    encoded: EncodedObject,
}

#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
struct EncodedObject {
    word_size: B30,
    ref_len: B30,
    kind: ObjectKind,
    #[skip]
    __: B2,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ObjectKind {
    /// Plain instance. The first `ref_len` payload words are reference
    /// slots, the rest is non-reference data.
    Normal = 0,
    /// Array of references.
    ObjArray,
    /// Array of primitives. Contains no references and is never scanned.
    PrimArray,
}

impl Specifier for ObjectKind {
    const BITS: usize = 2;
    type Bytes = u8;
    type InOut = Self;
    fn from_bytes(
        bytes: Self::Bytes,
    ) -> Result<Self::InOut, modular_bitfield::error::InvalidBitPattern<Self::Bytes>> {
        Ok(match bytes {
            0 => Self::Normal,
            1 => Self::ObjArray,
            2 => Self::PrimArray,
            _ => unreachable!(),
        })
    }
    fn into_bytes(input: Self::InOut) -> Result<Self::Bytes, modular_bitfield::error::OutOfBounds> {
        Ok(input as u8)
    }
}

impl ObjectHeader {
    pub fn new(word_size: usize, ref_len: usize, kind: ObjectKind) -> Self {
        debug_assert!(word_size >= 1 + ref_len);
        Self {
            encoded: EncodedObject::new()
                .with_word_size(word_size as u32)
                .with_ref_len(ref_len as u32)
                .with_kind(kind),
        }
    }

    #[inline(always)]
    pub fn word_size(&self) -> usize {
        self.encoded.word_size() as usize
    }

    #[inline(always)]
    pub fn size_bytes(&self) -> usize {
        self.word_size() * HEAP_WORD_SIZE
    }

    #[inline(always)]
    pub fn kind(&self) -> ObjectKind {
        self.encoded.kind()
    }

    #[inline(always)]
    pub fn is_obj_array(&self) -> bool {
        self.kind() == ObjectKind::ObjArray
    }

    #[inline(always)]
    pub fn is_prim_array(&self) -> bool {
        self.kind() == ObjectKind::PrimArray
    }

    /// Number of reference slots (element count for reference arrays).
    #[inline(always)]
    pub fn ref_len(&self) -> usize {
        self.encoded.ref_len() as usize
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut usize {
        (self as *const Self as usize + core::mem::size_of::<Self>()) as _
    }

    /// Address of reference slot `i`.
    #[inline(always)]
    pub fn ref_slot(&self, i: usize) -> *mut *mut ObjectHeader {
        debug_assert!(i < self.ref_len());
        unsafe { self.payload().add(i) as *mut *mut ObjectHeader }
    }

    /// Visit the address of every reference slot. Returns the object size
    /// in words, the unit the marking clock counts in.
    #[inline]
    pub fn oop_iterate(&self, mut f: impl FnMut(*mut *mut ObjectHeader)) -> usize {
        match self.kind() {
            ObjectKind::Normal | ObjectKind::ObjArray => {
                for i in 0..self.ref_len() {
                    f(self.ref_slot(i));
                }
            }
            ObjectKind::PrimArray => (),
        }
        self.word_size()
    }

    /// Visit reference slots `[from, to)`. Only meaningful for reference
    /// arrays; used by the array slice processor.
    #[inline]
    pub fn oop_iterate_range(
        &self,
        from: usize,
        to: usize,
        mut f: impl FnMut(*mut *mut ObjectHeader),
    ) -> usize {
        debug_assert!(self.is_obj_array());
        debug_assert!(from <= to && to <= self.ref_len());
        for i in from..to {
            f(self.ref_slot(i));
        }
        to - from
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_one_word() {
        assert_eq!(core::mem::size_of::<ObjectHeader>(), HEAP_WORD_SIZE);
    }

    #[test]
    fn encode_decode() {
        let h = ObjectHeader::new(12, 3, ObjectKind::Normal);
        assert_eq!(h.word_size(), 12);
        assert_eq!(h.ref_len(), 3);
        assert_eq!(h.kind(), ObjectKind::Normal);
        assert_eq!(h.size_bytes(), 96);

        let a = ObjectHeader::new(1001, 1000, ObjectKind::ObjArray);
        assert!(a.is_obj_array());
        assert_eq!(a.ref_len(), 1000);
    }

    #[test]
    fn iterate_visits_ref_slots_only() {
        // Object with 2 ref slots and 3 data words, built in place.
        let mut backing = [0usize; 6];
        unsafe {
            let hdr = backing.as_mut_ptr() as *mut ObjectHeader;
            hdr.write(ObjectHeader::new(6, 2, ObjectKind::Normal));
            let mut slots = vec![];
            let visited = (*hdr).oop_iterate(|slot| slots.push(slot as usize));
            assert_eq!(visited, 6);
            assert_eq!(slots.len(), 2);
            assert_eq!(slots[0], backing.as_ptr().add(1) as usize);
            assert_eq!(slots[1], backing.as_ptr().add(2) as usize);
        }
    }

    #[test]
    fn prim_array_has_no_slots() {
        let mut backing = [0usize; 4];
        unsafe {
            let hdr = backing.as_mut_ptr() as *mut ObjectHeader;
            hdr.write(ObjectHeader::new(4, 0, ObjectKind::PrimArray));
            let mut n = 0;
            (*hdr).oop_iterate(|_| n += 1);
            assert_eq!(n, 0);
        }
    }
}
