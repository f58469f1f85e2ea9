//! Compressed object handles.
//!
//! A [`Handle`] names a heap cell by `(segment, offset)` packed into a single
//! integer. By default the integer is 32 bits wide with [`OFFSET_BITS`] bits of
//! offset; the `wide-handles` feature switches to a 64-bit representation with a
//! 32-bit segment index. Both forms address the same arena, so the choice only
//! trades density for segment count.

use std::fmt;

#[cfg(not(feature = "wide-handles"))]
pub type HandleBits = u32;
#[cfg(feature = "wide-handles")]
pub type HandleBits = u64;

/// Number of low bits holding the cell offset inside its segment.
pub const OFFSET_BITS: u32 = 12;

/// Largest number of cells a single segment can hold.
pub const MAX_SEGMENT_CELLS: usize = 1 << OFFSET_BITS;

const OFFSET_MASK: HandleBits = (1 << OFFSET_BITS) - 1;

/// Largest segment index representable in a handle.
pub const MAX_SEGMENTS: usize = ((HandleBits::MAX >> OFFSET_BITS) - 1) as usize;

/// Opaque reference to a heap object.
///
/// Handles are plain `Copy` values; they carry no lifetime and keep nothing
/// alive. Reachability is decided by tracing from roots.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(HandleBits);

impl Handle {
    /// The permanent empty object. Doubles as the "none" attribute sentinel
    /// and the initial value of every sub-handle slot.
    pub const NIL: Handle = Handle::pack(0, 0);

    /// Permanent marker for a symbol without a binding.
    pub const UNBOUND: Handle = Handle::pack(0, 1);

    /// Returned by the allocation fast path when it cannot satisfy a request.
    /// Never refers to a cell.
    pub const NO_OBJECT: Handle = Handle(HandleBits::MAX);

    /// Pack a segment index and cell offset.
    pub const fn pack(segment: usize, offset: usize) -> Self {
        Handle(((segment as HandleBits) << OFFSET_BITS) | (offset as HandleBits & OFFSET_MASK))
    }

    #[inline]
    pub const fn segment(self) -> usize {
        (self.0 >> OFFSET_BITS) as usize
    }

    #[inline]
    pub const fn offset(self) -> usize {
        (self.0 & OFFSET_MASK) as usize
    }

    #[inline]
    pub const fn is_nil(self) -> bool {
        self.0 == Handle::NIL.0
    }

    #[inline]
    pub const fn is_no_object(self) -> bool {
        self.0 == HandleBits::MAX
    }

    /// Raw integer form, for hashing into external tables.
    pub const fn to_bits(self) -> HandleBits {
        self.0
    }

    pub const fn from_bits(bits: HandleBits) -> Self {
        Handle(bits)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::NIL
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_object() {
            write!(f, "Handle(NO_OBJECT)")
        } else if self.is_nil() {
            write!(f, "Handle(NIL)")
        } else {
            write!(f, "Handle({}:{})", self.segment(), self.offset())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_unpack_agree() {
        let h = Handle::pack(37, 4095);
        assert_eq!(h.segment(), 37);
        assert_eq!(h.offset(), 4095);
        assert_eq!(Handle::from_bits(h.to_bits()), h);
    }

    #[test]
    fn sentinels_are_distinct() {
        assert_ne!(Handle::NIL, Handle::UNBOUND);
        assert_ne!(Handle::NIL, Handle::NO_OBJECT);
        assert!(Handle::NIL.is_nil());
        assert!(Handle::NO_OBJECT.is_no_object());
        assert!(!Handle::UNBOUND.is_nil());
        assert_eq!(Handle::default(), Handle::NIL);
    }

    #[test]
    fn no_object_is_outside_segment_range() {
        assert!(Handle::NO_OBJECT.segment() > MAX_SEGMENTS);
    }

    #[test]
    fn debug_output_names_sentinels() {
        assert_eq!(format!("{:?}", Handle::NIL), "Handle(NIL)");
        assert_eq!(format!("{:?}", Handle::pack(2, 5)), "Handle(2:5)");
    }
}
