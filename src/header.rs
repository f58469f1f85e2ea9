//! Uniform object header.
//!
//! Every cell carries the same small header: the object kind, the generation
//! it lives in, a flag word and the saturating reference count. The header
//! is the only part of a cell the collector reads without looking at the
//! payload.

use bitflags::bitflags;

use crate::object::ObjectKind;
use crate::refcount::RefCount;

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u16 {
        /// Reached during the current mark phase.
        const MARKED = 1 << 0;
        /// Output of a task that has not finished yet.
        const BEING_COMPUTED = 1 << 1;
        /// Input to a task that is still reading it.
        const IN_USE_BY_TASK = 1 << 2;
        /// Carries a class attribute.
        const OBJECT = 1 << 3;
        const S4_OBJECT = 1 << 4;
        /// Char string linked into the string cache.
        const CACHED = 1 << 5;
        /// Char string used as a symbol's print name.
        const SYMBOL_NAME = 1 << 6;
        /// Old object queued in the remembered set.
        const REMEMBERED = 1 << 7;
        /// Created at heap start; never swept.
        const PERMANENT = 1 << 8;
        /// Weak record whose key became unreachable.
        const READY_TO_FINALIZE = 1 << 9;
        /// Weak record to be finalized when the heap shuts down.
        const FINALIZE_ON_EXIT = 1 << 10;
        /// Char string whose bytes are all ASCII.
        const ASCII = 1 << 11;
    }
}

/// The three object generations. Survivors move towards [`Generation::Old`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Generation {
    #[default]
    Young = 0,
    Middle = 1,
    Old = 2,
}

impl Generation {
    pub const COUNT: usize = 3;
    pub const ALL: [Generation; 3] = [Generation::Young, Generation::Middle, Generation::Old];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Generation for an index, saturating at [`Generation::Old`].
    pub const fn from_index(index: usize) -> Self {
        match index {
            0 => Generation::Young,
            1 => Generation::Middle,
            _ => Generation::Old,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub kind: ObjectKind,
    pub generation: Generation,
    pub flags: HeaderFlags,
    pub refcount: RefCount,
}

impl ObjectHeader {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.flags.contains(HeaderFlags::MARKED)
    }

    #[inline]
    pub fn is_permanent(&self) -> bool {
        self.flags.contains(HeaderFlags::PERMANENT)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.kind == ObjectKind::Free
    }

    /// Flags a task holds on this object.
    #[inline]
    pub fn task_flags(&self) -> HeaderFlags {
        self.flags & (HeaderFlags::BEING_COMPUTED | HeaderFlags::IN_USE_BY_TASK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_header_starts_young_and_unshared() {
        let header = ObjectHeader::new(ObjectKind::Pair);
        assert_eq!(header.kind, ObjectKind::Pair);
        assert_eq!(header.generation, Generation::Young);
        assert_eq!(header.refcount, RefCount::Zero);
        assert!(header.flags.is_empty());
        assert!(!header.is_free());
    }

    #[test]
    fn generation_index_round_trips_and_saturates() {
        for generation in Generation::ALL {
            assert_eq!(Generation::from_index(generation.index()), generation);
        }
        assert_eq!(Generation::from_index(7), Generation::Old);
    }

    #[test]
    fn task_flags_isolate_interlock_bits() {
        let mut header = ObjectHeader::new(ObjectKind::RealVector);
        header.flags |= HeaderFlags::MARKED | HeaderFlags::IN_USE_BY_TASK;
        assert_eq!(header.task_flags(), HeaderFlags::IN_USE_BY_TASK);
    }
}
