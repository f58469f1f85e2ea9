//! Segmented cell arena.
//!
//! Storage is a list of segments, each holding a fixed number of cells of a
//! single node class. A [`Handle`] is `(segment, offset)`, so decompression
//! is two array indexings. Every node class keeps its own free list; cells
//! are recycled in place and segments are never moved.

use crate::error::invariant_violation;
use crate::handle::{Handle, MAX_SEGMENTS};
use crate::header::{Generation, ObjectHeader};
use crate::object::{vector_chunks, ObjectKind, Payload};

pub const NUM_NODE_CLASSES: usize = 7;

/// Chunk capacity of the small-vector classes 1 to 5.
pub const SMALL_VECTOR_CHUNKS: [usize; 5] = [1, 2, 4, 8, 16];

/// Size class a cell belongs to.
///
/// Class 0 holds fixed-size objects, classes 1 to 5 hold vectors up to the
/// matching entry of [`SMALL_VECTOR_CHUNKS`] and class 6 holds everything
/// larger, accounted in big chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeClass(u8);

impl NodeClass {
    pub const FIXED: NodeClass = NodeClass(0);
    pub const LARGE: NodeClass = NodeClass(6);

    pub fn for_request(kind: ObjectKind, length: usize) -> NodeClass {
        if !kind.is_vector() {
            return NodeClass::FIXED;
        }
        let chunks = vector_chunks(kind, length);
        SMALL_VECTOR_CHUNKS
            .iter()
            .position(|&limit| chunks <= limit)
            .map_or(NodeClass::LARGE, |i| NodeClass(i as u8 + 1))
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_large(self) -> bool {
        self.0 == NodeClass::LARGE.0
    }

    pub fn all() -> impl Iterator<Item = NodeClass> {
        (0..NUM_NODE_CLASSES as u8).map(NodeClass)
    }
}

/// A heap cell: header, attribute slot and payload.
///
/// For cached char strings the attribute slot is reused as the string cache
/// chain link.
#[derive(Debug, Clone)]
pub struct Cell {
    pub header: ObjectHeader,
    pub attrib: Handle,
    pub payload: Payload,
}

impl Cell {
    fn free() -> Self {
        Cell {
            header: ObjectHeader::default(),
            attrib: Handle::NIL,
            payload: Payload::Free,
        }
    }

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.header.kind
    }
}

#[derive(Debug)]
pub struct Segment {
    class: NodeClass,
    cells: Vec<Cell>,
    live: usize,
}

impl Segment {
    pub fn class(&self) -> NodeClass {
        self.class
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn live(&self) -> usize {
        self.live
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassUsage {
    pub segments: usize,
    pub cells: usize,
    pub live: usize,
}

pub struct Arena {
    segments: Vec<Segment>,
    free_lists: [Vec<Handle>; NUM_NODE_CLASSES],
    usage: [ClassUsage; NUM_NODE_CLASSES],
    segment_cells: usize,
}

impl Arena {
    pub fn new(segment_cells: usize) -> Self {
        Self {
            segments: Vec::new(),
            free_lists: Default::default(),
            usage: [ClassUsage::default(); NUM_NODE_CLASSES],
            segment_cells,
        }
    }

    pub fn segment_cells(&self) -> usize {
        self.segment_cells
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> &Segment {
        &self.segments[index]
    }

    /// Total cells across all segments.
    pub fn capacity(&self) -> usize {
        self.segments.len() * self.segment_cells
    }

    pub fn live_cells(&self) -> usize {
        self.usage.iter().map(|u| u.live).sum()
    }

    pub fn usage(&self, class: NodeClass) -> ClassUsage {
        self.usage[class.index()]
    }

    /// Append a segment for `class` and thread its cells onto the class free
    /// list. Returns the segment index, or `None` once handles run out.
    pub fn add_segment(&mut self, class: NodeClass) -> Option<usize> {
        let index = self.segments.len();
        if index > MAX_SEGMENTS {
            return None;
        }
        let cells = (0..self.segment_cells).map(|_| Cell::free()).collect();
        self.segments.push(Segment {
            class,
            cells,
            live: 0,
        });

        // Reverse order so low offsets pop first.
        let free = &mut self.free_lists[class.index()];
        free.extend((0..self.segment_cells).rev().map(|off| Handle::pack(index, off)));

        let usage = &mut self.usage[class.index()];
        usage.segments += 1;
        usage.cells += self.segment_cells;

        tracing::trace!(
            target: "genheap::arena",
            segment = index,
            class = class.index(),
            "segment added"
        );
        Some(index)
    }

    pub fn has_free(&self, class: NodeClass) -> bool {
        !self.free_lists[class.index()].is_empty()
    }

    /// Take a free cell of `class` and install `header` and `payload` in it.
    pub fn claim(
        &mut self,
        class: NodeClass,
        header: ObjectHeader,
        payload: Payload,
    ) -> Option<Handle> {
        let handle = self.free_lists[class.index()].pop()?;
        let segment = &mut self.segments[handle.segment()];
        let cell = &mut segment.cells[handle.offset()];
        debug_assert!(cell.header.is_free());
        cell.header = header;
        cell.attrib = Handle::NIL;
        cell.payload = payload;
        segment.live += 1;
        self.usage[class.index()].live += 1;
        Some(handle)
    }

    /// Return a cell to its class free list.
    pub fn release(&mut self, handle: Handle) {
        let segment = self.segment_for(handle);
        let class = segment.class;
        let cell = &mut segment.cells[handle.offset()];
        if cell.header.is_free() {
            invariant_violation("releasing a cell that is already free");
        }
        *cell = Cell::free();
        segment.live -= 1;
        self.usage[class.index()].live -= 1;
        self.free_lists[class.index()].push(handle);
    }

    /// Whether `handle` names an allocated cell.
    pub fn contains(&self, handle: Handle) -> bool {
        self.try_get(handle).is_some()
    }

    pub fn try_get(&self, handle: Handle) -> Option<&Cell> {
        self.segments
            .get(handle.segment())
            .and_then(|s| s.cells.get(handle.offset()))
            .filter(|c| !c.header.is_free())
    }

    /// Whether `h` is a live object strictly younger than `generation`.
    pub fn generation_below(&self, h: Handle, generation: Generation) -> bool {
        self.try_get(h)
            .is_some_and(|cell| cell.header.generation < generation)
    }

    /// Decompress a handle. Aborts on handles that do not name a live cell.
    #[inline]
    pub fn get(&self, handle: Handle) -> &Cell {
        match self.try_get(handle) {
            Some(cell) => cell,
            None => invariant_violation(&format!("dangling handle {handle:?}")),
        }
    }

    #[inline]
    pub fn get_mut(&mut self, handle: Handle) -> &mut Cell {
        let cell = &mut self.segment_for(handle).cells[handle.offset()];
        if cell.header.is_free() {
            invariant_violation(&format!("dangling handle {handle:?}"));
        }
        cell
    }

    /// Cell at a raw position, free or not. Used by the sweep.
    pub fn cell_at(&self, segment: usize, offset: usize) -> &Cell {
        &self.segments[segment].cells[offset]
    }

    pub fn class_of(&self, handle: Handle) -> NodeClass {
        let _ = self.get(handle);
        self.segments[handle.segment()].class
    }

    fn segment_for(&mut self, handle: Handle) -> &mut Segment {
        let count = self.segments.len();
        match self.segments.get_mut(handle.segment()) {
            Some(segment) if handle.offset() < segment.cells.len() => segment,
            _ => invariant_violation(&format!(
                "handle {handle:?} outside the arena ({count} segments)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_classes_follow_chunk_limits() {
        assert_eq!(NodeClass::for_request(ObjectKind::Pair, 0), NodeClass::FIXED);
        assert_eq!(NodeClass::for_request(ObjectKind::RealVector, 0).index(), 1);
        assert_eq!(NodeClass::for_request(ObjectKind::RealVector, 1).index(), 1);
        assert_eq!(NodeClass::for_request(ObjectKind::RealVector, 2).index(), 2);
        assert_eq!(NodeClass::for_request(ObjectKind::RealVector, 16).index(), 5);
        assert_eq!(NodeClass::for_request(ObjectKind::RealVector, 17), NodeClass::LARGE);
        assert_eq!(NodeClass::for_request(ObjectKind::RawVector, 128).index(), 5);
        assert!(NodeClass::for_request(ObjectKind::RawVector, 129).is_large());
    }

    #[test]
    fn claim_and_release_recycle_cells() {
        let mut arena = Arena::new(4);
        arena.add_segment(NodeClass::FIXED).unwrap();

        let h = arena
            .claim(
                NodeClass::FIXED,
                ObjectHeader::new(ObjectKind::Pair),
                Payload::for_kind(ObjectKind::Pair, 0).unwrap(),
            )
            .unwrap();
        assert_eq!(h, Handle::pack(0, 0));
        assert!(arena.contains(h));
        assert_eq!(arena.usage(NodeClass::FIXED).live, 1);

        arena.release(h);
        assert!(!arena.contains(h));
        assert_eq!(arena.usage(NodeClass::FIXED).live, 0);

        let again = arena
            .claim(
                NodeClass::FIXED,
                ObjectHeader::new(ObjectKind::Symbol),
                Payload::for_kind(ObjectKind::Symbol, 0).unwrap(),
            )
            .unwrap();
        assert_eq!(again, h);
        assert_eq!(arena.get(again).kind(), ObjectKind::Symbol);
    }

    #[test]
    fn free_lists_are_per_class() {
        let mut arena = Arena::new(2);
        arena.add_segment(NodeClass::FIXED).unwrap();
        assert!(arena.has_free(NodeClass::FIXED));
        assert!(!arena.has_free(NodeClass::LARGE));
        assert!(arena
            .claim(NodeClass::LARGE, ObjectHeader::new(ObjectKind::RealVector), Payload::Free)
            .is_none());
        assert_eq!(arena.capacity(), 2);
    }

    #[test]
    fn unknown_handles_are_not_contained() {
        let arena = Arena::new(8);
        assert!(!arena.contains(Handle::pack(3, 1)));
        assert!(!arena.contains(Handle::NO_OBJECT));
    }
}
