//! Marking.
//!
//! Marking uses an explicit worklist, so deep structures (long pairlists,
//! nested environments) cost heap memory rather than native stack. Objects
//! older than the collection level are never marked: they count as live
//! and are not traced, except for remembered objects whose children are
//! traced as roots.

use crate::arena::Arena;
use crate::handle::Handle;
use crate::header::HeaderFlags;
use crate::heap::Heap;

use super::CollectionLevel;

pub(crate) struct Marker {
    level: CollectionLevel,
    trace_names: bool,
    worklist: Vec<Handle>,
    scratch: Vec<Handle>,
    marked: usize,
}

impl Marker {
    pub fn new(level: CollectionLevel, trace_names: bool) -> Self {
        Self {
            level,
            trace_names,
            worklist: Vec::new(),
            scratch: Vec::new(),
            marked: 0,
        }
    }

    pub fn marked(&self) -> usize {
        self.marked
    }

    /// Whether `h` survives this collection as things stand.
    pub fn is_marked(&self, arena: &Arena, h: Handle) -> bool {
        let header = &arena.get(h).header;
        header.is_marked() || header.is_permanent() || !self.level.covers(header.generation)
    }

    /// Mark `h` and queue it for tracing. Returns true if it was newly marked.
    pub fn mark(&mut self, arena: &mut Arena, h: Handle) -> bool {
        if h.is_no_object() {
            return false;
        }
        let header = &mut arena.get_mut(h).header;
        if header.is_marked() || header.is_permanent() || !self.level.covers(header.generation) {
            return false;
        }
        header.flags |= HeaderFlags::MARKED;
        self.marked += 1;
        self.worklist.push(h);
        true
    }

    /// Queue the children of `h` without marking `h` itself.
    pub fn mark_children(&mut self, arena: &mut Arena, h: Handle) {
        let mut children = std::mem::take(&mut self.scratch);
        collect_children(arena, h, self.trace_names, &mut children);
        for child in children.drain(..) {
            self.mark(arena, child);
        }
        self.scratch = children;
    }

    /// Trace until the worklist is empty.
    pub fn drain(&mut self, arena: &mut Arena) {
        while let Some(h) = self.worklist.pop() {
            self.mark_children(arena, h);
        }
    }
}

fn collect_children(arena: &Arena, h: Handle, trace_names: bool, out: &mut Vec<Handle>) {
    let cell = arena.get(h);
    if !cell.header.flags.contains(HeaderFlags::CACHED) {
        out.push(cell.attrib);
    }
    cell.payload.visit_children(trace_names, |child| out.push(child));
}

impl Heap {
    /// Mark everything reachable from the root set.
    pub(crate) fn mark_roots(&mut self, marker: &mut Marker) {
        self.clear_symbol_lookup_caches();

        let Heap {
            arena,
            roots,
            protect,
            symbols,
            remembered,
            ..
        } = self;

        roots.visit(|h| {
            marker.mark(arena, h);
        });
        for h in protect.iter() {
            marker.mark(arena, h);
        }
        for sym in symbols.handles() {
            marker.mark(arena, sym);
        }
        marker.drain(arena);

        for &h in remembered.iter() {
            let live_old = arena
                .try_get(h)
                .is_some_and(|cell| !marker.level.covers(cell.header.generation));
            if live_old {
                marker.mark_children(arena, h);
            }
        }
        marker.drain(arena);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectKind;

    #[test]
    fn deep_lists_mark_without_recursion() {
        let mut heap = Heap::new();
        let mut list = Handle::NIL;
        let index = heap.push_root_with_index(Handle::NIL).unwrap();
        for _ in 0..50_000 {
            list = heap.cons(Handle::NIL, list).unwrap();
            heap.reprotect_at_index(list, index);
        }

        let mut marker = Marker::new(CollectionLevel::Full, true);
        heap.mark_roots(&mut marker);
        assert_eq!(marker.marked(), 50_000);
        heap.pop_roots(1);
    }

    #[test]
    fn older_objects_count_as_marked_but_are_not_traced() {
        let mut heap = Heap::new();
        let v = heap.allocate(ObjectKind::RealVector, 2).unwrap();
        heap.arena.get_mut(v).header.generation = crate::header::Generation::Middle;

        let mut marker = Marker::new(CollectionLevel::Minor, false);
        assert!(marker.is_marked(&heap.arena, v));
        assert!(!marker.mark(&mut heap.arena, v));
        assert!(marker.is_marked(&heap.arena, Handle::NIL));
    }

    #[test]
    fn cached_string_links_are_not_traced() {
        let mut heap = Heap::new();
        let a = heap.intern_string(b"a", crate::object::Encoding::Native).unwrap();
        heap.push_root(a).unwrap();
        let mut marker = Marker::new(CollectionLevel::Full, true);
        heap.mark_roots(&mut marker);
        assert_eq!(marker.marked(), 1);
        heap.pop_roots(1);
    }
}
