//! Sweeping and promotion.

use crate::handle::Handle;
use crate::header::{Generation, HeaderFlags};
use crate::heap::Heap;
use crate::object::{vector_chunks, ObjectKind};

use super::CollectionLevel;

/// What the sweep does with an unmarked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeDecision {
    Reclaim,
    /// Keep the object as if it had been marked.
    Keep,
}

impl Heap {
    /// Reclaim unmarked objects of generations `0..=level` and promote the
    /// survivors. Returns the number of objects freed per generation.
    pub(crate) fn sweep(&mut self, level: CollectionLevel) -> [usize; 3] {
        let target = level.promotion_target();
        let mut freed = [0; 3];

        for segment in 0..self.arena.segment_count() {
            let large = self.arena.segment(segment).class().is_large();
            for offset in 0..self.arena.segment(segment).len() {
                let cell = self.arena.cell_at(segment, offset);
                let header = cell.header;
                if header.is_free() || header.is_permanent() || !level.covers(header.generation) {
                    continue;
                }
                let chunks = if large {
                    vector_chunks(header.kind, cell.payload.len())
                } else {
                    0
                };

                let h = Handle::pack(segment, offset);
                let survives = header.is_marked()
                    || self.about_to_free(h, header.kind, header.flags) == FreeDecision::Keep;
                if survives {
                    self.promote(h, header.generation, target, chunks);
                } else {
                    self.reclaim(h, header.kind, header.generation, chunks);
                    freed[header.generation.index()] += 1;
                }
            }
        }
        freed
    }

    /// Last look at an unmarked object before it is freed.
    fn about_to_free(&mut self, h: Handle, kind: ObjectKind, flags: HeaderFlags) -> FreeDecision {
        if kind == ObjectKind::CharString && flags.contains(HeaderFlags::CACHED) {
            return self.evict_cached_string(h, flags);
        }
        FreeDecision::Reclaim
    }

    fn promote(&mut self, h: Handle, from: Generation, to: Generation, chunks: usize) {
        let pending = self.tasks.is_object_pending(h);
        let in_use = self.tasks.is_object_in_use(h);
        let header = &mut self.arena.get_mut(h).header;
        header.flags.remove(HeaderFlags::MARKED);
        header.flags.set(HeaderFlags::BEING_COMPUTED, pending);
        header.flags.set(HeaderFlags::IN_USE_BY_TASK, in_use);
        header.generation = to;

        self.generations[from.index()].objects -= 1;
        self.generations[from.index()].big_chunks -= chunks;
        self.generations[to.index()].objects += 1;
        self.generations[to.index()].big_chunks += chunks;
    }

    fn reclaim(&mut self, h: Handle, kind: ObjectKind, generation: Generation, chunks: usize) {
        if let Some(observer) = self.free_observer.as_mut() {
            observer(h, kind);
        }
        self.arena.release(h);
        self.generations[generation.index()].objects -= 1;
        self.generations[generation.index()].big_chunks -= chunks;
    }

    /// Keep only remembered objects that still point into a younger
    /// generation.
    pub(crate) fn prune_remembered_set(&mut self) {
        let remembered = std::mem::take(&mut self.remembered);
        let mut kept = Vec::with_capacity(remembered.len());
        for h in remembered {
            let Some(cell) = self.arena.try_get(h) else {
                continue;
            };
            let generation = cell.header.generation;
            let mut younger = false;
            if !cell.header.flags.contains(HeaderFlags::CACHED) {
                younger |= self.arena.generation_below(cell.attrib, generation);
            }
            cell.payload.visit_children(true, |child| {
                younger |= self.arena.generation_below(child, generation);
            });

            if younger {
                kept.push(h);
            } else {
                self.arena.get_mut(h).header.flags.remove(HeaderFlags::REMEMBERED);
            }
        }
        self.remembered = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn observer_sees_each_reclaimed_object_once() {
        let mut heap = Heap::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        heap.set_free_observer(move |h, kind| sink.borrow_mut().push((h, kind)));

        let pair = heap.cons(Handle::NIL, Handle::NIL).unwrap();
        let vector = heap.allocate(ObjectKind::RealVector, 100).unwrap();
        heap.request_collection(CollectionLevel::Full);
        heap.request_collection(CollectionLevel::Full);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&(pair, ObjectKind::Pair)));
        assert!(seen.contains(&(vector, ObjectKind::RealVector)));
    }

    #[test]
    fn big_chunk_accounting_follows_promotion_and_reclaim() {
        let mut heap = Heap::new();
        let kept = heap.allocate(ObjectKind::RealVector, 64).unwrap();
        heap.preserve(kept);
        heap.allocate(ObjectKind::RealVector, 32).unwrap();
        assert_eq!(heap.stats().generations[0].big_chunks, 96);

        heap.request_collection(CollectionLevel::Minor);
        let stats = heap.stats();
        assert_eq!(stats.generations[0].big_chunks, 0);
        assert_eq!(stats.generations[1].big_chunks, 64);
        assert_eq!(stats.big_chunks, 64);
    }

    #[test]
    fn remembered_set_drops_entries_without_young_children() {
        let mut heap = Heap::new();
        let holder = heap.allocate(ObjectKind::List, 1).unwrap();
        heap.preserve(holder);
        heap.request_collection(CollectionLevel::Minor);

        let young = heap.allocate(ObjectKind::IntegerVector, 1).unwrap();
        heap.set_vector_elt(holder, 0, young).unwrap();
        assert_eq!(heap.stats().remembered, 1);

        // `young` catches up with `holder`, so the entry is no longer needed.
        heap.request_collection(CollectionLevel::Minor);
        assert_eq!(heap.generation(young), heap.generation(holder));
        assert_eq!(heap.stats().remembered, 0);
        assert!(!heap.flags(holder).contains(HeaderFlags::REMEMBERED));
    }
}
