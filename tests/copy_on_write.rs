//! The copy-on-write law: in-place mutation is allowed exactly when the
//! count is at most one and no task holds the object.

use std::sync::Arc;

use genheap::{CollectionLevel, Handle, Heap, ObjectKind, PendingObjects, RefCount};

fn set_count(heap: &mut Heap, h: Handle, count: RefCount) {
    let steps = match count {
        RefCount::Zero => 0,
        RefCount::One => 1,
        RefCount::Many => 2,
    };
    for _ in 0..steps {
        heap.increment_refcount(h);
    }
    assert_eq!(heap.refcount(h), count);
}

#[test]
fn may_mutate_in_place_follows_count_and_task_state() {
    for count in [RefCount::Zero, RefCount::One, RefCount::Many] {
        for pending in [false, true] {
            for in_use in [false, true] {
                let registry = Arc::new(PendingObjects::new());
                let mut heap = Heap::new();
                heap.set_task_scheduler(registry.clone());

                let v = heap.allocate(ObjectKind::RealVector, 4).unwrap();
                heap.preserve(v);
                set_count(&mut heap, v, count);
                if pending {
                    registry.begin_output(v);
                }
                if in_use {
                    registry.begin_input(v);
                }

                let state = heap.refcount_state(v);
                assert_eq!(state.count, count);
                assert_eq!(state.being_computed, pending);
                assert_eq!(state.in_use_by_task, in_use);

                let expected = count <= RefCount::One && !pending && !in_use;
                assert_eq!(
                    heap.may_mutate_in_place(v),
                    expected,
                    "count {count:?}, pending {pending}, in use {in_use}"
                );
            }
        }
    }
}

#[test]
fn duplicate_if_shared_never_touches_the_original() {
    let registry = Arc::new(PendingObjects::new());
    let mut heap = Heap::new();
    heap.set_task_scheduler(registry.clone());

    let shared = heap.allocate(ObjectKind::IntegerVector, 3).unwrap();
    heap.preserve(shared);
    heap.integer_data_mut(shared).copy_from_slice(&[1, 2, 3]);
    set_count(&mut heap, shared, RefCount::Many);

    let target = heap.duplicate_if_shared(shared).unwrap();
    assert_ne!(target, shared);
    heap.integer_data_mut(target)[0] = 10;
    assert_eq!(heap.integer_data(shared), &[1, 2, 3]);

    let read_by_task = heap.allocate(ObjectKind::IntegerVector, 3).unwrap();
    heap.preserve(read_by_task);
    registry.begin_input(read_by_task);
    let copy = heap.duplicate_if_shared(read_by_task).unwrap();
    assert_ne!(copy, read_by_task);
    registry.finish_input(read_by_task);
    assert_eq!(heap.duplicate_if_shared(read_by_task).unwrap(), read_by_task);
}

#[test]
fn counts_survive_collections_and_stay_sticky() {
    let mut heap = Heap::new();
    let v = heap.allocate(ObjectKind::RawVector, 8).unwrap();
    let holder = heap.allocate(ObjectKind::List, 2).unwrap();
    heap.preserve(holder);
    heap.set_vector_elt(holder, 0, v).unwrap();
    heap.set_vector_elt(holder, 1, v).unwrap();
    assert_eq!(heap.refcount(v), RefCount::Many);

    heap.set_vector_elt(holder, 1, Handle::NIL).unwrap();
    heap.request_collection(CollectionLevel::Full);
    assert_eq!(heap.refcount(v), RefCount::Many);
    assert!(!heap.may_mutate_in_place(v));
}

#[test]
fn replacing_the_only_reference_drops_the_count() {
    let mut heap = Heap::new();
    let v = heap.allocate(ObjectKind::RawVector, 8).unwrap();
    let pair = heap.cons(v, Handle::NIL).unwrap();
    heap.preserve(pair);
    assert_eq!(heap.refcount(v), RefCount::One);

    heap.set_car(pair, Handle::NIL);
    assert_eq!(heap.refcount(v), RefCount::Zero);
}

#[test]
fn duplicate_keeps_attributes_and_class_bits() {
    let mut heap = Heap::new();
    let attrib = heap.cons(Handle::NIL, Handle::NIL).unwrap();
    heap.push_root(attrib).unwrap();
    let v = heap.allocate(ObjectKind::RealVector, 2).unwrap();
    heap.push_root(v).unwrap();
    heap.set_attrib(v, attrib);
    heap.set_object_bit(v, true);

    let copy = heap.duplicate(v).unwrap();
    assert_ne!(heap.attrib(copy), attrib);
    assert_eq!(heap.kind(heap.attrib(copy)), ObjectKind::Pair);
    assert!(heap.flags(copy).contains(genheap::HeaderFlags::OBJECT));
    heap.pop_roots(2);
}
