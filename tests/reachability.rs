//! Property-based tests for reachability soundness.
//!
//! Random object graphs are built out of two-slot generic vectors, some of
//! them aged into an older generation before the edges are written so that
//! old-to-young edges go through the write barrier. After dropping a random
//! subset of roots, a collection at any level must keep every object still
//! reachable, and a full collection must reclaim everything else.

use std::collections::HashSet;

use genheap::{CollectionLevel, Handle, Heap, HeapConfig, ObjectKind};
use proptest::prelude::*;

const SLOTS: usize = 2;

#[derive(Debug, Clone)]
struct GraphPlan {
    nodes: usize,
    edges: Vec<(usize, usize, usize)>,
    roots: Vec<bool>,
}

impl GraphPlan {
    /// Slot contents after applying every edge in order.
    fn slots(&self) -> Vec<[Option<usize>; SLOTS]> {
        let mut slots = vec![[None; SLOTS]; self.nodes];
        for &(from, slot, to) in &self.edges {
            slots[from][slot] = Some(to);
        }
        slots
    }

    fn reachable(&self) -> HashSet<usize> {
        let slots = self.slots();
        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = (0..self.nodes).filter(|&i| self.roots[i]).collect();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(slots[node].iter().flatten().copied());
            }
        }
        seen
    }
}

fn arb_plan() -> impl Strategy<Value = GraphPlan> {
    (1usize..48).prop_flat_map(|nodes| {
        (
            prop::collection::vec((0..nodes, 0..SLOTS, 0..nodes), 0..96),
            prop::collection::vec(any::<bool>(), nodes),
        )
            .prop_map(move |(edges, roots)| GraphPlan {
                nodes,
                edges,
                roots,
            })
    })
}

fn arb_level() -> impl Strategy<Value = CollectionLevel> {
    prop_oneof![
        Just(CollectionLevel::Minor),
        Just(CollectionLevel::Mid),
        Just(CollectionLevel::Full),
    ]
}

fn small_segment_heap() -> Heap {
    let config = HeapConfig::builder().segment_cells(16).build().unwrap();
    Heap::with_config(config).unwrap()
}

/// Allocate the nodes, aging the first half if asked, then write the edges.
fn build(heap: &mut Heap, plan: &GraphPlan, age_first_half: bool) -> Vec<Handle> {
    let mut handles = Vec::with_capacity(plan.nodes);
    let split = plan.nodes / 2;
    for i in 0..plan.nodes {
        if i == split && age_first_half {
            heap.request_collection(CollectionLevel::Minor);
        }
        let h = heap.allocate(ObjectKind::List, SLOTS).unwrap();
        heap.preserve(h);
        handles.push(h);
    }
    for &(from, slot, to) in &plan.edges {
        heap.set_vector_elt(handles[from], slot, handles[to]).unwrap();
    }
    for (i, &h) in handles.iter().enumerate() {
        if !plan.roots[i] {
            assert!(heap.release(h));
        }
    }
    handles
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn collections_never_reclaim_reachable_objects(
        plan in arb_plan(),
        level in arb_level(),
        age_first_half in any::<bool>(),
    ) {
        let mut heap = small_segment_heap();
        let handles = build(&mut heap, &plan, age_first_half);
        let reachable = plan.reachable();
        let slots = plan.slots();

        heap.request_collection(level);

        for &node in &reachable {
            let h = handles[node];
            prop_assert!(heap.is_live(h), "reachable node {} was reclaimed at {:?}", node, level);
            prop_assert_eq!(heap.kind(h), ObjectKind::List);
            for (slot, target) in slots[node].iter().enumerate() {
                let expected = target.map_or(Handle::NIL, |t| handles[t]);
                prop_assert_eq!(heap.vector_elt(h, slot).unwrap(), expected);
            }
        }

        heap.request_collection(CollectionLevel::Full);
        for (node, &h) in handles.iter().enumerate() {
            prop_assert_eq!(heap.is_live(h), reachable.contains(&node));
        }
    }

    #[test]
    fn young_objects_held_only_by_old_ones_survive_minor_collections(
        fan_out in 1usize..64,
    ) {
        let mut heap = small_segment_heap();
        let holder = heap.allocate(ObjectKind::List, fan_out).unwrap();
        heap.preserve(holder);
        heap.request_collection(CollectionLevel::Minor);
        heap.request_collection(CollectionLevel::Mid);

        let mut young = Vec::new();
        for i in 0..fan_out {
            let v = heap.allocate(ObjectKind::IntegerVector, 1).unwrap();
            heap.integer_data_mut(v)[0] = i as i32;
            heap.set_vector_elt(holder, i, v).unwrap();
            young.push(v);
        }

        heap.request_collection(CollectionLevel::Minor);
        for (i, &v) in young.iter().enumerate() {
            prop_assert!(heap.is_live(v));
            prop_assert_eq!(heap.integer_data(v)[0], i as i32);
        }
    }
}

#[test]
fn cycles_through_environments_and_closures_are_collected() {
    let mut heap = Heap::new();
    let env = heap.make_environment(&[], &[], Handle::NIL).unwrap();
    heap.push_root(env).unwrap();
    let closure = heap.make_closure(Handle::NIL, Handle::NIL, env).unwrap();
    heap.push_root(closure).unwrap();
    let sym = heap.intern_symbol(b"f").unwrap();
    heap.define_var(env, sym, closure).unwrap();

    heap.request_collection(CollectionLevel::Full);
    assert!(heap.is_live(env));
    assert!(heap.is_live(closure));

    heap.pop_roots(2);
    heap.request_collection(CollectionLevel::Full);
    assert!(!heap.is_live(env));
    assert!(!heap.is_live(closure));
    assert!(heap.is_live(sym));
}

#[test]
fn evaluation_contexts_and_bytecode_stack_are_roots() {
    let mut heap = Heap::new();
    let call = heap.cons(Handle::NIL, Handle::NIL).unwrap();
    let operand = heap.allocate(ObjectKind::RealVector, 2).unwrap();
    let context = genheap::EvalContext {
        call,
        ..Default::default()
    };
    heap.begin_context(context);
    heap.bytecode_push(operand);

    heap.request_collection(CollectionLevel::Full);
    assert!(heap.is_live(call));
    assert!(heap.is_live(operand));

    heap.bytecode_pop(1);
    heap.end_context();
    heap.request_collection(CollectionLevel::Full);
    assert!(!heap.is_live(call));
    assert!(!heap.is_live(operand));
}
