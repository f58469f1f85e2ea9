//! String interning idempotence and eviction.

use std::cell::RefCell;
use std::rc::Rc;

use genheap::{CollectionLevel, Encoding, Heap, HeapConfig, ObjectKind};
use proptest::prelude::*;

#[test]
fn collected_strings_are_reinterned_as_new_objects() {
    let mut heap = Heap::new();
    let freed = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&freed);
    heap.set_free_observer(move |h, kind| sink.borrow_mut().push((h, kind)));

    let first = heap.intern_string(b"transient", Encoding::Utf8).unwrap();
    assert_eq!(heap.intern_string(b"transient", Encoding::Utf8).unwrap(), first);

    heap.request_collection(CollectionLevel::Full);
    assert_eq!(freed.borrow().as_slice(), &[(first, ObjectKind::CharString)]);
    assert!(!heap.is_live(first));
    assert_eq!(heap.stats().cached_strings, 0);

    let second = heap.intern_string(b"transient", Encoding::Utf8).unwrap();
    assert!(heap.is_live(second));
    assert_eq!(heap.char_bytes(second), b"transient");
    assert_eq!(heap.stats().cached_strings, 1);
}

#[test]
fn reachable_strings_stay_interned_across_levels() {
    let mut heap = Heap::new();
    let s = heap.mk_char("kept").unwrap();
    let holder = heap.allocate(ObjectKind::StringVector, 1).unwrap();
    heap.preserve(holder);
    heap.set_vector_elt(holder, 0, s).unwrap();

    for level in CollectionLevel::ALL {
        heap.request_collection(level);
        assert_eq!(heap.mk_char("kept").unwrap(), s);
    }
}

#[test]
fn symbol_names_are_never_evicted() {
    let config = HeapConfig::builder().name_mark_level(2).build().unwrap();
    let mut heap = Heap::with_config(config).unwrap();
    let sym = heap.intern_symbol(b"identity").unwrap();
    let name = heap.symbol_name(sym);

    heap.request_collection(CollectionLevel::Minor);
    heap.request_collection(CollectionLevel::Mid);
    heap.request_collection(CollectionLevel::Full);
    assert!(heap.is_live(name));
    assert_eq!(heap.intern_symbol(b"identity").unwrap(), sym);
    assert_eq!(heap.mk_char("identity").unwrap(), name);
}

proptest! {
    #[test]
    fn identical_bytes_intern_to_one_object(
        words in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..24), 1..64),
    ) {
        let config = HeapConfig::builder().string_cache_sizes(8, 64).build().unwrap();
        let mut heap = Heap::with_config(config).unwrap();
        let mut handles = Vec::new();
        for word in &words {
            let h = heap.intern_string(word, Encoding::Bytes).unwrap();
            heap.preserve(h);
            handles.push(h);
        }
        for (i, word) in words.iter().enumerate() {
            prop_assert_eq!(heap.intern_string(word, Encoding::Bytes).unwrap(), handles[i]);
            prop_assert_eq!(heap.char_bytes(handles[i]), word.as_slice());
            for (j, other) in words.iter().enumerate() {
                prop_assert_eq!(handles[i] == handles[j], word == other);
            }
        }

        let distinct: std::collections::HashSet<&Vec<u8>> = words.iter().collect();
        prop_assert_eq!(heap.stats().cached_strings, distinct.len());
    }
}
