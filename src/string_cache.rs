//! Char string interning cache.
//!
//! Open chaining over a power-of-two bucket array. The chain link of a
//! cached string lives in its attribute slot, which the marker skips for
//! cached objects, so the cache never keeps a string alive by itself.
//! Entries leave the cache from the sweep, right before their cell is
//! released, unless the string is the print name of a symbol.

use std::hash::{BuildHasher, Hash, Hasher};

use ahash::RandomState;

use crate::collector::FreeDecision;
use crate::error::{invariant_violation, GcResult};
use crate::handle::Handle;
use crate::header::HeaderFlags;
use crate::heap::Heap;
use crate::object::{Encoding, ObjectKind, Payload};

/// Entries per bucket above which the table doubles.
const LOAD_FACTOR: f64 = 0.85;

pub(crate) struct StringCache {
    buckets: Vec<Handle>,
    entries: usize,
    max_size: usize,
    hasher: RandomState,
}

impl StringCache {
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        Self {
            buckets: vec![Handle::NIL; initial_size.max(1)],
            entries: 0,
            max_size: max_size.max(initial_size),
            // Fixed seeds keep bucket order reproducible across runs.
            hasher: RandomState::with_seeds(0x6765_6e68, 0x6561_7073, 0x7472_696e, 0x6763_6163),
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn hash(&self, bytes: &[u8], encoding: Encoding) -> u32 {
        let mut state = self.hasher.build_hasher();
        bytes.hash(&mut state);
        encoding.hash(&mut state);
        state.finish() as u32
    }

    #[inline]
    fn bucket_index(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    fn needs_growth(&self) -> bool {
        self.buckets.len() < self.max_size
            && (self.entries + 1) as f64 > self.buckets.len() as f64 * LOAD_FACTOR
    }
}

impl Heap {
    /// The cached char string with these bytes and encoding, allocating and
    /// caching one if there is none.
    ///
    /// ASCII contents make the encoding irrelevant (except for
    /// [`Encoding::Bytes`]), so `"abc"` interned as UTF-8 and as Latin-1 is
    /// one object.
    ///
    /// ```
    /// use genheap::{Encoding, Heap};
    ///
    /// let mut heap = Heap::new();
    /// let a = heap.intern_string(b"abc", Encoding::Utf8)?;
    /// let b = heap.intern_string(b"abc", Encoding::Latin1)?;
    /// assert_eq!(a, b);
    /// # Ok::<(), genheap::GcError>(())
    /// ```
    pub fn intern_string(&mut self, bytes: &[u8], encoding: Encoding) -> GcResult<Handle> {
        let ascii = bytes.is_ascii();
        let encoding = encoding.normalize(ascii);
        let hash = self.strings.hash(bytes, encoding);
        if let Some(found) = self.lookup_cached_string(bytes, encoding, hash) {
            return Ok(found);
        }

        let h = self.allocate(ObjectKind::CharString, bytes.len())?;
        let cell = self.arena.get_mut(h);
        cell.payload = Payload::CharString {
            bytes: bytes.into(),
            encoding,
            hash,
        };
        cell.header.flags |= HeaderFlags::CACHED;
        if ascii {
            cell.header.flags |= HeaderFlags::ASCII;
        }

        if self.strings.needs_growth() {
            self.grow_string_cache();
        }
        let bucket = self.strings.bucket_index(hash);
        self.arena.get_mut(h).attrib = self.strings.buckets[bucket];
        self.strings.buckets[bucket] = h;
        self.strings.entries += 1;
        Ok(h)
    }

    /// Intern UTF-8 text.
    pub fn mk_char(&mut self, text: &str) -> GcResult<Handle> {
        self.intern_string(text.as_bytes(), Encoding::Utf8)
    }

    pub fn is_cached_string(&self, h: Handle) -> bool {
        self.kind(h) == ObjectKind::CharString && self.flags(h).contains(HeaderFlags::CACHED)
    }

    fn lookup_cached_string(&self, bytes: &[u8], encoding: Encoding, hash: u32) -> Option<Handle> {
        let mut cursor = self.strings.buckets[self.strings.bucket_index(hash)];
        while !cursor.is_nil() {
            let cell = self.arena.get(cursor);
            if let Payload::CharString {
                bytes: cached,
                encoding: cached_encoding,
                hash: cached_hash,
            } = &cell.payload
            {
                if *cached_hash == hash && *cached_encoding == encoding && cached[..] == *bytes {
                    return Some(cursor);
                }
            }
            cursor = cell.attrib;
        }
        None
    }

    fn cached_hash(&self, h: Handle) -> u32 {
        match self.payload(h) {
            Payload::CharString { hash, .. } => *hash,
            _ => self.wrong_kind(h, "cached char string"),
        }
    }

    /// Double the bucket array (up to the configured ceiling) and relink
    /// every entry. The strings themselves stay where they are.
    fn grow_string_cache(&mut self) {
        let new_size = (self.strings.buckets.len() * 2).min(self.strings.max_size);
        let old = std::mem::replace(&mut self.strings.buckets, vec![Handle::NIL; new_size]);
        for head in old {
            let mut cursor = head;
            while !cursor.is_nil() {
                let next = self.arena.get(cursor).attrib;
                let bucket = self.strings.bucket_index(self.cached_hash(cursor));
                self.arena.get_mut(cursor).attrib = self.strings.buckets[bucket];
                self.strings.buckets[bucket] = cursor;
                cursor = next;
            }
        }
        tracing::debug!(
            target: "genheap::strings",
            buckets = new_size,
            entries = self.strings.entries,
            "string cache resized"
        );
    }

    /// Called by the sweep for an unmarked cached string.
    pub(crate) fn evict_cached_string(&mut self, h: Handle, flags: HeaderFlags) -> FreeDecision {
        if flags.contains(HeaderFlags::SYMBOL_NAME) {
            return FreeDecision::Keep;
        }
        let bucket = self.strings.bucket_index(self.cached_hash(h));
        let next = self.arena.get(h).attrib;
        if self.strings.buckets[bucket] == h {
            self.strings.buckets[bucket] = next;
        } else {
            let mut cursor = self.strings.buckets[bucket];
            loop {
                if cursor.is_nil() {
                    invariant_violation(&format!("cached string {h:?} missing from its bucket"));
                }
                let link = self.arena.get(cursor).attrib;
                if link == h {
                    self.arena.get_mut(cursor).attrib = next;
                    break;
                }
                cursor = link;
            }
        }
        self.strings.entries -= 1;
        FreeDecision::Reclaim
    }
}
