//! The heap context.
//!
//! [`Heap`] owns every piece of collector state: the arena, generation
//! counts, the collection strategy, roots, the symbol table, the string
//! cache and the weak-reference chain. Nothing lives in globals, so several
//! heaps can coexist in one process. The operations are spread over the
//! other modules as `impl Heap` blocks, one per concern.

use std::sync::Arc;
use std::time::Duration;

use crate::arena::{Arena, ClassUsage, NodeClass, NUM_NODE_CLASSES};
use crate::collector::{CollectionStrategy, CollectorCounters, GenerationStats};
use crate::config::HeapConfig;
use crate::error::{invariant_violation, GcResult};
use crate::finalizer::{Evaluator, FinalizerState};
use crate::handle::Handle;
use crate::header::{Generation, HeaderFlags, ObjectHeader};
use crate::object::{Encoding, ObjectKind, Payload};
use crate::protect::ProtectStack;
use crate::refcount::RefCount;
use crate::roots::RootSet;
use crate::string_cache::StringCache;
use crate::symbols::SymbolTable;
use crate::tasks::{NoTasks, TaskScheduler};
use crate::weak::WeakChain;

/// Callback fired once for every object the sweep reclaims.
pub type FreeObserver = Box<dyn FnMut(Handle, ObjectKind)>;

pub struct Heap {
    pub(crate) config: HeapConfig,
    pub(crate) arena: Arena,
    pub(crate) generations: [GenerationStats; Generation::COUNT],
    pub(crate) strategy: CollectionStrategy,
    pub(crate) protect: ProtectStack,
    pub(crate) roots: RootSet,
    pub(crate) symbols: SymbolTable,
    pub(crate) strings: StringCache,
    pub(crate) remembered: Vec<Handle>,
    pub(crate) weak: WeakChain,
    pub(crate) finalizers: FinalizerState,
    pub(crate) tasks: Arc<dyn TaskScheduler>,
    pub(crate) evaluator: Option<Box<dyn Evaluator>>,
    pub(crate) free_observer: Option<FreeObserver>,
    pub(crate) collecting: bool,
    pub(crate) counters: CollectorCounters,
}

/// Point-in-time heap statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapStats {
    /// Segments, cells and live objects per node class.
    pub classes: [ClassUsage; NUM_NODE_CLASSES],
    pub live_objects: usize,
    pub capacity: usize,
    /// Live large-vector storage in 8-byte chunks.
    pub big_chunks: usize,
    pub generations: [GenerationStats; Generation::COUNT],
    /// Completed collections per level.
    pub collections: [u64; 3],
    /// Smoothed fraction of each generation recovered by recent collections.
    pub recovery: [f64; 3],
    pub finalizers_run: u64,
    pub finalizer_failures: u64,
    pub pending_finalizers: usize,
    pub weak_refs: usize,
    pub cached_strings: usize,
    pub string_buckets: usize,
    pub remembered: usize,
    pub protect_depth: usize,
    pub task_waits: u64,
    pub gc_time: Duration,
}

impl Heap {
    /// A heap with the default configuration.
    pub fn new() -> Self {
        Self::build(HeapConfig::default())
    }

    /// A heap with a validated configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use genheap::{Heap, HeapConfig};
    ///
    /// let config = HeapConfig::builder().segment_cells(128).build()?;
    /// let heap = Heap::with_config(config)?;
    /// assert_eq!(heap.stats().live_objects, 2);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn with_config(config: HeapConfig) -> GcResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: HeapConfig) -> Self {
        let mut heap = Heap {
            arena: Arena::new(config.segment_cells),
            generations: Default::default(),
            strategy: CollectionStrategy::new(&config),
            protect: ProtectStack::new(config.protect_stack_size, config.protect_red_zone),
            roots: RootSet::default(),
            symbols: SymbolTable::default(),
            strings: StringCache::new(
                config.string_cache_initial_size,
                config.string_cache_max_size,
            ),
            remembered: Vec::new(),
            weak: WeakChain::default(),
            finalizers: FinalizerState::default(),
            tasks: Arc::new(NoTasks),
            evaluator: None,
            free_observer: None,
            collecting: false,
            counters: CollectorCounters::default(),
            config,
        };
        heap.install_permanent_objects();
        heap
    }

    fn install_permanent_objects(&mut self) {
        if self.arena.add_segment(NodeClass::FIXED).is_none() {
            invariant_violation("cannot create the first segment");
        }
        let permanent = [
            (ObjectKind::Nil, Payload::Nil, Handle::NIL),
            (
                ObjectKind::Symbol,
                Payload::Symbol {
                    name: Handle::NIL,
                    value: Handle::UNBOUND,
                    internal: Handle::NIL,
                    last_env: Handle::NIL,
                },
                Handle::UNBOUND,
            ),
        ];
        for (kind, payload, expected) in permanent {
            let header = ObjectHeader {
                kind,
                generation: Generation::Old,
                flags: HeaderFlags::PERMANENT,
                refcount: RefCount::Many,
            };
            match self.arena.claim(NodeClass::FIXED, header, payload) {
                Some(h) if h == expected => {
                    self.generations[Generation::Old.index()].objects += 1;
                }
                _ => invariant_violation("permanent objects landed at unexpected handles"),
            }
        }
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Install the callback that observes every reclaimed object.
    pub fn set_free_observer(&mut self, observer: impl FnMut(Handle, ObjectKind) + 'static) {
        self.free_observer = Some(Box::new(observer));
    }

    pub fn clear_free_observer(&mut self) {
        self.free_observer = None;
    }

    // ---- introspection ----

    /// Whether `h` names a live (allocated) object.
    pub fn is_live(&self, h: Handle) -> bool {
        self.arena.contains(h)
    }

    pub fn kind(&self, h: Handle) -> ObjectKind {
        self.arena.get(h).kind()
    }

    pub fn header(&self, h: Handle) -> &ObjectHeader {
        &self.arena.get(h).header
    }

    pub fn generation(&self, h: Handle) -> Generation {
        self.arena.get(h).header.generation
    }

    pub fn flags(&self, h: Handle) -> HeaderFlags {
        self.arena.get(h).header.flags
    }

    pub fn payload(&self, h: Handle) -> &Payload {
        &self.arena.get(h).payload
    }

    pub fn attrib(&self, h: Handle) -> Handle {
        let cell = self.arena.get(h);
        // The slot of a cached string is its chain link, not an attribute.
        if cell.header.flags.contains(HeaderFlags::CACHED) {
            Handle::NIL
        } else {
            cell.attrib
        }
    }

    /// Element count of a vector, zero for everything else.
    pub fn length(&self, h: Handle) -> usize {
        self.payload(h).len()
    }

    pub fn car(&self, h: Handle) -> Handle {
        self.pair_fields(h).0
    }

    pub fn cdr(&self, h: Handle) -> Handle {
        self.pair_fields(h).1
    }

    pub fn tag(&self, h: Handle) -> Handle {
        self.pair_fields(h).2
    }

    fn pair_fields(&self, h: Handle) -> (Handle, Handle, Handle) {
        match self.payload(h) {
            Payload::Pair { car, cdr, tag } => (*car, *cdr, *tag),
            Payload::Nil => (Handle::NIL, Handle::NIL, Handle::NIL),
            _ => self.wrong_kind(h, "pair"),
        }
    }

    /// Number of cells along the cdr chain of `list`.
    pub fn list_length(&self, list: Handle) -> usize {
        let mut length = 0;
        let mut cursor = list;
        while self.kind(cursor).is_pair_like() {
            length += 1;
            cursor = self.cdr(cursor);
        }
        length
    }

    pub fn vector_elt(&self, h: Handle, index: usize) -> GcResult<Handle> {
        match self.payload(h) {
            Payload::Handles(elements) => {
                elements
                    .get(index)
                    .copied()
                    .ok_or(crate::GcError::IndexOutOfBounds {
                        index,
                        length: elements.len(),
                    })
            }
            _ => self.wrong_kind(h, "handle vector"),
        }
    }

    pub fn char_bytes(&self, h: Handle) -> &[u8] {
        match self.payload(h) {
            Payload::CharString { bytes, .. } => bytes,
            _ => self.wrong_kind(h, "char string"),
        }
    }

    pub fn encoding(&self, h: Handle) -> Encoding {
        match self.payload(h) {
            Payload::CharString { encoding, .. } => *encoding,
            _ => self.wrong_kind(h, "char string"),
        }
    }

    pub fn real_data(&self, h: Handle) -> &[f64] {
        match self.payload(h) {
            Payload::Real(data) => data,
            _ => self.wrong_kind(h, "real vector"),
        }
    }

    pub fn real_data_mut(&mut self, h: Handle) -> &mut [f64] {
        match &mut self.arena.get_mut(h).payload {
            Payload::Real(data) => data,
            other => invariant_violation(&format!("{h:?} is not a real vector: {other:?}")),
        }
    }

    pub fn integer_data(&self, h: Handle) -> &[i32] {
        match self.payload(h) {
            Payload::Integer(data) | Payload::Logical(data) => data,
            _ => self.wrong_kind(h, "integer or logical vector"),
        }
    }

    pub fn integer_data_mut(&mut self, h: Handle) -> &mut [i32] {
        match &mut self.arena.get_mut(h).payload {
            Payload::Integer(data) | Payload::Logical(data) => data,
            other => invariant_violation(&format!("{h:?} is not an integer vector: {other:?}")),
        }
    }

    pub fn raw_data(&self, h: Handle) -> &[u8] {
        match self.payload(h) {
            Payload::Raw(data) => data,
            _ => self.wrong_kind(h, "raw vector"),
        }
    }

    pub fn closure_parts(&self, h: Handle) -> (Handle, Handle, Handle) {
        match self.payload(h) {
            Payload::Closure { formals, body, env } => (*formals, *body, *env),
            _ => self.wrong_kind(h, "closure"),
        }
    }

    pub fn env_enclos(&self, h: Handle) -> Handle {
        match self.payload(h) {
            Payload::Environment { enclos, .. } => *enclos,
            _ => self.wrong_kind(h, "environment"),
        }
    }

    pub fn promise_value(&self, h: Handle) -> Handle {
        match self.payload(h) {
            Payload::Promise { value, .. } => *value,
            _ => self.wrong_kind(h, "promise"),
        }
    }

    pub fn external_address(&self, h: Handle) -> usize {
        match self.payload(h) {
            Payload::ExternalPtr { address, .. } => *address,
            _ => self.wrong_kind(h, "external pointer"),
        }
    }

    #[cold]
    pub(crate) fn wrong_kind(&self, h: Handle, expected: &str) -> ! {
        invariant_violation(&format!(
            "{h:?} is a {:?}, expected {expected}",
            self.kind(h)
        ))
    }

    pub fn stats(&self) -> HeapStats {
        let mut classes = [ClassUsage::default(); NUM_NODE_CLASSES];
        for class in NodeClass::all() {
            classes[class.index()] = self.arena.usage(class);
        }
        HeapStats {
            classes,
            live_objects: self.arena.live_cells(),
            capacity: self.arena.capacity(),
            big_chunks: self.big_chunks_live(),
            generations: self.generations,
            collections: self.counters.collections,
            recovery: self.strategy.recovery(),
            finalizers_run: self.finalizers.run,
            finalizer_failures: self.finalizers.failed,
            pending_finalizers: self.pending_finalizer_count(),
            weak_refs: self.weak.len,
            cached_strings: self.strings.entries(),
            string_buckets: self.strings.bucket_count(),
            remembered: self.remembered.len(),
            protect_depth: self.protect.depth(),
            task_waits: self.counters.task_waits,
            gc_time: self.counters.total_time,
        }
    }

    pub(crate) fn big_chunks_live(&self) -> usize {
        self.generations.iter().map(|g| g.big_chunks).sum()
    }

    /// Run every exit finalizer and consume the heap.
    pub fn shutdown(mut self) {
        self.run_exit_finalizers();
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if !self.finalizers.exit_done {
            self.run_exit_finalizers();
        }
    }
}
