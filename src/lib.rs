//! genheap: a generational, segmented memory manager for dynamic-language
//! runtimes.
//!
//! Objects live in a [`Heap`] and are named by compressed [`Handle`]s. The
//! heap owns everything: the segmented arena, three generations, the root
//! set, the protection stack, the symbol table, the string interning cache
//! and the weak-reference chain. Collections trace from the roots at one of
//! three levels; each level scans generations up to and including itself
//! and promotes the survivors.
//!
//! ```
//! use genheap::{CollectionLevel, Handle, Heap, ObjectKind};
//!
//! let mut heap = Heap::new();
//! let x = heap.allocate(ObjectKind::RealVector, 4)?;
//! heap.push_root(x)?;
//! let list = heap.cons(x, Handle::NIL)?;
//! heap.pop_roots(1);
//!
//! heap.preserve(list);
//! heap.request_collection(CollectionLevel::Full);
//! assert!(heap.is_live(x));
//!
//! heap.release(list);
//! let outcome = heap.request_collection(CollectionLevel::Full);
//! assert_eq!(outcome.total_freed(), 2);
//! # Ok::<(), genheap::GcError>(())
//! ```
//!
//! Mutating an object in place is only safe when nobody else can observe it;
//! see [`Heap::may_mutate_in_place`] and [`Heap::duplicate_if_shared`].

pub mod alloc;
pub mod arena;
pub mod barrier;
pub mod collector;
pub mod config;
pub mod error;
pub mod finalizer;
pub mod handle;
pub mod header;
pub mod heap;
pub mod object;
pub mod protect;
pub mod refcount;
pub mod roots;
pub mod string_cache;
pub mod symbols;
pub mod tasks;
pub mod weak;

pub use arena::{ClassUsage, NodeClass};
pub use collector::{
    CollectReason, CollectionLevel, CollectionOutcome, CollectorPhase, GenerationStats,
};
pub use config::{ConfigError, HeapConfig, HeapConfigBuilder};
pub use error::{FinalizerError, GcError, GcResult};
pub use finalizer::{Evaluator, Finalizer, NativeFinalizer, RecoveryScope};
pub use handle::Handle;
pub use header::{Generation, HeaderFlags, ObjectHeader};
pub use heap::{FreeObserver, Heap, HeapStats};
pub use object::{Encoding, ObjectKind, Payload};
pub use protect::{ProtectIndex, ProtectScope};
pub use refcount::{RefCount, RefCountState};
pub use roots::{EvalContext, RootSource, RootSourceId};
pub use tasks::{NoTasks, PendingObjects, TaskScheduler};
