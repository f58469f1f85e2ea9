//! Finalizer scheduling.
//!
//! A collection only flags weak records as ready; finalizers run afterwards,
//! from [`Heap::run_pending_finalizers`]. Each record is unlinked from the
//! weak chain before its finalizer is invoked, so a finalizer runs at most
//! once even if it allocates and triggers another collection. Every run
//! happens inside a [`RecoveryScope`] so that a failing finalizer cannot
//! leave stray protection entries, contexts or byte-code frames behind.

use std::panic::{self, AssertUnwindSafe};

use crate::error::{invariant_violation, FinalizerError, GcResult};
use crate::handle::Handle;
use crate::header::HeaderFlags;
use crate::heap::Heap;
use crate::object::{ObjectKind, Payload};

/// Native finalizer: invoked directly with the key, never through the
/// evaluator.
pub type NativeFinalizer = fn(&mut Heap, Handle) -> Result<(), FinalizerError>;

/// Finalizer attached by [`Heap::register_finalizer`].
#[derive(Debug, Clone, Copy)]
pub enum Finalizer {
    Native(NativeFinalizer),
    /// Interpreted closure, applied through the installed [`Evaluator`].
    Closure(Handle),
}

/// The evaluator side of finalization: applies an interpreted finalizer
/// closure to its key.
pub trait Evaluator {
    fn apply_finalizer(
        &mut self,
        heap: &mut Heap,
        finalizer: Handle,
        key: Handle,
    ) -> Result<(), FinalizerError>;
}

#[derive(Debug, Default)]
pub(crate) struct FinalizerState {
    pub running: bool,
    pub run: u64,
    pub failed: u64,
    pub exit_done: bool,
}

/// Saved control state around one finalizer run.
///
/// Entering records the depths of the protection stack, the context stack,
/// the byte-code stack and the transient roots; leaving cuts all of them
/// back, whatever the finalizer did in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryScope {
    protect: usize,
    contexts: usize,
    bytecode: usize,
    transient: usize,
}

impl RecoveryScope {
    pub fn enter(heap: &Heap) -> Self {
        Self {
            protect: heap.protect.depth(),
            contexts: heap.context_depth(),
            bytecode: heap.bytecode_depth(),
            transient: heap.roots.transient.len(),
        }
    }

    /// Restore the saved depths. Returns true if anything had to be unwound.
    pub fn leave(self, heap: &mut Heap) -> bool {
        let unwound = heap.protect.depth() != self.protect
            || heap.context_depth() != self.contexts
            || heap.bytecode_depth() != self.bytecode
            || heap.roots.transient.len() != self.transient;
        if heap.protect.depth() < self.protect {
            invariant_violation("protection stack popped below a recovery scope");
        }
        heap.protect.truncate(self.protect);
        heap.truncate_contexts(self.contexts);
        heap.truncate_bytecode(self.bytecode);
        heap.roots.transient.truncate(self.transient);
        unwound
    }
}

impl Heap {
    pub fn set_evaluator(&mut self, evaluator: impl Evaluator + 'static) {
        self.evaluator = Some(Box::new(evaluator));
    }

    /// Run `finalizer` once `key` becomes unreachable. With `on_exit` it also
    /// runs at heap shutdown if `key` is still alive then.
    ///
    /// Returns the weak record that carries the registration.
    ///
    /// ```
    /// use genheap::{CollectionLevel, Finalizer, FinalizerError, Handle, Heap};
    ///
    /// fn close(_heap: &mut Heap, _key: Handle) -> Result<(), FinalizerError> {
    ///     Ok(())
    /// }
    ///
    /// let mut heap = Heap::new();
    /// let key = heap.make_external_ptr(0x1000, Handle::NIL, Handle::NIL)?;
    /// heap.register_finalizer(key, Finalizer::Native(close), false)?;
    /// heap.request_collection(CollectionLevel::Full);
    /// assert_eq!(heap.stats().finalizers_run, 1);
    /// # Ok::<(), genheap::GcError>(())
    /// ```
    pub fn register_finalizer(
        &mut self,
        key: Handle,
        finalizer: Finalizer,
        on_exit: bool,
    ) -> GcResult<Handle> {
        let mut scope = self.protect_scope();
        scope.push_root(key)?;
        let function = match finalizer {
            Finalizer::Native(f) => scope.make_native_function(f)?,
            Finalizer::Closure(closure) => closure,
        };
        scope.push_root(function)?;
        scope.make_weak_ref(key, Handle::NIL, function, on_exit)
    }

    pub fn has_pending_finalizers(&self) -> bool {
        self.pending_finalizer_count() > 0
    }

    /// Weak records flagged ready whose finalizer has not run yet.
    pub fn pending_finalizer_count(&self) -> usize {
        self.weak_records()
            .into_iter()
            .filter(|&r| self.flags(r).contains(HeaderFlags::READY_TO_FINALIZE))
            .count()
    }

    /// Run the finalizers of every ready weak record. Returns how many ran.
    ///
    /// Calls made while finalizers are already running return 0 immediately;
    /// records made ready by collections inside a finalizer are picked up by
    /// the outer call.
    pub fn run_pending_finalizers(&mut self) -> usize {
        if self.finalizers.running {
            return 0;
        }
        self.finalizers.running = true;
        let mut ran = 0;
        loop {
            let mut found = false;
            let mut prev = Handle::NIL;
            let mut cursor = self.weak.head;
            while !cursor.is_nil() {
                let fields = self.chain_fields(cursor);
                if !self.flags(cursor).contains(HeaderFlags::READY_TO_FINALIZE) {
                    prev = cursor;
                    cursor = fields.next;
                    continue;
                }
                found = true;
                self.unlink_weak_ref(cursor, prev);
                cursor = fields.next;
                if fields.finalizer.is_nil() {
                    continue;
                }
                let outcome = self.with_transient_roots(&[fields.key, fields.finalizer], |heap| {
                    let scope = RecoveryScope::enter(heap);
                    let outcome = heap.invoke_finalizer(fields.finalizer, fields.key);
                    if scope.leave(heap) {
                        tracing::debug!(
                            target: "genheap::finalizer",
                            "unwound state left by finalizer"
                        );
                    }
                    outcome
                });
                ran += 1;
                self.finalizers.run += 1;
                if let Err(err) = outcome {
                    self.finalizers.failed += 1;
                    tracing::warn!(
                        target: "genheap::finalizer",
                        key = ?fields.key,
                        error = %err,
                        "finalizer failed"
                    );
                }
            }
            if !found {
                break;
            }
        }
        self.finalizers.running = false;
        ran
    }

    fn invoke_finalizer(&mut self, function: Handle, key: Handle) -> Result<(), FinalizerError> {
        match self.kind(function) {
            ObjectKind::NativeFunction => {
                let native = match self.payload(function) {
                    Payload::NativeFunction(native) => *native,
                    _ => self.wrong_kind(function, "native function"),
                };
                contain_panic(|| native(self, key))
            }
            ObjectKind::Closure => {
                let Some(mut evaluator) = self.evaluator.take() else {
                    return Err(FinalizerError::new(
                        "no evaluator installed for a closure finalizer",
                    ));
                };
                let outcome = contain_panic(|| evaluator.apply_finalizer(self, function, key));
                // The finalizer may have installed a replacement.
                if self.evaluator.is_none() {
                    self.evaluator = Some(evaluator);
                }
                outcome
            }
            other => invariant_violation(&format!("finalizer {function:?} is a {other:?}")),
        }
    }

    /// Flag every record registered with `on_exit` as ready and run all
    /// pending finalizers. Runs once per heap; dropping the heap calls it.
    pub fn run_exit_finalizers(&mut self) -> usize {
        if self.finalizers.exit_done {
            return 0;
        }
        for record in self.weak_records() {
            let flags = &mut self.arena.get_mut(record).header.flags;
            if flags.contains(HeaderFlags::FINALIZE_ON_EXIT) {
                flags.insert(HeaderFlags::READY_TO_FINALIZE);
            }
        }
        let ran = self.run_pending_finalizers();
        self.finalizers.exit_done = true;
        tracing::debug!(target: "genheap::finalizer", ran, "exit finalizers done");
        ran
    }
}

/// A panicking finalizer is reported as a failed one.
fn contain_panic(f: impl FnOnce() -> Result<(), FinalizerError>) -> Result<(), FinalizerError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(FinalizerError::from_panic(payload)))
}
