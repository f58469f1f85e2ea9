//! Allocation.
//!
//! The fast path pops a cell from the node class free list and does nothing
//! else; when it cannot, it returns [`Handle::NO_OBJECT`] and the caller
//! falls through to the slow path. The slow path decides whether to
//! collect, grows the arena within the configured limits, escalates the
//! collection level when growth is impossible and, as a last resort, runs
//! pending finalizers before reporting [`GcError::OutOfMemory`].

use crate::arena::NodeClass;
use crate::collector::{CollectReason, CollectionLevel};
use crate::error::{GcError, GcResult};
use crate::finalizer::NativeFinalizer;
use crate::handle::Handle;
use crate::header::{Generation, ObjectHeader};
use crate::heap::Heap;
use crate::object::{vector_chunks, ObjectKind, Payload};

impl Heap {
    /// Allocation fast path.
    ///
    /// Returns [`Handle::NO_OBJECT`] when the request needs the slow path:
    /// the class free list is empty, a collection is due, the object is large
    /// or torture mode is on.
    #[inline]
    pub fn try_allocate_fast(&mut self, kind: ObjectKind, length: usize) -> Handle {
        if self.config.torture || !kind.is_allocatable() || self.strategy.countdown_expired() {
            return Handle::NO_OBJECT;
        }
        let class = NodeClass::for_request(kind, length);
        if class.is_large() {
            return Handle::NO_OBJECT;
        }
        if !self.arena.has_free(class) {
            return Handle::NO_OBJECT;
        }
        Payload::for_kind(kind, length)
            .and_then(|payload| self.claim_cell(class, kind, payload, 0))
            .unwrap_or(Handle::NO_OBJECT)
    }

    /// Allocate a zero-initialized object. Handle slots start as NIL.
    ///
    /// ```
    /// use genheap::{Heap, ObjectKind};
    ///
    /// let mut heap = Heap::new();
    /// let v = heap.allocate(ObjectKind::RealVector, 3)?;
    /// assert_eq!(heap.real_data(v), &[0.0, 0.0, 0.0]);
    /// # Ok::<(), genheap::GcError>(())
    /// ```
    pub fn allocate(&mut self, kind: ObjectKind, length: usize) -> GcResult<Handle> {
        self.allocate_rooted(kind, length, &[])
    }

    /// Allocate while keeping `roots` alive across any collection the
    /// allocation triggers.
    pub fn allocate_rooted(
        &mut self,
        kind: ObjectKind,
        length: usize,
        roots: &[Handle],
    ) -> GcResult<Handle> {
        if !kind.is_allocatable() {
            return Err(GcError::InvalidKind(kind));
        }
        if !kind.is_vector() && length != 0 {
            return Err(GcError::InvalidLength { kind, length });
        }
        let h = self.try_allocate_fast(kind, length);
        if !h.is_no_object() {
            return Ok(h);
        }
        self.with_transient_roots(roots, |heap| heap.allocate_slow(kind, length))
    }

    fn allocate_slow(&mut self, kind: ObjectKind, length: usize) -> GcResult<Handle> {
        let class = NodeClass::for_request(kind, length);
        let chunks = if class.is_large() {
            vector_chunks(kind, length)
        } else {
            0
        };

        let reason = if self.config.torture {
            Some(CollectReason::Torture)
        } else {
            self.strategy.trigger(chunks, self.big_chunks_live())
        };
        if let Some(reason) = reason {
            let level = self.strategy.choose_level();
            self.collect(level, reason);
        }
        // Element storage is reserved before any segment is added for it.
        let mut payload = None;
        if let Some(h) = self.take_or_grow(class, kind, length, chunks, &mut payload) {
            return Ok(h);
        }

        // No room and no growth: collect harder until something frees up.
        let mut level = self.strategy.choose_level();
        loop {
            self.collect(level, CollectReason::Exhausted);
            if let Some(h) = self.take_or_grow(class, kind, length, chunks, &mut payload) {
                return Ok(h);
            }
            match level.deeper() {
                Some(next) => level = next,
                None => break,
            }
        }

        if self.has_pending_finalizers() {
            self.run_pending_finalizers();
            self.collect(CollectionLevel::Full, CollectReason::Exhausted);
            if let Some(h) = self.take_or_grow(class, kind, length, chunks, &mut payload) {
                return Ok(h);
            }
        }

        tracing::debug!(
            target: "genheap::alloc",
            ?kind,
            length,
            reserved = payload.is_some(),
            "allocation failed after full collection"
        );
        Err(GcError::OutOfMemory { kind, length })
    }

    fn take_or_grow(
        &mut self,
        class: NodeClass,
        kind: ObjectKind,
        length: usize,
        chunks: usize,
        payload: &mut Option<Payload>,
    ) -> Option<Handle> {
        if let Some(limit) = self.config.max_vector_chunks {
            if chunks > 0 && self.big_chunks_live().saturating_add(chunks) > limit {
                return None;
            }
        }
        if payload.is_none() {
            *payload = Payload::for_kind(kind, length);
        }
        let reserved = payload.take()?;
        if !self.arena.has_free(class) {
            let within_limit = self
                .config
                .max_cells
                .map_or(true, |max| self.arena.capacity() + self.arena.segment_cells() <= max);
            if !within_limit || self.arena.add_segment(class).is_none() {
                *payload = Some(reserved);
                return None;
            }
        }
        self.claim_cell(class, kind, reserved, chunks)
    }

    /// Claim a free cell of `class`. The caller has checked the free list.
    fn claim_cell(
        &mut self,
        class: NodeClass,
        kind: ObjectKind,
        payload: Payload,
        chunks: usize,
    ) -> Option<Handle> {
        let h = self.arena.claim(class, ObjectHeader::new(kind), payload)?;
        let young = &mut self.generations[Generation::Young.index()];
        young.objects += 1;
        young.big_chunks += chunks;
        self.strategy.note_allocation();
        Some(h)
    }

    /// A new pair. `car` and `cdr` are kept alive if the allocation collects.
    pub fn cons(&mut self, car: Handle, cdr: Handle) -> GcResult<Handle> {
        self.make_pair(ObjectKind::Pair, car, cdr)
    }

    /// A new call expression cell.
    pub fn lcons(&mut self, car: Handle, cdr: Handle) -> GcResult<Handle> {
        self.make_pair(ObjectKind::Language, car, cdr)
    }

    fn make_pair(&mut self, kind: ObjectKind, car: Handle, cdr: Handle) -> GcResult<Handle> {
        let pair = self.allocate_rooted(kind, 0, &[car, cdr])?;
        self.arena.get_mut(pair).payload = Payload::Pair {
            car,
            cdr,
            tag: Handle::NIL,
        };
        self.increment_refcount(car);
        self.increment_refcount(cdr);
        Ok(pair)
    }

    pub fn make_closure(&mut self, formals: Handle, body: Handle, env: Handle) -> GcResult<Handle> {
        let closure = self.allocate_rooted(ObjectKind::Closure, 0, &[formals, body, env])?;
        self.arena.get_mut(closure).payload = Payload::Closure { formals, body, env };
        for h in [formals, body, env] {
            self.increment_refcount(h);
        }
        Ok(closure)
    }

    /// A new environment whose frame binds `names[i]` to `values[i]`.
    pub fn make_environment(
        &mut self,
        names: &[Handle],
        values: &[Handle],
        parent: Handle,
    ) -> GcResult<Handle> {
        if names.len() != values.len() {
            return Err(GcError::InvalidLength {
                kind: ObjectKind::Environment,
                length: values.len(),
            });
        }
        let mut roots = Vec::with_capacity(names.len() + values.len() + 2);
        roots.extend_from_slice(names);
        roots.extend_from_slice(values);
        roots.push(parent);

        self.with_transient_roots(&roots, |heap| {
            let mut frame = Handle::NIL;
            for (&name, &value) in names.iter().zip(values).rev() {
                let cell = heap.allocate_rooted(ObjectKind::Pair, 0, &[frame])?;
                heap.arena.get_mut(cell).payload = Payload::Pair {
                    car: value,
                    cdr: frame,
                    tag: name,
                };
                for h in [value, frame, name] {
                    heap.increment_refcount(h);
                }
                frame = cell;
            }
            let env = heap.allocate_rooted(ObjectKind::Environment, 0, &[frame])?;
            heap.arena.get_mut(env).payload = Payload::Environment {
                frame,
                enclos: parent,
            };
            heap.increment_refcount(frame);
            heap.increment_refcount(parent);
            Ok(env)
        })
    }

    /// An unforced promise of `expr` in `env`.
    pub fn make_promise(&mut self, expr: Handle, env: Handle) -> GcResult<Handle> {
        let promise = self.allocate_rooted(ObjectKind::Promise, 0, &[expr, env])?;
        self.arena.get_mut(promise).payload = Payload::Promise {
            expr,
            env,
            value: Handle::UNBOUND,
        };
        self.increment_refcount(expr);
        self.increment_refcount(env);
        Ok(promise)
    }

    pub fn make_external_ptr(
        &mut self,
        address: usize,
        tag: Handle,
        protected: Handle,
    ) -> GcResult<Handle> {
        let ptr = self.allocate_rooted(ObjectKind::ExternalPtr, 0, &[tag, protected])?;
        self.arena.get_mut(ptr).payload = Payload::ExternalPtr {
            address,
            tag,
            protected,
        };
        self.increment_refcount(tag);
        self.increment_refcount(protected);
        Ok(ptr)
    }

    pub fn make_bytecode(&mut self, code: Handle, consts: Handle) -> GcResult<Handle> {
        let bc = self.allocate_rooted(ObjectKind::ByteCode, 0, &[code, consts])?;
        self.arena.get_mut(bc).payload = Payload::ByteCode { code, consts };
        self.increment_refcount(code);
        self.increment_refcount(consts);
        Ok(bc)
    }

    /// Wrap a native function so it can serve as a finalizer object.
    pub fn make_native_function(&mut self, function: NativeFinalizer) -> GcResult<Handle> {
        let f = self.allocate(ObjectKind::NativeFunction, 0)?;
        self.arena.get_mut(f).payload = Payload::NativeFunction(function);
        Ok(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;

    #[test]
    fn fast_path_serves_small_objects() {
        let mut heap = Heap::new();
        let h = heap.try_allocate_fast(ObjectKind::Pair, 0);
        assert!(!h.is_no_object());
        assert_eq!(heap.kind(h), ObjectKind::Pair);
    }

    #[test]
    fn fast_path_declines_large_and_invalid_requests() {
        let mut heap = Heap::new();
        assert!(heap.try_allocate_fast(ObjectKind::RealVector, 1000).is_no_object());
        assert!(heap.try_allocate_fast(ObjectKind::Free, 0).is_no_object());
        let v = heap.allocate(ObjectKind::RealVector, 1000).unwrap();
        assert_eq!(heap.length(v), 1000);
        assert_eq!(heap.stats().big_chunks, 1000);
    }

    #[test]
    fn rejects_unallocatable_kinds_and_lengths() {
        let mut heap = Heap::new();
        assert_eq!(
            heap.allocate(ObjectKind::Free, 0),
            Err(GcError::InvalidKind(ObjectKind::Free))
        );
        assert_eq!(
            heap.allocate(ObjectKind::Nil, 0),
            Err(GcError::InvalidKind(ObjectKind::Nil))
        );
        assert_eq!(
            heap.allocate(ObjectKind::Pair, 3),
            Err(GcError::InvalidLength {
                kind: ObjectKind::Pair,
                length: 3
            })
        );
    }

    #[test]
    fn arena_grows_when_free_list_empties() {
        let config = HeapConfig::builder().segment_cells(8).build().unwrap();
        let mut heap = Heap::with_config(config).unwrap();
        let mut scope = heap.protect_scope();
        for _ in 0..20 {
            let h = scope.cons(Handle::NIL, Handle::NIL).unwrap();
            scope.push_root(h).unwrap();
        }
        assert!(scope.stats().classes[0].segments >= 3);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let config = HeapConfig::builder()
            .segment_cells(16)
            .max_cells(16)
            .build()
            .unwrap();
        let mut heap = Heap::with_config(config).unwrap();
        let mut scope = heap.protect_scope();
        let mut result = Ok(Handle::NIL);
        for _ in 0..32 {
            result = scope.cons(Handle::NIL, Handle::NIL);
            match result {
                Ok(h) => scope.push_root(h).unwrap(),
                Err(_) => break,
            }
        }
        assert_eq!(
            result,
            Err(GcError::OutOfMemory {
                kind: ObjectKind::Pair,
                length: 0
            })
        );
        assert!(scope.stats().collections[2] >= 1);
    }

    #[test]
    fn exhaustion_recovers_garbage_before_failing() {
        let config = HeapConfig::builder()
            .segment_cells(16)
            .max_cells(16)
            .build()
            .unwrap();
        let mut heap = Heap::with_config(config).unwrap();
        for _ in 0..100 {
            heap.cons(Handle::NIL, Handle::NIL).unwrap();
        }
        assert!(heap.stats().collections.iter().sum::<u64>() > 0);
    }

    #[test]
    fn vector_chunk_limit_is_enforced() {
        let config = HeapConfig::builder().max_vector_chunks(100).build().unwrap();
        let mut heap = Heap::with_config(config).unwrap();
        let kept = heap.allocate(ObjectKind::RealVector, 80).unwrap();
        heap.preserve(kept);
        assert_eq!(
            heap.allocate(ObjectKind::RealVector, 40),
            Err(GcError::OutOfMemory {
                kind: ObjectKind::RealVector,
                length: 40
            })
        );
        heap.release(kept);
        assert!(heap.allocate(ObjectKind::RealVector, 40).is_ok());
    }

    #[test]
    fn constructors_fill_fields() {
        let mut heap = Heap::new();
        let mut scope = heap.protect_scope();
        let body = scope.allocate(ObjectKind::IntegerVector, 1).unwrap();
        scope.push_root(body).unwrap();
        let env = scope.make_environment(&[], &[], Handle::NIL).unwrap();
        scope.push_root(env).unwrap();

        let closure = scope.make_closure(Handle::NIL, body, env).unwrap();
        assert_eq!(scope.closure_parts(closure), (Handle::NIL, body, env));

        let promise = scope.make_promise(body, env).unwrap();
        assert_eq!(scope.promise_value(promise), Handle::UNBOUND);
        scope.set_promise_value(promise, body);
        assert_eq!(scope.promise_value(promise), body);

        let ptr = scope.make_external_ptr(0xdead, Handle::NIL, body).unwrap();
        assert_eq!(scope.external_address(ptr), 0xdead);
    }

    #[test]
    fn environments_bind_names_in_order() {
        let mut heap = Heap::new();
        let a = heap.intern_symbol(b"a").unwrap();
        let b = heap.intern_symbol(b"b").unwrap();
        let va = heap.allocate(ObjectKind::IntegerVector, 1).unwrap();
        heap.push_root(va).unwrap();
        let vb = heap.allocate(ObjectKind::IntegerVector, 2).unwrap();
        heap.push_root(vb).unwrap();

        let env = heap.make_environment(&[a, b], &[va, vb], Handle::NIL).unwrap();
        assert_eq!(heap.find_var_in_frame(env, a), Some(va));
        assert_eq!(heap.find_var_in_frame(env, b), Some(vb));
        assert!(matches!(
            heap.make_environment(&[a], &[], Handle::NIL),
            Err(GcError::InvalidLength { .. })
        ));
        heap.pop_roots(2);
    }
}
