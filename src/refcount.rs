//! Saturating reference counts and the copy-on-write protocol.
//!
//! The count is a conservative sharing oracle, not an ownership count: it
//! only ever answers "may this object be mutated in place?". Increments
//! happen when a handle is stored into a slot; decrements are opportunistic
//! and `Many` never comes back down.

use crate::error::GcResult;
use crate::handle::Handle;
use crate::header::HeaderFlags;
use crate::heap::Heap;
use crate::object::{ObjectKind, Payload};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RefCount {
    #[default]
    Zero = 0,
    One = 1,
    /// Sticky: once shared, always shared.
    Many = 2,
}

impl RefCount {
    #[inline]
    pub const fn increment(self) -> Self {
        match self {
            RefCount::Zero => RefCount::One,
            RefCount::One | RefCount::Many => RefCount::Many,
        }
    }

    #[inline]
    pub const fn decrement(self) -> Self {
        match self {
            RefCount::One | RefCount::Zero => RefCount::Zero,
            RefCount::Many => RefCount::Many,
        }
    }

    #[inline]
    pub const fn is_shared(self) -> bool {
        matches!(self, RefCount::Many)
    }
}

/// Snapshot returned by [`Heap::refcount_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefCountState {
    pub count: RefCount,
    /// Output of a task that has not finished.
    pub being_computed: bool,
    /// Input of a task that is still reading it.
    pub in_use_by_task: bool,
}

impl Heap {
    pub fn refcount(&self, h: Handle) -> RefCount {
        self.header(h).refcount
    }

    pub fn increment_refcount(&mut self, h: Handle) {
        let header = &mut self.arena.get_mut(h).header;
        header.refcount = header.refcount.increment();
    }

    pub fn decrement_refcount(&mut self, h: Handle) {
        let header = &mut self.arena.get_mut(h).header;
        header.refcount = header.refcount.decrement();
    }

    /// Reference count together with the task interlock state, as the
    /// scheduler reports it now. Task ownership is never folded into the
    /// count.
    pub fn refcount_state(&self, h: Handle) -> RefCountState {
        RefCountState {
            count: self.header(h).refcount,
            being_computed: self.tasks.is_object_pending(h),
            in_use_by_task: self.tasks.is_object_in_use(h),
        }
    }

    /// True iff nobody else can observe an in-place mutation of `h`.
    pub fn may_mutate_in_place(&self, h: Handle) -> bool {
        let state = self.refcount_state(h);
        state.count <= RefCount::One && !state.being_computed && !state.in_use_by_task
    }

    /// `h` itself if it may be mutated in place, otherwise a fresh copy with
    /// a zero count.
    pub fn duplicate_if_shared(&mut self, h: Handle) -> GcResult<Handle> {
        if self.may_mutate_in_place(h) {
            Ok(h)
        } else {
            self.duplicate(h)
        }
    }

    /// Structural copy.
    ///
    /// Waits for any task still computing `h` before reading it. Pairlists
    /// and generic vectors are copied deeply, closures shallowly.
    /// Environments, symbols, promises, byte-code, cached strings, weak
    /// references, external pointers and native functions are returned as is.
    pub fn duplicate(&mut self, h: Handle) -> GcResult<Handle> {
        let mut scope = self.protect_scope();
        scope.push_root(h)?;
        scope.duplicate_inner(h)
    }

    fn duplicate_inner(&mut self, h: Handle) -> GcResult<Handle> {
        self.await_task_output(h);
        let kind = self.kind(h);
        let copy = match kind {
            ObjectKind::Pair | ObjectKind::Language => self.duplicate_pairlist(h)?,
            ObjectKind::List | ObjectKind::Expression => self.duplicate_generic_vector(h)?,
            ObjectKind::StringVector => {
                let elements = match self.payload(h) {
                    Payload::Handles(elements) => elements.clone(),
                    _ => self.wrong_kind(h, "string vector"),
                };
                let copy = self.allocate_rooted(kind, elements.len(), &[h])?;
                for &e in &elements {
                    self.increment_refcount(e);
                }
                self.arena.get_mut(copy).payload = Payload::Handles(elements);
                copy
            }
            ObjectKind::CharString if self.flags(h).contains(HeaderFlags::CACHED) => return Ok(h),
            ObjectKind::CharString
            | ObjectKind::LogicalVector
            | ObjectKind::IntegerVector
            | ObjectKind::RealVector
            | ObjectKind::RawVector => {
                let payload = self.payload(h).clone();
                let copy = self.allocate_rooted(kind, payload.len(), &[h])?;
                self.arena.get_mut(copy).payload = payload;
                copy
            }
            ObjectKind::Closure => {
                let (formals, body, env) = self.closure_parts(h);
                self.make_closure(formals, body, env)?
            }
            ObjectKind::Free
            | ObjectKind::Nil
            | ObjectKind::Symbol
            | ObjectKind::Environment
            | ObjectKind::Promise
            | ObjectKind::ByteCode
            | ObjectKind::ExternalPtr
            | ObjectKind::WeakRef
            | ObjectKind::NativeFunction => return Ok(h),
        };

        let attrib = self.attrib(h);
        let object_bits = self.flags(h) & (HeaderFlags::OBJECT | HeaderFlags::S4_OBJECT);
        if !attrib.is_nil() {
            let mut scope = self.protect_scope();
            scope.push_root(copy)?;
            let attrib_copy = scope.duplicate_inner(attrib)?;
            scope.set_attrib(copy, attrib_copy);
        }
        self.arena.get_mut(copy).header.flags |= object_bits;
        Ok(copy)
    }

    fn duplicate_pairlist(&mut self, h: Handle) -> GcResult<Handle> {
        let mut scope = self.protect_scope();
        let head_index = scope.push_root_with_index(Handle::NIL)?;
        let mut head = Handle::NIL;
        let mut tail = Handle::NIL;
        let mut cursor = h;

        while scope.kind(cursor).is_pair_like() {
            let original = scope.car(cursor);
            let element = scope.duplicate_inner(original)?;
            let cell_kind = scope.kind(cursor);
            let tag = scope.tag(cursor);
            let cell = scope.allocate_rooted(cell_kind, 0, &[element])?;
            scope.set_car(cell, element);
            scope.set_tag(cell, tag);

            if tail.is_nil() {
                head = cell;
                scope.reprotect_at_index(head, head_index);
            } else {
                scope.set_cdr(tail, cell);
            }
            tail = cell;
            cursor = scope.cdr(cursor);
        }

        if !cursor.is_nil() && !tail.is_nil() {
            let rest = scope.duplicate_inner(cursor)?;
            scope.set_cdr(tail, rest);
        }
        Ok(head)
    }

    fn duplicate_generic_vector(&mut self, h: Handle) -> GcResult<Handle> {
        let kind = self.kind(h);
        let length = self.length(h);
        let mut scope = self.protect_scope();
        let copy = scope.allocate_rooted(kind, length, &[h])?;
        scope.push_root(copy)?;
        for i in 0..length {
            let element = scope.vector_elt(h, i)?;
            let element_copy = scope.duplicate_inner(element)?;
            scope.set_vector_elt(copy, i, element_copy)?;
        }
        Ok(copy)
    }
}
