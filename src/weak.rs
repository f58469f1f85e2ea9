//! Weak references.
//!
//! A weak record holds a key, a value and an optional finalizer without
//! keeping any of them alive on its own. Records sit on a chain owned by the
//! heap. During a collection the chain is resolved by a fixpoint: the value
//! and finalizer of every record with a reachable key are marked, repeating
//! until nothing changes, because marking one record's value can make
//! another record's key reachable. Records whose keys are still unreachable
//! afterwards become ready to finalize, and their key, value and finalizer
//! are kept alive until the finalizer has run.

use crate::collector::Marker;
use crate::error::{invariant_violation, GcError, GcResult};
use crate::handle::Handle;
use crate::header::HeaderFlags;
use crate::heap::Heap;
use crate::object::{ObjectKind, Payload};

#[derive(Debug, Clone, Copy)]
pub(crate) struct WeakChain {
    pub head: Handle,
    pub len: usize,
}

impl Default for WeakChain {
    fn default() -> Self {
        Self {
            head: Handle::NIL,
            len: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WeakFields {
    pub key: Handle,
    pub value: Handle,
    pub finalizer: Handle,
    pub next: Handle,
}

impl Heap {
    /// Create a weak record and link it onto the chain.
    ///
    /// `finalizer` is NIL, a closure or a native function object. With
    /// `finalize_on_exit` the finalizer also runs when the heap shuts down
    /// if the key is still alive then.
    pub fn make_weak_ref(
        &mut self,
        key: Handle,
        value: Handle,
        finalizer: Handle,
        finalize_on_exit: bool,
    ) -> GcResult<Handle> {
        if !finalizer.is_nil()
            && !matches!(
                self.kind(finalizer),
                ObjectKind::Closure | ObjectKind::NativeFunction
            )
        {
            return Err(GcError::InvalidKind(self.kind(finalizer)));
        }
        let record = self.allocate_rooted(ObjectKind::WeakRef, 0, &[key, value, finalizer])?;
        self.arena.get_mut(record).payload = Payload::WeakRef {
            key,
            value,
            finalizer,
            next: self.weak.head,
        };
        if finalize_on_exit {
            self.arena.get_mut(record).header.flags |= HeaderFlags::FINALIZE_ON_EXIT;
        }
        self.weak.head = record;
        self.weak.len += 1;
        Ok(record)
    }

    /// Key of a weak record; NIL once the record has been finalized.
    pub fn weak_ref_key(&self, record: Handle) -> GcResult<Handle> {
        self.weak_fields(record).map(|f| f.key)
    }

    /// Value of a weak record; NIL once the record has been finalized.
    pub fn weak_ref_value(&self, record: Handle) -> GcResult<Handle> {
        self.weak_fields(record).map(|f| f.value)
    }

    pub fn weak_ref_count(&self) -> usize {
        self.weak.len
    }

    pub(crate) fn weak_fields(&self, record: Handle) -> GcResult<WeakFields> {
        match self.payload(record) {
            Payload::WeakRef {
                key,
                value,
                finalizer,
                next,
            } => Ok(WeakFields {
                key: *key,
                value: *value,
                finalizer: *finalizer,
                next: *next,
            }),
            _ => Err(GcError::NotAWeakReference),
        }
    }

    pub(crate) fn chain_fields(&self, record: Handle) -> WeakFields {
        match self.weak_fields(record) {
            Ok(fields) => fields,
            Err(_) => invariant_violation(&format!("weak chain holds non-record {record:?}")),
        }
    }

    pub(crate) fn weak_records(&self) -> Vec<Handle> {
        let mut records = Vec::with_capacity(self.weak.len);
        let mut cursor = self.weak.head;
        while !cursor.is_nil() {
            records.push(cursor);
            cursor = self.chain_fields(cursor).next;
        }
        if records.len() != self.weak.len {
            invariant_violation("weak chain length does not match its count");
        }
        records
    }

    /// Remove `record` from the chain and clear its fields.
    ///
    /// `prev` is the record expected to precede it, NIL for the head. A
    /// stale guess falls back to a search from the head.
    pub(crate) fn unlink_weak_ref(&mut self, record: Handle, prev: Handle) {
        let next = self.chain_fields(record).next;
        let prev = self.weak_predecessor(record, prev);
        if prev.is_nil() {
            self.weak.head = next;
        } else if let Payload::WeakRef { next: link, .. } = &mut self.arena.get_mut(prev).payload {
            *link = next;
        }
        let cell = self.arena.get_mut(record);
        cell.payload = Payload::WeakRef {
            key: Handle::NIL,
            value: Handle::NIL,
            finalizer: Handle::NIL,
            next: Handle::NIL,
        };
        cell.header
            .flags
            .remove(HeaderFlags::READY_TO_FINALIZE | HeaderFlags::FINALIZE_ON_EXIT);
        self.weak.len -= 1;
    }

    fn weak_predecessor(&self, record: Handle, hint: Handle) -> Handle {
        let after = |h: Handle| {
            if h.is_nil() {
                self.weak.head
            } else {
                self.chain_fields(h).next
            }
        };
        if after(hint) == record {
            return hint;
        }
        let mut prev = Handle::NIL;
        let mut cursor = self.weak.head;
        while cursor != record {
            if cursor.is_nil() {
                invariant_violation("weak record missing from its chain");
            }
            prev = cursor;
            cursor = self.chain_fields(cursor).next;
        }
        prev
    }

    /// Resolve weak records against the current marks. Returns how many
    /// records became ready to finalize.
    pub(crate) fn process_weak_refs(&mut self, marker: &mut Marker) -> usize {
        let records = self.weak_records();
        for &record in &records {
            marker.mark(&mut self.arena, record);
        }
        marker.drain(&mut self.arena);

        loop {
            let mut changed = false;
            for &record in &records {
                if self.arena.get(record).header.flags.contains(HeaderFlags::READY_TO_FINALIZE) {
                    continue;
                }
                let fields = self.chain_fields(record);
                if marker.is_marked(&self.arena, fields.key) {
                    changed |= marker.mark(&mut self.arena, fields.value);
                    changed |= marker.mark(&mut self.arena, fields.finalizer);
                }
            }
            marker.drain(&mut self.arena);
            if !changed {
                break;
            }
        }

        let mut newly_ready = 0;
        for &record in &records {
            let fields = self.chain_fields(record);
            let flags = self.arena.get(record).header.flags;
            if !flags.contains(HeaderFlags::READY_TO_FINALIZE)
                && !marker.is_marked(&self.arena, fields.key)
            {
                self.arena.get_mut(record).header.flags |= HeaderFlags::READY_TO_FINALIZE;
                newly_ready += 1;
            }
        }

        for &record in &records {
            if self.arena.get(record).header.flags.contains(HeaderFlags::READY_TO_FINALIZE) {
                let fields = self.chain_fields(record);
                marker.mark(&mut self.arena, fields.key);
                marker.mark(&mut self.arena, fields.value);
                marker.mark(&mut self.arena, fields.finalizer);
            }
        }
        marker.drain(&mut self.arena);
        newly_ready
    }
}
