//! Write barrier and reference-counted slot setters.
//!
//! Any mutable access to an object's handle slots goes through
//! [`Heap::payload_mut`], which records objects outside the young generation
//! in the remembered set. A collection at level L treats remembered objects
//! older than L as roots, so old-to-young edges survive minor collections.

use crate::error::{GcError, GcResult};
use crate::handle::Handle;
use crate::header::{Generation, HeaderFlags};
use crate::heap::Heap;
use crate::object::Payload;

impl Heap {
    /// Mutable payload access with the write barrier applied.
    pub fn payload_mut(&mut self, h: Handle) -> &mut Payload {
        self.note_write(h);
        &mut self.arena.get_mut(h).payload
    }

    pub(crate) fn note_write(&mut self, h: Handle) {
        let header = &mut self.arena.get_mut(h).header;
        if header.generation != Generation::Young
            && !header.flags.intersects(HeaderFlags::REMEMBERED | HeaderFlags::PERMANENT)
        {
            header.flags |= HeaderFlags::REMEMBERED;
            self.remembered.push(h);
        }
    }

    /// Count a new reference to `new` and opportunistically drop one to `old`.
    pub(crate) fn replace_reference(&mut self, old: Handle, new: Handle) {
        if old == new {
            return;
        }
        self.increment_refcount(new);
        if self.arena.contains(old) {
            self.decrement_refcount(old);
        }
    }

    pub fn set_car(&mut self, pair: Handle, value: Handle) {
        let old = match self.payload_mut(pair) {
            Payload::Pair { car, .. } => std::mem::replace(car, value),
            _ => self.wrong_kind(pair, "pair"),
        };
        self.replace_reference(old, value);
    }

    pub fn set_cdr(&mut self, pair: Handle, value: Handle) {
        let old = match self.payload_mut(pair) {
            Payload::Pair { cdr, .. } => std::mem::replace(cdr, value),
            _ => self.wrong_kind(pair, "pair"),
        };
        self.replace_reference(old, value);
    }

    pub fn set_tag(&mut self, pair: Handle, value: Handle) {
        let old = match self.payload_mut(pair) {
            Payload::Pair { tag, .. } => std::mem::replace(tag, value),
            _ => self.wrong_kind(pair, "pair"),
        };
        self.replace_reference(old, value);
    }

    pub fn set_vector_elt(&mut self, vector: Handle, index: usize, value: Handle) -> GcResult<()> {
        let old = match self.payload_mut(vector) {
            Payload::Handles(elements) => {
                let length = elements.len();
                match elements.get_mut(index) {
                    Some(slot) => std::mem::replace(slot, value),
                    None => return Err(GcError::IndexOutOfBounds { index, length }),
                }
            }
            _ => self.wrong_kind(vector, "handle vector"),
        };
        self.replace_reference(old, value);
        Ok(())
    }

    /// Replace the attribute list. A class attribute is signalled separately
    /// through [`Heap::set_object_bit`].
    pub fn set_attrib(&mut self, h: Handle, attrib: Handle) {
        if self.flags(h).contains(HeaderFlags::CACHED) {
            crate::error::invariant_violation("attributes on a cached string");
        }
        self.note_write(h);
        let old = std::mem::replace(&mut self.arena.get_mut(h).attrib, attrib);
        self.replace_reference(old, attrib);
    }

    pub fn set_object_bit(&mut self, h: Handle, object: bool) {
        self.arena
            .get_mut(h)
            .header
            .flags
            .set(HeaderFlags::OBJECT, object);
    }

    /// Force a promise: store its value and drop the environment.
    pub fn set_promise_value(&mut self, promise: Handle, value: Handle) {
        let (old_value, old_env) = match self.payload_mut(promise) {
            Payload::Promise { value: slot, env, .. } => (
                std::mem::replace(slot, value),
                std::mem::replace(env, Handle::NIL),
            ),
            _ => self.wrong_kind(promise, "promise"),
        };
        self.replace_reference(old_value, value);
        self.replace_reference(old_env, Handle::NIL);
    }
}
