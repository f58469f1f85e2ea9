//! The protection stack.
//!
//! Handles pushed here are roots until popped. Pushes and pops are strictly
//! LIFO; [`ProtectScope`] pops everything pushed through it when dropped, so
//! most callers never pair pushes and pops by hand.
//!
//! Overflowing the nominal depth is recoverable: the stack unlocks a red
//! zone just deep enough for error reporting, returns
//! [`GcError::ProtectStackOverflow`], and relocks once the depth falls back
//! below the nominal limit. Exhausting the red zone as well aborts.

use std::ops::{Deref, DerefMut};

use crate::error::{invariant_violation, GcError, GcResult};
use crate::handle::Handle;
use crate::heap::Heap;

/// Position of a slot on the protection stack, for [`Heap::reprotect_at_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtectIndex(usize);

impl ProtectIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub struct ProtectStack {
    slots: Vec<Handle>,
    nominal: usize,
    red_zone: usize,
    limit: usize,
}

impl ProtectStack {
    pub fn new(nominal: usize, red_zone: usize) -> Self {
        Self {
            slots: Vec::new(),
            nominal,
            red_zone,
            limit: nominal,
        }
    }

    pub fn push(&mut self, h: Handle) -> GcResult<ProtectIndex> {
        if self.slots.len() >= self.limit {
            if self.limit == self.nominal && self.red_zone > 0 {
                self.limit = self.nominal + self.red_zone;
                tracing::warn!(
                    target: "genheap::protect",
                    limit = self.nominal,
                    "protection stack overflow; red zone unlocked"
                );
                return Err(GcError::ProtectStackOverflow {
                    limit: self.nominal,
                });
            }
            invariant_violation("protection stack red zone exhausted");
        }
        self.slots.push(h);
        Ok(ProtectIndex(self.slots.len() - 1))
    }

    pub fn pop(&mut self, n: usize) {
        if n > self.slots.len() {
            invariant_violation(&format!(
                "unprotect: only {} protected handles, asked to pop {n}",
                self.slots.len()
            ));
        }
        let depth = self.slots.len() - n;
        self.truncate(depth);
    }

    pub fn reprotect(&mut self, h: Handle, index: ProtectIndex) {
        match self.slots.get_mut(index.0) {
            Some(slot) => *slot = h,
            None => invariant_violation(&format!(
                "reprotect at {} above stack depth {}",
                index.0,
                self.slots.len()
            )),
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Drop every entry above `depth`.
    pub fn truncate(&mut self, depth: usize) {
        self.slots.truncate(depth);
        if self.limit > self.nominal && self.slots.len() < self.nominal {
            self.limit = self.nominal;
        }
    }

    pub fn in_red_zone(&self) -> bool {
        self.limit > self.nominal
    }

    pub fn iter(&self) -> impl Iterator<Item = Handle> + '_ {
        self.slots.iter().copied()
    }
}

impl Heap {
    /// Protect `h` until the matching [`Heap::pop_roots`].
    pub fn push_root(&mut self, h: Handle) -> GcResult<()> {
        self.protect.push(h).map(|_| ())
    }

    /// Protect `h` and return its slot for later [`Heap::reprotect_at_index`].
    pub fn push_root_with_index(&mut self, h: Handle) -> GcResult<ProtectIndex> {
        self.protect.push(h)
    }

    /// Replace the handle protected at `index`.
    pub fn reprotect_at_index(&mut self, h: Handle, index: ProtectIndex) {
        self.protect.reprotect(h, index);
    }

    /// Pop `n` entries. Popping more than were pushed aborts.
    pub fn pop_roots(&mut self, n: usize) {
        self.protect.pop(n);
    }

    pub fn protect_depth(&self) -> usize {
        self.protect.depth()
    }

    /// Open a scope that restores the current protection depth on drop.
    ///
    /// ```
    /// use genheap::{Handle, Heap};
    ///
    /// let mut heap = Heap::new();
    /// {
    ///     let mut scope = heap.protect_scope();
    ///     let pair = scope.cons(Handle::NIL, Handle::NIL)?;
    ///     scope.push_root(pair)?;
    ///     assert_eq!(scope.protect_depth(), 1);
    /// }
    /// assert_eq!(heap.protect_depth(), 0);
    /// # Ok::<(), genheap::GcError>(())
    /// ```
    pub fn protect_scope(&mut self) -> ProtectScope<'_> {
        let depth = self.protect.depth();
        ProtectScope { heap: self, depth }
    }
}

/// RAII guard over the protection stack. Dereferences to the [`Heap`].
pub struct ProtectScope<'a> {
    heap: &'a mut Heap,
    depth: usize,
}

impl ProtectScope<'_> {
    /// Depth the stack returns to when this scope ends.
    pub fn base_depth(&self) -> usize {
        self.depth
    }
}

impl Deref for ProtectScope<'_> {
    type Target = Heap;

    fn deref(&self) -> &Heap {
        self.heap
    }
}

impl DerefMut for ProtectScope<'_> {
    fn deref_mut(&mut self) -> &mut Heap {
        self.heap
    }
}

impl Drop for ProtectScope<'_> {
    fn drop(&mut self) {
        if self.heap.protect.depth() < self.depth {
            invariant_violation("protection scope popped below its base");
        }
        self.heap.protect.truncate(self.depth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_reports_slot_indices() {
        let mut stack = ProtectStack::new(4, 2);
        assert_eq!(stack.push(Handle::NIL).unwrap().get(), 0);
        assert_eq!(stack.push(Handle::UNBOUND).unwrap().get(), 1);
        stack.pop(2);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn overflow_unlocks_red_zone_then_resets() {
        let mut stack = ProtectStack::new(2, 3);
        stack.push(Handle::NIL).unwrap();
        stack.push(Handle::NIL).unwrap();

        assert_eq!(
            stack.push(Handle::NIL),
            Err(GcError::ProtectStackOverflow { limit: 2 })
        );
        assert!(stack.in_red_zone());
        // Error reporting may use the red zone.
        stack.push(Handle::NIL).unwrap();
        assert_eq!(stack.depth(), 3);

        stack.truncate(1);
        assert!(!stack.in_red_zone());
        stack.push(Handle::NIL).unwrap();
        assert!(stack.push(Handle::NIL).is_err());
    }

    #[test]
    fn reprotect_replaces_slot() {
        let mut stack = ProtectStack::new(8, 1);
        let index = stack.push(Handle::NIL).unwrap();
        stack.push(Handle::NIL).unwrap();
        stack.reprotect(Handle::UNBOUND, index);
        assert_eq!(stack.iter().collect::<Vec<_>>(), vec![Handle::UNBOUND, Handle::NIL]);
    }

    #[test]
    fn scope_restores_depth() {
        let mut heap = Heap::new();
        heap.push_root(Handle::NIL).unwrap();
        {
            let mut scope = heap.protect_scope();
            for _ in 0..5 {
                scope.push_root(Handle::UNBOUND).unwrap();
            }
            assert_eq!(scope.protect_depth(), 6);
            assert_eq!(scope.base_depth(), 1);
        }
        assert_eq!(heap.protect_depth(), 1);
        heap.pop_roots(1);
    }
}
