//! Root sets outside the protection stack.
//!
//! The evaluator registers its control state here: the stack of evaluation
//! contexts, the byte-code node stack, the precious (preserved) list and
//! any external root sources such as graphics devices holding display
//! lists. The collector visits all of them on every collection.

use crate::handle::Handle;
use crate::heap::Heap;

/// Handles held by one frame of evaluator control state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalContext {
    pub call: Handle,
    pub callfun: Handle,
    pub cloenv: Handle,
    pub sysparent: Handle,
    pub promargs: Handle,
    pub on_exit: Handle,
    pub handler_stack: Handle,
    pub restart_stack: Handle,
    pub srcref: Handle,
    pub return_value: Handle,
}

impl EvalContext {
    pub fn visit_handles(&self, mut visit: impl FnMut(Handle)) {
        for h in [
            self.call,
            self.callfun,
            self.cloenv,
            self.sysparent,
            self.promargs,
            self.on_exit,
            self.handler_stack,
            self.restart_stack,
            self.srcref,
            self.return_value,
        ] {
            visit(h);
        }
    }
}

/// External holder of heap references, visited as roots.
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use genheap::{Handle, RootSource};
///
/// struct DisplayList(Rc<RefCell<Vec<Handle>>>);
///
/// impl RootSource for DisplayList {
///     fn visit_roots(&self, visit: &mut dyn FnMut(Handle)) {
///         self.0.borrow().iter().copied().for_each(visit);
///     }
/// }
/// ```
pub trait RootSource {
    fn visit_roots(&self, visit: &mut dyn FnMut(Handle));
}

/// Identifies a registered [`RootSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSourceId(u64);

#[derive(Default)]
pub struct RootSet {
    pub(crate) contexts: Vec<EvalContext>,
    pub(crate) bytecode_stack: Vec<Handle>,
    pub(crate) preserved: Vec<Handle>,
    /// Handles an in-flight allocation or finalizer run must keep alive.
    pub(crate) transient: Vec<Handle>,
    pub(crate) handler_stack: Handle,
    pub(crate) restart_stack: Handle,
    sources: Vec<(RootSourceId, Box<dyn RootSource>)>,
    next_source: u64,
}

impl RootSet {
    pub(crate) fn visit(&self, mut visit: impl FnMut(Handle)) {
        for context in &self.contexts {
            context.visit_handles(&mut visit);
        }
        self.bytecode_stack.iter().copied().for_each(&mut visit);
        self.preserved.iter().copied().for_each(&mut visit);
        self.transient.iter().copied().for_each(&mut visit);
        visit(self.handler_stack);
        visit(self.restart_stack);
        for (_, source) in &self.sources {
            source.visit_roots(&mut visit);
        }
    }
}

impl Heap {
    /// Enter an evaluation context. Returns its depth.
    pub fn begin_context(&mut self, context: EvalContext) -> usize {
        self.roots.contexts.push(context);
        self.roots.contexts.len()
    }

    pub fn end_context(&mut self) -> Option<EvalContext> {
        self.roots.contexts.pop()
    }

    pub fn current_context_mut(&mut self) -> Option<&mut EvalContext> {
        self.roots.contexts.last_mut()
    }

    pub fn context_depth(&self) -> usize {
        self.roots.contexts.len()
    }

    pub(crate) fn truncate_contexts(&mut self, depth: usize) {
        self.roots.contexts.truncate(depth);
    }

    pub fn bytecode_push(&mut self, h: Handle) {
        self.roots.bytecode_stack.push(h);
    }

    pub fn bytecode_pop(&mut self, n: usize) {
        let depth = self.roots.bytecode_stack.len().saturating_sub(n);
        self.roots.bytecode_stack.truncate(depth);
    }

    pub fn bytecode_depth(&self) -> usize {
        self.roots.bytecode_stack.len()
    }

    pub(crate) fn truncate_bytecode(&mut self, depth: usize) {
        self.roots.bytecode_stack.truncate(depth);
    }

    pub fn set_handler_stack(&mut self, h: Handle) {
        self.roots.handler_stack = h;
    }

    pub fn set_restart_stack(&mut self, h: Handle) {
        self.roots.restart_stack = h;
    }

    /// Pin `h` until a matching [`Heap::release`]. Pins nest: an object
    /// preserved twice stays pinned until released twice.
    pub fn preserve(&mut self, h: Handle) {
        self.roots.preserved.push(h);
    }

    /// Undo one [`Heap::preserve`] of `h`. Returns false if `h` was not pinned.
    pub fn release(&mut self, h: Handle) -> bool {
        match self.roots.preserved.iter().rposition(|&p| p == h) {
            Some(index) => {
                self.roots.preserved.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn add_root_source(&mut self, source: Box<dyn RootSource>) -> RootSourceId {
        let id = RootSourceId(self.roots.next_source);
        self.roots.next_source += 1;
        self.roots.sources.push((id, source));
        id
    }

    pub fn remove_root_source(&mut self, id: RootSourceId) -> Option<Box<dyn RootSource>> {
        let index = self.roots.sources.iter().position(|(i, _)| *i == id)?;
        Some(self.roots.sources.remove(index).1)
    }

    /// Run `f` with `roots` pinned for its duration.
    pub(crate) fn with_transient_roots<R>(
        &mut self,
        roots: &[Handle],
        f: impl FnOnce(&mut Heap) -> R,
    ) -> R {
        let depth = self.roots.transient.len();
        self.roots.transient.extend_from_slice(roots);
        let result = f(self);
        self.roots.transient.truncate(depth);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct SharedRoots(Rc<RefCell<Vec<Handle>>>);

    impl RootSource for SharedRoots {
        fn visit_roots(&self, visit: &mut dyn FnMut(Handle)) {
            self.0.borrow().iter().copied().for_each(visit);
        }
    }

    fn visited(heap: &Heap) -> Vec<Handle> {
        let mut out = Vec::new();
        heap.roots.visit(|h| out.push(h));
        out
    }

    #[test]
    fn preserve_is_a_multiset() {
        let mut heap = Heap::new();
        let h = Handle::pack(0, 1);
        heap.preserve(h);
        heap.preserve(h);
        assert!(heap.release(h));
        assert_eq!(visited(&heap).iter().filter(|&&v| v == h).count(), 1);
        assert!(heap.release(h));
        assert!(!heap.release(h));
    }

    #[test]
    fn contexts_and_sources_are_visited() {
        let mut heap = Heap::new();
        let marker = Handle::pack(0, 1);
        heap.begin_context(EvalContext {
            cloenv: marker,
            ..EvalContext::default()
        });
        let shared = Rc::new(RefCell::new(vec![marker]));
        let id = heap.add_root_source(Box::new(SharedRoots(shared.clone())));

        assert_eq!(visited(&heap).iter().filter(|&&v| v == marker).count(), 2);

        assert!(heap.remove_root_source(id).is_some());
        heap.end_context();
        assert!(!visited(&heap).contains(&marker));
    }

    #[test]
    fn transient_roots_are_scoped() {
        let mut heap = Heap::new();
        let marker = Handle::pack(0, 1);
        let seen = heap.with_transient_roots(&[marker], |heap| visited(heap).contains(&marker));
        assert!(seen);
        assert!(!visited(&heap).contains(&marker));
    }
}
