//! Interlock between the collector and deferred-evaluation tasks.
//!
//! Worker threads compute vector results in the background but never touch
//! the heap. The scheduler tells the collector which objects are still
//! being written (pending outputs) or read (inputs in use), so the
//! collector keeps them alive, and so the copy-on-write protocol refuses to
//! mutate them in place. A full collection waits for large pending objects
//! to settle before it starts marking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::arena::NodeClass;
use crate::collector::{CollectionLevel, Marker};
use crate::handle::Handle;
use crate::header::HeaderFlags;
use crate::heap::Heap;

/// What the collector needs from a task scheduler.
pub trait TaskScheduler: Send + Sync {
    /// Whether `h` is the output of a task that has not finished.
    fn is_object_pending(&self, h: Handle) -> bool;

    /// Whether `h` is an input a running task is still reading.
    fn is_object_in_use(&self, _h: Handle) -> bool {
        false
    }

    /// Block until `h` is no longer a pending output.
    fn wait_until_not_pending(&self, h: Handle);

    /// Block until no running task reads `h`.
    fn wait_until_not_in_use(&self, h: Handle);

    /// Every object held by an unfinished task, outputs and inputs alike.
    fn enumerate_pending_task_objects(&self) -> Vec<Handle>;

    /// Drop resource handles cached for reuse by finished tasks.
    fn release_cached_resources(&self) {}
}

/// Scheduler for heaps without background tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTasks;

impl TaskScheduler for NoTasks {
    fn is_object_pending(&self, _h: Handle) -> bool {
        false
    }

    fn wait_until_not_pending(&self, _h: Handle) {}

    fn wait_until_not_in_use(&self, _h: Handle) {}

    fn enumerate_pending_task_objects(&self) -> Vec<Handle> {
        Vec::new()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TaskUse {
    outputs: usize,
    inputs: usize,
}

impl TaskUse {
    fn is_idle(&self) -> bool {
        self.outputs == 0 && self.inputs == 0
    }
}

/// In-process registry of objects held by tasks.
///
/// The evaluator registers a task's output and inputs before handing it to
/// a worker; the worker calls the matching `finish_*` when done. Finished
/// entries stay cached until [`TaskScheduler::release_cached_resources`].
///
/// ```
/// use std::sync::Arc;
/// use genheap::{Heap, ObjectKind, PendingObjects};
///
/// let registry = Arc::new(PendingObjects::new());
/// let mut heap = Heap::new();
/// heap.set_task_scheduler(registry.clone());
///
/// let out = heap.allocate(ObjectKind::RealVector, 8)?;
/// registry.begin_output(out);
/// assert!(!heap.may_mutate_in_place(out));
/// registry.finish_output(out);
/// assert!(heap.may_mutate_in_place(out));
/// # Ok::<(), genheap::GcError>(())
/// ```
#[derive(Debug, Default)]
pub struct PendingObjects {
    entries: DashMap<Handle, TaskUse>,
    lock: Mutex<()>,
    settled: Condvar,
    released: AtomicUsize,
}

impl PendingObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_output(&self, h: Handle) {
        self.entries.entry(h).or_default().outputs += 1;
    }

    pub fn finish_output(&self, h: Handle) {
        if let Some(mut entry) = self.entries.get_mut(&h) {
            entry.outputs = entry.outputs.saturating_sub(1);
        }
        self.notify();
    }

    pub fn begin_input(&self, h: Handle) {
        self.entries.entry(h).or_default().inputs += 1;
    }

    pub fn finish_input(&self, h: Handle) {
        if let Some(mut entry) = self.entries.get_mut(&h) {
            entry.inputs = entry.inputs.saturating_sub(1);
        }
        self.notify();
    }

    /// Entries dropped by [`TaskScheduler::release_cached_resources`] so far.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    // Waiters check their condition under `lock`, so taking it here before
    // notifying means no wakeup is lost.
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.settled.notify_all();
    }

    fn wait_while(&self, busy: impl Fn(&TaskUse) -> bool, h: Handle) {
        let mut guard = self.lock.lock();
        while self.entries.get(&h).is_some_and(|e| busy(e.value())) {
            self.settled.wait(&mut guard);
        }
    }
}

impl TaskScheduler for PendingObjects {
    fn is_object_pending(&self, h: Handle) -> bool {
        self.entries.get(&h).is_some_and(|e| e.outputs > 0)
    }

    fn is_object_in_use(&self, h: Handle) -> bool {
        self.entries.get(&h).is_some_and(|e| e.inputs > 0)
    }

    fn wait_until_not_pending(&self, h: Handle) {
        self.wait_while(|e| e.outputs > 0, h);
    }

    fn wait_until_not_in_use(&self, h: Handle) {
        self.wait_while(|e| e.inputs > 0, h);
    }

    fn enumerate_pending_task_objects(&self) -> Vec<Handle> {
        self.entries
            .iter()
            .filter(|e| !e.value().is_idle())
            .map(|e| *e.key())
            .collect()
    }

    fn release_cached_resources(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_idle());
        let dropped = before.saturating_sub(self.entries.len());
        self.released.fetch_add(dropped, Ordering::Relaxed);
    }
}

impl Heap {
    pub fn set_task_scheduler(&mut self, scheduler: Arc<dyn TaskScheduler>) {
        self.tasks = scheduler;
    }

    pub fn task_scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.tasks
    }

    /// Whether `h` may not be collected or mutated because a task holds it.
    pub fn is_held_by_task(&self, h: Handle) -> bool {
        self.tasks.is_object_pending(h) || self.tasks.is_object_in_use(h)
    }

    /// Bring tasks to a state the collector can work with.
    pub(crate) fn quiesce(&mut self, level: CollectionLevel) {
        self.tasks.release_cached_resources();
        if level != CollectionLevel::Full {
            return;
        }
        let scheduler = Arc::clone(&self.tasks);
        for h in scheduler.enumerate_pending_task_objects() {
            let large = self.arena.contains(h) && self.arena.class_of(h) == NodeClass::LARGE;
            if !large {
                continue;
            }
            tracing::trace!(
                target: "genheap::tasks",
                handle = ?h,
                "waiting for task on large object"
            );
            scheduler.wait_until_not_pending(h);
            scheduler.wait_until_not_in_use(h);
            self.counters.task_waits += 1;
        }
    }

    /// Block until no task is still writing `h`, so that its contents can be
    /// read for a copy.
    pub(crate) fn await_task_output(&mut self, h: Handle) {
        if !self.tasks.is_object_pending(h) {
            return;
        }
        tracing::trace!(target: "genheap::tasks", handle = ?h, "waiting for task output to copy");
        self.tasks.wait_until_not_pending(h);
        self.counters.task_waits += 1;
    }

    /// Mark objects held by unfinished tasks until no new object turns up.
    pub(crate) fn mark_pending_task_objects(&mut self, marker: &mut Marker) {
        let scheduler = Arc::clone(&self.tasks);
        loop {
            let before = marker.marked();
            for h in scheduler.enumerate_pending_task_objects() {
                if !self.arena.contains(h) {
                    continue;
                }
                let pending = scheduler.is_object_pending(h);
                let in_use = scheduler.is_object_in_use(h);
                let flags = &mut self.arena.get_mut(h).header.flags;
                flags.set(HeaderFlags::BEING_COMPUTED, pending);
                flags.set(HeaderFlags::IN_USE_BY_TASK, in_use);
                marker.mark(&mut self.arena, h);
            }
            marker.drain(&mut self.arena);
            if marker.marked() == before {
                break;
            }
        }
    }
}
