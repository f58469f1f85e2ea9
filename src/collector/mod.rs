//! The generational collector.
//!
//! A collection at level L runs six phases in order:
//!
//! 1. Quiesce: let the task scheduler drop cached resources; a full
//!    collection also waits for tasks still writing large objects.
//! 2. Mark from the roots: evaluation contexts, the protection stack, the
//!    byte-code stack, the symbol table, the preserved list, external root
//!    sources and the children of remembered old objects.
//! 3. Mark objects held by pending tasks, repeating until nothing new turns up.
//! 4. Run the weak-reference fixpoint and flag finalizers whose keys died.
//! 5. Sweep generations 0 through L, promoting survivors.
//! 6. Update generation statistics and the collection policy.
//!
//! Finalizers never run inside a collection; they run afterwards on the
//! evaluator thread.

mod mark;
mod strategy;
mod sweep;

use std::time::{Duration, Instant};

pub(crate) use mark::Marker;
pub(crate) use sweep::FreeDecision;
pub use strategy::{CollectReason, CollectionLevel, CollectionStrategy, GenerationStats};

use crate::error::invariant_violation;
use crate::heap::Heap;

/// Phase the collector is currently in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorPhase {
    #[default]
    Idle,
    Quiescing,
    Marking,
    PendingTasks,
    WeakReferences,
    Sweeping,
    Adjusting,
}

/// Summary of one completed collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionOutcome {
    pub level: CollectionLevel,
    pub reason: CollectReason,
    pub marked: usize,
    /// Objects reclaimed from each generation.
    pub freed: [usize; 3],
    /// Weak records whose keys became unreachable in this collection.
    pub newly_ready_finalizers: usize,
    pub duration: Duration,
}

impl CollectionOutcome {
    pub fn total_freed(&self) -> usize {
        self.freed.iter().sum()
    }
}

#[derive(Debug, Default)]
pub struct CollectorCounters {
    pub collections: [u64; 3],
    pub total_time: Duration,
    pub task_waits: u64,
    pub phase: CollectorPhase,
    pub last: Option<CollectionOutcome>,
}

impl Heap {
    /// Collect generations `0..=level`, then run any finalizers that became
    /// ready.
    ///
    /// ```
    /// use genheap::{CollectionLevel, Handle, Heap};
    ///
    /// let mut heap = Heap::new();
    /// heap.cons(Handle::NIL, Handle::NIL)?;
    /// let outcome = heap.request_collection(CollectionLevel::Full);
    /// assert_eq!(outcome.total_freed(), 1);
    /// # Ok::<(), genheap::GcError>(())
    /// ```
    pub fn request_collection(&mut self, level: CollectionLevel) -> CollectionOutcome {
        let outcome = self.collect(level, CollectReason::Requested);
        self.run_pending_finalizers();
        outcome
    }

    pub fn collector_phase(&self) -> CollectorPhase {
        self.counters.phase
    }

    pub fn last_collection(&self) -> Option<&CollectionOutcome> {
        self.counters.last.as_ref()
    }

    pub(crate) fn collect(
        &mut self,
        level: CollectionLevel,
        reason: CollectReason,
    ) -> CollectionOutcome {
        if self.collecting {
            invariant_violation("collector re-entered during a collection");
        }
        self.collecting = true;
        let start = Instant::now();
        let before = self.generations;

        self.counters.phase = CollectorPhase::Quiescing;
        self.quiesce(level);

        self.counters.phase = CollectorPhase::Marking;
        let trace_names = level.index() >= self.config.name_mark_level;
        let mut marker = Marker::new(level, trace_names);
        self.mark_roots(&mut marker);

        self.counters.phase = CollectorPhase::PendingTasks;
        self.mark_pending_task_objects(&mut marker);

        self.counters.phase = CollectorPhase::WeakReferences;
        let newly_ready_finalizers = self.process_weak_refs(&mut marker);

        self.counters.phase = CollectorPhase::Sweeping;
        let freed = self.sweep(level);
        self.prune_remembered_set();

        self.counters.phase = CollectorPhase::Adjusting;
        self.strategy.record(level, &before, &freed);
        let duration = start.elapsed();
        self.counters.collections[level.index()] += 1;
        self.counters.total_time += duration;

        let outcome = CollectionOutcome {
            level,
            reason,
            marked: marker.marked(),
            freed,
            newly_ready_finalizers,
            duration,
        };
        tracing::debug!(
            target: "genheap::collector",
            ?level,
            ?reason,
            marked = outcome.marked,
            freed = outcome.total_freed(),
            ?duration,
            "collection finished"
        );
        if self.config.verbose {
            let stats = self.stats();
            tracing::info!(
                target: "genheap::collector",
                "Garbage collection {} = {}+{}+{} (level {}): {} cells in use, {} big chunks, {:.1?}",
                self.counters.collections.iter().sum::<u64>(),
                self.counters.collections[0],
                self.counters.collections[1],
                self.counters.collections[2],
                level.index(),
                stats.live_objects,
                stats.big_chunks,
                duration,
            );
        }

        self.counters.last = Some(outcome.clone());
        self.counters.phase = CollectorPhase::Idle;
        self.collecting = false;
        outcome
    }
}
