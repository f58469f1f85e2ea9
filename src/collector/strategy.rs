//! Collection scheduling.
//!
//! The strategy owns the allocation countdown and picks how deep the next
//! automatic collection goes. Its constants are policy only: they change
//! how often and how deep the collector runs, never which objects survive.
//! The shape is fixed: escalate when a level has run too many times in a
//! row or when the smoothed recovery of the youngest scanned generation is
//! poor, and force a full collection periodically.

use crate::config::HeapConfig;
use crate::header::Generation;

/// Large allocations never trigger a collection while live big storage is
/// below this many chunks.
const LARGE_TRIGGER_FLOOR: usize = 4096;

/// How many generations a collection scans. Level L collects generations
/// 0 through L.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum CollectionLevel {
    Minor = 0,
    Mid = 1,
    Full = 2,
}

impl CollectionLevel {
    pub const ALL: [CollectionLevel; 3] = [
        CollectionLevel::Minor,
        CollectionLevel::Mid,
        CollectionLevel::Full,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Level for an index, saturating at [`CollectionLevel::Full`].
    pub const fn from_index(index: usize) -> Self {
        match index {
            0 => CollectionLevel::Minor,
            1 => CollectionLevel::Mid,
            _ => CollectionLevel::Full,
        }
    }

    pub const fn deeper(self) -> Option<Self> {
        match self {
            CollectionLevel::Minor => Some(CollectionLevel::Mid),
            CollectionLevel::Mid => Some(CollectionLevel::Full),
            CollectionLevel::Full => None,
        }
    }

    /// Whether objects of `generation` are collected at this level.
    #[inline]
    pub fn covers(self, generation: Generation) -> bool {
        generation.index() <= self.index()
    }

    /// Generation survivors of this level are promoted to.
    pub const fn promotion_target(self) -> Generation {
        Generation::from_index(self.index() + 1)
    }
}

/// Why a collection ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectReason {
    /// Explicit [`Heap::request_collection`](crate::Heap::request_collection).
    Requested,
    /// The allocation countdown ran out.
    Countdown,
    /// A large allocation relative to live big storage.
    LargeAllocation,
    /// The allocator had no room and could not grow.
    Exhausted,
    Torture,
}

/// Objects and big chunks held by one generation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenerationStats {
    pub objects: usize,
    pub big_chunks: usize,
}

#[derive(Debug, Clone)]
pub struct CollectionStrategy {
    interval: usize,
    since_collection: usize,
    level_limits: [usize; 2],
    level_counts: [usize; 2],
    full_period: usize,
    since_full: usize,
    recovery: [f64; 3],
    min_recovery: f64,
    smoothing: f64,
    large_fraction: f64,
}

impl CollectionStrategy {
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            interval: config.collect_interval,
            since_collection: 0,
            level_limits: config.level_collect_limits,
            level_counts: [0; 2],
            full_period: config.full_collection_period,
            since_full: 0,
            recovery: [1.0; 3],
            min_recovery: config.min_recovery,
            smoothing: config.recovery_smoothing,
            large_fraction: config.large_alloc_fraction,
        }
    }

    #[inline]
    pub fn note_allocation(&mut self) {
        self.since_collection += 1;
    }

    #[inline]
    pub fn countdown_expired(&self) -> bool {
        self.since_collection >= self.interval
    }

    /// Whether an allocation of `chunks` big chunks should collect first.
    pub fn trigger(&self, chunks: usize, live_big_chunks: usize) -> Option<CollectReason> {
        if chunks > 0
            && live_big_chunks >= LARGE_TRIGGER_FLOOR
            && chunks as f64 > self.large_fraction * live_big_chunks as f64
        {
            return Some(CollectReason::LargeAllocation);
        }
        self.countdown_expired().then_some(CollectReason::Countdown)
    }

    /// Level for the next automatic collection.
    pub fn choose_level(&self) -> CollectionLevel {
        if self.since_full + 1 >= self.full_period {
            return CollectionLevel::Full;
        }
        let mut level = CollectionLevel::Minor;
        if self.level_counts[0] >= self.level_limits[0] || self.recovery[0] < self.min_recovery {
            level = CollectionLevel::Mid;
        }
        if level == CollectionLevel::Mid
            && (self.level_counts[1] >= self.level_limits[1]
                || self.recovery[1] < self.min_recovery)
        {
            level = CollectionLevel::Full;
        }
        level
    }

    /// Fold the outcome of a collection into the policy state. `before`
    /// holds generation object counts at the start, `freed` the objects
    /// reclaimed from each.
    pub fn record(
        &mut self,
        level: CollectionLevel,
        before: &[GenerationStats; 3],
        freed: &[usize; 3],
    ) {
        for g in 0..=level.index() {
            if before[g].objects > 0 {
                let fraction = freed[g] as f64 / before[g].objects as f64;
                self.recovery[g] =
                    self.smoothing * fraction + (1.0 - self.smoothing) * self.recovery[g];
            }
        }
        match level {
            CollectionLevel::Minor => self.level_counts[0] += 1,
            CollectionLevel::Mid => {
                self.level_counts[0] = 0;
                self.level_counts[1] += 1;
            }
            CollectionLevel::Full => self.level_counts = [0; 2],
        }
        if level == CollectionLevel::Full {
            self.since_full = 0;
        } else {
            self.since_full += 1;
        }
        self.since_collection = 0;
    }

    pub fn recovery(&self) -> [f64; 3] {
        self.recovery
    }
}
