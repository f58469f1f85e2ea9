//! Heap configuration.
//!
//! Configuration can be set programmatically through [`HeapConfig::builder`]
//! or loaded from environment variables with [`HeapConfig::from_env`].
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `GENHEAP_SEGMENT_CELLS` | Cells per arena segment | 1024 |
//! | `GENHEAP_MAX_CELLS` | Total cell capacity limit (0 = unlimited) | 0 |
//! | `GENHEAP_MAX_VECTOR_CHUNKS` | Large-vector storage limit in 8-byte chunks (0 = unlimited) | 0 |
//! | `GENHEAP_COLLECT_INTERVAL` | Allocations between collection decisions | 10000 |
//! | `GENHEAP_FULL_PERIOD` | Collections between forced full collections | 50 |
//! | `GENHEAP_NAME_MARK_LEVEL` | Lowest level that traces symbol print names | 1 |
//! | `GENHEAP_PPSTACK_SIZE` | Nominal protection stack depth | 50000 |
//! | `GENHEAP_TORTURE` | Collect on every allocation ("true"/"false") | false |
//! | `GENHEAP_VERBOSE` | Report every collection at info level | false |
//!
//! # Example
//!
//! ```
//! use genheap::HeapConfig;
//!
//! let config = HeapConfig::builder()
//!     .segment_cells(256)
//!     .collect_interval(1_000)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.segment_cells, 256);
//! ```

use std::env;

use thiserror::Error;

use crate::handle::MAX_SEGMENT_CELLS;

/// Errors raised by [`HeapConfig::validate`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
    #[error("segment_cells {0} exceeds the handle offset capacity of {MAX_SEGMENT_CELLS}")]
    SegmentTooLarge(usize),
    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: usize },
    #[error("{field} must lie in (0, 1], got {value}")]
    FractionOutOfRange { field: &'static str, value: f64 },
    #[error("string_cache_max_size {max} is below string_cache_initial_size {initial}")]
    CacheBounds { initial: usize, max: usize },
    #[error("max_cells {max} cannot hold a single segment of {segment} cells")]
    LimitBelowSegment { max: usize, segment: usize },
    #[error("name_mark_level must be 0, 1 or 2, got {0}")]
    InvalidLevel(usize),
}

/// Tunables for a [`Heap`](crate::Heap).
///
/// The collection-policy constants only shape how often and how deep the
/// collector runs; none of them affect which objects survive.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Cells per arena segment.
    pub segment_cells: usize,
    /// Upper bound on total cell capacity (None = unlimited).
    pub max_cells: Option<usize>,
    /// Upper bound on live large-vector storage in 8-byte chunks (None = unlimited).
    pub max_vector_chunks: Option<usize>,
    /// Allocations between collection decisions.
    pub collect_interval: usize,
    /// Consecutive level-0 and level-1 collections tolerated before escalating.
    pub level_collect_limits: [usize; 2],
    /// Every this many collections a full collection is forced.
    pub full_collection_period: usize,
    /// Smoothed recovery fraction below which the next collection goes deeper.
    pub min_recovery: f64,
    /// Weight of the newest recovery sample.
    pub recovery_smoothing: f64,
    /// Large allocations above this fraction of live big storage trigger a collection.
    pub large_alloc_fraction: f64,
    /// Lowest collection level that traces symbol print names.
    pub name_mark_level: usize,
    /// Nominal protection stack depth.
    pub protect_stack_size: usize,
    /// Extra depth unlocked while an overflow is being reported.
    pub protect_red_zone: usize,
    /// Initial string cache bucket count.
    pub string_cache_initial_size: usize,
    /// String cache bucket count ceiling.
    pub string_cache_max_size: usize,
    /// Collect before every allocation.
    pub torture: bool,
    /// Report each collection at info level.
    pub verbose: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            segment_cells: 1024,
            max_cells: None,
            max_vector_chunks: None,
            collect_interval: 10_000,
            level_collect_limits: [20, 5],
            full_collection_period: 50,
            min_recovery: 0.2,
            recovery_smoothing: 0.5,
            large_alloc_fraction: 0.25,
            name_mark_level: 1,
            protect_stack_size: 50_000,
            protect_red_zone: 1_000,
            string_cache_initial_size: 1024,
            string_cache_max_size: 1 << 20,
            torture: false,
            verbose: false,
        }
    }
}

impl HeapConfig {
    pub fn builder() -> HeapConfigBuilder {
        HeapConfigBuilder::new()
    }

    /// Load configuration from `GENHEAP_*` environment variables on top of
    /// the defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("GENHEAP_SEGMENT_CELLS") {
            if val > 0 && val <= MAX_SEGMENT_CELLS {
                config.segment_cells = val;
            }
        }
        if let Some(val) = parse_env_usize("GENHEAP_MAX_CELLS") {
            config.max_cells = (val > 0).then_some(val);
        }
        if let Some(val) = parse_env_usize("GENHEAP_MAX_VECTOR_CHUNKS") {
            config.max_vector_chunks = (val > 0).then_some(val);
        }
        if let Some(val) = parse_env_usize("GENHEAP_COLLECT_INTERVAL") {
            if val > 0 {
                config.collect_interval = val;
            }
        }
        if let Some(val) = parse_env_usize("GENHEAP_FULL_PERIOD") {
            if val > 0 {
                config.full_collection_period = val;
            }
        }
        if let Some(val) = parse_env_usize("GENHEAP_NAME_MARK_LEVEL") {
            if val <= 2 {
                config.name_mark_level = val;
            }
        }
        if let Some(val) = parse_env_usize("GENHEAP_PPSTACK_SIZE") {
            if val > 0 {
                config.protect_stack_size = val;
            }
        }
        if let Some(val) = parse_env_bool("GENHEAP_TORTURE") {
            config.torture = val;
        }
        if let Some(val) = parse_env_bool("GENHEAP_VERBOSE") {
            config.verbose = val;
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("segment_cells", self.segment_cells),
            ("collect_interval", self.collect_interval),
            ("full_collection_period", self.full_collection_period),
            ("protect_stack_size", self.protect_stack_size),
            ("protect_red_zone", self.protect_red_zone),
            ("string_cache_initial_size", self.string_cache_initial_size),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }

        if self.segment_cells > MAX_SEGMENT_CELLS {
            return Err(ConfigError::SegmentTooLarge(self.segment_cells));
        }
        if let Some(max) = self.max_cells {
            if max < self.segment_cells {
                return Err(ConfigError::LimitBelowSegment {
                    max,
                    segment: self.segment_cells,
                });
            }
        }

        for (field, value) in [
            ("string_cache_initial_size", self.string_cache_initial_size),
            ("string_cache_max_size", self.string_cache_max_size),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { field, value });
            }
        }
        if self.string_cache_max_size < self.string_cache_initial_size {
            return Err(ConfigError::CacheBounds {
                initial: self.string_cache_initial_size,
                max: self.string_cache_max_size,
            });
        }

        for (field, value) in [
            ("min_recovery", self.min_recovery),
            ("recovery_smoothing", self.recovery_smoothing),
            ("large_alloc_fraction", self.large_alloc_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::FractionOutOfRange { field, value });
            }
        }

        if self.name_mark_level > 2 {
            return Err(ConfigError::InvalidLevel(self.name_mark_level));
        }

        Ok(())
    }
}

/// Builder for [`HeapConfig`].
#[derive(Debug, Clone, Default)]
pub struct HeapConfigBuilder {
    config: HeapConfig,
}

impl HeapConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment_cells(mut self, cells: usize) -> Self {
        self.config.segment_cells = cells;
        self
    }

    pub fn max_cells(mut self, cells: usize) -> Self {
        self.config.max_cells = Some(cells);
        self
    }

    pub fn max_vector_chunks(mut self, chunks: usize) -> Self {
        self.config.max_vector_chunks = Some(chunks);
        self
    }

    pub fn collect_interval(mut self, allocations: usize) -> Self {
        self.config.collect_interval = allocations;
        self
    }

    pub fn level_collect_limits(mut self, minor: usize, mid: usize) -> Self {
        self.config.level_collect_limits = [minor, mid];
        self
    }

    pub fn full_collection_period(mut self, collections: usize) -> Self {
        self.config.full_collection_period = collections;
        self
    }

    pub fn min_recovery(mut self, fraction: f64) -> Self {
        self.config.min_recovery = fraction;
        self
    }

    pub fn recovery_smoothing(mut self, weight: f64) -> Self {
        self.config.recovery_smoothing = weight;
        self
    }

    pub fn large_alloc_fraction(mut self, fraction: f64) -> Self {
        self.config.large_alloc_fraction = fraction;
        self
    }

    pub fn name_mark_level(mut self, level: usize) -> Self {
        self.config.name_mark_level = level;
        self
    }

    pub fn protect_stack_size(mut self, depth: usize) -> Self {
        self.config.protect_stack_size = depth;
        self
    }

    pub fn protect_red_zone(mut self, depth: usize) -> Self {
        self.config.protect_red_zone = depth;
        self
    }

    pub fn string_cache_sizes(mut self, initial: usize, max: usize) -> Self {
        self.config.string_cache_initial_size = initial;
        self.config.string_cache_max_size = max;
        self
    }

    pub fn torture(mut self, enabled: bool) -> Self {
        self.config.torture = enabled;
        self
    }

    pub fn verbose(mut self, enabled: bool) -> Self {
        self.config.verbose = enabled;
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<HeapConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> HeapConfig {
        self.config
    }
}

fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}
