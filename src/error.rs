//! Error types for the genheap memory manager.
//!
//! Three of the four failure classes surface as values: allocation exhaustion
//! after the deepest collection ([`GcError::OutOfMemory`]), protection-stack
//! overflow ([`GcError::ProtectStackOverflow`]) and misuse of the allocation API.
//! Broken internal invariants never become values; they go through
//! [`invariant_violation`] and abort the process.

use thiserror::Error;

use crate::config::ConfigError;
use crate::object::ObjectKind;

/// Errors that can occur during heap operations
///
/// # Examples
///
/// ```
/// use genheap::{GcError, GcResult, ObjectKind};
///
/// let oom = GcError::OutOfMemory { kind: ObjectKind::RealVector, length: 1 << 40 };
/// assert!(oom.to_string().starts_with("cannot allocate"));
///
/// let failure: GcResult<u32> = Err(GcError::ProtectStackOverflow { limit: 10 });
/// assert!(failure.is_err());
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GcError {
    /// Allocation failed even after a full collection with no finalizers left to run
    #[error("cannot allocate {kind:?} of length {length}: heap exhausted")]
    OutOfMemory { kind: ObjectKind, length: usize },
    /// The protection stack exceeded its nominal depth
    #[error("protect(): protection stack overflow (limit {limit})")]
    ProtectStackOverflow { limit: usize },
    /// The kind cannot be allocated through the generic entry point
    #[error("objects of kind {0:?} cannot be allocated directly")]
    InvalidKind(ObjectKind),
    /// Length does not fit the requested kind
    #[error("invalid length {length} for {kind:?}")]
    InvalidLength { kind: ObjectKind, length: usize },
    /// A weak-reference accessor was handed something else
    #[error("not a weak reference")]
    NotAWeakReference,
    /// Index out of range for a vector or protection slot
    #[error("index {index} out of bounds for length {length}")]
    IndexOutOfBounds { index: usize, length: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for heap operations
pub type GcResult<T> = Result<T, GcError>;

/// Failure reported by a finalizer through its recovery scope.
///
/// Finalizer failures are contained: they are logged and counted, never
/// propagated into the collection or allocation that triggered them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("finalizer failed: {message}")]
pub struct FinalizerError {
    pub message: String,
}

impl FinalizerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Error for a finalizer that panicked, carrying the panic message.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string payload".to_string());
        Self::new(format!("panicked: {detail}"))
    }
}

/// Report a broken heap invariant and abort.
///
/// Continuing after one of these risks silently corrupting the heap, so there
/// is no unwinding and no recovery.
#[cold]
#[inline(never)]
pub fn invariant_violation(message: &str) -> ! {
    tracing::error!(target: "genheap", "heap invariant violated: {message}");
    eprintln!("genheap: heap invariant violated: {message}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_readable_messages() {
        let cases = [
            (
                GcError::OutOfMemory {
                    kind: ObjectKind::Pair,
                    length: 0,
                },
                "cannot allocate Pair of length 0: heap exhausted",
            ),
            (
                GcError::ProtectStackOverflow { limit: 3 },
                "protect(): protection stack overflow (limit 3)",
            ),
            (
                GcError::InvalidKind(ObjectKind::Free),
                "objects of kind Free cannot be allocated directly",
            ),
            (GcError::NotAWeakReference, "not a weak reference"),
            (
                GcError::IndexOutOfBounds {
                    index: 4,
                    length: 2,
                },
                "index 4 out of bounds for length 2",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn finalizer_error_carries_message() {
        let err = FinalizerError::new("boom");
        assert_eq!(err.to_string(), "finalizer failed: boom");
    }

    #[test]
    fn panic_payloads_become_finalizer_errors() {
        let err = FinalizerError::from_panic(Box::new("lost handle"));
        assert_eq!(err.message, "panicked: lost handle");
        let err = FinalizerError::from_panic(Box::new(String::from("owned")));
        assert_eq!(err.message, "panicked: owned");
        let err = FinalizerError::from_panic(Box::new(7u8));
        assert_eq!(err.message, "panicked: non-string payload");
    }
}
