//! Object kinds and payloads.
//!
//! A payload is the kind-specific part of a cell. Pointer-bearing payloads
//! hold [`Handle`]s; atomic vectors hold plain data. [`Payload::visit_children`]
//! is the single place that knows which slots the collector traces.

use std::mem::size_of;

use crate::finalizer::NativeFinalizer;
use crate::handle::Handle;

/// Size of one vector storage chunk in bytes.
pub const CHUNK_BYTES: usize = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    /// Marker for an unallocated cell.
    #[default]
    Free = 0,
    /// The permanent empty object.
    Nil,
    Symbol,
    Pair,
    /// A call expression; structurally a pair.
    Language,
    Closure,
    Environment,
    Promise,
    CharString,
    LogicalVector,
    IntegerVector,
    RealVector,
    RawVector,
    StringVector,
    List,
    Expression,
    ByteCode,
    ExternalPtr,
    WeakRef,
    NativeFunction,
}

impl ObjectKind {
    /// Whether the payload length is chosen at allocation time.
    pub const fn is_vector(self) -> bool {
        matches!(
            self,
            ObjectKind::CharString
                | ObjectKind::LogicalVector
                | ObjectKind::IntegerVector
                | ObjectKind::RealVector
                | ObjectKind::RawVector
                | ObjectKind::StringVector
                | ObjectKind::List
                | ObjectKind::Expression
        )
    }

    /// Vectors whose elements are handles.
    pub const fn holds_handles(self) -> bool {
        matches!(
            self,
            ObjectKind::StringVector | ObjectKind::List | ObjectKind::Expression
        )
    }

    pub const fn is_pair_like(self) -> bool {
        matches!(self, ObjectKind::Pair | ObjectKind::Language)
    }

    /// Kinds the generic allocation entry point accepts.
    pub const fn is_allocatable(self) -> bool {
        !matches!(self, ObjectKind::Free | ObjectKind::Nil)
    }

    /// Bytes per element for vector kinds.
    pub const fn element_size(self) -> usize {
        match self {
            ObjectKind::CharString | ObjectKind::RawVector => 1,
            ObjectKind::LogicalVector | ObjectKind::IntegerVector => size_of::<i32>(),
            ObjectKind::RealVector => size_of::<f64>(),
            ObjectKind::StringVector | ObjectKind::List | ObjectKind::Expression => {
                size_of::<Handle>()
            }
            _ => 0,
        }
    }
}

/// Number of 8-byte chunks a vector payload of `length` elements occupies.
pub fn vector_chunks(kind: ObjectKind, length: usize) -> usize {
    length
        .saturating_mul(kind.element_size())
        .div_ceil(CHUNK_BYTES)
}

/// Character encoding recorded on a char string.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Encoding {
    #[default]
    Native = 0,
    Utf8,
    Latin1,
    Bytes,
}

impl Encoding {
    /// ASCII text is encoding-neutral except when marked as raw bytes.
    pub fn normalize(self, ascii: bool) -> Self {
        if ascii && self != Encoding::Bytes {
            Encoding::Native
        } else {
            self
        }
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    Free,
    Nil,
    /// `last_env` is a lookup cache and is never traced.
    Symbol {
        name: Handle,
        value: Handle,
        internal: Handle,
        last_env: Handle,
    },
    /// Pairs and language objects.
    Pair { car: Handle, cdr: Handle, tag: Handle },
    Closure {
        formals: Handle,
        body: Handle,
        env: Handle,
    },
    /// `frame` is a tagged pairlist of bindings.
    Environment { frame: Handle, enclos: Handle },
    Promise {
        expr: Handle,
        env: Handle,
        value: Handle,
    },
    CharString {
        bytes: Box<[u8]>,
        encoding: Encoding,
        hash: u32,
    },
    Logical(Vec<i32>),
    Integer(Vec<i32>),
    Real(Vec<f64>),
    Raw(Vec<u8>),
    /// String vectors, lists and expression vectors.
    Handles(Vec<Handle>),
    ByteCode { code: Handle, consts: Handle },
    ExternalPtr {
        address: usize,
        tag: Handle,
        protected: Handle,
    },
    /// Weak records do not trace their fields; the weak fixpoint decides.
    WeakRef {
        key: Handle,
        value: Handle,
        finalizer: Handle,
        next: Handle,
    },
    NativeFunction(NativeFinalizer),
}

impl Payload {
    /// Zero-initialized payload for a fresh object. Handle slots start as NIL.
    ///
    /// `None` when the element storage cannot be reserved.
    pub fn for_kind(kind: ObjectKind, length: usize) -> Option<Payload> {
        let nil = Handle::NIL;
        let payload = match kind {
            ObjectKind::Free => Payload::Free,
            ObjectKind::Nil => Payload::Nil,
            ObjectKind::Symbol => Payload::Symbol {
                name: nil,
                value: Handle::UNBOUND,
                internal: nil,
                last_env: nil,
            },
            ObjectKind::Pair | ObjectKind::Language => Payload::Pair {
                car: nil,
                cdr: nil,
                tag: nil,
            },
            ObjectKind::Closure => Payload::Closure {
                formals: nil,
                body: nil,
                env: nil,
            },
            ObjectKind::Environment => Payload::Environment {
                frame: nil,
                enclos: nil,
            },
            ObjectKind::Promise => Payload::Promise {
                expr: nil,
                env: nil,
                value: Handle::UNBOUND,
            },
            ObjectKind::CharString => Payload::CharString {
                bytes: zeroed(0, length)?.into_boxed_slice(),
                encoding: Encoding::Native,
                hash: 0,
            },
            ObjectKind::LogicalVector => Payload::Logical(zeroed(0, length)?),
            ObjectKind::IntegerVector => Payload::Integer(zeroed(0, length)?),
            ObjectKind::RealVector => Payload::Real(zeroed(0.0, length)?),
            ObjectKind::RawVector => Payload::Raw(zeroed(0, length)?),
            ObjectKind::StringVector | ObjectKind::List | ObjectKind::Expression => {
                Payload::Handles(zeroed(nil, length)?)
            }
            ObjectKind::ByteCode => Payload::ByteCode {
                code: nil,
                consts: nil,
            },
            ObjectKind::ExternalPtr => Payload::ExternalPtr {
                address: 0,
                tag: nil,
                protected: nil,
            },
            ObjectKind::WeakRef => Payload::WeakRef {
                key: nil,
                value: nil,
                finalizer: nil,
                next: nil,
            },
            ObjectKind::NativeFunction => Payload::NativeFunction(noop_finalizer),
        };
        Some(payload)
    }

    /// Element count for vector payloads, zero otherwise.
    pub fn len(&self) -> usize {
        match self {
            Payload::CharString { bytes, .. } => bytes.len(),
            Payload::Logical(v) | Payload::Integer(v) => v.len(),
            Payload::Real(v) => v.len(),
            Payload::Raw(v) => v.len(),
            Payload::Handles(v) => v.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every traced handle slot. Symbol print names are only visited
    /// when `trace_names` is set.
    pub fn visit_children(&self, trace_names: bool, mut visit: impl FnMut(Handle)) {
        match self {
            Payload::Symbol {
                name,
                value,
                internal,
                ..
            } => {
                if trace_names {
                    visit(*name);
                }
                visit(*value);
                visit(*internal);
            }
            Payload::Pair { car, cdr, tag } => {
                visit(*car);
                visit(*cdr);
                visit(*tag);
            }
            Payload::Closure { formals, body, env } => {
                visit(*formals);
                visit(*body);
                visit(*env);
            }
            Payload::Environment { frame, enclos } => {
                visit(*frame);
                visit(*enclos);
            }
            Payload::Promise { expr, env, value } => {
                visit(*expr);
                visit(*env);
                visit(*value);
            }
            Payload::Handles(elements) => elements.iter().copied().for_each(visit),
            Payload::ByteCode { code, consts } => {
                visit(*code);
                visit(*consts);
            }
            Payload::ExternalPtr { tag, protected, .. } => {
                visit(*tag);
                visit(*protected);
            }
            Payload::Free
            | Payload::Nil
            | Payload::CharString { .. }
            | Payload::Logical(_)
            | Payload::Integer(_)
            | Payload::Real(_)
            | Payload::Raw(_)
            | Payload::WeakRef { .. }
            | Payload::NativeFunction(_) => {}
        }
    }
}

fn zeroed<T: Clone>(value: T, length: usize) -> Option<Vec<T>> {
    let mut storage = Vec::new();
    storage.try_reserve_exact(length).ok()?;
    storage.resize(length, value);
    Some(storage)
}

fn noop_finalizer(
    _heap: &mut crate::heap::Heap,
    _key: Handle,
) -> Result<(), crate::error::FinalizerError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn children(payload: &Payload, trace_names: bool) -> Vec<Handle> {
        let mut out = Vec::new();
        payload.visit_children(trace_names, |h| out.push(h));
        out
    }

    #[test]
    fn chunk_accounting_rounds_up() {
        assert_eq!(vector_chunks(ObjectKind::RealVector, 0), 0);
        assert_eq!(vector_chunks(ObjectKind::RealVector, 3), 3);
        assert_eq!(vector_chunks(ObjectKind::IntegerVector, 3), 2);
        assert_eq!(vector_chunks(ObjectKind::RawVector, 9), 2);
        assert_eq!(vector_chunks(ObjectKind::Pair, 100), 0);
    }

    #[test]
    fn handle_vectors_start_nil() {
        let payload = Payload::for_kind(ObjectKind::List, 4).unwrap();
        assert_eq!(payload.len(), 4);
        assert_eq!(children(&payload, true), vec![Handle::NIL; 4]);
    }

    #[test]
    fn symbol_names_traced_only_on_request() {
        let name = Handle::pack(1, 7);
        let payload = Payload::Symbol {
            name,
            value: Handle::UNBOUND,
            internal: Handle::NIL,
            last_env: Handle::pack(3, 3),
        };
        assert!(!children(&payload, false).contains(&name));
        assert!(children(&payload, true).contains(&name));
        assert!(!children(&payload, true).contains(&Handle::pack(3, 3)));
    }

    #[test]
    fn weak_records_and_atomic_vectors_have_no_traced_children() {
        let weak = Payload::WeakRef {
            key: Handle::pack(1, 1),
            value: Handle::pack(1, 2),
            finalizer: Handle::pack(1, 3),
            next: Handle::pack(1, 4),
        };
        assert!(children(&weak, true).is_empty());
        assert!(children(&Payload::for_kind(ObjectKind::RealVector, 8).unwrap(), true).is_empty());
    }

    #[test]
    fn ascii_text_normalizes_to_native() {
        assert_eq!(Encoding::Utf8.normalize(true), Encoding::Native);
        assert_eq!(Encoding::Utf8.normalize(false), Encoding::Utf8);
        assert_eq!(Encoding::Bytes.normalize(true), Encoding::Bytes);
    }
}
