//! Symbol table and variable bindings.
//!
//! Symbols are interned by print name and live as long as the heap: the
//! table is a root. Each symbol caches the environment its last successful
//! lookup went through; the cache is not traced and every collection
//! clears it.

use ahash::AHashMap;

use crate::error::{GcError, GcResult};
use crate::handle::Handle;
use crate::header::HeaderFlags;
use crate::heap::Heap;
use crate::object::{Encoding, ObjectKind, Payload};

#[derive(Default)]
pub struct SymbolTable {
    by_name: AHashMap<Box<[u8]>, Handle>,
}

impl SymbolTable {
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.by_name.values().copied()
    }
}

impl Heap {
    /// The unique symbol named `name`, created on first use.
    pub fn intern_symbol(&mut self, name: &[u8]) -> GcResult<Handle> {
        if let Some(&sym) = self.symbols.by_name.get(name) {
            return Ok(sym);
        }
        if name.is_empty() {
            return Err(GcError::InvalidLength {
                kind: ObjectKind::Symbol,
                length: 0,
            });
        }

        let encoding = if std::str::from_utf8(name).is_ok() {
            Encoding::Utf8
        } else {
            Encoding::Native
        };
        let pname = self.intern_string(name, encoding)?;
        let sym = self.allocate_rooted(ObjectKind::Symbol, 0, &[pname])?;

        let name_cell = self.arena.get_mut(pname);
        name_cell.header.flags |= HeaderFlags::SYMBOL_NAME;
        name_cell.header.refcount = name_cell.header.refcount.increment();
        if let Payload::Symbol { name, .. } = &mut self.arena.get_mut(sym).payload {
            *name = pname;
        }

        self.symbols.by_name.insert(name.into(), sym);
        Ok(sym)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn symbol_name(&self, sym: Handle) -> Handle {
        match self.payload(sym) {
            Payload::Symbol { name, .. } => *name,
            _ => self.wrong_kind(sym, "symbol"),
        }
    }

    /// The symbol's base binding, [`Handle::UNBOUND`] if it has none.
    pub fn symbol_value(&self, sym: Handle) -> Handle {
        match self.payload(sym) {
            Payload::Symbol { value, .. } => *value,
            _ => self.wrong_kind(sym, "symbol"),
        }
    }

    pub fn set_symbol_value(&mut self, sym: Handle, value: Handle) {
        let old = match self.payload_mut(sym) {
            Payload::Symbol { value: slot, .. } => std::mem::replace(slot, value),
            _ => self.wrong_kind(sym, "symbol"),
        };
        self.replace_reference(old, value);
    }

    /// Environment the last successful [`Heap::find_var`] of `sym` went
    /// through, NIL if none since the last collection.
    pub fn symbol_lookup_cache(&self, sym: Handle) -> Handle {
        match self.payload(sym) {
            Payload::Symbol { last_env, .. } => *last_env,
            _ => self.wrong_kind(sym, "symbol"),
        }
    }

    pub(crate) fn clear_symbol_lookup_caches(&mut self) {
        let Heap { symbols, arena, .. } = self;
        for sym in symbols.handles() {
            if let Payload::Symbol { last_env, .. } = &mut arena.get_mut(sym).payload {
                *last_env = Handle::NIL;
            }
        }
    }

    fn env_frame(&self, env: Handle) -> Handle {
        match self.payload(env) {
            Payload::Environment { frame, .. } => *frame,
            _ => self.wrong_kind(env, "environment"),
        }
    }

    fn frame_binding(&self, env: Handle, sym: Handle) -> Option<Handle> {
        let mut cell = self.env_frame(env);
        while !cell.is_nil() {
            if self.tag(cell) == sym {
                return Some(cell);
            }
            cell = self.cdr(cell);
        }
        None
    }

    /// Bind `sym` to `value` in `env`, replacing an existing binding.
    pub fn define_var(&mut self, env: Handle, sym: Handle, value: Handle) -> GcResult<()> {
        if let Some(cell) = self.frame_binding(env, sym) {
            self.set_car(cell, value);
            return Ok(());
        }
        let frame = self.env_frame(env);
        let cell = self.allocate_rooted(ObjectKind::Pair, 0, &[env, sym, value])?;
        self.set_car(cell, value);
        self.set_cdr(cell, frame);
        self.set_tag(cell, sym);

        let old = match self.payload_mut(env) {
            Payload::Environment { frame: slot, .. } => std::mem::replace(slot, cell),
            _ => self.wrong_kind(env, "environment"),
        };
        self.replace_reference(old, cell);
        Ok(())
    }

    /// Value of `sym` in `env` itself, without consulting enclosing frames.
    pub fn find_var_in_frame(&self, env: Handle, sym: Handle) -> Option<Handle> {
        self.frame_binding(env, sym).map(|cell| self.car(cell))
    }

    /// Value of `sym` in `env` or an enclosing environment, falling back to
    /// the symbol's base binding.
    pub fn find_var(&mut self, env: Handle, sym: Handle) -> Option<Handle> {
        let mut current = env;
        while !current.is_nil() {
            if let Some(value) = self.find_var_in_frame(current, sym) {
                if let Payload::Symbol { last_env, .. } = &mut self.arena.get_mut(sym).payload {
                    *last_env = current;
                }
                return Some(value);
            }
            current = self.env_enclos(current);
        }
        let base = self.symbol_value(sym);
        (base != Handle::UNBOUND).then_some(base)
    }

    /// Remove the binding of `sym` from `env`. Returns whether one existed.
    pub fn remove_var(&mut self, env: Handle, sym: Handle) -> bool {
        let mut previous = Handle::NIL;
        let mut cell = self.env_frame(env);
        while !cell.is_nil() {
            let next = self.cdr(cell);
            if self.tag(cell) == sym {
                if previous.is_nil() {
                    let old = match self.payload_mut(env) {
                        Payload::Environment { frame, .. } => std::mem::replace(frame, next),
                        _ => self.wrong_kind(env, "environment"),
                    };
                    self.replace_reference(old, next);
                } else {
                    self.set_cdr(previous, next);
                }
                let value = self.car(cell);
                self.decrement_refcount(value);
                return true;
            }
            previous = cell;
            cell = next;
        }
        false
    }
}
