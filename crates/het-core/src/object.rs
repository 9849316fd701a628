//! Full userdata, type names, and raw equality.

use crate::gc::{Arena, GcHeap, GcIdx, GcObject, GcRef, HeapError, MutableObject, ObjKind};
use crate::number::{float_to_integer, F2IMode};
use crate::value::{TValue, NUM_TYPES, T_NONE, V_USERDATA};
use std::mem;

/// A block of host memory with a metatable and attached user values.
pub struct Udata {
    pub metatable: Option<GcIdx<crate::table::Table>>,
    user_values: Vec<TValue>,
    data: Box<[u8]>,
}

impl Udata {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn num_user_values(&self) -> usize {
        self.user_values.len()
    }

    /// User value `n` (0-based), if it exists.
    pub fn user_value(&self, n: usize) -> Option<TValue> {
        self.user_values.get(n).copied()
    }

    /// Returns false if there is no user value `n`.
    pub fn set_user_value(&mut self, n: usize, v: TValue) -> bool {
        match self.user_values.get_mut(n) {
            Some(slot) => {
                *slot = v;
                true
            }
            None => false,
        }
    }

    pub(crate) fn user_values(&self) -> &[TValue] {
        &self.user_values
    }
}

impl GcObject for Udata {
    const KIND: ObjKind = ObjKind::Userdata;

    fn arena(heap: &GcHeap) -> &Arena<Self> {
        &heap.userdata
    }

    fn arena_mut(heap: &mut GcHeap) -> &mut Arena<Self> {
        &mut heap.userdata
    }

    fn variant_tag(&self) -> u8 {
        V_USERDATA
    }

    fn byte_size(&self) -> usize {
        mem::size_of::<Udata>()
            + self.data.len()
            + self.user_values.len() * mem::size_of::<TValue>()
    }
}

impl MutableObject for Udata {}

/// Names of the base types, indexed by type code + 1 (so "no value" is -1).
pub const TYPE_NAMES: [&str; NUM_TYPES + 3] = [
    "no value",
    "nil",
    "boolean",
    "userdata",
    "number",
    "string",
    "table",
    "function",
    "userdata",
    "thread",
    "upvalue",
    "proto",
];

/// Name of a type code, as returned by `TValue::type_tag` (or -1 for none).
pub fn type_name(t: i32) -> &'static str {
    het_assert!(t >= T_NONE && ((t + 1) as usize) < TYPE_NAMES.len());
    TYPE_NAMES
        .get((t + 1) as usize)
        .copied()
        .unwrap_or(TYPE_NAMES[0])
}

impl GcHeap {
    /// Allocate a zeroed userdata block of `size` bytes with `nuvalue` nil
    /// user values.
    pub fn new_userdata(&mut self, size: usize, nuvalue: usize) -> Result<GcIdx<Udata>, HeapError> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| HeapError::OutOfMemory)?;
        data.resize(size, 0u8);
        let mut user_values = Vec::new();
        user_values
            .try_reserve_exact(nuvalue)
            .map_err(|_| HeapError::OutOfMemory)?;
        user_values.resize(nuvalue, TValue::Nil);
        self.link(Udata {
            metatable: None,
            user_values,
            data: data.into_boxed_slice(),
        })
    }

    /// Primitive equality (no `__eq`): numbers by mathematical value across
    /// integer and float, strings by content, everything else by identity.
    pub fn raw_equal(&self, a: &TValue, b: &TValue) -> bool {
        match (*a, *b) {
            (TValue::Integer(x), TValue::Integer(y)) => x == y,
            (TValue::Float(x), TValue::Float(y)) => x == y,
            (TValue::Integer(i), TValue::Float(f)) | (TValue::Float(f), TValue::Integer(i)) => {
                float_to_integer(f, F2IMode::Exact) == Some(i)
            }
            (
                TValue::ShortString(x) | TValue::LongString(x),
                TValue::ShortString(y) | TValue::LongString(y),
            ) => self.eq_strings(x, y),
            _ => a == b,
        }
    }

    /// The value referring to a heap object, for the kinds that have one.
    pub fn value_of(&self, r: GcRef) -> Option<TValue> {
        Some(match r.kind {
            ObjKind::String => {
                let s = r.cast()?;
                self.string_value(s)
            }
            ObjKind::Table => TValue::Table(r.cast()?),
            ObjKind::LClosure => TValue::LClosure(r.cast()?),
            ObjKind::CClosure => TValue::CClosure(r.cast()?),
            ObjKind::Userdata => TValue::Userdata(r.cast()?),
            ObjKind::Thread => TValue::Thread(r.cast()?),
            ObjKind::UpVal | ObjKind::Proto => return None,
        })
    }
}
