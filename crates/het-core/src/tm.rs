//! Metamethod events and lookup with a per-table absence cache.
//!
//! The first six events (`__index` through `__eq`) are "fast": when a
//! metatable lacks one, the miss is recorded as a bit in the table's flags,
//! and later lookups answer "absent" without probing. Any write to the table
//! clears the bits (see `Table::invalidate_tm_cache`).

use crate::gc::{GcHeap, GcIdx};
use crate::table::Table;
use crate::value::TValue;

/// Overridable operations, in their stable order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TagMethod {
    Index = 0,
    NewIndex,
    Gc,
    Mode,
    Len,
    /// Last fast event.
    Eq,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Lt,
    Le,
    Concat,
    Call,
    Close,
}

/// Flag bits covering every fast event.
pub const MASK_FLAGS: u8 = (1 << (TagMethod::Eq as u8 + 1)) - 1;

impl TagMethod {
    pub const ALL: [TagMethod; 25] = [
        TagMethod::Index,
        TagMethod::NewIndex,
        TagMethod::Gc,
        TagMethod::Mode,
        TagMethod::Len,
        TagMethod::Eq,
        TagMethod::Add,
        TagMethod::Sub,
        TagMethod::Mul,
        TagMethod::Mod,
        TagMethod::Pow,
        TagMethod::Div,
        TagMethod::IDiv,
        TagMethod::BAnd,
        TagMethod::BOr,
        TagMethod::BXor,
        TagMethod::Shl,
        TagMethod::Shr,
        TagMethod::Unm,
        TagMethod::BNot,
        TagMethod::Lt,
        TagMethod::Le,
        TagMethod::Concat,
        TagMethod::Call,
        TagMethod::Close,
    ];

    /// Metatable field name, e.g. `"__index"`.
    pub fn name(self) -> &'static str {
        match self {
            TagMethod::Index => "__index",
            TagMethod::NewIndex => "__newindex",
            TagMethod::Gc => "__gc",
            TagMethod::Mode => "__mode",
            TagMethod::Len => "__len",
            TagMethod::Eq => "__eq",
            TagMethod::Add => "__add",
            TagMethod::Sub => "__sub",
            TagMethod::Mul => "__mul",
            TagMethod::Mod => "__mod",
            TagMethod::Pow => "__pow",
            TagMethod::Div => "__div",
            TagMethod::IDiv => "__idiv",
            TagMethod::BAnd => "__band",
            TagMethod::BOr => "__bor",
            TagMethod::BXor => "__bxor",
            TagMethod::Shl => "__shl",
            TagMethod::Shr => "__shr",
            TagMethod::Unm => "__unm",
            TagMethod::BNot => "__bnot",
            TagMethod::Lt => "__lt",
            TagMethod::Le => "__le",
            TagMethod::Concat => "__concat",
            TagMethod::Call => "__call",
            TagMethod::Close => "__close",
        }
    }

    /// Whether absence of this event is cached in table flags.
    #[inline]
    pub fn is_fast(self) -> bool {
        self <= TagMethod::Eq
    }

    #[inline]
    fn flag(self) -> u8 {
        het_assert!(self.is_fast());
        1 << self as u8
    }
}

/// What metamethod lookup needs from the heap. `GcHeap` is the real
/// implementation; tests substitute a counting double.
pub trait MetaAccess {
    /// Current flag byte of a metatable.
    fn tm_flags(&self, mt: GcIdx<Table>) -> u8;
    fn set_tm_flags(&mut self, mt: GcIdx<Table>, flags: u8);
    /// Raw read of the event's field from the metatable.
    fn raw_metamethod(&self, mt: GcIdx<Table>, event: TagMethod) -> TValue;
}

impl MetaAccess for GcHeap {
    fn tm_flags(&self, mt: GcIdx<Table>) -> u8 {
        self.get(mt).flags()
    }

    fn set_tm_flags(&mut self, mt: GcIdx<Table>, flags: u8) {
        self.get_mut(mt).set_flags(flags);
    }

    fn raw_metamethod(&self, mt: GcIdx<Table>, event: TagMethod) -> TValue {
        self.get(mt).get_short_str(self.tm_name(event), &self.strings)
    }
}

/// Look up `event` in `mt`. A miss on a fast event sets its absence bit.
pub fn get_tm<M: MetaAccess + ?Sized>(
    heap: &mut M,
    mt: GcIdx<Table>,
    event: TagMethod,
) -> Option<TValue> {
    let tm = heap.raw_metamethod(mt, event);
    if tm.is_nil() {
        if event.is_fast() {
            let flags = heap.tm_flags(mt);
            heap.set_tm_flags(mt, flags | event.flag());
        }
        return None;
    }
    Some(tm)
}

/// Lookup for a fast event, answering from the absence cache when possible.
pub fn fast_tm<M: MetaAccess + ?Sized>(
    heap: &mut M,
    mt: Option<GcIdx<Table>>,
    event: TagMethod,
) -> Option<TValue> {
    let mt = mt?;
    if heap.tm_flags(mt) & event.flag() != 0 {
        return None;
    }
    get_tm(heap, mt, event)
}

impl GcHeap {
    /// Metamethod `event` of metatable `mt`, without the absence cache for
    /// slow events.
    pub fn metamethod(&mut self, mt: Option<GcIdx<Table>>, event: TagMethod) -> Option<TValue> {
        let mt = mt?;
        if event.is_fast() {
            fast_tm(self, Some(mt), event)
        } else {
            get_tm(self, mt, event)
        }
    }
}
