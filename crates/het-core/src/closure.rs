//! Closures and upvalues.
//!
//! An upvalue starts open, naming a stack slot of a thread, and is shared by
//! every closure that captures that slot. When the frame owning the slot is
//! discarded the upvalue is closed: the slot's value moves into the upvalue
//! and all sharers keep seeing the same cell.

use crate::gc::{Arena, GcHeap, GcIdx, GcObject, HeapError, MutableObject, ObjKind};
use crate::proto::Proto;
use crate::thread::Thread;
use crate::value::{TValue, V_CCL, V_LCL, V_UPVAL};
use std::mem;
use thiserror::Error;

/// Signature of native functions.
pub type NativeFn = fn(&mut NativeContext<'_>) -> Result<Vec<TValue>, NativeError>;

/// Error raised by a native function.
#[derive(Clone, Debug, Error)]
pub enum NativeError {
    #[error("{0}")]
    Message(String),
    /// An arbitrary error object.
    #[error("error object {0:?}")]
    Value(TValue),
}

/// Context passed to native functions.
pub struct NativeContext<'a> {
    pub args: &'a [TValue],
    pub heap: &'a mut GcHeap,
    /// The running native closure, if it is not a light function.
    pub closure: Option<GcIdx<CClosure>>,
}

impl NativeContext<'_> {
    /// Argument `n` (0-based), or nil.
    pub fn arg(&self, n: usize) -> TValue {
        self.args.get(n).copied().unwrap_or(TValue::Nil)
    }

    /// Captured value `n` of the running closure, or nil.
    pub fn upvalue(&self, n: usize) -> TValue {
        self.closure
            .and_then(|c| self.heap.get(c).upvalues.get(n).copied())
            .unwrap_or(TValue::Nil)
    }
}

/// A closure over a prototype.
pub struct LClosure {
    pub proto: GcIdx<Proto>,
    /// `None` only while the closure is being built.
    upvals: Vec<Option<GcIdx<UpVal>>>,
}

impl LClosure {
    pub fn upval(&self, n: usize) -> Option<GcIdx<UpVal>> {
        self.upvals.get(n).copied().flatten()
    }

    pub fn num_upvals(&self) -> usize {
        self.upvals.len()
    }

    pub(crate) fn upvals(&self) -> impl Iterator<Item = GcIdx<UpVal>> + '_ {
        self.upvals.iter().flatten().copied()
    }
}

/// A native function with captured values stored inline.
pub struct CClosure {
    pub func: NativeFn,
    pub upvalues: Vec<TValue>,
}

/// Where an upvalue's value lives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UpValLocation {
    /// Stack slot `level` of `thread`.
    Open { thread: GcIdx<Thread>, level: usize },
    Closed(TValue),
}

pub struct UpVal {
    location: UpValLocation,
}

impl UpVal {
    pub fn location(&self) -> UpValLocation {
        self.location
    }

    pub fn is_open(&self) -> bool {
        matches!(self.location, UpValLocation::Open { .. })
    }
}

impl GcObject for LClosure {
    const KIND: ObjKind = ObjKind::LClosure;

    fn arena(heap: &GcHeap) -> &Arena<Self> {
        &heap.lclosures
    }

    fn arena_mut(heap: &mut GcHeap) -> &mut Arena<Self> {
        &mut heap.lclosures
    }

    fn variant_tag(&self) -> u8 {
        V_LCL
    }

    fn byte_size(&self) -> usize {
        mem::size_of::<LClosure>() + self.upvals.len() * mem::size_of::<Option<GcIdx<UpVal>>>()
    }
}

impl MutableObject for LClosure {}

impl GcObject for CClosure {
    const KIND: ObjKind = ObjKind::CClosure;

    fn arena(heap: &GcHeap) -> &Arena<Self> {
        &heap.cclosures
    }

    fn arena_mut(heap: &mut GcHeap) -> &mut Arena<Self> {
        &mut heap.cclosures
    }

    fn variant_tag(&self) -> u8 {
        V_CCL
    }

    fn byte_size(&self) -> usize {
        mem::size_of::<CClosure>() + self.upvalues.len() * mem::size_of::<TValue>()
    }
}

impl MutableObject for CClosure {}

impl GcObject for UpVal {
    const KIND: ObjKind = ObjKind::UpVal;

    fn arena(heap: &GcHeap) -> &Arena<Self> {
        &heap.upvals
    }

    fn arena_mut(heap: &mut GcHeap) -> &mut Arena<Self> {
        &mut heap.upvals
    }

    fn variant_tag(&self) -> u8 {
        V_UPVAL
    }

    fn byte_size(&self) -> usize {
        mem::size_of::<UpVal>()
    }
}

impl MutableObject for UpVal {}

impl GcHeap {
    /// A closure over `proto` with all upvalue slots empty.
    pub fn new_lclosure(&mut self, proto: GcIdx<Proto>) -> Result<GcIdx<LClosure>, HeapError> {
        let n = self.get(proto).upvalues.len();
        let mut upvals = Vec::new();
        upvals
            .try_reserve_exact(n)
            .map_err(|_| HeapError::OutOfMemory)?;
        upvals.resize(n, None);
        self.link(LClosure { proto, upvals })
    }

    pub fn new_cclosure(
        &mut self,
        func: NativeFn,
        upvalues: Vec<TValue>,
    ) -> Result<GcIdx<CClosure>, HeapError> {
        self.link(CClosure { func, upvalues })
    }

    /// A fresh closed upvalue holding nil.
    pub fn new_upval(&mut self) -> Result<GcIdx<UpVal>, HeapError> {
        self.link(UpVal {
            location: UpValLocation::Closed(TValue::Nil),
        })
    }

    pub fn set_lclosure_upval(&mut self, cl: GcIdx<LClosure>, n: usize, uv: GcIdx<UpVal>) {
        het_assert!(n < self.get(cl).upvals.len());
        if let Some(slot) = self.get_mut(cl).upvals.get_mut(n) {
            *slot = Some(uv);
        }
    }

    /// Fill every empty upvalue slot of `cl` with a fresh closed nil upvalue.
    pub fn init_upvals(&mut self, cl: GcIdx<LClosure>) -> Result<(), HeapError> {
        for n in 0..self.get(cl).upvals.len() {
            if self.get(cl).upvals[n].is_none() {
                let uv = self.new_upval()?;
                self.get_mut(cl).upvals[n] = Some(uv);
            }
        }
        Ok(())
    }

    /// Instantiate `proto` for a frame of `thread` whose registers start at
    /// `base`. Upvalues captured from the stack are found or created open;
    /// the others are shared with `enclosing`.
    pub fn instantiate(
        &mut self,
        proto: GcIdx<Proto>,
        thread: GcIdx<Thread>,
        base: usize,
        enclosing: Option<GcIdx<LClosure>>,
    ) -> Result<GcIdx<LClosure>, HeapError> {
        let cl = self.new_lclosure(proto)?;
        let descs: Vec<(bool, u8)> = self
            .get(proto)
            .upvalues
            .iter()
            .map(|d| (d.in_stack, d.index))
            .collect();
        for (n, (in_stack, index)) in descs.into_iter().enumerate() {
            let uv = if in_stack {
                Some(self.find_upval(thread, base + index as usize)?)
            } else {
                enclosing.and_then(|e| self.get(e).upval(index as usize))
            };
            if let Some(uv) = uv {
                self.get_mut(cl).upvals[n] = Some(uv);
            }
        }
        self.init_upvals(cl)?;
        Ok(cl)
    }

    /// The open upvalue for stack slot `level` of `thread`, created if no
    /// closure has captured that slot yet.
    pub fn find_upval(
        &mut self,
        thread: GcIdx<Thread>,
        level: usize,
    ) -> Result<GcIdx<UpVal>, HeapError> {
        let pos = match self
            .get(thread)
            .open_upvals
            .binary_search_by_key(&level, |&(l, _)| l)
        {
            Ok(i) => return Ok(self.get(thread).open_upvals[i].1),
            Err(i) => i,
        };
        self.get_mut(thread)
            .open_upvals
            .try_reserve(1)
            .map_err(|_| HeapError::OutOfMemory)?;
        let uv = self.link(UpVal {
            location: UpValLocation::Open { thread, level },
        })?;
        self.get_mut(thread).open_upvals.insert(pos, (level, uv));
        Ok(uv)
    }

    /// Close every open upvalue of `thread` at `level` or above, highest
    /// slot first. Each one takes the current value of its slot.
    pub fn close_upvals(&mut self, thread: GcIdx<Thread>, level: usize) {
        while let Some(&(l, uv)) = self.get(thread).open_upvals.last() {
            if l < level {
                break;
            }
            self.get_mut(thread).open_upvals.pop();
            let value = self.get(thread).stack_get(l);
            if let Some(upval) = self.upvals.get_mut(uv) {
                upval.location = UpValLocation::Closed(value);
            }
        }
    }

    pub fn upval_get(&self, uv: GcIdx<UpVal>) -> TValue {
        match self.get(uv).location {
            UpValLocation::Open { thread, level } => self.get(thread).stack_get(level),
            UpValLocation::Closed(v) => v,
        }
    }

    pub fn upval_set(&mut self, uv: GcIdx<UpVal>, value: TValue) {
        match self.get(uv).location {
            UpValLocation::Open { thread, level } => {
                let stored = self.get_mut(thread).stack_set(level, value);
                het_assert!(stored, "open upvalue above the stack top");
            }
            UpValLocation::Closed(_) => {
                self.get_mut(uv).location = UpValLocation::Closed(value);
            }
        }
    }
}
