//! Threads: a value stack addressed by slot index, the open upvalue list,
//! and the native call depth.

use crate::closure::UpVal;
use crate::gc::{Arena, GcHeap, GcIdx, GcObject, HeapError, MemAccount, MutableObject, ObjKind};
use crate::limits::{BASIC_STACK_SIZE, EXTRA_STACK, MAX_C_CALLS, MAX_STACK};
use crate::value::{TValue, V_THREAD};
use std::mem;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("stack overflow")]
    Overflow,
    #[error("C stack overflow")]
    CStackOverflow,
    #[error("not enough memory")]
    OutOfMemory,
}

impl From<HeapError> for StackError {
    fn from(_: HeapError) -> Self {
        StackError::OutOfMemory
    }
}

pub struct Thread {
    /// Live slots; `stack.len()` is the top.
    stack: Vec<TValue>,
    /// Slots paid for in the memory account (`>= stack.len()`).
    size: usize,
    max_stack: usize,
    max_c_calls: u32,
    n_ccalls: u32,
    /// Open upvalues sorted by slot, lowest first.
    pub(crate) open_upvals: Vec<(usize, GcIdx<UpVal>)>,
}

impl Thread {
    /// Index of the first free slot.
    pub fn top(&self) -> usize {
        self.stack.len()
    }

    pub fn stack(&self) -> &[TValue] {
        &self.stack
    }

    /// Allocated stack size in slots.
    pub fn stack_size(&self) -> usize {
        self.size
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    /// Value in slot `level`; nil above the top.
    pub fn stack_get(&self, level: usize) -> TValue {
        self.stack.get(level).copied().unwrap_or(TValue::Nil)
    }

    /// Store into a live slot. Returns false above the top.
    pub fn stack_set(&mut self, level: usize, v: TValue) -> bool {
        match self.stack.get_mut(level) {
            Some(slot) => {
                *slot = v;
                true
            }
            None => false,
        }
    }

    pub fn has_open_upvals(&self) -> bool {
        !self.open_upvals.is_empty()
    }

    pub fn c_calls(&self) -> u32 {
        self.n_ccalls
    }

    /// Count a nested native call; fails past the configured limit.
    pub fn enter_c_call(&mut self) -> Result<(), StackError> {
        if self.n_ccalls >= self.max_c_calls {
            return Err(StackError::CStackOverflow);
        }
        self.n_ccalls += 1;
        Ok(())
    }

    pub fn leave_c_call(&mut self) {
        het_assert!(self.n_ccalls > 0);
        self.n_ccalls = self.n_ccalls.saturating_sub(1);
    }

    /// Make room for `n` more slots above the top. The stack may grow up to
    /// `max_stack` slots (plus the reserved extra).
    fn ensure(&mut self, n: usize, mem: &mut MemAccount) -> Result<(), StackError> {
        let needed = self.stack.len().checked_add(n).ok_or(StackError::Overflow)?;
        if needed > self.max_stack {
            return Err(StackError::Overflow);
        }
        if needed <= self.size {
            return Ok(());
        }
        let new_size = needed
            .max(self.size.saturating_mul(2))
            .min(self.max_stack + EXTRA_STACK);
        let slot = mem::size_of::<TValue>();
        mem.resize(self.size * slot, new_size * slot)?;
        if self
            .stack
            .try_reserve_exact(new_size - self.stack.len())
            .is_err()
        {
            mem.resize(new_size * slot, self.size * slot)?;
            return Err(StackError::OutOfMemory);
        }
        log::trace!("thread stack grown from {} to {} slots", self.size, new_size);
        self.size = new_size;
        Ok(())
    }
}

impl GcObject for Thread {
    const KIND: ObjKind = ObjKind::Thread;

    fn arena(heap: &GcHeap) -> &Arena<Self> {
        &heap.threads
    }

    fn arena_mut(heap: &mut GcHeap) -> &mut Arena<Self> {
        &mut heap.threads
    }

    fn variant_tag(&self) -> u8 {
        V_THREAD
    }

    fn byte_size(&self) -> usize {
        mem::size_of::<Thread>() + self.size * mem::size_of::<TValue>()
    }
}

impl MutableObject for Thread {}

impl GcHeap {
    /// A thread with the default limits.
    pub fn new_thread(&mut self) -> Result<GcIdx<Thread>, HeapError> {
        self.new_thread_with_limits(MAX_STACK, MAX_C_CALLS)
    }

    pub fn new_thread_with_limits(
        &mut self,
        max_stack: usize,
        max_c_calls: u32,
    ) -> Result<GcIdx<Thread>, HeapError> {
        let size = BASIC_STACK_SIZE.min(max_stack + EXTRA_STACK);
        let mut stack = Vec::new();
        stack
            .try_reserve_exact(size)
            .map_err(|_| HeapError::OutOfMemory)?;
        self.link(Thread {
            stack,
            size,
            max_stack,
            max_c_calls,
            n_ccalls: 0,
            open_upvals: Vec::new(),
        })
    }

    fn thread_parts(&mut self, th: GcIdx<Thread>) -> (&mut Thread, &mut MemAccount) {
        let GcHeap { threads, mem, .. } = self;
        match threads.get_mut(th) {
            Some(thread) => (thread, mem),
            None => panic!("thread handle {th:?} refers to a freed object"),
        }
    }

    /// Make room for `n` more values on `th`'s stack.
    pub fn thread_ensure(&mut self, th: GcIdx<Thread>, n: usize) -> Result<(), StackError> {
        let (thread, mem) = self.thread_parts(th);
        thread.ensure(n, mem)
    }

    pub fn thread_push(&mut self, th: GcIdx<Thread>, v: TValue) -> Result<(), StackError> {
        let (thread, mem) = self.thread_parts(th);
        thread.ensure(1, mem)?;
        thread.stack.push(v);
        Ok(())
    }

    /// Move the top to `top`, filling new slots with nil. Open upvalues must
    /// already be closed for slots being discarded.
    pub fn thread_set_top(&mut self, th: GcIdx<Thread>, top: usize) -> Result<(), StackError> {
        let (thread, mem) = self.thread_parts(th);
        let len = thread.stack.len();
        if top > len {
            thread.ensure(top - len, mem)?;
            thread.stack.resize(top, TValue::Nil);
        } else {
            het_assert!(
                thread.open_upvals.last().map_or(true, |&(l, _)| l < top),
                "discarding a slot with an open upvalue"
            );
            thread.stack.truncate(top);
        }
        Ok(())
    }

    pub fn thread_pop(&mut self, th: GcIdx<Thread>) -> Option<TValue> {
        self.get_mut(th).stack.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::HeapConfig;

    fn heap() -> GcHeap {
        GcHeap::new(HeapConfig::default()).unwrap()
    }

    #[test]
    fn test_push_and_grow() {
        let mut heap = heap();
        let th = heap.new_thread().unwrap();
        let before = heap.mem().total();
        for i in 0..100 {
            heap.thread_push(th, TValue::from_integer(i)).unwrap();
        }
        let t = heap.get(th);
        assert_eq!(t.top(), 100);
        assert!(t.stack_size() >= 100);
        assert_eq!(t.stack_get(99), TValue::from_integer(99));
        assert_eq!(t.stack_get(100), TValue::Nil);
        assert!(heap.mem().total() > before);
    }

    #[test]
    fn test_stack_overflow() {
        let mut heap = heap();
        let th = heap.new_thread_with_limits(50, MAX_C_CALLS).unwrap();
        assert_eq!(heap.thread_set_top(th, 50), Ok(()));
        assert_eq!(
            heap.thread_push(th, TValue::Nil),
            Err(StackError::Overflow)
        );
        assert_eq!(heap.get(th).top(), 50);
    }

    #[test]
    fn test_growth_respects_memory_limit() {
        let mut heap = heap();
        let th = heap.new_thread().unwrap();
        let total = heap.mem().total();
        heap.set_memory_limit(Some(total));
        assert_eq!(
            heap.thread_set_top(th, 1000),
            Err(StackError::OutOfMemory)
        );
        assert_eq!(heap.get(th).top(), 0);
        assert_eq!(heap.mem().total(), total);
    }

    #[test]
    fn test_set_top_shrinks_and_fills_nil() {
        let mut heap = heap();
        let th = heap.new_thread().unwrap();
        heap.thread_push(th, TValue::from_bool(true)).unwrap();
        heap.thread_set_top(th, 3).unwrap();
        assert_eq!(heap.get(th).stack(), &[TValue::from_bool(true), TValue::Nil, TValue::Nil]);
        heap.thread_set_top(th, 1).unwrap();
        assert_eq!(heap.thread_pop(th), Some(TValue::from_bool(true)));
        assert_eq!(heap.thread_pop(th), None);
    }

    #[test]
    fn test_c_call_limit() {
        let mut heap = heap();
        let th = heap.new_thread_with_limits(MAX_STACK, 3).unwrap();
        let t = heap.get_mut(th);
        for _ in 0..3 {
            t.enter_c_call().unwrap();
        }
        assert_eq!(t.enter_c_call(), Err(StackError::CStackOverflow));
        t.leave_c_call();
        assert_eq!(t.c_calls(), 2);
        assert!(t.enter_c_call().is_ok());
    }
}
