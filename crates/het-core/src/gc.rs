//! GC heap with arena-based allocation and typed, generation-checked handles.
//!
//! Every collectable object lives in the arena for its type. Each slot carries
//! a [`GcHeader`] (type tag, mark bits, link to the next object) so the whole
//! heap can be walked as one allocation list, newest first.

use crate::closure::{CClosure, LClosure, UpVal};
use crate::limits::HeapConfig;
use crate::object::Udata;
use crate::proto::Proto;
use crate::string::{StrCache, StringTable, TString};
use crate::table::Table;
use crate::thread::Thread;
use crate::tm::TagMethod;
use crate::value::TValue;
use bitflags::bitflags;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// A typed handle to an object in one of the heap's arenas.
///
/// The generation makes handles to freed (and possibly reused) slots detectable.
pub struct GcIdx<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> GcIdx<T> {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        GcIdx {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl<T: GcObject> GcIdx<T> {
    /// Erase the type, keeping the kind.
    pub fn to_ref(self) -> GcRef {
        GcRef {
            kind: T::KIND,
            index: self.index,
            generation: self.generation,
        }
    }
}

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for GcIdx<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcIdx({}@{})", self.index, self.generation)
    }
}

/// Kind of heap object; selects the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjKind {
    String,
    Table,
    LClosure,
    CClosure,
    UpVal,
    Proto,
    Userdata,
    Thread,
}

/// An untyped handle, as stored in the allocation list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GcRef {
    pub kind: ObjKind,
    pub index: u32,
    pub generation: u32,
}

impl GcRef {
    /// Recover the typed handle if the kind matches.
    pub fn cast<T: GcObject>(self) -> Option<GcIdx<T>> {
        (self.kind == T::KIND).then(|| GcIdx::new(self.index, self.generation))
    }
}

bitflags! {
    /// Collector bits kept in each header.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Marks: u8 {
        /// Reached during the current mark phase.
        const BLACK = 1 << 0;
        /// Never collected.
        const FIXED = 1 << 1;
        /// Has a `__gc` metamethod and has not been finalized yet.
        const FINALIZABLE = 1 << 2;
        /// Already handed out for finalization.
        const FINALIZED = 1 << 3;
    }
}

/// Common prefix of every heap object.
#[derive(Clone, Copy, Debug)]
pub struct GcHeader {
    pub(crate) next: Option<GcRef>,
    tt: u8,
    pub(crate) marked: Marks,
}

impl GcHeader {
    /// Stored type tag (type and variant bits).
    pub fn tt(&self) -> u8 {
        self.tt
    }

    pub fn marked(&self) -> Marks {
        self.marked
    }

    /// Next (older) object in the allocation list.
    pub fn next(&self) -> Option<GcRef> {
        self.next
    }
}

/// Allocation failure. Nothing is linked when this is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("not enough memory")]
    OutOfMemory,
}

struct Slot<T> {
    header: GcHeader,
    generation: u32,
    object: Option<T>,
}

/// Storage for one object type, with a free list of reusable slots.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn insert(&mut self, header: GcHeader, object: T) -> Result<(u32, u32), HeapError> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.header = header;
            slot.object = Some(object);
            self.live += 1;
            return Ok((index, slot.generation));
        }
        if self.slots.len() >= u32::MAX as usize {
            return Err(HeapError::OutOfMemory);
        }
        self.slots
            .try_reserve(1)
            .map_err(|_| HeapError::OutOfMemory)?;
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            header,
            generation: 0,
            object: Some(object),
        });
        self.live += 1;
        Ok((index, 0))
    }

    /// Free a slot. The generation bump invalidates outstanding handles.
    fn remove(&mut self, index: u32, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != generation {
            return None;
        }
        let object = slot.object.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.header.next = None;
        slot.header.marked = Marks::empty();
        self.free.push(index);
        self.live -= 1;
        Some(object)
    }

    pub fn get(&self, idx: GcIdx<T>) -> Option<&T> {
        let slot = self.slots.get(idx.index as usize)?;
        if slot.generation != idx.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub fn get_mut(&mut self, idx: GcIdx<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(idx.index as usize)?;
        if slot.generation != idx.generation {
            return None;
        }
        slot.object.as_mut()
    }

    fn header(&self, index: u32, generation: u32) -> Option<&GcHeader> {
        let slot = self.slots.get(index as usize)?;
        (slot.generation == generation && slot.object.is_some()).then_some(&slot.header)
    }

    fn header_mut(&mut self, index: u32, generation: u32) -> Option<&mut GcHeader> {
        let slot = self.slots.get_mut(index as usize)?;
        (slot.generation == generation && slot.object.is_some()).then_some(&mut slot.header)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live objects with their handles, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (GcIdx<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.object
                .as_ref()
                .map(|o| (GcIdx::new(i as u32, slot.generation), o))
        })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by every heap-allocated type.
pub trait GcObject: Sized {
    const KIND: ObjKind;
    fn arena(heap: &GcHeap) -> &Arena<Self>;
    fn arena_mut(heap: &mut GcHeap) -> &mut Arena<Self>;
    /// Type tag stamped into the header (type and variant bits).
    fn variant_tag(&self) -> u8;
    /// Approximate bytes owned by the object, for the memory account.
    fn byte_size(&self) -> usize;
}

/// Objects the heap hands out mutably. Strings and prototypes are immutable
/// once created and do not implement it.
pub trait MutableObject: GcObject {}

/// Approximate byte count of live objects, with an optional ceiling.
#[derive(Clone, Debug, Default)]
pub struct MemAccount {
    total: usize,
    limit: Option<usize>,
}

impl MemAccount {
    pub fn new(limit: Option<usize>) -> Self {
        MemAccount { total: 0, limit }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Account for `bytes` more, failing without change if over the limit.
    pub fn charge(&mut self, bytes: usize) -> Result<(), HeapError> {
        let total = self
            .total
            .checked_add(bytes)
            .ok_or(HeapError::OutOfMemory)?;
        if self.limit.is_some_and(|limit| total > limit) {
            return Err(HeapError::OutOfMemory);
        }
        self.total = total;
        Ok(())
    }

    pub fn release(&mut self, bytes: usize) {
        self.total = self.total.saturating_sub(bytes);
    }

    /// Move an object's charge from `old` to `new` bytes.
    pub fn resize(&mut self, old: usize, new: usize) -> Result<(), HeapError> {
        if new > old {
            self.charge(new - old)
        } else {
            self.release(old - new);
            Ok(())
        }
    }
}

/// Snapshot of heap counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub objects: usize,
    pub bytes: usize,
    pub interned_strings: usize,
    pub strcache_hits: u64,
    pub strcache_misses: u64,
}

/// The object heap.
pub struct GcHeap {
    pub(crate) strings: Arena<TString>,
    pub(crate) tables: Arena<Table>,
    pub(crate) lclosures: Arena<LClosure>,
    pub(crate) cclosures: Arena<CClosure>,
    pub(crate) upvals: Arena<UpVal>,
    pub(crate) protos: Arena<Proto>,
    pub(crate) userdata: Arena<Udata>,
    pub(crate) threads: Arena<Thread>,
    /// Head of the allocation list (newest object).
    allgc: Option<GcRef>,
    pub(crate) strt: StringTable,
    pub(crate) strcache: StrCache,
    pub(crate) mem: MemAccount,
    seed: u32,
    tm_names: Vec<GcIdx<TString>>,
    mem_err_msg: Option<GcIdx<TString>>,
}

impl GcHeap {
    /// Create a heap and its fixed strings (metamethod names and the
    /// out-of-memory message).
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        let mut heap = GcHeap {
            strings: Arena::new(),
            tables: Arena::new(),
            lclosures: Arena::new(),
            cclosures: Arena::new(),
            upvals: Arena::new(),
            protos: Arena::new(),
            userdata: Arena::new(),
            threads: Arena::new(),
            allgc: None,
            strt: StringTable::with_size(config.string_table_size)?,
            strcache: StrCache::new(),
            mem: MemAccount::new(config.memory_limit),
            seed: config.seed,
            tm_names: Vec::with_capacity(TagMethod::ALL.len()),
            mem_err_msg: None,
        };
        let msg = heap.intern(b"not enough memory")?;
        heap.fix(msg.to_ref());
        heap.mem_err_msg = Some(msg);
        for tm in TagMethod::ALL {
            let name = heap.intern(tm.name().as_bytes())?;
            heap.fix(name.to_ref());
            heap.tm_names.push(name);
        }
        log::debug!(
            "heap created: seed={:#x}, string table size={}",
            heap.seed,
            heap.strt.size()
        );
        Ok(heap)
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn mem(&self) -> &MemAccount {
        &self.mem
    }

    pub fn set_memory_limit(&mut self, limit: Option<usize>) {
        self.mem.set_limit(limit);
    }

    /// Interned name of a metamethod event (a fixed string).
    pub fn tm_name(&self, event: TagMethod) -> GcIdx<TString> {
        self.tm_names[event as usize]
    }

    /// The preallocated "not enough memory" message.
    pub fn memory_error_message(&self) -> Option<GcIdx<TString>> {
        self.mem_err_msg
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            objects: self.strings.len()
                + self.tables.len()
                + self.lclosures.len()
                + self.cclosures.len()
                + self.upvals.len()
                + self.protos.len()
                + self.userdata.len()
                + self.threads.len(),
            bytes: self.mem.total(),
            interned_strings: self.strt.len(),
            strcache_hits: self.strcache.hits(),
            strcache_misses: self.strcache.misses(),
        }
    }

    // ---- Allocation ----

    /// Stamp the header and link `object` at the head of the allocation list.
    /// On failure the list and the memory account are unchanged.
    pub(crate) fn link<T: GcObject>(&mut self, object: T) -> Result<GcIdx<T>, HeapError> {
        let size = object.byte_size();
        self.mem.charge(size)?;
        let header = GcHeader {
            next: self.allgc,
            tt: object.variant_tag(),
            marked: Marks::empty(),
        };
        let (index, generation) = match T::arena_mut(self).insert(header, object) {
            Ok(slot) => slot,
            Err(e) => {
                self.mem.release(size);
                return Err(e);
            }
        };
        let idx = GcIdx::new(index, generation);
        self.allgc = Some(idx.to_ref());
        Ok(idx)
    }

    /// Exempt an object from collection.
    pub fn fix(&mut self, r: GcRef) {
        if let Some(h) = self.header_mut(r) {
            h.marked.insert(Marks::FIXED);
        }
    }

    /// Head of the allocation list.
    pub fn allgc(&self) -> Option<GcRef> {
        self.allgc
    }

    /// Walk the allocation list from the newest object.
    pub fn allocation_list(&self) -> impl Iterator<Item = GcRef> + '_ {
        std::iter::successors(self.allgc, move |r| self.header(*r).and_then(|h| h.next))
    }

    pub(crate) fn set_allgc(&mut self, head: Option<GcRef>) {
        self.allgc = head;
    }

    // ---- Access ----

    /// Borrow a live object. Panics on a stale handle.
    pub fn get<T: GcObject>(&self, idx: GcIdx<T>) -> &T {
        match T::arena(self).get(idx) {
            Some(obj) => obj,
            None => panic!("{:?} handle {:?} refers to a freed object", T::KIND, idx),
        }
    }

    /// Mutably borrow a live object. Panics on a stale handle.
    pub fn get_mut<T: MutableObject>(&mut self, idx: GcIdx<T>) -> &mut T {
        match T::arena_mut(self).get_mut(idx) {
            Some(obj) => obj,
            None => panic!("{:?} handle {:?} refers to a freed object", T::KIND, idx),
        }
    }

    pub fn try_get<T: GcObject>(&self, idx: GcIdx<T>) -> Option<&T> {
        T::arena(self).get(idx)
    }

    pub fn header(&self, r: GcRef) -> Option<&GcHeader> {
        match r.kind {
            ObjKind::String => self.strings.header(r.index, r.generation),
            ObjKind::Table => self.tables.header(r.index, r.generation),
            ObjKind::LClosure => self.lclosures.header(r.index, r.generation),
            ObjKind::CClosure => self.cclosures.header(r.index, r.generation),
            ObjKind::UpVal => self.upvals.header(r.index, r.generation),
            ObjKind::Proto => self.protos.header(r.index, r.generation),
            ObjKind::Userdata => self.userdata.header(r.index, r.generation),
            ObjKind::Thread => self.threads.header(r.index, r.generation),
        }
    }

    pub(crate) fn header_mut(&mut self, r: GcRef) -> Option<&mut GcHeader> {
        match r.kind {
            ObjKind::String => self.strings.header_mut(r.index, r.generation),
            ObjKind::Table => self.tables.header_mut(r.index, r.generation),
            ObjKind::LClosure => self.lclosures.header_mut(r.index, r.generation),
            ObjKind::CClosure => self.cclosures.header_mut(r.index, r.generation),
            ObjKind::UpVal => self.upvals.header_mut(r.index, r.generation),
            ObjKind::Proto => self.protos.header_mut(r.index, r.generation),
            ObjKind::Userdata => self.userdata.header_mut(r.index, r.generation),
            ObjKind::Thread => self.threads.header_mut(r.index, r.generation),
        }
    }

    pub fn is_alive(&self, r: GcRef) -> bool {
        self.header(r).is_some()
    }

    /// Free one object, returning its bytes to the account.
    pub(crate) fn free_object(&mut self, r: GcRef) {
        let size = match r.kind {
            ObjKind::String => self.strings.remove(r.index, r.generation).map(|o| o.byte_size()),
            ObjKind::Table => self.tables.remove(r.index, r.generation).map(|o| o.byte_size()),
            ObjKind::LClosure => self
                .lclosures
                .remove(r.index, r.generation)
                .map(|o| o.byte_size()),
            ObjKind::CClosure => self
                .cclosures
                .remove(r.index, r.generation)
                .map(|o| o.byte_size()),
            ObjKind::UpVal => self.upvals.remove(r.index, r.generation).map(|o| o.byte_size()),
            ObjKind::Proto => self.protos.remove(r.index, r.generation).map(|o| o.byte_size()),
            ObjKind::Userdata => self
                .userdata
                .remove(r.index, r.generation)
                .map(|o| o.byte_size()),
            ObjKind::Thread => self.threads.remove(r.index, r.generation).map(|o| o.byte_size()),
        };
        if let Some(size) = size {
            self.mem.release(size);
        }
    }

    // ---- Value checks ----

    /// Check that a collectable value refers to a live object whose stored tag
    /// matches the value's tag. Only active in checked builds.
    pub fn check_value(&self, v: &TValue) {
        if let Some(r) = v.gc_ref() {
            let header = self.header(r);
            het_assert!(header.is_some(), "value {v:?} refers to a dead object");
            if let Some(h) = header {
                het_assert!(
                    h.tt() == v.variant_tag(),
                    "value tag {:#x} does not match object tag {:#x}",
                    v.variant_tag(),
                    h.tt()
                );
            }
        }
    }

    /// Whole-value copy; checked builds re-validate liveness.
    #[inline]
    pub fn copy_value(&self, v: &TValue) -> TValue {
        let copy = *v;
        if cfg!(any(debug_assertions, feature = "checked")) {
            self.check_value(&copy);
        }
        copy
    }
}
