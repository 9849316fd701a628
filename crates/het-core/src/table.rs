//! Hybrid array+hash tables.
//!
//! The array part holds integer keys `1..=array.len()`. The hash part is a
//! power-of-two vector of nodes using closed hashing: colliding keys are
//! placed in a free node (found by scanning down from `lastfree`) and linked
//! to their chain through relative `next` offsets. A key whose value becomes
//! empty stays in its node, so `next` can continue from it; the collector
//! later turns such keys into dead keys.

use crate::gc::{Arena, GcHeap, GcIdx, GcObject, HeapError, MemAccount, MutableObject, ObjKind};
use crate::limits::{
    Integer, Unsigned, MAX_ABITS, MAX_ASIZE, MAX_HBITS, MAX_INTEGER, MAX_SHORT_LEN,
};
use crate::number::{ceil_log2, float_to_integer, F2IMode};
use crate::string::TString;
use crate::tm::MASK_FLAGS;
use crate::value::{TValue, V_TABLE};
use std::mem;
use thiserror::Error;

/// Flag bit: `alimit` is not the real array size.
pub const BITRAS: u8 = 1 << 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("index is nil")]
    NilIndex,
    #[error("index is NaN")]
    NanIndex,
    #[error("invalid key to 'next'")]
    InvalidNextKey,
    #[error("table overflow")]
    Overflow,
    #[error("not enough memory")]
    OutOfMemory,
}

impl From<HeapError> for TableError {
    fn from(_: HeapError) -> Self {
        TableError::OutOfMemory
    }
}

/// Key slot of a hash node.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NodeKey {
    /// Never used since the last resize.
    Nil,
    Key(TValue),
    /// Removed entry whose key object may be gone; compared by identity only.
    Dead(TValue),
}

#[derive(Clone, Copy, Debug)]
struct Node {
    val: TValue,
    key: NodeKey,
    /// Offset to the next node in the collision chain; 0 ends it.
    next: i32,
}

impl Node {
    const FREE: Node = Node {
        val: TValue::Empty,
        key: NodeKey::Nil,
        next: 0,
    };
}

/// What a table mutation needs from the rest of the heap.
pub struct TableEnv<'a> {
    pub strings: &'a Arena<TString>,
    pub mem: &'a mut MemAccount,
}

enum Slot {
    Array(usize),
    Node(usize),
    Absent,
}

/// A table object.
pub struct Table {
    /// Absent-metamethod cache (low bits) and `BITRAS`.
    flags: u8,
    /// log2 of the node vector size.
    lsizenode: u8,
    /// Length hint for `#`; equals `array.len()` unless `BITRAS` is set.
    alimit: usize,
    array: Vec<TValue>,
    /// Empty means no hash part.
    node: Vec<Node>,
    /// Free nodes are all below this index.
    lastfree: usize,
    pub metatable: Option<GcIdx<Table>>,
}

fn alloc_array(size: usize) -> Result<Vec<TValue>, TableError> {
    if size > MAX_ASIZE {
        return Err(TableError::Overflow);
    }
    let mut array = Vec::new();
    array
        .try_reserve_exact(size)
        .map_err(|_| TableError::OutOfMemory)?;
    Ok(array)
}

fn alloc_nodes(size: usize) -> Result<(Vec<Node>, u8), TableError> {
    if size == 0 {
        return Ok((Vec::new(), 0));
    }
    if size > 1 << MAX_HBITS {
        return Err(TableError::Overflow);
    }
    let lsize = ceil_log2(size as u32);
    let mut nodes = Vec::new();
    nodes
        .try_reserve_exact(1 << lsize)
        .map_err(|_| TableError::OutOfMemory)?;
    nodes.resize(1 << lsize, Node::FREE);
    Ok((nodes, lsize as u8))
}

fn byte_size_for(asize: usize, nsize: usize) -> usize {
    mem::size_of::<Table>() + asize * mem::size_of::<TValue>() + nsize * mem::size_of::<Node>()
}

/// Array index for `k`, or 0 if it cannot live in the array part.
fn array_index(k: Integer) -> usize {
    if k >= 1 && (k as Unsigned as u64) <= MAX_ASIZE as u64 {
        k as usize
    } else {
        0
    }
}

fn count_int(key: Integer, nums: &mut [u32]) -> u32 {
    let k = array_index(key);
    if k != 0 {
        nums[ceil_log2(k as u32) as usize] += 1;
        1
    } else {
        0
    }
}

/// Pick the array size: the largest power of two `n` such that more than
/// `n / 2` of the slots `1..=n` would be in use. `pna` is the number of
/// integer keys on entry and the number going to the array part on exit.
fn compute_sizes(nums: &[u32], pna: &mut u32) -> usize {
    let mut a = 0u32;
    let mut na = 0u32;
    let mut optimal = 0usize;
    let mut twotoi = 1u64;
    for &count in nums {
        if *pna as u64 <= twotoi / 2 {
            break;
        }
        a += count;
        if a as u64 > twotoi / 2 {
            optimal = twotoi as usize;
            na = a;
        }
        twotoi *= 2;
    }
    het_assert!((optimal == 0 || optimal / 2 < na as usize) && na as usize <= optimal);
    *pna = na;
    optimal
}

/// Normalize a key for writing: nil and NaN are errors, integral floats
/// become integers.
fn normalize_key(key: TValue) -> Result<TValue, TableError> {
    match key {
        k if k.is_nil() => Err(TableError::NilIndex),
        TValue::Float(f) => match float_to_integer(f, F2IMode::Exact) {
            Some(i) => Ok(TValue::Integer(i)),
            None if f.is_nan() => Err(TableError::NanIndex),
            None => Ok(key),
        },
        k => Ok(k),
    }
}

fn float_hash(f: f64) -> u64 {
    let bits = f.to_bits();
    bits ^ (bits >> 32)
}

fn offset(i: usize, delta: i32) -> usize {
    (i as isize + delta as isize) as usize
}

impl Table {
    /// Create a table with `narray` array slots and room for `nhash` hash entries.
    pub fn new(narray: usize, nhash: usize) -> Result<Self, TableError> {
        let mut array = alloc_array(narray)?;
        array.resize(narray, TValue::Empty);
        let (node, lsizenode) = alloc_nodes(nhash)?;
        Ok(Table {
            flags: MASK_FLAGS,
            lsizenode,
            alimit: narray,
            array,
            lastfree: node.len(),
            node,
            metatable: None,
        })
    }

    // ---- Sizes and flags ----

    /// Real size of the array part.
    pub fn array_size(&self) -> usize {
        self.array.len()
    }

    /// Number of nodes in the hash part (0 when there is none).
    pub fn node_size(&self) -> usize {
        self.node.len()
    }

    pub fn lsizenode(&self) -> u8 {
        self.lsizenode
    }

    /// Current length hint.
    pub fn alimit(&self) -> usize {
        self.alimit
    }

    pub fn is_dummy(&self) -> bool {
        self.node.is_empty()
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    /// Forget all cached metamethod absences.
    pub fn invalidate_tm_cache(&mut self) {
        self.flags &= !MASK_FLAGS;
    }

    pub fn is_real_asize(&self) -> bool {
        self.flags & BITRAS == 0
    }

    fn set_limit(&mut self, limit: usize) {
        self.alimit = limit;
        if limit == self.array.len() {
            self.flags &= !BITRAS;
        } else {
            self.flags |= BITRAS;
        }
    }

    fn set_limit_to_size(&mut self) -> usize {
        self.set_limit(self.array.len());
        self.alimit
    }

    /// Approximate bytes owned by the table.
    pub fn byte_size(&self) -> usize {
        byte_size_for(self.array.len(), self.node.len())
    }

    // ---- Hashing ----

    fn hash_mod(&self, n: u64) -> usize {
        (n % (((self.node.len() - 1) | 1) as u64)) as usize
    }

    fn hash_pow2(&self, n: u32) -> usize {
        n as usize & (self.node.len() - 1)
    }

    /// Main position of a key. Requires a non-empty hash part.
    fn main_position(&self, key: &TValue, strings: &Arena<TString>) -> usize {
        match *key {
            TValue::Integer(i) => self.hash_mod(i as Unsigned as u64),
            TValue::Float(f) => self.hash_mod(float_hash(f as f64)),
            TValue::ShortString(s) | TValue::LongString(s) => {
                self.hash_pow2(strings.get(s).map_or(0, |s| s.hash()))
            }
            TValue::Boolean(b) => self.hash_pow2(b as u32),
            TValue::LightUserdata(p) => self.hash_mod(p as u64),
            TValue::LightFunction(f) => self.hash_mod(f as usize as u64),
            _ => match key.gc_ref() {
                Some(r) => self.hash_mod(((r.kind as u64) << 32) | r.index as u64),
                None => 0,
            },
        }
    }

    fn key_matches(key: &TValue, nk: &NodeKey, dead_ok: bool, strings: &Arena<TString>) -> bool {
        match nk {
            NodeKey::Nil => false,
            NodeKey::Dead(d) => dead_ok && key.is_collectable() && key.gc_ref() == d.gc_ref(),
            NodeKey::Key(k) => match (*key, *k) {
                (TValue::LongString(a), TValue::LongString(b)) => {
                    a == b
                        || match (strings.get(a), strings.get(b)) {
                            (Some(sa), Some(sb)) => {
                                sa.len() == sb.len() && sa.as_bytes() == sb.as_bytes()
                            }
                            _ => false,
                        }
                }
                (TValue::Float(a), TValue::Float(b)) => a == b,
                _ => *key == *k,
            },
        }
    }

    fn find_node(&self, key: &TValue, dead_ok: bool, strings: &Arena<TString>) -> Option<usize> {
        if self.node.is_empty() {
            return None;
        }
        let mut i = self.main_position(key, strings);
        loop {
            if Self::key_matches(key, &self.node[i].key, dead_ok, strings) {
                return Some(i);
            }
            let nx = self.node[i].next;
            if nx == 0 {
                return None;
            }
            i = offset(i, nx);
        }
    }

    fn find_int_node(&self, key: Integer) -> Option<usize> {
        if self.node.is_empty() {
            return None;
        }
        let mut i = self.hash_mod(key as Unsigned as u64);
        loop {
            if matches!(self.node[i].key, NodeKey::Key(TValue::Integer(k)) if k == key) {
                return Some(i);
            }
            let nx = self.node[i].next;
            if nx == 0 {
                return None;
            }
            i = offset(i, nx);
        }
    }

    /// Locate the slot for an already normalized key.
    fn find_slot(&self, key: &TValue, strings: &Arena<TString>) -> Slot {
        if let TValue::Integer(i) = *key {
            let k = array_index(i);
            if k != 0 && k <= self.array.len() {
                return Slot::Array(k - 1);
            }
            return self.find_int_node(i).map_or(Slot::Absent, Slot::Node);
        }
        self.find_node(key, false, strings)
            .map_or(Slot::Absent, Slot::Node)
    }

    // ---- Reads ----

    /// Raw get. Absent keys yield `TValue::AbsentKey`; deleted entries yield
    /// an empty value. Both are nil.
    pub fn get(&self, key: &TValue, strings: &Arena<TString>) -> TValue {
        let key = match *key {
            k if k.is_nil() => return TValue::AbsentKey,
            TValue::Float(f) => match float_to_integer(f, F2IMode::Exact) {
                Some(i) => TValue::Integer(i),
                None => *key,
            },
            k => k,
        };
        match self.find_slot(&key, strings) {
            Slot::Array(i) => self.array[i],
            Slot::Node(i) => self.node[i].val,
            Slot::Absent => TValue::AbsentKey,
        }
    }

    /// Integer-key fast path.
    pub fn get_int(&self, key: Integer) -> TValue {
        let k = array_index(key);
        if k != 0 && k <= self.array.len() {
            return self.array[k - 1];
        }
        match self.find_int_node(key) {
            Some(i) => self.node[i].val,
            None => TValue::AbsentKey,
        }
    }

    /// Short-string fast path: interned strings compare by handle.
    pub fn get_short_str(&self, key: GcIdx<TString>, strings: &Arena<TString>) -> TValue {
        if self.node.is_empty() {
            return TValue::AbsentKey;
        }
        let mut i = self.hash_pow2(strings.get(key).map_or(0, |s| s.hash()));
        loop {
            if matches!(self.node[i].key, NodeKey::Key(TValue::ShortString(s)) if s == key) {
                return self.node[i].val;
            }
            let nx = self.node[i].next;
            if nx == 0 {
                return TValue::AbsentKey;
            }
            i = offset(i, nx);
        }
    }

    // ---- Writes ----

    /// Raw set. Writing nil deletes. Invalidates the metamethod cache.
    pub fn set(
        &mut self,
        key: TValue,
        value: TValue,
        env: &mut TableEnv<'_>,
    ) -> Result<(), TableError> {
        let key = normalize_key(key)?;
        self.invalidate_tm_cache();
        self.raw_set(key, value, env)
    }

    pub fn set_int(
        &mut self,
        key: Integer,
        value: TValue,
        env: &mut TableEnv<'_>,
    ) -> Result<(), TableError> {
        self.set(TValue::Integer(key), value, env)
    }

    fn raw_set(
        &mut self,
        key: TValue,
        value: TValue,
        env: &mut TableEnv<'_>,
    ) -> Result<(), TableError> {
        let stored = if value.is_nil() { TValue::Empty } else { value };
        match self.find_slot(&key, env.strings) {
            Slot::Array(i) => self.array[i] = stored,
            Slot::Node(i) => self.node[i].val = stored,
            Slot::Absent => self.new_key(key, value, env)?,
        }
        Ok(())
    }

    fn get_free_pos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if matches!(self.node[self.lastfree].key, NodeKey::Nil) {
                return Some(self.lastfree);
            }
        }
        None
    }

    /// Insert a key that is not present. If its main position is taken, the
    /// colliding node moves to a free node when it is not in its own main
    /// position; otherwise the new key goes to the free node. Grows the
    /// table when no free node is left.
    fn new_key(
        &mut self,
        key: TValue,
        value: TValue,
        env: &mut TableEnv<'_>,
    ) -> Result<(), TableError> {
        if value.is_nil() {
            return Ok(());
        }
        if self.node.is_empty() {
            self.rehash(&key, env)?;
            return self.raw_set(key, value, env);
        }
        let mut mp = self.main_position(&key, env.strings);
        if !self.node[mp].val.is_empty() {
            let Some(f) = self.get_free_pos() else {
                self.rehash(&key, env)?;
                return self.raw_set(key, value, env);
            };
            let other = match self.node[mp].key {
                NodeKey::Key(k) => self.main_position(&k, env.strings),
                _ => mp,
            };
            if other != mp {
                // Colliding node is out of its main position: move it.
                let mut prev = other;
                while offset(prev, self.node[prev].next) != mp {
                    prev = offset(prev, self.node[prev].next);
                }
                self.node[prev].next = f as i32 - prev as i32;
                self.node[f] = self.node[mp];
                if self.node[mp].next != 0 {
                    self.node[f].next += mp as i32 - f as i32;
                    self.node[mp].next = 0;
                }
                self.node[mp].val = TValue::Empty;
            } else {
                // Colliding node is in its main position: new key goes to `f`.
                if self.node[mp].next != 0 {
                    self.node[f].next = (mp as i32 + self.node[mp].next) - f as i32;
                } else {
                    het_assert!(self.node[f].next == 0);
                }
                self.node[mp].next = f as i32 - mp as i32;
                mp = f;
            }
        }
        self.node[mp].key = NodeKey::Key(key);
        self.node[mp].val = value;
        Ok(())
    }

    // ---- Rehash ----

    fn num_use_array(&self, nums: &mut [u32]) -> u32 {
        let asize = self.array.len();
        let mut ause = 0;
        let mut i = 1usize;
        for (lg, slot) in nums.iter_mut().enumerate() {
            let mut lim = 1usize << lg;
            if lim > asize {
                lim = asize;
                if i > lim {
                    break;
                }
            }
            let mut lc = 0;
            while i <= lim {
                if !self.array[i - 1].is_empty() {
                    lc += 1;
                }
                i += 1;
            }
            *slot += lc;
            ause += lc;
        }
        ause
    }

    fn num_use_hash(&self, nums: &mut [u32], pna: &mut u32) -> u32 {
        let mut total = 0;
        let mut ause = 0;
        for n in self.node.iter().filter(|n| !n.val.is_empty()) {
            if let NodeKey::Key(TValue::Integer(k)) = n.key {
                ause += count_int(k, nums);
            }
            total += 1;
        }
        *pna += ause;
        total
    }

    /// Recompute both parts to fit the current keys plus `extra`.
    fn rehash(&mut self, extra: &TValue, env: &mut TableEnv<'_>) -> Result<(), TableError> {
        let mut nums = [0u32; MAX_ABITS as usize + 1];
        self.set_limit_to_size();
        let mut na = self.num_use_array(&mut nums);
        let mut total = na;
        total += self.num_use_hash(&mut nums, &mut na);
        if let TValue::Integer(k) = *extra {
            na += count_int(k, &mut nums);
        }
        total += 1;
        let asize = compute_sizes(&nums, &mut na);
        log::trace!(
            "rehash: array {} -> {}, hash {} -> {} keys",
            self.array.len(),
            asize,
            self.node.len(),
            total - na
        );
        self.resize(asize, (total - na) as usize, env)
    }

    /// Resize both parts, re-inserting every entry. Fails without changing
    /// the table if the new parts cannot be allocated. The hash part is
    /// never made smaller than the entries that must move into it.
    pub fn resize(
        &mut self,
        new_asize: usize,
        nhsize: usize,
        env: &mut TableEnv<'_>,
    ) -> Result<(), TableError> {
        let moving = self
            .array
            .iter()
            .skip(new_asize)
            .filter(|v| !v.is_empty())
            .count()
            + self
                .node
                .iter()
                .filter(|n| matches!(n.key, NodeKey::Key(_)) && !n.val.is_empty())
                .count();
        let (new_nodes, lsize) = alloc_nodes(nhsize.max(moving))?;
        let mut new_array = alloc_array(new_asize)?;
        env.mem
            .resize(self.byte_size(), byte_size_for(new_asize, new_nodes.len()))?;

        let keep = new_asize.min(self.array.len());
        new_array.extend_from_slice(&self.array[..keep]);
        new_array.resize(new_asize, TValue::Empty);
        let old_array = mem::replace(&mut self.array, new_array);
        let old_nodes = mem::replace(&mut self.node, new_nodes);
        self.lsizenode = lsize;
        self.lastfree = self.node.len();
        self.set_limit_to_size();

        for (i, v) in old_array.iter().enumerate().skip(new_asize) {
            if !v.is_empty() {
                self.raw_set(TValue::Integer((i + 1) as Integer), *v, env)?;
            }
        }
        for n in old_nodes.iter().filter(|n| !n.val.is_empty()) {
            if let NodeKey::Key(k) = n.key {
                self.raw_set(k, n.val, env)?;
            }
        }
        Ok(())
    }

    // ---- Length ----

    /// A border: `n` with `t[n]` present and `t[n + 1]` absent, or 0 when
    /// `t[1]` is absent. Updates the length hint.
    pub fn length(&mut self) -> Unsigned {
        let mut limit = self.alimit;
        if limit > 0 && self.array[limit - 1].is_empty() {
            // There is a border before `limit`.
            if limit >= 2 && !self.array[limit - 2].is_empty() {
                self.set_limit(limit - 1);
                return (limit - 1) as Unsigned;
            }
            let border = binsearch(&self.array, 0, limit);
            self.set_limit(border);
            return border as Unsigned;
        }
        if limit != self.array.len() {
            // `limit` is zero or present, and not the real size.
            if self.array[limit].is_empty() {
                return limit as Unsigned;
            }
            limit = self.array.len();
            if self.array[limit - 1].is_empty() {
                let border = binsearch(&self.array, self.alimit, limit);
                self.set_limit(border);
                return border as Unsigned;
            }
            self.set_limit(limit);
        }
        het_assert!(limit == self.array.len() && (limit == 0 || !self.array[limit - 1].is_empty()));
        if self.node.is_empty() || self.get_int((limit + 1) as Integer).is_empty() {
            return limit as Unsigned;
        }
        self.hash_search(limit as Unsigned)
    }

    /// Unbound search in the hash part, starting past a present index `j`.
    fn hash_search(&self, mut j: Unsigned) -> Unsigned {
        let max = MAX_INTEGER as Unsigned;
        if j == 0 {
            j += 1;
        }
        let mut i;
        loop {
            i = j;
            if j <= max / 2 {
                j *= 2;
            } else {
                j = max;
                if self.get_int(j as Integer).is_empty() {
                    break;
                }
                return j;
            }
            if self.get_int(j as Integer).is_empty() {
                break;
            }
        }
        while j - i > 1 {
            let m = i + (j - i) / 2;
            if self.get_int(m as Integer).is_empty() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    // ---- Traversal ----

    /// Position to resume traversal after `key`: array slots first, then nodes.
    fn find_index(&self, key: &TValue, strings: &Arena<TString>) -> Result<usize, TableError> {
        if key.is_nil() {
            return Ok(0);
        }
        let key = match *key {
            TValue::Float(f) => match float_to_integer(f, F2IMode::Exact) {
                Some(i) => TValue::Integer(i),
                None => *key,
            },
            k => k,
        };
        let asize = self.array.len();
        if let TValue::Integer(i) = key {
            let k = array_index(i);
            if k != 0 && k <= asize {
                return Ok(k);
            }
        }
        match self.find_node(&key, true, strings) {
            Some(n) => Ok(n + 1 + asize),
            None => Err(TableError::InvalidNextKey),
        }
    }

    /// The entry after `key` (nil starts), or `None` at the end. Clearing the
    /// current key during traversal is allowed; adding keys is not.
    pub fn next(
        &self,
        key: &TValue,
        strings: &Arena<TString>,
    ) -> Result<Option<(TValue, TValue)>, TableError> {
        let asize = self.array.len();
        let mut i = self.find_index(key, strings)?;
        while i < asize {
            if !self.array[i].is_empty() {
                return Ok(Some((TValue::Integer((i + 1) as Integer), self.array[i])));
            }
            i += 1;
        }
        for n in &self.node[i - asize..] {
            if !n.val.is_empty() {
                if let NodeKey::Key(k) = n.key {
                    return Ok(Some((k, n.val)));
                }
            }
        }
        Ok(None)
    }

    /// All present entries, array part first.
    pub fn iter(&self) -> impl Iterator<Item = (TValue, TValue)> + '_ {
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .map(|(i, v)| (TValue::Integer((i + 1) as Integer), *v));
        let hash = self.node.iter().filter_map(|n| match n.key {
            NodeKey::Key(k) if !n.val.is_empty() => Some((k, n.val)),
            _ => None,
        });
        array.chain(hash)
    }

    /// Number of present entries.
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    // ---- Collector support ----

    /// Turn the collectable keys of emptied entries into dead keys.
    pub(crate) fn kill_empty_keys(&mut self) {
        for n in &mut self.node {
            if n.val.is_empty() {
                if let NodeKey::Key(k) = n.key {
                    if k.is_collectable() {
                        n.key = NodeKey::Dead(k);
                    }
                }
            }
        }
    }

    /// Keys stored in the hash part of present entries.
    pub(crate) fn node_keys(&self) -> impl Iterator<Item = TValue> + '_ {
        self.node.iter().filter_map(|n| match n.key {
            NodeKey::Key(k) if !n.val.is_empty() => Some(k),
            _ => None,
        })
    }

    /// Empty every entry whose value satisfies `is_dead`.
    pub(crate) fn clear_by_values(&mut self, mut is_dead: impl FnMut(&TValue) -> bool) {
        for v in &mut self.array {
            if is_dead(v) {
                *v = TValue::Empty;
            }
        }
        for n in &mut self.node {
            if !n.val.is_empty() && is_dead(&n.val) {
                n.val = TValue::Empty;
            }
        }
        self.kill_empty_keys();
    }

    /// Empty every hash entry whose key satisfies `is_dead`.
    pub(crate) fn clear_by_keys(&mut self, mut is_dead: impl FnMut(&TValue) -> bool) {
        for n in &mut self.node {
            if let NodeKey::Key(k) = n.key {
                if !n.val.is_empty() && is_dead(&k) {
                    n.val = TValue::Empty;
                }
            }
        }
        self.kill_empty_keys();
    }

    /// Entries of the hash part as (key, value), including dead keys; for tests
    /// and debugging.
    pub fn raw_nodes(&self) -> impl Iterator<Item = (NodeKey, TValue)> + '_ {
        self.node.iter().map(|n| (n.key, n.val))
    }
}

/// Binary search for a border in `array[i..j]`, with `i` zero or present
/// and `j` absent.
fn binsearch(array: &[TValue], mut i: usize, mut j: usize) -> usize {
    while j - i > 1 {
        let m = (i + j) / 2;
        if array[m - 1].is_empty() {
            j = m;
        } else {
            i = m;
        }
    }
    i
}

impl GcObject for Table {
    const KIND: ObjKind = ObjKind::Table;

    fn arena(heap: &GcHeap) -> &Arena<Self> {
        &heap.tables
    }

    fn arena_mut(heap: &mut GcHeap) -> &mut Arena<Self> {
        &mut heap.tables
    }

    fn variant_tag(&self) -> u8 {
        V_TABLE
    }

    fn byte_size(&self) -> usize {
        Table::byte_size(self)
    }
}

impl MutableObject for Table {}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.node.len()
        )
    }
}

impl GcHeap {
    pub fn new_table(&mut self, narray: usize, nhash: usize) -> Result<GcIdx<Table>, TableError> {
        let table = Table::new(narray, nhash)?;
        Ok(self.link(table)?)
    }

    fn table_parts(&mut self, t: GcIdx<Table>) -> (&mut Table, TableEnv<'_>) {
        let GcHeap {
            tables,
            strings,
            mem,
            ..
        } = self;
        match tables.get_mut(t) {
            Some(table) => (table, TableEnv { strings, mem }),
            None => panic!("table handle {t:?} refers to a freed object"),
        }
    }

    pub fn table_get(&self, t: GcIdx<Table>, key: &TValue) -> TValue {
        self.get(t).get(key, &self.strings)
    }

    pub fn table_get_int(&self, t: GcIdx<Table>, key: Integer) -> TValue {
        self.get(t).get_int(key)
    }

    /// Get with a string key given as bytes, without interning it.
    pub fn table_get_str(&self, t: GcIdx<Table>, key: &[u8]) -> TValue {
        let table = self.get(t);
        if key.len() <= MAX_SHORT_LEN {
            return match self.find_interned(key) {
                Some(s) => table.get_short_str(s, &self.strings),
                None => TValue::AbsentKey,
            };
        }
        table
            .node_keys()
            .find(|k| matches!(k, TValue::LongString(s) if self.string_bytes(*s) == key))
            .map_or(TValue::AbsentKey, |k| table.get(&k, &self.strings))
    }

    pub fn table_set(
        &mut self,
        t: GcIdx<Table>,
        key: TValue,
        value: TValue,
    ) -> Result<(), TableError> {
        let (table, mut env) = self.table_parts(t);
        table.set(key, value, &mut env)
    }

    pub fn table_set_int(
        &mut self,
        t: GcIdx<Table>,
        key: Integer,
        value: TValue,
    ) -> Result<(), TableError> {
        let (table, mut env) = self.table_parts(t);
        table.set_int(key, value, &mut env)
    }

    /// Set `t[name] = value`, interning `name`.
    pub fn table_set_str(
        &mut self,
        t: GcIdx<Table>,
        name: &[u8],
        value: TValue,
    ) -> Result<(), TableError> {
        let key = self.new_string_value(name)?;
        self.table_set(t, key, value)
    }

    pub fn table_length(&mut self, t: GcIdx<Table>) -> Unsigned {
        self.get_mut(t).length()
    }

    pub fn table_next(
        &self,
        t: GcIdx<Table>,
        key: &TValue,
    ) -> Result<Option<(TValue, TValue)>, TableError> {
        self.get(t).next(key, &self.strings)
    }

    pub fn table_resize(
        &mut self,
        t: GcIdx<Table>,
        narray: usize,
        nhash: usize,
    ) -> Result<(), TableError> {
        let (table, mut env) = self.table_parts(t);
        table.resize(narray, nhash, &mut env)
    }
}
