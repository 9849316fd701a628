//! Strings: interned short strings, content-compared long strings, the
//! short-string table and the number-to-string cache.
//!
//! Short strings (<= 40 bytes) are stored inline and interned, so two short
//! strings are equal exactly when their handles are. Long strings are
//! individual objects compared by content and hashed lazily.
use crate::gc::{Arena, GcHeap, GcIdx, GcObject, GcRef, HeapError, ObjKind};
use crate::limits::{
    Integer, LONG_STRING_LEN, MAX_SHORT_LEN, MAX_STR_TABLE_SIZE, MIN_STR_TABLE_SIZE, STR_CACHE_M,
    STR_CACHE_N,
};
use crate::number;
use crate::value::{TValue, V_LNGSTR, V_SHRSTR};
use std::cell::Cell;
use std::fmt;

enum StringData {
    Short { buf: [u8; MAX_SHORT_LEN], len: u8 },
    Long(Box<[u8]>),
}

/// An immutable string object.
pub struct TString {
    data: StringData,
    /// Short strings: reserved-word index for the lexer. Long strings: 1 once
    /// the hash has been computed.
    extra: Cell<u8>,
    /// Long strings hold the seed here until the hash is computed.
    hash: Cell<u32>,
}

impl TString {
    fn new_short(bytes: &[u8], hash: u32) -> Self {
        debug_assert!(bytes.len() <= MAX_SHORT_LEN);
        let mut buf = [0u8; MAX_SHORT_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        TString {
            data: StringData::Short {
                buf,
                len: bytes.len() as u8,
            },
            extra: Cell::new(0),
            hash: Cell::new(hash),
        }
    }

    fn new_long(data: Box<[u8]>, seed: u32) -> Self {
        TString {
            data: StringData::Long(data),
            extra: Cell::new(0),
            hash: Cell::new(seed),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            StringData::Short { buf, len } => &buf[..*len as usize],
            StringData::Long(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            StringData::Short { len, .. } => *len as usize,
            StringData::Long(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_short(&self) -> bool {
        matches!(&self.data, StringData::Short { .. })
    }

    /// The length byte: the real length for short strings, `0xFF` for long ones.
    pub fn shrlen(&self) -> u8 {
        match &self.data {
            StringData::Short { len, .. } => *len,
            StringData::Long(_) => LONG_STRING_LEN,
        }
    }

    /// Hash of the contents. Computed on first use for long strings.
    pub fn hash(&self) -> u32 {
        if !self.is_short() && self.extra.get() == 0 {
            self.hash.set(str_hash(self.as_bytes(), self.hash.get()));
            self.extra.set(1);
        }
        self.hash.get()
    }

    /// Whether a long string's hash is already cached.
    pub fn has_hash(&self) -> bool {
        self.is_short() || self.extra.get() != 0
    }

    /// Reserved-word index (short strings only; 0 means none).
    pub fn reserved(&self) -> u8 {
        if self.is_short() {
            self.extra.get()
        } else {
            0
        }
    }

    pub fn set_reserved(&self, index: u8) {
        if self.is_short() {
            self.extra.set(index);
        }
    }
}

impl GcObject for TString {
    const KIND: ObjKind = ObjKind::String;

    fn arena(heap: &GcHeap) -> &Arena<Self> {
        &heap.strings
    }

    fn arena_mut(heap: &mut GcHeap) -> &mut Arena<Self> {
        &mut heap.strings
    }

    fn variant_tag(&self) -> u8 {
        if self.is_short() {
            V_SHRSTR
        } else {
            V_LNGSTR
        }
    }

    fn byte_size(&self) -> usize {
        match &self.data {
            StringData::Short { .. } => std::mem::size_of::<TString>(),
            StringData::Long(v) => std::mem::size_of::<TString>() + v.len(),
        }
    }
}

impl fmt::Debug for TString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = std::str::from_utf8(self.as_bytes()) {
            write!(f, "\"{}\"", s)
        } else {
            write!(f, "<binary string len={}>", self.len())
        }
    }
}

/// Seeded string hash over every byte, last to first.
pub fn str_hash(bytes: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ (bytes.len() as u32);
    for &b in bytes.iter().rev() {
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(b as u32);
    }
    h
}

/// Chained hash table of interned short strings. Bucket count is a power of two.
#[derive(Debug)]
pub struct StringTable {
    buckets: Vec<Vec<GcIdx<TString>>>,
    nuse: usize,
}

fn alloc_buckets(size: usize) -> Result<Vec<Vec<GcIdx<TString>>>, HeapError> {
    let mut buckets = Vec::new();
    buckets
        .try_reserve_exact(size)
        .map_err(|_| HeapError::OutOfMemory)?;
    buckets.resize_with(size, Vec::new);
    Ok(buckets)
}

impl StringTable {
    pub fn with_size(size: usize) -> Result<Self, HeapError> {
        let size = size.clamp(1, MAX_STR_TABLE_SIZE).next_power_of_two();
        Ok(StringTable {
            buckets: alloc_buckets(size)?,
            nuse: 0,
        })
    }

    /// Number of buckets.
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.nuse
    }

    pub fn is_empty(&self) -> bool {
        self.nuse == 0
    }

    fn bucket(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    fn find(&self, strings: &Arena<TString>, bytes: &[u8], hash: u32) -> Option<GcIdx<TString>> {
        self.buckets[self.bucket(hash)].iter().copied().find(|&idx| {
            strings
                .get(idx)
                .is_some_and(|s| s.hash() == hash && s.as_bytes() == bytes)
        })
    }

    fn insert(&mut self, idx: GcIdx<TString>, hash: u32) -> Result<(), HeapError> {
        let b = self.bucket(hash);
        self.buckets[b]
            .try_reserve(1)
            .map_err(|_| HeapError::OutOfMemory)?;
        self.buckets[b].push(idx);
        self.nuse += 1;
        Ok(())
    }

    pub(crate) fn remove(&mut self, idx: GcIdx<TString>, hash: u32) -> bool {
        let b = self.bucket(hash);
        let bucket = &mut self.buckets[b];
        match bucket.iter().position(|&s| s == idx) {
            Some(pos) => {
                bucket.swap_remove(pos);
                self.nuse -= 1;
                true
            }
            None => false,
        }
    }

    /// Rehash into `new_size` buckets. On allocation failure the table is unchanged.
    fn resize(&mut self, new_size: usize, strings: &Arena<TString>) -> Result<(), HeapError> {
        let mut buckets = alloc_buckets(new_size)?;
        for idx in self.buckets.iter().flatten().copied() {
            let hash = strings.get(idx).map_or(0, |s| s.hash());
            buckets[hash as usize & (new_size - 1)].push(idx);
        }
        self.buckets = buckets;
        Ok(())
    }
}

/// Key of the number-to-string cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumKey {
    Int(Integer),
    /// Float bits (widened to 64 bits).
    Float(u64),
}

impl NumKey {
    fn set(self) -> usize {
        let bits = match self {
            NumKey::Int(i) => i as i64 as u64,
            NumKey::Float(bits) => bits,
        };
        ((bits ^ (bits >> 32)) % STR_CACHE_N as u64) as usize
    }
}

type CacheEntry = Option<(NumKey, GcIdx<TString>)>;

/// Set-associative cache of number-to-string conversions. Entries are weak:
/// the collector clears the ones whose strings die.
pub struct StrCache {
    sets: [[CacheEntry; STR_CACHE_M]; STR_CACHE_N],
    hits: u64,
    misses: u64,
}

impl StrCache {
    pub fn new() -> Self {
        StrCache {
            sets: [[None; STR_CACHE_M]; STR_CACHE_N],
            hits: 0,
            misses: 0,
        }
    }

    pub fn lookup(&mut self, key: NumKey) -> Option<GcIdx<TString>> {
        let found = self.sets[key.set()]
            .iter()
            .flatten()
            .find(|(k, _)| *k == key)
            .map(|&(_, s)| s);
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Insert at the front of its set, dropping the oldest entry.
    pub fn insert(&mut self, key: NumKey, s: GcIdx<TString>) {
        let set = &mut self.sets[key.set()];
        set.rotate_right(1);
        set[0] = Some((key, s));
    }

    /// Drop entries whose string is not live according to `is_live`.
    pub fn clear_dead(&mut self, mut is_live: impl FnMut(GcRef) -> bool) {
        for entry in self.sets.iter_mut().flatten() {
            if let Some((_, s)) = entry {
                if !is_live(s.to_ref()) {
                    *entry = None;
                }
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

impl Default for StrCache {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHeap {
    /// Intern a string of any length. Short strings are deduplicated; long
    /// strings always get a fresh object.
    pub fn intern(&mut self, bytes: &[u8]) -> Result<GcIdx<TString>, HeapError> {
        if bytes.len() <= MAX_SHORT_LEN {
            self.intern_short(bytes)
        } else {
            self.new_long_string(bytes)
        }
    }

    fn intern_short(&mut self, bytes: &[u8]) -> Result<GcIdx<TString>, HeapError> {
        let hash = str_hash(bytes, self.seed());
        if let Some(idx) = self.strt.find(&self.strings, bytes, hash) {
            return Ok(idx);
        }
        if self.strt.len() >= self.strt.size() {
            self.grow_string_table();
        }
        // A linked short string must always be in the table; unlink on failure.
        let idx = self.link(TString::new_short(bytes, hash))?;
        if let Err(e) = self.strt.insert(idx, hash) {
            self.set_allgc(self.header(idx.to_ref()).and_then(|h| h.next()));
            self.free_object(idx.to_ref());
            return Err(e);
        }
        Ok(idx)
    }

    /// The interned short string with these bytes, if any.
    pub fn find_interned(&self, bytes: &[u8]) -> Option<GcIdx<TString>> {
        if bytes.len() > MAX_SHORT_LEN {
            return None;
        }
        self.strt
            .find(&self.strings, bytes, str_hash(bytes, self.seed()))
    }

    fn grow_string_table(&mut self) {
        let size = self.strt.size();
        if size >= MAX_STR_TABLE_SIZE {
            return;
        }
        // Failing to grow only makes chains longer.
        match self.strt.resize(size * 2, &self.strings) {
            Ok(()) => log::debug!("string table grown to {} buckets", size * 2),
            Err(_) => log::debug!("string table growth to {} buckets failed", size * 2),
        }
    }

    /// Shrink the string table when it is less than a quarter full.
    pub(crate) fn check_string_table_size(&mut self) {
        let size = self.strt.size();
        if self.strt.len() < size / 4 && size > MIN_STR_TABLE_SIZE {
            if self.strt.resize(size / 2, &self.strings).is_ok() {
                log::debug!("string table shrunk to {} buckets", size / 2);
            }
        }
    }

    /// Create a long string object; no interning, hash computed on demand.
    pub fn new_long_string(&mut self, bytes: &[u8]) -> Result<GcIdx<TString>, HeapError> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| HeapError::OutOfMemory)?;
        data.extend_from_slice(bytes);
        self.link(TString::new_long(data.into_boxed_slice(), self.seed()))
    }

    /// Intern `bytes` and wrap the result as a value.
    pub fn new_string_value(&mut self, bytes: &[u8]) -> Result<TValue, HeapError> {
        let s = self.intern(bytes)?;
        Ok(self.string_value(s))
    }

    /// Value for a string handle, with the right variant.
    pub fn string_value(&self, s: GcIdx<TString>) -> TValue {
        if self.get(s).is_short() {
            TValue::ShortString(s)
        } else {
            TValue::LongString(s)
        }
    }

    pub fn string_bytes(&self, s: GcIdx<TString>) -> &[u8] {
        self.get(s).as_bytes()
    }

    /// String equality: identity for short strings, content for long ones.
    pub fn eq_strings(&self, a: GcIdx<TString>, b: GcIdx<TString>) -> bool {
        if a == b {
            return true;
        }
        let (sa, sb) = (self.get(a), self.get(b));
        if sa.is_short() || sb.is_short() {
            return false;
        }
        sa.len() == sb.len() && sa.hash() == sb.hash() && sa.as_bytes() == sb.as_bytes()
    }

    /// Bucket count of the short-string table.
    pub fn string_table_size(&self) -> usize {
        self.strt.size()
    }

    /// Convert a number to its string form, memoized through the cache.
    /// Returns `None` for non-numbers.
    pub fn number_to_str(&mut self, v: TValue) -> Result<Option<GcIdx<TString>>, HeapError> {
        let key = match v {
            TValue::Integer(i) => NumKey::Int(i),
            TValue::Float(f) => NumKey::Float((f as f64).to_bits()),
            _ => return Ok(None),
        };
        if let Some(s) = self.strcache.lookup(key) {
            return Ok(Some(s));
        }
        let Some(text) = number::number_to_string(v) else {
            return Ok(None);
        };
        let s = self.intern(text.as_bytes())?;
        self.strcache.insert(key, s);
        Ok(Some(s))
    }
}
