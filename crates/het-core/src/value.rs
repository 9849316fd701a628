//! Tagged values.
//!
//! A `TValue` is a small `Copy` enum. The classic tag byte is still available
//! through [`TValue::raw_tag`]:
//!
//! - bits 0-3: base type (`T_NIL` .. `T_THREAD`, plus internal upvalue/proto/dead-key)
//! - bits 4-5: variant (nil/empty/absent key, false/true, integer/float,
//!   short/long string, closure/light function/native closure)
//! - bit 6: collectable
//!
//! The packed payload+tag form ([`RawValue`]) exists only where values cross
//! the precompiled-chunk boundary.
use crate::closure::{CClosure, LClosure, NativeFn};
use crate::gc::{GcIdx, GcRef, ObjKind};
use crate::limits::{Integer, Number};
use crate::object::Udata;
use crate::string::TString;
use crate::table::Table;
use crate::thread::Thread;
use std::fmt;

// ---- Type tags ----

/// Type of "no value" (an absent stack slot as seen by the host).
pub const T_NONE: i32 = -1;
pub const T_NIL: u8 = 0;
pub const T_BOOLEAN: u8 = 1;
pub const T_LIGHTUSERDATA: u8 = 2;
pub const T_NUMBER: u8 = 3;
pub const T_STRING: u8 = 4;
pub const T_TABLE: u8 = 5;
pub const T_FUNCTION: u8 = 6;
pub const T_USERDATA: u8 = 7;
pub const T_THREAD: u8 = 8;
/// Number of types visible to the host.
pub const NUM_TYPES: usize = 9;

pub const T_UPVAL: u8 = NUM_TYPES as u8;
pub const T_PROTO: u8 = NUM_TYPES as u8 + 1;
pub const T_DEADKEY: u8 = NUM_TYPES as u8 + 2;
/// Number of base tags, internal ones included.
pub const TOTAL_TYPES: usize = T_PROTO as usize + 2;

/// Add variant bits to a base type.
pub const fn make_variant(t: u8, v: u8) -> u8 {
    t | (v << 4)
}

pub const V_NIL: u8 = make_variant(T_NIL, 0);
pub const V_EMPTY: u8 = make_variant(T_NIL, 1);
pub const V_ABSTKEY: u8 = make_variant(T_NIL, 2);

pub const V_FALSE: u8 = make_variant(T_BOOLEAN, 0);
pub const V_TRUE: u8 = make_variant(T_BOOLEAN, 1);

pub const V_LIGHTUSERDATA: u8 = make_variant(T_LIGHTUSERDATA, 0);
pub const V_USERDATA: u8 = make_variant(T_USERDATA, 0);

pub const V_NUMINT: u8 = make_variant(T_NUMBER, 0);
pub const V_NUMFLT: u8 = make_variant(T_NUMBER, 1);

pub const V_SHRSTR: u8 = make_variant(T_STRING, 0);
pub const V_LNGSTR: u8 = make_variant(T_STRING, 1);

pub const V_TABLE: u8 = make_variant(T_TABLE, 0);

pub const V_LCL: u8 = make_variant(T_FUNCTION, 0);
pub const V_LCF: u8 = make_variant(T_FUNCTION, 1);
pub const V_CCL: u8 = make_variant(T_FUNCTION, 2);

pub const V_THREAD: u8 = make_variant(T_THREAD, 0);
pub const V_UPVAL: u8 = make_variant(T_UPVAL, 0);
pub const V_PROTO: u8 = make_variant(T_PROTO, 0);

pub const BIT_ISCOLLECTABLE: u8 = 1 << 6;

/// Mark a tag as collectable.
pub const fn ctb(t: u8) -> u8 {
    t | BIT_ISCOLLECTABLE
}

/// Base type of a tag (bits 0-3).
pub const fn no_variant(t: u8) -> u8 {
    t & 0x0F
}

/// Type and variant of a tag (bits 0-5).
pub const fn with_variant(t: u8) -> u8 {
    t & 0x3F
}

/// A tagged value. Copies always move tag and payload together.
#[derive(Clone, Copy)]
pub enum TValue {
    /// Standard nil.
    Nil,
    /// Empty slot in a table.
    Empty,
    /// Result of a lookup for a key that is not present.
    AbsentKey,
    Boolean(bool),
    LightUserdata(usize),
    Integer(Integer),
    Float(Number),
    ShortString(GcIdx<TString>),
    LongString(GcIdx<TString>),
    Table(GcIdx<Table>),
    /// Interpreted closure.
    LClosure(GcIdx<LClosure>),
    /// Bare native function pointer; not collectable.
    LightFunction(NativeFn),
    /// Native closure with captured values.
    CClosure(GcIdx<CClosure>),
    Userdata(GcIdx<Udata>),
    Thread(GcIdx<Thread>),
}

impl TValue {
    // ---- Constructors ----

    #[inline]
    pub fn nil() -> Self {
        TValue::Nil
    }

    #[inline]
    pub fn from_bool(b: bool) -> Self {
        TValue::Boolean(b)
    }

    #[inline]
    pub fn from_integer(i: Integer) -> Self {
        TValue::Integer(i)
    }

    #[inline]
    pub fn from_float(f: Number) -> Self {
        TValue::Float(f)
    }

    #[inline]
    pub fn from_light_userdata(p: usize) -> Self {
        TValue::LightUserdata(p)
    }

    #[inline]
    pub fn from_native(f: NativeFn) -> Self {
        TValue::LightFunction(f)
    }

    // ---- Tags ----

    /// Full tag byte: variant and collectable bits included.
    pub fn raw_tag(&self) -> u8 {
        match self {
            TValue::Nil => V_NIL,
            TValue::Empty => V_EMPTY,
            TValue::AbsentKey => V_ABSTKEY,
            TValue::Boolean(false) => V_FALSE,
            TValue::Boolean(true) => V_TRUE,
            TValue::LightUserdata(_) => V_LIGHTUSERDATA,
            TValue::Integer(_) => V_NUMINT,
            TValue::Float(_) => V_NUMFLT,
            TValue::ShortString(_) => ctb(V_SHRSTR),
            TValue::LongString(_) => ctb(V_LNGSTR),
            TValue::Table(_) => ctb(V_TABLE),
            TValue::LClosure(_) => ctb(V_LCL),
            TValue::LightFunction(_) => V_LCF,
            TValue::CClosure(_) => ctb(V_CCL),
            TValue::Userdata(_) => ctb(V_USERDATA),
            TValue::Thread(_) => ctb(V_THREAD),
        }
    }

    /// Base type, one of `T_NIL` .. `T_THREAD`.
    #[inline]
    pub fn type_tag(&self) -> u8 {
        no_variant(self.raw_tag())
    }

    /// Exact variant (tag without the collectable bit).
    #[inline]
    pub fn variant_tag(&self) -> u8 {
        with_variant(self.raw_tag())
    }

    #[inline]
    pub fn is_collectable(&self) -> bool {
        self.raw_tag() & BIT_ISCOLLECTABLE != 0
    }

    /// Untyped heap reference for collectable values.
    pub fn gc_ref(&self) -> Option<GcRef> {
        let (kind, index, generation) = match *self {
            TValue::ShortString(s) | TValue::LongString(s) => {
                (ObjKind::String, s.index(), s.generation())
            }
            TValue::Table(t) => (ObjKind::Table, t.index(), t.generation()),
            TValue::LClosure(c) => (ObjKind::LClosure, c.index(), c.generation()),
            TValue::CClosure(c) => (ObjKind::CClosure, c.index(), c.generation()),
            TValue::Userdata(u) => (ObjKind::Userdata, u.index(), u.generation()),
            TValue::Thread(t) => (ObjKind::Thread, t.index(), t.generation()),
            _ => return None,
        };
        Some(GcRef {
            kind,
            index,
            generation,
        })
    }

    // ---- Type checks ----

    /// True for every nil variant (nil, empty, absent key).
    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, TValue::Nil | TValue::Empty | TValue::AbsentKey)
    }

    /// True only for the standard nil.
    #[inline]
    pub fn is_strict_nil(&self) -> bool {
        matches!(self, TValue::Nil)
    }

    /// True for empty slots and absent keys (anything nil-typed counts as empty).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.is_nil()
    }

    #[inline]
    pub fn is_absent_key(&self) -> bool {
        matches!(self, TValue::AbsentKey)
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        matches!(self, TValue::Boolean(_))
    }

    /// Only nil and false are false.
    #[inline]
    pub fn is_falsy(&self) -> bool {
        self.is_nil() || matches!(self, TValue::Boolean(false))
    }

    #[inline]
    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, TValue::Integer(_) | TValue::Float(_))
    }

    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(self, TValue::Integer(_))
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, TValue::Float(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, TValue::ShortString(_) | TValue::LongString(_))
    }

    #[inline]
    pub fn is_short_string(&self) -> bool {
        matches!(self, TValue::ShortString(_))
    }

    #[inline]
    pub fn is_table(&self) -> bool {
        matches!(self, TValue::Table(_))
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(
            self,
            TValue::LClosure(_) | TValue::LightFunction(_) | TValue::CClosure(_)
        )
    }

    // ---- Accessors ----

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            TValue::Boolean(b) => Some(b),
            _ => None,
        }
    }

    #[inline]
    pub fn as_integer(&self) -> Option<Integer> {
        match *self {
            TValue::Integer(i) => Some(i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_float(&self) -> Option<Number> {
        match *self {
            TValue::Float(f) => Some(f),
            _ => None,
        }
    }

    /// Numeric value as a float, converting integers.
    #[inline]
    pub fn as_number(&self) -> Option<Number> {
        match *self {
            TValue::Integer(i) => Some(i as Number),
            TValue::Float(f) => Some(f),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string(&self) -> Option<GcIdx<TString>> {
        match *self {
            TValue::ShortString(s) | TValue::LongString(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_table(&self) -> Option<GcIdx<Table>> {
        match *self {
            TValue::Table(t) => Some(t),
            _ => None,
        }
    }

    #[inline]
    pub fn as_lclosure(&self) -> Option<GcIdx<LClosure>> {
        match *self {
            TValue::LClosure(c) => Some(c),
            _ => None,
        }
    }

    #[inline]
    pub fn as_cclosure(&self) -> Option<GcIdx<CClosure>> {
        match *self {
            TValue::CClosure(c) => Some(c),
            _ => None,
        }
    }

    #[inline]
    pub fn as_userdata(&self) -> Option<GcIdx<Udata>> {
        match *self {
            TValue::Userdata(u) => Some(u),
            _ => None,
        }
    }

    #[inline]
    pub fn as_thread(&self) -> Option<GcIdx<Thread>> {
        match *self {
            TValue::Thread(t) => Some(t),
            _ => None,
        }
    }

    #[inline]
    pub fn as_light_userdata(&self) -> Option<usize> {
        match *self {
            TValue::LightUserdata(p) => Some(p),
            _ => None,
        }
    }

    // ---- Serialization boundary ----

    /// Pack into the tag byte + 64-bit payload form.
    pub fn to_raw(&self) -> RawValue {
        let bits = match *self {
            TValue::Nil | TValue::Empty | TValue::AbsentKey | TValue::Boolean(_) => 0,
            TValue::LightUserdata(p) => p as u64,
            TValue::Integer(i) => i as i64 as u64,
            TValue::Float(f) => (f as f64).to_bits(),
            TValue::LightFunction(f) => f as usize as u64,
            _ => match self.gc_ref() {
                Some(r) => pack_handle(r.index, r.generation),
                None => 0,
            },
        };
        RawValue {
            tag: self.raw_tag(),
            bits,
        }
    }
}

fn pack_handle(index: u32, generation: u32) -> u64 {
    (index as u64) | ((generation as u64) << 32)
}

fn unpack_handle(bits: u64) -> (u32, u32) {
    (bits as u32, (bits >> 32) as u32)
}

/// Compact payload + tag byte, used only for chunk I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawValue {
    pub tag: u8,
    pub bits: u64,
}

impl RawValue {
    /// Decode a non-function value. Light functions cannot be rebuilt from
    /// an address, so they decode to `None`, as do unknown tags.
    pub fn decode(self) -> Option<TValue> {
        let (index, generation) = unpack_handle(self.bits);
        Some(match self.tag {
            V_NIL => TValue::Nil,
            V_EMPTY => TValue::Empty,
            V_ABSTKEY => TValue::AbsentKey,
            V_FALSE => TValue::Boolean(false),
            V_TRUE => TValue::Boolean(true),
            V_LIGHTUSERDATA => TValue::LightUserdata(self.bits as usize),
            V_NUMINT => TValue::Integer(self.bits as i64 as Integer),
            V_NUMFLT => TValue::Float(f64::from_bits(self.bits) as Number),
            t if t == ctb(V_SHRSTR) => TValue::ShortString(GcIdx::new(index, generation)),
            t if t == ctb(V_LNGSTR) => TValue::LongString(GcIdx::new(index, generation)),
            t if t == ctb(V_TABLE) => TValue::Table(GcIdx::new(index, generation)),
            t if t == ctb(V_LCL) => TValue::LClosure(GcIdx::new(index, generation)),
            t if t == ctb(V_CCL) => TValue::CClosure(GcIdx::new(index, generation)),
            t if t == ctb(V_USERDATA) => TValue::Userdata(GcIdx::new(index, generation)),
            t if t == ctb(V_THREAD) => TValue::Thread(GcIdx::new(index, generation)),
            _ => return None,
        })
    }
}

impl Default for TValue {
    fn default() -> Self {
        TValue::Nil
    }
}

/// Identity comparison: same variant and same payload bits. Floats compare by
/// bit pattern, so this is not the language's `==` (see `GcHeap::raw_equal`).
impl PartialEq for TValue {
    fn eq(&self, other: &Self) -> bool {
        match (*self, *other) {
            (TValue::Nil, TValue::Nil)
            | (TValue::Empty, TValue::Empty)
            | (TValue::AbsentKey, TValue::AbsentKey) => true,
            (TValue::Boolean(a), TValue::Boolean(b)) => a == b,
            (TValue::LightUserdata(a), TValue::LightUserdata(b)) => a == b,
            (TValue::Integer(a), TValue::Integer(b)) => a == b,
            (TValue::Float(a), TValue::Float(b)) => a.to_bits() == b.to_bits(),
            (TValue::ShortString(a), TValue::ShortString(b)) => a == b,
            (TValue::LongString(a), TValue::LongString(b)) => a == b,
            (TValue::Table(a), TValue::Table(b)) => a == b,
            (TValue::LClosure(a), TValue::LClosure(b)) => a == b,
            (TValue::LightFunction(a), TValue::LightFunction(b)) => a as usize == b as usize,
            (TValue::CClosure(a), TValue::CClosure(b)) => a == b,
            (TValue::Userdata(a), TValue::Userdata(b)) => a == b,
            (TValue::Thread(a), TValue::Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for TValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TValue::Nil => write!(f, "nil"),
            TValue::Empty => write!(f, "<empty>"),
            TValue::AbsentKey => write!(f, "<absent>"),
            TValue::Boolean(b) => write!(f, "{b}"),
            TValue::LightUserdata(p) => write!(f, "lightuserdata({p:#x})"),
            TValue::Integer(i) => write!(f, "{i}"),
            TValue::Float(n) => write!(f, "{n:?}"),
            TValue::ShortString(s) | TValue::LongString(s) => write!(f, "string({})", s.index()),
            TValue::Table(t) => write!(f, "table({})", t.index()),
            TValue::LClosure(c) => write!(f, "function({})", c.index()),
            TValue::LightFunction(func) => write!(f, "function(builtin: {:#x})", *func as usize),
            TValue::CClosure(c) => write!(f, "function(native {})", c.index()),
            TValue::Userdata(u) => write!(f, "userdata({})", u.index()),
            TValue::Thread(t) => write!(f, "thread({})", t.index()),
        }
    }
}
