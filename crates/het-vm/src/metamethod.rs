//! Metamethod lookup by value and the operations that fall back to them.
//!
//! The `*_dispatch` functions decide between a primitive result and a
//! handler to call; they never run code. The `State` methods without the
//! suffix finish the job by calling native handlers.

use crate::error::HetError;
use crate::state::State;
use het_core::gc::GcIdx;
use het_core::limits::{Integer, Number};
use het_core::number::{float_to_integer, raw_arith, ArithError, ArithOp, CompareOp, F2IMode};
use het_core::object::type_name;
use het_core::table::Table;
use het_core::tm::TagMethod;
use het_core::value::TValue;
use std::cmp::Ordering;

/// Limit for `__index`/`__newindex` chains.
pub const MAX_TAG_LOOP: usize = 2000;

/// Outcome of an operation that may defer to a metamethod.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetaResult {
    Value(TValue),
    /// Call `handler` with `args`; its first result is the value.
    Call { handler: TValue, args: [TValue; 2] },
}

/// Outcome of an assignment that may defer to `__newindex`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SetResult {
    Done,
    Call { handler: TValue, args: [TValue; 3] },
}

impl State {
    /// Metatable of any value: tables and full userdata have their own,
    /// other values use their type's.
    pub fn metatable_of(&self, v: &TValue) -> Option<GcIdx<Table>> {
        match *v {
            TValue::Table(t) => self.heap.get(t).metatable,
            TValue::Userdata(u) => self.heap.get(u).metatable,
            ref other => self.type_metatables[other.type_tag() as usize],
        }
    }

    pub fn tm_by_obj(&mut self, v: &TValue, event: TagMethod) -> Option<TValue> {
        let mt = self.metatable_of(v);
        self.heap.metamethod(mt, event)
    }

    /// Type name for messages; a string `__name` in the metatable of a
    /// table or userdata takes precedence.
    pub fn obj_type_name(&self, v: &TValue) -> String {
        if matches!(v, TValue::Table(_) | TValue::Userdata(_)) {
            if let Some(mt) = self.metatable_of(v) {
                if let Some(s) = self.heap.table_get_str(mt, b"__name").as_string() {
                    return String::from_utf8_lossy(self.heap.string_bytes(s)).into_owned();
                }
            }
        }
        type_name(v.type_tag() as i32).to_string()
    }

    pub(crate) fn type_error(&self, v: &TValue, op: &'static str) -> HetError {
        HetError::Type {
            op,
            type_name: self.obj_type_name(v),
        }
    }

    /// Handler for a binary event: the first operand's, then the second's.
    pub fn binary_tm(&mut self, a: &TValue, b: &TValue, event: TagMethod) -> Option<TValue> {
        self.tm_by_obj(a, event)
            .or_else(|| self.tm_by_obj(b, event))
    }

    // ---- Dispatch ----

    /// Arithmetic and bitwise operators. Unary operators pass the operand
    /// twice.
    pub fn arith_dispatch(
        &mut self,
        op: ArithOp,
        a: &TValue,
        b: &TValue,
    ) -> Result<MetaResult, HetError> {
        match raw_arith(op, a, b) {
            Ok(v) => return Ok(MetaResult::Value(v)),
            Err(e @ (ArithError::DivideByZero | ArithError::ModuloByZero)) => return Err(e.into()),
            Err(_) => {}
        }
        if let Some(handler) = self.binary_tm(a, b, op.tm()) {
            return Ok(MetaResult::Call {
                handler,
                args: [*a, *b],
            });
        }
        let culprit = if a.is_number() { b } else { a };
        Err(if !op.is_bitwise() {
            self.type_error(culprit, "perform arithmetic on")
        } else if a.is_number() && b.is_number() {
            ArithError::NoIntegerRepresentation.into()
        } else {
            self.type_error(culprit, "perform bitwise operation on")
        })
    }

    pub fn concat_dispatch(&mut self, a: &TValue, b: &TValue) -> Result<MetaResult, HetError> {
        let is_text = |v: &TValue| v.is_string() || v.is_number();
        if is_text(a) && is_text(b) {
            let mut bytes = self.text_bytes(a)?;
            bytes.extend_from_slice(&self.text_bytes(b)?);
            return Ok(MetaResult::Value(self.heap.new_string_value(&bytes)?));
        }
        if let Some(handler) = self.binary_tm(a, b, TagMethod::Concat) {
            return Ok(MetaResult::Call {
                handler,
                args: [*a, *b],
            });
        }
        let culprit = if is_text(a) { b } else { a };
        Err(self.type_error(culprit, "concatenate"))
    }

    fn text_bytes(&mut self, v: &TValue) -> Result<Vec<u8>, HetError> {
        let s = match v.as_string() {
            Some(s) => s,
            None => self
                .heap
                .number_to_str(*v)?
                .ok_or_else(|| self.type_error(v, "concatenate"))?,
        };
        Ok(self.heap.string_bytes(s).to_vec())
    }

    /// Equality: primitive first, then `__eq` for two distinct tables or
    /// two distinct userdata.
    pub fn equal_dispatch(&mut self, a: &TValue, b: &TValue) -> MetaResult {
        if self.heap.raw_equal(a, b) {
            return MetaResult::Value(TValue::from_bool(true));
        }
        let comparable = matches!(
            (a, b),
            (TValue::Table(_), TValue::Table(_)) | (TValue::Userdata(_), TValue::Userdata(_))
        );
        if comparable {
            if let Some(handler) = self.binary_tm(a, b, TagMethod::Eq) {
                return MetaResult::Call {
                    handler,
                    args: [*a, *b],
                };
            }
        }
        MetaResult::Value(TValue::from_bool(false))
    }

    /// Ordering (`<`, `<=`) or equality.
    pub fn compare_dispatch(
        &mut self,
        op: CompareOp,
        a: &TValue,
        b: &TValue,
    ) -> Result<MetaResult, HetError> {
        if op == CompareOp::Eq {
            return Ok(self.equal_dispatch(a, b));
        }
        let ordering = match (a.as_string(), b.as_string()) {
            (Some(x), Some(y)) => Some(self.heap.string_bytes(x).cmp(self.heap.string_bytes(y))),
            _ if a.is_number() && b.is_number() => num_cmp(a, b),
            _ => {
                if let Some(handler) = self.binary_tm(a, b, op.tm()) {
                    return Ok(MetaResult::Call {
                        handler,
                        args: [*a, *b],
                    });
                }
                return Err(self.order_error(a, b));
            }
        };
        let result = match (op, ordering) {
            (_, None) => false,
            (CompareOp::Lt, Some(o)) => o == Ordering::Less,
            (_, Some(o)) => o != Ordering::Greater,
        };
        Ok(MetaResult::Value(TValue::from_bool(result)))
    }

    fn order_error(&self, a: &TValue, b: &TValue) -> HetError {
        let (t1, t2) = (self.obj_type_name(a), self.obj_type_name(b));
        if t1 == t2 {
            HetError::Runtime(format!("attempt to compare two {t1} values"))
        } else {
            HetError::Runtime(format!("attempt to compare {t1} with {t2}"))
        }
    }

    /// `t[key]`, following `__index` chains.
    pub fn index_dispatch(&mut self, t: &TValue, key: &TValue) -> Result<MetaResult, HetError> {
        let mut t = *t;
        for _ in 0..MAX_TAG_LOOP {
            let handler = match t {
                TValue::Table(h) => {
                    let v = self.heap.table_get(h, key);
                    if !v.is_nil() {
                        return Ok(MetaResult::Value(v));
                    }
                    let mt = self.heap.get(h).metatable;
                    match self.heap.metamethod(mt, TagMethod::Index) {
                        Some(handler) => handler,
                        None => return Ok(MetaResult::Value(TValue::Nil)),
                    }
                }
                _ => self
                    .tm_by_obj(&t, TagMethod::Index)
                    .ok_or_else(|| self.type_error(&t, "index"))?,
            };
            if handler.is_function() {
                return Ok(MetaResult::Call {
                    handler,
                    args: [t, *key],
                });
            }
            t = handler;
        }
        Err(HetError::runtime("'__index' chain too long; possible loop"))
    }

    /// `t[key] = value`, following `__newindex` chains.
    pub fn set_index_dispatch(
        &mut self,
        t: &TValue,
        key: &TValue,
        value: &TValue,
    ) -> Result<SetResult, HetError> {
        let mut t = *t;
        for _ in 0..MAX_TAG_LOOP {
            let handler = match t {
                TValue::Table(h) => {
                    let mt = self.heap.get(h).metatable;
                    let present = !self.heap.table_get(h, key).is_nil();
                    match self.heap.metamethod(mt, TagMethod::NewIndex) {
                        Some(handler) if !present => handler,
                        _ => {
                            self.heap.table_set(h, *key, *value)?;
                            return Ok(SetResult::Done);
                        }
                    }
                }
                _ => self
                    .tm_by_obj(&t, TagMethod::NewIndex)
                    .ok_or_else(|| self.type_error(&t, "index"))?,
            };
            if handler.is_function() {
                return Ok(SetResult::Call {
                    handler,
                    args: [t, *key, *value],
                });
            }
            t = handler;
        }
        Err(HetError::runtime("'__newindex' chain too long; possible loop"))
    }

    /// Length operator.
    pub fn len_dispatch(&mut self, v: &TValue) -> Result<MetaResult, HetError> {
        if let Some(s) = v.as_string() {
            let n = self.heap.string_bytes(s).len();
            return Ok(MetaResult::Value(TValue::from_integer(n as Integer)));
        }
        let handler = match *v {
            TValue::Table(h) => {
                let mt = self.heap.get(h).metatable;
                match self.heap.metamethod(mt, TagMethod::Len) {
                    Some(handler) => handler,
                    None => {
                        let n = self.heap.table_length(h);
                        return Ok(MetaResult::Value(TValue::from_integer(n as Integer)));
                    }
                }
            }
            _ => self
                .tm_by_obj(v, TagMethod::Len)
                .ok_or_else(|| self.type_error(v, "get length of"))?,
        };
        Ok(MetaResult::Call {
            handler,
            args: [*v, *v],
        })
    }

    // ---- Operations ----

    fn finish(&mut self, r: MetaResult) -> Result<TValue, HetError> {
        match r {
            MetaResult::Value(v) => Ok(v),
            MetaResult::Call { handler, args } => Ok(self
                .call_value(handler, &args)?
                .first()
                .copied()
                .unwrap_or(TValue::Nil)),
        }
    }

    pub fn arith(&mut self, op: ArithOp, a: &TValue, b: &TValue) -> Result<TValue, HetError> {
        self.locked(|s| {
            let r = s.arith_dispatch(op, a, b)?;
            s.finish(r)
        })
    }

    pub fn concat(&mut self, a: &TValue, b: &TValue) -> Result<TValue, HetError> {
        self.locked(|s| {
            let r = s.concat_dispatch(a, b)?;
            s.finish(r)
        })
    }

    pub fn compare(&mut self, op: CompareOp, a: &TValue, b: &TValue) -> Result<bool, HetError> {
        self.locked(|s| {
            let r = s.compare_dispatch(op, a, b)?;
            Ok(s.finish(r)?.is_truthy())
        })
    }

    pub fn index(&mut self, t: &TValue, key: &TValue) -> Result<TValue, HetError> {
        self.locked(|s| {
            let r = s.index_dispatch(t, key)?;
            s.finish(r)
        })
    }

    pub fn set_index(&mut self, t: &TValue, key: &TValue, value: &TValue) -> Result<(), HetError> {
        self.locked(|s| match s.set_index_dispatch(t, key, value)? {
            SetResult::Done => Ok(()),
            SetResult::Call { handler, args } => s.call_value(handler, &args).map(|_| ()),
        })
    }

    pub fn len(&mut self, v: &TValue) -> Result<TValue, HetError> {
        self.locked(|s| {
            let r = s.len_dispatch(v)?;
            s.finish(r)
        })
    }
}

/// Mathematical ordering of two numbers; `None` if either is NaN.
fn num_cmp(a: &TValue, b: &TValue) -> Option<Ordering> {
    match (*a, *b) {
        (TValue::Integer(x), TValue::Integer(y)) => Some(x.cmp(&y)),
        (TValue::Integer(i), TValue::Float(f)) => int_float_cmp(i, f),
        (TValue::Float(f), TValue::Integer(i)) => int_float_cmp(i, f).map(Ordering::reverse),
        _ => a.as_number()?.partial_cmp(&b.as_number()?),
    }
}

/// Compare an integer with a float without rounding the integer.
fn int_float_cmp(i: Integer, f: Number) -> Option<Ordering> {
    if f.is_nan() {
        return None;
    }
    if let Some(n) = float_to_integer(f, F2IMode::Exact) {
        return Some(i.cmp(&n));
    }
    // f is not integral: i < f exactly when i <= floor(f).
    match float_to_integer(f, F2IMode::Floor) {
        Some(fl) if i <= fl => Some(Ordering::Less),
        Some(_) => Some(Ordering::Greater),
        None if f > 0.0 => Some(Ordering::Less),
        None => Some(Ordering::Greater),
    }
}
