//! Numeric conversions and raw arithmetic.

use crate::limits::{
    Integer, Number, Unsigned, ID_SIZE, INTEGER_BITS, MAX_INTEGER, MIN_INTEGER, NUMBER_DIGITS,
};
use crate::tm::TagMethod;
use crate::value::TValue;
use thiserror::Error;

/// Arithmetic and bitwise operators, with their stable codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArithOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Mod = 3,
    Pow = 4,
    Div = 5,
    IDiv = 6,
    BAnd = 7,
    BOr = 8,
    BXor = 9,
    Shl = 10,
    Shr = 11,
    Unm = 12,
    BNot = 13,
}

impl ArithOp {
    pub const ALL: [ArithOp; 14] = [
        ArithOp::Add,
        ArithOp::Sub,
        ArithOp::Mul,
        ArithOp::Mod,
        ArithOp::Pow,
        ArithOp::Div,
        ArithOp::IDiv,
        ArithOp::BAnd,
        ArithOp::BOr,
        ArithOp::BXor,
        ArithOp::Shl,
        ArithOp::Shr,
        ArithOp::Unm,
        ArithOp::BNot,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::BNot
        )
    }

    pub fn is_unary(self) -> bool {
        matches!(self, ArithOp::Unm | ArithOp::BNot)
    }

    /// The metamethod event for this operator.
    pub fn tm(self) -> TagMethod {
        TagMethod::ALL[TagMethod::Add as usize + self as usize]
    }
}

/// Comparison operators, with their stable codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompareOp {
    Eq = 0,
    Lt = 1,
    Le = 2,
}

impl CompareOp {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CompareOp::Eq),
            1 => Some(CompareOp::Lt),
            2 => Some(CompareOp::Le),
            _ => None,
        }
    }

    pub fn tm(self) -> TagMethod {
        match self {
            CompareOp::Eq => TagMethod::Eq,
            CompareOp::Lt => TagMethod::Lt,
            CompareOp::Le => TagMethod::Le,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ArithError {
    #[error("attempt to perform 'n//0'")]
    DivideByZero,
    #[error("attempt to perform 'n%0'")]
    ModuloByZero,
    #[error("number has no integer representation")]
    NoIntegerRepresentation,
    #[error("attempt to perform arithmetic on a non-number value")]
    NotANumber,
}

/// Rounding used when converting floats to integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum F2IMode {
    /// Only integral values convert.
    Exact,
    Floor,
    Ceil,
}

/// Convert a float to an integer if it is in range (after rounding per `mode`).
pub fn float_to_integer(f: Number, mode: F2IMode) -> Option<Integer> {
    let mut fl = f.floor();
    if f != fl {
        match mode {
            F2IMode::Exact => return None,
            F2IMode::Floor => {}
            F2IMode::Ceil => fl += 1.0,
        }
    }
    if fl >= MIN_INTEGER as Number && fl < -(MIN_INTEGER as Number) {
        Some(fl as Integer)
    } else {
        None
    }
}

/// Integer value of a number without string coercion (floats must be integral).
pub fn to_integer_strict(v: &TValue) -> Option<Integer> {
    match *v {
        TValue::Integer(i) => Some(i),
        TValue::Float(f) => float_to_integer(f, F2IMode::Exact),
        _ => None,
    }
}

/// `ceil(log2(x))` for `x >= 1`.
pub fn ceil_log2(x: u32) -> u32 {
    het_assert!(x > 0);
    if x <= 1 {
        0
    } else {
        u32::BITS - (x - 1).leading_zeros()
    }
}

/// UTF-8 encoding of `x` (up to 0x7FFFFFFF, allowing the old 5- and 6-byte forms).
pub fn utf8_escape(mut x: u32) -> Vec<u8> {
    het_assert!(x <= 0x7FFF_FFFF);
    if x < 0x80 {
        return vec![x as u8];
    }
    let mut buf = [0u8; 8];
    let mut n = 1;
    let mut mfb: u32 = 0x3f;
    loop {
        buf[8 - n] = 0x80 | (x & 0x3f) as u8;
        n += 1;
        x >>= 6;
        mfb >>= 1;
        if x <= mfb {
            break;
        }
    }
    buf[8 - n] = ((!mfb << 1) | x) as u8;
    buf[8 - n..].to_vec()
}

fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

fn trim(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&c| !is_space(c)).unwrap_or(s.len());
    let end = s.iter().rposition(|&c| !is_space(c)).map_or(start, |e| e + 1);
    &s[start..end]
}

fn split_sign(s: &[u8]) -> (bool, &[u8]) {
    match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    }
}

fn str_to_int(s: &[u8]) -> Option<Integer> {
    let (neg, s) = split_sign(trim(s));
    let mut a: Unsigned = 0;
    if s.len() >= 2 && s[0] == b'0' && (s[1] == b'x' || s[1] == b'X') {
        let digits = &s[2..];
        if digits.is_empty() {
            return None;
        }
        for &c in digits {
            let d = (c as char).to_digit(16)?;
            a = a.wrapping_mul(16).wrapping_add(d as Unsigned);
        }
    } else {
        if s.is_empty() {
            return None;
        }
        let maxby10 = (MAX_INTEGER / 10) as Unsigned;
        let maxlastd = (MAX_INTEGER % 10) as Unsigned;
        for &c in s {
            let d = (c as char).to_digit(10)? as Unsigned;
            // Decimal overflow is not an integer; it may still be a float.
            if a >= maxby10 && (a > maxby10 || d > maxlastd + neg as Unsigned) {
                return None;
            }
            a = a * 10 + d;
        }
    }
    Some(if neg { a.wrapping_neg() } else { a } as Integer)
}

fn hex_float(s: &[u8]) -> Option<Number> {
    let (neg, s) = split_sign(s);
    let s = s.strip_prefix(b"0x").or_else(|| s.strip_prefix(b"0X"))?;
    let mut mantissa = 0f64;
    let mut exp: i32 = 0;
    let mut any = false;
    let mut seen_dot = false;
    let mut i = 0;
    while i < s.len() {
        let c = s[i];
        if c == b'.' {
            if seen_dot {
                break;
            }
            seen_dot = true;
        } else if let Some(d) = (c as char).to_digit(16) {
            mantissa = mantissa * 16.0 + d as f64;
            if seen_dot {
                exp -= 4;
            }
            any = true;
        } else {
            break;
        }
        i += 1;
    }
    if !any {
        return None;
    }
    if i < s.len() && (s[i] == b'p' || s[i] == b'P') {
        let (eneg, digits) = split_sign(&s[i + 1..]);
        if digits.is_empty() {
            return None;
        }
        let mut e: i32 = 0;
        for &c in digits {
            let d = (c as char).to_digit(10)? as i32;
            e = e.saturating_mul(10).saturating_add(d);
        }
        exp = exp.saturating_add(if eneg { -e } else { e });
        i = s.len();
    }
    if i != s.len() {
        return None;
    }
    let v = mantissa * 2f64.powi(exp);
    Some((if neg { -v } else { v }) as Number)
}

fn str_to_float(s: &[u8]) -> Option<Number> {
    // Reject 'inf' and 'nan' spellings.
    if s.iter().any(|&c| c == b'n' || c == b'N') {
        return None;
    }
    let t = trim(s);
    if t.iter().any(|&c| c == b'x' || c == b'X') {
        return hex_float(t);
    }
    std::str::from_utf8(t).ok()?.parse::<Number>().ok()
}

/// Parse a numeral: decimal or hex integers (hex wraps around), decimal or
/// hex floats, with optional surrounding whitespace.
pub fn str_to_number(s: &[u8]) -> Option<TValue> {
    if let Some(i) = str_to_int(s) {
        return Some(TValue::Integer(i));
    }
    str_to_float(s).map(TValue::Float)
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

/// `printf("%.*g")` formatting.
fn fmt_g(n: f64, prec: usize) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let sci = format!("{:.*e}", prec - 1, n);
    let (mant, exp) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= prec as i32 {
        format!(
            "{}e{}{:02}",
            trim_zeros(mant),
            if exp < 0 { '-' } else { '+' },
            exp.abs()
        )
    } else {
        let decimals = (prec as i32 - 1 - exp) as usize;
        trim_zeros(&format!("{:.*}", decimals, n)).to_string()
    }
}

/// String form of a number: `%d` for integers, `%.14g` for floats with a
/// trailing `.0` when the result would read as an integer.
pub fn number_to_string(v: TValue) -> Option<String> {
    match v {
        TValue::Integer(i) => Some(i.to_string()),
        TValue::Float(f) => {
            let mut s = fmt_g(f as f64, NUMBER_DIGITS);
            if s.bytes().all(|c| c == b'-' || c.is_ascii_digit()) {
                s.push_str(".0");
            }
            Some(s)
        }
        _ => None,
    }
}

fn imod(m: Integer, n: Integer) -> Result<Integer, ArithError> {
    if (n as Unsigned).wrapping_add(1) <= 1 {
        // n is 0 or -1
        if n == 0 {
            return Err(ArithError::ModuloByZero);
        }
        return Ok(0);
    }
    let r = m % n;
    Ok(if r != 0 && (r ^ n) < 0 { r + n } else { r })
}

fn idiv(m: Integer, n: Integer) -> Result<Integer, ArithError> {
    if (n as Unsigned).wrapping_add(1) <= 1 {
        if n == 0 {
            return Err(ArithError::DivideByZero);
        }
        return Ok(m.wrapping_neg());
    }
    let q = m / n;
    Ok(if (m ^ n) < 0 && m % n != 0 { q - 1 } else { q })
}

/// Logical shift left by `y` (right when negative); shifts of the full
/// width or more give 0.
pub fn shift_left(x: Integer, y: Integer) -> Integer {
    let bits = INTEGER_BITS as Integer;
    if y < 0 {
        if y <= -bits {
            0
        } else {
            ((x as Unsigned) >> (-y) as u32) as Integer
        }
    } else if y >= bits {
        0
    } else {
        ((x as Unsigned) << y as u32) as Integer
    }
}

fn int_arith(op: ArithOp, a: Integer, b: Integer) -> Result<Integer, ArithError> {
    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Mod => imod(a, b)?,
        ArithOp::IDiv => idiv(a, b)?,
        ArithOp::BAnd => a & b,
        ArithOp::BOr => a | b,
        ArithOp::BXor => a ^ b,
        ArithOp::Shl => shift_left(a, b),
        ArithOp::Shr => shift_left(a, b.wrapping_neg()),
        ArithOp::Unm => a.wrapping_neg(),
        ArithOp::BNot => !a,
        ArithOp::Div | ArithOp::Pow => unreachable!("float-only operator"),
    })
}

fn num_arith(op: ArithOp, a: Number, b: Number) -> Number {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Pow => {
            if b == 2.0 {
                a * a
            } else {
                a.powf(b)
            }
        }
        ArithOp::IDiv => (a / b).floor(),
        ArithOp::Unm => -a,
        ArithOp::Mod => {
            let m = a % b;
            if (m > 0.0 && b < 0.0) || (m < 0.0 && b != m && b > 0.0) {
                m + b
            } else {
                m
            }
        }
        _ => unreachable!("integer-only operator"),
    }
}

/// Primitive arithmetic without metamethods or string coercion. Unary
/// operators take the operand twice. Bitwise operators need integral
/// operands; `/` and `^` always give floats; the rest stay integers when
/// both operands are.
pub fn raw_arith(op: ArithOp, a: &TValue, b: &TValue) -> Result<TValue, ArithError> {
    if op.is_bitwise() {
        return match (to_integer_strict(a), to_integer_strict(b)) {
            (Some(x), Some(y)) => Ok(TValue::Integer(int_arith(op, x, y)?)),
            _ if a.is_number() && b.is_number() => Err(ArithError::NoIntegerRepresentation),
            _ => Err(ArithError::NotANumber),
        };
    }
    if let (TValue::Integer(x), TValue::Integer(y)) = (*a, *b) {
        if !matches!(op, ArithOp::Div | ArithOp::Pow) {
            return Ok(TValue::Integer(int_arith(op, x, y)?));
        }
    }
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok(TValue::Float(num_arith(op, x, y))),
        _ => Err(ArithError::NotANumber),
    }
}

/// Printable source name for messages: `=name` is used literally, `@file`
/// keeps the tail of long paths, anything else becomes `[string "..."]`.
pub fn chunk_id(source: &[u8]) -> String {
    const RETS: &[u8] = b"...";
    const PRE: &[u8] = b"[string \"";
    const POS: &[u8] = b"\"]";
    let mut out = Vec::with_capacity(ID_SIZE);
    match source.first() {
        Some(b'=') => {
            let rest = &source[1..];
            out.extend_from_slice(&rest[..rest.len().min(ID_SIZE - 1)]);
        }
        Some(b'@') => {
            if source.len() <= ID_SIZE {
                out.extend_from_slice(&source[1..]);
            } else {
                let keep = ID_SIZE - RETS.len() - 1;
                out.extend_from_slice(RETS);
                out.extend_from_slice(&source[source.len() - keep..]);
            }
        }
        _ => {
            let avail = ID_SIZE - (PRE.len() + RETS.len() + POS.len()) - 1;
            let nl = source.iter().position(|&c| c == b'\n');
            out.extend_from_slice(PRE);
            if source.len() < avail && nl.is_none() {
                out.extend_from_slice(source);
            } else {
                let len = nl.unwrap_or(source.len()).min(avail);
                out.extend_from_slice(&source[..len]);
                out.extend_from_slice(RETS);
            }
            out.extend_from_slice(POS);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
