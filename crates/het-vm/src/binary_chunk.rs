//! Binary chunk serialization (dump) and deserialization (undump).
//!
//! A chunk is a fixed header followed by the upvalue count of the main
//! function and the function tree. Sizes and small integers use a
//! big-endian base-128 encoding with the high bit set on the last byte.
//! Integers, floats and instructions are little-endian at the widths this
//! build was configured with; chunks from a build with other widths are
//! rejected by the header check.

use het_core::gc::{GcHeap, GcIdx};
use het_core::het_assert;
use het_core::limits::{
    Integer, Number, ABS_LINE_INFO, MAX_C_CALLS, SIGNATURE, VERSION_NUM,
};
use het_core::proto::{AbsLineInfo, Instruction, LocalVar, Proto, UpvalDesc};
use het_core::string::TString;
use het_core::value::{TValue, V_FALSE, V_LNGSTR, V_NIL, V_NUMFLT, V_NUMINT, V_SHRSTR, V_TRUE};
use std::mem;
use thiserror::Error;

const FORMAT: u8 = 0;
const CHECK_DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
const INSTRUCTION_SIZE: usize = mem::size_of::<u32>();
const INTEGER_SIZE: usize = mem::size_of::<Integer>();
const NUMBER_SIZE: usize = mem::size_of::<Number>();
const CHECK_INT: Integer = 0x5678;
const CHECK_NUM: Number = 370.5;

/// Deepest function nesting accepted by the loader.
const MAX_NESTING: usize = MAX_C_CALLS as usize;

/// Why a chunk was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum UndumpReason {
    #[error("truncated chunk")]
    Truncated,
    #[error("not a binary chunk")]
    NotAChunk,
    #[error("version mismatch")]
    Version,
    #[error("format mismatch")]
    Format,
    #[error("corrupted chunk")]
    Corrupted,
    #[error("{0} size mismatch")]
    Size(&'static str),
    #[error("integer format mismatch")]
    IntegerFormat,
    #[error("float format mismatch")]
    FloatFormat,
    #[error("integer overflow")]
    Overflow,
    #[error("bad constant tag {0:#04x}")]
    ConstantTag(u8),
    #[error("inconsistent line information")]
    LineInfo,
    #[error("functions nested too deeply")]
    Nesting,
    #[error("not enough memory")]
    OutOfMemory,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{chunk}: bad binary format ({reason})")]
pub struct UndumpError {
    pub chunk: String,
    pub reason: UndumpReason,
}

// ─── Dumper ─────────────────────────────────────────────────────────────

/// Serialize `proto` and its nested prototypes. With `strip`, debug
/// information (line info, local and upvalue names, sources) is omitted.
pub fn dump(heap: &GcHeap, proto: GcIdx<Proto>, strip: bool) -> Vec<u8> {
    let mut w = Writer {
        out: Vec::new(),
        heap,
        strip,
    };
    w.header();
    w.byte(heap.get(proto).upvalues.len() as u8);
    w.function(proto, None);
    w.out
}

struct Writer<'a> {
    out: Vec<u8>,
    heap: &'a GcHeap,
    strip: bool,
}

impl Writer<'_> {
    fn header(&mut self) {
        self.out.extend_from_slice(SIGNATURE);
        self.byte(VERSION_NUM);
        self.byte(FORMAT);
        self.out.extend_from_slice(CHECK_DATA);
        self.byte(INSTRUCTION_SIZE as u8);
        self.byte(INTEGER_SIZE as u8);
        self.byte(NUMBER_SIZE as u8);
        self.integer(CHECK_INT);
        self.number(CHECK_NUM);
    }

    fn byte(&mut self, b: u8) {
        self.out.push(b);
    }

    fn size(&mut self, mut n: usize) {
        let mut buf = [0u8; 10];
        let mut i = buf.len();
        loop {
            i -= 1;
            buf[i] = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                break;
            }
        }
        buf[buf.len() - 1] |= 0x80;
        self.out.extend_from_slice(&buf[i..]);
    }

    fn int(&mut self, n: i32) {
        het_assert!(n >= 0, "negative value in chunk");
        self.size(n.max(0) as usize);
    }

    fn integer(&mut self, i: Integer) {
        self.out.extend_from_slice(&i.to_le_bytes());
    }

    fn number(&mut self, f: Number) {
        self.out.extend_from_slice(&f.to_le_bytes());
    }

    /// Length plus one, then the bytes; a bare zero means no string.
    fn string(&mut self, s: Option<GcIdx<TString>>) {
        match s {
            None => self.size(0),
            Some(s) => {
                let bytes = self.heap.string_bytes(s);
                self.size(bytes.len() + 1);
                self.out.extend_from_slice(bytes);
            }
        }
    }

    fn constant(&mut self, k: &TValue) {
        match *k {
            TValue::Boolean(false) => self.byte(V_FALSE),
            TValue::Boolean(true) => self.byte(V_TRUE),
            TValue::Integer(i) => {
                self.byte(V_NUMINT);
                self.integer(i);
            }
            TValue::Float(f) => {
                self.byte(V_NUMFLT);
                self.number(f);
            }
            TValue::ShortString(s) => {
                self.byte(V_SHRSTR);
                self.string(Some(s));
            }
            TValue::LongString(s) => {
                self.byte(V_LNGSTR);
                self.string(Some(s));
            }
            ref other => {
                het_assert!(other.is_nil(), "constant of type {} in prototype", other.type_tag());
                self.byte(V_NIL);
            }
        }
    }

    fn function(&mut self, idx: GcIdx<Proto>, parent_source: Option<GcIdx<TString>>) {
        let heap = self.heap;
        let p = heap.get(idx);
        if self.strip || p.source == parent_source {
            self.string(None);
        } else {
            self.string(p.source);
        }
        self.int(p.line_defined);
        self.int(p.last_line_defined);
        self.byte(p.num_params);
        self.byte(p.is_vararg as u8);
        self.byte(p.max_stack_size);

        self.size(p.code.len());
        for inst in &p.code {
            self.out.extend_from_slice(&inst.0.to_le_bytes());
        }

        self.size(p.constants.len());
        for k in &p.constants {
            self.constant(k);
        }

        self.size(p.upvalues.len());
        for uv in &p.upvalues {
            self.byte(uv.in_stack as u8);
            self.byte(uv.index);
            self.byte(uv.kind);
        }

        self.size(p.protos.len());
        for &child in &p.protos {
            self.function(child, p.source);
        }

        self.debug(p);
    }

    fn debug(&mut self, p: &Proto) {
        if self.strip {
            for _ in 0..4 {
                self.size(0);
            }
            return;
        }
        self.size(p.line_info.len());
        self.out.extend(p.line_info.iter().map(|&d| d as u8));
        self.size(p.abs_line_info.len());
        for a in &p.abs_line_info {
            self.int(a.pc as i32);
            self.int(a.line);
        }
        self.size(p.local_vars.len());
        for var in &p.local_vars {
            self.string(Some(var.name));
            self.int(var.start_pc as i32);
            self.int(var.end_pc as i32);
        }
        self.size(p.upvalues.len());
        for uv in &p.upvalues {
            self.string(uv.name);
        }
    }
}

// ─── Undumper ───────────────────────────────────────────────────────────

type Result<T> = std::result::Result<T, UndumpReason>;

struct Reader<'a, 'h> {
    data: &'a [u8],
    pos: usize,
    heap: &'h mut GcHeap,
}

fn reserve<T>(n: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(n)
        .map_err(|_| UndumpReason::OutOfMemory)?;
    Ok(v)
}

impl<'a> Reader<'a, '_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_byte(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos).ok_or(UndumpReason::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(UndumpReason::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.read_bytes(N)?);
        Ok(buf)
    }

    fn read_unsigned(&mut self, limit: usize) -> Result<usize> {
        let limit = limit >> 7;
        let mut n: usize = 0;
        loop {
            let b = self.read_byte()?;
            if n >= limit {
                return Err(UndumpReason::Overflow);
            }
            n = (n << 7) | (b & 0x7f) as usize;
            if b & 0x80 != 0 {
                return Ok(n);
            }
        }
    }

    fn read_size(&mut self) -> Result<usize> {
        self.read_unsigned(usize::MAX)
    }

    fn read_int(&mut self) -> Result<i32> {
        Ok(self.read_unsigned(i32::MAX as usize)? as i32)
    }

    /// An element count, each element taking at least `min_bytes` bytes.
    fn read_count(&mut self, min_bytes: usize) -> Result<usize> {
        let n = self.read_size()?;
        if n.saturating_mul(min_bytes) > self.remaining() {
            return Err(UndumpReason::Truncated);
        }
        Ok(n)
    }

    fn read_integer(&mut self) -> Result<Integer> {
        Ok(Integer::from_le_bytes(self.read_array::<INTEGER_SIZE>()?))
    }

    fn read_number(&mut self) -> Result<Number> {
        Ok(Number::from_le_bytes(self.read_array::<NUMBER_SIZE>()?))
    }

    fn read_string(&mut self) -> Result<Option<GcIdx<TString>>> {
        let size = self.read_size()?;
        if size == 0 {
            return Ok(None);
        }
        let bytes = self.read_bytes(size - 1)?;
        let s = self
            .heap
            .intern(bytes)
            .map_err(|_| UndumpReason::OutOfMemory)?;
        Ok(Some(s))
    }

    fn verify_header(&mut self) -> Result<()> {
        if self.read_bytes(SIGNATURE.len() - 1)? != &SIGNATURE[1..] {
            return Err(UndumpReason::NotAChunk);
        }
        if self.read_byte()? != VERSION_NUM {
            return Err(UndumpReason::Version);
        }
        if self.read_byte()? != FORMAT {
            return Err(UndumpReason::Format);
        }
        if self.read_bytes(CHECK_DATA.len())? != CHECK_DATA {
            return Err(UndumpReason::Corrupted);
        }
        for (what, size) in [
            ("Instruction", INSTRUCTION_SIZE),
            ("integer", INTEGER_SIZE),
            ("number", NUMBER_SIZE),
        ] {
            if self.read_byte()? as usize != size {
                return Err(UndumpReason::Size(what));
            }
        }
        if self.read_integer()? != CHECK_INT {
            return Err(UndumpReason::IntegerFormat);
        }
        if self.read_number()? != CHECK_NUM {
            return Err(UndumpReason::FloatFormat);
        }
        Ok(())
    }

    fn read_constant(&mut self) -> Result<TValue> {
        let tag = self.read_byte()?;
        Ok(match tag {
            V_NIL => TValue::Nil,
            V_FALSE => TValue::Boolean(false),
            V_TRUE => TValue::Boolean(true),
            V_NUMINT => TValue::Integer(self.read_integer()?),
            V_NUMFLT => TValue::Float(self.read_number()?),
            V_SHRSTR | V_LNGSTR => match self.read_string()? {
                Some(s) => self.heap.string_value(s),
                None => return Err(UndumpReason::Corrupted),
            },
            other => return Err(UndumpReason::ConstantTag(other)),
        })
    }

    fn read_function(
        &mut self,
        parent_source: Option<GcIdx<TString>>,
        depth: usize,
    ) -> Result<GcIdx<Proto>> {
        if depth > MAX_NESTING {
            return Err(UndumpReason::Nesting);
        }
        let mut p = Proto {
            source: self.read_string()?.or(parent_source),
            line_defined: self.read_int()?,
            last_line_defined: self.read_int()?,
            num_params: self.read_byte()?,
            is_vararg: self.read_byte()? != 0,
            max_stack_size: self.read_byte()?,
            ..Proto::default()
        };

        let n = self.read_count(INSTRUCTION_SIZE)?;
        p.code = reserve(n)?;
        for _ in 0..n {
            p.code
                .push(Instruction(u32::from_le_bytes(self.read_array::<4>()?)));
        }

        let n = self.read_count(1)?;
        p.constants = reserve(n)?;
        for _ in 0..n {
            let k = self.read_constant()?;
            p.constants.push(k);
        }

        let n = self.read_count(3)?;
        p.upvalues = reserve(n)?;
        for _ in 0..n {
            let [in_stack, index, kind] = self.read_array::<3>()?;
            p.upvalues.push(UpvalDesc {
                name: None,
                in_stack: in_stack != 0,
                index,
                kind,
            });
        }

        let n = self.read_count(1)?;
        p.protos = reserve(n)?;
        for _ in 0..n {
            let child = self.read_function(p.source, depth + 1)?;
            p.protos.push(child);
        }

        self.read_debug(&mut p)?;
        self.heap
            .new_proto(p)
            .map_err(|_| UndumpReason::OutOfMemory)
    }

    fn read_debug(&mut self, p: &mut Proto) -> Result<()> {
        let n = self.read_count(1)?;
        p.line_info = self.read_bytes(n)?.iter().map(|&b| b as i8).collect();

        let n = self.read_count(2)?;
        p.abs_line_info = reserve(n)?;
        for _ in 0..n {
            let pc = self.read_int()? as u32;
            let line = self.read_int()?;
            p.abs_line_info.push(AbsLineInfo { pc, line });
        }
        check_line_info(p)?;

        let n = self.read_count(3)?;
        p.local_vars = reserve(n)?;
        for _ in 0..n {
            let name = self.read_string()?.ok_or(UndumpReason::Corrupted)?;
            let start_pc = self.read_int()? as u32;
            let end_pc = self.read_int()? as u32;
            p.local_vars.push(LocalVar {
                name,
                start_pc,
                end_pc,
            });
        }

        let n = self.read_count(1)?;
        if n > p.upvalues.len() {
            return Err(UndumpReason::Corrupted);
        }
        for i in 0..n {
            p.upvalues[i].name = self.read_string()?;
        }
        Ok(())
    }
}

/// Line info must be absent or cover every instruction, and every
/// absolute-line marker must have exactly one anchor, in pc order.
fn check_line_info(p: &Proto) -> Result<()> {
    if p.line_info.is_empty() {
        return if p.abs_line_info.is_empty() {
            Ok(())
        } else {
            Err(UndumpReason::LineInfo)
        };
    }
    if p.line_info.len() != p.code.len() {
        return Err(UndumpReason::LineInfo);
    }
    let mut anchors = p.abs_line_info.iter();
    for (pc, &delta) in p.line_info.iter().enumerate() {
        if delta == ABS_LINE_INFO {
            match anchors.next() {
                Some(a) if a.pc as usize == pc => {}
                _ => return Err(UndumpReason::LineInfo),
            }
        }
    }
    if anchors.next().is_some() {
        return Err(UndumpReason::LineInfo);
    }
    Ok(())
}

/// Name used for a chunk in error messages.
fn chunk_name(name: &str) -> String {
    match name.as_bytes().first() {
        Some(b'@') | Some(b'=') => name[1..].to_string(),
        Some(&b) if b == SIGNATURE[0] => "binary string".to_string(),
        _ => name.to_string(),
    }
}

/// True if `data` starts with the binary chunk signature byte.
pub fn is_binary_chunk(data: &[u8]) -> bool {
    data.first() == Some(&SIGNATURE[0])
}

/// Load a binary chunk, creating its prototypes (and interning their
/// strings) on `heap`. Returns the main function's prototype.
pub fn undump(heap: &mut GcHeap, data: &[u8], name: &str) -> std::result::Result<GcIdx<Proto>, UndumpError> {
    let fail = |reason| UndumpError {
        chunk: chunk_name(name),
        reason,
    };
    if !is_binary_chunk(data) {
        return Err(fail(UndumpReason::NotAChunk));
    }
    let mut reader = Reader {
        data,
        pos: 1,
        heap,
    };
    reader.verify_header().map_err(fail)?;
    let num_upvalues = reader.read_byte().map_err(fail)?;
    let proto = reader.read_function(None, 0).map_err(fail)?;
    if reader.heap.get(proto).upvalues.len() != num_upvalues as usize {
        return Err(fail(UndumpReason::Corrupted));
    }
    log::debug!(
        "loaded binary chunk {} ({} bytes)",
        chunk_name(name),
        data.len()
    );
    Ok(proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use het_core::limits::HeapConfig;
    use het_core::proto::LineInfoBuilder;

    fn heap() -> GcHeap {
        GcHeap::new(HeapConfig::default()).unwrap()
    }

    fn sample(heap: &mut GcHeap) -> GcIdx<Proto> {
        let source = heap.intern(b"@sample.het").unwrap();
        let x = heap.intern(b"x").unwrap();
        let env = heap.intern(b"_ENV").unwrap();

        let mut child = Proto {
            source: Some(source),
            line_defined: 3,
            last_line_defined: 5,
            num_params: 1,
            max_stack_size: 2,
            ..Proto::default()
        };
        let mut lines = LineInfoBuilder::new(3);
        child.emit(Instruction(0x0000_0046), 4, &mut lines);
        child.emit(Instruction(0x0001_0047), 5, &mut lines);
        let child = heap.new_proto(child).unwrap();

        let long = heap.intern(&[b'L'; 64]).unwrap();
        let mut main = Proto {
            source: Some(source),
            is_vararg: true,
            max_stack_size: 4,
            protos: vec![child],
            upvalues: vec![UpvalDesc {
                name: Some(env),
                in_stack: true,
                index: 0,
                kind: 0,
            }],
            local_vars: vec![LocalVar {
                name: x,
                start_pc: 1,
                end_pc: 3,
            }],
            ..Proto::default()
        };
        main.add_constant(TValue::Nil);
        main.add_constant(TValue::from_bool(true));
        main.add_constant(TValue::from_bool(false));
        main.add_constant(TValue::from_integer(-42));
        main.add_constant(TValue::from_float(0.5));
        main.add_constant(heap.string_value(x));
        main.add_constant(heap.string_value(long));
        let mut lines = LineInfoBuilder::new(0);
        for line in [1, 2, 900, 901] {
            main.emit(Instruction(line as u32), line, &mut lines);
        }
        heap.new_proto(main).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let mut heap = heap();
        let p = sample(&mut heap);
        let bytes = dump(&heap, p, false);
        let q = undump(&mut heap, &bytes, "=test").unwrap();

        let (a, b) = (heap.get(p), heap.get(q));
        assert_eq!(a.code, b.code);
        assert_eq!(a.is_vararg, b.is_vararg);
        assert_eq!(a.max_stack_size, b.max_stack_size);
        assert_eq!(a.line_info, b.line_info);
        assert_eq!(a.abs_line_info, b.abs_line_info);
        assert_eq!(b.line_for_pc(2), Some(900));
        assert_eq!(a.constants.len(), b.constants.len());
        for (x, y) in a.constants.iter().zip(&b.constants) {
            assert!(heap.raw_equal(x, y));
            assert_eq!(x.variant_tag(), y.variant_tag());
        }
        // Short strings come back as the same interned object.
        assert_eq!(a.constants[5], b.constants[5]);
        assert_eq!(a.upvalues, b.upvalues);
        assert_eq!(a.local_vars, b.local_vars);
        assert!(heap.eq_strings(a.source.unwrap(), b.source.unwrap()));

        let (ca, cb) = (heap.get(a.protos[0]), heap.get(b.protos[0]));
        assert_eq!(ca.num_params, 1);
        assert_eq!(cb.num_params, 1);
        assert_eq!(cb.line_defined, 3);
        assert_eq!(cb.last_line_defined, 5);
        assert_eq!(cb.line_for_pc(1), Some(5));
        // Child source was elided and inherited from the parent.
        assert_eq!(cb.source, b.source);
        assert_eq!(ca.code, cb.code);
    }

    #[test]
    fn test_stripped_roundtrip() {
        let mut heap = heap();
        let p = sample(&mut heap);
        let full = dump(&heap, p, false);
        let stripped = dump(&heap, p, true);
        assert!(stripped.len() < full.len());

        let q = undump(&mut heap, &stripped, "stripped").unwrap();
        let b = heap.get(q);
        assert_eq!(b.code, heap.get(p).code);
        assert!(b.line_info.is_empty());
        assert!(b.local_vars.is_empty());
        assert_eq!(b.source, None);
        assert_eq!(b.upvalues[0].name, None);
        assert_eq!(b.line_for_pc(0), None);
    }

    #[test]
    fn test_size_encoding() {
        let mut heap = heap();
        let mut w = Writer {
            out: Vec::new(),
            heap: &heap,
            strip: false,
        };
        w.size(0);
        w.size(0x7f);
        w.size(0x80);
        w.size(300);
        assert_eq!(w.out, vec![0x80, 0xff, 0x01, 0x80, 0x02, 0xac]);

        let mut r = Reader {
            data: &[0x02, 0xac],
            pos: 0,
            heap: &mut heap,
        };
        assert_eq!(r.read_size(), Ok(300));
    }

    #[test]
    fn test_header_errors() {
        let mut heap = heap();
        let p = heap.new_proto(Proto::default()).unwrap();
        let good = dump(&heap, p, false);
        assert!(undump(&mut heap, &good, "ok").is_ok());

        let reason = |heap: &mut GcHeap, bytes: &[u8]| undump(heap, bytes, "c").unwrap_err().reason;

        assert_eq!(reason(&mut heap, b"return 1"), UndumpReason::NotAChunk);
        assert_eq!(reason(&mut heap, b"\x1bLua"), UndumpReason::NotAChunk);

        let mut bad = good.clone();
        bad[4] = VERSION_NUM + 1;
        assert_eq!(reason(&mut heap, &bad), UndumpReason::Version);

        let mut bad = good.clone();
        bad[5] = 1;
        assert_eq!(reason(&mut heap, &bad), UndumpReason::Format);

        let mut bad = good.clone();
        bad[7] = b'\n';
        assert_eq!(reason(&mut heap, &bad), UndumpReason::Corrupted);

        let mut bad = good.clone();
        bad[13] = 99;
        assert_eq!(reason(&mut heap, &bad), UndumpReason::Size("integer"));

        let mut bad = good.clone();
        bad[15] ^= 1;
        assert_eq!(reason(&mut heap, &bad), UndumpReason::IntegerFormat);

        let mut bad = good.clone();
        bad[15 + INTEGER_SIZE] ^= 1;
        assert_eq!(reason(&mut heap, &bad), UndumpReason::FloatFormat);
    }

    #[test]
    fn test_truncation_never_panics() {
        let mut heap = heap();
        let p = sample(&mut heap);
        let bytes = dump(&heap, p, false);
        for len in 0..bytes.len() {
            assert!(undump(&mut heap, &bytes[..len], "t").is_err(), "prefix {len}");
        }
    }

    #[test]
    fn test_rejects_unanchored_line_marker() {
        let mut heap = heap();
        let p = Proto {
            code: vec![Instruction(0); 2],
            line_info: vec![0, ABS_LINE_INFO],
            ..Proto::default()
        };
        let p = heap.new_proto(p).unwrap();
        let bytes = dump(&heap, p, false);
        assert_eq!(
            undump(&mut heap, &bytes, "t").unwrap_err().reason,
            UndumpReason::LineInfo
        );
    }

    #[test]
    fn test_error_message() {
        let mut heap = heap();
        let e = undump(&mut heap, b"\x1bHet", "@main.het").unwrap_err();
        assert_eq!(e.to_string(), "main.het: bad binary format (truncated chunk)");
        let e = undump(&mut heap, b"\x1bXYZ", "\x1bHet...").unwrap_err();
        assert_eq!(e.to_string(), "binary string: bad binary format (not a binary chunk)");
    }
}
