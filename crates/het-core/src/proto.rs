//! Function prototypes and their debug information.
//!
//! Line numbers are stored as one signed byte per instruction holding the
//! difference from the previous instruction's line. When the difference does
//! not fit, or after `MAX_INSTR_WITHOUT_ABS` instructions without an anchor,
//! the byte is `ABS_LINE_INFO` and the real line goes into the sparse
//! `abs_line_info` list. Resolving a pc therefore only walks a bounded
//! number of deltas from the nearest anchor.

use crate::gc::{Arena, GcHeap, GcIdx, GcObject, HeapError, ObjKind};
use crate::limits::{ABS_LINE_INFO, LIM_LINE_DIFF, MAX_INSTR_WITHOUT_ABS};
use crate::string::TString;
use crate::value::{TValue, V_PROTO};
use std::mem;

/// A 32-bit encoded instruction. Decoding belongs to the dispatch loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Instruction(pub u32);

/// Description of an upvalue.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpvalDesc {
    pub name: Option<GcIdx<TString>>,
    /// True if captured from the enclosing function's registers, false if
    /// taken from its upvalues.
    pub in_stack: bool,
    /// Register or upvalue index in the enclosing function.
    pub index: u8,
    /// Variable kind (regular, const, to-be-closed, compile-time const).
    pub kind: u8,
}

/// A local variable debug entry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalVar {
    pub name: GcIdx<TString>,
    /// First pc where the variable is active.
    pub start_pc: u32,
    /// First pc where the variable is dead.
    pub end_pc: u32,
}

/// Absolute line anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbsLineInfo {
    pub pc: u32,
    pub line: i32,
}

/// A compiled function. Immutable once on the heap.
#[derive(Clone, Debug, Default)]
pub struct Proto {
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    pub code: Vec<Instruction>,
    pub constants: Vec<TValue>,
    pub protos: Vec<GcIdx<Proto>>,
    pub upvalues: Vec<UpvalDesc>,
    pub source: Option<GcIdx<TString>>,
    pub line_defined: i32,
    pub last_line_defined: i32,

    // --- Debug info ---
    pub line_info: Vec<i8>,
    pub abs_line_info: Vec<AbsLineInfo>,
    pub local_vars: Vec<LocalVar>,
}

impl Proto {
    /// Nearest anchor at or before `pc`, as (anchor pc, line). With no
    /// anchor the walk starts before the first instruction, at
    /// `line_defined`.
    fn base_line(&self, pc: usize) -> (Option<usize>, i32) {
        let i = self
            .abs_line_info
            .partition_point(|a| a.pc as usize <= pc);
        match i.checked_sub(1).map(|i| self.abs_line_info[i]) {
            Some(anchor) => (Some(anchor.pc as usize), anchor.line),
            None => (None, self.line_defined),
        }
    }

    /// Source line of instruction `pc`, if the prototype has line info for it.
    pub fn line_for_pc(&self, pc: usize) -> Option<i32> {
        if pc >= self.line_info.len() {
            return None;
        }
        let (base_pc, mut line) = self.base_line(pc);
        let start = base_pc.map_or(0, |b| b + 1);
        for &delta in &self.line_info[start..=pc] {
            het_assert!(delta != ABS_LINE_INFO, "unanchored absolute line marker");
            line = line.wrapping_add(delta as i32);
        }
        Some(line)
    }

    /// Name of the `n`-th (1-based) local variable active at `pc`.
    pub fn local_name(&self, mut n: usize, pc: u32) -> Option<GcIdx<TString>> {
        if n == 0 {
            return None;
        }
        for var in self.local_vars.iter().take_while(|v| v.start_pc <= pc) {
            if pc < var.end_pc {
                n -= 1;
                if n == 0 {
                    return Some(var.name);
                }
            }
        }
        None
    }

    /// Index of `v` in the constant table, adding it if new. Constants are
    /// deduplicated by identity, so `1` and `1.0` stay distinct.
    pub fn add_constant(&mut self, v: TValue) -> usize {
        if let Some(i) = self.constants.iter().position(|c| *c == v) {
            return i;
        }
        self.constants.push(v);
        self.constants.len() - 1
    }

    /// Append an instruction with its source line.
    pub fn emit(&mut self, inst: Instruction, line: i32, lines: &mut LineInfoBuilder) {
        self.code.push(inst);
        lines.save(self, line);
    }

    /// Drop all debug information.
    pub fn strip(&mut self) {
        self.line_info.clear();
        self.abs_line_info.clear();
        self.local_vars.clear();
        self.source = None;
        for uv in &mut self.upvalues {
            uv.name = None;
        }
    }
}

/// Compiler-side state for encoding line info as instructions are emitted.
#[derive(Clone, Debug)]
pub struct LineInfoBuilder {
    previous_line: i32,
    instr_without_abs: u32,
}

impl LineInfoBuilder {
    pub fn new(line_defined: i32) -> Self {
        LineInfoBuilder {
            previous_line: line_defined,
            instr_without_abs: 0,
        }
    }

    /// Record the line of the instruction just appended to `proto.code`.
    pub fn save(&mut self, proto: &mut Proto, line: i32) {
        het_assert!(proto.line_info.len() + 1 == proto.code.len());
        let pc = proto.code.len().saturating_sub(1);
        let mut diff = line.wrapping_sub(self.previous_line);
        let anchor = diff.unsigned_abs() >= LIM_LINE_DIFF as u32
            || self.instr_without_abs >= MAX_INSTR_WITHOUT_ABS;
        self.instr_without_abs += 1;
        if anchor {
            proto.abs_line_info.push(AbsLineInfo {
                pc: pc as u32,
                line,
            });
            diff = ABS_LINE_INFO as i32;
            self.instr_without_abs = 1;
        }
        proto.line_info.push(diff as i8);
        self.previous_line = line;
    }
}

impl GcObject for Proto {
    const KIND: ObjKind = ObjKind::Proto;

    fn arena(heap: &GcHeap) -> &Arena<Self> {
        &heap.protos
    }

    fn arena_mut(heap: &mut GcHeap) -> &mut Arena<Self> {
        &mut heap.protos
    }

    fn variant_tag(&self) -> u8 {
        V_PROTO
    }

    fn byte_size(&self) -> usize {
        mem::size_of::<Proto>()
            + self.code.len() * mem::size_of::<Instruction>()
            + self.constants.len() * mem::size_of::<TValue>()
            + self.protos.len() * mem::size_of::<GcIdx<Proto>>()
            + self.upvalues.len() * mem::size_of::<UpvalDesc>()
            + self.line_info.len()
            + self.abs_line_info.len() * mem::size_of::<AbsLineInfo>()
            + self.local_vars.len() * mem::size_of::<LocalVar>()
    }
}

impl GcHeap {
    pub fn new_proto(&mut self, proto: Proto) -> Result<GcIdx<Proto>, HeapError> {
        self.link(proto)
    }
}
