//! Numeric model, fixed limits and run-time configuration for the heap.

// ---- Numeric model ----

/// Integer type of the language. `int32` selects a 32-bit model.
#[cfg(not(feature = "int32"))]
pub type Integer = i64;
#[cfg(not(feature = "int32"))]
pub type Unsigned = u64;
#[cfg(feature = "int32")]
pub type Integer = i32;
#[cfg(feature = "int32")]
pub type Unsigned = u32;

/// Float type of the language. `float32` selects single precision.
#[cfg(not(feature = "float32"))]
pub type Number = f64;
#[cfg(feature = "float32")]
pub type Number = f32;

pub const MAX_INTEGER: Integer = Integer::MAX;
pub const MIN_INTEGER: Integer = Integer::MIN;

/// Bits in an `Integer`, used by shifts.
pub const INTEGER_BITS: u32 = Integer::BITS;

/// Significant digits used when formatting floats (`%.14g` / `%.7g`).
#[cfg(not(feature = "float32"))]
pub const NUMBER_DIGITS: usize = 14;
#[cfg(feature = "float32")]
pub const NUMBER_DIGITS: usize = 7;

// ---- Strings ----

/// Longest string that is interned.
pub const MAX_SHORT_LEN: usize = 40;
/// Length byte marking a long string.
pub const LONG_STRING_LEN: u8 = 0xFF;
/// Initial (and minimum) bucket count of the short-string table.
pub const MIN_STR_TABLE_SIZE: usize = 128;
/// Upper bound on bucket count of the short-string table.
pub const MAX_STR_TABLE_SIZE: usize = 1 << 30;
/// Number of sets in the number-to-string cache.
pub const STR_CACHE_N: usize = 53;
/// Slots per set in the number-to-string cache.
pub const STR_CACHE_M: usize = 2;
/// Maximum size of a source id in messages.
pub const ID_SIZE: usize = 60;

// ---- Tables ----

/// Largest exponent for the array part (sizes are capped at `1 << MAX_ABITS`).
pub const MAX_ABITS: u32 = 31;
pub const MAX_ASIZE: usize = 1 << MAX_ABITS;
/// Largest exponent for the hash part.
pub const MAX_HBITS: u32 = MAX_ABITS - 1;

// ---- Calls and stacks ----

/// Maximum nesting of native calls.
pub const MAX_C_CALLS: u32 = 200;
/// Minimum free slots a native function can count on.
pub const MIN_STACK: usize = 20;
/// Slots kept beyond the logical stack size.
pub const EXTRA_STACK: usize = 5;
/// Initial stack size of a new thread.
pub const BASIC_STACK_SIZE: usize = 2 * MIN_STACK;
/// Default ceiling on slots per thread.
pub const MAX_STACK: usize = 1_000_000;
/// Maximum number of upvalues in a closure.
pub const MAX_UPVAL: usize = 255;

// ---- Line information ----

/// Largest delta storable in the per-instruction line byte.
pub const LIM_LINE_DIFF: i32 = 0x80;
/// Maximum run of instructions between absolute anchors.
pub const MAX_INSTR_WITHOUT_ABS: u32 = 128;
/// Line-delta byte meaning "see the absolute anchors".
pub const ABS_LINE_INFO: i8 = -0x80;

// ---- Versioning ----

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_NUM: u8 = VERSION_MAJOR * 16 + VERSION_MINOR;
pub const VERSION: &str = "Het 0.1";
/// Leading bytes of a precompiled chunk.
pub const SIGNATURE: &[u8; 4] = b"\x1bHet";

/// Seed used when none is configured.
pub const DEFAULT_SEED: u32 = 0x2545_F491;

/// Run-time parameters of a [`GcHeap`](crate::gc::GcHeap).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Initial bucket count of the short-string table (rounded to a power of two).
    pub string_table_size: usize,
    /// Seed mixed into every string hash.
    pub seed: u32,
    /// Approximate byte ceiling for live objects. `None` means unbounded.
    pub memory_limit: Option<usize>,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            string_table_size: MIN_STR_TABLE_SIZE,
            seed: DEFAULT_SEED,
            memory_limit: None,
        }
    }
}

/// Assertion that only runs in debug builds or with the `checked` feature.
#[macro_export]
macro_rules! het_assert {
    ($($arg:tt)*) => {
        if cfg!(any(debug_assertions, feature = "checked")) {
            assert!($($arg)*);
        }
    };
}
