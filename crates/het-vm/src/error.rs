//! Runtime error types and status codes.

use crate::binary_chunk::UndumpError;
use het_core::closure::NativeError;
use het_core::gc::{GcHeap, HeapError};
use het_core::number::ArithError;
use het_core::table::TableError;
use het_core::thread::StackError;
use het_core::value::TValue;
use thiserror::Error;

/// Status codes reported to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    Yield = 1,
    ErrRun = 2,
    ErrSyntax = 3,
    ErrMem = 4,
    /// Error while running the message handler.
    ErrErr = 5,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// A runtime error.
#[derive(Clone, Debug, Error)]
pub enum HetError {
    /// General runtime error with message.
    #[error("{0}")]
    Runtime(String),
    /// Operation on a value of the wrong type.
    #[error("attempt to {op} a {type_name} value")]
    Type { op: &'static str, type_name: String },
    #[error("stack overflow")]
    StackOverflow,
    #[error("C stack overflow")]
    CStackOverflow,
    #[error("not enough memory")]
    OutOfMemory,
    #[error(transparent)]
    Undump(#[from] UndumpError),
    /// An arbitrary error object.
    #[error("error object is a {0:?} value")]
    Value(TValue),
}

impl HetError {
    pub fn status(&self) -> Status {
        match self {
            HetError::OutOfMemory => Status::ErrMem,
            HetError::Undump(_) => Status::ErrSyntax,
            HetError::Runtime(_)
            | HetError::Type { .. }
            | HetError::StackOverflow
            | HetError::CStackOverflow
            | HetError::Value(_) => Status::ErrRun,
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        HetError::Runtime(msg.into())
    }

    /// The error object a protected call reports. Out-of-memory errors use
    /// the preallocated message so reporting them never allocates.
    pub fn to_value(&self, heap: &mut GcHeap) -> TValue {
        match self {
            HetError::Value(v) => *v,
            HetError::OutOfMemory => memory_message(heap),
            other => heap
                .new_string_value(other.to_string().as_bytes())
                .unwrap_or_else(|_| memory_message(heap)),
        }
    }
}

fn memory_message(heap: &GcHeap) -> TValue {
    heap.memory_error_message()
        .map_or(TValue::Nil, |s| heap.string_value(s))
}

impl From<HeapError> for HetError {
    fn from(_: HeapError) -> Self {
        HetError::OutOfMemory
    }
}

impl From<StackError> for HetError {
    fn from(e: StackError) -> Self {
        match e {
            StackError::Overflow => HetError::StackOverflow,
            StackError::CStackOverflow => HetError::CStackOverflow,
            StackError::OutOfMemory => HetError::OutOfMemory,
        }
    }
}

impl From<TableError> for HetError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::OutOfMemory => HetError::OutOfMemory,
            TableError::NilIndex => HetError::runtime("index is nil"),
            TableError::NanIndex => HetError::runtime("index is NaN"),
            TableError::InvalidNextKey => HetError::runtime("invalid key to 'next'"),
            TableError::Overflow => HetError::runtime("table overflow"),
        }
    }
}

impl From<ArithError> for HetError {
    fn from(e: ArithError) -> Self {
        HetError::Runtime(e.to_string())
    }
}

impl From<NativeError> for HetError {
    fn from(e: NativeError) -> Self {
        match e {
            NativeError::Message(msg) => HetError::Runtime(msg),
            NativeError::Value(v) => HetError::Value(v),
        }
    }
}
