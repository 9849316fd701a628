//! Het runtime state: the registry and per-type metatables, metamethod
//! dispatch by value, binary chunk loading and the collection entry point.

pub mod binary_chunk;
pub mod error;
pub mod metamethod;
pub mod state;

pub use error::{HetError, Status};
pub use state::{HostLock, NoLock, State, StateConfig};
