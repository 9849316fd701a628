//! Het core types: tagged values, the object heap, strings, tables,
//! closures and the metamethod registry.

#[macro_use]
pub mod limits;

pub mod closure;
pub mod collector;
pub mod gc;
pub mod number;
pub mod object;
pub mod proto;
pub mod string;
pub mod table;
pub mod thread;
pub mod tm;
pub mod value;
