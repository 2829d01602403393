//! Plugin Types - Shared data structures for the pluggable bot
//!
//! This crate contains the plain records passed between the dispatcher, the
//! plugin runtime and plugin handlers. It has no async or I/O dependencies.

mod execution;
mod message;
mod result;

pub use execution::*;
pub use message::*;
pub use result::*;
