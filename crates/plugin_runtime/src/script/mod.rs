//! Embedded JavaScript
//!
//! Script plugins and discovered script services run on QuickJS. Every engine
//! is owned by exactly one thread: plugin engines live for one invocation,
//! service engines live on the service's own worker thread.

mod convert;
mod engine;
mod globals;

pub use convert::{js_to_json, json_to_js};
pub use engine::*;
pub use globals::ScriptGlobals;
