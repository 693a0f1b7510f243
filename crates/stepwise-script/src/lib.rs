//! Sandboxed evaluation of user scripts.
//!
//! Scripts are Rhai. A script sees only the bindings it is handed: there is no
//! module resolver, no `eval`, and no file, network or process access. Every
//! evaluation runs on the blocking pool and is bounded by a wall-clock timeout
//! and an operation budget, both enforced from the engine's progress hook.

mod sandbox;

pub use sandbox::{RhaiScriptRunner, ScriptLimits};
