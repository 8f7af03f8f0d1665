//! Sandbox factory: the shared [`SandboxTemplate`] and the per-flow
//! [`Environment`]s it creates or restores.

mod convert;
pub mod environment;
pub mod source;
pub mod template;

pub use environment::Environment;
pub use template::{SandboxTemplate, DIALECT};
