//! Error taxonomy for the flowscript sandbox.
//!
//! Only [`SandboxError::CapabilityDenied`] and [`SandboxError::Restore`] are
//! flow-fatal. [`AccessorFailure`] never leaves the facade layer.

/// Reasons a captured state blob could not be turned back into a live environment.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("closure '{name}' failed to recompile: {reason}")]
    Compile { name: String, reason: String },

    #[error("closure source does not define function '{name}'")]
    MissingFunction { name: String },

    #[error("closure source for '{name}' is not a plain definition: {detail}")]
    UnexpectedContent { name: String, detail: String },

    #[error("dialect mismatch: captured with {captured}, running {running}")]
    DialectMismatch { captured: String, running: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("malformed state blob: {0}")]
    Malformed(String),
}

/// Errors crossing the sandbox boundary.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Template construction failed; fatal at startup, never per flow.
    #[error("sandbox initialisation failed: {0}")]
    Init(String),

    #[error("capability denied: script may not touch host type '{type_id}'")]
    CapabilityDenied { type_id: String },

    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),

    #[error("script error: {0}")]
    Script(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SandboxError {
    /// Whether the orchestrator must abort the flow on this error.
    pub fn is_flow_fatal(&self) -> bool {
        matches!(
            self,
            SandboxError::CapabilityDenied { .. } | SandboxError::Restore(_)
        )
    }
}

/// A single facade member lookup failed. Recovered inside the facade.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessorFailure {
    #[error("no authenticated user for {selector}")]
    NoAuthenticatedUser { selector: String },

    #[error("user id not found for user {user}")]
    UserIdNotFound { user: String },

    #[error("{0}")]
    Unavailable(String),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
