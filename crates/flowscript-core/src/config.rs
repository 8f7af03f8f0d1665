//! Sandbox configuration: engine resource limits, the capability allow-list
//! and the context property used for persisted state.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};
use crate::filter::CapabilityPolicy;

/// Context property holding the persisted state envelope between requests.
pub const DEFAULT_STATE_PROPERTY: &str = "flowscript.bindings";

/// Configuration for one sandbox template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum engine operations per evaluation.
    pub max_operations: u64,
    /// Maximum script function call depth.
    pub max_call_levels: usize,
    /// Maximum expression nesting at global level.
    pub max_expr_depth: usize,
    /// Maximum expression nesting inside functions.
    pub max_function_expr_depth: usize,
    /// Maximum string length in characters.
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    /// Context property the state envelope is stored under.
    pub state_property: String,
    /// Host types scripts may touch.
    pub capabilities: CapabilityPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            max_call_levels: 32,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 64 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
            state_property: DEFAULT_STATE_PROPERTY.to_string(),
            capabilities: CapabilityPolicy::facade_defaults(),
        }
    }
}

impl SandboxConfig {
    pub fn from_toml_str(content: &str) -> SandboxResult<Self> {
        let config: SandboxConfig = toml::from_str(content)
            .map_err(|e| SandboxError::Init(format!("invalid sandbox config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> SandboxResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Init(format!("cannot read sandbox config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject limits that would make every evaluation fail.
    pub fn validate(&self) -> SandboxResult<()> {
        let limits = [
            ("max_operations", self.max_operations as usize),
            ("max_call_levels", self.max_call_levels),
            ("max_expr_depth", self.max_expr_depth),
            ("max_function_expr_depth", self.max_function_expr_depth),
            ("max_string_size", self.max_string_size),
            ("max_array_size", self.max_array_size),
            ("max_map_size", self.max_map_size),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(SandboxError::Init(format!("{name} must be greater than zero")));
        }
        if self.state_property.trim().is_empty() {
            return Err(SandboxError::Init("state_property must not be blank".into()));
        }
        Ok(())
    }
}
