//! Capability filter: the default-deny allow-list of host types a script may touch.
//!
//! Type identifiers are dotted strings whose first segment is a namespace
//! (`identity.user`, `lang.time`). Namespaces in [`FORBIDDEN_NAMESPACES`]
//! (reflection, dynamic loading, filesystem, process, network, environment)
//! can never be allow-listed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, SandboxResult};

/// Well-known host type identifiers.
pub mod type_ids {
    /// The flow facade handed to decision functions.
    pub const FLOW_CONTEXT: &str = "flow.context";
    /// Step-independent authenticated user facade.
    pub const USER: &str = "identity.user";
    /// Step-bound authenticated user facade.
    pub const STEP_USER: &str = "identity.step_user";
    /// Local or remote claim set facade.
    pub const CLAIMS: &str = "identity.claims";
    /// Optional timestamp package.
    pub const LANG_TIME: &str = "lang.time";
    /// Optional byte-blob package.
    pub const LANG_BLOB: &str = "lang.blob";
}

/// Namespaces that are denied regardless of policy contents.
pub const FORBIDDEN_NAMESPACES: &[&str] =
    &["reflect", "classloader", "fs", "process", "net", "env"];

/// Returns `true` if the identifier lives in a forbidden namespace.
pub fn is_forbidden(type_id: &str) -> bool {
    let namespace = type_id.split('.').next().unwrap_or(type_id).trim();
    FORBIDDEN_NAMESPACES
        .iter()
        .any(|forbidden| namespace.eq_ignore_ascii_case(forbidden))
}

/// Immutable allow-list of host type identifiers.
///
/// Built once per sandbox template and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CapabilityPolicy {
    allowed: BTreeSet<String>,
}

impl CapabilityPolicy {
    /// Build a policy from an allow-list.
    ///
    /// Fails if any identifier is blank or names a forbidden namespace.
    pub fn new<I, S>(allowed: I) -> SandboxResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for id in allowed {
            let id = id.into();
            let trimmed = id.trim();
            if trimmed.is_empty() {
                return Err(SandboxError::Init(
                    "capability policy contains a blank type identifier".into(),
                ));
            }
            if is_forbidden(trimmed) {
                return Err(SandboxError::Init(format!(
                    "type '{trimmed}' is in a forbidden namespace and cannot be allow-listed"
                )));
            }
            set.insert(trimmed.to_string());
        }
        Ok(Self { allowed: set })
    }

    /// Nothing allowed.
    pub fn deny_all() -> Self {
        Self {
            allowed: BTreeSet::new(),
        }
    }

    /// Exactly the bridging types the facade layer needs.
    pub fn facade_defaults() -> Self {
        Self {
            allowed: [
                type_ids::FLOW_CONTEXT,
                type_ids::USER,
                type_ids::STEP_USER,
                type_ids::CLAIMS,
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }

    /// Pure, default-deny membership test.
    pub fn is_allowed(&self, type_id: &str) -> bool {
        !is_forbidden(type_id) && self.allowed.contains(type_id)
    }

    /// Like [`is_allowed`](Self::is_allowed) but yields the flow-fatal error.
    pub fn check(&self, type_id: &str) -> SandboxResult<()> {
        if self.is_allowed(type_id) {
            Ok(())
        } else {
            tracing::warn!(event = "capability.denied", type_id = %type_id);
            Err(SandboxError::CapabilityDenied {
                type_id: type_id.to_string(),
            })
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self::facade_defaults()
    }
}

impl TryFrom<Vec<String>> for CapabilityPolicy {
    type Error = SandboxError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CapabilityPolicy> for Vec<String> {
    fn from(policy: CapabilityPolicy) -> Self {
        policy.allowed.into_iter().collect()
    }
}
