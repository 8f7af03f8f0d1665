//! The per-attempt flow state consumed from the orchestrator.
//!
//! The sandbox only ever holds an `Arc<dyn FlowExecutionContext>`; the
//! orchestrator owns the state behind it. Everything is read-only from the
//! sandbox's point of view except the property slots.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::AccessorFailure;

/// Host-side authenticated identity as recorded by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub username: String,
    #[serde(default)]
    pub subject_identifier: Option<String>,
    /// Resolved lazily by the user store; `None` means the lookup fails.
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub user_store_domain: Option<String>,
    pub tenant_domain: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub local_claims: BTreeMap<String, String>,
    #[serde(default)]
    pub remote_claims: BTreeMap<String, String>,
    /// Claims set by scripts during the flow, not backed by any user store.
    #[serde(default)]
    pub runtime_claims: BTreeMap<String, String>,
}

impl AuthenticatedUser {
    pub fn new(username: impl Into<String>, tenant_domain: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            tenant_domain: tenant_domain.into(),
            ..Self::default()
        }
    }

    /// Fallible unique-id lookup.
    pub fn user_id(&self) -> Result<&str, AccessorFailure> {
        self.unique_id
            .as_deref()
            .ok_or_else(|| AccessorFailure::UserIdNotFound {
                user: self.loggable_id(),
            })
    }

    /// Identifier safe to put in log lines.
    pub fn loggable_id(&self) -> String {
        match &self.unique_id {
            Some(id) => id.clone(),
            None => format!("{}@{}", self.username, self.tenant_domain),
        }
    }
}

/// Which of a user's claim sets a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimDialect {
    Local,
    Remote,
    Runtime,
}

impl fmt::Display for ClaimDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimDialect::Local => write!(f, "local"),
            ClaimDialect::Remote => write!(f, "remote"),
            ClaimDialect::Runtime => write!(f, "runtime"),
        }
    }
}

/// Interface the orchestrator implements for one authentication attempt.
pub trait FlowExecutionContext: Send + Sync {
    /// Stable identifier of this attempt.
    fn context_id(&self) -> &str;

    fn tenant_domain(&self) -> &str;

    fn current_step(&self) -> u32;

    /// Identity provider of the current step, if one has been chosen.
    fn identity_provider(&self) -> Option<String>;

    /// Identity provider that authenticated `step`.
    fn step_identity_provider(&self, step: u32) -> Option<String>;

    /// Steps that have produced an authenticated user, ascending.
    fn completed_steps(&self) -> Vec<u32>;

    /// ACR values requested by the relying party, in request order.
    fn requested_acr(&self) -> Vec<String>;

    /// The user authenticated in `step`, or the last authenticated user when `None`.
    fn authenticated_user(&self, step: Option<u32>) -> Option<AuthenticatedUser>;

    /// A single claim of the selected user.
    fn claim(
        &self,
        step: Option<u32>,
        dialect: ClaimDialect,
        uri: &str,
    ) -> Result<Option<String>, AccessorFailure> {
        let user = self
            .authenticated_user(step)
            .ok_or_else(|| AccessorFailure::NoAuthenticatedUser {
                selector: describe_step(step),
            })?;
        let claims = match dialect {
            ClaimDialect::Local => &user.local_claims,
            ClaimDialect::Remote => &user.remote_claims,
            ClaimDialect::Runtime => &user.runtime_claims,
        };
        Ok(claims.get(uri).cloned())
    }

    fn property(&self, key: &str) -> Option<serde_json::Value>;

    fn set_property(&self, key: &str, value: serde_json::Value);

    fn remove_property(&self, key: &str) -> Option<serde_json::Value>;
}

/// Shared handle to the active flow context.
pub type SharedContext = Arc<dyn FlowExecutionContext>;

pub(crate) fn describe_step(step: Option<u32>) -> String {
    match step {
        Some(step) => format!("step {step}"),
        None => "last authenticated user".to_string(),
    }
}

/// Outcome of one completed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub idp: String,
    pub user: AuthenticatedUser,
}

fn new_context_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn first_step() -> u32 {
    1
}

/// Self-contained context used by tests and the CLI.
///
/// Deserialises from JSON fixtures:
///
/// ```json
/// {
///   "tenant_domain": "carbon.super",
///   "current_step": 2,
///   "requested_acr": ["acr2"],
///   "steps": { "1": { "idp": "LOCAL", "user": { "username": "alice", "tenant_domain": "carbon.super" } } }
/// }
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct InMemoryFlowContext {
    #[serde(default = "new_context_id")]
    context_id: String,
    tenant_domain: String,
    #[serde(default = "first_step")]
    current_step: u32,
    #[serde(default)]
    identity_provider: Option<String>,
    #[serde(default)]
    requested_acr: Vec<String>,
    #[serde(default)]
    steps: BTreeMap<u32, StepResult>,
    #[serde(default)]
    properties: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl InMemoryFlowContext {
    pub fn new(tenant_domain: impl Into<String>) -> Self {
        Self {
            context_id: new_context_id(),
            tenant_domain: tenant_domain.into(),
            current_step: first_step(),
            identity_provider: None,
            requested_acr: Vec::new(),
            steps: BTreeMap::new(),
            properties: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.context_id = id.into();
        self
    }

    pub fn with_current_step(mut self, step: u32) -> Self {
        self.current_step = step;
        self
    }

    pub fn with_identity_provider(mut self, idp: impl Into<String>) -> Self {
        self.identity_provider = Some(idp.into());
        self
    }

    pub fn with_requested_acr<I, S>(mut self, acr: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_acr = acr.into_iter().map(Into::into).collect();
        self
    }

    /// Record a completed step.
    pub fn with_step(mut self, step: u32, idp: impl Into<String>, user: AuthenticatedUser) -> Self {
        self.steps.insert(
            step,
            StepResult {
                idp: idp.into(),
                user,
            },
        );
        self
    }

    pub fn into_shared(self) -> SharedContext {
        Arc::new(self)
    }

    /// Property slots; a poisoned lock is recovered rather than ignored.
    fn properties(&self) -> MutexGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.properties.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(
                event = "context.properties.poisoned",
                context_id = %self.context_id,
                "recovering property slots after a panicked writer"
            );
            PoisonError::into_inner(poisoned)
        })
    }
}

impl FlowExecutionContext for InMemoryFlowContext {
    fn context_id(&self) -> &str {
        &self.context_id
    }

    fn tenant_domain(&self) -> &str {
        &self.tenant_domain
    }

    fn current_step(&self) -> u32 {
        self.current_step
    }

    fn identity_provider(&self) -> Option<String> {
        self.identity_provider.clone()
    }

    fn step_identity_provider(&self, step: u32) -> Option<String> {
        self.steps.get(&step).map(|result| result.idp.clone())
    }

    fn completed_steps(&self) -> Vec<u32> {
        self.steps.keys().copied().collect()
    }

    fn requested_acr(&self) -> Vec<String> {
        self.requested_acr.clone()
    }

    fn authenticated_user(&self, step: Option<u32>) -> Option<AuthenticatedUser> {
        match step {
            Some(step) => self.steps.get(&step).map(|result| result.user.clone()),
            None => self
                .steps
                .values()
                .next_back()
                .map(|result| result.user.clone()),
        }
    }

    fn property(&self, key: &str) -> Option<serde_json::Value> {
        self.properties().get(key).cloned()
    }

    fn set_property(&self, key: &str, value: serde_json::Value) {
        self.properties().insert(key.to_string(), value);
    }

    fn remove_property(&self, key: &str) -> Option<serde_json::Value> {
        self.properties().remove(key)
    }
}
