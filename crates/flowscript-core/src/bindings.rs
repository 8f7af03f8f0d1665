//! Capability bindings registry: the fixed host functions every environment sees.
//!
//! Entries are defined once, before the sandbox template is built, and are
//! immutable afterwards. No entry may depend on which flow is running; flow
//! data only reaches a host function through its arguments.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{SandboxError, SandboxResult};
use crate::filter::type_ids;
use crate::log::ScriptLog;
use crate::value::Value;

/// Name of the static logging module scripts call as `Log::info(..)`.
pub const LOG_MODULE: &str = "Log";

/// Name of the step-selection helper.
pub const SELECT_ACR_FROM: &str = "selectAcrFrom";

/// Signature of a host helper. Errors become script runtime errors.
pub type HostFn = Arc<dyn Fn(&[Value], &dyn ScriptLog) -> Result<Value, String> + Send + Sync>;

/// One host function exposed to scripts under a stable name.
#[derive(Clone)]
pub struct HostFunction {
    pub name: String,
    pub arity: usize,
    pub func: HostFn,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, arity: usize, func: F) -> Self
    where
        F: Fn(&[Value], &dyn ScriptLog) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// The fixed set of host bindings injected into every environment.
#[derive(Debug, Clone, Default)]
pub struct BindingsRegistry {
    functions: Vec<HostFunction>,
    log_module: bool,
}

impl BindingsRegistry {
    /// No bindings at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The `Log` module plus `selectAcrFrom`.
    pub fn standard() -> Self {
        Self {
            functions: vec![select_acr_from()],
            log_module: true,
        }
    }

    /// Add a host function (builder pattern).
    ///
    /// Fails on a blank name, a name already registered, or the log module's name.
    pub fn with_function(mut self, function: HostFunction) -> SandboxResult<Self> {
        let name = function.name.trim();
        if name.is_empty() {
            return Err(SandboxError::Init("host function with blank name".into()));
        }
        if name == LOG_MODULE || self.functions.iter().any(|f| f.name == function.name) {
            return Err(SandboxError::Init(format!(
                "host binding '{}' registered twice",
                function.name
            )));
        }
        self.functions.push(function);
        Ok(self)
    }

    pub fn with_log_module(mut self) -> Self {
        self.log_module = true;
        self
    }

    pub fn functions(&self) -> &[HostFunction] {
        &self.functions
    }

    pub fn has_log_module(&self) -> bool {
        self.log_module
    }

    /// Every name this registry injects.
    pub fn names(&self) -> BTreeSet<&str> {
        let mut names: BTreeSet<&str> = self.functions.iter().map(|f| f.name.as_str()).collect();
        if self.log_module {
            names.insert(LOG_MODULE);
        }
        names
    }
}

/// `selectAcrFrom(context, outcomes)`: the first ACR requested by the flow,
/// in request order, that is also one of `outcomes`; unit when none match.
pub fn select_acr_from() -> HostFunction {
    HostFunction::new(SELECT_ACR_FROM, 2, |args, log| {
        let context = args
            .first()
            .and_then(Value::as_facade)
            .filter(|facade| facade.type_id() == type_ids::FLOW_CONTEXT)
            .ok_or_else(|| format!("{SELECT_ACR_FROM} expects the flow context as first argument"))?;
        let outcomes = match args.get(1) {
            Some(Value::Sequence(items)) => items,
            _ => return Err(format!("{SELECT_ACR_FROM} expects an array of outcomes")),
        };

        let requested = match context.get_member("requestedAcr") {
            Value::Sequence(items) => items,
            _ => Vec::new(),
        };
        for acr in requested.iter().filter_map(Value::as_str) {
            if outcomes.iter().any(|outcome| outcome.as_str() == Some(acr)) {
                log.debug("bindings", &format!("{SELECT_ACR_FROM} selected {acr}"));
                return Ok(Value::text(acr));
            }
        }
        Ok(Value::absent())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryFlowContext;
    use crate::facade::{FacadeRef, FlowFacade, UserFacade};
    use crate::log::RecordingLog;

    fn flow(acr: &[&str]) -> (Value, Arc<RecordingLog>) {
        let log = Arc::new(RecordingLog::new());
        let ctx = InMemoryFlowContext::new("carbon.super")
            .with_requested_acr(acr.iter().copied())
            .into_shared();
        (
            Value::Facade(FacadeRef::new(FlowFacade::new(ctx, log.clone()))),
            log,
        )
    }

    fn outcomes(values: &[&str]) -> Value {
        Value::Sequence(values.iter().map(|v| Value::from(*v)).collect())
    }

    #[test]
    fn test_standard_registry_names() {
        let registry = BindingsRegistry::standard();
        let names: Vec<&str> = registry.names().into_iter().collect();
        assert_eq!(names, vec![LOG_MODULE, SELECT_ACR_FROM]);
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let err = BindingsRegistry::standard()
            .with_function(select_acr_from())
            .unwrap_err();
        assert!(matches!(err, SandboxError::Init(_)));

        let err = BindingsRegistry::empty()
            .with_function(HostFunction::new(LOG_MODULE, 0, |_, _| Ok(Value::absent())))
            .unwrap_err();
        assert!(matches!(err, SandboxError::Init(_)));
    }

    #[test]
    fn test_select_acr_follows_request_order() {
        let f = select_acr_from();
        let (ctx, log) = flow(&["acr3", "acr2", "acr1"]);
        let picked = (f.func)(&[ctx, outcomes(&["acr1", "acr2"])], log.as_ref()).unwrap();
        assert_eq!(picked, Value::text("acr2"));
    }

    #[test]
    fn test_select_acr_none_matching_is_absent() {
        let f = select_acr_from();
        let (ctx, log) = flow(&["acr9"]);
        let picked = (f.func)(&[ctx, outcomes(&["acr1"])], log.as_ref()).unwrap();
        assert!(picked.is_absent());
    }

    #[test]
    fn test_select_acr_rejects_non_context_argument() {
        let f = select_acr_from();
        let log = Arc::new(RecordingLog::new());
        let ctx = InMemoryFlowContext::new("t").into_shared();
        let user = Value::Facade(FacadeRef::new(UserFacade::new(ctx, log.clone())));
        assert!((f.func)(&[user, outcomes(&["a"])], log.as_ref()).is_err());
        assert!((f.func)(&[Value::from(1i64)], log.as_ref()).is_err());
    }
}
