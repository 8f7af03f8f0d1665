//! The shared, immutable sandbox template.
//!
//! One template is built at startup and shared by every concurrent flow. It
//! owns the configured engine: packages, resource limits, the capability
//! filter seams and the host bindings. Environments borrow it.

use std::any::TypeId;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rhai::module_resolvers::ModuleResolver;
use rhai::packages::{
    BasicArrayPackage, BasicBlobPackage, BasicMapPackage, BasicMathPackage, BasicTimePackage,
    BitFieldPackage, CorePackage, LogicPackage, MoreStringPackage, Package,
};
use rhai::{
    Array, Dynamic, Engine, EvalAltResult, ImmutableString, Module, NativeCallContext, Position,
    Shared,
};
use tracing::{debug, info};

use crate::bindings::{BindingsRegistry, LOG_MODULE};
use crate::codec::{SerializedBinding, StateCodec, StateEnvelope};
use crate::config::SandboxConfig;
use crate::context::SharedContext;
use crate::error::{RestoreError, SandboxError, SandboxResult};
use crate::facade::flow::FLOW_MEMBERS;
use crate::facade::user::{STEP_USER_MEMBERS, USER_MEMBERS};
use crate::facade::{FacadeRef, FlowFacade};
use crate::filter::{type_ids, CapabilityPolicy};
use crate::log::{LogLevel, SharedLog};
use crate::value::Value;

use super::convert::{to_dynamic, to_value};
use super::environment::Environment;

type SharedModule = Shared<Module>;

/// Engine dialect identifier recorded in persisted state.
pub const DIALECT: &str = "rhai/1";

/// Payload of the non-catchable termination raised when a script reaches a
/// host type outside the allow-list.
#[derive(Debug, Clone)]
pub(crate) struct CapabilityDenial {
    pub(crate) type_id: String,
}

pub(crate) fn denial(type_id: &str, pos: Position) -> Box<EvalAltResult> {
    tracing::warn!(event = "capability.denied", type_id = %type_id);
    Box::new(EvalAltResult::ErrorTerminated(
        Dynamic::from(CapabilityDenial {
            type_id: type_id.to_string(),
        }),
        pos,
    ))
}

/// Recover the denied type from an evaluation error, looking through
/// function-call and module wrappers.
pub(crate) fn denied_type(err: &EvalAltResult) -> Option<String> {
    match err.unwrap_inner() {
        EvalAltResult::ErrorTerminated(token, _) => token
            .clone()
            .try_cast::<CapabilityDenial>()
            .map(|denial| denial.type_id),
        _ => None,
    }
}

/// Every facade reachable inside `value` must be allow-listed.
pub(crate) fn check_facades(policy: &CapabilityPolicy, value: &Value) -> Result<(), Box<EvalAltResult>> {
    match value {
        Value::Facade(facade) if !policy.is_allowed(facade.type_id()) => {
            Err(denial(facade.type_id(), Position::NONE))
        }
        Value::Sequence(items) => items.iter().try_for_each(|item| check_facades(policy, item)),
        Value::Mapping(entries) => entries
            .values()
            .try_for_each(|item| check_facades(policy, item)),
        _ => Ok(()),
    }
}

fn read_member(
    policy: &CapabilityPolicy,
    facade: &FacadeRef,
    name: &str,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let value = facade.get_member(name);
    check_facades(policy, &value)?;
    to_dynamic(&value)
}

/// Resolves `import` paths to modules, consulting the capability filter first.
struct CapabilityModuleResolver {
    policy: Arc<CapabilityPolicy>,
    modules: BTreeMap<String, SharedModule>,
}

impl ModuleResolver for CapabilityModuleResolver {
    fn resolve(
        &self,
        _engine: &Engine,
        _source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<SharedModule, Box<EvalAltResult>> {
        if !self.policy.is_allowed(path) {
            return Err(denial(path, pos));
        }
        self.modules
            .get(path)
            .cloned()
            .ok_or_else(|| Box::new(EvalAltResult::ErrorModuleNotFound(path.to_string(), pos)))
    }
}

/// Immutable, shareable sandbox template.
pub struct SandboxTemplate {
    engine: Engine,
    config: SandboxConfig,
    registry: BindingsRegistry,
    log: SharedLog,
}

impl SandboxTemplate {
    /// Build a template with default limits and the given allow-list.
    pub fn init(
        policy: CapabilityPolicy,
        registry: BindingsRegistry,
        log: SharedLog,
    ) -> SandboxResult<Self> {
        let config = SandboxConfig {
            capabilities: policy,
            ..SandboxConfig::default()
        };
        Self::with_config(config, registry, log)
    }

    /// Build a template from a full configuration.
    pub fn with_config(
        config: SandboxConfig,
        registry: BindingsRegistry,
        log: SharedLog,
    ) -> SandboxResult<Self> {
        config.validate()?;
        let policy = Arc::new(config.capabilities.clone());

        let mut engine = Engine::new_raw();
        for package in [
            CorePackage::new().as_shared_module(),
            LogicPackage::new().as_shared_module(),
            BasicMathPackage::new().as_shared_module(),
            BasicArrayPackage::new().as_shared_module(),
            BasicMapPackage::new().as_shared_module(),
            MoreStringPackage::new().as_shared_module(),
            BitFieldPackage::new().as_shared_module(),
        ] {
            engine.register_global_module(package);
        }

        engine
            .set_max_operations(config.max_operations)
            .set_max_call_levels(config.max_call_levels)
            .set_max_expr_depths(config.max_expr_depth, config.max_function_expr_depth)
            .set_max_string_size(config.max_string_size)
            .set_max_array_size(config.max_array_size)
            .set_max_map_size(config.max_map_size);
        engine.disable_symbol("eval");

        let sink = log.clone();
        engine.on_print(move |text| sink.info("script", text));
        let sink = log.clone();
        engine.on_debug(move |text, _source, pos| sink.debug("script", &format!("{pos}: {text}")));

        register_facade_type(&mut engine, &policy);
        register_bindings(&mut engine, &registry, &policy, &log)?;

        let mut modules = BTreeMap::new();
        if policy.is_allowed(type_ids::LANG_TIME) {
            modules.insert(
                type_ids::LANG_TIME.to_string(),
                BasicTimePackage::new().as_shared_module(),
            );
        }
        if policy.is_allowed(type_ids::LANG_BLOB) {
            modules.insert(
                type_ids::LANG_BLOB.to_string(),
                BasicBlobPackage::new().as_shared_module(),
            );
        }
        engine.set_max_modules(modules.len().max(1));
        engine.set_module_resolver(CapabilityModuleResolver {
            policy: policy.clone(),
            modules,
        });

        info!(
            event = "sandbox.template.ready",
            dialect = DIALECT,
            capabilities = policy.len(),
            bindings = registry.names().len(),
        );
        Ok(Self {
            engine,
            config,
            registry,
            log,
        })
    }

    pub fn policy(&self) -> &CapabilityPolicy {
        &self.config.capabilities
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn registry(&self) -> &BindingsRegistry {
        &self.registry
    }

    pub fn log(&self) -> &SharedLog {
        &self.log
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    /// A fresh environment with no user bindings, tied to `context`.
    pub fn create_environment(&self, context: SharedContext) -> Environment<'_> {
        debug!(event = "sandbox.environment.created", context_id = %context.context_id());
        Environment::new(self, context)
    }

    /// A new environment for `context` holding the captured bindings.
    ///
    /// All or nothing: on error no environment is returned.
    pub fn restore_environment(
        &self,
        context: SharedContext,
        serialized: &SerializedBinding,
    ) -> SandboxResult<Environment<'_>> {
        let mut environment = Environment::new(self, context);
        StateCodec::new(self.log.clone()).restore(serialized, &mut environment)?;
        debug!(
            event = "sandbox.environment.restored",
            context_id = %environment.context_id(),
            bindings = serialized.len(),
        );
        Ok(environment)
    }

    /// The environment for the next request of a flow: restored from the
    /// envelope stored on the context, or fresh when there is none.
    pub fn resume(&self, context: SharedContext) -> SandboxResult<Environment<'_>> {
        let Some(raw) = context.property(&self.config.state_property) else {
            return Ok(self.create_environment(context));
        };
        let envelope: StateEnvelope = serde_json::from_value(raw)
            .map_err(|e| SandboxError::Restore(RestoreError::Malformed(e.to_string())))?;
        let bindings = envelope.open()?;
        self.restore_environment(context, &bindings)
    }

    /// The `flow.context` facade for `context`.
    pub fn flow_facade(&self, context: SharedContext) -> FacadeRef {
        FacadeRef::new(FlowFacade::new(context, self.log.clone()))
    }
}

fn register_facade_type(engine: &mut Engine, policy: &Arc<CapabilityPolicy>) {
    engine.register_type_with_name::<FacadeRef>("Facade");

    let names: BTreeSet<&'static str> = FLOW_MEMBERS
        .names()
        .into_iter()
        .chain(USER_MEMBERS.names())
        .chain(STEP_USER_MEMBERS.names())
        .collect();
    for name in names {
        let policy = policy.clone();
        engine.register_get(name, move |facade: &mut FacadeRef| -> Result<Dynamic, Box<EvalAltResult>> {
            read_member(&policy, facade, name)
        });
    }

    // Keyed variants (claims) and dynamic member names go through the indexer.
    let policy = policy.clone();
    engine.register_indexer_get(
        move |facade: &mut FacadeRef, name: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            read_member(&policy, facade, &name)
        },
    );

    engine.register_fn("to_string", |facade: &mut FacadeRef| facade.to_string());
    engine.register_fn("type_of_facade", |facade: &mut FacadeRef| facade.type_id().to_string());
    engine.register_fn("members", |facade: &mut FacadeRef| -> Array {
        facade
            .member_names()
            .into_iter()
            .map(|name| Dynamic::from(name.to_string()))
            .collect()
    });
}

fn register_bindings(
    engine: &mut Engine,
    registry: &BindingsRegistry,
    policy: &Arc<CapabilityPolicy>,
    log: &SharedLog,
) -> SandboxResult<()> {
    if registry.has_log_module() {
        let mut module = Module::new();
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            let sink = log.clone();
            module.set_native_fn(
                level.to_string(),
                move |message: Dynamic| -> Result<(), Box<EvalAltResult>> {
                    sink.log(level, "script", &message.to_string());
                    Ok(())
                },
            );
        }
        engine.register_static_module(LOG_MODULE, module.into());
    }

    let no_functions = BTreeMap::new();
    for function in registry.functions() {
        if function.name.contains(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
            return Err(SandboxError::Init(format!(
                "host function name '{}' is not a valid identifier",
                function.name
            )));
        }
        let host = function.clone();
        let policy = policy.clone();
        let sink = log.clone();
        let no_functions = no_functions.clone();
        engine.register_raw_fn(
            function.name.as_str(),
            vec![TypeId::of::<Dynamic>(); function.arity],
            move |_ctx: NativeCallContext, args: &mut [&mut Dynamic]| -> Result<Dynamic, Box<EvalAltResult>> {
                let values: Vec<Value> = args.iter().map(|arg| to_value(arg, &no_functions)).collect();
                let result = (host.func)(&values, sink.as_ref())
                    .map_err(|message| -> Box<EvalAltResult> { format!("{}: {message}", host.name).into() })?;
                check_facades(&policy, &result)?;
                to_dynamic(&result)
            },
        );
    }
    Ok(())
}
