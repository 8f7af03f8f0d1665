//! Flowscript Core Library
//!
//! Embedded scripting sandbox for multi-step authentication flows: a
//! capability-filtered engine template, read-only facades over the flow
//! context, fixed host bindings and a codec that carries environment state
//! across request boundaries.

pub mod bindings;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod facade;
pub mod filter;
pub mod log;
pub mod sandbox;
pub mod telemetry;
pub mod value;

pub use bindings::{select_acr_from, BindingsRegistry, HostFn, HostFunction, LOG_MODULE, SELECT_ACR_FROM};
pub use codec::{
    digest_of, SerializedBinding, SerializedEntry, SerializedValue, StateCodec, StateEnvelope,
};
pub use config::{SandboxConfig, DEFAULT_STATE_PROPERTY};
pub use context::{
    AuthenticatedUser, ClaimDialect, FlowExecutionContext, InMemoryFlowContext, SharedContext,
    StepResult,
};
pub use error::{AccessorFailure, RestoreError, SandboxError, SandboxResult};
pub use facade::{ClaimsFacade, FacadeRef, FlowFacade, HostFacade, UserFacade};
pub use filter::{is_forbidden, type_ids, CapabilityPolicy, FORBIDDEN_NAMESPACES};
pub use log::{LogEntry, LogLevel, RecordingLog, ScriptLog, SharedLog, TracingLog};
pub use sandbox::{Environment, SandboxTemplate, DIALECT};
pub use value::{Closure, Scalar, Value, ANONYMOUS_PREFIX};
