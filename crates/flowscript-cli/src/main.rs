//! Flowscript CLI
//!
//! The `flowscript` command runs decision scripts against a flow context
//! described in JSON, the way the authentication service would between two
//! requests.
//!
//! ## Commands
//!
//! - `eval`: Evaluate a script, optionally resuming from and persisting state
//! - `policy`: Show which host types a configuration allows
//! - `inspect-state`: Verify a persisted state envelope and list its bindings

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowscript_core::{
    BindingsRegistry, FlowExecutionContext, InMemoryFlowContext, SandboxConfig, SandboxTemplate,
    SerializedValue, StateEnvelope, TracingLog, Value, ANONYMOUS_PREFIX,
};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "flowscript")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed decision scripts for authentication flows", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Sandbox configuration file (TOML)
    #[arg(short, long, global = true, env = "FLOWSCRIPT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a script against a flow context
    Eval {
        /// Script file
        script: PathBuf,

        /// Flow context fixture (JSON)
        #[arg(long)]
        context: PathBuf,

        /// Call this function with the flow context after evaluating the script
        #[arg(long)]
        call: Option<String>,

        /// Resume from a persisted state envelope
        #[arg(long)]
        state_in: Option<PathBuf>,

        /// Persist the resulting state envelope here
        #[arg(long)]
        state_out: Option<PathBuf>,
    },

    /// Show whether host types are allowed by the configured policy
    Policy {
        /// Type identifiers to check (lists the allow-list when empty)
        type_ids: Vec<String>,
    },

    /// Verify a persisted state envelope and list its bindings
    InspectState {
        /// State envelope file (JSON)
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    flowscript_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Eval {
            script,
            context,
            call,
            state_in,
            state_out,
        } => cmd_eval(
            config,
            &script,
            &context,
            call.as_deref(),
            state_in.as_deref(),
            state_out.as_deref(),
        ),
        Commands::Policy { type_ids } => cmd_policy(&config, &type_ids),
        Commands::InspectState { path } => cmd_inspect_state(&path),
    }
}

fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    match path {
        Some(path) => SandboxConfig::load(path)
            .with_context(|| format!("Failed to load sandbox config {:?}", path)),
        None => Ok(SandboxConfig::default()),
    }
}

fn cmd_eval(
    config: SandboxConfig,
    script_path: &Path,
    context_path: &Path,
    call: Option<&str>,
    state_in: Option<&Path>,
    state_out: Option<&Path>,
) -> Result<()> {
    let script = std::fs::read_to_string(script_path)
        .with_context(|| format!("Failed to read script {:?}", script_path))?;
    let fixture = std::fs::read_to_string(context_path)
        .with_context(|| format!("Failed to read context {:?}", context_path))?;
    let context = InMemoryFlowContext::from_json(&fixture)
        .with_context(|| format!("Invalid context fixture {:?}", context_path))?
        .into_shared();

    let state_property = config.state_property.clone();
    if let Some(path) = state_in {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state {:?}", path))?;
        let envelope: serde_json::Value =
            serde_json::from_str(&raw).with_context(|| format!("Invalid state file {:?}", path))?;
        context.set_property(&state_property, envelope);
    }

    let template = SandboxTemplate::with_config(config, BindingsRegistry::standard(), Arc::new(TracingLog))
        .context("Failed to build sandbox template")?;
    let mut environment = template
        .resume(context.clone())
        .context("Failed to resume flow state")?;

    let mut result = environment.eval(&script).context("Script evaluation failed")?;
    if let Some(name) = call {
        result = environment
            .call_with_context(name, Vec::new())
            .with_context(|| format!("Call to '{}' failed", name))?;
    }
    println!("{}", result);
    print_if_facade(&result);

    if let Some(path) = state_out {
        environment
            .persist_into_context()
            .context("Failed to capture flow state")?;
        let envelope = context
            .property(&state_property)
            .context("Captured state missing from context")?;
        std::fs::write(path, serde_json::to_string_pretty(&envelope)?)
            .with_context(|| format!("Failed to write state to {:?}", path))?;
        info!(event = "cli.state.written", path = %path.display());
    }

    Ok(())
}

fn print_if_facade(value: &Value) {
    if let Value::Facade(facade) = value {
        for name in facade.member_names() {
            println!("  {}: {}", name, facade.get_member(name));
        }
    }
}

fn cmd_policy(config: &SandboxConfig, type_ids: &[String]) -> Result<()> {
    let policy = &config.capabilities;
    if type_ids.is_empty() {
        println!("Allowed host types ({}):", policy.len());
        for id in policy.iter() {
            println!("  {}", id);
        }
        return Ok(());
    }
    for id in type_ids {
        let verdict = if policy.is_allowed(id) { "allow" } else { "deny" };
        println!("{:<6} {}", verdict, id);
    }
    Ok(())
}

fn cmd_inspect_state(path: &Path) -> Result<()> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read state {:?}", path))?;
    let envelope: StateEnvelope =
        serde_json::from_str(&raw).with_context(|| format!("Invalid state envelope {:?}", path))?;

    println!("Dialect:     {}", envelope.dialect);
    println!("Captured at: {}", envelope.captured_at.to_rfc3339());
    println!("Digest:      {}", envelope.digest);

    let bindings = envelope.open().context("State envelope failed verification")?;
    println!("Bindings ({}):", bindings.len());
    for (name, entry) in bindings.entries() {
        let constant = if entry.constant { " (const)" } else { "" };
        println!("  {:<20} {}{}", name, describe(&entry.value), constant);
    }
    Ok(())
}

fn describe(value: &SerializedValue) -> String {
    match value {
        SerializedValue::Scalar { value } => {
            serde_json::to_string(value).unwrap_or_else(|_| "?".to_string())
        }
        SerializedValue::Char { value } => format!("'{}'", value),
        SerializedValue::NonFinite { value } => value.clone(),
        SerializedValue::Sequence { items } => format!("sequence[{}]", items.len()),
        SerializedValue::Mapping { entries } => format!("mapping{{{}}}", entries.len()),
        SerializedValue::Closure { name, source, .. } if name.starts_with(ANONYMOUS_PREFIX) => {
            source.clone()
        }
        SerializedValue::Closure { name, .. } => format!("fn {}", name),
    }
}
