//! A per-flow execution environment.

use std::collections::BTreeMap;

use rhai::{Dynamic, EvalAltResult, FnPtr, Scope, AST};
use tracing::debug;

use crate::codec::{SerializedBinding, StateCodec, StateEnvelope};
use crate::context::SharedContext;
use crate::error::{RestoreError, SandboxError, SandboxResult};
use crate::facade::FacadeRef;
use crate::value::{Closure, Value, ANONYMOUS_PREFIX};

use super::convert::{self, to_dynamic_with, to_value};
use super::source::{self, ClosureText, Scan};
use super::template::{check_facades, denied_type, SandboxTemplate};

#[derive(Debug, Clone)]
struct Definition {
    params: Vec<String>,
    source: String,
}

/// Binding state to return to when a multi-binding restore fails.
struct Checkpoint {
    scope: Scope<'static>,
    library: AST,
    definitions: BTreeMap<String, BTreeMap<usize, Definition>>,
    anonymous: BTreeMap<String, Definition>,
}

fn eval_error(err: Box<EvalAltResult>) -> SandboxError {
    match denied_type(&err) {
        Some(type_id) => SandboxError::CapabilityDenied { type_id },
        None => SandboxError::Script(err.to_string()),
    }
}

/// Mutable binding state of one authentication flow, bound to exactly one
/// flow context. Not shared between threads; the template is.
pub struct Environment<'t> {
    template: &'t SandboxTemplate,
    context: SharedContext,
    scope: Scope<'static>,
    library: AST,
    /// Script functions by name, then arity.
    definitions: BTreeMap<String, BTreeMap<usize, Definition>>,
    /// Closure literals by engine-generated name.
    anonymous: BTreeMap<String, Definition>,
}

impl<'t> Environment<'t> {
    pub(crate) fn new(template: &'t SandboxTemplate, context: SharedContext) -> Self {
        Self {
            template,
            context,
            scope: Scope::new(),
            library: AST::empty(),
            definitions: BTreeMap::new(),
            anonymous: BTreeMap::new(),
        }
    }

    pub fn template(&self) -> &'t SandboxTemplate {
        self.template
    }

    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    pub fn context_id(&self) -> &str {
        self.context.context_id()
    }

    /// Evaluate script text. Top-level variables and named functions it
    /// defines stay bound in this environment.
    pub fn eval(&mut self, script: &str) -> SandboxResult<Value> {
        let engine = self.template.engine();
        let ast = engine
            .compile(script)
            .map_err(|e| SandboxError::Script(e.to_string()))?;
        let merged = self.library.merge(&ast);
        let result = engine
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &merged)
            .map_err(eval_error)?;

        self.library = merged.clone_functions_only();
        self.record_definitions(&ast, &source::scan(script), script);
        Ok(self.to_host(&result))
    }

    /// Call a named script function.
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> SandboxResult<Value> {
        let args = args
            .into_iter()
            .map(|arg| self.to_engine(arg))
            .collect::<SandboxResult<Vec<Dynamic>>>()?;
        let result = self
            .template
            .engine()
            .call_fn::<Dynamic>(&mut self.scope, &self.library, name, args)
            .map_err(eval_error)?;
        Ok(self.to_host(&result))
    }

    /// Call a decision function with this environment's flow facade as its
    /// first argument, followed by `args`.
    pub fn call_with_context(&mut self, name: &str, args: Vec<Value>) -> SandboxResult<Value> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Value::Facade(self.context_facade()));
        full.extend(args);
        self.call(name, full)
    }

    /// Read a binding: a variable, or else a named function.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.scope.get_value::<Dynamic>(name) {
            return Some(self.to_host(&value));
        }
        self.closure(name).map(Value::Closure)
    }

    /// Bind `name`. A closure bound under its own function name with nothing
    /// captured only defines the function; anything else becomes a variable.
    pub fn set(&mut self, name: &str, value: Value) -> SandboxResult<()> {
        self.check_writable(name)?;
        if let Value::Closure(closure) = &value {
            if closure.name == name && closure.captured.is_empty() {
                self.define_closure(&closure.name, &closure.source)?;
                return Ok(());
            }
        }
        let dynamic = self.to_engine(value)?;
        self.scope.set_or_push(name, dynamic);
        Ok(())
    }

    /// Bind `name` as a constant; scripts cannot reassign it.
    pub fn set_constant(&mut self, name: &str, value: Value) -> SandboxResult<()> {
        self.check_writable(name)?;
        let dynamic = self.to_engine(value)?;
        self.scope.push_constant_dynamic(name.to_string(), dynamic);
        Ok(())
    }

    /// Bind every `(name, value, constant)` entry, or none of them: on error
    /// the environment is returned to its state before the call.
    pub fn bind_all(&mut self, entries: Vec<(String, Value, bool)>) -> SandboxResult<()> {
        let checkpoint = self.checkpoint();
        for (name, value, constant) in entries {
            let bound = if constant {
                self.set_constant(&name, value)
            } else {
                self.set(&name, value)
            };
            if let Err(err) = bound {
                self.rollback(checkpoint);
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scope.contains(name) || self.definitions.contains_key(name)
    }

    pub fn is_constant(&self, name: &str) -> bool {
        self.scope.is_constant(name) == Some(true)
    }

    /// Every live binding. A variable shadows a function of the same name.
    pub fn bindings(&self) -> BTreeMap<String, Value> {
        let closures = self.closures();
        let variables: BTreeMap<String, Value> = self
            .scope
            .iter()
            .map(|(name, _constant, value)| (name.to_string(), to_value(&value, &closures)))
            .collect();
        let mut bindings: BTreeMap<String, Value> = self
            .definitions
            .keys()
            .filter_map(|name| Some((name.clone(), Value::Closure(self.closure(name)?))))
            .collect();
        for (name, value) in variables {
            if bindings.contains_key(&name) {
                self.template.log().warn(
                    "sandbox",
                    &format!("variable '{name}' shadows function '{name}'; the function is not kept"),
                );
            }
            bindings.insert(name, value);
        }
        bindings
    }

    /// `flow.context` facade for this environment's context.
    pub fn context_facade(&self) -> FacadeRef {
        self.template.flow_facade(self.context.clone())
    }

    /// Snapshot of the persistable bindings.
    pub fn capture(&self) -> SerializedBinding {
        StateCodec::new(self.template.log().clone()).capture(self)
    }

    /// Capture and store the sealed envelope on the flow context.
    pub fn persist_into_context(&self) -> SandboxResult<()> {
        let envelope = StateEnvelope::seal(self.capture())?;
        let key = &self.template.config().state_property;
        self.context.set_property(key, serde_json::to_value(&envelope)?);
        debug!(
            event = "sandbox.state.persisted",
            context_id = %self.context_id(),
            bindings = envelope.bindings.len(),
            digest = %envelope.digest,
        );
        Ok(())
    }

    fn check_writable(&self, name: &str) -> SandboxResult<()> {
        if self.is_constant(name) {
            return Err(SandboxError::Script(format!("cannot overwrite constant '{name}'")));
        }
        Ok(())
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            scope: self.scope.clone(),
            library: self.library.clone(),
            definitions: self.definitions.clone(),
            anonymous: self.anonymous.clone(),
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        self.scope = checkpoint.scope;
        self.library = checkpoint.library;
        self.definitions = checkpoint.definitions;
        self.anonymous = checkpoint.anonymous;
    }

    fn closure(&self, name: &str) -> Option<Closure> {
        let group = self.definitions.get(name)?;
        let params = group.values().next()?.params.clone();
        let source = group
            .values()
            .map(|definition| definition.source.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        Some(Closure {
            params,
            ..Closure::named(name, source)
        })
    }

    /// Named functions and closure literals, for resolving function pointers.
    fn closures(&self) -> BTreeMap<String, Closure> {
        let mut closures: BTreeMap<String, Closure> = self
            .anonymous
            .iter()
            .map(|(name, definition)| {
                let closure = Closure {
                    params: definition.params.clone(),
                    ..Closure::named(name.clone(), definition.source.clone())
                };
                (name.clone(), closure)
            })
            .collect();
        for name in self.definitions.keys() {
            if let Some(closure) = self.closure(name) {
                closures.insert(name.clone(), closure);
            }
        }
        closures
    }

    fn to_host(&self, value: &Dynamic) -> Value {
        to_value(value, &self.closures())
    }

    /// Facades bound to another context are rebound to this one and must
    /// be allow-listed. Closures are compiled into the library on the way.
    fn to_engine(&mut self, value: Value) -> SandboxResult<Dynamic> {
        let value = self.rebind(value);
        check_facades(self.template.policy(), &value).map_err(eval_error)?;
        to_dynamic_with(&value, &mut |closure: &Closure| self.instantiate(closure))
    }

    fn rebind(&self, value: Value) -> Value {
        match value {
            Value::Facade(facade) if !facade.is_bound_to(self.context_id()) => {
                Value::Facade(facade.rebind(self.context.clone()))
            }
            Value::Sequence(items) => {
                Value::Sequence(items.into_iter().map(|item| self.rebind(item)).collect())
            }
            Value::Mapping(entries) => Value::Mapping(
                entries
                    .into_iter()
                    .map(|(key, item)| (key, self.rebind(item)))
                    .collect(),
            ),
            Value::Closure(closure) => Value::Closure(Closure {
                captured: closure
                    .captured
                    .into_iter()
                    .map(|item| self.rebind(item))
                    .collect(),
                ..closure
            }),
            other => other,
        }
    }

    /// Engine value for `closure`: a function pointer with its captured
    /// values curried in, its function compiled into the library if missing.
    fn instantiate(&mut self, closure: &Closure) -> SandboxResult<Dynamic> {
        let captured = closure
            .captured
            .iter()
            .map(|item| self.to_engine(item.clone()))
            .collect::<SandboxResult<Vec<Dynamic>>>()?;
        if closure.is_anonymous() {
            return Ok(self.define_anonymous(&closure.name, &closure.source, captured)?);
        }
        let known = self
            .closure(&closure.name)
            .is_some_and(|existing| existing.source == closure.source);
        if !known {
            self.define_closure(&closure.name, &closure.source)?;
        }
        convert::pointer(&closure.name, captured).map_err(eval_error)
    }

    /// Compile captured function source and add it to the library. The source
    /// must consist of definitions of `name` and nothing else.
    pub(crate) fn define_closure(&mut self, name: &str, source_text: &str) -> Result<(), RestoreError> {
        let ast = self
            .template
            .engine()
            .compile(source_text)
            .map_err(|e| RestoreError::Compile {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let scan = source::scan(source_text);
        if scan.has_statements {
            return Err(RestoreError::UnexpectedContent {
                name: name.to_string(),
                detail: "top-level statements".into(),
            });
        }
        let mut found = false;
        for function in ast.iter_functions() {
            if function.name == name {
                found = true;
            } else if !function.name.starts_with(ANONYMOUS_PREFIX) {
                return Err(RestoreError::UnexpectedContent {
                    name: name.to_string(),
                    detail: format!("also defines '{}'", function.name),
                });
            }
        }
        if !found {
            return Err(RestoreError::MissingFunction {
                name: name.to_string(),
            });
        }

        self.library = self.library.merge(&ast.clone_functions_only());
        self.record_definitions(&ast, &scan, source_text);
        Ok(())
    }

    /// Compile a captured closure literal and return a pointer to it with
    /// `captured` bound to the variables it closes over. `name` is the
    /// literal's name when captured; the engine may name it differently here.
    pub(crate) fn define_anonymous(
        &mut self,
        name: &str,
        source_text: &str,
        captured: Vec<Dynamic>,
    ) -> Result<Dynamic, RestoreError> {
        let unexpected = |detail: String| RestoreError::UnexpectedContent {
            name: name.to_string(),
            detail,
        };
        let scan = source::scan(source_text);
        let literal = scan
            .sole_closure(source_text)
            .ok_or_else(|| unexpected("not a single closure literal".into()))?;
        let engine = self.template.engine();
        let ast = engine
            .compile(source_text)
            .map_err(|e| RestoreError::Compile {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let names = self.anonymous_names(source_text, &scan);
        let outer = names
            .iter()
            .find(|(_, text)| text.start == literal.start)
            .map(|(generated, _)| generated.clone())
            .ok_or_else(|| RestoreError::MissingFunction {
                name: name.to_string(),
            })?;
        let params: Vec<String> = ast
            .iter_functions()
            .find(|function| function.name == outer)
            .map(|function| function.params.iter().map(|p| p.to_string()).collect())
            .ok_or_else(|| RestoreError::MissingFunction {
                name: name.to_string(),
            })?;
        // Closed-over variables come first in the generated function's parameters.
        let externals = &params[..params.len().saturating_sub(literal.params.len())];
        if externals.len() != captured.len() {
            return Err(unexpected(format!(
                "closes over {} variables but {} values were captured",
                externals.len(),
                captured.len()
            )));
        }

        let mut scratch = Scope::new();
        for (external, value) in externals.iter().zip(captured) {
            scratch.push_dynamic(external.as_str(), value);
        }
        let pointer = engine
            .eval_ast_with_scope::<Dynamic>(&mut scratch, &ast)
            .map_err(|e| RestoreError::Compile {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        if !pointer.is::<FnPtr>() {
            return Err(unexpected(format!("evaluates to {}", pointer.type_name())));
        }

        self.library = self.library.merge(&ast.clone_functions_only());
        self.record_anonymous(names);
        Ok(pointer)
    }

    fn record_definitions(&mut self, ast: &AST, scan: &Scan, script: &str) {
        let mut unnamed = 0usize;
        for function in ast.iter_functions() {
            if function.name.starts_with(ANONYMOUS_PREFIX) {
                unnamed += 1;
                continue;
            }
            let arity = function.params.len();
            let Some(text) = scan.find(function.name, arity) else {
                self.template.log().warn(
                    "sandbox",
                    &format!("no source found for function '{}'/{arity}", function.name),
                );
                continue;
            };
            self.definitions
                .entry(function.name.to_string())
                .or_default()
                .insert(
                    arity,
                    Definition {
                        params: function.params.iter().map(|p| p.to_string()).collect(),
                        source: text.text.clone(),
                    },
                );
        }
        if unnamed > 0 {
            let names = self.anonymous_names(script, scan);
            if names.len() < unnamed {
                self.template.log().warn(
                    "sandbox",
                    &format!(
                        "source found for {} of {unnamed} closure literals; the rest are not persisted",
                        names.len()
                    ),
                );
            }
            self.record_anonymous(names);
        }
    }

    fn record_anonymous(&mut self, names: BTreeMap<String, ClosureText>) {
        for (name, text) in names {
            self.anonymous.insert(
                name,
                Definition {
                    params: text.params,
                    source: text.text,
                },
            );
        }
    }

    /// Engine-generated name of each closure literal in `script`.
    ///
    /// Generated names depend on where a literal sits, so each literal is
    /// compiled alone at its original position. Inner literals go first; the
    /// one name an outer literal adds is its own.
    fn anonymous_names(&self, script: &str, scan: &Scan) -> BTreeMap<String, ClosureText> {
        let engine = self.template.engine();
        let mut literals: Vec<&ClosureText> = scan.closures.iter().collect();
        literals.sort_by_key(|literal| literal.end - literal.start);

        let mut names = BTreeMap::new();
        for literal in literals {
            let Ok(ast) = engine.compile(source::isolate(script, literal)) else {
                continue;
            };
            let fresh: Vec<String> = ast
                .iter_functions()
                .filter(|function| {
                    function.name.starts_with(ANONYMOUS_PREFIX) && !names.contains_key(function.name)
                })
                .map(|function| function.name.to_string())
                .collect();
            if let [name] = fresh.as_slice() {
                names.insert(name.clone(), literal.clone());
            }
        }
        names
    }
}
