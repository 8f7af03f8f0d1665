//! End-to-end flow scenarios: evaluate, persist, resume on another request.

use std::sync::Arc;

use flowscript_core::{
    AuthenticatedUser, BindingsRegistry, CapabilityPolicy, FlowExecutionContext,
    InMemoryFlowContext, RecordingLog, RestoreError, SandboxError, SandboxTemplate,
    SerializedBinding, SerializedValue, SharedContext, Value, DEFAULT_STATE_PROPERTY,
};

fn template() -> (SandboxTemplate, Arc<RecordingLog>) {
    let log = Arc::new(RecordingLog::new());
    let template = SandboxTemplate::init(
        CapabilityPolicy::facade_defaults(),
        BindingsRegistry::standard(),
        log.clone(),
    )
    .expect("template builds");
    (template, log)
}

fn alice_context(id: &str) -> SharedContext {
    InMemoryFlowContext::new("carbon.super")
        .with_id(id)
        .with_step(1, "LOCAL", AuthenticatedUser::new("alice", "carbon.super"))
        .into_shared()
}

/// Move the persisted envelope from one request's context to the next.
fn hand_over(from: &SharedContext, to: &SharedContext) {
    let blob = from
        .property(DEFAULT_STATE_PROPERTY)
        .expect("state was persisted");
    // Through text, as the orchestrator's session store would.
    let text = serde_json::to_string(&blob).unwrap();
    to.set_property(DEFAULT_STATE_PROPERTY, serde_json::from_str(&text).unwrap());
}

#[test]
fn test_closure_and_scalar_survive_request_boundary() {
    let (template, _) = template();
    let first = alice_context("request-1");
    let mut env = template.create_environment(first.clone());
    env.eval(r#"let x = 5; fn greet(n) { return "hi " + n; }"#)
        .unwrap();
    env.persist_into_context().unwrap();
    drop(env);

    let second = alice_context("request-2");
    hand_over(&first, &second);
    let mut resumed = template.resume(second).unwrap();

    assert_eq!(resumed.context_id(), "request-2");
    assert_eq!(resumed.get("x"), Some(Value::from(5i64)));
    assert_eq!(
        resumed.call("greet", vec![Value::from("a")]).unwrap(),
        Value::text("hi a")
    );
    assert_eq!(resumed.eval("greet(\"b\")").unwrap(), Value::text("hi b"));
}

#[test]
fn test_function_pointer_binding_survives() {
    let (template, _) = template();
    let first = alice_context("request-1");
    let mut env = template.create_environment(first.clone());
    env.eval(r#"fn shout(s) { s.to_upper() } let handler = Fn("shout");"#)
        .unwrap();
    env.persist_into_context().unwrap();

    let second = alice_context("request-2");
    hand_over(&first, &second);
    let mut resumed = template.resume(second).unwrap();
    assert_eq!(
        resumed.eval(r#"handler.call("quiet")"#).unwrap(),
        Value::text("QUIET")
    );
}

#[test]
fn test_facade_binding_is_not_carried_over() {
    let (template, log) = template();
    let first = alice_context("request-1");
    let mut env = template.create_environment(first.clone());
    env.set("ctx", Value::Facade(env.context_facade())).unwrap();
    env.eval("let u = ctx.lastAuthenticatedUser; let name = u.username;")
        .unwrap();
    assert!(matches!(env.get("u"), Some(Value::Facade(_))));

    env.persist_into_context().unwrap();
    assert!(log
        .entries()
        .iter()
        .any(|e| e.source == "codec" && e.message.contains("'u'")));

    let second = alice_context("request-2");
    hand_over(&first, &second);
    let mut resumed = template.resume(second.clone()).unwrap();

    assert!(resumed.get("u").is_none());
    assert_eq!(resumed.get("name"), Some(Value::text("alice")));

    // Rebuilt from the new context, not carried.
    resumed
        .eval("let u = 0;")
        .expect("slot is free to reuse");
    let fresh = resumed.context_facade();
    assert!(fresh.is_bound_to(second.context_id()));
}

#[test]
fn test_failing_accessor_yields_absent_and_one_warning() {
    let (template, log) = template();
    let mut env = template.create_environment(alice_context("request-1"));
    env.set("ctx", Value::Facade(env.context_facade())).unwrap();
    log.clear();

    let out = env
        .eval(
            r#"
            let id = ctx.lastAuthenticatedUser.userId;
            let after = "still running";
            id == ()
            "#,
        )
        .unwrap();

    assert_eq!(out, Value::from(true));
    assert_eq!(env.get("after"), Some(Value::text("still running")));
    assert_eq!(log.warning_count(), 1);
}

#[test]
fn test_corrupt_closure_source_is_fatal() {
    let (template, _) = template();
    let mut blob = SerializedBinding::new();
    blob.insert(
        "greet",
        SerializedValue::closure("greet", "fn greet(n) { return \"hi \" + ; }"),
    );

    let err = template
        .restore_environment(alice_context("request-2"), &blob)
        .err()
        .expect("restore must fail");
    assert!(err.is_flow_fatal());
    assert!(matches!(
        err,
        SandboxError::Restore(RestoreError::Compile { .. })
    ));
}

#[test]
fn test_closure_source_with_statements_is_refused() {
    let (template, _) = template();
    let mut blob = SerializedBinding::new();
    blob.insert(
        "greet",
        SerializedValue::closure("greet", "fn greet(n) { n } print(\"side effect\");"),
    );
    let err = template
        .restore_environment(alice_context("request-2"), &blob)
        .err()
        .expect("restore must fail");
    assert!(matches!(
        err,
        SandboxError::Restore(RestoreError::UnexpectedContent { .. })
    ));
}

#[test]
fn test_closure_marker_without_function_is_missing() {
    let (template, _) = template();
    let mut blob = SerializedBinding::new();
    blob.insert(
        "greet",
        SerializedValue::closure("greet", "// nothing here"),
    );
    let err = template
        .restore_environment(alice_context("request-2"), &blob)
        .err()
        .expect("restore must fail");
    assert!(matches!(
        err,
        SandboxError::Restore(RestoreError::MissingFunction { .. })
    ));
}

#[test]
fn test_tampered_envelope_is_refused() {
    let (template, _) = template();
    let first = alice_context("request-1");
    let mut env = template.create_environment(first.clone());
    env.eval("let level = 1;").unwrap();
    env.persist_into_context().unwrap();

    let mut blob = first.property(DEFAULT_STATE_PROPERTY).unwrap();
    blob["bindings"]["level"]["value"] = serde_json::json!(3);
    let second = alice_context("request-2");
    second.set_property(DEFAULT_STATE_PROPERTY, blob);

    let err = template.resume(second).err().expect("resume must fail");
    assert!(matches!(
        err,
        SandboxError::Restore(RestoreError::DigestMismatch { .. })
    ));
}

#[test]
fn test_foreign_dialect_is_refused() {
    let (template, _) = template();
    let first = alice_context("request-1");
    let mut env = template.create_environment(first.clone());
    env.eval("let level = 1;").unwrap();
    env.persist_into_context().unwrap();

    let mut blob = first.property(DEFAULT_STATE_PROPERTY).unwrap();
    blob["dialect"] = serde_json::json!("rhai/0");
    let second = alice_context("request-2");
    second.set_property(DEFAULT_STATE_PROPERTY, blob);

    let err = template.resume(second).err().expect("resume must fail");
    assert!(matches!(
        err,
        SandboxError::Restore(RestoreError::DialectMismatch { .. })
    ));
}

#[test]
fn test_garbage_state_is_malformed() {
    let (template, _) = template();
    let ctx = alice_context("request-2");
    ctx.set_property(DEFAULT_STATE_PROPERTY, serde_json::json!("not an envelope"));
    let err = template.resume(ctx).err().expect("resume must fail");
    assert!(matches!(
        err,
        SandboxError::Restore(RestoreError::Malformed(_))
    ));
}

#[test]
fn test_resume_without_state_is_fresh() {
    let (template, _) = template();
    let env = template.resume(alice_context("request-1")).unwrap();
    assert!(env.bindings().is_empty());
}

#[test]
fn test_step_selection_script() {
    let (template, _) = template();
    let ctx = InMemoryFlowContext::new("carbon.super")
        .with_requested_acr(["acr3", "acr1"])
        .into_shared();
    let mut env = template.create_environment(ctx);
    env.eval(
        r#"
        fn onLoginRequest(context) {
            let level = selectAcrFrom(context, ["acr1", "acr2", "acr3"]);
            Log::info("selected " + level);
            level
        }
        "#,
    )
    .unwrap();
    assert_eq!(
        env.call_with_context("onLoginRequest", vec![]).unwrap(),
        Value::text("acr3")
    );
}
