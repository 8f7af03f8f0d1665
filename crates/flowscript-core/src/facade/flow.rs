//! Flow-level facade: what a decision script sees as `context`.

use std::collections::BTreeMap;

use crate::context::SharedContext;
use crate::error::AccessorFailure;
use crate::filter::type_ids;
use crate::log::SharedLog;
use crate::value::Value;

use super::table::{Member, MemberTable};
use super::user::UserFacade;
use super::{FacadeRef, HostFacade};

pub struct FlowTarget {
    context: SharedContext,
    log: SharedLog,
}

fn tenant_domain(t: &FlowTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::text(t.context.tenant_domain()))
}

fn current_step(t: &FlowTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::from(t.context.current_step()))
}

fn identity_provider(t: &FlowTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::from(t.context.identity_provider()))
}

fn requested_acr(t: &FlowTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::from(t.context.requested_acr()))
}

fn last_authenticated_user(t: &FlowTarget) -> Result<Value, AccessorFailure> {
    if t.context.authenticated_user(None).is_none() {
        return Ok(Value::absent());
    }
    Ok(Value::Facade(FacadeRef::new(UserFacade::new(
        t.context.clone(),
        t.log.clone(),
    ))))
}

fn current_step_user(t: &FlowTarget) -> Result<Value, AccessorFailure> {
    let step = t.context.current_step();
    if t.context.authenticated_user(Some(step)).is_none() {
        return Ok(Value::absent());
    }
    Ok(Value::Facade(FacadeRef::new(UserFacade::for_step(
        t.context.clone(),
        t.log.clone(),
        step,
        t.context.step_identity_provider(step),
    ))))
}

fn steps(t: &FlowTarget) -> Result<Value, AccessorFailure> {
    let steps: BTreeMap<String, Value> = t
        .context
        .completed_steps()
        .into_iter()
        .map(|step| {
            let facade = UserFacade::for_step(
                t.context.clone(),
                t.log.clone(),
                step,
                t.context.step_identity_provider(step),
            );
            (step.to_string(), Value::Facade(FacadeRef::new(facade)))
        })
        .collect();
    Ok(Value::Mapping(steps))
}

pub static FLOW_MEMBERS: MemberTable<FlowTarget> = MemberTable {
    type_id: type_ids::FLOW_CONTEXT,
    members: &[
        Member { name: "tenantDomain", get: tenant_domain },
        Member { name: "currentStep", get: current_step },
        Member { name: "identityProvider", get: identity_provider },
        Member { name: "requestedAcr", get: requested_acr },
        Member { name: "lastAuthenticatedUser", get: last_authenticated_user },
        Member { name: "currentStepUser", get: current_step_user },
        Member { name: "steps", get: steps },
    ],
    parent: None,
};

/// Read-only view of the whole flow context.
pub struct FlowFacade {
    target: FlowTarget,
}

impl FlowFacade {
    pub fn new(context: SharedContext, log: SharedLog) -> Self {
        Self {
            target: FlowTarget { context, log },
        }
    }
}

impl HostFacade for FlowFacade {
    fn type_id(&self) -> &'static str {
        FLOW_MEMBERS.type_id
    }

    fn context_id(&self) -> &str {
        self.target.context.context_id()
    }

    fn selector(&self) -> String {
        "flow".to_string()
    }

    fn get_member(&self, name: &str) -> Value {
        FLOW_MEMBERS.resolve(&self.target, name, self.target.log.as_ref())
    }

    fn member_names(&self) -> Vec<&'static str> {
        FLOW_MEMBERS.names()
    }

    fn rebind(&self, context: SharedContext) -> FacadeRef {
        FacadeRef::new(Self::new(context, self.target.log.clone()))
    }
}
