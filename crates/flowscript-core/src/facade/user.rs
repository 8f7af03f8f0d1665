//! Authenticated-user facades.
//!
//! Gives scripts `user.username` style access without handing them the
//! orchestrator's user record, and keeps them from writing to it.

use crate::context::{describe_step, AuthenticatedUser, ClaimDialect, SharedContext};
use crate::error::AccessorFailure;
use crate::filter::type_ids;
use crate::log::SharedLog;
use crate::value::Value;

use super::claims::ClaimsFacade;
use super::table::{Member, MemberTable};
use super::{FacadeRef, HostFacade};

/// What a user facade points at inside its context.
pub struct UserTarget {
    context: SharedContext,
    log: SharedLog,
    /// `None` selects the last authenticated user.
    step: Option<u32>,
    idp: Option<String>,
}

impl UserTarget {
    fn user(&self) -> Result<AuthenticatedUser, AccessorFailure> {
        self.context
            .authenticated_user(self.step)
            .ok_or_else(|| AccessorFailure::NoAuthenticatedUser {
                selector: describe_step(self.step),
            })
    }

    fn claims(&self, dialect: ClaimDialect) -> Value {
        let claims = ClaimsFacade::new(self.context.clone(), self.log.clone(), self.step, dialect)
            .with_idp(self.idp.clone());
        Value::Facade(FacadeRef::new(claims))
    }
}

fn username(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::text(t.user()?.username))
}

fn subject_identifier(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::from(t.user()?.subject_identifier))
}

fn user_id(t: &UserTarget) -> Result<Value, AccessorFailure> {
    let user = t.user()?;
    Ok(Value::text(user.user_id()?))
}

fn user_store_domain(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::from(t.user()?.user_store_domain))
}

fn tenant_domain(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::text(t.user()?.tenant_domain))
}

fn local_roles(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::from(t.user()?.roles))
}

fn local_claims(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(t.claims(ClaimDialect::Local))
}

fn remote_claims(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(t.claims(ClaimDialect::Remote))
}

fn runtime_claims(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(t.claims(ClaimDialect::Runtime))
}

fn step(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(t.step.map(Value::from).unwrap_or_else(Value::absent))
}

fn idp(t: &UserTarget) -> Result<Value, AccessorFailure> {
    Ok(Value::from(t.idp.clone()))
}

/// Step-independent user.
pub static USER_MEMBERS: MemberTable<UserTarget> = MemberTable {
    type_id: type_ids::USER,
    members: &[
        Member { name: "username", get: username },
        Member { name: "authenticatedSubjectIdentifier", get: subject_identifier },
        Member { name: "userId", get: user_id },
        Member { name: "userStoreDomain", get: user_store_domain },
        Member { name: "tenantDomain", get: tenant_domain },
        Member { name: "localRoles", get: local_roles },
        Member { name: "localClaims", get: local_claims },
        Member { name: "remoteClaims", get: remote_claims },
        Member { name: "claims", get: runtime_claims },
    ],
    parent: None,
};

/// User as authenticated in one step; everything else delegates to [`USER_MEMBERS`].
pub static STEP_USER_MEMBERS: MemberTable<UserTarget> = MemberTable {
    type_id: type_ids::STEP_USER,
    members: &[Member { name: "step", get: step }, Member { name: "idp", get: idp }],
    parent: Some(&USER_MEMBERS),
};

/// Facade over an [`AuthenticatedUser`] held by the flow context.
pub struct UserFacade {
    target: UserTarget,
    table: &'static MemberTable<UserTarget>,
}

impl UserFacade {
    /// The last authenticated user of the flow.
    pub fn new(context: SharedContext, log: SharedLog) -> Self {
        Self {
            target: UserTarget {
                context,
                log,
                step: None,
                idp: None,
            },
            table: &USER_MEMBERS,
        }
    }

    /// The user authenticated by `idp` in `step`.
    pub fn for_step(context: SharedContext, log: SharedLog, step: u32, idp: Option<String>) -> Self {
        Self {
            target: UserTarget {
                context,
                log,
                step: Some(step),
                idp,
            },
            table: &STEP_USER_MEMBERS,
        }
    }
}

impl HostFacade for UserFacade {
    fn type_id(&self) -> &'static str {
        self.table.type_id
    }

    fn context_id(&self) -> &str {
        self.target.context.context_id()
    }

    fn selector(&self) -> String {
        match (&self.target.step, &self.target.idp) {
            (Some(step), Some(idp)) => format!("step {step} via {idp}"),
            (step, _) => describe_step(*step),
        }
    }

    fn get_member(&self, name: &str) -> Value {
        self.table
            .resolve(&self.target, name, self.target.log.as_ref())
    }

    fn member_names(&self) -> Vec<&'static str> {
        self.table.names()
    }

    fn rebind(&self, context: SharedContext) -> FacadeRef {
        FacadeRef::new(Self {
            target: UserTarget {
                context,
                log: self.target.log.clone(),
                step: self.target.step,
                idp: self.target.idp.clone(),
            },
            table: self.table,
        })
    }
}
