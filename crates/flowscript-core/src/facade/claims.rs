//! Claim-set facade, keyed by claim URI.
//!
//! Nothing is read from the context until a claim is looked up, so a script
//! that never touches claims never pays for them.

use crate::context::{describe_step, ClaimDialect, SharedContext};
use crate::error::AccessorFailure;
use crate::filter::type_ids;
use crate::log::SharedLog;
use crate::value::Value;

use super::{FacadeRef, HostFacade};

pub struct ClaimsFacade {
    context: SharedContext,
    log: SharedLog,
    step: Option<u32>,
    /// When set with a step, claims resolve only if that step went through this IdP.
    idp: Option<String>,
    dialect: ClaimDialect,
}

impl ClaimsFacade {
    pub fn new(
        context: SharedContext,
        log: SharedLog,
        step: Option<u32>,
        dialect: ClaimDialect,
    ) -> Self {
        Self {
            context,
            log,
            step,
            idp: None,
            dialect,
        }
    }

    pub fn with_idp(mut self, idp: Option<String>) -> Self {
        self.idp = idp;
        self
    }

    fn scope(&self) -> String {
        match (self.step, &self.idp) {
            (Some(step), Some(idp)) => format!("step {step} via {idp}"),
            (step, _) => describe_step(step),
        }
    }

    fn lookup(&self, uri: &str) -> Result<Option<String>, AccessorFailure> {
        if let (Some(step), Some(idp)) = (self.step, &self.idp) {
            if self.context.step_identity_provider(step).as_deref() != Some(idp.as_str()) {
                return Err(AccessorFailure::NoAuthenticatedUser {
                    selector: self.scope(),
                });
            }
        }
        self.context.claim(self.step, self.dialect, uri)
    }
}

impl HostFacade for ClaimsFacade {
    fn type_id(&self) -> &'static str {
        type_ids::CLAIMS
    }

    fn context_id(&self) -> &str {
        self.context.context_id()
    }

    fn selector(&self) -> String {
        format!("{} claims of {}", self.dialect, self.scope())
    }

    fn get_member(&self, name: &str) -> Value {
        match self.lookup(name) {
            Ok(value) => Value::from(value),
            Err(failure) => {
                self.log.warn(
                    "facade",
                    &format!("{}[{name}] could not be read: {failure}", type_ids::CLAIMS),
                );
                Value::absent()
            }
        }
    }

    fn member_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn rebind(&self, context: SharedContext) -> FacadeRef {
        FacadeRef::new(
            Self::new(context, self.log.clone(), self.step, self.dialect).with_idp(self.idp.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::{AuthenticatedUser, InMemoryFlowContext};
    use crate::log::RecordingLog;

    #[test]
    fn test_lookup_by_uri() {
        let mut user = AuthenticatedUser::new("alice", "carbon.super");
        user.local_claims.insert(
            "http://wso2.org/claims/country".into(),
            "Sri Lanka".into(),
        );
        let ctx = InMemoryFlowContext::new("carbon.super")
            .with_step(1, "LOCAL", user)
            .into_shared();
        let log = Arc::new(RecordingLog::new());
        let claims = ClaimsFacade::new(ctx, log.clone(), None, ClaimDialect::Local);

        assert_eq!(
            claims.get_member("http://wso2.org/claims/country"),
            Value::text("Sri Lanka")
        );
        assert!(claims.get_member("http://wso2.org/claims/unknown").is_absent());
        assert_eq!(log.warning_count(), 0);
        assert_eq!(claims.selector(), "local claims of last authenticated user");
    }

    #[test]
    fn test_no_user_is_absent_and_logged() {
        let ctx = InMemoryFlowContext::new("carbon.super").into_shared();
        let log = Arc::new(RecordingLog::new());
        let claims = ClaimsFacade::new(ctx, log.clone(), Some(2), ClaimDialect::Remote);
        assert!(claims.get_member("email").is_absent());
        assert_eq!(log.warning_count(), 1);
    }

    #[test]
    fn test_runtime_claims_scoped_to_step_idp() {
        let mut user = AuthenticatedUser::new("alice", "carbon.super");
        user.runtime_claims
            .insert("http://wso2.org/claims/risk".into(), "low".into());
        let ctx = InMemoryFlowContext::new("carbon.super")
            .with_step(1, "Google", user)
            .into_shared();
        let log = Arc::new(RecordingLog::new());

        let matching = ClaimsFacade::new(ctx.clone(), log.clone(), Some(1), ClaimDialect::Runtime)
            .with_idp(Some("Google".into()));
        assert_eq!(
            matching.get_member("http://wso2.org/claims/risk"),
            Value::text("low")
        );
        assert_eq!(matching.selector(), "runtime claims of step 1 via Google");
        assert_eq!(log.warning_count(), 0);

        let other = ClaimsFacade::new(ctx, log.clone(), Some(1), ClaimDialect::Runtime)
            .with_idp(Some("Facebook".into()));
        assert!(other.get_member("http://wso2.org/claims/risk").is_absent());
        assert_eq!(log.warning_count(), 1);
        assert!(log.entries()[0].message.contains("step 1 via Facebook"));
    }
}
