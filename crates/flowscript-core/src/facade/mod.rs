//! Domain object facades: read-only, lazily computed, named-property views of
//! host entities.
//!
//! Each variant resolves names through a static [`MemberTable`] with an
//! explicit parent chain; there is no reflective member access. Nested
//! facades (claim sets, step users) are constructed on first access only.
//!
//! # Variants
//!
//! - [`FlowFacade`]: `flow.context`
//! - [`UserFacade`]: `identity.user` and `identity.step_user`
//! - [`ClaimsFacade`]: `identity.claims`, keyed by claim URI

pub mod claims;
pub mod flow;
pub mod table;
pub mod user;

use std::fmt;
use std::sync::Arc;

use crate::context::SharedContext;
use crate::value::Value;

pub use claims::ClaimsFacade;
pub use flow::FlowFacade;
pub use table::{Accessor, Member, MemberTable};
pub use user::UserFacade;

/// Behaviour shared by every facade variant.
pub trait HostFacade: Send + Sync {
    /// Capability-filter identifier of this variant.
    fn type_id(&self) -> &'static str;

    /// Identifier of the flow context this facade reads from.
    fn context_id(&self) -> &str;

    /// Which entity inside the context is wrapped (`"step 1 via LOCAL"`, ...).
    fn selector(&self) -> String;

    /// Named property lookup. Unknown names and failed accessors yield
    /// [`Value::absent`]; side effects are limited to logging.
    fn get_member(&self, name: &str) -> Value;

    /// Statically known member names. Keyed variants return an empty list.
    fn member_names(&self) -> Vec<&'static str>;

    /// A fresh facade of the same variant and selector bound to `context`.
    fn rebind(&self, context: SharedContext) -> FacadeRef;
}

/// Cheap, clonable handle to a facade. This is what scripts hold.
#[derive(Clone)]
pub struct FacadeRef(Arc<dyn HostFacade>);

impl FacadeRef {
    pub fn new<F: HostFacade + 'static>(facade: F) -> Self {
        Self(Arc::new(facade))
    }

    pub fn type_id(&self) -> &'static str {
        self.0.type_id()
    }

    pub fn context_id(&self) -> &str {
        self.0.context_id()
    }

    pub fn selector(&self) -> String {
        self.0.selector()
    }

    pub fn get_member(&self, name: &str) -> Value {
        self.0.get_member(name)
    }

    pub fn member_names(&self) -> Vec<&'static str> {
        self.0.member_names()
    }

    pub fn rebind(&self, context: SharedContext) -> FacadeRef {
        self.0.rebind(context)
    }

    /// Whether this facade reads from the context identified by `context_id`.
    pub fn is_bound_to(&self, context_id: &str) -> bool {
        self.0.context_id() == context_id
    }
}

impl PartialEq for FacadeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.type_id() == other.type_id()
                && self.context_id() == other.context_id()
                && self.selector() == other.selector())
    }
}

impl fmt::Debug for FacadeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacadeRef")
            .field("type_id", &self.type_id())
            .field("context_id", &self.context_id())
            .field("selector", &self.selector())
            .finish()
    }
}

impl fmt::Display for FacadeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} @ {}>", self.type_id(), self.context_id())
    }
}
