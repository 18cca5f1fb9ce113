//! Role- and resource-based authorization.
//!
//! Roles map to fixed permission sets through [`Role::permissions`]; the
//! administrator set includes the instructor set, which includes the student
//! set. Resource checks then narrow what a permitted action may touch.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::LabError;
use crate::roster::{ClassroomRole, Roster, RosterError};
use crate::session::{Role, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Provision,
    Terminate,
    ListOwn,
    ListAll,
    Subscribe,
    Reconcile,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Provision => "provision",
            Self::Terminate => "terminate",
            Self::ListOwn => "listOwn",
            Self::ListAll => "listAll",
            Self::Subscribe => "subscribe",
            Self::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

const STUDENT: &[Action] = &[Action::Provision, Action::Terminate, Action::ListOwn, Action::Subscribe];

const INSTRUCTOR: &[Action] = &[
    Action::Provision,
    Action::Terminate,
    Action::ListOwn,
    Action::Subscribe,
    Action::ListAll,
];

const ADMINISTRATOR: &[Action] = &[
    Action::Provision,
    Action::Terminate,
    Action::ListOwn,
    Action::Subscribe,
    Action::ListAll,
    Action::Reconcile,
];

impl Role {
    pub fn permissions(self) -> &'static [Action] {
        match self {
            Role::Student => STUDENT,
            Role::Instructor => INSTRUCTOR,
            Role::Administrator => ADMINISTRATOR,
        }
    }

    pub fn permits(self, action: Action) -> bool {
        self.permissions().contains(&action)
    }
}

/// What an action is aimed at.
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    /// A user's own resources, e.g. their lab list or event stream.
    User(&'a str),
    Classroom(&'a str),
    Instance { owner: &'a str, classroom: &'a str },
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Clone)]
pub struct AuthGate {
    roster: Arc<dyn Roster>,
}

impl AuthGate {
    pub fn new(roster: Arc<dyn Roster>) -> Self {
        Self { roster }
    }

    pub async fn authorize(&self, session: &Session, action: Action, resource: Resource<'_>) -> Decision {
        if !session.role.permits(action) {
            return Decision::Denied(format!("role {} may not {}", session.role, action));
        }
        if session.role == Role::Administrator {
            return Decision::Allowed;
        }

        let me = session.user_id.as_str();
        let decision = match (action, resource) {
            (Action::ListOwn | Action::Subscribe, Resource::User(user)) if user == me => Decision::Allowed,
            (Action::Provision, Resource::Classroom(classroom)) => match self.member_role(me, classroom).await {
                Some(_) => Decision::Allowed,
                None => Decision::Denied(format!("not a member of {classroom}")),
            },
            (Action::Terminate, Resource::Instance { owner, .. }) if owner == me => Decision::Allowed,
            (Action::Terminate, Resource::Instance { classroom, .. })
            | (Action::ListAll | Action::Subscribe, Resource::Classroom(classroom)) => {
                self.require_instructor(session, classroom).await
            }
            (action, _) => Decision::Denied(format!("{action} does not apply to this resource")),
        };

        if let Decision::Denied(reason) = &decision {
            debug!(user = %me, %action, %reason, "Authorization denied");
        }
        decision
    }

    /// Like [`authorize`](Self::authorize) but turns a denial into `Forbidden`.
    pub async fn require(&self, session: &Session, action: Action, resource: Resource<'_>) -> Result<(), LabError> {
        match self.authorize(session, action, resource).await {
            Decision::Allowed => Ok(()),
            Decision::Denied(reason) => Err(LabError::Forbidden(reason)),
        }
    }

    async fn require_instructor(&self, session: &Session, classroom: &str) -> Decision {
        if session.role != Role::Instructor {
            return Decision::Denied(format!("only instructors of {classroom} may do this"));
        }
        match self.member_role(&session.user_id, classroom).await {
            Some(ClassroomRole::Instructor) => Decision::Allowed,
            _ => Decision::Denied(format!("not an instructor of {classroom}")),
        }
    }

    /// Roster failures are treated as "not a member".
    async fn member_role(&self, user: &str, classroom: &str) -> Option<ClassroomRole> {
        match self.roster.membership(user, classroom).await {
            Ok(membership) => Some(membership.role),
            Err(RosterError::NotFound { .. }) => None,
            Err(err) => {
                warn!(%user, %classroom, error = %err, "Roster lookup failed, denying");
                None
            }
        }
    }
}
