//! Restriction on dropping a protected database.

use crate::statement::StatementKind;

/// Which database is protected and who alone may drop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardPolicy {
    pub protected_database: String,
    pub privileged_user: String,
}

/// True when `current_user` may not run a statement of this kind.
pub fn is_restricted(kind: &StatementKind, current_user: &str, policy: &GuardPolicy) -> bool {
    match kind {
        StatementKind::DropDatabase(target) => {
            target == &policy.protected_database && current_user != policy.privileged_user
        }
        _ => false,
    }
}
