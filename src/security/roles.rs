use std::collections::BTreeSet;
use std::fmt;

/// Capability level of the sender, derived per request from stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// No own API key bound.
    Guest,
    /// Bound their own API key.
    User,
    /// Borrowing a shared guest key.
    FreeTrial,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::User => "user",
            Self::FreeTrial => "free_trial",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roles held by one sender for the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSet {
    roles: BTreeSet<Role>,
}

impl Default for RoleSet {
    fn default() -> Self {
        Self::guest()
    }
}

impl RoleSet {
    #[must_use]
    pub fn guest() -> Self {
        Self {
            roles: BTreeSet::from([Role::Guest]),
        }
    }

    pub fn insert(&mut self, role: Role) {
        self.roles.insert(role);
    }

    /// Bound key promotes a guest to a user.
    pub fn promote_to_user(&mut self) {
        self.roles.remove(&Role::Guest);
        self.roles.insert(Role::User);
    }

    #[must_use]
    pub fn contains(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// True when any of `required` is held.
    #[must_use]
    pub fn intersects(&self, required: &[Role]) -> bool {
        required.iter().any(|role| self.roles.contains(role))
    }
}

impl fmt::Display for RoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.roles.iter().map(|role| role.as_str()).collect();
        f.write_str(&names.join(","))
    }
}
