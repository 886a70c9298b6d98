//! Local identity collaborator

use parking_lot::RwLock;

/// Name and role this engine announces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub display_name: String,
    pub role: String,
}

impl LocalIdentity {
    pub fn new(display_name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            role: role.into(),
        }
    }
}

/// Supplies the local user's identity.
///
/// `local_identity` is read once when the engine starts. `active_mode` is
/// consulted on every announcement and, when set, replaces the role.
pub trait IdentityProvider: Send + Sync {
    fn local_identity(&self) -> LocalIdentity;

    fn active_mode(&self) -> Option<String> {
        None
    }
}

/// Fixed identity with an adjustable mode override
#[derive(Debug)]
pub struct StaticIdentity {
    identity: LocalIdentity,
    mode: RwLock<Option<String>>,
}

impl StaticIdentity {
    pub fn new(display_name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            identity: LocalIdentity::new(display_name, role),
            mode: RwLock::new(None),
        }
    }

    /// Override (or clear) the announced role
    pub fn set_active_mode(&self, mode: Option<String>) {
        *self.mode.write() = mode;
    }
}

impl IdentityProvider for StaticIdentity {
    fn local_identity(&self) -> LocalIdentity {
        self.identity.clone()
    }

    fn active_mode(&self) -> Option<String> {
        self.mode.read().clone()
    }
}

/// Role to announce: the active mode when set, else the stored role
pub fn effective_role(identity: &LocalIdentity, provider: &dyn IdentityProvider) -> String {
    provider
        .active_mode()
        .filter(|mode| !mode.is_empty())
        .unwrap_or_else(|| identity.role.clone())
}
