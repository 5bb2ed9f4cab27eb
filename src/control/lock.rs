//! Control lock state

use crate::api::ControlStatus;

/// Last known state of the server's keyboard lock
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlLock {
    owner: Option<i64>,
    owner_name: Option<String>,
    /// Unix time (seconds) the current owner took the lock
    acquired_at: Option<f64>,
    password_required: bool,
    password_verified: bool,
}

impl ControlLock {
    pub fn owner(&self) -> Option<i64> {
        self.owner
    }

    pub fn owner_name(&self) -> Option<&str> {
        self.owner_name.as_deref()
    }

    pub fn acquired_at(&self) -> Option<f64> {
        self.acquired_at
    }

    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    /// Whether the lock belongs to `session_id`
    pub fn is_owned_by(&self, session_id: Option<i64>) -> bool {
        matches!((self.owner, session_id), (Some(owner), Some(id)) if owner == id)
    }

    /// Ownership check that falls back to the display name while our
    /// session id is still unknown
    pub fn is_held_by(&self, session_id: Option<i64>, name: Option<&str>) -> bool {
        if self.owner.is_none() {
            return false;
        }
        match session_id {
            Some(_) => self.is_owned_by(session_id),
            None => matches!((self.owner_name.as_deref(), name), (Some(a), Some(b)) if a == b),
        }
    }

    pub fn password_required(&self) -> bool {
        self.password_required
    }

    /// Whether acquiring must be preceded by `/control/auth`
    pub fn needs_password(&self) -> bool {
        self.password_required && !self.password_verified
    }

    /// Take the server's view, returns whether the owner changed
    pub fn apply(&mut self, status: &ControlStatus) -> bool {
        let changed = self.set_owner(status.owner, status.owner_name.clone());
        self.acquired_at = status.timestamp;
        self.password_required = status.password_required;
        // No password configured means nothing to verify
        self.password_verified = !status.password_required || status.password_ok;
        changed
    }

    /// Record a new owner, keeping the password flags
    pub(crate) fn set_owner(&mut self, owner: Option<i64>, owner_name: Option<String>) -> bool {
        let owner_name = owner.and(owner_name);
        let changed = self.owner != owner || self.owner_name != owner_name;
        if self.owner != owner {
            self.acquired_at = None;
        }
        self.owner = owner;
        self.owner_name = owner_name;
        changed
    }

    pub(crate) fn set_password_verified(&mut self, verified: bool) {
        self.password_verified = verified;
    }

    /// "Control: Bob" / "Control: free"
    pub fn describe(&self) -> String {
        match (self.owner, self.owner_name.as_deref()) {
            (None, _) => "Control: free".to_string(),
            (Some(_), Some(name)) if !name.is_empty() => format!("Control: {}", name),
            (Some(owner), _) => format!("Control: {}", owner),
        }
    }
}
