//! Control lock sync
//!
//! The server arbitrates one lock over its shared keyboard. [`ControlClient`]
//! keeps the session's [`ControlLock`] in step with the server and performs
//! the acquire / release / password calls. None of them retry: a failure is
//! logged, returned, and the last known state stays in place.

mod keyboard;
mod lock;

pub use keyboard::{classify_diff, KeystrokeSync, Keystroke, SpecialKey, TextDiff};
pub use lock::ControlLock;

use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{Backend, ControlStatus};
use crate::error::{AppError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::session::SessionHandle;

pub struct ControlClient {
    backend: Arc<dyn Backend>,
    session: SessionHandle,
    events: Arc<EventBus>,
    password: Option<String>,
}

impl ControlClient {
    pub fn new(
        backend: Arc<dyn Backend>,
        session: SessionHandle,
        events: Arc<EventBus>,
        password: Option<String>,
    ) -> Self {
        Self {
            backend,
            session,
            events,
            password,
        }
    }

    pub fn has_control(&self) -> bool {
        self.session.read(|s| s.has_control())
    }

    /// Current lock state
    pub fn lock(&self) -> ControlLock {
        self.session.read(|s| s.control().clone())
    }

    /// Merge a lock status from `/status` or `/control/status`
    pub fn apply_status(&self, status: &ControlStatus) {
        let (changed, owner_name, mine) = self.session.write(|s| {
            let changed = s.control_mut().apply(status);
            (changed, s.control().owner_name().map(str::to_string), s.has_control())
        });
        if changed {
            self.events
                .publish(ClientEvent::ControlChanged { owner_name, mine });
        }
    }

    /// Poll `/control/status`
    pub async fn refresh(&self) -> Result<ControlLock> {
        match self.backend.control_status().await {
            Ok(status) => {
                self.apply_status(&status);
                Ok(self.lock())
            }
            Err(e) => {
                warn!("Failed to fetch control status: {}", e);
                Err(e)
            }
        }
    }

    /// Verify the configured password if the server asks for one
    pub async fn ensure_password(&self) -> Result<()> {
        if !self.session.read(|s| s.control().needs_password()) {
            return Ok(());
        }
        let password = self.password.as_deref().ok_or_else(|| {
            AppError::ControlRequired("The control password is required".to_string())
        })?;

        let result = self.backend.authenticate_control(password).await;
        let verified = result.is_ok();
        self.session
            .write(|s| s.control_mut().set_password_verified(verified));
        if let Err(e) = &result {
            warn!("Control password rejected: {}", e);
        }
        result
    }

    /// Take the control lock
    pub async fn acquire(&self) -> Result<()> {
        let name = self
            .session
            .read(|s| s.name().map(str::to_string))
            .ok_or_else(|| AppError::BadRequest("Set a display name first".to_string()))?;

        self.ensure_password().await?;

        let status = match self.backend.acquire_control(&name).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Failed to acquire control: {}", e);
                return Err(e);
            }
        };

        let (changed, owner_name, mine) = self.session.write(|s| {
            // The lock is granted to our session, so its owner id is ours
            s.set_session_id(status.owner);
            let changed = s
                .control_mut()
                .set_owner(status.owner, status.owner_name.clone());
            (changed, s.control().owner_name().map(str::to_string), s.has_control())
        });
        if changed {
            self.events
                .publish(ClientEvent::ControlChanged { owner_name, mine });
        }
        info!("Acquired control as {}", name);
        Ok(())
    }

    /// Give the control lock back
    pub async fn release(&self) -> Result<()> {
        if let Err(e) = self.backend.release_control().await {
            warn!("Failed to release control: {}", e);
            return Err(e);
        }

        let changed = self.session.write(|s| s.control_mut().set_owner(None, None));
        if changed {
            self.events.publish(ClientEvent::ControlChanged {
                owner_name: None,
                mine: false,
            });
        }
        info!("Released control");
        Ok(())
    }

    /// Release the lock only if we hold it
    pub async fn release_if_held(&self) -> Result<()> {
        if self.has_control() {
            self.release().await
        } else {
            Ok(())
        }
    }
}
