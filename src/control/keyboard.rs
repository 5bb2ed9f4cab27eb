//! Shared keyboard relay
//!
//! Keys go to the server one request at a time. [`KeystrokeSync`] mirrors a
//! local text field onto the remote keyboard by sending the smallest edit
//! it can express with typing and backspaces.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::Backend;
use crate::error::{AppError, Result};
use crate::session::SessionHandle;

/// Named keys the server maps to real key presses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKey {
    Escape,
    Enter,
    Backspace,
    Space,
    ArrowLeft,
    ArrowRight,
    ArrowUp,
    ArrowDown,
}

impl SpecialKey {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Escape" | "Esc" => Some(Self::Escape),
            "Enter" | "Return" => Some(Self::Enter),
            "Backspace" => Some(Self::Backspace),
            "Space" => Some(Self::Space),
            "ArrowLeft" => Some(Self::ArrowLeft),
            "ArrowRight" => Some(Self::ArrowRight),
            "ArrowUp" => Some(Self::ArrowUp),
            "ArrowDown" => Some(Self::ArrowDown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Escape => "Escape",
            Self::Enter => "Enter",
            Self::Backspace => "Backspace",
            Self::Space => "Space",
            Self::ArrowLeft => "ArrowLeft",
            Self::ArrowRight => "ArrowRight",
            Self::ArrowUp => "ArrowUp",
            Self::ArrowDown => "ArrowDown",
        }
    }
}

/// One key accepted by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keystroke {
    Char(char),
    Special(SpecialKey),
}

impl FromStr for Keystroke {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            return Ok(Self::Char(c));
        }
        SpecialKey::parse(s)
            .map(Self::Special)
            .ok_or_else(|| AppError::BadRequest(format!("Unsupported key: {:?}", s)))
    }
}

impl fmt::Display for Keystroke {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Char(c) => write!(f, "{}", c),
            Self::Special(key) => f.write_str(key.as_str()),
        }
    }
}

/// Smallest edit turning one text into another
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextDiff {
    None,
    /// Type these characters
    Append(String),
    /// Press backspace this many times
    Truncate(usize),
    /// Clear everything and retype
    Replace,
}

/// Classify the edit from `prev` to `next`
pub fn classify_diff(prev: &str, next: &str) -> TextDiff {
    if prev == next {
        TextDiff::None
    } else if let Some(tail) = next.strip_prefix(prev) {
        TextDiff::Append(tail.to_string())
    } else if prev.starts_with(next) {
        TextDiff::Truncate(prev.chars().count() - next.chars().count())
    } else {
        TextDiff::Replace
    }
}

/// Mirrors a local text value onto the remote keyboard
///
/// Holds the "shadow" value the remote side is believed to contain. Syncs
/// run one at a time; a failed sync leaves the shadow untouched so the next
/// call retries the whole edit.
pub struct KeystrokeSync {
    backend: Arc<dyn Backend>,
    session: SessionHandle,
    shadow: Mutex<String>,
}

impl KeystrokeSync {
    pub fn new(backend: Arc<dyn Backend>, session: SessionHandle) -> Self {
        Self {
            backend,
            session,
            shadow: Mutex::new(String::new()),
        }
    }

    fn require_control(&self) -> Result<()> {
        if self.session.read(|s| s.has_control()) {
            Ok(())
        } else {
            Err(AppError::ControlRequired(
                "Acquire control before typing".to_string(),
            ))
        }
    }

    /// Send a single key
    pub async fn send_key(&self, key: Keystroke) -> Result<()> {
        self.require_control()?;
        self.backend.send_keystroke(&key.to_string()).await
    }

    /// Text the remote side is believed to contain
    pub async fn shadow(&self) -> String {
        self.shadow.lock().await.clone()
    }

    /// Adopt `value` as the remote text without sending anything
    ///
    /// Used while we do not hold the lock: whatever is typed locally then
    /// is not ours to replay later.
    pub async fn observe(&self, value: &str) {
        *self.shadow.lock().await = value.to_string();
    }

    /// Bring the remote text to `target`
    pub async fn sync_to(&self, target: &str) -> Result<TextDiff> {
        self.require_control()?;

        let mut shadow = self.shadow.lock().await;
        let diff = classify_diff(&shadow, target);
        debug!("Keyboard sync {:?}", diff);

        let result = match &diff {
            TextDiff::None => Ok(()),
            TextDiff::Append(text) => self.type_text(text).await,
            TextDiff::Truncate(count) => self.backspaces(*count).await,
            TextDiff::Replace => {
                let clear = shadow.chars().count();
                match self.backspaces(clear).await {
                    Ok(()) => self.type_text(target).await,
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = result {
            warn!("Control sync failed: {}", e);
            return Err(e);
        }
        *shadow = target.to_string();
        Ok(diff)
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        for c in text.chars() {
            self.backend
                .send_keystroke(&Keystroke::Char(c).to_string())
                .await?;
        }
        Ok(())
    }

    async fn backspaces(&self, count: usize) -> Result<()> {
        let key = Keystroke::Special(SpecialKey::Backspace).to_string();
        for _ in 0..count {
            self.backend.send_keystroke(&key).await?;
        }
        Ok(())
    }
}
