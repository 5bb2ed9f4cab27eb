//! Join requests
//!
//! Every room change goes through [`JoinRequester::join`]. The requester
//! sets the suppression window before the request so the reconciler stays
//! quiet while it is in flight, applies a confirmed result to the session,
//! and leaves local room state alone on any failure.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{Backend, JoinReply};
use crate::config::{ConfigStore, TimingConfig};
use crate::error::AppError;
use crate::events::{ClientEvent, EventBus, Severity, UpdateSource};
use crate::rooms::{pretty_room_name, LOBBY};
use crate::session::SessionHandle;

/// How a join is performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinOptions {
    /// Background join: no room messages, shorter suppression
    pub silent: bool,
    /// Override the suppression window set before the request
    pub suppress: Option<Duration>,
}

impl JoinOptions {
    pub fn user() -> Self {
        Self::default()
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            suppress: None,
        }
    }
}

/// Why a join did not happen
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinFailure {
    /// No display name set, nothing was sent
    #[error("Set your name before joining a room")]
    NoName,

    #[error("{room} is full ({members}/{capacity})")]
    RoomFull {
        room: String,
        members: u32,
        capacity: u32,
    },

    #[error("Unable to reach server: {0}")]
    Network(String),

    #[error("{message}")]
    ServerError {
        code: Option<String>,
        message: String,
    },
}

impl JoinFailure {
    /// Stable failure code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoName => "no_name",
            Self::RoomFull { .. } => "room_full",
            Self::Network(_) => "network",
            Self::ServerError { .. } => "server_error",
        }
    }
}

impl From<AppError> for JoinFailure {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Network(msg) => Self::Network(msg),
            AppError::Rejected { code, message } => Self::ServerError {
                code: Some(code),
                message,
            },
            other => Self::ServerError {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

/// Result of a join the server accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Applied; `room` is where the server put us
    Joined { room: String, requested: String },
    /// A newer join was issued while this one was in flight; nothing applied
    Superseded,
}

pub struct JoinRequester {
    backend: Arc<dyn Backend>,
    session: SessionHandle,
    events: Arc<EventBus>,
    store: Option<ConfigStore>,
    timing: TimingConfig,
    delay_ms: AtomicI64,
}

impl JoinRequester {
    pub fn new(
        backend: Arc<dyn Backend>,
        session: SessionHandle,
        events: Arc<EventBus>,
        timing: TimingConfig,
        delay_ms: i64,
    ) -> Self {
        Self {
            backend,
            session,
            events,
            store: None,
            timing,
            delay_ms: AtomicI64::new(delay_ms),
        }
    }

    /// Persist the session after every confirmed join
    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Player delay sent with each join
    pub fn set_delay_ms(&self, delay_ms: i64) {
        self.delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    pub fn delay_ms(&self) -> i64 {
        self.delay_ms.load(Ordering::Relaxed)
    }

    /// Ask the server to move us to `room`
    pub async fn join(&self, room: &str, options: JoinOptions) -> Result<JoinOutcome, JoinFailure> {
        let requested = if room.is_empty() { LOBBY } else { room };
        let window = options.suppress.unwrap_or_else(|| {
            Duration::from_millis(if options.silent {
                self.timing.silent_join_suppress_ms
            } else {
                self.timing.join_suppress_ms
            })
        });

        let started = self.session.write(|s| {
            let name = s.name()?.to_string();
            s.suppress(Instant::now(), window);
            Some((name, s.begin_join()))
        });
        let Some((name, generation)) = started else {
            if !options.silent {
                self.events
                    .message(Severity::Warn, "Set your name before joining a room.");
            }
            return Err(JoinFailure::NoName);
        };

        if !options.silent {
            info!("Attempting to join {} as {}", requested, name);
        }

        let reply = self
            .backend
            .join(requested, &name, self.delay_ms())
            .await
            .map_err(JoinFailure::from);

        let failure = match reply {
            Ok(JoinReply::Joined {
                room: server_room,
                name: server_name,
                rooms,
                capacity,
            }) => {
                return self
                    .apply_joined(generation, requested, server_room, server_name, rooms, capacity, options)
                    .await;
            }
            Ok(JoinReply::Full {
                room,
                members,
                capacity,
            }) => JoinFailure::RoomFull {
                room,
                members,
                capacity,
            },
            Ok(JoinReply::Rejected { code, message }) => JoinFailure::ServerError { code, message },
            Err(failure) => failure,
        };

        if options.silent {
            debug!("Silent join to {} failed: {}", requested, failure);
        } else {
            let text = match &failure {
                JoinFailure::RoomFull {
                    room,
                    members,
                    capacity,
                } => format!("{} is full ({}/{}).", pretty_room_name(room), members, capacity),
                other => other.to_string(),
            };
            warn!("Join to {} failed: {}", requested, text);
            self.events.message(Severity::Warn, text);
        }
        Err(failure)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_joined(
        &self,
        generation: u64,
        requested: &str,
        server_room: String,
        server_name: Option<String>,
        rooms: Option<crate::rooms::RoomSnapshot>,
        capacity: Option<crate::rooms::CapacityMap>,
        options: JoinOptions,
    ) -> Result<JoinOutcome, JoinFailure> {
        let confirm = Duration::from_millis(self.timing.confirm_suppress_ms);
        let applied = self.session.write(|s| {
            if !s.is_latest_join(generation) {
                return None;
            }
            match rooms {
                Some(rooms) => {
                    s.apply_snapshot(rooms, capacity.as_ref());
                }
                None => {
                    if let Some(capacity) = &capacity {
                        s.merge_capacity(capacity);
                    }
                }
            }
            if let Some(name) = &server_name {
                s.adopt_server_name(name);
            }
            let previous = s.current_room().to_string();
            s.remember_current_room(&server_room);
            s.set_last_server_room(Some(server_room.clone()));
            s.suppress(Instant::now(), confirm);
            Some((
                previous,
                s.rooms().clone(),
                s.rooms().count(&server_room),
                s.capacity().limit(&server_room),
                s.persisted(),
            ))
        });

        let Some((previous, snapshot, count, limit, persisted)) = applied else {
            debug!("Dropping superseded join response for {}", requested);
            return Ok(JoinOutcome::Superseded);
        };

        if previous != server_room {
            self.events.publish(ClientEvent::CurrentRoomChanged {
                from: previous,
                to: server_room.clone(),
            });
        }
        self.events.publish(ClientEvent::RoomsUpdated {
            source: UpdateSource::Request,
            rooms: snapshot,
        });

        if options.silent {
            debug!("Silently joined {}", server_room);
        } else {
            info!("Joined {} (requested {})", server_room, requested);
            let text = if server_room == LOBBY {
                "Joined Lobby.".to_string()
            } else {
                format!("Joined {} ({}/{}).", pretty_room_name(&server_room), count, limit)
            };
            self.events.message(Severity::Ok, text);
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.save_session(&persisted).await {
                warn!("Failed to persist session: {}", e);
            }
        }

        Ok(JoinOutcome::Joined {
            room: server_room,
            requested: requested.to_string(),
        })
    }
}
