//! Backend trait definition

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::types::{
    ClientMetrics, ControlStatus, JoinReply, PlaylistStatus, RoomsUpdate, SongId, SongItem,
    StatusReport, UplAction, UplChange,
};
use crate::error::{AppError, Result};
use crate::rooms::{CapacityMap, RoomSnapshot};

fn unsupported<T>(operation: &str) -> Result<T> {
    Err(AppError::ServiceUnavailable(format!(
        "{} not supported by this backend",
        operation
    )))
}

/// Everything the client needs from the SmartMic server
///
/// [`HttpBackend`](super::HttpBackend) is the real implementation. Only
/// `join` and `status` are required; the rest default to
/// `ServiceUnavailable` so narrow backends (tests, replay tools) stay small.
///
/// Transport failures must surface as [`AppError::Network`]; a reply with
/// `success: false` as [`AppError::Rejected`] (or a non-`Joined`
/// [`JoinReply`] for joins).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Join `room` as `name`
    async fn join(&self, room: &str, name: &str, delay_ms: i64) -> Result<JoinReply>;

    /// Poll rooms, control lock and our own server-side state
    async fn status(&self) -> Result<StatusReport>;

    /// Leave every room
    async fn leave(&self, _name: Option<&str>) -> Result<RoomsUpdate> {
        unsupported("leave")
    }

    /// Remove another member from their room
    async fn kick(&self, _name: &str) -> Result<Option<RoomSnapshot>> {
        unsupported("kick")
    }

    /// Current membership and capacity
    async fn rooms(&self) -> Result<RoomsUpdate> {
        unsupported("rooms")
    }

    /// Change room capacities (requires the control lock)
    async fn set_capacity(&self, _capacity: &CapacityMap) -> Result<CapacityMap> {
        unsupported("set_capacity")
    }

    /// Control lock state
    async fn control_status(&self) -> Result<ControlStatus> {
        unsupported("control_status")
    }

    /// Try to take the control lock
    async fn acquire_control(&self, _name: &str) -> Result<ControlStatus> {
        unsupported("acquire_control")
    }

    /// Give the control lock back
    async fn release_control(&self) -> Result<()> {
        unsupported("release_control")
    }

    /// Verify the control password for this session
    async fn authenticate_control(&self, _password: &str) -> Result<()> {
        unsupported("authenticate_control")
    }

    /// Relay one key to the shared keyboard
    async fn send_keystroke(&self, _key: &str) -> Result<()> {
        unsupported("send_keystroke")
    }

    /// Update the per-player delay, returns the value the server stored
    async fn set_delay(&self, _delay_ms: i64) -> Result<i64> {
        unsupported("set_delay")
    }

    /// Send an SDP offer, returns the SDP answer
    async fn start_media(&self, _offer_sdp: &str) -> Result<String> {
        unsupported("start_media")
    }

    /// Tell the server this client is going away
    async fn disconnect(&self) -> Result<()> {
        unsupported("disconnect")
    }

    /// Report latency and audio level
    async fn report_metrics(&self, _metrics: &ClientMetrics) -> Result<()> {
        unsupported("report_metrics")
    }

    /// Search the song catalogue
    async fn search_songs(&self, _query: &str, _per_page: u32) -> Result<Vec<SongItem>> {
        unsupported("search_songs")
    }

    /// Add a song to or remove it from the user playlist
    async fn set_upl(&self, _id: &SongId, _action: UplAction) -> Result<UplChange> {
        unsupported("set_upl")
    }

    /// Playlist mode state
    async fn playlist_status(&self) -> Result<PlaylistStatus> {
        unsupported("playlist_status")
    }

    /// Switch playlist mode, optionally changing the countdown between songs
    async fn toggle_playlist(
        &self,
        _enabled: bool,
        _countdown_seconds: Option<u32>,
    ) -> Result<PlaylistStatus> {
        unsupported("toggle_playlist")
    }

    /// Open the push channel of membership updates
    async fn subscribe_rooms(&self) -> Result<BoxStream<'static, Result<RoomsUpdate>>> {
        unsupported("subscribe_rooms")
    }
}
