//! SmartMic server API
//!
//! [`Backend`] is the seam between client logic and transport;
//! [`HttpBackend`] speaks the server's HTTP/JSON protocol.

mod backend;
mod http;
pub mod sse;
pub mod types;

pub use backend::Backend;
pub use http::HttpBackend;
pub use types::{
    Ack, ClientMetrics, ControlStatus, JoinReply, PlaylistStatus, RoomsUpdate, SongId, SongItem,
    StatusReport, UplAction, UplChange, YouInfo,
};
