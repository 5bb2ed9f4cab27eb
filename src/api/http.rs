//! reqwest implementation of [`Backend`]

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::Backend;
use super::sse::SseDecoder;
use super::types::{
    AcquireResponse, Ack, CapacityRequest, CapacityResponse, ClientMetrics, ControlStatus,
    DelayResponse, JoinReply, JoinRequest, JoinResponse, KickResponse, PlaylistStatus,
    PlaylistStatusResponse, PlaylistToggleRequest, PlaylistToggleResponse, RoomsResponse,
    RoomsUpdate, SongId, SongItem, SongSearchResponse, StartMediaResponse, StatusReport,
    UplAction, UplChange, UplRequest, UplResponse,
};
use crate::config::ServerConfig;
use crate::error::{AppError, Result};
use crate::rooms::{CapacityMap, RoomSnapshot};

/// HTTP client for the SmartMic server
///
/// Keeps a cookie store: the server identifies sessions by its session
/// cookie, so one `HttpBackend` is one client identity.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let request_timeout = Duration::from_millis(config.request_timeout_ms.max(100));
        // No client-wide timeout: it would also cut the long-lived push stream
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::decode(path, response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await?;
        Self::decode(path, response).await
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Self::decode(path, response).await
    }

    /// Decode a JSON body whatever the status code
    ///
    /// The server reports failures as JSON with a 4xx/5xx status, so the
    /// body is the interesting part. A non-JSON error body becomes a
    /// generic `server_error` rejection.
    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.bytes().await?;
        trace!("{} -> {} ({} bytes)", path, status, body.len());

        match serde_json::from_slice::<T>(&body) {
            Ok(value) => Ok(value),
            Err(e) if status.is_success() => Err(AppError::Internal(format!(
                "Invalid response from {}: {}",
                path, e
            ))),
            Err(_) => Err(AppError::rejected(
                None,
                format!("{} failed with HTTP {}", path, status),
            )),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn join(&self, room: &str, name: &str, delay_ms: i64) -> Result<JoinReply> {
        let request = JoinRequest {
            room,
            name,
            delay: delay_ms,
        };
        let response: JoinResponse = self.post_json("/rooms/join", &request).await?;
        Ok(response.into_reply(room))
    }

    async fn status(&self) -> Result<StatusReport> {
        let report: StatusReport = self.get_json("/status").await?;
        if !report.success {
            return Err(AppError::rejected(
                None,
                report.error.unwrap_or_else(|| "Status poll failed".to_string()),
            ));
        }
        Ok(report)
    }

    async fn leave(&self, name: Option<&str>) -> Result<RoomsUpdate> {
        let body = serde_json::json!({ "name": name });
        let response: RoomsResponse = self.post_json("/rooms/leave", &body).await?;
        response.ack.into_result("Leave failed")?;
        Ok(response.update)
    }

    async fn kick(&self, name: &str) -> Result<Option<RoomSnapshot>> {
        let body = serde_json::json!({ "name": name });
        let response: KickResponse = self.post_json("/rooms/kick", &body).await?;
        response.ack.into_result("Kick failed")?;
        Ok(response.rooms)
    }

    async fn rooms(&self) -> Result<RoomsUpdate> {
        let response: RoomsResponse = self.get_json("/rooms").await?;
        response.ack.into_result("Room list failed")?;
        Ok(response.update)
    }

    async fn set_capacity(&self, capacity: &CapacityMap) -> Result<CapacityMap> {
        let response: CapacityResponse = self
            .post_json("/rooms/capacity", &CapacityRequest { capacity })
            .await?;
        if response.ack.error_code.as_deref() == Some("control_required") {
            return Err(AppError::ControlRequired(
                response
                    .ack
                    .error
                    .unwrap_or_else(|| "Control lock required".to_string()),
            ));
        }
        response.ack.into_result("Unknown capacity error")?;
        Ok(response.capacity.unwrap_or_default())
    }

    async fn control_status(&self) -> Result<ControlStatus> {
        self.get_json("/control/status").await
    }

    async fn acquire_control(&self, name: &str) -> Result<ControlStatus> {
        let body = serde_json::json!({ "name": name });
        let response: AcquireResponse = self.post_json("/control/acquire", &body).await?;
        response.ack.into_result("Control already taken")?;
        Ok(ControlStatus {
            owner: response.owner,
            owner_name: response.owner_name,
            ..Default::default()
        })
    }

    async fn release_control(&self) -> Result<()> {
        let ack: Ack = self.post_empty("/control/release").await?;
        ack.into_result("Not owner")
    }

    async fn authenticate_control(&self, password: &str) -> Result<()> {
        let body = serde_json::json!({ "password": password });
        let ack: Ack = self.post_json("/control/auth", &body).await?;
        ack.into_result("Invalid control password.")
    }

    async fn send_keystroke(&self, key: &str) -> Result<()> {
        let body = serde_json::json!({ "key": key });
        let ack: Ack = self.post_json("/control/keystroke", &body).await?;
        ack.into_result("Keystroke failed")
    }

    async fn set_delay(&self, delay_ms: i64) -> Result<i64> {
        let body = serde_json::json!({ "delay": delay_ms });
        let response: DelayResponse = self.post_json("/player/delay", &body).await?;
        response.ack.into_result("Delay update failed")?;
        Ok(response.delay.unwrap_or(delay_ms))
    }

    async fn start_media(&self, offer_sdp: &str) -> Result<String> {
        let response = self
            .client
            .post(self.url("/api"))
            .timeout(self.request_timeout)
            .form(&[("action", "start_webrtc"), ("offer", offer_sdp)])
            .send()
            .await?;
        let response: StartMediaResponse = Self::decode("/api", response).await?;
        response.ack.into_result("Failed to start webrtc on server")?;
        if let Some(player_id) = response.player_id {
            debug!("Media session started for player {}", player_id);
        }
        response
            .answer
            .filter(|sdp| !sdp.is_empty())
            .ok_or_else(|| AppError::WebRtcError("No SDP answer from server".to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        let ack: Ack = self.post_empty("/api/disconnect").await?;
        ack.into_result("No session")
    }

    async fn report_metrics(&self, metrics: &ClientMetrics) -> Result<()> {
        // The server answers with nothing useful
        self.client
            .post(self.url("/client/metrics"))
            .timeout(self.request_timeout)
            .json(metrics)
            .send()
            .await?;
        Ok(())
    }

    async fn search_songs(&self, query: &str, per_page: u32) -> Result<Vec<SongItem>> {
        let response = self
            .client
            .get(self.url("/songs/search"))
            .timeout(self.request_timeout)
            .query(&[("q", query.to_string()), ("per_page", per_page.to_string())])
            .send()
            .await?;
        let response: SongSearchResponse = Self::decode("/songs/search", response).await?;
        response.ack.into_result("Search failed")?;
        Ok(response.items)
    }

    async fn set_upl(&self, id: &SongId, action: UplAction) -> Result<UplChange> {
        let response: UplResponse = self
            .post_json("/songs/add_to_upl", &UplRequest { id, action })
            .await?;
        response.ack.into_result("unknown")?;
        Ok(response.change)
    }

    async fn playlist_status(&self) -> Result<PlaylistStatus> {
        let response: PlaylistStatusResponse = self.get_json("/playlist/status").await?;
        response.ack.into_result("status failed")?;
        Ok(response.status)
    }

    async fn toggle_playlist(
        &self,
        enabled: bool,
        countdown_seconds: Option<u32>,
    ) -> Result<PlaylistStatus> {
        let request = PlaylistToggleRequest {
            enabled,
            countdown_seconds: countdown_seconds.filter(|s| *s > 0),
        };
        let response: PlaylistToggleResponse =
            self.post_json("/playlist/toggle", &request).await?;
        response.ack.clone().into_result("toggle failed")?;
        Ok(response.into_status())
    }

    async fn subscribe_rooms(&self) -> Result<BoxStream<'static, Result<RoomsUpdate>>> {
        // Only the wait for headers is bounded; the body stays open
        let request = self
            .client
            .get(self.url("/rooms/stream"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| {
                AppError::Network(format!(
                    "No push channel headers within {}ms",
                    self.request_timeout.as_millis()
                ))
            })??
            .error_for_status()?;

        let mut body = response.bytes_stream();
        let stream = async_stream::try_stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                for event in decoder.push(&chunk) {
                    match serde_json::from_str::<RoomsUpdate>(&event.data) {
                        Ok(update) => yield update,
                        Err(e) => debug!("Ignoring malformed push event: {}", e),
                    }
                }
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, StatusCode};
    use axum::routing::{get, post};
    use axum::{Form, Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    async fn serve(app: Router) -> HttpBackend {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        HttpBackend::new(&ServerConfig {
            base_url: format!("http://{}/", addr),
            ..Default::default()
        })
        .unwrap()
    }

    async fn join_handler(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        let room = body["room"].as_str().unwrap_or_default().to_string();
        if room == "mic3" {
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "success": false,
                    "error": "mic3 is full",
                    "error_code": "room_full",
                    "room": "mic3",
                    "members": 6,
                    "capacity": 6,
                    "capacity_map": {"mic3": 6}
                })),
            );
        }
        let mut rooms = serde_json::Map::new();
        rooms.insert("lobby".to_string(), json!([]));
        rooms.insert(room.clone(), json!([body["name"]]));
        (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "room": room,
                "name": body["name"],
                "rooms": rooms,
                "capacity": {"mic1": 6}
            })),
        )
    }

    #[tokio::test]
    async fn test_join_success_and_room_full() {
        let backend = serve(Router::new().route("/rooms/join", post(join_handler))).await;

        let reply = backend.join("mic1", "Alice", 0).await.unwrap();
        assert!(matches!(reply, JoinReply::Joined { ref room, .. } if room == "mic1"));

        let reply = backend.join("mic3", "Alice", 0).await.unwrap();
        assert_eq!(
            reply,
            JoinReply::Full {
                room: "mic3".to_string(),
                members: 6,
                capacity: 6
            }
        );
    }

    #[tokio::test]
    async fn test_non_json_error_is_server_error() {
        let app = Router::new().route(
            "/status",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let backend = serve(app).await;
        let err = backend.status().await.unwrap_err();
        assert!(matches!(err, AppError::Rejected { ref code, .. } if code == "server_error"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let backend = HttpBackend::new(&ServerConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout_ms: 500,
            ..Default::default()
        })
        .unwrap();
        assert!(backend.status().await.unwrap_err().is_network());
    }

    #[tokio::test]
    async fn test_start_media_posts_form() {
        let app = Router::new().route(
            "/api",
            post(|Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("action").map(String::as_str), Some("start_webrtc"));
                Json(json!({
                    "success": true,
                    "answer": format!("answer-for:{}", form["offer"]),
                    "player_id": 77
                }))
            }),
        );
        let backend = serve(app).await;
        let answer = backend.start_media("v=0 offer").await.unwrap();
        assert_eq!(answer, "answer-for:v=0 offer");
    }

    #[tokio::test]
    async fn test_control_acquire_conflict() {
        let app = Router::new().route(
            "/control/acquire",
            post(|| async {
                (
                    StatusCode::CONFLICT,
                    Json(json!({"success": false, "error": "Control already taken",
                                "owner": 1, "owner_name": "Bob"})),
                )
            }),
        );
        let backend = serve(app).await;
        let err = backend.acquire_control("Alice").await.unwrap_err();
        assert!(matches!(err, AppError::Rejected { ref message, .. } if message == "Control already taken"));
    }

    #[tokio::test]
    async fn test_push_stream_yields_updates() {
        let app = Router::new().route(
            "/rooms/stream",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    "data: {\"rooms\": {\"lobby\": [\"Bob\"]}, \"capacity\": {\"mic1\": 6}}\n\n\
                     data: not json\n\n\
                     data: {\"rooms\": {\"lobby\": [], \"mic1\": [\"Bob\"]}}\n\n",
                )
            }),
        );
        let backend = serve(app).await;
        let updates: Vec<RoomsUpdate> = backend
            .subscribe_rooms()
            .await
            .unwrap()
            .map(|u| u.unwrap())
            .collect()
            .await;
        assert_eq!(updates.len(), 2);
        assert!(updates[0].rooms.as_ref().unwrap().contains("lobby", "Bob"));
        assert!(updates[1].rooms.as_ref().unwrap().contains("mic1", "Bob"));
        assert!(updates[1].capacity.is_none());
    }

    #[tokio::test]
    async fn test_song_search_and_upl() {
        use axum::extract::Query;

        let app = Router::new()
            .route(
                "/songs/search",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    assert_eq!(params.get("per_page").map(String::as_str), Some("100"));
                    Json(json!({
                        "success": true,
                        "items": [{"id": 5, "display": params["q"], "upl": false}]
                    }))
                }),
            )
            .route(
                "/songs/add_to_upl",
                post(|Json(body): Json<Value>| async move {
                    if body["id"] == json!(404) {
                        return (
                            StatusCode::NOT_FOUND,
                            Json(json!({"success": false, "error": "Unknown song"})),
                        );
                    }
                    let added = body["action"] == "add";
                    (
                        StatusCode::OK,
                        Json(json!({"success": true, "upl": added, "line": "ABBA - Waterloo"})),
                    )
                }),
            );
        let backend = serve(app).await;

        let items = backend.search_songs("abba waterloo", 100).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].display, "abba waterloo");
        assert_eq!(items[0].id, Some(SongId::Number(5)));

        let change = backend.set_upl(&SongId::Number(5), UplAction::Add).await.unwrap();
        assert!(change.upl);
        assert_eq!(change.line.as_deref(), Some("ABBA - Waterloo"));
        let change = backend
            .set_upl(&SongId::Number(5), UplAction::Remove)
            .await
            .unwrap();
        assert!(!change.upl);

        let err = backend
            .set_upl(&SongId::Number(404), UplAction::Add)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Rejected { ref message, .. } if message == "Unknown song"));
    }

    #[tokio::test]
    async fn test_playlist_status_and_toggle() {
        let app = Router::new()
            .route(
                "/playlist/status",
                get(|| async {
                    Json(json!({"success": true, "enabled": false, "status_text": "Idle",
                                "countdown_seconds": 15}))
                }),
            )
            .route(
                "/playlist/toggle",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({
                        "success": true,
                        "state": {
                            "enabled": body["enabled"],
                            "countdown_seconds": body.get("countdown_seconds").cloned().unwrap_or(json!(15)),
                            "current_song": "Queen - Bohemian Rhapsody",
                            "lock_controls": true
                        }
                    }))
                }),
            );
        let backend = serve(app).await;

        let status = backend.playlist_status().await.unwrap();
        assert!(!status.enabled);
        assert_eq!(status.countdown_seconds, Some(15.0));

        let status = backend.toggle_playlist(true, Some(30)).await.unwrap();
        assert!(status.enabled);
        assert!(status.lock_controls);
        assert_eq!(status.countdown_seconds, Some(30.0));
        assert_eq!(status.current_song.as_deref(), Some("Queen - Bohemian Rhapsody"));

        // A zero countdown is not sent
        let status = backend.toggle_playlist(false, Some(0)).await.unwrap();
        assert!(!status.enabled);
        assert_eq!(status.countdown_seconds, Some(15.0));
    }

    #[tokio::test]
    async fn test_push_subscribe_times_out_without_headers() {
        // Accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let backend = HttpBackend::new(&ServerConfig {
            base_url: format!("http://{}", addr),
            request_timeout_ms: 300,
            ..Default::default()
        })
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), backend.subscribe_rooms())
            .await
            .expect("subscribe must give up on its own");
        assert!(result.err().unwrap().is_network());
    }
}
