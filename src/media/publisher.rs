//! WebRTC microphone publisher
//!
//! Owns one outbound peer connection carrying a single Opus track. Each
//! `connect` builds a fresh connection, sends the offer through the backend
//! and applies the answer. Captured frames are encoded and written to the
//! track until the connection is replaced or closed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::capture::{MicCapture, MicConfig, SAMPLE_RATE};
use super::encoder::{OpusConfig, OpusEncoder};
use super::level::LevelMeter;
use crate::api::Backend;
use crate::config::MediaConfig;
use crate::error::{AppError, Result};
use crate::events::{ClientEvent, EventBus};
use crate::reconnect::{FailureSender, MediaFailure, MediaSession};

/// Transport states that mean the server no longer hears us
pub fn failure_for_state(state: RTCPeerConnectionState) -> Option<MediaFailure> {
    match state {
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
            Some(MediaFailure::Transport(state.to_string()))
        }
        _ => None,
    }
}

fn webrtc_error(context: &str, e: impl std::fmt::Display) -> AppError {
    AppError::WebRtcError(format!("{}: {}", context, e))
}

struct ActiveConnection {
    pc: Arc<RTCPeerConnection>,
    pump: CancellationToken,
}

pub struct MicPublisher {
    backend: Arc<dyn Backend>,
    events: Arc<EventBus>,
    config: MediaConfig,
    capture: Arc<MicCapture>,
    failures: parking_lot::Mutex<Option<FailureSender>>,
    /// Bumped per connection so callbacks of replaced connections go quiet
    generation: Arc<AtomicU64>,
    active: Mutex<Option<ActiveConnection>>,
}

impl MicPublisher {
    pub fn new(
        backend: Arc<dyn Backend>,
        events: Arc<EventBus>,
        config: MediaConfig,
        meter: Arc<LevelMeter>,
    ) -> Self {
        let capture = Arc::new(MicCapture::new(MicConfig::from_media(&config), meter));
        Self {
            backend,
            events,
            config,
            capture,
            failures: parking_lot::Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    /// Where transport failures get reported
    pub fn attach_failures(&self, tx: FailureSender) {
        *self.failures.lock() = Some(tx);
    }

    pub async fn is_connected(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub fn capture(&self) -> &Arc<MicCapture> {
        &self.capture
    }

    async fn new_peer(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| webrtc_error("Failed to register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| webrtc_error("Failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await
            .map_err(|e| webrtc_error("Failed to create peer connection", e))?;
        Ok(Arc::new(pc))
    }

    fn opus_track(&self) -> Arc<TrackLocalStaticSample> {
        let channels = self.capture.config().channels as u16;
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                // SDP always advertises opus/48000/2
                channels: 2,
                sdp_fmtp_line: format!(
                    "minptime=10;useinbandfec=1{}",
                    if channels == 2 { ";stereo=1" } else { "" }
                ),
                rtcp_feedback: vec![],
            },
            "mic".to_string(),
            "smartmic".to_string(),
        ))
    }

    fn watch_state(&self, pc: &RTCPeerConnection, generation: u64) {
        let events = self.events.clone();
        let failures = self.failures.lock().clone();
        let current = self.generation.clone();

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let failures = failures.clone();
            let current = current.clone();
            Box::pin(async move {
                if current.load(Ordering::SeqCst) != generation {
                    return;
                }
                info!("Media connection state: {}", state);
                events.publish(ClientEvent::MediaStateChanged {
                    state: state.to_string(),
                });
                if let (Some(failure), Some(tx)) = (failure_for_state(state), failures.as_ref()) {
                    let _ = tx.send(failure);
                }
            })
        }));
    }

    /// Offer/answer exchange through the backend
    async fn negotiate(&self, pc: &RTCPeerConnection) -> Result<()> {
        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| webrtc_error("Failed to create offer", e))?;

        // Non-trickle: the server wants every candidate in the offer
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| webrtc_error("Failed to set local description", e))?;
        let timeout = Duration::from_millis(self.config.ice_gathering_timeout_ms);
        if tokio::time::timeout(timeout, gathered.recv()).await.is_err() {
            warn!("ICE gathering still running after {:?}, sending partial offer", timeout);
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| AppError::WebRtcError("No local description".to_string()))?;
        let answer_sdp = self.backend.start_media(&local.sdp).await?;
        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| webrtc_error("Invalid SDP answer", e))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| webrtc_error("Failed to set remote description", e))?;
        Ok(())
    }

    fn spawn_pump(&self, track: Arc<TrackLocalStaticSample>, token: CancellationToken) -> Result<()> {
        let mut encoder = OpusEncoder::new(OpusConfig {
            channels: self.capture.config().channels,
            bitrate: self.config.bitrate,
            fec: true,
        })?;
        let mut frames = self.capture.subscribe();

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break,
                    frame = frames.recv() => frame,
                };
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Media pump lagged by {} frames", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let packet = match encoder.encode_frame(&frame) {
                    Ok(packet) => packet,
                    Err(e) => {
                        warn!("{}", e);
                        continue;
                    }
                };
                let sample = Sample {
                    data: packet.data,
                    duration: Duration::from_micros(
                        packet.samples as u64 * 1_000_000 / SAMPLE_RATE as u64,
                    ),
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    trace!("Write sample failed: {}", e);
                }
            }
            debug!("Media pump stopped");
        });
        Ok(())
    }

    async fn close_active(&self) {
        if let Some(active) = self.active.lock().await.take() {
            active.pump.cancel();
            if let Err(e) = active.pc.close().await {
                debug!("Closing peer connection: {}", e);
            }
        }
    }
}

#[async_trait]
impl MediaSession for MicPublisher {
    async fn connect(&self) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.close_active().await;

        let pc = self.new_peer().await?;
        let track = self.opus_track();
        let established = async {
            pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| webrtc_error("Failed to add audio track", e))?;
            self.watch_state(&pc, generation);
            self.negotiate(&pc).await
        }
        .await;

        if let Err(e) = established {
            let _ = pc.close().await;
            return Err(e);
        }

        self.capture.start().await?;
        let pump = CancellationToken::new();
        if let Err(e) = self.spawn_pump(track, pump.clone()) {
            let _ = pc.close().await;
            return Err(e);
        }

        *self.active.lock().await = Some(ActiveConnection { pc, pump });
        info!("Microphone published");
        Ok(())
    }

    async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.close_active().await;
        self.capture.stop().await;
    }
}
