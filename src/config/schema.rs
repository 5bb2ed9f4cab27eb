use serde::{Deserialize, Serialize};

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Backend connection settings
    pub server: ServerConfig,
    /// Room behaviour
    pub rooms: RoomsConfig,
    /// Poll intervals and suppression windows
    pub timing: TimingConfig,
    /// Media transport reconnect policy
    pub reconnect: ReconnectConfig,
    /// Microphone capture and WebRTC settings
    pub media: MediaConfig,
    /// Remote keyboard settings
    pub control: ControlConfig,
    /// Audio liveness intervention
    pub health: HealthConfig,
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the SmartMic server, e.g. `http://192.168.4.1:5000`
    pub base_url: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Accept self-signed certificates (hotspot deployments use them)
    pub accept_invalid_certs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            request_timeout_ms: 5000,
            accept_invalid_certs: false,
        }
    }
}

/// Room behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoomsConfig {
    /// Per-player playback delay sent with every join (ms)
    pub delay_ms: i64,
    /// Join the remembered room on start-up
    pub rejoin_on_start: bool,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            rejoin_on_start: true,
        }
    }
}

/// Poll intervals and suppression windows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Status poll interval (ms); also the server heartbeat and control lock poll
    pub poll_interval_ms: u64,
    /// Suppression applied before a user-initiated join (ms)
    pub join_suppress_ms: u64,
    /// Suppression applied before a silent join (ms)
    pub silent_join_suppress_ms: u64,
    /// Suppression applied after the server confirmed a join (ms)
    pub confirm_suppress_ms: u64,
    /// Delay before reopening a dropped push channel (ms)
    pub push_retry_ms: u64,
    /// Client metrics interval (ms), 0 disables metrics
    pub metrics_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            join_suppress_ms: 4000,
            silent_join_suppress_ms: 2000,
            confirm_suppress_ms: 1500,
            push_retry_ms: 5000,
            metrics_interval_ms: 1000,
        }
    }
}

/// Media transport reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Highest attempt number the exponent grows to
    pub max_attempt: u32,
    /// Upper bound of a single delay (seconds)
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempt: 6,
            max_delay_secs: 60,
        }
    }
}

/// Microphone capture and WebRTC settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Publish no microphone, only use rooms and the remote keyboard
    pub control_only: bool,
    /// ALSA capture device (e.g. "default", "hw:1,0")
    pub device: String,
    /// Capture channels (1 = mono, 2 = stereo)
    pub channels: u32,
    /// Opus bitrate in bps
    pub bitrate: u32,
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// How long to wait for ICE gathering before sending the offer (ms)
    pub ice_gathering_timeout_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            control_only: false,
            device: "default".to_string(),
            channels: 2,
            bitrate: 64000,
            // Hotspot deployments are on the same LAN, host candidates suffice
            stun_servers: vec![],
            ice_gathering_timeout_ms: 3000,
        }
    }
}

/// Remote keyboard settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    /// Control password, used when the server requires one
    pub password: Option<String>,
}

/// Audio liveness intervention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Enable the lobby-hop intervention
    pub enabled: bool,
    /// Silence threshold (seconds)
    pub silence_threshold_secs: f64,
    /// Minimum time between two warnings/interventions (seconds)
    pub warning_cooldown_secs: u64,
    /// Pause between the lobby hop and the rejoin (ms)
    pub hop_pause_ms: u64,
    /// RMS level above which the local microphone counts as active
    pub active_level: f32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            silence_threshold_secs: 5.0,
            warning_cooldown_secs: 15,
            hop_pause_ms: 900,
            active_level: 0.02,
        }
    }
}
