//! Microphone capture, Opus encoding and WebRTC publishing

pub mod capture;
pub mod encoder;
pub mod level;
pub mod publisher;

pub use capture::{AudioFrame, CaptureState, MicCapture, MicConfig};
pub use encoder::{OpusConfig, OpusEncoder};
pub use level::{rms, LevelMeter};
pub use publisher::MicPublisher;
