//! ALSA microphone capture

use alsa::pcm::{Access, Format, Frames, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::level::LevelMeter;
use crate::config::MediaConfig;
use crate::error::{AppError, Result};

/// Sample rate Opus and the server expect
pub const SAMPLE_RATE: u32 = 48000;

/// Samples per channel in one 20 ms frame
pub const FRAME_SAMPLES: u32 = SAMPLE_RATE / 50;

/// Capture parameters
#[derive(Debug, Clone)]
pub struct MicConfig {
    /// ALSA device name (e.g. "default" or "hw:1,0")
    pub device: String,
    pub sample_rate: u32,
    /// 1 = mono, 2 = stereo
    pub channels: u32,
    /// Samples per channel per frame
    pub frame_size: u32,
    pub buffer_frames: u32,
    pub period_frames: u32,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            sample_rate: SAMPLE_RATE,
            channels: 2,
            frame_size: FRAME_SAMPLES,
            buffer_frames: 4096,
            period_frames: FRAME_SAMPLES,
        }
    }
}

impl MicConfig {
    pub fn from_media(config: &MediaConfig) -> Self {
        Self {
            device: config.device.clone(),
            channels: config.channels.clamp(1, 2),
            ..Default::default()
        }
    }

    /// Bytes per interleaved S16 sample frame
    pub fn bytes_per_sample(&self) -> u32 {
        2 * self.channels
    }

    pub fn bytes_per_frame(&self) -> usize {
        (self.frame_size * self.bytes_per_sample()) as usize
    }
}

/// One captured 20 ms block, S16LE interleaved
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub channels: u32,
    /// Samples per channel
    pub samples: u32,
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(data: Bytes, config: &MicConfig, sequence: u64) -> Self {
        Self {
            samples: data.len() as u32 / config.bytes_per_sample(),
            data,
            channels: config.channels,
            sequence,
        }
    }

    /// Samples as i16 (copies if the buffer is misaligned)
    pub fn pcm(&self) -> Vec<i16> {
        match bytemuck::try_cast_slice::<u8, i16>(&self.data) {
            Ok(samples) => samples.to_vec(),
            Err(_) => self
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub buffer_overruns: u64,
    pub read_errors: u64,
}

/// Microphone capturer
///
/// Reads on a blocking thread, meters every frame and broadcasts it.
pub struct MicCapture {
    config: MicConfig,
    meter: Arc<LevelMeter>,
    state: Arc<watch::Sender<CaptureState>>,
    state_rx: watch::Receiver<CaptureState>,
    stats: Arc<parking_lot::Mutex<CaptureStats>>,
    frame_tx: broadcast::Sender<AudioFrame>,
    stop_flag: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MicCapture {
    pub fn new(config: MicConfig, meter: Arc<LevelMeter>) -> Self {
        let (state_tx, state_rx) = watch::channel(CaptureState::Stopped);
        let (frame_tx, _) = broadcast::channel(16);

        Self {
            config,
            meter,
            state: Arc::new(state_tx),
            state_rx,
            stats: Arc::new(parking_lot::Mutex::new(CaptureStats::default())),
            frame_tx,
            stop_flag: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MicConfig {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioFrame> {
        self.frame_tx.subscribe()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == CaptureState::Running
    }

    /// Start capturing; no-op while running
    pub async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.as_ref() {
            if !h.is_finished() {
                return Ok(());
            }
        }

        info!(
            "Starting microphone capture on {} at {}Hz {}ch",
            self.config.device, self.config.sample_rate, self.config.channels
        );
        self.stop_flag.store(false, Ordering::SeqCst);

        let ctx = CaptureContext {
            config: self.config.clone(),
            meter: self.meter.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            frame_tx: self.frame_tx.clone(),
            stop_flag: self.stop_flag.clone(),
            sequence: self.sequence.clone(),
        };
        *handle = Some(tokio::task::spawn_blocking(move || ctx.run()));
        Ok(())
    }

    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
            info!("Microphone capture stopped");
        }
        let _ = self.state.send(CaptureState::Stopped);
    }
}

struct CaptureContext {
    config: MicConfig,
    meter: Arc<LevelMeter>,
    state: Arc<watch::Sender<CaptureState>>,
    stats: Arc<parking_lot::Mutex<CaptureStats>>,
    frame_tx: broadcast::Sender<AudioFrame>,
    stop_flag: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
}

impl CaptureContext {
    fn run(self) {
        match self.capture() {
            Ok(()) => {
                let _ = self.state.send(CaptureState::Stopped);
            }
            Err(e) => {
                error!("Microphone capture error: {}", e);
                let _ = self.state.send(CaptureState::Error);
            }
        }
    }

    fn open(&self) -> Result<PCM> {
        let config = &self.config;
        let pcm = PCM::new(&config.device, Direction::Capture, false).map_err(|e| {
            AppError::AudioError(format!("Failed to open microphone {}: {}", config.device, e))
        })?;

        {
            let hwp = HwParams::any(&pcm)
                .map_err(|e| AppError::AudioError(format!("Failed to get HwParams: {}", e)))?;
            hwp.set_channels(config.channels)
                .map_err(|e| AppError::AudioError(format!("Failed to set channels: {}", e)))?;
            hwp.set_rate(config.sample_rate, ValueOr::Nearest)
                .map_err(|e| AppError::AudioError(format!("Failed to set sample rate: {}", e)))?;
            hwp.set_format(Format::s16())
                .map_err(|e| AppError::AudioError(format!("Failed to set format: {}", e)))?;
            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| AppError::AudioError(format!("Failed to set access: {}", e)))?;
            hwp.set_buffer_size_near(config.buffer_frames as Frames)
                .map_err(|e| AppError::AudioError(format!("Failed to set buffer size: {}", e)))?;
            hwp.set_period_size_near(config.period_frames as Frames, ValueOr::Nearest)
                .map_err(|e| AppError::AudioError(format!("Failed to set period size: {}", e)))?;
            pcm.hw_params(&hwp)
                .map_err(|e| AppError::AudioError(format!("Failed to apply hw params: {}", e)))?;
        }

        let actual_rate = pcm
            .hw_params_current()
            .map(|h| h.get_rate().unwrap_or(config.sample_rate))
            .unwrap_or(config.sample_rate);
        if actual_rate != config.sample_rate {
            warn!(
                "Microphone runs at {}Hz instead of {}Hz, audio will be pitched",
                actual_rate, config.sample_rate
            );
        }

        pcm.prepare()
            .map_err(|e| AppError::AudioError(format!("Failed to prepare PCM: {}", e)))?;
        Ok(pcm)
    }

    fn capture(&self) -> Result<()> {
        let pcm = self.open()?;
        let _ = self.state.send(CaptureState::Running);

        let mut buffer = vec![0u8; self.config.bytes_per_frame()];

        while !self.stop_flag.load(Ordering::Relaxed) {
            match pcm.state() {
                State::XRun => {
                    warn!("Microphone buffer overrun, recovering");
                    self.stats.lock().buffer_overruns += 1;
                    let _ = pcm.prepare();
                    continue;
                }
                State::Suspended => {
                    warn!("Microphone suspended, recovering");
                    let _ = pcm.resume();
                    continue;
                }
                _ => {}
            }

            // io_bytes rather than io_checked: USB mics rarely support mmap
            let io: IO<u8> = pcm.io_bytes();
            match io.readi(&mut buffer) {
                Ok(0) => continue,
                Ok(frames_read) => {
                    let byte_count = frames_read * self.config.bytes_per_sample() as usize;
                    let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                    let frame = AudioFrame::new(
                        Bytes::copy_from_slice(&buffer[..byte_count]),
                        &self.config,
                        seq,
                    );
                    self.meter.record_samples(&frame.pcm());

                    if self.frame_tx.receiver_count() > 0 && self.frame_tx.send(frame).is_err() {
                        debug!("No microphone frame receivers");
                    }
                    self.stats.lock().frames_captured += 1;
                }
                Err(e) => {
                    let desc = e.to_string();
                    if desc.contains("EPIPE") || desc.contains("Broken pipe") {
                        warn!("Microphone buffer overrun");
                        self.stats.lock().buffer_overruns += 1;
                        let _ = pcm.prepare();
                    } else {
                        self.stats.lock().read_errors += 1;
                        return Err(AppError::AudioError(format!("Microphone read error: {}", e)));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_media() {
        let media = MediaConfig {
            device: "hw:1,0".to_string(),
            channels: 5,
            ..Default::default()
        };
        let config = MicConfig::from_media(&media);
        assert_eq!(config.device, "hw:1,0");
        assert_eq!(config.channels, 2);
        assert_eq!(config.frame_size, 960);
        assert_eq!(config.bytes_per_frame(), 960 * 4);
    }

    #[test]
    fn test_frame_pcm() {
        let config = MicConfig {
            channels: 1,
            ..Default::default()
        };
        let data: Vec<u8> = [1i16, -2, 300].iter().flat_map(|s| s.to_le_bytes()).collect();
        let frame = AudioFrame::new(Bytes::from(data), &config, 3);
        assert_eq!(frame.samples, 3);
        assert_eq!(frame.pcm(), vec![1, -2, 300]);
    }
}
