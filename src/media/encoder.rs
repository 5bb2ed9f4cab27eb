//! Opus encoding of microphone frames

use audiopus::coder::GenericCtl;
use audiopus::{coder::Encoder, Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;
use tracing::{info, trace};

use super::capture::{AudioFrame, SAMPLE_RATE};
use crate::error::{AppError, Result};

/// Largest Opus packet we ever produce
const MAX_PACKET: usize = 4000;

#[derive(Debug, Clone)]
pub struct OpusConfig {
    /// 1 or 2
    pub channels: u32,
    /// Target bitrate in bps
    pub bitrate: u32,
    /// In-band forward error correction
    pub fec: bool,
}

impl Default for OpusConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            bitrate: 64000,
            fec: true,
        }
    }
}

/// One encoded packet
#[derive(Debug, Clone)]
pub struct OpusPacket {
    pub data: Bytes,
    /// Samples per channel the packet covers
    pub samples: u32,
}

pub struct OpusEncoder {
    config: OpusConfig,
    encoder: Encoder,
    output: Vec<u8>,
    packets: u64,
}

impl OpusEncoder {
    pub fn new(config: OpusConfig) -> Result<Self> {
        let channels = if config.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        };

        // Singing is music, not speech
        let mut encoder = Encoder::new(SampleRate::Hz48000, channels, Application::Audio)
            .map_err(|e| AppError::AudioError(format!("Failed to create Opus encoder: {:?}", e)))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(config.bitrate as i32))
            .map_err(|e| AppError::AudioError(format!("Failed to set bitrate: {:?}", e)))?;
        if config.fec {
            encoder
                .set_inband_fec(true)
                .map_err(|e| AppError::AudioError(format!("Failed to enable FEC: {:?}", e)))?;
        }

        info!(
            "Opus encoder created: {}Hz {}ch {}bps",
            SAMPLE_RATE, config.channels, config.bitrate
        );

        Ok(Self {
            config,
            encoder,
            output: vec![0u8; MAX_PACKET],
            packets: 0,
        })
    }

    /// Encode interleaved S16 samples (one 20 ms frame)
    pub fn encode(&mut self, pcm: &[i16]) -> Result<OpusPacket> {
        let len = self
            .encoder
            .encode(pcm, &mut self.output)
            .map_err(|e| AppError::AudioError(format!("Opus encode failed: {:?}", e)))?;
        self.packets += 1;
        trace!("Encoded {} samples to {} bytes", pcm.len(), len);

        Ok(OpusPacket {
            data: Bytes::copy_from_slice(&self.output[..len]),
            samples: pcm.len() as u32 / self.config.channels.max(1),
        })
    }

    pub fn encode_frame(&mut self, frame: &AudioFrame) -> Result<OpusPacket> {
        self.encode(&frame.pcm())
    }

    pub fn packets_encoded(&self) -> u64 {
        self.packets
    }
}
