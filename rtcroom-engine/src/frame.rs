//! Media frame value types
//!
//! Payloads are `Bytes` so a frame handed to the pipeline can be cloned
//! into several consumers (delegate, pull buffer, recorder taps) without
//! copying. Timestamps are milliseconds.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Largest SEI payload accepted in one message
pub const SEI_MAX_PAYLOAD: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Pcm,
    Opus,
    Aac,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoRotation {
    #[default]
    None,
    Rotate90,
    Rotate180,
    Rotate270,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Bytes,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub codec: AudioCodec,
    pub pts: u32,
}

impl AudioFrame {
    /// 16-bit interleaved PCM frame
    #[must_use]
    pub fn pcm(data: Bytes, sample_rate: u32, channels: u16, pts: u32) -> Self {
        Self {
            data,
            sample_rate,
            channels,
            bits_per_sample: 16,
            codec: AudioCodec::Pcm,
            pts,
        }
    }

    /// Bytes needed to hold `ms` milliseconds of this frame's PCM layout
    #[must_use]
    pub fn pcm_bytes_for(sample_rate: u32, channels: u16, ms: u32) -> usize {
        (sample_rate as usize * ms as usize / 1000) * channels as usize * 2
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.data.is_empty() {
            return Err(EngineError::invalid_parameter("audio frame is empty"));
        }
        if self.sample_rate == 0 || !matches!(self.channels, 1 | 2) {
            return Err(EngineError::invalid_parameter(format!(
                "audio format {} Hz / {} channels is not supported",
                self.sample_rate, self.channels
            )));
        }
        if self.codec == AudioCodec::Pcm {
            if self.bits_per_sample != 16 {
                return Err(EngineError::invalid_parameter("PCM audio must be 16-bit"));
            }
            if self.data.len() % (self.channels as usize * 2) != 0 {
                return Err(EngineError::invalid_parameter(
                    "PCM payload is not a whole number of samples",
                ));
            }
        }
        Ok(())
    }
}

/// Encoded video access unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub data: Bytes,
    pub codec: VideoCodec,
    pub pts: u32,
    pub dts: u32,
    pub is_key_frame: bool,
    pub rotation: VideoRotation,
}

impl VideoFrame {
    #[must_use]
    pub fn new(data: Bytes, codec: VideoCodec, pts: u32, is_key_frame: bool) -> Self {
        Self {
            data,
            codec,
            pts,
            dts: pts,
            is_key_frame,
            rotation: VideoRotation::None,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.data.is_empty() {
            return Err(EngineError::invalid_parameter("video frame is empty"));
        }
        Ok(())
    }
}

/// Raw I420 picture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub pts: u32,
    pub rotation: VideoRotation,
}

impl PixelFrame {
    #[must_use]
    pub fn new(data: Bytes, width: u32, height: u32, pts: u32) -> Self {
        Self {
            data,
            width,
            height,
            pts,
            rotation: VideoRotation::None,
        }
    }

    /// Size in bytes of an I420 picture with the given dimensions
    #[must_use]
    pub fn i420_len(width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        w * h + 2 * cw * ch
    }

    /// Uniformly filled picture
    #[must_use]
    pub fn filled(width: u32, height: u32, y: u8, u: u8, v: u8, pts: u32) -> Self {
        let luma = width as usize * height as usize;
        let chroma = (Self::i420_len(width, height) - luma) / 2;
        let mut data = Vec::with_capacity(luma + 2 * chroma);
        data.resize(luma, y);
        data.resize(luma + chroma, u);
        data.resize(luma + 2 * chroma, v);
        Self::new(Bytes::from(data), width, height, pts)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::invalid_parameter("pixel frame has no area"));
        }
        let expected = Self::i420_len(self.width, self.height);
        if self.data.len() != expected {
            return Err(EngineError::invalid_parameter(format!(
                "pixel frame holds {} bytes, {}x{} I420 needs {expected}",
                self.data.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }
}

/// Any media frame carried by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
    Pixel(PixelFrame),
}

impl Frame {
    #[must_use]
    pub const fn pts(&self) -> u32 {
        match self {
            Self::Audio(f) => f.pts,
            Self::Video(f) => f.pts,
            Self::Pixel(f) => f.pts,
        }
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        match self {
            Self::Audio(f) => &f.data,
            Self::Video(f) => &f.data,
            Self::Pixel(f) => &f.data,
        }
    }

    /// Same frame with its payload replaced (used by transforms)
    #[must_use]
    pub fn with_payload(self, data: Bytes) -> Self {
        match self {
            Self::Audio(f) => Self::Audio(AudioFrame { data, ..f }),
            Self::Video(f) => Self::Video(VideoFrame { data, ..f }),
            Self::Pixel(f) => Self::Pixel(PixelFrame { data, ..f }),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        match self {
            Self::Audio(f) => f.validate(),
            Self::Video(f) => f.validate(),
            Self::Pixel(f) => f.validate(),
        }
    }
}

/// Out-of-band metadata carried alongside video
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeiMessage {
    pub message_type: u8,
    pub payload: Bytes,
}

impl SeiMessage {
    /// Validate type and size; the per-channel rate is checked by the pipeline
    pub fn new(message_type: u8, payload: Bytes) -> EngineResult<Self> {
        if !matches!(message_type, 5 | 242) {
            return Err(EngineError::invalid_parameter(format!(
                "SEI type {message_type} is not 5 or 242"
            )));
        }
        if payload.is_empty() || payload.len() > SEI_MAX_PAYLOAD {
            return Err(EngineError::invalid_parameter(format!(
                "SEI payload of {} bytes is outside 1..={SEI_MAX_PAYLOAD}",
                payload.len()
            )));
        }
        Ok(Self {
            message_type,
            payload,
        })
    }
}
