//! Codec collaborator seam
//!
//! Bitstream encoding and decoding live outside the engine. The engine
//! asks a [`CodecFactory`] for encoders when local video arrives as raw
//! pixels, and for decoders when remote video must be delivered as pixels
//! or composited by the recorder.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frame::{PixelFrame, VideoCodec, VideoFrame};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported codec configuration: {0}")]
    Unsupported(String),

    #[error("Corrupt frame: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoEncoderConfig {
    pub codec: VideoCodec,
    pub bitrate_bps: u32,
    pub frame_rate: u32,
}

pub trait VideoEncoder: Send {
    fn encode(&mut self, frame: &PixelFrame, force_key_frame: bool) -> Result<VideoFrame, CodecError>;

    /// Adopt a new target bitrate for subsequent frames
    fn set_bitrate(&mut self, _bitrate_bps: u32) {}
}

pub trait VideoDecoder: Send {
    /// `None` while the decoder still needs more input
    fn decode(&mut self, frame: &VideoFrame) -> Result<Option<PixelFrame>, CodecError>;
}

pub trait CodecFactory: Send + Sync {
    fn video_encoder(&self, config: &VideoEncoderConfig) -> Result<Box<dyn VideoEncoder>, CodecError>;
    fn video_decoder(&self, codec: VideoCodec) -> Result<Box<dyn VideoDecoder>, CodecError>;
}

const RAW_MAGIC: &[u8; 4] = b"I420";
const RAW_HEADER_LEN: usize = 12;

/// Pass-through "codec" that carries raw I420 pictures
///
/// Payload layout: `"I420" | width u32 BE | height u32 BE | planes`. Useful
/// for loopback setups and tests where no real codec is available.
#[derive(Debug, Clone, Copy)]
pub struct RawI420Codec {
    /// Key frame interval in frames
    pub gop: u32,
}

impl Default for RawI420Codec {
    fn default() -> Self {
        Self { gop: 30 }
    }
}

struct RawEncoder {
    codec: VideoCodec,
    gop: u32,
    since_key: Option<u32>,
}

struct RawDecoder;

impl CodecFactory for RawI420Codec {
    fn video_encoder(&self, config: &VideoEncoderConfig) -> Result<Box<dyn VideoEncoder>, CodecError> {
        Ok(Box::new(RawEncoder {
            codec: config.codec,
            gop: self.gop.max(1),
            since_key: None,
        }))
    }

    fn video_decoder(&self, _codec: VideoCodec) -> Result<Box<dyn VideoDecoder>, CodecError> {
        Ok(Box::new(RawDecoder))
    }
}

impl VideoEncoder for RawEncoder {
    fn encode(&mut self, frame: &PixelFrame, force_key_frame: bool) -> Result<VideoFrame, CodecError> {
        let key = force_key_frame || self.since_key.map_or(true, |n| n + 1 >= self.gop);
        self.since_key = Some(if key { 0 } else { self.since_key.unwrap_or(0) + 1 });

        let mut buf = BytesMut::with_capacity(RAW_HEADER_LEN + frame.data.len());
        buf.put_slice(RAW_MAGIC);
        buf.put_u32(frame.width);
        buf.put_u32(frame.height);
        buf.put_slice(&frame.data);

        let mut out = VideoFrame::new(buf.freeze(), self.codec, frame.pts, key);
        out.rotation = frame.rotation;
        Ok(out)
    }
}

impl VideoDecoder for RawDecoder {
    fn decode(&mut self, frame: &VideoFrame) -> Result<Option<PixelFrame>, CodecError> {
        let data = &frame.data;
        if data.len() < RAW_HEADER_LEN || &data[..4] != RAW_MAGIC {
            return Err(CodecError::Corrupt("missing raw I420 header".to_string()));
        }
        let width = BigEndian::read_u32(&data[4..8]);
        let height = BigEndian::read_u32(&data[8..12]);
        let planes: Bytes = frame.data.slice(RAW_HEADER_LEN..);
        if planes.len() != PixelFrame::i420_len(width, height) {
            return Err(CodecError::Corrupt(format!(
                "{} bytes do not hold a {width}x{height} picture",
                planes.len()
            )));
        }
        let mut out = PixelFrame::new(planes, width, height, frame.pts);
        out.rotation = frame.rotation;
        Ok(Some(out))
    }
}
