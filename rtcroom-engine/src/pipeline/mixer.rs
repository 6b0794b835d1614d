use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use std::collections::BTreeMap;

use super::playout::PlayoutBuffer;
use crate::frame::{AudioCodec, AudioFrame};
use crate::types::UserId;

/// Saturating sum of 16-bit PCM frames that share the output format
///
/// Frames in another format are skipped; resampling belongs to the codec
/// layer. Returns `None` when nothing matched.
#[must_use]
pub fn mix_pcm(frames: &[&AudioFrame], sample_rate: u32, channels: u16, pts: u32) -> Option<AudioFrame> {
    let inputs: Vec<&AudioFrame> = frames
        .iter()
        .copied()
        .filter(|f| f.codec == AudioCodec::Pcm && f.sample_rate == sample_rate && f.channels == channels)
        .collect();
    let len = inputs.iter().map(|f| f.data.len() & !1).max()?;

    let mut acc = vec![0i32; len / 2];
    for frame in &inputs {
        for (i, sample) in frame.data.chunks_exact(2).enumerate() {
            acc[i] += i32::from(LittleEndian::read_i16(sample));
        }
    }

    let mut out = vec![0u8; len];
    for (i, value) in acc.into_iter().enumerate() {
        let clamped = value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        LittleEndian::write_i16(&mut out[i * 2..i * 2 + 2], clamped);
    }
    Some(AudioFrame::pcm(Bytes::from(out), sample_rate, channels, pts))
}

/// Mixes several users' audio on a fixed cadence
///
/// Each input is re-chunked to the mix frame length; every tick takes at
/// most one frame from each user.
pub struct AudioMixer {
    sample_rate: u32,
    channels: u16,
    frame_ms: u32,
    capacity_ms: u32,
    inputs: BTreeMap<UserId, PlayoutBuffer>,
    next_pts: u32,
}

impl AudioMixer {
    #[must_use]
    pub fn new(sample_rate: u32, channels: u16, frame_ms: u32, capacity_ms: u32) -> Self {
        Self {
            sample_rate,
            channels,
            frame_ms,
            capacity_ms,
            inputs: BTreeMap::new(),
            next_pts: 0,
        }
    }

    pub fn push(&mut self, user_id: &UserId, frame: AudioFrame) {
        let (frame_ms, capacity_ms) = (self.frame_ms, self.capacity_ms);
        self.inputs
            .entry(user_id.clone())
            .or_insert_with(|| PlayoutBuffer::new(frame_ms, capacity_ms))
            .push(frame);
    }

    pub fn remove(&mut self, user_id: &UserId) {
        self.inputs.remove(user_id);
    }

    /// Produce the next mixed frame, or `None` when no input had audio
    ///
    /// Every call is one tick of the output clock, silent or not.
    pub fn mix_next(&mut self) -> Option<AudioFrame> {
        let pts = self.next_pts;
        self.next_pts = self.next_pts.wrapping_add(self.frame_ms);
        let frames: Vec<AudioFrame> = self.inputs.values_mut().filter_map(PlayoutBuffer::pop).collect();
        if frames.is_empty() {
            return None;
        }
        let refs: Vec<&AudioFrame> = frames.iter().collect();
        mix_pcm(&refs, self.sample_rate, self.channels, pts)
    }

    #[must_use]
    pub const fn frame_ms(&self) -> u32 {
        self.frame_ms
    }
}
