use bytes::BytesMut;
use std::collections::VecDeque;

use crate::frame::{AudioCodec, AudioFrame};

/// Re-chunks one remote user's audio into fixed-length frames for pull
///
/// PCM input is concatenated and cut into `frame_ms` pieces; encoded input
/// is queued frame by frame. The buffer holds at most `capacity_ms` of
/// audio and drops the oldest frames beyond that, which bounds playback
/// latency when the puller falls behind.
#[derive(Debug)]
pub struct PlayoutBuffer {
    frame_ms: u32,
    max_frames: usize,
    format: Option<(u32, u16)>,
    pending: BytesMut,
    pending_pts: u32,
    ready: VecDeque<AudioFrame>,
    dropped: u64,
}

impl PlayoutBuffer {
    #[must_use]
    pub fn new(frame_ms: u32, capacity_ms: u32) -> Self {
        let frame_ms = frame_ms.max(1);
        Self {
            frame_ms,
            max_frames: (capacity_ms / frame_ms).max(1) as usize,
            format: None,
            pending: BytesMut::new(),
            pending_pts: 0,
            ready: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, frame: AudioFrame) {
        if frame.codec != AudioCodec::Pcm {
            self.ready.push_back(frame);
            self.trim();
            return;
        }

        let format = (frame.sample_rate, frame.channels);
        if self.format != Some(format) {
            self.pending.clear();
            self.format = Some(format);
        }
        if self.pending.is_empty() {
            self.pending_pts = frame.pts;
        }
        self.pending.extend_from_slice(&frame.data);

        let chunk = AudioFrame::pcm_bytes_for(format.0, format.1, self.frame_ms);
        if chunk == 0 {
            return;
        }
        while self.pending.len() >= chunk {
            let data = self.pending.split_to(chunk).freeze();
            self.ready
                .push_back(AudioFrame::pcm(data, format.0, format.1, self.pending_pts));
            self.pending_pts = self.pending_pts.wrapping_add(self.frame_ms);
        }
        self.trim();
    }

    fn trim(&mut self) {
        while self.ready.len() > self.max_frames {
            self.ready.pop_front();
            self.dropped += 1;
        }
    }

    pub fn pop(&mut self) -> Option<AudioFrame> {
        self.ready.pop_front()
    }

    #[must_use]
    pub fn ready_frames(&self) -> usize {
        self.ready.len()
    }

    #[must_use]
    pub const fn dropped_frames(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pcm(samples: usize, pts: u32) -> AudioFrame {
        AudioFrame::pcm(Bytes::from(vec![1u8; samples * 2]), 16_000, 1, pts)
    }

    #[test]
    fn test_rechunks_to_frame_length() {
        let mut buffer = PlayoutBuffer::new(20, 500);
        assert!(buffer.pop().is_none());

        // 10 ms then 30 ms of 16 kHz mono
        buffer.push(pcm(160, 0));
        assert!(buffer.pop().is_none());
        buffer.push(pcm(480, 10));

        let first = buffer.pop().unwrap();
        assert_eq!(first.data.len(), 640);
        assert_eq!(first.pts, 0);
        let second = buffer.pop().unwrap();
        assert_eq!(second.pts, 20);
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut buffer = PlayoutBuffer::new(20, 60);
        for i in 0..5 {
            buffer.push(pcm(320, i * 20));
        }
        assert_eq!(buffer.ready_frames(), 3);
        assert_eq!(buffer.dropped_frames(), 2);
        assert_eq!(buffer.pop().unwrap().pts, 40);
    }

    #[test]
    fn test_encoded_frames_are_queued_whole() {
        let mut buffer = PlayoutBuffer::new(20, 500);
        let mut frame = pcm(10, 7);
        frame.codec = AudioCodec::Opus;
        buffer.push(frame.clone());
        assert_eq!(buffer.pop(), Some(frame));
    }
}
