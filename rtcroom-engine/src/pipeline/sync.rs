use std::collections::{HashMap, VecDeque};

use crate::frame::{AudioFrame, Frame};
use crate::types::{StreamType, UserId};

/// A frame released by [`AvSync`], in delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncedFrame {
    Audio(UserId, AudioFrame),
    /// Encoded or decoded video of a main (high/low) stream
    Video(UserId, StreamType, Frame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrack {
    Audio,
    Video,
}

#[derive(Default)]
struct Queues {
    audio: VecDeque<AudioFrame>,
    video: VecDeque<(StreamType, Frame)>,
    audio_active: bool,
    video_active: bool,
}

/// `a` is not later than `b`, tolerating 32-bit wrap-around
fn not_after(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) >= 0
}

/// Per-participant A/V interleaver
///
/// Audio and main video of one participant are released in presentation
/// timestamp order. While both tracks are active a frame is held until the
/// other track catches up or it has waited longer than the window (measured
/// in media time on its own track). A track whose counterpart is inactive
/// passes straight through.
pub struct AvSync {
    window_ms: u32,
    participants: HashMap<UserId, Queues>,
}

impl AvSync {
    #[must_use]
    pub fn new(window_ms: u32) -> Self {
        Self {
            window_ms,
            participants: HashMap::new(),
        }
    }

    pub fn set_active(&mut self, user_id: &UserId, track: SyncTrack, active: bool) -> Vec<SyncedFrame> {
        let queues = self.participants.entry(user_id.clone()).or_default();
        match track {
            SyncTrack::Audio => queues.audio_active = active,
            SyncTrack::Video => queues.video_active = active,
        }
        if !active {
            // frames of a stopped track are no longer worth waiting for
            match track {
                SyncTrack::Audio => queues.audio.clear(),
                SyncTrack::Video => queues.video.clear(),
            }
        }
        self.drain(user_id)
    }

    pub fn push_audio(&mut self, user_id: &UserId, frame: AudioFrame) -> Vec<SyncedFrame> {
        self.participants
            .entry(user_id.clone())
            .or_default()
            .audio
            .push_back(frame);
        self.drain(user_id)
    }

    pub fn push_video(&mut self, user_id: &UserId, stream_type: StreamType, frame: Frame) -> Vec<SyncedFrame> {
        self.participants
            .entry(user_id.clone())
            .or_default()
            .video
            .push_back((stream_type, frame));
        self.drain(user_id)
    }

    /// Release everything held for a user and forget them
    pub fn remove(&mut self, user_id: &UserId) -> Vec<SyncedFrame> {
        let Some(mut queues) = self.participants.remove(user_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        loop {
            let take_audio = match (queues.audio.front(), queues.video.front()) {
                (Some(a), Some((_, v))) => not_after(a.pts, v.pts()),
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            Self::pop(user_id, &mut queues, take_audio, &mut out);
        }
        out
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    #[must_use]
    pub fn held(&self, user_id: &UserId) -> usize {
        self.participants
            .get(user_id)
            .map_or(0, |q| q.audio.len() + q.video.len())
    }

    fn drain(&mut self, user_id: &UserId) -> Vec<SyncedFrame> {
        let window = self.window_ms;
        let mut out = Vec::new();
        let Some(queues) = self.participants.get_mut(user_id) else {
            return out;
        };

        loop {
            let take_audio = match (queues.audio.front(), queues.video.front()) {
                (Some(a), Some((_, v))) => not_after(a.pts, v.pts()),
                (Some(a), None) => {
                    let newest = queues.audio.back().map_or(a.pts, |f| f.pts);
                    if queues.video_active && newest.wrapping_sub(a.pts) < window {
                        break;
                    }
                    true
                }
                (None, Some((_, v))) => {
                    let newest = queues.video.back().map_or(v.pts(), |(_, f)| f.pts());
                    if queues.audio_active && newest.wrapping_sub(v.pts()) < window {
                        break;
                    }
                    false
                }
                (None, None) => break,
            };
            Self::pop(user_id, queues, take_audio, &mut out);
        }
        out
    }

    fn pop(user_id: &UserId, queues: &mut Queues, audio: bool, out: &mut Vec<SyncedFrame>) {
        if audio {
            if let Some(frame) = queues.audio.pop_front() {
                out.push(SyncedFrame::Audio(user_id.clone(), frame));
            }
        } else if let Some((stream_type, frame)) = queues.video.pop_front() {
            out.push(SyncedFrame::Video(user_id.clone(), stream_type, frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{VideoCodec, VideoFrame};
    use bytes::Bytes;

    fn audio(pts: u32) -> AudioFrame {
        AudioFrame::pcm(Bytes::from(vec![0u8; 4]), 16_000, 1, pts)
    }

    fn video(pts: u32) -> Frame {
        Frame::Video(VideoFrame::new(Bytes::from_static(b"v"), VideoCodec::H264, pts, false))
    }

    fn pts_of(frames: &[SyncedFrame]) -> Vec<u32> {
        frames
            .iter()
            .map(|f| match f {
                SyncedFrame::Audio(_, a) => a.pts,
                SyncedFrame::Video(_, _, v) => v.pts(),
            })
            .collect()
    }

    #[test]
    fn test_single_track_passes_through() {
        let mut sync = AvSync::new(200);
        let user = UserId::from("u");
        sync.set_active(&user, SyncTrack::Audio, true);
        assert_eq!(pts_of(&sync.push_audio(&user, audio(0))), vec![0]);
        assert_eq!(pts_of(&sync.push_audio(&user, audio(20))), vec![20]);
    }

    #[test]
    fn test_interleaves_by_pts() {
        let mut sync = AvSync::new(200);
        let user = UserId::from("u");
        sync.set_active(&user, SyncTrack::Audio, true);
        sync.set_active(&user, SyncTrack::Video, true);

        assert!(sync.push_video(&user, StreamType::VideoHigh, video(40)).is_empty());
        assert_eq!(pts_of(&sync.push_audio(&user, audio(0))), vec![0]);
        assert_eq!(pts_of(&sync.push_audio(&user, audio(20))), vec![20]);
        // audio at 60 releases the video frame at 40 first
        assert_eq!(pts_of(&sync.push_audio(&user, audio(60))), vec![40]);
        assert_eq!(sync.held(&user), 1);
    }

    #[test]
    fn test_window_bounds_the_wait() {
        let mut sync = AvSync::new(100);
        let user = UserId::from("u");
        sync.set_active(&user, SyncTrack::Audio, true);
        sync.set_active(&user, SyncTrack::Video, true);

        assert!(sync.push_video(&user, StreamType::VideoHigh, video(0)).is_empty());
        assert!(sync.push_video(&user, StreamType::VideoHigh, video(66)).is_empty());
        assert_eq!(pts_of(&sync.push_video(&user, StreamType::VideoHigh, video(133))), vec![0]);
        assert_eq!(pts_of(&sync.push_video(&user, StreamType::VideoHigh, video(200))), vec![66]);
    }

    #[test]
    fn test_deactivating_counterpart_releases_held_frames() {
        let mut sync = AvSync::new(200);
        let user = UserId::from("u");
        sync.set_active(&user, SyncTrack::Audio, true);
        sync.set_active(&user, SyncTrack::Video, true);
        sync.push_audio(&user, audio(0));
        assert_eq!(pts_of(&sync.set_active(&user, SyncTrack::Video, false)), vec![0]);
    }

    #[test]
    fn test_remove_flushes_in_order() {
        let mut sync = AvSync::new(1_000);
        let user = UserId::from("u");
        sync.set_active(&user, SyncTrack::Audio, true);
        sync.set_active(&user, SyncTrack::Video, true);
        sync.push_video(&user, StreamType::VideoHigh, video(30));
        sync.push_video(&user, StreamType::VideoHigh, video(60));
        assert_eq!(pts_of(&sync.remove(&user)), vec![30, 60]);
        assert_eq!(sync.held(&user), 0);
    }
}
