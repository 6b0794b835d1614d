//! Callback capabilities, one trait per event family
//!
//! Every method has a no-op default so an implementation only overrides
//! what it cares about. All callbacks of one room are invoked from that
//! room's delivery task, never concurrently with each other, so they must
//! return quickly.

use std::sync::Arc;

use crate::error::EngineError;
use crate::frame::{AudioFrame, PixelFrame, SeiMessage, VideoFrame};
use crate::quality::QualityReport;
use crate::types::{ConnectionState, StreamType, UserId};

pub trait ConnectionDelegate: Send + Sync {
    fn on_connection_state_changed(&self, _old: ConnectionState, _new: ConnectionState) {}
    fn on_enter_room(&self) {}
    fn on_exit_room(&self) {}
}

pub trait MembershipDelegate: Send + Sync {
    fn on_remote_user_enter_room(&self, _user_id: &UserId) {}
    fn on_remote_user_exit_room(&self, _user_id: &UserId) {}
    fn on_remote_audio_available(&self, _user_id: &UserId, _available: bool) {}
    fn on_remote_video_available(&self, _user_id: &UserId, _stream_type: StreamType, _available: bool) {}
}

/// Completion of local channel create/destroy requests
pub trait ChannelDelegate: Send + Sync {
    fn on_local_audio_channel_created(&self) {}
    fn on_local_audio_channel_destroyed(&self) {}
    fn on_local_video_channel_created(&self, _stream_type: StreamType) {}
    fn on_local_video_channel_destroyed(&self, _stream_type: StreamType) {}
}

/// Push-style delivery of remote media
pub trait MediaDelegate: Send + Sync {
    fn on_remote_video_received(&self, _user_id: &UserId, _stream_type: StreamType, _frame: &VideoFrame) {}
    fn on_remote_pixel_frame_received(&self, _user_id: &UserId, _stream_type: StreamType, _frame: &PixelFrame) {}
    /// Record scene only; other scenes pull audio with `get_audio_frame`
    fn on_remote_audio_received(&self, _user_id: &UserId, _frame: &AudioFrame) {}
    /// Record scene with remote audio mixing enabled
    fn on_remote_mixed_audio_received(&self, _frame: &AudioFrame) {}
    fn on_sei_message_received(&self, _user_id: &UserId, _stream_type: StreamType, _message: &SeiMessage) {}
}

pub trait QualityDelegate: Send + Sync {
    fn on_network_quality(&self, _report: &QualityReport) {}
    /// Advisory: the engine never throttles encoded video itself
    fn on_request_change_video_encode_bitrate(&self, _stream_type: StreamType, _bitrate_bps: u32) {}
}

pub trait ErrorDelegate: Send + Sync {
    fn on_error(&self, _error: &EngineError) {}
}

/// Delegate that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

impl ConnectionDelegate for NoopDelegate {}
impl MembershipDelegate for NoopDelegate {}
impl ChannelDelegate for NoopDelegate {}
impl MediaDelegate for NoopDelegate {}
impl QualityDelegate for NoopDelegate {}
impl ErrorDelegate for NoopDelegate {}

/// The set of delegates registered with a session
#[derive(Clone)]
pub struct Delegates {
    pub connection: Arc<dyn ConnectionDelegate>,
    pub membership: Arc<dyn MembershipDelegate>,
    pub channel: Arc<dyn ChannelDelegate>,
    pub media: Arc<dyn MediaDelegate>,
    pub quality: Arc<dyn QualityDelegate>,
    pub error: Arc<dyn ErrorDelegate>,
}

impl Default for Delegates {
    fn default() -> Self {
        let noop = Arc::new(NoopDelegate);
        Self {
            connection: noop.clone(),
            membership: noop.clone(),
            channel: noop.clone(),
            media: noop.clone(),
            quality: noop.clone(),
            error: noop,
        }
    }
}

impl std::fmt::Debug for Delegates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegates").finish_non_exhaustive()
    }
}

impl Delegates {
    /// Register one object for every event family
    pub fn all<T>(delegate: Arc<T>) -> Self
    where
        T: ConnectionDelegate
            + MembershipDelegate
            + ChannelDelegate
            + MediaDelegate
            + QualityDelegate
            + ErrorDelegate
            + 'static,
    {
        Self {
            connection: delegate.clone(),
            membership: delegate.clone(),
            channel: delegate.clone(),
            media: delegate.clone(),
            quality: delegate.clone(),
            error: delegate,
        }
    }
}
