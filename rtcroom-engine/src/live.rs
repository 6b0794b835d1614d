//! One-way live push and pull
//!
//! A push is a room session entered as anchor with one audio and one video
//! send channel; a play is a session entered as audience that forwards the
//! media of the room's single publisher. The stream id of the URL is used
//! as the string room id.

use bytes::Bytes;
use parking_lot::Mutex;
use rtcroom_core::Config;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::codec::CodecFactory;
use crate::delegate::{
    ChannelDelegate, ConnectionDelegate, Delegates, ErrorDelegate, MediaDelegate, MembershipDelegate,
    QualityDelegate,
};
use crate::error::{EngineError, EngineResult};
use crate::frame::{AudioFrame, PixelFrame, SeiMessage, VideoFrame};
use crate::params::{AudioEncodeParams, EnterRoomParams, RecordConfig, Role, RoomParams, Scene};
use crate::quality::{NetworkQuality, QualityReport};
use crate::session::RoomSession;
use crate::transport::RoomTransport;
use crate::types::{ConnectionState, StreamType, UserId};

const LIVE_SCHEMES: [&str; 5] = ["trtc", "rtmp", "webrtc", "http", "https"];

/// Identity and stream carried by a live URL
///
/// `trtc://host/live/<stream>?sdkappid=1400&userid=alice&usersig=...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTarget {
    pub sdk_app_id: u32,
    pub user_id: String,
    pub user_sig: String,
    pub stream_id: String,
}

impl LiveTarget {
    pub fn parse(url: &str) -> EngineResult<Self> {
        let url = Url::parse(url).map_err(|e| EngineError::invalid_parameter(format!("bad live url: {e}")))?;
        if !LIVE_SCHEMES.contains(&url.scheme()) {
            return Err(EngineError::invalid_parameter(format!(
                "unsupported live url scheme {}",
                url.scheme()
            )));
        }

        let stream_id = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .ok_or_else(|| EngineError::InvalidRoomId("live url has no stream id".to_string()))?;

        let mut sdk_app_id = None;
        let mut user_id = None;
        let mut user_sig = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sdkappid" => sdk_app_id = value.parse::<u32>().ok(),
                "userid" => user_id = Some(value.into_owned()),
                "usersig" => user_sig = Some(value.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            sdk_app_id: sdk_app_id.ok_or(EngineError::InvalidSdkAppId)?,
            user_id: user_id.ok_or_else(|| EngineError::InvalidUserId("live url has no userid".to_string()))?,
            user_sig: user_sig.ok_or(EngineError::InvalidUserSig)?,
            stream_id,
        })
    }

    fn room_params(&self) -> RoomParams {
        RoomParams::named(
            self.sdk_app_id,
            self.user_id.clone(),
            self.user_sig.clone(),
            self.stream_id.clone(),
        )
    }
}

/// Events of a live pusher or player
pub trait LiveDelegate: Send + Sync {
    fn on_error(&self, _error: &EngineError) {}
    fn on_network_quality(&self, _quality: NetworkQuality) {}
    fn on_remote_audio_received(&self, _frame: &AudioFrame) {}
    fn on_remote_video_received(&self, _frame: &VideoFrame) {}
    fn on_remote_pixel_frame_received(&self, _frame: &PixelFrame) {}
    fn on_sei_message_received(&self, _message: &SeiMessage) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOption {
    pub video_type: StreamType,
    pub audio: AudioEncodeParams,
}

impl Default for PushOption {
    fn default() -> Self {
        Self {
            video_type: StreamType::VideoHigh,
            audio: AudioEncodeParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerOption {
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    pub video_type: StreamType,
    /// Deliver decoded pictures instead of encoded video
    pub pixel_output: bool,
}

impl Default for PlayerOption {
    fn default() -> Self {
        Self {
            audio_sample_rate: 48_000,
            audio_channels: 1,
            video_type: StreamType::VideoHigh,
            pixel_output: false,
        }
    }
}

/// Adapts session callbacks to a [`LiveDelegate`]
struct LiveBridge {
    delegate: Arc<dyn LiveDelegate>,
    video_type: Mutex<StreamType>,
    publisher: Mutex<Option<UserId>>,
}

impl LiveBridge {
    fn new(delegate: Arc<dyn LiveDelegate>) -> Self {
        Self {
            delegate,
            video_type: Mutex::new(StreamType::VideoHigh),
            publisher: Mutex::new(None),
        }
    }

    /// The first remote user seen is the publisher until they leave
    fn accept(&self, user_id: &UserId) -> bool {
        let mut publisher = self.publisher.lock();
        match publisher.as_ref() {
            Some(current) => current == user_id,
            None => {
                debug!(user_id = %user_id, "Live publisher selected");
                *publisher = Some(user_id.clone());
                true
            }
        }
    }

    fn wants_video(&self, user_id: &UserId, stream_type: StreamType) -> bool {
        stream_type == *self.video_type.lock() && self.accept(user_id)
    }
}

impl ConnectionDelegate for LiveBridge {}
impl ChannelDelegate for LiveBridge {}

impl MembershipDelegate for LiveBridge {
    fn on_remote_user_exit_room(&self, user_id: &UserId) {
        let mut publisher = self.publisher.lock();
        if publisher.as_ref() == Some(user_id) {
            *publisher = None;
        }
    }
}

impl MediaDelegate for LiveBridge {
    fn on_remote_video_received(&self, user_id: &UserId, stream_type: StreamType, frame: &VideoFrame) {
        if self.wants_video(user_id, stream_type) {
            self.delegate.on_remote_video_received(frame);
        }
    }

    fn on_remote_pixel_frame_received(&self, user_id: &UserId, stream_type: StreamType, frame: &PixelFrame) {
        if self.wants_video(user_id, stream_type) {
            self.delegate.on_remote_pixel_frame_received(frame);
        }
    }

    fn on_remote_audio_received(&self, user_id: &UserId, frame: &AudioFrame) {
        if self.accept(user_id) {
            self.delegate.on_remote_audio_received(frame);
        }
    }

    fn on_sei_message_received(&self, user_id: &UserId, _stream_type: StreamType, message: &SeiMessage) {
        if self.accept(user_id) {
            self.delegate.on_sei_message_received(message);
        }
    }
}

impl QualityDelegate for LiveBridge {
    fn on_network_quality(&self, report: &QualityReport) {
        self.delegate.on_network_quality(report.quality);
    }
}

impl ErrorDelegate for LiveBridge {
    fn on_error(&self, error: &EngineError) {
        self.delegate.on_error(error);
    }
}

fn build_session(
    config: Arc<Config>,
    transport: Arc<dyn RoomTransport>,
    bridge: &Arc<LiveBridge>,
    codecs: Option<Arc<dyn CodecFactory>>,
) -> RoomSession {
    let delegates = Delegates::all(bridge.clone());
    match codecs {
        Some(codecs) => RoomSession::with_codecs(config, transport, delegates, codecs),
        None => RoomSession::new(config, transport, delegates),
    }
}

const fn is_active(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Connecting | ConnectionState::Connected)
}

/// Publishes local media to a live stream
pub struct LivePusher {
    session: RoomSession,
    bridge: Arc<LiveBridge>,
    option: Mutex<PushOption>,
}

impl LivePusher {
    pub fn new(config: Arc<Config>, transport: Arc<dyn RoomTransport>, delegate: Arc<dyn LiveDelegate>) -> Self {
        Self::build(config, transport, delegate, None)
    }

    /// Pusher that accepts raw pixel frames
    pub fn with_codecs(
        config: Arc<Config>,
        transport: Arc<dyn RoomTransport>,
        delegate: Arc<dyn LiveDelegate>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        Self::build(config, transport, delegate, Some(codecs))
    }

    fn build(
        config: Arc<Config>,
        transport: Arc<dyn RoomTransport>,
        delegate: Arc<dyn LiveDelegate>,
        codecs: Option<Arc<dyn CodecFactory>>,
    ) -> Self {
        let bridge = Arc::new(LiveBridge::new(delegate));
        Self {
            session: build_session(config, transport, &bridge, codecs),
            bridge,
            option: Mutex::new(PushOption::default()),
        }
    }

    /// Enter the stream's room; channels are created once admitted
    pub fn start_push(&self, url: &str, option: PushOption) -> EngineResult<()> {
        if self.is_pushing() {
            return Err(EngineError::invalid_operation("already pushing"));
        }
        if !option.video_type.is_video() {
            return Err(EngineError::invalid_parameter("push video type must be a video stream"));
        }
        option.audio.validate()?;
        let target = LiveTarget::parse(url)?;

        let params = EnterRoomParams {
            use_pixel_frame_input: self.session.codecs().is_some(),
            ..EnterRoomParams::new(target.room_params())
                .with_scene(Scene::Live)
                .with_role(Role::Anchor)
        };
        self.session.enter_room(params)?;
        *self.option.lock() = option.clone();
        info!(stream_id = %target.stream_id, "Live push started");

        let session = self.session.clone();
        let bridge = self.bridge.clone();
        let mut state = self.session.watch_state();
        tokio::spawn(async move {
            let admitted = state
                .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
                .await
                .is_ok_and(|s| *s == ConnectionState::Connected);
            if !admitted {
                return;
            }
            let created = session
                .create_local_audio_channel(option.audio)
                .and_then(|()| session.create_local_video_channel(option.video_type));
            if let Err(e) = created {
                warn!(error = %e, "Failed to create live push channels");
                bridge.delegate.on_error(&e);
            }
        });
        Ok(())
    }

    pub fn stop_push(&self) -> EngineResult<()> {
        self.session.exit_room()?;
        info!("Live push stopped");
        Ok(())
    }

    #[must_use]
    pub fn is_pushing(&self) -> bool {
        is_active(self.session.connection_state())
    }

    pub fn send_audio_frame(&self, frame: AudioFrame) -> EngineResult<()> {
        self.session.send_audio_frame(frame)
    }

    pub fn send_video_frame(&self, frame: VideoFrame) -> EngineResult<()> {
        let video_type = self.option.lock().video_type;
        self.session.send_video_frame(video_type, frame)
    }

    pub fn send_pixel_frame(&self, frame: PixelFrame) -> EngineResult<()> {
        let video_type = self.option.lock().video_type;
        self.session.send_pixel_frame(video_type, frame)
    }

    pub fn send_sei_message(&self, message_type: u8, payload: Bytes) -> EngineResult<()> {
        self.session.send_sei_message(message_type, payload).map(|_| ())
    }

    /// Underlying room session
    #[must_use]
    pub const fn session(&self) -> &RoomSession {
        &self.session
    }
}

/// Plays a live stream published by one remote user
pub struct LivePlayer {
    session: RoomSession,
    bridge: Arc<LiveBridge>,
}

impl LivePlayer {
    pub fn new(config: Arc<Config>, transport: Arc<dyn RoomTransport>, delegate: Arc<dyn LiveDelegate>) -> Self {
        Self::build(config, transport, delegate, None)
    }

    /// Player able to deliver decoded pictures
    pub fn with_codecs(
        config: Arc<Config>,
        transport: Arc<dyn RoomTransport>,
        delegate: Arc<dyn LiveDelegate>,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        Self::build(config, transport, delegate, Some(codecs))
    }

    fn build(
        config: Arc<Config>,
        transport: Arc<dyn RoomTransport>,
        delegate: Arc<dyn LiveDelegate>,
        codecs: Option<Arc<dyn CodecFactory>>,
    ) -> Self {
        let bridge = Arc::new(LiveBridge::new(delegate));
        Self {
            session: build_session(config, transport, &bridge, codecs),
            bridge,
        }
    }

    /// Enter the stream's room as audience
    ///
    /// The session runs in the record scene so remote audio is pushed to
    /// the delegate in sync with video rather than buffered for pulling.
    pub fn start_play(&self, url: &str, option: PlayerOption) -> EngineResult<()> {
        if self.is_playing() {
            return Err(EngineError::invalid_operation("already playing"));
        }
        if !option.video_type.is_video() {
            return Err(EngineError::invalid_parameter("play video type must be a video stream"));
        }
        let target = LiveTarget::parse(url)?;

        let params = EnterRoomParams {
            record_config: RecordConfig {
                output_sample_rate: option.audio_sample_rate,
                output_channels: option.audio_channels,
                ..RecordConfig::default()
            },
            use_pixel_frame_output: option.pixel_output,
            ..EnterRoomParams::new(target.room_params())
                .with_scene(Scene::Record)
                .with_role(Role::Audience)
        };
        self.session.enter_room(params)?;
        *self.bridge.video_type.lock() = option.video_type;
        *self.bridge.publisher.lock() = None;
        info!(stream_id = %target.stream_id, "Live play started");
        Ok(())
    }

    pub fn stop_play(&self) -> EngineResult<()> {
        self.session.exit_room()?;
        info!("Live play stopped");
        Ok(())
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        is_active(self.session.connection_state())
    }

    /// Underlying room session
    #[must_use]
    pub const fn session(&self) -> &RoomSession {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_parse_trtc_url() {
        let target = LiveTarget::parse("trtc://cloud.example.com/live/stream_01?sdkappid=1400&userid=alice&usersig=abc")
            .unwrap();
        assert_eq!(target.sdk_app_id, 1400);
        assert_eq!(target.user_id, "alice");
        assert_eq!(target.user_sig, "abc");
        assert_eq!(target.stream_id, "stream_01");
    }

    #[test]
    fn test_parse_ignores_trailing_slash() {
        let target = LiveTarget::parse("rtmp://host/app/room9/?sdkappid=7&userid=bob&usersig=s").unwrap();
        assert_eq!(target.stream_id, "room9");
    }

    #[test]
    fn test_parse_errors_map_to_codes() {
        let cases = [
            ("ftp://host/s?sdkappid=1&userid=a&usersig=s", ErrorCode::InvalidParameter),
            ("trtc://host/?sdkappid=1&userid=a&usersig=s", ErrorCode::InvalidRoomId),
            ("trtc://host/s?sdkappid=x&userid=a&usersig=s", ErrorCode::InvalidSdkAppId),
            ("trtc://host/s?sdkappid=1&usersig=s", ErrorCode::InvalidUserId),
            ("trtc://host/s?sdkappid=1&userid=a", ErrorCode::InvalidUserSig),
            ("not a url", ErrorCode::InvalidParameter),
        ];
        for (url, code) in cases {
            assert_eq!(LiveTarget::parse(url).unwrap_err().code(), code, "{url}");
        }
    }

    #[test]
    fn test_bridge_follows_single_publisher() {
        struct Count(Mutex<usize>);
        impl LiveDelegate for Count {
            fn on_remote_audio_received(&self, _frame: &AudioFrame) {
                *self.0.lock() += 1;
            }
        }
        let count = Arc::new(Count(Mutex::new(0)));
        let bridge = LiveBridge::new(count.clone());
        let frame = AudioFrame::pcm(Bytes::from_static(&[0, 0]), 48_000, 1, 0);
        let (alice, bob) = (UserId::new("alice"), UserId::new("bob"));

        bridge.on_remote_audio_received(&alice, &frame);
        bridge.on_remote_audio_received(&bob, &frame);
        assert_eq!(*count.0.lock(), 1);

        bridge.on_remote_user_exit_room(&alice);
        bridge.on_remote_audio_received(&bob, &frame);
        assert_eq!(*count.0.lock(), 2);
    }
}
