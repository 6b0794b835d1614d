// Shared fixtures for the engine integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use rtcroom_core::Config;
use rtcroom_engine::{
    AudioFrame, ChannelDelegate, ConnectionDelegate, ConnectionState, Delegates, EngineError, EnterRoomParams,
    ErrorCode, ErrorDelegate, MediaDelegate, MemoryTransport, MemoryTransportHandle, MembershipDelegate,
    QualityDelegate, QualityReport, RoomParams, RoomSession, Scene, SeiMessage, StreamType, UserId, VideoFrame,
};
use std::sync::Arc;
use std::time::Duration;

/// Records every callback it receives
#[derive(Default)]
pub struct Spy {
    pub events: Mutex<Vec<String>>,
    pub errors: Mutex<Vec<ErrorCode>>,
    pub audio: Mutex<Vec<(UserId, AudioFrame)>>,
    pub mixed: Mutex<Vec<AudioFrame>>,
    pub video: Mutex<Vec<(UserId, StreamType, VideoFrame)>>,
    pub sei: Mutex<Vec<(UserId, SeiMessage)>>,
    pub quality: Mutex<Vec<QualityReport>>,
    pub bitrate: Mutex<Vec<(StreamType, u32)>>,
}

impl Spy {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn has(&self, event: &str) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }
}

impl ConnectionDelegate for Spy {
    fn on_connection_state_changed(&self, old: ConnectionState, new: ConnectionState) {
        self.push(format!("state:{old:?}->{new:?}"));
    }

    fn on_enter_room(&self) {
        self.push("enter");
    }

    fn on_exit_room(&self) {
        self.push("exit");
    }
}

impl MembershipDelegate for Spy {
    fn on_remote_user_enter_room(&self, user_id: &UserId) {
        self.push(format!("user_enter:{user_id}"));
    }

    fn on_remote_user_exit_room(&self, user_id: &UserId) {
        self.push(format!("user_exit:{user_id}"));
    }
}

impl ChannelDelegate for Spy {
    fn on_local_audio_channel_created(&self) {
        self.push("audio_created");
    }

    fn on_local_audio_channel_destroyed(&self) {
        self.push("audio_destroyed");
    }

    fn on_local_video_channel_created(&self, stream_type: StreamType) {
        self.push(format!("video_created:{stream_type}"));
    }

    fn on_local_video_channel_destroyed(&self, stream_type: StreamType) {
        self.push(format!("video_destroyed:{stream_type}"));
    }
}

impl MediaDelegate for Spy {
    fn on_remote_video_received(&self, user_id: &UserId, stream_type: StreamType, frame: &VideoFrame) {
        self.video.lock().push((user_id.clone(), stream_type, frame.clone()));
    }

    fn on_remote_audio_received(&self, user_id: &UserId, frame: &AudioFrame) {
        self.audio.lock().push((user_id.clone(), frame.clone()));
    }

    fn on_remote_mixed_audio_received(&self, frame: &AudioFrame) {
        self.mixed.lock().push(frame.clone());
    }

    fn on_sei_message_received(&self, user_id: &UserId, _stream_type: StreamType, message: &SeiMessage) {
        self.sei.lock().push((user_id.clone(), message.clone()));
    }
}

impl QualityDelegate for Spy {
    fn on_network_quality(&self, report: &QualityReport) {
        self.quality.lock().push(report.clone());
    }

    fn on_request_change_video_encode_bitrate(&self, stream_type: StreamType, bitrate_bps: u32) {
        self.bitrate.lock().push((stream_type, bitrate_bps));
    }
}

impl ErrorDelegate for Spy {
    fn on_error(&self, error: &EngineError) {
        self.errors.lock().push(error.code());
    }
}

/// Defaults with fast reconnection
pub fn config() -> Config {
    let mut config = Config::default();
    config.session.reconnect_min_delay_ms = 5;
    config.session.reconnect_max_delay_ms = 10;
    config.session.reconnect_max_attempts = 3;
    config
}

pub struct Fixture {
    pub session: RoomSession,
    pub remote: MemoryTransportHandle,
    pub spy: Arc<Spy>,
}

pub fn fixture_with(config: Config) -> Fixture {
    let (transport, remote) = MemoryTransport::new();
    let spy = Arc::new(Spy::default());
    let session = RoomSession::new(Arc::new(config), transport, Delegates::all(spy.clone()));
    Fixture { session, remote, spy }
}

pub fn fixture() -> Fixture {
    fixture_with(config())
}

pub fn room_params(user_id: &str) -> EnterRoomParams {
    EnterRoomParams::new(RoomParams::numeric(1400, user_id, "sig", 5))
}

/// Poll `check` until it holds, panicking after two seconds
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

impl Fixture {
    pub async fn enter(&self, scene: Scene) {
        self.session
            .enter_room(room_params("alice").with_scene(scene))
            .unwrap();
        self.wait_connected().await;
    }

    pub async fn wait_connected(&self) {
        let mut state = self.session.watch_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .expect("timed out entering the room")
            .expect("session dropped");
    }

    /// Announce a remote user with the given streams available
    pub async fn remote_user(&self, user_id: &str, streams: &[StreamType]) {
        self.remote.user_entered(user_id);
        for stream_type in streams {
            self.remote.stream_available(user_id, *stream_type, true);
        }
        let user = UserId::new(user_id);
        for stream_type in streams {
            let key = rtcroom_engine::ChannelKey::Receive(user.clone(), *stream_type);
            let session = self.session.clone();
            wait_until("receive channel", move || {
                session.channel_state(&key) == rtcroom_engine::ChannelState::Ready
            })
            .await;
        }
    }
}

pub fn pcm_20ms(pts: u32) -> AudioFrame {
    AudioFrame::pcm(bytes::Bytes::from(vec![1u8; 640]), 16_000, 1, pts)
}
