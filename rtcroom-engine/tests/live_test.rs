// Live push and pull over the in-memory transport

mod common;

use bytes::Bytes;
use common::{config, wait_until};
use parking_lot::Mutex;
use rtcroom_engine::{
    ChannelKey, EngineError, ErrorCode, Frame, LiveDelegate, LivePlayer, LivePusher, MemoryTransport, PlayerOption,
    PushOption, StreamType, VideoCodec, VideoFrame,
};
use std::sync::Arc;

const PUSH_URL: &str = "trtc://live.example.com/push/stream-7?sdkappid=1400&userid=anchor&usersig=sig";
const PLAY_URL: &str = "webrtc://live.example.com/play/stream-7?sdkappid=1400&userid=viewer&usersig=sig";

#[derive(Default)]
struct LiveSpy {
    video: Mutex<Vec<VideoFrame>>,
    errors: Mutex<Vec<ErrorCode>>,
}

impl LiveDelegate for LiveSpy {
    fn on_error(&self, error: &EngineError) {
        self.errors.lock().push(error.code());
    }

    fn on_remote_video_received(&self, frame: &VideoFrame) {
        self.video.lock().push(frame.clone());
    }
}

fn video(pts: u32, payload: &'static [u8]) -> VideoFrame {
    VideoFrame::new(Bytes::from_static(payload), VideoCodec::H264, pts, pts == 0)
}

#[tokio::test]
async fn test_pusher_opens_channels_once_admitted() {
    let (transport, remote) = MemoryTransport::new();
    let spy = Arc::new(LiveSpy::default());
    let pusher = LivePusher::new(Arc::new(config()), transport, spy.clone());

    pusher.start_push(PUSH_URL, PushOption::default()).unwrap();
    assert!(pusher.is_pushing());
    assert!(matches!(
        pusher.start_push(PUSH_URL, PushOption::default()),
        Err(EngineError::InvalidOperation(_))
    ));

    let audio = ChannelKey::send(StreamType::Audio);
    let high = ChannelKey::send(StreamType::VideoHigh);
    wait_until("push channels", || remote.is_open(&audio) && remote.is_open(&high)).await;
    let room = pusher.session().active_room().unwrap();
    assert_eq!(room.room.to_string(), "stream-7");

    pusher.send_video_frame(video(0, b"idr")).unwrap();
    pusher.send_sei_message(5, Bytes::from_static(b"cue")).unwrap();
    wait_until("pushed media", || remote.sent_count() == 2).await;

    pusher.stop_push().unwrap();
    wait_until("push stopped", || !pusher.is_pushing()).await;
    assert!(spy.errors.lock().is_empty());
}

#[tokio::test]
async fn test_push_rejects_bad_urls_without_entering() {
    let (transport, _remote) = MemoryTransport::new();
    let pusher = LivePusher::new(Arc::new(config()), transport, Arc::new(LiveSpy::default()));

    let err = pusher
        .start_push("trtc://live.example.com/push/stream-7?userid=anchor&usersig=sig", PushOption::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSdkAppId);
    let err = pusher
        .start_push("ftp://live.example.com/stream-7", PushOption::default())
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);
    assert!(!pusher.is_pushing());
}

#[tokio::test]
async fn test_player_forwards_only_the_publisher() {
    let (transport, remote) = MemoryTransport::new();
    let spy = Arc::new(LiveSpy::default());
    let player = LivePlayer::new(Arc::new(config()), transport, spy.clone());

    player.start_play(PLAY_URL, PlayerOption::default()).unwrap();
    let mut state = player.session().watch_state();
    state
        .wait_for(|s| *s == rtcroom_engine::ConnectionState::Connected)
        .await
        .unwrap();

    remote.user_entered("anchor");
    remote.stream_available("anchor", StreamType::VideoHigh, true);
    let key = ChannelKey::receive("anchor", StreamType::VideoHigh);
    let session = player.session().clone();
    wait_until("anchor video", move || {
        session.channel_state(&key) == rtcroom_engine::ChannelState::Ready
    })
    .await;
    remote.media("anchor", StreamType::VideoHigh, Frame::Video(video(0, b"anchor")));
    wait_until("anchor frame", || spy.video.lock().len() == 1).await;

    remote.user_entered("guest");
    remote.stream_available("guest", StreamType::VideoHigh, true);
    let key = ChannelKey::receive("guest", StreamType::VideoHigh);
    let session = player.session().clone();
    wait_until("guest video", move || {
        session.channel_state(&key) == rtcroom_engine::ChannelState::Ready
    })
    .await;
    remote.media("guest", StreamType::VideoHigh, Frame::Video(video(0, b"guest")));
    remote.media("anchor", StreamType::VideoHigh, Frame::Video(video(40, b"anchor")));
    wait_until("second anchor frame", || spy.video.lock().len() == 2).await;

    let payloads: Vec<Bytes> = spy.video.lock().iter().map(|f| f.data.clone()).collect();
    assert_eq!(payloads, vec![Bytes::from_static(b"anchor"), Bytes::from_static(b"anchor")]);

    // audience cannot publish
    assert!(matches!(
        player.session().create_local_video_channel(StreamType::VideoHigh),
        Err(EngineError::InvalidOperation(_))
    ));
    player.stop_play().unwrap();
}
