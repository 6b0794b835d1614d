// Room session lifecycle, membership and subscription behaviour

mod common;

use common::{fixture, fixture_with, pcm_20ms, room_params, wait_until};
use rtcroom_engine::transport::TransportError;
use rtcroom_engine::{
    ChannelKey, ChannelState, ConnectionState, EngineError, EnterRoomParams, ErrorCode, Frame, RoomParams,
    Scene, StreamType, TransportEvent, UserId,
};
use std::time::Duration;

#[tokio::test]
async fn test_invalid_room_id_leaves_state_unchanged() {
    let f = fixture();
    let params = EnterRoomParams::new(RoomParams::numeric(1400, "alice", "sig", 0));
    let err = f.session.enter_room(params).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRoomId);
    assert_eq!(f.session.connection_state(), ConnectionState::Init);
    assert!(f.spy.events.lock().is_empty());

    f.enter(Scene::VideoCall).await;
    f.session.exit_room().unwrap();
    wait_until("exit", || f.session.connection_state() == ConnectionState::Disconnected).await;

    let bad_user = EnterRoomParams::new(RoomParams::numeric(1400, "", "sig", 5));
    assert_eq!(f.session.enter_room(bad_user).unwrap_err().code(), ErrorCode::InvalidUserId);
    assert_eq!(f.session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_enter_and_exit_report_in_order() {
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    assert!(f.session.active_room().is_some());

    // a second enter is refused while in the room
    assert!(matches!(
        f.session.enter_room(room_params("alice")),
        Err(EngineError::InvalidOperation(_))
    ));

    f.session.exit_room().unwrap();
    wait_until("exit callback", || f.spy.has("exit")).await;

    let events = f.spy.events.lock().clone();
    assert_eq!(
        events,
        vec![
            "state:Init->Connecting".to_string(),
            "state:Connecting->Connected".to_string(),
            "enter".to_string(),
            "state:Connected->Disconnected".to_string(),
            "exit".to_string(),
        ]
    );
    assert!(f.session.active_room().is_none());
    assert!(matches!(f.session.exit_room(), Err(EngineError::InvalidOperation(_))));
}

#[tokio::test]
async fn test_rejected_admission_reports_error() {
    let f = fixture();
    f.remote.script_connect(Err(TransportError::Rejected {
        code: ErrorCode::InvalidUserSig,
        reason: "expired".into(),
    }));
    f.session.enter_room(room_params("alice")).unwrap();

    wait_until("admission failure", || !f.spy.errors.lock().is_empty()).await;
    assert_eq!(f.spy.errors.lock()[0], ErrorCode::InvalidUserSig);
    wait_until("disconnected", || f.session.connection_state() == ConnectionState::Disconnected).await;
    assert!(!f.spy.has("enter"));
}

#[tokio::test]
async fn test_reconnect_keeps_channels_ready() {
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    f.session.create_local_video_channel(StreamType::VideoHigh).unwrap();
    let key = ChannelKey::send(StreamType::VideoHigh);
    wait_until("video channel", || f.session.channel_state(&key) == ChannelState::Ready).await;

    f.remote.script_reconnect(Err(TransportError::Transient("flaky".into())));
    f.remote.emit(TransportEvent::ConnectionLost);

    wait_until("second reconnect attempt", || f.remote.reconnect_count() >= 2).await;
    f.wait_connected().await;
    assert_eq!(f.session.channel_state(&key), ChannelState::Ready);
    assert!(f.spy.has("state:Connected->Connecting"));
    assert!(f.spy.errors.lock().is_empty());
}

#[tokio::test]
async fn test_reconnect_gives_up_after_max_attempts() {
    let mut config = common::config();
    config.session.reconnect_max_attempts = 2;
    let f = fixture_with(config);
    f.enter(Scene::VideoCall).await;

    for _ in 0..3 {
        f.remote.script_reconnect(Err(TransportError::Transient("down".into())));
    }
    f.remote.emit(TransportEvent::ConnectionLost);

    wait_until("give up", || f.session.connection_state() == ConnectionState::Disconnected).await;
    assert_eq!(f.remote.reconnect_count(), 3);
    assert_eq!(f.spy.errors.lock().as_slice(), &[ErrorCode::NetworkUnreachable]);
}

#[tokio::test]
async fn test_kicked_session_fails_without_retry() {
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    f.remote.emit(TransportEvent::Kicked(ErrorCode::BannedByServer));

    wait_until("kicked", || f.session.connection_state() == ConnectionState::Disconnected).await;
    assert_eq!(f.remote.reconnect_count(), 0);
    assert_eq!(f.spy.errors.lock().as_slice(), &[ErrorCode::BannedByServer]);
}

#[tokio::test]
async fn test_membership_is_tracked_in_join_order() {
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    f.remote_user("bob", &[StreamType::Audio]).await;
    f.remote_user("carol", &[StreamType::VideoHigh]).await;

    let users: Vec<String> = f
        .session
        .remote_participants()
        .into_iter()
        .map(|p| p.user_id.to_string())
        .collect();
    assert_eq!(users, vec!["bob", "carol"]);

    f.remote.user_left("bob");
    wait_until("bob leaves", || f.spy.has("user_exit:bob")).await;
    assert_eq!(f.session.remote_participants().len(), 1);
    let key = ChannelKey::Receive(UserId::new("bob"), StreamType::Audio);
    assert_eq!(f.session.channel_state(&key), ChannelState::Absent);
}

#[tokio::test]
async fn test_default_subscription_then_unsubscribe() {
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    // no explicit subscribe: audio is receivable by default
    f.remote_user("bob", &[StreamType::Audio]).await;

    let bob = UserId::new("bob");
    f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(0)));
    wait_until("pulled audio", || f.session.get_audio_frame(&bob).is_ok()).await;
    assert_eq!(f.session.get_audio_frame(&bob), Err(EngineError::TryAgain));

    f.session.unsubscribe(&bob, StreamType::Audio).unwrap();
    let key = ChannelKey::Receive(bob.clone(), StreamType::Audio);
    assert_ne!(f.session.channel_state(&key), ChannelState::Ready);

    f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(20)));
    wait_until("receive channel closed", || f.session.channel_state(&key) == ChannelState::Absent).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(f.session.get_audio_frame(&bob), Err(EngineError::TryAgain));

    // re-subscribing opens the channel again
    f.session.subscribe(&bob, StreamType::Audio).unwrap();
    wait_until("resubscribed", || f.session.channel_state(&key) == ChannelState::Ready).await;
    f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(40)));
    wait_until("audio after resubscribe", || f.session.get_audio_frame(&bob).is_ok()).await;
}

#[tokio::test]
async fn test_resubscribe_while_closing_reopens_the_channel() {
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    f.remote_user("bob", &[StreamType::Audio]).await;

    let bob = UserId::new("bob");
    let key = ChannelKey::Receive(bob.clone(), StreamType::Audio);
    f.session.unsubscribe(&bob, StreamType::Audio).unwrap();
    assert_eq!(f.session.channel_state(&key), ChannelState::Destroying);
    f.session.subscribe(&bob, StreamType::Audio).unwrap();

    wait_until("channel reopened", || f.session.channel_state(&key) == ChannelState::Ready).await;
    f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(0)));
    wait_until("audio after reopen", || f.session.get_audio_frame(&bob).is_ok()).await;
}

#[tokio::test]
async fn test_get_audio_frame_errors() {
    let f = fixture();
    assert!(matches!(
        f.session.get_audio_frame(&UserId::new("bob")),
        Err(EngineError::InvalidOperation(_))
    ));

    f.enter(Scene::VideoCall).await;
    assert!(matches!(
        f.session.get_audio_frame(&UserId::new("nobody")),
        Err(EngineError::InvalidParameter(_))
    ));

    let r = fixture();
    r.enter(Scene::Record).await;
    r.remote_user("bob", &[]).await;
    assert!(matches!(
        r.session.get_audio_frame(&UserId::new("bob")),
        Err(EngineError::InvalidOperation(_))
    ));
}

#[tokio::test]
async fn test_record_scene_pushes_audio() {
    let f = fixture();
    f.enter(Scene::Record).await;
    f.remote_user("bob", &[StreamType::Audio]).await;

    f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(0)));
    f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(20)));
    wait_until("pushed audio", || f.spy.audio.lock().len() == 2).await;
    let pts: Vec<u32> = f.spy.audio.lock().iter().map(|(_, a)| a.pts).collect();
    assert_eq!(pts, vec![0, 20]);
}
