// Recording a room to disk

mod common;

use bytes::Bytes;
use common::{config, fixture, pcm_20ms, room_params, wait_until, Spy};
use parking_lot::Mutex;
use rtcroom_engine::recorder::{
    LayoutEntry, LayoutMode, MultiRecordParams, RecordFileFormat, RecordMode, RecordParams, RecordType,
    SingleRecordParams, WatermarkEntry,
};
use rtcroom_engine::{
    Delegates, EngineError, Frame, MemoryTransport, RawI420Codec, RecordDelegate, RecordError, Recorder,
    RecorderState, RoomSession, Scene, StreamType, VideoCodec, VideoFrame,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordSpy {
    started: AtomicBool,
    finished: Mutex<Vec<PathBuf>>,
    errors: Mutex<Vec<RecordError>>,
}

impl RecordDelegate for RecordSpy {
    fn on_record_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn on_record_finished(&self, path: &Path) {
        self.finished.lock().push(path.to_path_buf());
    }

    fn on_record_error(&self, error: RecordError) {
        self.errors.lock().push(error);
    }
}

fn single(dir: &Path, format: RecordFileFormat, record_type: RecordType) -> RecordParams {
    RecordParams {
        file_format: format,
        record_type,
        storage_directory: dir.to_path_buf(),
        single: SingleRecordParams {
            user_id: "bob".into(),
            stream_type: StreamType::VideoHigh,
        },
        ..RecordParams::default()
    }
}

fn encoded(pts: u32, key: bool) -> Frame {
    Frame::Video(VideoFrame::new(Bytes::from_static(b"nal"), VideoCodec::H264, pts, key))
}

async fn wait_idle(recorder: &Recorder) {
    let mut state = recorder.watch_state();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == RecorderState::Idle))
        .await
        .expect("timed out waiting for the recorder to stop")
        .expect("recorder dropped");
}

#[tokio::test]
async fn test_single_stream_flv_is_named_after_server_time() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    f.remote_user("bob", &[StreamType::Audio, StreamType::VideoHigh]).await;

    let spy = Arc::new(RecordSpy::default());
    let recorder = Recorder::new(&f.session, spy.clone());
    f.remote.set_server_time(100);
    recorder
        .start(single(dir.path(), RecordFileFormat::Flv, RecordType::AudioAndVideo))
        .unwrap();
    assert_eq!(recorder.state(), RecorderState::Recording);
    wait_until("record started", || spy.started.load(Ordering::SeqCst)).await;

    // audio before the first key frame is not written
    f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(0)));
    f.remote.media("bob", StreamType::VideoHigh, encoded(0, true));
    f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(20)));
    f.remote.media("bob", StreamType::VideoHigh, encoded(40, false));
    tokio::time::sleep(Duration::from_millis(100)).await;

    f.remote.set_server_time(200);
    recorder.stop().unwrap();
    wait_idle(&recorder).await;

    let finished = spy.finished.lock().clone();
    assert_eq!(finished.len(), 1);
    assert_eq!(
        finished[0].file_name().unwrap().to_str().unwrap(),
        "out_av_1400_5_bob_f_100_e_200.flv"
    );
    let data = std::fs::read(&finished[0]).unwrap();
    assert_eq!(&data[..3], b"FLV");
    // header, then three tags of 11 + body + 4 bytes
    let video_tag = 11 + 5 + 3 + 4;
    let audio_tag = 11 + 1 + 640 + 4;
    assert_eq!(data.len(), 13 + 2 * video_tag + audio_tag);
    assert!(spy.errors.lock().is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    assert!(recorder.record_params().is_none());
}

#[tokio::test]
async fn test_recording_without_room_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture();
    let spy = Arc::new(RecordSpy::default());
    let recorder = Recorder::new(&f.session, spy.clone());

    recorder
        .start(single(dir.path(), RecordFileFormat::Mp4, RecordType::VideoOnly))
        .unwrap();
    wait_idle(&recorder).await;
    assert_eq!(spy.errors.lock().as_slice(), &[RecordError::NotFoundRoom]);
    assert!(!spy.started.load(Ordering::SeqCst));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_leaving_the_room_closes_the_recording() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    f.remote_user("bob", &[StreamType::Audio]).await;

    let spy = Arc::new(RecordSpy::default());
    let recorder = Recorder::new(&f.session, spy.clone());
    recorder
        .start(single(dir.path(), RecordFileFormat::Mp3, RecordType::AudioOnly))
        .unwrap();
    wait_until("record started", || spy.started.load(Ordering::SeqCst)).await;
    f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(0)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    f.session.exit_room().unwrap();
    wait_idle(&recorder).await;

    assert_eq!(spy.errors.lock().as_slice(), &[RecordError::NotFoundRoom]);
    let finished = spy.finished.lock().clone();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].extension().unwrap(), "mp3");
    assert_eq!(std::fs::read(&finished[0]).unwrap().len(), 640);
}

fn mixed_audio(dir: &Path) -> RecordParams {
    RecordParams {
        file_format: RecordFileFormat::Mp3,
        record_type: RecordType::AudioOnly,
        storage_directory: dir.to_path_buf(),
        record_mode: RecordMode::Multi,
        ..RecordParams::default()
    }
}

#[tokio::test]
async fn test_stop_then_exit_is_a_clean_finish() {
    for stop_first in [true, false] {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture();
        f.enter(Scene::VideoCall).await;
        f.remote_user("bob", &[StreamType::Audio]).await;

        let spy = Arc::new(RecordSpy::default());
        let recorder = Recorder::new(&f.session, spy.clone());
        recorder.start(mixed_audio(dir.path())).unwrap();
        wait_until("record started", || spy.started.load(Ordering::SeqCst)).await;
        f.remote.media("bob", StreamType::Audio, Frame::Audio(pcm_20ms(0)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        if stop_first {
            recorder.stop().unwrap();
            f.session.exit_room().unwrap();
        } else {
            f.session.exit_room().unwrap();
            recorder.stop().unwrap();
        }
        wait_idle(&recorder).await;

        assert!(spy.errors.lock().is_empty(), "stop_first={stop_first}");
        assert_eq!(spy.finished.lock().len(), 1, "stop_first={stop_first}");
    }
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    let recorder = Recorder::new(&f.session, Arc::new(RecordSpy::default()));

    let params = single(dir.path(), RecordFileFormat::Flv, RecordType::AudioAndVideo);
    recorder.start(params.clone()).unwrap();
    assert!(matches!(recorder.start(params), Err(EngineError::InvalidOperation(_))));
    assert!(matches!(
        recorder.update_watermark(&[WatermarkEntry::default()]),
        Err(EngineError::NotSupported(_))
    ));
    assert!(matches!(recorder.update_layout(&[]), Err(EngineError::InvalidOperation(_))));

    recorder.stop().unwrap();
    wait_idle(&recorder).await;
    assert!(matches!(recorder.stop(), Err(EngineError::InvalidOperation(_))));
}

#[tokio::test]
async fn test_mixed_recording_composes_the_canvas() {
    let dir = tempfile::tempdir().unwrap();
    let (transport, remote) = MemoryTransport::new();
    let session = RoomSession::with_codecs(
        Arc::new(config()),
        transport,
        Delegates::all(Arc::new(Spy::default())),
        Arc::new(RawI420Codec::default()),
    );
    session.enter_room(room_params("alice")).unwrap();
    let mut state = session.watch_state();
    state
        .wait_for(|s| *s == rtcroom_engine::ConnectionState::Connected)
        .await
        .unwrap();

    let spy = Arc::new(RecordSpy::default());
    let recorder = Recorder::new(&session, spy.clone());
    let params = RecordParams {
        file_format: RecordFileFormat::Mp4,
        record_type: RecordType::VideoOnly,
        storage_directory: dir.path().to_path_buf(),
        record_mode: RecordMode::Multi,
        multi: MultiRecordParams {
            width: 32,
            height: 16,
            video_frame_rate: 20,
            background_color: 0x00FF_0000,
            layout_mode: LayoutMode::Manual,
            max_layout_count: 0,
        },
        ..RecordParams::default()
    };
    recorder.start(params).unwrap();
    wait_until("record started", || spy.started.load(Ordering::SeqCst)).await;

    // manual layouts are validated against the canvas
    let outside = LayoutEntry::new("bob", StreamType::VideoHigh, 16, 0, 32, 16);
    assert!(matches!(
        recorder.update_layout(&[outside]),
        Err(EngineError::InvalidParameter(_))
    ));
    let cell = LayoutEntry::new("bob", StreamType::VideoHigh, 0, 0, 16, 16);
    recorder.update_layout(&[cell.clone()]).unwrap();
    assert_eq!(recorder.layout(), vec![cell]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    recorder.stop().unwrap();
    wait_idle(&recorder).await;

    let finished = spy.finished.lock().clone();
    assert_eq!(finished.len(), 1);
    let name = finished[0].file_name().unwrap().to_str().unwrap().to_string();
    assert!(name.starts_with("out_video_1400_5_mixed_f_"), "{name}");
    assert!(name.ends_with(".mp4"));

    let data = std::fs::read(&finished[0]).unwrap();
    assert_eq!(&data[4..8], b"ftyp");
    assert!(data.windows(4).any(|w| w == b"moov"));
    assert!(data.windows(4).any(|w| w == b"stss"));
    assert!(spy.errors.lock().is_empty());
    drop(remote);
}

#[tokio::test]
async fn test_mixed_video_needs_a_codec() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture();
    f.enter(Scene::VideoCall).await;
    let recorder = Recorder::new(&f.session, Arc::new(RecordSpy::default()));
    let params = RecordParams {
        storage_directory: dir.path().to_path_buf(),
        record_mode: RecordMode::Multi,
        multi: MultiRecordParams {
            width: 64,
            height: 64,
            ..MultiRecordParams::default()
        },
        ..RecordParams::default()
    };
    assert!(matches!(recorder.start(params), Err(EngineError::NotSupported(_))));
    assert_eq!(recorder.state(), RecorderState::Idle);
}
