//! Local recording of room media
//!
//! A [`Recorder`] attaches to a [`RoomSession`] through a frame tap and the
//! room event stream. Single mode writes one user's encoded streams as
//! they arrive. Multi mode keeps the latest decoded picture of every
//! source, composes a canvas at the configured frame rate, stamps the
//! watermarks and re-encodes it, while remote audio is mixed into one
//! track.
//!
//! Output is split into segments when a segment duration is set. Each
//! segment is named after the server time at which it started and
//! stopped, see [`output_file_name`].

pub mod compositor;
pub mod container;
pub mod layout;
pub mod muxer;
pub mod params;
pub mod watermark;

use chrono::Local;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{CodecFactory, VideoDecoder, VideoEncoder, VideoEncoderConfig};
use crate::error::{EngineError, EngineResult, RecordError};
use crate::frame::{Frame, PixelFrame, VideoCodec};
use crate::pipeline::AudioMixer;
use crate::session::{ActiveRoom, FrameTap, RoomEvent, RoomSession, TappedFrame};
use crate::types::{StreamType, UserId};

pub use compositor::{Canvas, Compositor};
pub use container::Sample;
pub use layout::{auto_layout, validate_layout, FillMode, LayoutEntry};
pub use muxer::SegmentWriter;
pub use params::{
    output_file_name, LayoutMode, MultiRecordParams, RecordFileFormat, RecordMode, RecordParams, RecordType,
    SingleRecordParams,
};
pub use watermark::{Overlay, WatermarkEntry, WatermarkKind};

/// Recording lifecycle callbacks
///
/// Invoked from the recording task; implementations must return quickly.
pub trait RecordDelegate: Send + Sync {
    fn on_record_started(&self) {}
    /// Total bytes written so far, across segments
    fn on_record_progress(&self, _bytes_written: u64) {}
    /// A segment was closed and renamed to `path`
    fn on_record_finished(&self, _path: &Path) {}
    fn on_record_error(&self, _error: RecordError) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecorderState {
    #[default]
    Idle,
    Recording,
    /// Stop requested, the last segment is being finalized
    Stopping,
}

struct Shared {
    state: watch::Sender<RecorderState>,
    params: RwLock<Option<RecordParams>>,
    layout: RwLock<Arc<Vec<LayoutEntry>>>,
    overlays: RwLock<Arc<Vec<Overlay>>>,
    cancel: Mutex<CancellationToken>,
}

/// Records the media of one room session
pub struct Recorder {
    session: RoomSession,
    delegate: Arc<dyn RecordDelegate>,
    shared: Arc<Shared>,
}

impl Recorder {
    pub fn new(session: &RoomSession, delegate: Arc<dyn RecordDelegate>) -> Self {
        let (state, _) = watch::channel(RecorderState::Idle);
        Self {
            session: session.clone(),
            delegate,
            shared: Arc::new(Shared {
                state,
                params: RwLock::new(None),
                layout: RwLock::new(Arc::new(Vec::new())),
                overlays: RwLock::new(Arc::new(Vec::new())),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> RecorderState {
        *self.shared.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<RecorderState> {
        self.shared.state.subscribe()
    }

    /// Parameters of the running recording
    #[must_use]
    pub fn record_params(&self) -> Option<RecordParams> {
        self.shared.params.read().clone()
    }

    /// Current canvas layout of a multi-stream recording
    #[must_use]
    pub fn layout(&self) -> Vec<LayoutEntry> {
        self.shared.layout.read().as_ref().clone()
    }

    /// Start recording
    ///
    /// Parameter problems are returned here. Problems found once the
    /// recording task runs (no room, unwritable directory) are reported
    /// through [`RecordDelegate::on_record_error`].
    pub fn start(&self, params: RecordParams) -> EngineResult<()> {
        params.validate()?;

        let mut video = None;
        if params.record_mode == RecordMode::Multi && params.record_type.has_video() {
            let codecs = self
                .session
                .codecs()
                .ok_or_else(|| EngineError::NotSupported("mixed video recording needs a codec factory".to_string()))?;
            let config = VideoEncoderConfig {
                codec: VideoCodec::H264,
                bitrate_bps: self.session.config().quality.initial_bitrate_bps,
                frame_rate: params.multi.video_frame_rate,
            };
            let encoder = codecs
                .video_encoder(&config)
                .map_err(|e| EngineError::NotSupported(e.to_string()))?;
            video = Some((codecs, encoder));
        }

        let started = self.shared.state.send_if_modified(|state| {
            if *state == RecorderState::Idle {
                *state = RecorderState::Recording;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(EngineError::invalid_operation("a recording is already running"));
        }

        let mut params = params;
        if params.storage_directory.as_os_str().is_empty() {
            params.storage_directory = PathBuf::from(&self.session.config().recorder.storage_directory);
        }
        *self.shared.params.write() = Some(params.clone());
        *self.shared.layout.write() = Arc::new(Vec::new());
        *self.shared.overlays.write() = Arc::new(Vec::new());

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = cancel.clone();

        // attach before spawning so no frame slips past
        let tap = self
            .session
            .add_frame_tap_with_capacity(self.session.config().recorder.frame_queue_capacity);
        let events = self.session.subscribe_events();

        info!(
            mode = ?params.record_mode,
            format = ?params.file_format,
            directory = ?params.storage_directory,
            "Recording started"
        );
        let task = RecordingTask {
            session: self.session.clone(),
            delegate: self.delegate.clone(),
            shared: self.shared.clone(),
            params,
            room: None,
            segment: None,
            finished_bytes: 0,
            awaiting_key: false,
            fresh_video: false,
        };
        tokio::spawn(task.run(tap, events, cancel, video));
        Ok(())
    }

    /// Request the recording to stop; the last segment is finalized
    /// asynchronously and reported through `on_record_finished`
    pub fn stop(&self) -> EngineResult<()> {
        let stopping = self.shared.state.send_if_modified(|state| {
            if *state == RecorderState::Recording {
                *state = RecorderState::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            return Err(EngineError::invalid_operation("no recording is running"));
        }
        self.shared.cancel.lock().cancel();
        Ok(())
    }

    /// Replace the canvas layout of a manual multi-stream recording
    pub fn update_layout(&self, entries: &[LayoutEntry]) -> EngineResult<()> {
        let params = self.running_params()?;
        if params.record_mode != RecordMode::Multi || params.multi.layout_mode != LayoutMode::Manual {
            return Err(EngineError::invalid_operation(
                "layout can only be set on a manual multi-stream recording",
            ));
        }
        validate_layout(entries, params.multi.width, params.multi.height)?;
        debug!(entries = entries.len(), "Recording layout updated");
        *self.shared.layout.write() = Arc::new(entries.to_vec());
        Ok(())
    }

    /// Replace the watermarks of a multi-stream recording
    pub fn update_watermark(&self, entries: &[WatermarkEntry]) -> EngineResult<()> {
        let params = self.running_params()?;
        if params.record_mode != RecordMode::Multi {
            return Err(EngineError::NotSupported(
                "watermarks only apply to multi-stream recordings".to_string(),
            ));
        }
        let overlays = watermark::prepare(entries, params.multi.width, params.multi.height)?;
        *self.shared.overlays.write() = Arc::new(overlays);
        Ok(())
    }

    fn running_params(&self) -> EngineResult<RecordParams> {
        if self.state() != RecorderState::Recording {
            return Err(EngineError::invalid_operation("no recording is running"));
        }
        self.record_params()
            .ok_or_else(|| EngineError::invalid_operation("no recording is running"))
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.shared.cancel.lock().cancel();
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder").field("state", &self.state()).finish_non_exhaustive()
    }
}

/// How the recording loop ended
enum End {
    Stopped,
    RoomGone,
}

struct Segment {
    writer: SegmentWriter,
    start_ts: u64,
}

struct RecordingTask {
    session: RoomSession,
    delegate: Arc<dyn RecordDelegate>,
    shared: Arc<Shared>,
    params: RecordParams,
    room: Option<ActiveRoom>,
    segment: Option<Segment>,
    /// Bytes of segments already finished
    finished_bytes: u64,
    /// Drop samples until the first video key frame
    awaiting_key: bool,
    /// The open segment has no video yet
    fresh_video: bool,
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

impl RecordingTask {
    async fn run(
        mut self,
        mut tap: FrameTap,
        mut events: broadcast::Receiver<RoomEvent>,
        cancel: CancellationToken,
        video: Option<(Arc<dyn CodecFactory>, Box<dyn VideoEncoder>)>,
    ) {
        let outcome = self.record(&mut tap, &mut events, &cancel, video).await;
        drop(tap);

        let result = match outcome {
            Ok(End::Stopped) => self.finish_segment().await,
            Ok(End::RoomGone) => match self.finish_segment().await {
                Ok(()) => Err(RecordError::NotFoundRoom),
                Err(e) => Err(e),
            },
            Err(e) => {
                if let Some(segment) = self.segment.take() {
                    segment.writer.discard().await;
                }
                Err(e)
            }
        };
        // losing the room after a stop request is a normal end
        let stop_requested = cancel.is_cancelled() || *self.shared.state.borrow() == RecorderState::Stopping;
        let result = match result {
            Err(RecordError::NotFoundRoom) if stop_requested => Ok(()),
            other => other,
        };
        if let Err(e) = result {
            error!(error = %e, "Recording ended with an error");
            self.delegate.on_record_error(e);
        }

        *self.shared.params.write() = None;
        self.shared.state.send_replace(RecorderState::Idle);
        info!("Recording stopped");
    }

    async fn record(
        &mut self,
        tap: &mut FrameTap,
        events: &mut broadcast::Receiver<RoomEvent>,
        cancel: &CancellationToken,
        video: Option<(Arc<dyn CodecFactory>, Box<dyn VideoEncoder>)>,
    ) -> Result<End, RecordError> {
        let Some(room) = self.session.active_room() else {
            warn!("Recording requested without an active room");
            return Err(RecordError::NotFoundRoom);
        };
        self.room = Some(room);

        tokio::fs::create_dir_all(&self.params.storage_directory)
            .await
            .map_err(|e| {
                error!(directory = ?self.params.storage_directory, error = %e, "Cannot create recording directory");
                RecordError::DiskIo
            })?;
        self.open_segment().await?;
        self.awaiting_key = self.params.record_type.has_video();
        self.delegate.on_record_started();

        match self.params.record_mode {
            RecordMode::Single => self.record_single(tap, events, cancel).await,
            RecordMode::Multi => self.record_multi(tap, events, cancel, video).await,
        }
    }

    async fn record_single(
        &mut self,
        tap: &mut FrameTap,
        events: &mut broadcast::Receiver<RoomEvent>,
        cancel: &CancellationToken,
    ) -> Result<End, RecordError> {
        let source = self.params.single.clone();
        if self.params.record_type.has_video() {
            self.subscribe(&source.user_id, source.stream_type);
        }
        if self.params.record_type.has_audio() {
            self.subscribe(&source.user_id, StreamType::Audio);
        }
        let mut progress = ticker(self.progress_interval());

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(End::Stopped),
                event = events.recv() => match event {
                    Ok(RoomEvent::Exited | RoomEvent::Closed(_)) | Err(broadcast::error::RecvError::Closed) => {
                        return Ok(End::RoomGone);
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
                tapped = tap.recv() => {
                    let Some(TappedFrame { user_id, stream_type, frame }) = tapped else {
                        return Ok(End::RoomGone);
                    };
                    if user_id != source.user_id {
                        continue;
                    }
                    let sample = match frame {
                        Frame::Video(video) if stream_type == source.stream_type => Sample::Video(video),
                        Frame::Audio(audio) if stream_type == StreamType::Audio => Sample::Audio(audio),
                        _ => continue,
                    };
                    self.write_sample(&sample).await?;
                }
                _ = progress.tick() => self.report_progress(),
            }
        }
    }

    async fn record_multi(
        &mut self,
        tap: &mut FrameTap,
        events: &mut broadcast::Receiver<RoomEvent>,
        cancel: &CancellationToken,
        video: Option<(Arc<dyn CodecFactory>, Box<dyn VideoEncoder>)>,
    ) -> Result<End, RecordError> {
        let multi = self.params.multi.clone();
        let record_audio = self.params.record_type.has_audio();
        let record_config = self.room.as_ref().map(|r| r.record_config.clone()).unwrap_or_default();

        let mut canvas = video.map(|(codecs, encoder)| CanvasSource {
            compositor: Compositor {
                width: multi.width,
                height: multi.height,
                background: multi.background_color,
            },
            codecs,
            encoder,
            decoders: HashMap::new(),
            latest: HashMap::new(),
            frames: 0,
            frame_rate: multi.video_frame_rate,
        });
        let mut mixer = AudioMixer::new(
            record_config.output_sample_rate,
            record_config.output_channels,
            record_config.output_frame_length_ms,
            self.session.config().pipeline.playout_buffer_ms,
        );

        for participant in self.session.remote_participants() {
            for stream_type in &participant.streams {
                self.subscribe(&participant.user_id, *stream_type);
            }
        }
        self.refresh_layout();

        let mut frame_tick = ticker(Duration::from_millis(1_000 / u64::from(multi.video_frame_rate.max(1))));
        let mut mix_tick = ticker(Duration::from_millis(u64::from(mixer.frame_ms())));
        let mut progress = ticker(self.progress_interval());

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(End::Stopped),
                event = events.recv() => match event {
                    Ok(RoomEvent::Exited | RoomEvent::Closed(_)) | Err(broadcast::error::RecvError::Closed) => {
                        return Ok(End::RoomGone);
                    }
                    Ok(RoomEvent::UserLeft(user_id)) => {
                        mixer.remove(&user_id);
                        if let Some(canvas) = canvas.as_mut() {
                            canvas.remove_user(&user_id);
                        }
                        self.refresh_layout();
                    }
                    Ok(RoomEvent::StreamAvailable { user_id, stream_type, available }) => {
                        if available {
                            self.subscribe(&user_id, stream_type);
                        } else if let Some(canvas) = canvas.as_mut() {
                            canvas.remove_source(&user_id, stream_type);
                        }
                        self.refresh_layout();
                    }
                    Ok(RoomEvent::UserEntered(_)) => self.refresh_layout(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Recorder missed room events");
                        self.refresh_layout();
                    }
                },
                tapped = tap.recv() => {
                    let Some(TappedFrame { user_id, stream_type, frame }) = tapped else {
                        return Ok(End::RoomGone);
                    };
                    match frame {
                        Frame::Audio(audio) if record_audio => mixer.push(&user_id, audio),
                        Frame::Video(video) => {
                            if let Some(canvas) = canvas.as_mut() {
                                canvas.absorb(user_id, stream_type, &video);
                            }
                        }
                        _ => {}
                    }
                }
                _ = frame_tick.tick(), if canvas.is_some() => {
                    if let Some(canvas) = canvas.as_mut() {
                        self.compose_frame(canvas).await?;
                    }
                }
                _ = mix_tick.tick(), if record_audio => {
                    if let Some(frame) = mixer.mix_next() {
                        self.write_sample(&Sample::Audio(frame)).await?;
                    }
                }
                _ = progress.tick() => self.report_progress(),
            }
        }
    }

    async fn compose_frame(&mut self, canvas: &mut CanvasSource) -> Result<(), RecordError> {
        let pts = canvas.next_pts();
        let layout = self.shared.layout.read().clone();
        let overlays = self.shared.overlays.read().clone();

        let mut picture = canvas.compositor.compose(&layout, &canvas.latest);
        let now = Local::now();
        for overlay in overlays.iter() {
            overlay.draw(&mut picture, now);
        }
        let force_key = self.fresh_video || self.rotation_due_at(pts);
        match canvas.encoder.encode(&picture.into_frame(pts), force_key) {
            Ok(encoded) => self.write_sample(&Sample::Video(encoded)).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode composed frame");
                Ok(())
            }
        }
    }

    fn subscribe(&self, user_id: &UserId, stream_type: StreamType) {
        if let Err(e) = self.session.subscribe(user_id, stream_type) {
            debug!(user_id = %user_id, stream_type = %stream_type, error = %e, "Recorder could not subscribe");
        }
    }

    fn refresh_layout(&self) {
        let multi = &self.params.multi;
        if multi.layout_mode == LayoutMode::Manual || !self.params.record_type.has_video() {
            return;
        }
        let mut sources = Vec::new();
        for participant in self.session.remote_participants() {
            let main = [StreamType::VideoHigh, StreamType::VideoLow]
                .into_iter()
                .find(|t| participant.streams.contains(t));
            if let Some(main) = main {
                sources.push((participant.user_id.clone(), main));
            }
            if participant.streams.contains(&StreamType::VideoAux) {
                sources.push((participant.user_id.clone(), StreamType::VideoAux));
            }
        }
        let layout = auto_layout(
            multi.layout_mode,
            multi.width,
            multi.height,
            multi.max_layout_count,
            &sources,
        );
        *self.shared.layout.write() = Arc::new(layout);
    }

    fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.session.config().recorder.progress_interval_ms)
    }

    fn report_progress(&self) {
        let current = self.segment.as_ref().map_or(0, |s| s.writer.bytes_written());
        self.delegate.on_record_progress(self.finished_bytes + current);
    }

    fn segment_limit_ms(&self) -> Option<u32> {
        (self.params.segment_duration_secs > 0).then(|| self.params.segment_duration_secs.saturating_mul(1_000))
    }

    fn rotation_due_at(&self, pts: u32) -> bool {
        let (Some(limit), Some(segment)) = (self.segment_limit_ms(), self.segment.as_ref()) else {
            return false;
        };
        segment
            .writer
            .base_pts()
            .is_some_and(|base| pts.saturating_sub(base) >= limit)
    }

    /// Segments are cut at video key frames, or at any audio frame when no
    /// video is recorded
    fn rotation_due(&self, sample: &Sample) -> bool {
        let boundary = match sample {
            Sample::Video(frame) => frame.is_key_frame,
            Sample::Audio(_) => !self.params.record_type.has_video(),
        };
        boundary && self.rotation_due_at(sample.pts())
    }

    async fn write_sample(&mut self, sample: &Sample) -> Result<(), RecordError> {
        if self.awaiting_key {
            if !matches!(sample, Sample::Video(v) if v.is_key_frame) {
                return Ok(());
            }
            self.awaiting_key = false;
        }
        if self.rotation_due(sample) {
            self.finish_segment().await?;
            self.open_segment().await?;
        }
        let Some(segment) = self.segment.as_mut() else {
            return Ok(());
        };
        segment.writer.write(sample).await.map_err(|e| {
            error!(error = %e, "Failed to write recording sample");
            RecordError::DiskIo
        })?;
        if matches!(sample, Sample::Video(_)) {
            self.fresh_video = false;
        }
        Ok(())
    }

    async fn open_segment(&mut self) -> Result<(), RecordError> {
        let video_size = match self.params.record_mode {
            RecordMode::Multi => (self.params.multi.width, self.params.multi.height),
            RecordMode::Single => (0, 0),
        };
        let writer = SegmentWriter::create(
            &self.params.storage_directory,
            self.params.file_format,
            self.params.record_type,
            video_size,
        )
        .await
        .map_err(|e| {
            error!(directory = ?self.params.storage_directory, error = %e, "Cannot open recording segment");
            RecordError::DiskIo
        })?;
        self.segment = Some(Segment {
            writer,
            start_ts: self.session.server_time_ms(),
        });
        self.fresh_video = true;
        Ok(())
    }

    async fn finish_segment(&mut self) -> Result<(), RecordError> {
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        let Some(room) = self.room.as_ref() else {
            segment.writer.discard().await;
            return Err(RecordError::NotFoundRoom);
        };
        let name = output_file_name(
            self.params.record_type,
            room.sdk_app_id,
            &room.room,
            &self.params.source_label(),
            segment.start_ts,
            self.session.server_time_ms(),
            self.params.file_format,
        );
        let bytes = segment.writer.bytes_written();
        let path = segment.writer.finish(&name).await.map_err(|e| {
            error!(file = %name, error = %e, "Failed to finalize recording segment");
            RecordError::DiskIo
        })?;
        self.finished_bytes += bytes;
        self.delegate.on_record_finished(&path);
        Ok(())
    }
}

/// Decoded sources and the encoder of a composed recording
struct CanvasSource {
    compositor: Compositor,
    codecs: Arc<dyn CodecFactory>,
    encoder: Box<dyn VideoEncoder>,
    decoders: HashMap<(UserId, StreamType), Box<dyn VideoDecoder>>,
    latest: HashMap<(UserId, StreamType), PixelFrame>,
    frames: u64,
    frame_rate: u32,
}

impl CanvasSource {
    fn absorb(&mut self, user_id: UserId, stream_type: StreamType, frame: &crate::frame::VideoFrame) {
        let key = (user_id, stream_type);
        if !self.decoders.contains_key(&key) {
            match self.codecs.video_decoder(frame.codec) {
                Ok(decoder) => {
                    self.decoders.insert(key.clone(), decoder);
                }
                Err(e) => {
                    warn!(user_id = %key.0, error = %e, "Cannot create decoder for recording");
                    return;
                }
            }
        }
        let Some(decoder) = self.decoders.get_mut(&key) else {
            return;
        };
        match decoder.decode(frame) {
            Ok(Some(picture)) => {
                self.latest.insert(key, picture);
            }
            Ok(None) => {}
            Err(e) => warn!(user_id = %key.0, error = %e, "Failed to decode frame for recording"),
        }
    }

    fn remove_source(&mut self, user_id: &UserId, stream_type: StreamType) {
        let key = (user_id.clone(), stream_type);
        self.decoders.remove(&key);
        self.latest.remove(&key);
    }

    fn remove_user(&mut self, user_id: &UserId) {
        self.decoders.retain(|(user, _), _| user != user_id);
        self.latest.retain(|(user, _), _| user != user_id);
    }

    fn next_pts(&mut self) -> u32 {
        let pts = self.frames * 1_000 / u64::from(self.frame_rate.max(1));
        self.frames += 1;
        u32::try_from(pts).unwrap_or(u32::MAX)
    }
}
