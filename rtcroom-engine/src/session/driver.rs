//! Per-room delivery loop
//!
//! Everything that reaches a delegate goes through here, so callbacks for
//! one room never run concurrently with each other.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{ActiveRoom, Command, RemoteParticipant, RoomEvent, SessionInner, TappedFrame};
use crate::channel::ChannelState;
use crate::codec::VideoDecoder;
use crate::error::{EngineError, EngineResult};
use crate::frame::{AudioFrame, Frame, PixelFrame, VideoFrame};
use crate::params::{EnterRoomParams, Scene};
use crate::pipeline::{AudioMixer, AvSync, RoomBinding, SyncTrack, SyncedFrame};
use crate::transport::{TransportError, TransportEvent};
use crate::types::{ChannelKey, ConnectionState, StreamType, UserId};

enum Shutdown {
    Exit,
    Failed(EngineError),
    /// The last session handle went away
    Dropped,
}

fn admission_error(err: TransportError) -> EngineError {
    match err {
        TransportError::Rejected { code, reason } => EngineError::from_code(code, reason),
        TransportError::Transient(reason) => EngineError::EnterRoomFailed(reason),
        TransportError::Closed => EngineError::EnterRoomFailed("transport closed".to_string()),
    }
}

const fn sync_track(stream_type: StreamType) -> Option<SyncTrack> {
    match stream_type {
        StreamType::Audio => Some(SyncTrack::Audio),
        StreamType::VideoHigh | StreamType::VideoLow => Some(SyncTrack::Video),
        StreamType::VideoAux => None,
    }
}

pub(super) async fn run_room(
    inner: Arc<SessionInner>,
    params: EnterRoomParams,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    previous: ConnectionState,
) {
    inner
        .delegates
        .connection
        .on_connection_state_changed(previous, ConnectionState::Connecting);
    let Ok(room) = inner.active_room() else {
        return;
    };
    let driver = RoomDriver::new(inner.clone(), room);

    let transport = inner.transport.clone();
    let admitted = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            driver.shutdown(Shutdown::Dropped).await;
            return;
        }
        result = transport.connect(&params) => result,
    };
    if let Err(e) = admitted {
        driver.shutdown(Shutdown::Failed(admission_error(e))).await;
        return;
    }

    inner.set_state(ConnectionState::Connected);
    info!(room = %driver.room.room, user_id = %driver.room.local_user, "Entered room");
    inner.delegates.connection.on_enter_room();
    driver.run(commands, cancel).await;
}

struct RoomDriver {
    inner: Arc<SessionInner>,
    room: ActiveRoom,
    av_sync: AvSync,
    mixer: Option<AudioMixer>,
    decoders: HashMap<(UserId, StreamType), Box<dyn VideoDecoder>>,
}

impl RoomDriver {
    fn new(inner: Arc<SessionInner>, room: ActiveRoom) -> Self {
        let record = &room.record_config;
        let mixer = (room.scene == Scene::Record && record.enable_remote_audio_mix).then(|| {
            AudioMixer::new(
                record.output_sample_rate,
                record.output_channels,
                record.output_frame_length_ms,
                inner.config.pipeline.playout_buffer_ms,
            )
        });
        Self {
            av_sync: AvSync::new(inner.config.pipeline.av_sync_window_ms),
            mixer,
            decoders: HashMap::new(),
            inner,
            room,
        }
    }

    /// Remote audio reaches the delegate one user at a time
    fn pushes_audio(&self) -> bool {
        self.room.scene == Scene::Record && self.mixer.is_none()
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        let quality_period = self.inner.config.quality.interval();
        let mut quality_tick = time::interval_at(time::Instant::now() + quality_period, quality_period);
        quality_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mix_period = Duration::from_millis(u64::from(self.room.record_config.output_frame_length_ms.max(1)));
        let mut mix_tick = time::interval_at(time::Instant::now() + mix_period, mix_period);
        mix_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mixing = self.mixer.is_some();

        let transport = self.inner.transport.clone();
        let reason = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break Shutdown::Dropped,
                Some(command) = commands.recv() => {
                    if let Some(reason) = self.handle_command(command) {
                        break reason;
                    }
                }
                event = transport.next_event() => {
                    let Some(event) = event else {
                        break Shutdown::Failed(EngineError::NetworkUnreachable("transport closed".to_string()));
                    };
                    if let Some(reason) = self.handle_event(event, &cancel).await {
                        break reason;
                    }
                }
                _ = quality_tick.tick() => self.evaluate_quality(),
                _ = mix_tick.tick(), if mixing => self.mix(),
            }
        };
        self.shutdown(reason).await;
    }

    fn handle_command(&mut self, command: Command) -> Option<Shutdown> {
        match command {
            Command::ChannelOpened {
                key,
                generation,
                result,
            } => self.channel_opened(key, generation, result),
            Command::ChannelClosed { key, generation } => self.channel_closed(key, generation),
            Command::Exit => return Some(Shutdown::Exit),
        }
        None
    }

    fn channel_opened(&mut self, key: ChannelKey, generation: u64, result: EngineResult<()>) {
        let opened = result.is_ok();
        if !self.inner.channels.complete_create(&key, generation, opened) {
            debug!(channel = %key, generation, "Ignoring stale open completion");
            if opened {
                let transport = self.inner.transport.clone();
                tokio::spawn(async move { transport.close_channel(&key).await });
            }
            return;
        }

        if let Err(err) = result {
            warn!(channel = %key, error = %err, "Channel open failed");
            self.inner.delegates.error.on_error(&err);
            return;
        }

        info!(channel = %key, "Channel ready");
        match key {
            ChannelKey::Send(stream_type) => {
                self.inner.pipeline.start_outbound(
                    stream_type,
                    self.inner.config.quality.initial_bitrate_bps,
                    self.inner.state.subscribe(),
                );
                if stream_type.is_video() {
                    self.inner.quality.track_send_video(stream_type);
                    self.inner.delegates.channel.on_local_video_channel_created(stream_type);
                } else {
                    self.inner.delegates.channel.on_local_audio_channel_created();
                }
            }
            ChannelKey::Receive(user_id, stream_type) => match sync_track(stream_type) {
                Some(SyncTrack::Audio) if !self.pushes_audio() => {}
                Some(track) => {
                    let released = self.av_sync.set_active(&user_id, track, true);
                    self.deliver_all(released);
                }
                None => {}
            },
        }
    }

    fn channel_closed(&mut self, key: ChannelKey, generation: u64) {
        if !self.inner.channels.complete_destroy(&key, generation) {
            debug!(channel = %key, generation, "Ignoring stale close completion");
            return;
        }
        self.inner.quality.untrack(&key);
        info!(channel = %key, "Channel destroyed");
        match key {
            ChannelKey::Send(StreamType::Audio) => {
                self.inner.pipeline.set_audio_params(None);
                self.inner.delegates.channel.on_local_audio_channel_destroyed();
            }
            ChannelKey::Send(stream_type) => {
                self.inner.delegates.channel.on_local_video_channel_destroyed(stream_type);
            }
            ChannelKey::Receive(user_id, stream_type) => {
                self.receive_stopped(&user_id, stream_type);
                // resubscribed while the close was in flight
                if self.inner.subscriptions.wants(&user_id, stream_type)
                    && self.inner.stream_available(&user_id, stream_type)
                {
                    let key = ChannelKey::Receive(user_id.clone(), stream_type);
                    if let Err(e) = self.inner.open_channel(key, None) {
                        warn!(user_id = %user_id, stream_type = %stream_type, error = %e, "Cannot reopen receive channel");
                    }
                }
            }
        }
    }

    fn receive_stopped(&mut self, user_id: &UserId, stream_type: StreamType) {
        self.decoders.remove(&(user_id.clone(), stream_type));
        if stream_type == StreamType::Audio {
            if let Some(mixer) = self.mixer.as_mut() {
                mixer.remove(user_id);
            }
        }
        let Some(track) = sync_track(stream_type) else {
            return;
        };
        let still_live = match track {
            SyncTrack::Audio => false,
            SyncTrack::Video => [StreamType::VideoHigh, StreamType::VideoLow]
                .into_iter()
                .any(|t| self.inner.channels.is_ready(&ChannelKey::Receive(user_id.clone(), t))),
        };
        if !still_live {
            let released = self.av_sync.set_active(user_id, track, false);
            self.deliver_all(released);
        }
    }

    async fn handle_event(&mut self, event: TransportEvent, cancel: &CancellationToken) -> Option<Shutdown> {
        match event {
            TransportEvent::UserEntered(user_id) => self.user_entered(user_id),
            TransportEvent::UserLeft(user_id) => self.user_left(&user_id),
            TransportEvent::StreamAvailable {
                user_id,
                stream_type,
                available,
            } => self.stream_available(user_id, stream_type, available),
            TransportEvent::Media {
                user_id,
                stream_type,
                frame,
            } => self.media(user_id, stream_type, frame),
            TransportEvent::Sei {
                user_id,
                stream_type,
                message,
            } => {
                if self.inner.channels.is_ready(&ChannelKey::Receive(user_id.clone(), stream_type)) {
                    self.inner
                        .delegates
                        .media
                        .on_sei_message_received(&user_id, stream_type, &message);
                }
            }
            TransportEvent::Stats(sample) => self.inner.quality.record(sample, std::time::Instant::now()),
            TransportEvent::ConnectionLost => return self.reconnect(cancel).await,
            TransportEvent::Kicked(code) => {
                return Some(Shutdown::Failed(EngineError::from_code(
                    code,
                    "removed from the room by the server",
                )))
            }
        }
        None
    }

    fn user_entered(&mut self, user_id: UserId) {
        {
            let mut participants = self.inner.participants.write();
            if participants.contains_key(&user_id) {
                debug!(user_id = %user_id, "Duplicate enter notification");
                return;
            }
            let join_order = self
                .inner
                .join_seq
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            participants.insert(
                user_id.clone(),
                RemoteParticipant {
                    user_id: user_id.clone(),
                    streams: BTreeSet::new(),
                    join_order,
                },
            );
        }
        info!(user_id = %user_id, "Remote user entered");
        self.inner.delegates.membership.on_remote_user_enter_room(&user_id);
        let _ = self.inner.events.send(RoomEvent::UserEntered(user_id));
    }

    fn user_left(&mut self, user_id: &UserId) {
        if self.inner.participants.write().remove(user_id).is_none() {
            debug!(user_id = %user_id, "Leave notification for unknown user");
            return;
        }
        for key in self.inner.channels.keys_of_user(user_id) {
            self.inner.channels.remove(&key);
            self.inner.quality.untrack(&key);
        }
        // anything still held for this user is abandoned
        let _ = self.av_sync.remove(user_id);
        if let Some(mixer) = self.mixer.as_mut() {
            mixer.remove(user_id);
        }
        self.decoders.retain(|(id, _), _| id != user_id);
        self.inner.pipeline.remove_user(user_id);
        self.inner.subscriptions.forget_user(user_id);
        self.inner.quality.remove_user(user_id);

        info!(user_id = %user_id, "Remote user left");
        self.inner.delegates.membership.on_remote_user_exit_room(user_id);
        let _ = self.inner.events.send(RoomEvent::UserLeft(user_id.clone()));
    }

    fn stream_available(&mut self, user_id: UserId, stream_type: StreamType, available: bool) {
        {
            let mut participants = self.inner.participants.write();
            let Some(participant) = participants.get_mut(&user_id) else {
                warn!(user_id = %user_id, stream_type = %stream_type, "Availability for unknown user");
                return;
            };
            let changed = if available {
                participant.streams.insert(stream_type)
            } else {
                participant.streams.remove(&stream_type)
            };
            if !changed {
                return;
            }
        }

        debug!(user_id = %user_id, stream_type = %stream_type, available, "Stream availability changed");
        let membership = &self.inner.delegates.membership;
        if stream_type == StreamType::Audio {
            membership.on_remote_audio_available(&user_id, available);
        } else {
            membership.on_remote_video_available(&user_id, stream_type, available);
        }
        let _ = self.inner.events.send(RoomEvent::StreamAvailable {
            user_id: user_id.clone(),
            stream_type,
            available,
        });

        let key = ChannelKey::Receive(user_id.clone(), stream_type);
        let state = self.inner.channels.state(&key);
        let result = if available {
            if self.inner.subscriptions.wants(&user_id, stream_type) && state == ChannelState::Absent {
                self.inner.open_channel(key, None)
            } else {
                Ok(())
            }
        } else {
            if stream_type == StreamType::Audio {
                self.inner.pipeline.remove_user(&user_id);
            }
            if matches!(state, ChannelState::Creating | ChannelState::Ready) {
                self.inner.close_channel(key)
            } else {
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(user_id = %user_id, stream_type = %stream_type, error = %e, "Cannot update receive channel");
        }
    }

    fn media(&mut self, user_id: UserId, stream_type: StreamType, frame: Frame) {
        if !self.inner.channels.is_ready(&ChannelKey::Receive(user_id.clone(), stream_type)) {
            trace!(user_id = %user_id, stream_type = %stream_type, "Dropping frame on channel that is not ready");
            return;
        }
        let Some(frame) = self.inner.pipeline.open_inbound(&user_id, stream_type, frame) else {
            return;
        };
        self.tap(&user_id, stream_type, &frame);

        match (stream_type, frame) {
            (StreamType::Audio, Frame::Audio(audio)) => self.route_audio(user_id, audio),
            (t, Frame::Video(video)) if t.is_video() => self.route_video(user_id, t, video),
            (t, _) => warn!(user_id = %user_id, stream_type = %t, "Frame kind does not match its stream"),
        }
    }

    fn tap(&self, user_id: &UserId, stream_type: StreamType, frame: &Frame) {
        if self.inner.taps.is_empty() {
            return;
        }
        let mut closed = Vec::new();
        for tap in self.inner.taps.iter() {
            let copy = TappedFrame {
                user_id: user_id.clone(),
                stream_type,
                frame: frame.clone(),
            };
            match tap.value().try_send(copy) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(tap = *tap.key(), "Frame tap is full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*tap.key()),
            }
        }
        for id in closed {
            self.inner.taps.remove(&id);
        }
    }

    fn route_audio(&mut self, user_id: UserId, audio: AudioFrame) {
        if self.room.scene != Scene::Record {
            self.inner.pipeline.push_playout(&user_id, audio);
        } else if let Some(mixer) = self.mixer.as_mut() {
            mixer.push(&user_id, audio);
        } else {
            let released = self.av_sync.push_audio(&user_id, audio);
            self.deliver_all(released);
        }
    }

    fn route_video(&mut self, user_id: UserId, stream_type: StreamType, video: VideoFrame) {
        let frame = if self.room.pixel_output {
            match self.decode(&user_id, stream_type, &video) {
                Some(picture) => Frame::Pixel(picture),
                None => return,
            }
        } else {
            Frame::Video(video)
        };

        if stream_type == StreamType::VideoAux {
            self.deliver(SyncedFrame::Video(user_id, stream_type, frame));
        } else {
            let released = self.av_sync.push_video(&user_id, stream_type, frame);
            self.deliver_all(released);
        }
    }

    fn decode(&mut self, user_id: &UserId, stream_type: StreamType, video: &VideoFrame) -> Option<PixelFrame> {
        let key = (user_id.clone(), stream_type);
        if !self.decoders.contains_key(&key) {
            let codecs = self.inner.codecs.as_ref()?;
            match codecs.video_decoder(video.codec) {
                Ok(decoder) => {
                    self.decoders.insert(key.clone(), decoder);
                }
                Err(e) => {
                    warn!(user_id = %user_id, stream_type = %stream_type, error = %e, "Cannot create video decoder");
                    return None;
                }
            }
        }
        let decoder = self.decoders.get_mut(&key)?;
        match decoder.decode(video) {
            Ok(picture) => picture,
            Err(e) => {
                warn!(user_id = %user_id, stream_type = %stream_type, error = %e, "Decoding failed, dropping frame");
                None
            }
        }
    }

    fn deliver_all(&self, frames: Vec<SyncedFrame>) {
        for frame in frames {
            self.deliver(frame);
        }
    }

    /// Frames of a channel torn down since they were queued are discarded
    fn deliver(&self, frame: SyncedFrame) {
        let media = &self.inner.delegates.media;
        match frame {
            SyncedFrame::Audio(user_id, audio) => {
                if self.inner.channels.is_ready(&ChannelKey::Receive(user_id.clone(), StreamType::Audio)) {
                    media.on_remote_audio_received(&user_id, &audio);
                }
            }
            SyncedFrame::Video(user_id, stream_type, frame) => {
                if !self.inner.channels.is_ready(&ChannelKey::Receive(user_id.clone(), stream_type)) {
                    return;
                }
                match frame {
                    Frame::Video(video) => media.on_remote_video_received(&user_id, stream_type, &video),
                    Frame::Pixel(picture) => media.on_remote_pixel_frame_received(&user_id, stream_type, &picture),
                    Frame::Audio(_) => {}
                }
            }
        }
    }

    fn mix(&mut self) {
        let Some(mixer) = self.mixer.as_mut() else {
            return;
        };
        if let Some(mixed) = mixer.mix_next() {
            self.inner.delegates.media.on_remote_mixed_audio_received(&mixed);
        }
    }

    fn evaluate_quality(&self) {
        let evaluation = self.inner.quality.evaluate(std::time::Instant::now());
        for report in &evaluation.reports {
            self.inner.delegates.quality.on_network_quality(report);
        }
        for request in evaluation.bitrate_requests {
            debug!(
                stream_type = %request.stream_type,
                bitrate_bps = request.bitrate_bps,
                "Requesting video bitrate change"
            );
            self.inner
                .pipeline
                .apply_bitrate(request.stream_type, request.bitrate_bps);
            self.inner
                .delegates
                .quality
                .on_request_change_video_encode_bitrate(request.stream_type, request.bitrate_bps);
        }
    }

    /// Resume after network loss; channels and queued frames survive
    async fn reconnect(&mut self, cancel: &CancellationToken) -> Option<Shutdown> {
        warn!(room = %self.room.room, "Connection lost, reconnecting");
        self.inner.set_state(ConnectionState::Connecting);

        let session = &self.inner.config.session;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(session.reconnect_min_delay())
            .with_max_delay(session.reconnect_max_delay())
            .with_max_times(session.reconnect_max_attempts)
            .with_jitter()
            .build();

        let transport = self.inner.transport.clone();
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if delay > Duration::ZERO {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Some(Shutdown::Dropped),
                    () = time::sleep(delay) => {}
                }
            }
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Some(Shutdown::Dropped),
                result = transport.reconnect() => result,
            };
            match result {
                Ok(()) => {
                    info!(room = %self.room.room, attempt, "Reconnected");
                    self.inner.set_state(ConnectionState::Connected);
                    return None;
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, next_delay = ?delay, "Reconnect attempt failed");
                }
                Err(e) => return Some(Shutdown::Failed(e.into())),
            }
        }
        Some(Shutdown::Failed(EngineError::NetworkUnreachable(
            "reconnection attempts exhausted".to_string(),
        )))
    }

    async fn shutdown(mut self, reason: Shutdown) {
        let inner = self.inner.clone();
        inner.commands.lock().take();
        inner.pipeline.stop_all();

        let transport = inner.transport.clone();
        let open: Vec<ChannelKey> = inner
            .channels
            .drain()
            .into_iter()
            .filter(|(_, state)| *state != ChannelState::Absent)
            .map(|(key, _)| key)
            .collect();
        for key in &open {
            transport.close_channel(key).await;
        }
        transport.disconnect().await;

        inner.participants.write().clear();
        inner.subscriptions.clear();
        inner.quality.clear();
        self.av_sync.clear();
        self.decoders.clear();
        self.mixer = None;
        inner.pipeline.bind_room(RoomBinding::default());
        inner.pipeline.set_audio_params(None);
        *inner.room.write() = None;

        match reason {
            Shutdown::Exit => {
                inner.set_state(ConnectionState::Disconnected);
                info!(room = %self.room.room, "Exited room");
                inner.delegates.connection.on_exit_room();
                let _ = inner.events.send(RoomEvent::Exited);
            }
            Shutdown::Failed(err) => {
                inner.set_state(ConnectionState::Disconnected);
                error!(room = %self.room.room, code = err.code().as_i32(), error = %err, "Room session ended");
                inner.delegates.error.on_error(&err);
                let _ = inner.events.send(RoomEvent::Closed(err));
            }
            Shutdown::Dropped => {
                inner.state.send_replace(ConnectionState::Disconnected);
                debug!(room = %self.room.room, "Room loop stopped");
            }
        }
    }
}
