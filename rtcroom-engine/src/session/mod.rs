//! Room session
//!
//! [`RoomSession`] owns the connection state machine and room membership.
//! Entering a room spawns one delivery loop per room (see `driver`) which
//! serializes every transport event, channel completion and delegate
//! callback; the public methods only validate, mutate shared registries and
//! post commands to that loop, so they never block.
//!
//! ```text
//!  Init ──enter──▶ Connecting ──admitted──▶ Connected ──exit──▶ Disconnected
//!                      ▲                        │
//!                      └──── network loss ──────┘
//! ```

mod driver;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rtcroom_core::Config;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::channel::{ChannelManager, ChannelState};
use crate::codec::CodecFactory;
use crate::delegate::Delegates;
use crate::error::{EngineError, EngineResult};
use crate::frame::{AudioFrame, Frame, PixelFrame, SeiMessage, VideoFrame};
use crate::params::{AudioEncodeParams, EnterRoomParams, RecordConfig, Role, Scene};
use crate::pipeline::{ChannelStats, FramePipeline, RoomBinding};
use crate::quality::QualityMonitor;
use crate::subscription::SubscriptionRegistry;
use crate::transport::RoomTransport;
use crate::types::{ChannelKey, ConnectionState, RoomRef, StreamType, UserId};

/// A remote participant currently in the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteParticipant {
    pub user_id: UserId,
    pub streams: BTreeSet<StreamType>,
    /// Order in which participants entered
    pub join_order: u64,
}

/// The room a session is currently bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRoom {
    pub sdk_app_id: u32,
    pub room: RoomRef,
    pub local_user: UserId,
    pub scene: Scene,
    pub role: Role,
    pub record_config: RecordConfig,
    pub pixel_output: bool,
}

/// Membership and lifecycle notifications for in-engine consumers
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    UserEntered(UserId),
    UserLeft(UserId),
    StreamAvailable {
        user_id: UserId,
        stream_type: StreamType,
        available: bool,
    },
    Exited,
    /// The room ended with a non-recoverable error
    Closed(EngineError),
}

/// An inbound frame copied to a tap after decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TappedFrame {
    pub user_id: UserId,
    pub stream_type: StreamType,
    pub frame: Frame,
}

/// Receiving end of an inbound frame tap; dropping it detaches the tap
pub struct FrameTap {
    id: u64,
    rx: mpsc::Receiver<TappedFrame>,
    taps: Arc<DashMap<u64, mpsc::Sender<TappedFrame>>>,
}

impl FrameTap {
    pub async fn recv(&mut self) -> Option<TappedFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TappedFrame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for FrameTap {
    fn drop(&mut self) {
        self.taps.remove(&self.id);
    }
}

pub(crate) enum Command {
    ChannelOpened {
        key: ChannelKey,
        generation: u64,
        result: EngineResult<()>,
    },
    ChannelClosed {
        key: ChannelKey,
        generation: u64,
    },
    Exit,
}

pub(crate) struct SessionInner {
    pub(crate) config: Arc<Config>,
    pub(crate) transport: Arc<dyn RoomTransport>,
    pub(crate) delegates: Delegates,
    pub(crate) codecs: Option<Arc<dyn CodecFactory>>,
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) channels: Arc<ChannelManager>,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) pipeline: FramePipeline,
    pub(crate) quality: QualityMonitor,
    pub(crate) participants: RwLock<HashMap<UserId, RemoteParticipant>>,
    pub(crate) room: RwLock<Option<ActiveRoom>>,
    pub(crate) commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    pub(crate) cancel: Mutex<CancellationToken>,
    pub(crate) events: broadcast::Sender<RoomEvent>,
    pub(crate) taps: Arc<DashMap<u64, mpsc::Sender<TappedFrame>>>,
    next_tap: AtomicU64,
    pub(crate) join_seq: AtomicU64,
}

impl SessionInner {
    pub(crate) fn set_state(&self, new: ConnectionState) {
        let old = self.state.send_replace(new);
        if old != new {
            info!(old = %old, new = %new, "Connection state changed");
            self.delegates.connection.on_connection_state_changed(old, new);
        }
    }

    fn command_sender(&self) -> EngineResult<mpsc::UnboundedSender<Command>> {
        self.commands
            .lock()
            .clone()
            .ok_or_else(|| EngineError::invalid_operation("not in a room"))
    }

    /// Move a channel to Creating and ask the transport to open it
    pub(crate) fn open_channel(&self, key: ChannelKey, audio: Option<AudioEncodeParams>) -> EngineResult<()> {
        let tx = self.command_sender()?;
        let generation = self.channels.begin_create(&key)?;
        debug!(channel = %key, generation, "Opening channel");

        let transport = self.transport.clone();
        tokio::spawn(async move {
            let result = transport
                .open_channel(&key, audio.as_ref())
                .await
                .map_err(EngineError::from);
            let _ = tx.send(Command::ChannelOpened {
                key,
                generation,
                result,
            });
        });
        Ok(())
    }

    /// Move a channel to Destroying and ask the transport to close it
    pub(crate) fn close_channel(&self, key: ChannelKey) -> EngineResult<()> {
        let tx = self.command_sender()?;
        let generation = self.channels.begin_destroy(&key)?;
        if let ChannelKey::Send(stream_type) = &key {
            self.pipeline.stop_outbound(*stream_type);
        }
        debug!(channel = %key, generation, "Closing channel");

        let transport = self.transport.clone();
        tokio::spawn(async move {
            transport.close_channel(&key).await;
            let _ = tx.send(Command::ChannelClosed { key, generation });
        });
        Ok(())
    }

    fn ensure_connected(&self) -> EngineResult<()> {
        let state = *self.state.borrow();
        if state == ConnectionState::Connected {
            Ok(())
        } else {
            Err(EngineError::invalid_operation(format!("session is {state}")))
        }
    }

    fn active_room(&self) -> EngineResult<ActiveRoom> {
        self.room
            .read()
            .clone()
            .ok_or_else(|| EngineError::invalid_operation("not in a room"))
    }

    fn stream_available(&self, user_id: &UserId, stream_type: StreamType) -> bool {
        self.participants
            .read()
            .get(user_id)
            .is_some_and(|p| p.streams.contains(&stream_type))
    }
}

struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.inner.cancel.lock().cancel();
    }
}

/// One participant's membership in one room
///
/// Cheap to clone; the room loop stops when the last clone is dropped.
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct RoomSession {
    handle: Arc<SessionHandle>,
}

impl RoomSession {
    pub fn new(config: Arc<Config>, transport: Arc<dyn RoomTransport>, delegates: Delegates) -> Self {
        Self::build(config, transport, delegates, None)
    }

    /// Session with a codec collaborator for pixel input/output
    pub fn with_codecs(
        config: Arc<Config>,
        transport: Arc<dyn RoomTransport>,
        delegates: Delegates,
        codecs: Arc<dyn CodecFactory>,
    ) -> Self {
        Self::build(config, transport, delegates, Some(codecs))
    }

    fn build(
        config: Arc<Config>,
        transport: Arc<dyn RoomTransport>,
        delegates: Delegates,
        codecs: Option<Arc<dyn CodecFactory>>,
    ) -> Self {
        let channels = Arc::new(ChannelManager::new());
        let (state, _) = watch::channel(ConnectionState::Init);
        let (events, _) = broadcast::channel(config.session.event_capacity.max(1));
        let inner = SessionInner {
            pipeline: FramePipeline::new(
                config.pipeline.clone(),
                channels.clone(),
                transport.clone(),
                codecs.clone(),
            ),
            subscriptions: SubscriptionRegistry::new(config.session.auto_subscribe),
            quality: QualityMonitor::new(config.quality.clone()),
            config,
            transport,
            delegates,
            codecs,
            state,
            channels,
            participants: RwLock::new(HashMap::new()),
            room: RwLock::new(None),
            commands: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
            events,
            taps: Arc::new(DashMap::new()),
            next_tap: AtomicU64::new(0),
            join_seq: AtomicU64::new(0),
        };
        Self {
            handle: Arc::new(SessionHandle {
                inner: Arc::new(inner),
            }),
        }
    }

    fn inner(&self) -> &Arc<SessionInner> {
        &self.handle.inner
    }

    /// Start entering a room
    ///
    /// Parameters are validated synchronously; on failure nothing changes.
    /// Admission completes later through `on_enter_room` or `on_error`.
    pub fn enter_room(&self, params: EnterRoomParams) -> EngineResult<()> {
        let inner = self.inner();
        let room = params.validate()?;
        if params.use_pixel_frame_output && inner.codecs.is_none() {
            return Err(EngineError::NotSupported(
                "pixel output needs a codec factory".to_string(),
            ));
        }

        let mut previous = ConnectionState::Init;
        let moved = inner.state.send_if_modified(|state| {
            if state.can_enter() {
                previous = *state;
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !moved {
            return Err(EngineError::invalid_operation("already in a room"));
        }

        let active = ActiveRoom {
            sdk_app_id: params.room.sdk_app_id,
            room: room.clone(),
            local_user: params.local_user(),
            scene: params.scene,
            role: params.role,
            record_config: params.record_config.clone(),
            pixel_output: params.use_pixel_frame_output,
        };
        inner.pipeline.bind_room(RoomBinding {
            room: Some(room.clone()),
            local_user: active.local_user.clone(),
            encryption: params.room.encryption.clone(),
            decryption: params.room.decryption.clone(),
            pixel_input: params.use_pixel_frame_input,
        });
        *inner.room.write() = Some(active);

        let (tx, rx) = mpsc::unbounded_channel();
        *inner.commands.lock() = Some(tx);
        let cancel = CancellationToken::new();
        *inner.cancel.lock() = cancel.clone();

        info!(room = %room, user_id = %params.room.user_id, scene = ?params.scene, role = ?params.role, "Entering room");
        tokio::spawn(driver::run_room(inner.clone(), params, rx, cancel, previous));
        Ok(())
    }

    /// Leave the room; only honored while connected
    pub fn exit_room(&self) -> EngineResult<()> {
        let inner = self.inner();
        inner.ensure_connected()?;
        inner
            .command_sender()?
            .send(Command::Exit)
            .map_err(|_| EngineError::invalid_operation("room loop has stopped"))
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner().state.borrow()
    }

    /// Watch connection state transitions
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner().state.subscribe()
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner().events.subscribe()
    }

    #[must_use]
    pub fn active_room(&self) -> Option<ActiveRoom> {
        self.inner().room.read().clone()
    }

    /// Remote participants in join order
    #[must_use]
    pub fn remote_participants(&self) -> Vec<RemoteParticipant> {
        let mut participants: Vec<RemoteParticipant> =
            self.inner().participants.read().values().cloned().collect();
        participants.sort_by_key(|p| p.join_order);
        participants
    }

    #[must_use]
    pub fn server_time_ms(&self) -> u64 {
        self.inner().transport.server_time_ms()
    }

    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.inner().config
    }

    pub(crate) fn codecs(&self) -> Option<Arc<dyn CodecFactory>> {
        self.inner().codecs.clone()
    }

    /// Receive a copy of every inbound frame after decryption
    pub fn add_frame_tap(&self) -> FrameTap {
        self.add_frame_tap_with_capacity(self.inner().config.pipeline.tap_queue_capacity)
    }

    pub(crate) fn add_frame_tap_with_capacity(&self, capacity: usize) -> FrameTap {
        let inner = self.inner();
        let id = inner.next_tap.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        inner.taps.insert(id, tx);
        FrameTap {
            id,
            rx,
            taps: inner.taps.clone(),
        }
    }

    pub fn subscribe(&self, user_id: &UserId, stream_type: StreamType) -> EngineResult<()> {
        let inner = self.inner();
        inner.ensure_connected()?;
        if inner.subscriptions.subscribe(user_id, stream_type) {
            debug!(user_id = %user_id, stream_type = %stream_type, "Subscribed");
        }
        let key = ChannelKey::Receive(user_id.clone(), stream_type);
        if inner.stream_available(user_id, stream_type) && inner.channels.state(&key) == ChannelState::Absent {
            inner.open_channel(key, None)?;
        }
        Ok(())
    }

    /// Stop receiving a stream; succeeds even if nothing was being received
    pub fn unsubscribe(&self, user_id: &UserId, stream_type: StreamType) -> EngineResult<()> {
        let inner = self.inner();
        inner.ensure_connected()?;
        if inner.subscriptions.unsubscribe(user_id, stream_type) {
            debug!(user_id = %user_id, stream_type = %stream_type, "Unsubscribed");
        }
        if stream_type == StreamType::Audio {
            inner.pipeline.remove_user(user_id);
        }
        let key = ChannelKey::Receive(user_id.clone(), stream_type);
        if matches!(inner.channels.state(&key), ChannelState::Creating | ChannelState::Ready) {
            inner.close_channel(key)?;
        }
        Ok(())
    }

    fn ensure_can_publish(&self) -> EngineResult<()> {
        let inner = self.inner();
        inner.ensure_connected()?;
        if inner.active_room()?.role == Role::Audience {
            return Err(EngineError::invalid_operation("audience cannot publish"));
        }
        Ok(())
    }

    pub fn create_local_audio_channel(&self, params: AudioEncodeParams) -> EngineResult<()> {
        params.validate()?;
        self.ensure_can_publish()?;
        let inner = self.inner();
        inner.open_channel(ChannelKey::Send(StreamType::Audio), Some(params.clone()))?;
        inner.pipeline.set_audio_params(Some(params));
        Ok(())
    }

    pub fn destroy_local_audio_channel(&self) -> EngineResult<()> {
        self.inner().close_channel(ChannelKey::Send(StreamType::Audio))
    }

    pub fn create_local_video_channel(&self, stream_type: StreamType) -> EngineResult<()> {
        if !stream_type.is_video() {
            return Err(EngineError::invalid_parameter(format!(
                "{stream_type} is not a video stream type"
            )));
        }
        self.ensure_can_publish()?;
        self.inner().open_channel(ChannelKey::Send(stream_type), None)
    }

    pub fn destroy_local_video_channel(&self, stream_type: StreamType) -> EngineResult<()> {
        if !stream_type.is_video() {
            return Err(EngineError::invalid_parameter(format!(
                "{stream_type} is not a video stream type"
            )));
        }
        self.inner().close_channel(ChannelKey::Send(stream_type))
    }

    pub fn send_audio_frame(&self, frame: AudioFrame) -> EngineResult<()> {
        self.inner().pipeline.send(StreamType::Audio, Frame::Audio(frame))
    }

    pub fn send_video_frame(&self, stream_type: StreamType, frame: VideoFrame) -> EngineResult<()> {
        self.inner().pipeline.send(stream_type, Frame::Video(frame))
    }

    pub fn send_pixel_frame(&self, stream_type: StreamType, frame: PixelFrame) -> EngineResult<()> {
        self.inner().pipeline.send(stream_type, Frame::Pixel(frame))
    }

    /// Send an SEI message; returns the stream it rides on
    pub fn send_sei_message(&self, message_type: u8, payload: Bytes) -> EngineResult<StreamType> {
        let message = SeiMessage::new(message_type, payload)?;
        self.inner().pipeline.send_sei(message)
    }

    /// Poll the next 20 ms-class playout frame of a remote user
    pub fn get_audio_frame(&self, user_id: &UserId) -> EngineResult<AudioFrame> {
        let inner = self.inner();
        let room = inner.active_room()?;
        if room.scene == Scene::Record {
            return Err(EngineError::invalid_operation(
                "remote audio is pushed in the record scene",
            ));
        }
        if !inner.participants.read().contains_key(user_id) {
            return Err(EngineError::invalid_parameter(format!("{user_id} is not in the room")));
        }
        inner.pipeline.pull_audio(user_id)
    }

    #[must_use]
    pub fn channel_state(&self, key: &ChannelKey) -> ChannelState {
        self.inner().channels.state(key)
    }

    /// Frames waiting in a send channel's queue
    #[must_use]
    pub fn queued_frames(&self, stream_type: StreamType) -> usize {
        self.inner().pipeline.queued(stream_type)
    }

    #[must_use]
    pub fn channel_stats(&self, stream_type: StreamType) -> Option<ChannelStats> {
        self.inner().pipeline.stats(stream_type)
    }

    /// Current advisory bitrate of a local video stream
    #[must_use]
    pub fn video_bitrate_target(&self, stream_type: StreamType) -> Option<u32> {
        self.inner().quality.bitrate_target(stream_type)
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("state", &self.connection_state())
            .field("room", &self.active_room().map(|r| r.room))
            .finish_non_exhaustive()
    }
}
