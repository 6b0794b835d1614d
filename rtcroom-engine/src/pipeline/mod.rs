//! Frame pipeline
//!
//! Send path: `send` validates the frame against the channel and enqueues
//! it on that channel's bounded queue without blocking. One worker task per
//! send channel drains the queue while the session is connected, encodes
//! raw pixels if needed, applies the encryption transform and hands the
//! result to the transport. Destroying the channel cancels the worker and
//! drops whatever is still queued.
//!
//! Receive path: inbound payloads pass the decryption transform; audio for
//! pull-mode playback is re-chunked in a per-user [`PlayoutBuffer`]. Push
//! delivery ordering lives in [`sync::AvSync`], driven by the session.

pub mod mixer;
pub mod playout;
pub mod sei;
pub mod sync;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rtcroom_core::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelManager;
use crate::codec::{CodecFactory, VideoEncoder, VideoEncoderConfig};
use crate::error::{EngineError, EngineResult};
use crate::frame::{AudioCodec, AudioFrame, Frame, SeiMessage, VideoCodec};
use crate::params::AudioEncodeParams;
use crate::transform::{DecryptionDelegate, EncryptionDelegate, TransformContext};
use crate::transport::{Outbound, RoomTransport};
use crate::types::{ChannelKey, ConnectionState, RoomRef, StreamType, UserId};

pub use mixer::{mix_pcm, AudioMixer};
pub use playout::PlayoutBuffer;
pub use sei::{SeiBudget, SEI_MAX_BYTES_PER_SEC, SEI_MAX_MESSAGES_PER_SEC};
pub use sync::{AvSync, SyncTrack, SyncedFrame};

const SEI_CARRIERS: [StreamType; 3] = [StreamType::VideoHigh, StreamType::VideoLow, StreamType::VideoAux];
const PIXEL_INPUT_FRAME_RATE: u32 = 15;

/// Delivery counters of one send channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

struct OutboundQueue {
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    sei: SeiBudget,
    counters: Arc<Counters>,
    bitrate: Arc<AtomicU32>,
}

impl OutboundQueue {
    fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Room-scoped settings bound at enter time
#[derive(Clone, Default)]
pub(crate) struct RoomBinding {
    pub room: Option<RoomRef>,
    pub local_user: UserId,
    pub encryption: Option<Arc<dyn EncryptionDelegate>>,
    pub decryption: Option<Arc<dyn DecryptionDelegate>>,
    pub pixel_input: bool,
}

impl RoomBinding {
    fn context(&self, user_id: &UserId, stream_type: StreamType) -> Option<TransformContext> {
        self.room.as_ref().map(|room| TransformContext {
            room: room.clone(),
            user_id: user_id.clone(),
            stream_type,
        })
    }
}

pub struct FramePipeline {
    config: PipelineConfig,
    channels: Arc<ChannelManager>,
    transport: Arc<dyn RoomTransport>,
    codecs: Option<Arc<dyn CodecFactory>>,
    queues: DashMap<StreamType, OutboundQueue>,
    playout: DashMap<UserId, Mutex<PlayoutBuffer>>,
    binding: RwLock<RoomBinding>,
    audio_params: RwLock<Option<AudioEncodeParams>>,
}

impl FramePipeline {
    pub(crate) fn new(
        config: PipelineConfig,
        channels: Arc<ChannelManager>,
        transport: Arc<dyn RoomTransport>,
        codecs: Option<Arc<dyn CodecFactory>>,
    ) -> Self {
        Self {
            config,
            channels,
            transport,
            codecs,
            queues: DashMap::new(),
            playout: DashMap::new(),
            binding: RwLock::new(RoomBinding::default()),
            audio_params: RwLock::new(None),
        }
    }

    pub(crate) fn bind_room(&self, binding: RoomBinding) {
        *self.binding.write() = binding;
    }

    pub(crate) fn set_audio_params(&self, params: Option<AudioEncodeParams>) {
        *self.audio_params.write() = params;
    }

    /// Spawn the worker of a send channel that just became Ready
    pub(crate) fn start_outbound(
        &self,
        stream_type: StreamType,
        initial_bitrate: u32,
        state: watch::Receiver<ConnectionState>,
    ) {
        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity);
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let bitrate = Arc::new(AtomicU32::new(initial_bitrate));

        let binding = self.binding.read().clone();
        let worker = OutboundWorker {
            stream_type,
            transport: self.transport.clone(),
            context: binding.context(&binding.local_user, stream_type),
            encryption: binding.encryption.clone(),
            codecs: self.codecs.clone(),
            encoder: None,
            applied_bitrate: initial_bitrate,
            bitrate: bitrate.clone(),
            counters: counters.clone(),
        };
        tokio::spawn(worker.run(rx, state, cancel.clone()));

        let replaced = self.queues.insert(
            stream_type,
            OutboundQueue {
                tx,
                cancel,
                sei: SeiBudget::new(),
                counters,
                bitrate,
            },
        );
        if let Some(old) = replaced {
            old.cancel.cancel();
        }
        debug!(stream_type = %stream_type, "Outbound worker started");
    }

    /// Cancel a send channel's worker; queued frames are dropped
    pub(crate) fn stop_outbound(&self, stream_type: StreamType) {
        if let Some((_, queue)) = self.queues.remove(&stream_type) {
            let dropped = queue.len();
            queue.cancel.cancel();
            if dropped > 0 {
                info!(stream_type = %stream_type, dropped, "Dropped queued frames of destroyed channel");
            }
        }
    }

    pub(crate) fn stop_all(&self) {
        let types: Vec<StreamType> = self.queues.iter().map(|q| *q.key()).collect();
        for stream_type in types {
            self.stop_outbound(stream_type);
        }
        self.playout.clear();
    }

    /// Non-blocking enqueue of a local frame
    pub fn send(&self, stream_type: StreamType, frame: Frame) -> EngineResult<()> {
        self.channels.ensure_ready(&ChannelKey::Send(stream_type))?;
        frame.validate()?;
        self.check_kind(stream_type, &frame)?;

        let queue = self
            .queues
            .get(&stream_type)
            .ok_or_else(|| EngineError::invalid_operation(format!("no send queue for {stream_type}")))?;
        match queue.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                queue.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::Failed(format!("send queue of {stream_type} is full")))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::invalid_operation(format!(
                "channel {stream_type} is shutting down"
            ))),
        }
    }

    fn check_kind(&self, stream_type: StreamType, frame: &Frame) -> EngineResult<()> {
        match (stream_type, frame) {
            (StreamType::Audio, Frame::Audio(audio)) => {
                let need_encode = self.audio_params.read().as_ref().map_or(true, |p| p.need_encode);
                if need_encode != (audio.codec == AudioCodec::Pcm) {
                    return Err(EngineError::invalid_parameter(if need_encode {
                        "audio channel expects PCM frames"
                    } else {
                        "audio channel expects encoded frames"
                    }));
                }
                Ok(())
            }
            (t, Frame::Video(_)) if t.is_video() => Ok(()),
            (t, Frame::Pixel(_)) if t.is_video() => {
                if !self.binding.read().pixel_input {
                    return Err(EngineError::invalid_operation("pixel input is not enabled for this room"));
                }
                if self.codecs.is_none() {
                    return Err(EngineError::NotSupported("no codec registered for pixel input".to_string()));
                }
                Ok(())
            }
            _ => Err(EngineError::invalid_parameter(format!(
                "frame kind does not match stream type {stream_type}"
            ))),
        }
    }

    /// Enqueue an SEI message on the first Ready video send channel
    pub fn send_sei(&self, message: SeiMessage) -> EngineResult<StreamType> {
        let message = SeiMessage::new(message.message_type, message.payload)?;
        let stream_type = SEI_CARRIERS
            .into_iter()
            .find(|t| self.channels.is_ready(&ChannelKey::Send(*t)) && self.queues.contains_key(t))
            .ok_or_else(|| EngineError::invalid_operation("no Ready video send channel carries SEI"))?;

        let queue = self
            .queues
            .get(&stream_type)
            .ok_or_else(|| EngineError::invalid_operation(format!("no send queue for {stream_type}")))?;
        if queue.tx.capacity() == 0 {
            return Err(EngineError::Failed(format!("send queue of {stream_type} is full")));
        }
        queue.sei.try_consume(&message)?;
        queue
            .tx
            .try_send(Outbound::Sei(message))
            .map_err(|_| EngineError::Failed(format!("send queue of {stream_type} is unavailable")))?;
        Ok(stream_type)
    }

    /// Frames waiting in a send channel's queue
    #[must_use]
    pub fn queued(&self, stream_type: StreamType) -> usize {
        self.queues.get(&stream_type).map_or(0, |q| q.len())
    }

    #[must_use]
    pub fn stats(&self, stream_type: StreamType) -> Option<ChannelStats> {
        self.queues.get(&stream_type).map(|q| q.counters.snapshot())
    }

    pub(crate) fn apply_bitrate(&self, stream_type: StreamType, bitrate_bps: u32) {
        if let Some(queue) = self.queues.get(&stream_type) {
            queue.bitrate.store(bitrate_bps, Ordering::Relaxed);
        }
    }

    /// Run the decryption transform; `None` drops the frame
    pub(crate) fn open_inbound(&self, user_id: &UserId, stream_type: StreamType, frame: Frame) -> Option<Frame> {
        let binding = self.binding.read();
        let Some(decryption) = binding.decryption.as_ref() else {
            return Some(frame);
        };
        let ctx = binding.context(user_id, stream_type)?;
        let mut plain = Vec::with_capacity(frame.payload().len());
        if decryption.decrypt(&ctx, frame.payload(), &mut plain) {
            Some(frame.with_payload(Bytes::from(plain)))
        } else {
            warn!(user_id = %user_id, stream_type = %stream_type, pts = frame.pts(), "Decryption failed, dropping frame");
            None
        }
    }

    pub(crate) fn push_playout(&self, user_id: &UserId, frame: AudioFrame) {
        self.playout
            .entry(user_id.clone())
            .or_insert_with(|| {
                Mutex::new(PlayoutBuffer::new(
                    self.config.playout_frame_ms,
                    self.config.playout_buffer_ms,
                ))
            })
            .lock()
            .push(frame);
    }

    /// Non-blocking pull of the next playout frame of a user
    pub fn pull_audio(&self, user_id: &UserId) -> EngineResult<AudioFrame> {
        self.playout
            .get(user_id)
            .and_then(|buffer| buffer.lock().pop())
            .ok_or(EngineError::TryAgain)
    }

    pub(crate) fn remove_user(&self, user_id: &UserId) {
        self.playout.remove(user_id);
    }
}

struct OutboundWorker {
    stream_type: StreamType,
    transport: Arc<dyn RoomTransport>,
    context: Option<TransformContext>,
    encryption: Option<Arc<dyn EncryptionDelegate>>,
    codecs: Option<Arc<dyn CodecFactory>>,
    encoder: Option<Box<dyn VideoEncoder>>,
    applied_bitrate: u32,
    bitrate: Arc<AtomicU32>,
    counters: Arc<Counters>,
}

/// Wait until the session is connected; false once the session is gone
async fn wait_connected(state: &mut watch::Receiver<ConnectionState>) -> bool {
    loop {
        let current = *state.borrow_and_update();
        if current == ConnectionState::Connected {
            return true;
        }
        if state.changed().await.is_err() {
            return false;
        }
    }
}

impl OutboundWorker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Outbound>,
        mut state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        loop {
            let packet = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                packet = rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            // frames wait in the queue while the session reconnects
            let connected = tokio::select! {
                biased;
                () = cancel.cancelled() => false,
                connected = wait_connected(&mut state) => connected,
            };
            if !connected {
                break;
            }

            let Some(packet) = self.prepare(packet) else {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let bytes = match &packet {
                Outbound::Frame(frame) => frame.payload().len(),
                Outbound::Sei(message) => message.payload.len(),
            };
            match self.transport.send(self.stream_type, packet).await {
                Ok(()) => {
                    self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                    self.counters.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
                    trace!(stream_type = %self.stream_type, bytes, "Frame sent");
                }
                Err(e) => {
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(stream_type = %self.stream_type, error = %e, "Transport send failed");
                }
            }
        }
        debug!(stream_type = %self.stream_type, "Outbound worker stopped");
    }

    /// Encode raw pixels and apply the encryption transform
    fn prepare(&mut self, packet: Outbound) -> Option<Outbound> {
        let frame = match packet {
            Outbound::Sei(message) => return Some(Outbound::Sei(message)),
            Outbound::Frame(Frame::Pixel(picture)) => {
                let force_key = self.encoder.is_none();
                let encoder = self.encoder()?;
                match encoder.encode(&picture, force_key) {
                    Ok(encoded) => Frame::Video(encoded),
                    Err(e) => {
                        warn!(stream_type = %self.stream_type, error = %e, "Encoding failed, dropping frame");
                        return None;
                    }
                }
            }
            Outbound::Frame(frame) => frame,
        };

        let (Some(encryption), Some(ctx)) = (&self.encryption, &self.context) else {
            return Some(Outbound::Frame(frame));
        };
        let mut sealed = Vec::with_capacity(frame.payload().len() + 32);
        if encryption.encrypt(ctx, frame.payload(), &mut sealed) {
            Some(Outbound::Frame(frame.with_payload(Bytes::from(sealed))))
        } else {
            warn!(stream_type = %self.stream_type, pts = frame.pts(), "Encryption failed, dropping frame");
            None
        }
    }

    fn encoder(&mut self) -> Option<&mut Box<dyn VideoEncoder>> {
        let target = self.bitrate.load(Ordering::Relaxed);
        if self.encoder.is_none() {
            let config = VideoEncoderConfig {
                codec: VideoCodec::H264,
                bitrate_bps: target,
                frame_rate: PIXEL_INPUT_FRAME_RATE,
            };
            match self.codecs.as_ref()?.video_encoder(&config) {
                Ok(encoder) => {
                    self.encoder = Some(encoder);
                    self.applied_bitrate = target;
                }
                Err(e) => {
                    warn!(stream_type = %self.stream_type, error = %e, "Cannot create video encoder");
                    return None;
                }
            }
        }
        let encoder = self.encoder.as_mut()?;
        if target != self.applied_bitrate {
            encoder.set_bitrate(target);
            self.applied_bitrate = target;
        }
        Some(encoder)
    }
}
