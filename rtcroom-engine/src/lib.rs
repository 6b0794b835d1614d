//! Real-time audio/video room engine
//!
//! A [`RoomSession`] admits a participant into a room over a
//! [`RoomTransport`], manages its send and receive channels and moves
//! audio, video and SEI frames through the [`FramePipeline`]. A
//! [`Recorder`] writes one participant, or a composited mix of all of
//! them, to FLV/MP4/MP3 files. [`LivePusher`] and [`LivePlayer`] cover the
//! one-way live case.

pub mod channel;
pub mod codec;
pub mod delegate;
pub mod error;
pub mod frame;
pub mod live;
pub mod params;
pub mod pipeline;
pub mod quality;
pub mod recorder;
pub mod session;
pub mod subscription;
pub mod transform;
pub mod transport;
pub mod types;

pub use channel::ChannelState;
pub use codec::{CodecFactory, RawI420Codec, VideoDecoder, VideoEncoder};
pub use delegate::{
    ChannelDelegate, ConnectionDelegate, Delegates, ErrorDelegate, MediaDelegate, MembershipDelegate,
    NoopDelegate, QualityDelegate,
};
pub use error::{EngineError, EngineResult, ErrorCode, RecordError};
pub use frame::{AudioCodec, AudioFrame, Frame, PixelFrame, SeiMessage, VideoCodec, VideoFrame, VideoRotation};
pub use live::{LiveDelegate, LivePlayer, LivePusher, LiveTarget, PlayerOption, PushOption};
pub use params::{AudioEncodeParams, EnterRoomParams, RecordConfig, Role, RoomParams, Scene};
pub use pipeline::{ChannelStats, FramePipeline};
pub use quality::{NetworkQuality, QualityReport};
pub use recorder::{RecordDelegate, Recorder, RecorderState};
pub use session::{ActiveRoom, FrameTap, RemoteParticipant, RoomEvent, RoomSession, TappedFrame};
pub use transform::{AesGcmTransform, DecryptionDelegate, EncryptionDelegate};
pub use transport::{MemoryTransport, MemoryTransportHandle, RoomTransport, TransportError, TransportEvent};
pub use types::{ChannelKey, ConnectionState, Direction, RoomRef, StreamType, UserId};
