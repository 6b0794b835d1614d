//! Transport port
//!
//! The engine never speaks a wire protocol itself. A [`RoomTransport`]
//! admits the session, opens channels, carries transformed frames and
//! reports remote events; everything above it is transport-agnostic.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{EngineError, ErrorCode};
use crate::frame::{Frame, SeiMessage};
use crate::params::{AudioEncodeParams, EnterRoomParams};
use crate::quality::NetworkSample;
use crate::types::{ChannelKey, StreamType, UserId};

pub use memory::{MemoryTransport, MemoryTransportHandle, SentPacket};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// The server refused the request
    #[error("Rejected by server ({code:?}): {reason}")]
    Rejected { code: ErrorCode, reason: String },

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Rejected { code, .. } => !code.is_fatal(),
            Self::Closed => false,
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Transient(reason) => Self::NetworkUnreachable(reason),
            TransportError::Rejected { code, reason } => Self::from_code(code, reason),
            TransportError::Closed => Self::NetworkUnreachable("transport closed".to_string()),
        }
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// What an outbound worker hands to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Sei(SeiMessage),
}

/// Remote notifications, in the order the server produced them
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    UserEntered(UserId),
    UserLeft(UserId),
    StreamAvailable {
        user_id: UserId,
        stream_type: StreamType,
        available: bool,
    },
    Media {
        user_id: UserId,
        stream_type: StreamType,
        frame: Frame,
    },
    Sei {
        user_id: UserId,
        stream_type: StreamType,
        message: SeiMessage,
    },
    Stats(NetworkSample),
    /// Unexpected network loss; the session reconnects
    ConnectionLost,
    /// Non-retryable removal from the room
    Kicked(ErrorCode),
}

#[async_trait]
pub trait RoomTransport: Send + Sync {
    async fn connect(&self, params: &EnterRoomParams) -> TransportResult<()>;

    /// Resume after `ConnectionLost` without leaving the room
    async fn reconnect(&self) -> TransportResult<()>;

    async fn disconnect(&self);

    /// Open a local send channel or subscribe to a remote stream
    async fn open_channel(
        &self,
        key: &ChannelKey,
        audio: Option<&AudioEncodeParams>,
    ) -> TransportResult<()>;

    async fn close_channel(&self, key: &ChannelKey);

    async fn send(&self, stream_type: StreamType, packet: Outbound) -> TransportResult<()>;

    /// Next remote event; `None` once the transport is gone for good
    async fn next_event(&self) -> Option<TransportEvent>;

    /// Server NTP time in milliseconds
    fn server_time_ms(&self) -> u64;
}
