//! Identifiers and small value types shared by every component

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a room participant
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A room addressed either by number or by string id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomRef {
    Numeric(u32),
    Named(String),
}

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Named(id) => write!(f, "{id}"),
        }
    }
}

/// Classification of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StreamType {
    Audio,
    VideoHigh,
    VideoLow,
    /// Screen share
    VideoAux,
}

impl StreamType {
    pub const VIDEO: [Self; 3] = [Self::VideoHigh, Self::VideoLow, Self::VideoAux];

    /// Numeric value used on the wire and in transforms
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Audio => 1,
            Self::VideoHigh => 2,
            Self::VideoLow => 3,
            Self::VideoAux => 7,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Audio),
            2 => Some(Self::VideoHigh),
            3 => Some(Self::VideoLow),
            7 => Some(Self::VideoAux),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_video(self) -> bool {
        !matches!(self, Self::Audio)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::VideoHigh => "video_high",
            Self::VideoLow => "video_low",
            Self::VideoAux => "video_aux",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

/// Identity of one directional media flow
///
/// Send channels are unique per stream type within the room, receive
/// channels per remote user and stream type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKey {
    Send(StreamType),
    Receive(UserId, StreamType),
}

impl ChannelKey {
    #[must_use]
    pub const fn send(stream_type: StreamType) -> Self {
        Self::Send(stream_type)
    }

    pub fn receive(user_id: impl Into<UserId>, stream_type: StreamType) -> Self {
        Self::Receive(user_id.into(), stream_type)
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::Send(_) => Direction::Send,
            Self::Receive(..) => Direction::Receive,
        }
    }

    #[must_use]
    pub const fn stream_type(&self) -> StreamType {
        match self {
            Self::Send(t) | Self::Receive(_, t) => *t,
        }
    }

    #[must_use]
    pub const fn remote_user(&self) -> Option<&UserId> {
        match self {
            Self::Send(_) => None,
            Self::Receive(user_id, _) => Some(user_id),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send(t) => write!(f, "send/{t}"),
            Self::Receive(user_id, t) => write!(f, "recv/{user_id}/{t}"),
        }
    }
}

/// Connection state of a room session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Init,
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Init => 0,
            Self::Disconnected => 1,
            Self::Connecting => 2,
            Self::Connected => 3,
        }
    }

    /// Whether a new enter request may start from this state
    #[must_use]
    pub const fn can_enter(self) -> bool {
        matches!(self, Self::Init | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_type_codes() {
        for t in [StreamType::Audio, StreamType::VideoHigh, StreamType::VideoLow, StreamType::VideoAux] {
            assert_eq!(StreamType::from_code(t.code()), Some(t));
        }
        assert_eq!(StreamType::from_code(4), None);
        assert!(!StreamType::Audio.is_video());
    }

    #[test]
    fn test_channel_key_accessors() {
        let key = ChannelKey::receive("alice", StreamType::VideoLow);
        assert_eq!(key.direction(), Direction::Receive);
        assert_eq!(key.stream_type(), StreamType::VideoLow);
        assert_eq!(key.remote_user().map(UserId::as_str), Some("alice"));
        assert_eq!(key.to_string(), "recv/alice/video_low");
        assert_eq!(ChannelKey::send(StreamType::Audio).to_string(), "send/audio");
    }

    #[test]
    fn test_room_ref_display() {
        assert_eq!(RoomRef::Numeric(5).to_string(), "5");
        assert_eq!(RoomRef::Named("lobby-1".into()).to_string(), "lobby-1");
    }
}
