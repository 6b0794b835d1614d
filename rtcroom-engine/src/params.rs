//! Room admission parameters and their validation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::frame::AudioCodec;
use crate::transform::{DecryptionDelegate, EncryptionDelegate};
use crate::types::{RoomRef, UserId};

pub const MAX_NUMERIC_ROOM_ID: u32 = 0xFFFF_FFFE;
pub const MAX_STR_ROOM_ID_LEN: usize = 64;
pub const MAX_USER_ID_LEN: usize = 32;

const STR_ROOM_ID_SYMBOLS: &str = " !#$%&()+-:;<=.>?@[]^_{}|~,";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Scene {
    #[default]
    VideoCall,
    AudioCall,
    Live,
    VoiceChat,
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Anchor,
    Audience,
}

/// Identity used to admit a session into a room
///
/// Exactly one of `room_id` (non-zero) and `str_room_id` (non-empty) must
/// be set.
#[derive(Clone, Default)]
pub struct RoomParams {
    pub sdk_app_id: u32,
    pub user_id: String,
    pub user_sig: String,
    pub room_id: u32,
    pub str_room_id: String,
    pub encryption: Option<Arc<dyn EncryptionDelegate>>,
    pub decryption: Option<Arc<dyn DecryptionDelegate>>,
}

impl fmt::Debug for RoomParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomParams")
            .field("sdk_app_id", &self.sdk_app_id)
            .field("user_id", &self.user_id)
            .field("room_id", &self.room_id)
            .field("str_room_id", &self.str_room_id)
            .field("encryption", &self.encryption.is_some())
            .field("decryption", &self.decryption.is_some())
            .finish_non_exhaustive()
    }
}

impl RoomParams {
    pub fn numeric(
        sdk_app_id: u32,
        user_id: impl Into<String>,
        user_sig: impl Into<String>,
        room_id: u32,
    ) -> Self {
        Self {
            sdk_app_id,
            user_id: user_id.into(),
            user_sig: user_sig.into(),
            room_id,
            ..Self::default()
        }
    }

    pub fn named(
        sdk_app_id: u32,
        user_id: impl Into<String>,
        user_sig: impl Into<String>,
        str_room_id: impl Into<String>,
    ) -> Self {
        Self {
            sdk_app_id,
            user_id: user_id.into(),
            user_sig: user_sig.into(),
            str_room_id: str_room_id.into(),
            ..Self::default()
        }
    }

    /// Validate the identity and resolve which room it addresses
    pub fn validate(&self) -> EngineResult<RoomRef> {
        if self.sdk_app_id == 0 {
            return Err(EngineError::InvalidSdkAppId);
        }
        if self.user_id.is_empty() || self.user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::InvalidUserId(format!(
                "user id must be 1..={MAX_USER_ID_LEN} bytes"
            )));
        }
        if self.user_sig.is_empty() {
            return Err(EngineError::InvalidUserSig);
        }
        self.room_ref()
    }

    fn room_ref(&self) -> EngineResult<RoomRef> {
        match (self.room_id, self.str_room_id.is_empty()) {
            (0, true) => Err(EngineError::InvalidRoomId("no room id set".to_string())),
            (id, true) if id > MAX_NUMERIC_ROOM_ID => Err(EngineError::InvalidRoomId(format!(
                "room id {id} is out of range"
            ))),
            (id, true) => Ok(RoomRef::Numeric(id)),
            (0, false) => {
                let name = &self.str_room_id;
                if name.len() > MAX_STR_ROOM_ID_LEN {
                    return Err(EngineError::InvalidRoomId(format!(
                        "string room id exceeds {MAX_STR_ROOM_ID_LEN} bytes"
                    )));
                }
                if let Some(c) = name
                    .chars()
                    .find(|c| !c.is_ascii_alphanumeric() && !STR_ROOM_ID_SYMBOLS.contains(*c))
                {
                    return Err(EngineError::InvalidRoomId(format!(
                        "string room id contains {c:?}"
                    )));
                }
                Ok(RoomRef::Named(name.clone()))
            }
            (_, false) => Err(EngineError::InvalidRoomId(
                "both numeric and string room ids are set".to_string(),
            )),
        }
    }
}

/// Output format of remote audio in the record scene
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Mix all remote audio into one stream instead of per-user delivery
    pub enable_remote_audio_mix: bool,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub output_frame_length_ms: u32,
    pub output_audio_codec: AudioCodec,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            enable_remote_audio_mix: false,
            output_sample_rate: 16_000,
            output_channels: 1,
            output_frame_length_ms: 20,
            output_audio_codec: AudioCodec::Pcm,
        }
    }
}

impl RecordConfig {
    pub fn validate(&self) -> EngineResult<()> {
        validate_audio_format(
            self.output_sample_rate,
            self.output_channels,
            self.output_frame_length_ms,
        )?;
        if self.enable_remote_audio_mix && self.output_audio_codec != AudioCodec::Pcm {
            return Err(EngineError::NotSupported(
                "mixed remote audio is only produced as PCM".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to enter a room
#[derive(Debug, Clone, Default)]
pub struct EnterRoomParams {
    pub room: RoomParams,
    pub scene: Scene,
    pub role: Role,
    pub private_map_key: Option<String>,
    pub record_config: RecordConfig,
    /// Local video is sent as raw pixels and encoded by the engine
    pub use_pixel_frame_input: bool,
    /// Remote video is decoded and delivered as raw pixels
    pub use_pixel_frame_output: bool,
}

impl EnterRoomParams {
    #[must_use]
    pub fn new(room: RoomParams) -> Self {
        Self {
            room,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_scene(mut self, scene: Scene) -> Self {
        self.scene = scene;
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn validate(&self) -> EngineResult<RoomRef> {
        let room = self.room.validate()?;
        if self.scene == Scene::Record {
            self.record_config.validate()?;
        }
        Ok(room)
    }

    #[must_use]
    pub fn local_user(&self) -> UserId {
        UserId::new(self.room.user_id.clone())
    }
}

/// Encode settings of the local audio channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEncodeParams {
    pub channels: u16,
    pub sample_rate: u32,
    pub frame_length_ms: u32,
    pub bitrate_bps: u32,
    /// Frames are sent as PCM and encoded by the engine
    pub need_encode: bool,
}

impl Default for AudioEncodeParams {
    fn default() -> Self {
        Self {
            channels: 1,
            sample_rate: 48_000,
            frame_length_ms: 20,
            bitrate_bps: 51_200,
            need_encode: true,
        }
    }
}

impl AudioEncodeParams {
    pub fn validate(&self) -> EngineResult<()> {
        validate_audio_format(self.sample_rate, self.channels, self.frame_length_ms)?;
        if self.bitrate_bps == 0 {
            return Err(EngineError::invalid_parameter("audio bitrate must be non-zero"));
        }
        Ok(())
    }
}

fn validate_audio_format(sample_rate: u32, channels: u16, frame_length_ms: u32) -> EngineResult<()> {
    if !matches!(sample_rate, 8_000 | 16_000 | 32_000 | 44_100 | 48_000) {
        return Err(EngineError::invalid_parameter(format!(
            "unsupported sample rate {sample_rate}"
        )));
    }
    if !matches!(channels, 1 | 2) {
        return Err(EngineError::invalid_parameter(format!(
            "unsupported channel count {channels}"
        )));
    }
    if !matches!(frame_length_ms, 10 | 20 | 40 | 60) {
        return Err(EngineError::invalid_parameter(format!(
            "unsupported frame length {frame_length_ms} ms"
        )));
    }
    Ok(())
}
