//! Recording parameters and output naming

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};
use crate::types::{RoomRef, StreamType, UserId};

pub const MIN_CANVAS_SIDE: u32 = 16;
pub const MAX_CANVAS_SIDE: u32 = 4096;
pub const MIN_FRAME_RATE: u32 = 10;
pub const MAX_FRAME_RATE: u32 = 50;
pub const MAX_LAYOUT_COUNT: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordFileFormat {
    #[default]
    Flv,
    Mp4,
    /// Audio-only recordings
    Mp3,
}

impl RecordFileFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Flv => "flv",
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordType {
    AudioOnly,
    VideoOnly,
    /// Starts with the first video frame
    #[default]
    AudioAndVideo,
}

impl RecordType {
    /// Token used in output file names
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::AudioOnly => "audio",
            Self::VideoOnly => "video",
            Self::AudioAndVideo => "av",
        }
    }

    #[must_use]
    pub const fn has_audio(self) -> bool {
        matches!(self, Self::AudioOnly | Self::AudioAndVideo)
    }

    #[must_use]
    pub const fn has_video(self) -> bool {
        matches!(self, Self::VideoOnly | Self::AudioAndVideo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordMode {
    #[default]
    Single,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LayoutMode {
    /// Layout only changes through `update_layout`
    Manual,
    #[default]
    SpeedDial,
    LinearHorizontal,
    LinearVertical,
}

/// Source of a single-stream recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleRecordParams {
    pub user_id: UserId,
    /// Video stream type; audio always comes from the same user
    pub stream_type: StreamType,
}

impl Default for SingleRecordParams {
    fn default() -> Self {
        Self {
            user_id: UserId::default(),
            stream_type: StreamType::VideoHigh,
        }
    }
}

/// Canvas of a multi-stream recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiRecordParams {
    pub width: u32,
    pub height: u32,
    pub video_frame_rate: u32,
    /// 0xRRGGBB
    pub background_color: u32,
    pub layout_mode: LayoutMode,
    /// Fixed number of layout cells up to [`MAX_LAYOUT_COUNT`]; 0 sizes the
    /// grid to the participants
    pub max_layout_count: u32,
}

impl Default for MultiRecordParams {
    fn default() -> Self {
        Self {
            width: MIN_CANVAS_SIDE,
            height: MIN_CANVAS_SIDE,
            video_frame_rate: 20,
            background_color: 0,
            layout_mode: LayoutMode::SpeedDial,
            max_layout_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordParams {
    pub file_format: RecordFileFormat,
    pub record_type: RecordType,
    /// Empty uses the configured recorder directory
    pub storage_directory: PathBuf,
    /// 0 writes a single file
    pub segment_duration_secs: u32,
    pub record_mode: RecordMode,
    pub single: SingleRecordParams,
    pub multi: MultiRecordParams,
}

impl RecordParams {
    pub fn validate(&self) -> EngineResult<()> {
        if self.file_format == RecordFileFormat::Mp3 && self.record_type != RecordType::AudioOnly {
            return Err(EngineError::invalid_parameter("mp3 output is audio only"));
        }
        match self.record_mode {
            RecordMode::Single => {
                if self.single.user_id.as_str().is_empty() {
                    return Err(EngineError::invalid_parameter(
                        "single-stream recording needs a user id",
                    ));
                }
                if !self.single.stream_type.is_video() {
                    return Err(EngineError::invalid_parameter(
                        "single-stream source must name a video stream type",
                    ));
                }
            }
            RecordMode::Multi => {
                let m = &self.multi;
                for (name, side) in [("width", m.width), ("height", m.height)] {
                    if !(MIN_CANVAS_SIDE..=MAX_CANVAS_SIDE).contains(&side) || side % 2 != 0 {
                        return Err(EngineError::invalid_parameter(format!(
                            "canvas {name} {side} must be even and within {MIN_CANVAS_SIDE}..={MAX_CANVAS_SIDE}"
                        )));
                    }
                }
                if !(MIN_FRAME_RATE..=MAX_FRAME_RATE).contains(&m.video_frame_rate) {
                    return Err(EngineError::invalid_parameter(format!(
                        "frame rate {} is outside {MIN_FRAME_RATE}..={MAX_FRAME_RATE}",
                        m.video_frame_rate
                    )));
                }
                if m.max_layout_count > MAX_LAYOUT_COUNT {
                    return Err(EngineError::invalid_parameter(format!(
                        "layout count {} exceeds {MAX_LAYOUT_COUNT}",
                        m.max_layout_count
                    )));
                }
                if m.background_color > 0x00FF_FFFF {
                    return Err(EngineError::invalid_parameter("background color is 0xRRGGBB"));
                }
            }
        }
        Ok(())
    }

    /// Source part of the output name
    #[must_use]
    pub fn source_label(&self) -> String {
        match self.record_mode {
            RecordMode::Single => self.single.user_id.to_string(),
            RecordMode::Multi => "mixed".to_string(),
        }
    }
}

/// `out_{mode}_{app}_{room}_{source}_f_{start}_e_{stop}.{ext}`
#[must_use]
pub fn output_file_name(
    record_type: RecordType,
    sdk_app_id: u32,
    room: &RoomRef,
    source: &str,
    start_ts: u64,
    stop_ts: u64,
    format: RecordFileFormat,
) -> String {
    format!(
        "out_{}_{sdk_app_id}_{room}_{source}_f_{start_ts}_e_{stop_ts}.{}",
        record_type.token(),
        format.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_file_name_for_mixed_recording() {
        let name = output_file_name(
            RecordType::AudioAndVideo,
            10_000,
            &RoomRef::Numeric(5),
            "mixed",
            100,
            200,
            RecordFileFormat::Flv,
        );
        assert_eq!(name, "out_av_10000_5_mixed_f_100_e_200.flv");
    }

    #[test]
    fn test_output_file_name_for_single_audio() {
        let name = output_file_name(
            RecordType::AudioOnly,
            1,
            &RoomRef::Named("lobby".into()),
            "alice",
            7,
            9,
            RecordFileFormat::Mp3,
        );
        assert_eq!(name, "out_audio_1_lobby_alice_f_7_e_9.mp3");
    }

    #[test]
    fn test_mp3_requires_audio_only() {
        let params = RecordParams {
            file_format: RecordFileFormat::Mp3,
            single: SingleRecordParams {
                user_id: "alice".into(),
                stream_type: StreamType::VideoHigh,
            },
            ..RecordParams::default()
        };
        assert!(matches!(params.validate(), Err(EngineError::InvalidParameter(_))));

        let audio = RecordParams {
            record_type: RecordType::AudioOnly,
            ..params
        };
        assert!(audio.validate().is_ok());
    }

    #[test]
    fn test_multi_canvas_bounds() {
        let mut params = RecordParams {
            record_mode: RecordMode::Multi,
            ..RecordParams::default()
        };
        assert!(params.validate().is_ok());
        params.multi.width = 4098;
        assert!(params.validate().is_err());
        params.multi.width = 17;
        assert!(params.validate().is_err());
        params.multi.width = 640;
        params.multi.video_frame_rate = 60;
        assert!(params.validate().is_err());
        params.multi.video_frame_rate = 20;
        assert_eq!(params.source_label(), "mixed");
    }

    #[test]
    fn test_layout_count_is_capped() {
        let mut params = RecordParams {
            record_mode: RecordMode::Multi,
            ..RecordParams::default()
        };
        params.multi.max_layout_count = 0;
        assert!(params.validate().is_ok());
        params.multi.max_layout_count = MAX_LAYOUT_COUNT;
        assert!(params.validate().is_ok());
        params.multi.max_layout_count = MAX_LAYOUT_COUNT + 1;
        assert!(matches!(params.validate(), Err(EngineError::InvalidParameter(_))));
        params.multi.max_layout_count = u32::MAX;
        assert!(params.validate().is_err());
    }
}
