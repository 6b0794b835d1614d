use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration, applied once before any session is created
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub session: SessionConfig,
    pub pipeline: PipelineConfig,
    pub quality: QualityConfig,
    pub recorder: RecorderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Room session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reconnection attempts after an unexpected network loss
    pub reconnect_max_attempts: usize,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Subscribe to every available remote stream unless overridden
    pub auto_subscribe: bool,
    /// Capacity of the room event broadcast used by recorders
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_max_attempts: 5,
            reconnect_min_delay_ms: 200,
            reconnect_max_delay_ms: 5_000,
            auto_subscribe: true,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn reconnect_min_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_delay_ms)
    }

    #[must_use]
    pub const fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

/// Frame pipeline buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Outbound frames buffered per send channel
    pub send_queue_capacity: usize,
    /// Frames buffered per recorder tap before the tap starts dropping
    pub tap_queue_capacity: usize,
    /// Longest time a frame is held back waiting for its A/V counterpart
    pub av_sync_window_ms: u32,
    /// Pull-mode audio kept per remote user
    pub playout_buffer_ms: u32,
    /// Frame length returned by a single audio pull
    pub playout_frame_ms: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
            tap_queue_capacity: 512,
            av_sync_window_ms: 200,
            playout_buffer_ms: 500,
            playout_frame_ms: 20,
        }
    }
}

/// Network quality evaluation and bitrate feedback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub interval_ms: u64,
    /// Samples older than this are ignored
    pub window_ms: u64,
    pub rtt_good_ms: u32,
    pub rtt_bad_ms: u32,
    /// Loss ratios in `[0, 1]`
    pub loss_good: f64,
    pub loss_bad: f64,
    pub initial_bitrate_bps: u32,
    pub min_bitrate_bps: u32,
    pub max_bitrate_bps: u32,
    pub increase_step_bps: u32,
    pub decrease_factor: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            window_ms: 10_000,
            rtt_good_ms: 150,
            rtt_bad_ms: 400,
            loss_good: 0.02,
            loss_bad: 0.10,
            initial_bitrate_bps: 1_200_000,
            min_bitrate_bps: 100_000,
            max_bitrate_bps: 4_000_000,
            increase_step_bps: 100_000,
            decrease_factor: 0.7,
        }
    }
}

impl QualityConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Recorder defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Used when a recording does not name its own directory
    pub storage_directory: String,
    pub progress_interval_ms: u64,
    pub frame_queue_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            storage_directory: ".".to_string(),
            progress_interval_ms: 1_000,
            frame_queue_capacity: 1_024,
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then environment overrides
    ///
    /// Environment variables use the `RTCROOM` prefix and `__` between
    /// nesting levels, e.g. `RTCROOM_QUALITY__INTERVAL_MS=1000`.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("RTCROOM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.pipeline.send_queue_capacity == 0 || self.pipeline.tap_queue_capacity == 0 {
            return invalid("pipeline queue capacities must be non-zero");
        }
        if self.pipeline.playout_frame_ms == 0
            || self.pipeline.playout_buffer_ms < self.pipeline.playout_frame_ms
        {
            return invalid("playout buffer must hold at least one frame");
        }
        if self.quality.interval_ms == 0 {
            return invalid("quality interval must be non-zero");
        }
        if self.quality.min_bitrate_bps > self.quality.max_bitrate_bps {
            return invalid("quality min bitrate exceeds max bitrate");
        }
        if !(0.0..1.0).contains(&self.quality.decrease_factor) {
            return invalid("quality decrease factor must be in [0, 1)");
        }
        if self.quality.loss_good > self.quality.loss_bad
            || self.quality.rtt_good_ms > self.quality.rtt_bad_ms
        {
            return invalid("quality thresholds are inverted");
        }
        if self.session.reconnect_min_delay_ms > self.session.reconnect_max_delay_ms {
            return invalid("reconnect min delay exceeds max delay");
        }
        if self.session.event_capacity == 0 || self.recorder.frame_queue_capacity == 0 {
            return invalid("event and recorder queue capacities must be non-zero");
        }
        Ok(())
    }
}
