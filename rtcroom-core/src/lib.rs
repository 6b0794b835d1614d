//! Process-wide configuration and logging for the room engine.
//!
//! Load a [`Config`] once at start-up, initialize logging from its
//! `logging` section, then hand the remaining sections to the engine.

pub mod config;
pub mod logging;

pub use config::{
    Config, LoggingConfig, PipelineConfig, QualityConfig, RecorderConfig, SessionConfig,
};
pub use logging::init_logging;
