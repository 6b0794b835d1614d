use std::fs::{File, OpenOptions};
use std::sync::Arc;

use anyhow::Context;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Targets with per-channel and per-frame chatter
const FRAME_TARGETS: [&str; 2] = ["rtcroom_engine::pipeline", "rtcroom_engine::session::driver"];

/// Initialize structured logging for the engine
///
/// `RUST_LOG` takes precedence over the configured level. Without it, a
/// `debug` level keeps the frame-level targets at info.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let json = match config.format.to_lowercase().as_str() {
        "json" => true,
        "pretty" => false,
        other => anyhow::bail!("Invalid log format: {other}"),
    };

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directives(level))?,
    };
    let file = config
        .file_path
        .as_deref()
        .map(open_log_file)
        .transpose()?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        let layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true);
        match file {
            Some(file) => registry.with(layer.with_writer(file)).try_init()?,
            None => registry.with(layer).try_init()?,
        }
    } else {
        let layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false);
        match file {
            Some(file) => registry.with(layer.with_writer(file).with_ansi(false)).try_init()?,
            None => registry.with(layer).try_init()?,
        }
    }

    Ok(())
}

fn open_log_file(path: &str) -> anyhow::Result<Arc<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {path}"))?;
    Ok(Arc::new(file))
}

fn default_directives(level: Level) -> String {
    let mut directives = level.as_str().to_lowercase();
    if level == Level::DEBUG {
        for target in FRAME_TARGETS {
            directives.push_str(&format!(",{target}=info"));
        }
    }
    directives
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(parse_log_level("trace").is_ok());
        assert!(parse_log_level("DEBUG").is_ok());
        assert!(parse_log_level("warning").is_ok());
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_frame_targets_follow_the_level() {
        assert_eq!(default_directives(Level::TRACE), "trace");
        assert_eq!(default_directives(Level::WARN), "warn");
        assert_eq!(
            default_directives(Level::DEBUG),
            "debug,rtcroom_engine::pipeline=info,rtcroom_engine::session::driver=info"
        );
    }

    #[test]
    fn test_init_rejects_bad_settings() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());

        let config = LoggingConfig {
            format: "xml".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
