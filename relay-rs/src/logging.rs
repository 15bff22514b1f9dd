//! Logging setup using tracing
//!
//! Console output in the configured format (`pretty`, `compact` or `json`)
//! and, when `logging.file` is set, a plain append-only file with one
//! `[timestamp] LEVEL: message` line per event. `RUST_LOG` overrides the
//! configured level.

use crate::config::LoggingConfig;
use crate::error::{RelayError, Result};
use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber
///
/// # Errors
/// Fails on an unknown format, an invalid level directive, an unwritable
/// log file, or when a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| RelayError::Config(format!("Invalid log level '{}': {}", config.level, e)))?,
    };

    let mut layers: Vec<BoxedLayer> = vec![console_layer(&config.format)?];
    if let Some(path) = &config.file {
        layers.push(file_layer(open_log_file(path)?));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| RelayError::Config(format!("Failed to initialize logging: {}", e)))
}

fn console_layer(format: &str) -> Result<BoxedLayer> {
    let layer = fmt::layer().with_target(true);
    match format {
        "pretty" => Ok(layer.pretty().boxed()),
        "compact" => Ok(layer.compact().boxed()),
        "json" => Ok(layer.json().boxed()),
        other => Err(RelayError::Config(format!("Unknown log format: {}", other))),
    }
}

fn open_log_file(path: &str) -> Result<File> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn file_layer(file: File) -> BoxedLayer {
    fmt::layer()
        .with_ansi(false)
        .event_format(LogLine)
        .with_writer(Mutex::new(file))
        .boxed()
}

/// `[2024-05-01T12:00:00.000Z] INFO: message`
struct LogLine;

impl<S, N> FormatEvent<S, N> for LogLine
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(
            writer,
            "[{}] {}: ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_format_rejected() {
        assert!(console_layer("xml").is_err());
        assert!(console_layer("json").is_ok());
    }

    #[test]
    fn test_file_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("relay.log");
        let file = open_log_file(path.to_str().unwrap()).unwrap();

        let subscriber = tracing_subscriber::registry().with(file_layer(file));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Relay started on {}", "127.0.0.1:2525");
            tracing::warn!(queue_id = "abc", "Delivery retry");
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] INFO: Relay started on 127.0.0.1:2525"));
        assert!(lines[1].contains("] WARN: "));
        assert!(lines[1].contains("Delivery retry"));
        assert!(lines[1].contains("queue_id=\"abc\""));
    }

    #[test]
    fn test_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.log");
        std::fs::write(&path, "existing\n").unwrap();

        let file = open_log_file(path.to_str().unwrap()).unwrap();
        let subscriber = tracing_subscriber::registry().with(file_layer(file));
        tracing::subscriber::with_default(subscriber, || tracing::error!("boom"));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("existing\n["));
        assert!(content.trim_end().ends_with("ERROR: boom"));
    }
}
