use std::{io, path::PathBuf};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::lantern::config::LoggingConfig;

/// Keeps the non-blocking appender worker alive for the process lifetime.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Where log lines go. Anything that is not a well-known stream name is
/// treated as a file path.
#[derive(Debug, PartialEq, Eq)]
enum LogTarget {
    Stderr,
    Stdout,
    File(PathBuf),
}

impl LogTarget {
    fn from_output(output: &str) -> Self {
        match output.trim() {
            "" | "stderr" => LogTarget::Stderr,
            "stdout" => LogTarget::Stdout,
            path => LogTarget::File(PathBuf::from(path)),
        }
    }

    fn open(self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        match self {
            LogTarget::Stderr => Ok(tracing_appender::non_blocking(io::stderr())),
            LogTarget::Stdout => Ok(tracing_appender::non_blocking(io::stdout())),
            LogTarget::File(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("logging: mkdir {}", dir.display()))?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("logging: open {}", path.display()))?;
                Ok(tracing_appender::non_blocking(file))
            }
        }
    }
}

pub fn init(logging: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    // RUST_LOG wins over the configured level when set.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(default_directive(&logging.level)).context("logging: init filter")?
        }
    };

    let (writer, guard) = LogTarget::from_output(&logging.output).open()?;
    let json = logging.format.trim().eq_ignore_ascii_case("json");

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(!json)
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);
    let fmt_layer = if json {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    Ok(LoggingRuntime { _guard: guard })
}

fn default_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_names_map_to_targets() {
        assert_eq!(LogTarget::from_output("stderr"), LogTarget::Stderr);
        assert_eq!(LogTarget::from_output(""), LogTarget::Stderr);
        assert_eq!(LogTarget::from_output(" stdout "), LogTarget::Stdout);
        assert_eq!(
            LogTarget::from_output("/var/log/lantern.log"),
            LogTarget::File(PathBuf::from("/var/log/lantern.log"))
        );
    }

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(default_directive("DEBUG"), "debug");
        assert_eq!(default_directive("verbose"), "info");
        assert_eq!(default_directive(""), "info");
    }
}
