//! Logging setup: a `tracing` subscriber writing to the configured log
//! file, and additionally to stdout when running verbose in the
//! foreground (never once daemonized, matching the original's
//! stdout-is-the-controlling-terminal assumption).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogLevel};

fn filter_for(level: LogLevel) -> EnvFilter {
    let directive = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warn",
    };
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Writes every line to both a log file and stdout.
struct TeeWriter {
    file: File,
    stdout: io::Stdout,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stdout.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stdout.flush()
    }
}

/// Installs the global tracing subscriber according to `config`. Must be
/// called once, before daemonizing (daemonizing closes stdout).
pub fn init(config: &Config) -> anyhow::Result<()> {
    let filter = filter_for(config.log_level);
    let to_stdout = config.verbose && !config.daemonize;
    let log_file = match &config.log_file {
        Some(path) => Some(open_log_file(path)?),
        None => None,
    };

    let make_writer = move || -> Box<dyn Write> {
        match (&log_file, to_stdout) {
            (Some(file), true) => Box::new(TeeWriter {
                file: file.try_clone().expect("clone log file handle"),
                stdout: io::stdout(),
            }),
            (Some(file), false) => Box::new(file.try_clone().expect("clone log file handle")),
            (None, _) => Box::new(io::stdout()),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .init();

    Ok(())
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", path.display()))
}
