//! Configuration file parsing and CLI overlay.
//!
//! The file format is a flat `key = value` grammar, one setting per
//! line, `#` comments, blank lines ignored. CLI flags take precedence
//! over the file, which takes precedence over built-in defaults.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use crate::error::ConfigError;

const DEFAULT_PLEX_URL: &str = "http://localhost:32400";
const DEFAULT_LOG_FILE: &str = "/var/log/mediawatchd.log";
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 1;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub plex_url: String,
    pub plex_token: String,
    pub scan_interval: Duration,
    pub startup_timeout: Duration,
    pub verbose: bool,
    pub daemonize: bool,
    pub log_file: Option<PathBuf>,
    pub log_level: LogLevel,
    pub extra_directories: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plex_url: DEFAULT_PLEX_URL.to_string(),
            plex_token: String::new(),
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            verbose: false,
            daemonize: false,
            log_file: Some(PathBuf::from(DEFAULT_LOG_FILE)),
            log_level: LogLevel::Info,
            extra_directories: Vec::new(),
        }
    }
}

/// Command-line overlay. Any flag present here wins over the config file.
#[derive(Debug, Parser)]
#[command(name = "mediawatchd", about = "Watches media library subtrees and triggers targeted remote rescans")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Verbose (debug-level) logging to stdout in addition to the log file.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Daemonize: detach from the controlling terminal and run in the background.
    #[arg(short = 'd', long = "daemonize")]
    pub daemonize: bool,

    /// Seconds to keep retrying the initial connection to the remote service.
    #[arg(short = 't', long = "startup-timeout")]
    pub startup_timeout: Option<u64>,
}

/// Builds the effective configuration from a parsed file and CLI overrides.
pub fn load(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    if let Some(path) = &cli.config {
        apply_file(&mut config, path)?;
    }

    if cli.verbose {
        config.verbose = true;
    }
    if cli.daemonize {
        config.daemonize = true;
    }
    if let Some(timeout) = cli.startup_timeout {
        config.startup_timeout = Duration::from_secs(timeout);
    }

    validate(&mut config);
    Ok(config)
}

fn apply_file(config: &mut Config, path: &Path) -> Result<(), ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    for (lineno, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            warn!(path = %path.display(), line = lineno + 1, "ignoring malformed config line");
            continue;
        };
        apply_entry(config, key.trim(), value.trim());
    }

    Ok(())
}

fn apply_entry(config: &mut Config, key: &str, value: &str) {
    if is_directory_key(key) {
        config.extra_directories.push(PathBuf::from(value));
        return;
    }

    match key {
        "plex_url" => config.plex_url = value.to_string(),
        "plex_token" => config.plex_token = value.to_string(),
        "scan_interval" => match value.parse::<u64>() {
            Ok(secs) => config.scan_interval = Duration::from_secs(secs),
            Err(_) => warn!(value, "invalid scan_interval, keeping default"),
        },
        "startup_timeout" => match value.parse::<u64>() {
            Ok(secs) => config.startup_timeout = Duration::from_secs(secs),
            Err(_) => warn!(value, "invalid startup_timeout, keeping default"),
        },
        "verbose" => config.verbose = is_truthy(value),
        "daemonize" => config.daemonize = is_truthy(value),
        "log_file" => config.log_file = Some(PathBuf::from(value)),
        "log_level" => match value.parse::<LogLevel>() {
            Ok(level) => config.log_level = level,
            Err(()) => warn!(value, "unrecognized log_level, keeping default"),
        },
        other => warn!(key = other, "unrecognized config key, ignoring"),
    }
}

fn is_directory_key(key: &str) -> bool {
    key.starts_with("directory[") && key.ends_with(']')
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

fn validate(config: &mut Config) {
    if config.plex_token.is_empty() {
        warn!("plex_token is empty, remote requests will likely be rejected");
    }
    if config.scan_interval.is_zero() {
        warn!("scan_interval must be at least 1 second, resetting to default");
        config.scan_interval = Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS);
    }
    if config.startup_timeout.is_zero() {
        warn!("startup_timeout must be positive, resetting to default");
        config.startup_timeout = Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_file(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_known_keys() {
        let file = write_file(
            "plex_url = http://plex.local:32400\n\
             plex_token = abc123\n\
             scan_interval = 3\n\
             startup_timeout = 30\n\
             verbose = true\n\
             log_level = debug\n",
        );
        let mut config = Config::default();
        apply_file(&mut config, file.path()).unwrap();

        assert_eq!(config.plex_url, "http://plex.local:32400");
        assert_eq!(config.plex_token, "abc123");
        assert_eq!(config.scan_interval, Duration::from_secs(3));
        assert_eq!(config.startup_timeout, Duration::from_secs(30));
        assert!(config.verbose);
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn collects_indexed_directory_keys() {
        let file = write_file("directory[0] = /media/movies\ndirectory[1] = /media/tv\n");
        let mut config = Config::default();
        apply_file(&mut config, file.path()).unwrap();
        assert_eq!(
            config.extra_directories,
            vec![PathBuf::from("/media/movies"), PathBuf::from("/media/tv")]
        );
    }

    #[test]
    fn invalid_numeric_value_keeps_default() {
        let file = write_file("scan_interval = not-a-number\n");
        let mut config = Config::default();
        apply_file(&mut config, file.path()).unwrap();
        assert_eq!(config.scan_interval, Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS));
    }

    #[test]
    fn zero_scan_interval_is_rejected_on_validate() {
        let mut config = Config::default();
        config.scan_interval = Duration::from_secs(0);
        validate(&mut config);
        assert_eq!(config.scan_interval, Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS));
    }

    #[test]
    fn cli_startup_timeout_overrides_file() {
        let file = write_file("startup_timeout = 30\n");
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            verbose: false,
            daemonize: false,
            startup_timeout: Some(90),
        };
        let config = load(&cli).unwrap();
        assert_eq!(config.startup_timeout, Duration::from_secs(90));
    }
}
