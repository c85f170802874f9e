//! Per-component error types.
//!
//! Each core module returns its own error enum; `main` composes them
//! under `anyhow::Result`. Inside the event loop itself errors are
//! handled locally (logged and skipped) rather than propagated.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to open directory {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to register watch on {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected response status {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("failed to parse response body: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },
    #[error("response had an unexpected shape: {0}")]
    Shape(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
