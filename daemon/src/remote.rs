//! Client for the remote media-indexing service: library enumeration
//! and targeted rescan triggers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::RemoteError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One library section and the filesystem roots it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub section_id: i64,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct SectionsResponse {
    #[serde(rename = "MediaContainer")]
    media_container: MediaContainer,
}

#[derive(Debug, Deserialize)]
struct MediaContainer {
    #[serde(rename = "Directory", default)]
    directory: Vec<DirectorySection>,
}

#[derive(Debug, Deserialize)]
struct DirectorySection {
    key: String,
    #[serde(rename = "Location", default)]
    location: Vec<LocationEntry>,
}

#[derive(Debug, Deserialize)]
struct LocationEntry {
    path: String,
}

pub struct RemoteClient {
    client: reqwest::blocking::Client,
    base_url: String,
    token: String,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, RemoteError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| RemoteError::Request {
                url: String::new(),
                source,
            })?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    /// Fetches every library section and the directory roots it covers.
    pub fn get_libraries(&self) -> Result<Vec<Library>, RemoteError> {
        let url = format!("{}/library/sections", self.base_url.trim_end_matches('/'));
        let body = self.get(&url)?;
        parse_sections_body(&body)
    }

    /// Asks the remote service to rescan `path` under `section`.
    pub fn trigger_scan(&self, section: i64, path: &Path) -> Result<(), RemoteError> {
        let escaped = urlencoding::encode(&path.to_string_lossy()).into_owned();
        let url = format!(
            "{}/library/sections/{}/refresh?path={}",
            self.base_url.trim_end_matches('/'),
            section,
            escaped
        );
        self.get(&url)?;
        Ok(())
    }

    fn get(&self, url: &str) -> Result<String, RemoteError> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .header("X-Plex-Token", &self.token)
            .send()
            .map_err(|source| RemoteError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().map_err(|source| RemoteError::Request {
            url: url.to_string(),
            source,
        })
    }
}

fn parse_sections_body(body: &str) -> Result<Vec<Library>, RemoteError> {
    let parsed: SectionsResponse =
        serde_json::from_str(body).map_err(|source| RemoteError::Parse { source })?;

    let mut libraries = Vec::new();
    for section in parsed.media_container.directory {
        let Ok(section_id) = section.key.parse::<i64>() else {
            warn!(key = %section.key, "library section key is not numeric, skipping");
            continue;
        };
        if section.location.is_empty() {
            return Err(RemoteError::Shape(format!(
                "library section {section_id} has no Location entries"
            )));
        }
        let paths = section.location.into_iter().map(|l| PathBuf::from(l.path)).collect();
        libraries.push(Library { section_id, paths });
    }

    Ok(libraries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_with_multiple_locations() {
        let body = r#"{
            "MediaContainer": {
                "Directory": [
                    {
                        "key": "1",
                        "Location": [
                            {"path": "/media/movies"},
                            {"path": "/media/movies-4k"}
                        ]
                    },
                    {
                        "key": "2",
                        "Location": [{"path": "/media/tv"}]
                    }
                ]
            }
        }"#;

        let libraries = parse_sections_body(body).unwrap();
        assert_eq!(libraries.len(), 2);
        assert_eq!(libraries[0].section_id, 1);
        assert_eq!(libraries[0].paths, vec![PathBuf::from("/media/movies"), PathBuf::from("/media/movies-4k")]);
        assert_eq!(libraries[1].section_id, 2);
    }

    #[test]
    fn skips_sections_with_non_numeric_key() {
        let body = r#"{
            "MediaContainer": {
                "Directory": [{"key": "all", "Location": [{"path": "/media/x"}]}]
            }
        }"#;
        let libraries = parse_sections_body(body).unwrap();
        assert!(libraries.is_empty());
    }

    #[test]
    fn missing_directory_array_yields_empty_list() {
        let body = r#"{"MediaContainer": {}}"#;
        let libraries = parse_sections_body(body).unwrap();
        assert!(libraries.is_empty());
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        let result = parse_sections_body("not json");
        assert!(matches!(result, Err(RemoteError::Parse { .. })));
    }

    #[test]
    fn section_with_no_locations_is_a_shape_error() {
        let body = r#"{
            "MediaContainer": {
                "Directory": [{"key": "1", "Location": []}]
            }
        }"#;
        let result = parse_sections_body(body);
        assert!(matches!(result, Err(RemoteError::Shape(_))));
    }
}
