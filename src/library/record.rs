use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::episode::Episode;
use crate::error::StorageError;

/// Metadata record of an episode whose audio is stored in the library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEpisode {
    #[serde(flatten)]
    pub episode: Episode,
    pub downloaded_at: DateTime<Utc>,
    /// Size of the bytes record
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl OfflineEpisode {
    pub fn id(&self) -> &str {
        &self.episode.id
    }
}

/// Write a metadata record as pretty JSON
pub fn write_record(record: &OfflineEpisode, path: &Path) -> Result<(), StorageError> {
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(path, json).map_err(|e| StorageError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read a metadata record
pub fn read_record(path: &Path) -> Result<OfflineEpisode, StorageError> {
    let content = std::fs::read_to_string(path).map_err(|e| StorageError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| StorageError::JsonParseFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::make_episode;
    use tempfile::tempdir;

    fn make_record() -> OfflineEpisode {
        OfflineEpisode {
            episode: make_episode("ep-7"),
            downloaded_at: Utc::now(),
            file_size: 1234567,
            content_hash: Some("sha256:abc123".to_string()),
        }
    }

    #[test]
    fn record_json_is_flat() {
        let json = serde_json::to_value(make_record()).unwrap();

        assert_eq!(json["id"], "ep-7");
        assert_eq!(json["audioUrl"], "https://cdn.example.com/audio/ep-7.mp3");
        assert_eq!(json["fileSize"], 1234567);
        assert!(json["downloadedAt"].is_string());
        assert!(json.get("episode").is_none());
    }

    #[test]
    fn write_then_read_keeps_identity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ep-7.json");
        let record = make_record();

        write_record(&record, &path).unwrap();
        let read_back = read_record(&path).unwrap();

        assert_eq!(read_back.id(), "ep-7");
        assert_eq!(read_back.file_size, 1234567);
        assert_eq!(read_back.content_hash.as_deref(), Some("sha256:abc123"));
    }

    #[test]
    fn read_nonexistent_returns_error() {
        let dir = tempdir().unwrap();
        let result = read_record(&dir.path().join("missing.json"));
        assert!(matches!(result, Err(StorageError::ReadFailed { .. })));
    }

    #[test]
    fn read_garbage_returns_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(
            read_record(&path),
            Err(StorageError::JsonParseFailed { .. })
        ));
    }
}
