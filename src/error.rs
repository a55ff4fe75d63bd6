use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while reading or writing the offline library
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove {path}: {source}")]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not enough storage: {required} bytes required, {available} bytes available")]
    QuotaExceeded { required: u64, available: u64 },

    #[error("Failed to parse JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize record: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}

/// Errors that can occur during episode downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Episode '{episode_id}' is already downloading")]
    AlreadyInProgress { episode_id: String },

    #[error("Episode '{episode_id}' has no audio URL")]
    MissingAudioUrl { episode_id: String },

    #[error("Episode '{episode_id}' has an invalid audio URL: {source}")]
    InvalidAudioUrl {
        episode_id: String,
        #[source]
        source: url::ParseError,
    },

    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DownloadError {
    /// Whether the failure came from the network rather than local storage
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            DownloadError::HttpFailed { .. }
                | DownloadError::HttpStatus { .. }
                | DownloadError::StreamFailed { .. }
        )
    }
}

/// Errors raised by the playback element
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    #[error("No media source is loaded")]
    NoSource,

    #[error("Playback was not allowed: {0}")]
    NotAllowed(String),

    #[error("Media transport failed: {0}")]
    Transport(String),
}
