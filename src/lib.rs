pub mod download;
pub mod episode;
pub mod error;
pub mod http;
pub mod library;
pub mod player;
pub mod progress;
pub mod session;

// Re-export main types for convenience
pub use download::{DownloadManager, DownloadOutcome};
pub use episode::Episode;
pub use error::{DownloadError, PlaybackError, StorageError};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use library::{
    LocalBlob, OfflineEpisode, OfflineLibrary, ReconcileReport, StorageQuota, StorageStats,
};
pub use player::{PlaybackPhase, PlayerOptions, PlayerSnapshot, PlayerState, PlayerStore, SnapshotStore};
pub use progress::{
    DownloadProgress, DownloadStatus, NoopReporter, ProgressReporter, SharedProgressReporter,
};
pub use session::{HeadlessElement, MediaElement, MediaEvent, MediaSession, SessionState, SourceKey};
