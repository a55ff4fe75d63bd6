use std::sync::Arc;

use serde::Serialize;

/// Lifecycle of a single download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    /// No further notification follows a terminal status
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

/// Transient progress entry for one episode download
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub episode_id: String,
    /// Percentage in `0..=100`; 0 while the total size is unknown
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
    pub status: DownloadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadProgress {
    pub fn pending(episode_id: &str) -> Self {
        Self {
            episode_id: episode_id.to_string(),
            progress: 0.0,
            bytes_downloaded: 0,
            total_bytes: None,
            status: DownloadStatus::Pending,
            error: None,
        }
    }

    /// Record a received chunk and recompute the percentage
    pub fn advance(&mut self, bytes_downloaded: u64, total_bytes: Option<u64>) {
        self.bytes_downloaded = bytes_downloaded;
        self.total_bytes = total_bytes;
        self.status = DownloadStatus::Downloading;
        self.progress = percentage(bytes_downloaded, total_bytes);
    }

    pub fn complete(mut self) -> Self {
        self.status = DownloadStatus::Completed;
        self.progress = 100.0;
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = DownloadStatus::Failed;
        self.error = Some(error.into());
        self
    }

    pub fn cancel(mut self) -> Self {
        self.status = DownloadStatus::Cancelled;
        self
    }
}

fn percentage(bytes: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => (bytes as f64 / total as f64 * 100.0).min(100.0),
        _ => 0.0,
    }
}

/// Receives progress notifications for a download.
///
/// Closures taking a [`DownloadProgress`] implement this, so callers can pass a
/// plain callback.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: DownloadProgress);
}

impl<F> ProgressReporter for F
where
    F: Fn(DownloadProgress) + Send + Sync,
{
    fn report(&self, progress: DownloadProgress) {
        self(progress)
    }
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A reporter that silently ignores all notifications.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _progress: DownloadProgress) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Collects every notification, for assertions in tests
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingReporter {
    pub events: parking_lot::Mutex<Vec<DownloadProgress>>,
}

#[cfg(test)]
impl RecordingReporter {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<DownloadProgress> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
impl ProgressReporter for RecordingReporter {
    fn report(&self, progress: DownloadProgress) {
        self.events.lock().push(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn advance_computes_percentage() {
        let mut progress = DownloadProgress::pending("ep");
        progress.advance(250, Some(1000));

        assert_eq!(progress.status, DownloadStatus::Downloading);
        assert_eq!(progress.progress, 25.0);
        assert_eq!(progress.bytes_downloaded, 250);
    }

    #[test]
    fn unknown_total_reports_zero_percent() {
        let mut progress = DownloadProgress::pending("ep");
        progress.advance(4096, None);
        assert_eq!(progress.progress, 0.0);

        progress.advance(4096, Some(0));
        assert_eq!(progress.progress, 0.0);
    }

    #[test]
    fn percentage_never_exceeds_one_hundred() {
        let mut progress = DownloadProgress::pending("ep");
        progress.advance(1500, Some(1000));
        assert_eq!(progress.progress, 100.0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!DownloadStatus::Pending.is_terminal());
        assert!(!DownloadStatus::Downloading.is_terminal());
        assert!(DownloadStatus::Completed.is_terminal());
        assert!(DownloadStatus::Failed.is_terminal());
        assert!(DownloadStatus::Cancelled.is_terminal());
    }

    #[test]
    fn serializes_with_lowercase_status() {
        let progress = DownloadProgress::pending("ep-1").fail("boom");
        let json = serde_json::to_value(&progress).unwrap();

        assert_eq!(json["episodeId"], "ep-1");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn closures_are_reporters() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter: SharedProgressReporter =
            Arc::new(move |p: DownloadProgress| sink.lock().unwrap().push(p.status));

        reporter.report(DownloadProgress::pending("a"));
        reporter.report(DownloadProgress::pending("a").complete());
        NoopReporter.report(DownloadProgress::pending("b"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![DownloadStatus::Pending, DownloadStatus::Completed]
        );
    }
}
