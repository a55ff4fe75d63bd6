// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::episode::Episode;
use crate::error::{DownloadError, StorageError};
use crate::http::{HttpClient, ReqwestClient};
use crate::library::{OfflineEpisode, OfflineLibrary, StorageQuota, StorageStats};
use crate::progress::{DownloadProgress, DownloadStatus, SharedProgressReporter};

use super::transfer::{StreamOutcome, stream_to_staging};

/// How a download ended when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Completed(OfflineEpisode),
    Cancelled,
}

/// Bookkeeping for one registered download
struct ActiveDownload {
    /// Distinguishes this transfer from a later one for the same episode
    ticket: u64,
    cancel: Arc<AtomicBool>,
    progress: DownloadProgress,
    /// Cancelled but the transfer has not exited yet. Hidden from queries,
    /// still holds the id.
    draining: bool,
}

impl ActiveDownload {
    fn is_live(&self) -> bool {
        !self.draining && !self.progress.status.is_terminal()
    }
}

/// Chunked, cancellable downloads into an [`OfflineLibrary`].
///
/// At most one download per episode id is live at a time. Distinct episodes
/// may download concurrently; share the manager through an `Arc` and drive each
/// [`download_episode`](Self::download_episode) from its own task.
pub struct DownloadManager<C = ReqwestClient> {
    client: C,
    library: Arc<OfflineLibrary>,
    active: Mutex<HashMap<String, ActiveDownload>>,
    next_ticket: AtomicU64,
}

impl<C: HttpClient> DownloadManager<C> {
    pub fn new(client: C, library: Arc<OfflineLibrary>) -> Self {
        Self {
            client,
            library,
            active: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn library(&self) -> &Arc<OfflineLibrary> {
        &self.library
    }

    /// Download an episode into the library.
    ///
    /// Reports a notification after every received chunk and exactly one
    /// terminal notification (completed, failed or cancelled). Fails
    /// immediately with [`DownloadError::AlreadyInProgress`] if the episode is
    /// already downloading. A failure is never retried; call again to retry.
    pub async fn download_episode(
        &self,
        episode: &Episode,
        reporter: &SharedProgressReporter,
    ) -> Result<DownloadOutcome, DownloadError> {
        let url = episode.parsed_audio_url()?;
        let (ticket, cancel) = self.register(&episode.id)?;
        let staging = self.library.staging_path(&episode.id, ticket);

        info!(episode_id = %episode.id, url = %url, "starting download");

        let mut last = DownloadProgress::pending(&episode.id);
        let streamed = stream_to_staging(
            &self.client,
            url.as_str(),
            &staging,
            &cancel,
            &self.library,
            |bytes, total| {
                last.advance(bytes, total);
                if self.update_entry(&episode.id, ticket, &last) {
                    reporter.report(last.clone());
                }
            },
        )
        .await;

        let result = match streamed {
            Ok(StreamOutcome::Staged(staged)) => self
                .library
                .commit(episode, staged, &cancel)
                .await
                .map_err(DownloadError::from),
            Ok(StreamOutcome::Cancelled) => Ok(None),
            Err(e) => Err(e),
        };

        match result {
            Ok(Some(offline)) => {
                self.release(&episode.id, ticket);
                let mut done = last.complete();
                done.bytes_downloaded = offline.file_size;
                done.total_bytes = done.total_bytes.or(Some(offline.file_size));
                reporter.report(done);

                info!(episode_id = %episode.id, bytes = offline.file_size, "download completed");
                Ok(DownloadOutcome::Completed(offline))
            }
            Ok(None) => self.finish_cancelled(&episode.id, ticket, last, reporter),
            Err(_) if cancel.load(Ordering::SeqCst) => {
                self.finish_cancelled(&episode.id, ticket, last, reporter)
            }
            Err(e) => {
                let failed = last.fail(e.to_string());
                self.retain_failed(&episode.id, ticket, &failed);
                reporter.report(failed);

                warn!(episode_id = %episode.id, "download failed: {}", e);
                Err(e)
            }
        }
    }

    fn finish_cancelled(
        &self,
        episode_id: &str,
        ticket: u64,
        last: DownloadProgress,
        reporter: &SharedProgressReporter,
    ) -> Result<DownloadOutcome, DownloadError> {
        self.release(episode_id, ticket);
        reporter.report(last.cancel());
        info!(episode_id, "download cancelled");
        Ok(DownloadOutcome::Cancelled)
    }

    /// Claim the episode id, replacing a terminal entry left by a failure.
    /// A cancelled transfer keeps the id until it has exited.
    fn register(&self, episode_id: &str) -> Result<(u64, Arc<AtomicBool>), DownloadError> {
        let mut active = self.active.lock();

        if let Some(existing) = active.get(episode_id)
            && (existing.draining || !existing.progress.status.is_terminal())
        {
            return Err(DownloadError::AlreadyInProgress {
                episode_id: episode_id.to_string(),
            });
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let cancel = Arc::new(AtomicBool::new(false));
        active.insert(
            episode_id.to_string(),
            ActiveDownload {
                ticket,
                cancel: cancel.clone(),
                progress: DownloadProgress::pending(episode_id),
                draining: false,
            },
        );

        Ok((ticket, cancel))
    }

    /// Store the latest progress; false once the entry no longer belongs to
    /// this transfer (it was cancelled), in which case nothing is reported
    fn update_entry(&self, episode_id: &str, ticket: u64, progress: &DownloadProgress) -> bool {
        let mut active = self.active.lock();
        match active.get_mut(episode_id) {
            Some(entry) if entry.ticket == ticket && !entry.draining => {
                entry.progress = progress.clone();
                true
            }
            _ => false,
        }
    }

    fn release(&self, episode_id: &str, ticket: u64) {
        let mut active = self.active.lock();
        if active.get(episode_id).is_some_and(|e| e.ticket == ticket) {
            active.remove(episode_id);
        }
    }

    fn retain_failed(&self, episode_id: &str, ticket: u64, failed: &DownloadProgress) {
        let mut active = self.active.lock();
        let Some(entry) = active.get_mut(episode_id) else {
            return;
        };
        if entry.ticket != ticket {
            return;
        }
        // cancelled while failing; nothing left to show
        if entry.draining {
            active.remove(episode_id);
        } else {
            entry.progress = failed.clone();
        }
    }

    /// Cancel an in-flight download. Returns whether one was running.
    ///
    /// The progress entry disappears right away; the transfer notices at its
    /// next chunk, discards what it staged and reports `cancelled`. Until then
    /// the id stays claimed, so a new download for it is rejected. A failed
    /// entry is simply dropped.
    pub fn cancel_download(&self, episode_id: &str) -> bool {
        let mut active = self.active.lock();
        let Some(entry) = active.get_mut(episode_id) else {
            return false;
        };
        if entry.draining {
            return false;
        }
        if entry.progress.status.is_terminal() {
            active.remove(episode_id);
            return false;
        }

        entry.cancel.store(true, Ordering::SeqCst);
        entry.draining = true;
        entry.progress.status = DownloadStatus::Cancelled;
        debug!(episode_id, bytes = entry.progress.bytes_downloaded, "cancel requested");
        true
    }

    pub fn is_downloading(&self, episode_id: &str) -> bool {
        self.active
            .lock()
            .get(episode_id)
            .is_some_and(ActiveDownload::is_live)
    }

    /// Current entry for an episode, including a retained failure
    pub fn download_progress(&self, episode_id: &str) -> Option<DownloadProgress> {
        self.active
            .lock()
            .get(episode_id)
            .filter(|e| !e.draining)
            .map(|e| e.progress.clone())
    }

    pub fn active_downloads(&self) -> Vec<DownloadProgress> {
        self.active
            .lock()
            .values()
            .filter(|e| !e.draining)
            .map(|e| e.progress.clone())
            .collect()
    }

    /// Drop a failed entry once the caller has seen it. Live downloads are
    /// left alone.
    pub fn dismiss(&self, episode_id: &str) -> bool {
        let mut active = self.active.lock();
        if active
            .get(episode_id)
            .is_some_and(|e| !e.draining && e.progress.status.is_terminal())
        {
            active.remove(episode_id);
            return true;
        }
        false
    }

    /// Cancel any transfer for the episode, then remove both of its records.
    /// Deleting an episode that is not offline is a no-op.
    pub async fn delete_offline_episode(&self, episode_id: &str) -> Result<bool, StorageError> {
        self.cancel_download(episode_id);
        let removed = self.library.remove(episode_id).await?;
        if removed {
            info!(episode_id, "deleted offline episode");
        }
        Ok(removed)
    }

    /// Cancel every transfer and empty the library
    pub async fn clear_all(&self) -> Result<usize, StorageError> {
        let ids: Vec<String> = self.active.lock().keys().cloned().collect();
        for id in &ids {
            self.cancel_download(id);
        }
        self.library.clear().await
    }

    pub async fn is_episode_offline(&self, episode_id: &str) -> bool {
        self.library.is_offline(episode_id).await
    }

    pub async fn get_offline_episode(
        &self,
        episode_id: &str,
    ) -> Result<Option<OfflineEpisode>, StorageError> {
        self.library.get(episode_id).await
    }

    pub async fn list_offline_episodes(&self) -> Result<Vec<OfflineEpisode>, StorageError> {
        self.library.list().await
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats, StorageError> {
        self.library.stats().await
    }

    pub async fn get_storage_quota(&self) -> Result<StorageQuota, StorageError> {
        self.library.quota().await
    }
}
