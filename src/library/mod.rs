// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod blob;
mod filename;
mod quota;
mod reconcile;
mod record;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::episode::Episode;
use crate::error::StorageError;

pub use blob::LocalBlob;
pub use filename::record_stem;
pub use quota::{DiskSpace, QuotaSource, StorageQuota, StorageStats, SystemQuota, UnknownQuota};
pub use reconcile::{ReconcileReport, reconcile};
pub use record::{OfflineEpisode, read_record, write_record};

const EPISODES_DIR: &str = "episodes";
const AUDIO_DIR: &str = "audio";
const BLOBS_DIR: &str = "blobs";
const SNAPSHOT_FILENAME: &str = "player.json";
const METADATA_EXTENSION: &str = "json";
const AUDIO_EXTENSION: &str = "audio";
const PARTIAL_SUFFIX: &str = ".partial";

/// Audio fully written to a staging file, waiting to be committed
#[derive(Debug, Clone)]
pub struct StagedAudio {
    pub path: PathBuf,
    pub file_size: u64,
    pub content_hash: String,
}

/// Durable store of offline episodes.
///
/// Each episode is a metadata record (`episodes/<stem>.json`) plus a bytes
/// record (`audio/<stem>.audio`). Writes and removals are serialized by one
/// async lock so a commit can never interleave with a removal of the same
/// episode. Entries are only ever removed on request; there is no eviction.
pub struct OfflineLibrary {
    root: PathBuf,
    quota_source: Box<dyn QuotaSource>,
    write_lock: Mutex<()>,
}

impl OfflineLibrary {
    /// Open (creating if needed) the library at `root` and repair any
    /// half-written episodes left by a previous process
    pub fn open(root: impl Into<PathBuf>) -> Result<(Self, ReconcileReport), StorageError> {
        Self::open_with_quota(root, Box::new(SystemQuota))
    }

    pub fn open_with_quota(
        root: impl Into<PathBuf>,
        quota_source: Box<dyn QuotaSource>,
    ) -> Result<(Self, ReconcileReport), StorageError> {
        let root = root.into();

        for dir in [EPISODES_DIR, AUDIO_DIR, BLOBS_DIR].map(|d| root.join(d)) {
            std::fs::create_dir_all(&dir)
                .map_err(|e| StorageError::CreateDirectoryFailed { path: dir, source: e })?;
        }

        let report = reconcile(&root)?;
        if report.repaired() > 0 {
            info!(
                partial = report.partial_files_cleaned,
                blobs = report.stale_blobs_cleaned,
                orphaned_audio = report.orphaned_audio_removed,
                orphaned_metadata = report.orphaned_metadata_removed,
                "repaired offline library"
            );
        }

        Ok((
            Self {
                root,
                quota_source,
                write_lock: Mutex::new(()),
            },
            report,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the persisted player snapshot
    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILENAME)
    }

    fn metadata_path(&self, episode_id: &str) -> PathBuf {
        self.root
            .join(EPISODES_DIR)
            .join(format!("{}.{}", record_stem(episode_id), METADATA_EXTENSION))
    }

    fn audio_path(&self, episode_id: &str) -> PathBuf {
        self.root
            .join(AUDIO_DIR)
            .join(format!("{}.{}", record_stem(episode_id), AUDIO_EXTENSION))
    }

    /// Staging file for one transfer; `ticket` keeps a restarted download from
    /// sharing a file with the transfer it replaced
    pub fn staging_path(&self, episode_id: &str, ticket: u64) -> PathBuf {
        self.root.join(AUDIO_DIR).join(format!(
            "{}.{}.{}{}",
            record_stem(episode_id),
            ticket,
            AUDIO_EXTENSION,
            PARTIAL_SUFFIX
        ))
    }

    /// Commit staged audio and its metadata as one unit.
    ///
    /// The bytes are renamed into place first and the metadata rename is the
    /// commit point; a crash in between leaves only bytes, which the next
    /// [`reconcile`] removes. Returns `None` without writing anything when
    /// `abort` was raised before the lock was acquired.
    pub async fn commit(
        &self,
        episode: &Episode,
        staged: StagedAudio,
        abort: &AtomicBool,
    ) -> Result<Option<OfflineEpisode>, StorageError> {
        let _guard = self.write_lock.lock().await;

        if abort.load(Ordering::SeqCst) {
            discard(&staged.path);
            return Ok(None);
        }

        let record = OfflineEpisode {
            episode: episode.clone(),
            downloaded_at: Utc::now(),
            file_size: staged.file_size,
            content_hash: Some(staged.content_hash),
        };

        let metadata_path = self.metadata_path(&episode.id);
        let metadata_partial = partial_path(&metadata_path);
        let audio_path = self.audio_path(&episode.id);

        if let Err(e) = write_record(&record, &metadata_partial) {
            discard(&staged.path);
            discard(&metadata_partial);
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&staged.path, &audio_path).await {
            discard(&staged.path);
            discard(&metadata_partial);
            return Err(StorageError::WriteFailed {
                path: audio_path,
                source: e,
            });
        }

        if let Err(e) = tokio::fs::rename(&metadata_partial, &metadata_path).await {
            // The new bytes may sit next to an older metadata record
            discard(&metadata_partial);
            discard(&metadata_path);
            discard(&audio_path);
            return Err(StorageError::WriteFailed {
                path: metadata_path,
                source: e,
            });
        }

        debug!(episode_id = %episode.id, bytes = record.file_size, "committed offline episode");
        Ok(Some(record))
    }

    pub async fn get(&self, episode_id: &str) -> Result<Option<OfflineEpisode>, StorageError> {
        let path = self.metadata_path(episode_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    /// Both records present
    pub async fn is_offline(&self, episode_id: &str) -> bool {
        let metadata = tokio::fs::try_exists(self.metadata_path(episode_id)).await;
        let audio = tokio::fs::try_exists(self.audio_path(episode_id)).await;
        matches!((metadata, audio), (Ok(true), Ok(true)))
    }

    /// All offline episodes, most recently downloaded first
    pub async fn list(&self) -> Result<Vec<OfflineEpisode>, StorageError> {
        let dir = self.root.join(EPISODES_DIR);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| StorageError::ReadFailed {
                path: dir.clone(),
                source: e,
            })?;

        let mut records = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::ReadFailed {
                    path: dir.clone(),
                    source: e,
                })?;
            let Some(entry) = entry else { break };

            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(METADATA_EXTENSION) {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping offline record: {}", e),
            }
        }

        records.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));
        Ok(records)
    }

    /// Remove both records of an episode. Returns whether anything was stored;
    /// removing an episode that was never offline is a no-op.
    pub async fn remove(&self, episode_id: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        self.remove_locked(episode_id).await
    }

    async fn remove_locked(&self, episode_id: &str) -> Result<bool, StorageError> {
        // Metadata first: a crash after this leaves only bytes, which reconcile removes
        let had_metadata = remove_if_exists(&self.metadata_path(episode_id)).await?;
        let had_audio = remove_if_exists(&self.audio_path(episode_id)).await?;
        Ok(had_metadata || had_audio)
    }

    /// Remove every offline episode. Returns the number of episodes removed.
    pub async fn clear(&self) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;
        let records = self.list().await?;

        let mut removed = 0;
        for record in &records {
            if self.remove_locked(record.id()).await? {
                removed += 1;
            }
        }

        // Anything left over has no metadata and would be dropped by reconcile anyway
        let audio_dir = self.root.join(AUDIO_DIR);
        if let Ok(mut entries) = tokio::fs::read_dir(&audio_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) == Some(AUDIO_EXTENSION) {
                    remove_if_exists(&path).await?;
                }
            }
        }

        info!(removed, "cleared offline library");
        Ok(removed)
    }

    /// Open a transient blob for playback, or `None` when the episode is not
    /// offline
    pub async fn open_blob(&self, episode_id: &str) -> Result<Option<LocalBlob>, StorageError> {
        if !self.is_offline(episode_id).await {
            return Ok(None);
        }

        let audio = self.audio_path(episode_id);
        let blobs_dir = self.root.join(BLOBS_DIR);
        LocalBlob::create(episode_id, &audio, &blobs_dir)
            .map(Some)
            .map_err(|e| StorageError::ReadFailed {
                path: audio,
                source: e,
            })
    }

    pub async fn stats(&self) -> Result<StorageStats, StorageError> {
        let records = self.list().await?;
        Ok(StorageStats {
            episode_count: records.len(),
            total_bytes: records.iter().map(|r| r.file_size).sum(),
        })
    }

    pub async fn quota(&self) -> Result<StorageQuota, StorageError> {
        let stats = self.stats().await?;
        let space = self.quota_source.disk_space(&self.root);

        Ok(StorageQuota {
            used: stats.total_bytes,
            available: space.map_or(0, |s| s.available),
            total: space.map_or(0, |s| s.total),
        })
    }

    /// Fail early when the host says `required` bytes will not fit.
    /// Unknown headroom never blocks a download.
    pub fn ensure_capacity(&self, required: u64) -> Result<(), StorageError> {
        match self.quota_source.disk_space(&self.root) {
            Some(space) if required > space.available => Err(StorageError::QuotaExceeded {
                required,
                available: space.available,
            }),
            _ => Ok(()),
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Best-effort cleanup of a file nobody will read again
fn discard(path: &Path) {
    let _ = std::fs::remove_file(path);
}

async fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::RemoveFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{FixedQuota, store_offline};
    use super::*;
    use crate::episode::make_episode;
    use tempfile::tempdir;

    fn open(dir: &Path) -> OfflineLibrary {
        OfflineLibrary::open_with_quota(dir, Box::new(UnknownQuota))
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn open_creates_layout() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("library");

        let (library, report) = OfflineLibrary::open(&root).unwrap();

        assert!(root.join(EPISODES_DIR).is_dir());
        assert!(root.join(AUDIO_DIR).is_dir());
        assert!(root.join(BLOBS_DIR).is_dir());
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(library.snapshot_path(), root.join("player.json"));
    }

    #[tokio::test]
    async fn commit_writes_both_records() {
        let dir = tempdir().unwrap();
        let library = open(dir.path());
        let episode = make_episode("ep-1");

        store_offline(&library, &episode, b"hello audio").await;

        assert!(library.is_offline("ep-1").await);
        let record = library.get("ep-1").await.unwrap().unwrap();
        assert_eq!(record.file_size, 11);
        assert_eq!(record.episode, episode);
        assert_eq!(
            std::fs::read_dir(dir.path().join(AUDIO_DIR)).unwrap().count(),
            1,
            "staging file must be gone"
        );
    }

    #[tokio::test]
    async fn aborted_commit_writes_nothing() {
        let dir = tempdir().unwrap();
        let library = open(dir.path());
        let episode = make_episode("ep-1");
        let staging = library.staging_path("ep-1", 1);
        std::fs::write(&staging, b"abc").unwrap();

        let staged = StagedAudio {
            path: staging.clone(),
            file_size: 3,
            content_hash: "sha256:x".to_string(),
        };
        let result = library
            .commit(&episode, staged, &AtomicBool::new(true))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(!staging.exists());
        assert!(!library.is_offline("ep-1").await);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let library = open(dir.path());
        store_offline(&library, &make_episode("ep-1"), b"abc").await;

        assert!(library.remove("ep-1").await.unwrap());
        assert!(!library.remove("ep-1").await.unwrap());
        assert!(!library.remove("never-stored").await.unwrap());
        assert!(!library.is_offline("ep-1").await);
    }

    #[tokio::test]
    async fn list_and_stats_cover_all_records() {
        let dir = tempdir().unwrap();
        let library = open(dir.path());
        store_offline(&library, &make_episode("a"), &[0u8; 100]).await;
        store_offline(&library, &make_episode("b"), &[0u8; 250]).await;

        let ids: Vec<String> = library
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.episode.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));

        let stats = library.stats().await.unwrap();
        assert_eq!(stats.episode_count, 2);
        assert_eq!(stats.total_bytes, 350);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempdir().unwrap();
        let library = open(dir.path());
        store_offline(&library, &make_episode("a"), b"1").await;
        store_offline(&library, &make_episode("b"), b"2").await;

        assert_eq!(library.clear().await.unwrap(), 2);
        assert_eq!(library.stats().await.unwrap(), StorageStats::default());
        assert_eq!(std::fs::read_dir(dir.path().join(AUDIO_DIR)).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn open_blob_only_for_offline_episodes() {
        let dir = tempdir().unwrap();
        let library = open(dir.path());
        store_offline(&library, &make_episode("a"), b"bytes").await;

        let blob = library.open_blob("a").await.unwrap().unwrap();
        assert_eq!(std::fs::read(blob.path()).unwrap(), b"bytes");
        assert!(library.open_blob("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn quota_is_zero_when_host_is_silent() {
        let dir = tempdir().unwrap();
        let library = open(dir.path());
        store_offline(&library, &make_episode("a"), b"12345").await;

        let quota = library.quota().await.unwrap();
        assert_eq!(quota.used, 5);
        assert_eq!(quota.available, 0);
        assert!(!quota.is_known());
        assert!(library.ensure_capacity(u64::MAX).is_ok());
    }

    #[tokio::test]
    async fn quota_reports_host_space() {
        let dir = tempdir().unwrap();
        let space = DiskSpace {
            available: 1_000,
            total: 10_000,
        };
        let (library, _) =
            OfflineLibrary::open_with_quota(dir.path(), Box::new(FixedQuota(space))).unwrap();

        let quota = library.quota().await.unwrap();
        assert_eq!(quota.available, 1_000);
        assert_eq!(quota.total, 10_000);

        assert!(library.ensure_capacity(1_000).is_ok());
        assert!(matches!(
            library.ensure_capacity(1_001),
            Err(StorageError::QuotaExceeded {
                required: 1_001,
                available: 1_000
            })
        ));
    }

    #[tokio::test]
    async fn reopen_repairs_orphaned_bytes() {
        let dir = tempdir().unwrap();
        {
            let library = open(dir.path());
            store_offline(&library, &make_episode("a"), b"abc").await;
            // simulate a crash between the bytes rename and the metadata rename
            std::fs::remove_file(library.metadata_path("a")).unwrap();
        }

        let (library, report) =
            OfflineLibrary::open_with_quota(dir.path(), Box::new(UnknownQuota)).unwrap();

        assert_eq!(report.orphaned_audio_removed, 1);
        assert!(!library.is_offline("a").await);
    }
}
