use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::warn;

use crate::error::StorageError;

use super::filename::record_stem;
use super::record::read_record;
use super::{AUDIO_DIR, AUDIO_EXTENSION, BLOBS_DIR, EPISODES_DIR, METADATA_EXTENSION, PARTIAL_SUFFIX};

/// What the startup pass found and repaired
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Complete metadata/bytes pairs left in place
    pub offline_episodes: usize,
    /// `.partial` files from interrupted downloads or commits
    pub partial_files_cleaned: usize,
    /// Blob links that outlived the previous process
    pub stale_blobs_cleaned: usize,
    /// Bytes records without a metadata record
    pub orphaned_audio_removed: usize,
    /// Metadata records without matching bytes, unreadable, or with the wrong size
    pub orphaned_metadata_removed: usize,
}

impl ReconcileReport {
    pub fn repaired(&self) -> usize {
        self.partial_files_cleaned
            + self.stale_blobs_cleaned
            + self.orphaned_audio_removed
            + self.orphaned_metadata_removed
    }
}

/// Bring the library directory back to "both records or neither" for every
/// episode.
///
/// A crash can leave a bytes record whose metadata rename never happened, or
/// (during removal) the reverse. Both halves are discarded rather than guessed
/// at.
pub fn reconcile(root: &Path) -> Result<ReconcileReport, StorageError> {
    let mut report = ReconcileReport::default();

    let blobs_dir = root.join(BLOBS_DIR);
    for entry in read_dir(&blobs_dir)? {
        if remove_quietly(&entry.path) {
            report.stale_blobs_cleaned += 1;
        }
    }

    // stem -> byte length of every complete bytes record
    let mut audio: HashMap<String, u64> = HashMap::new();
    let audio_dir = root.join(AUDIO_DIR);
    let audio_suffix = format!(".{AUDIO_EXTENSION}");
    for entry in read_dir(&audio_dir)? {
        if entry.name.ends_with(PARTIAL_SUFFIX) {
            if remove_quietly(&entry.path) {
                report.partial_files_cleaned += 1;
            }
        } else if let Some(stem) = entry.name.strip_suffix(&audio_suffix) {
            audio.insert(stem.to_string(), entry.len);
        }
    }

    let mut complete: HashSet<String> = HashSet::new();
    let episodes_dir = root.join(EPISODES_DIR);
    let metadata_suffix = format!(".{METADATA_EXTENSION}");
    for entry in read_dir(&episodes_dir)? {
        if entry.name.ends_with(PARTIAL_SUFFIX) {
            if remove_quietly(&entry.path) {
                report.partial_files_cleaned += 1;
            }
            continue;
        }

        let Some(stem) = entry.name.strip_suffix(&metadata_suffix) else {
            continue;
        };

        let intact = match read_record(&entry.path) {
            Ok(record) => {
                record_stem(record.id()) == stem && audio.get(stem) == Some(&record.file_size)
            }
            Err(e) => {
                warn!("discarding unreadable offline record: {}", e);
                false
            }
        };

        if intact {
            complete.insert(stem.to_string());
        } else {
            warn!(stem, "removing offline record without matching audio");
            if remove_quietly(&entry.path) {
                report.orphaned_metadata_removed += 1;
            }
        }
    }

    for stem in audio.keys().filter(|stem| !complete.contains(*stem)) {
        warn!(stem = %stem, "removing audio without offline record");
        if remove_quietly(&audio_dir.join(format!("{stem}{audio_suffix}"))) {
            report.orphaned_audio_removed += 1;
        }
    }

    report.offline_episodes = complete.len();
    Ok(report)
}

struct DirEntry {
    path: std::path::PathBuf,
    name: String,
    len: u64,
}

fn read_dir(dir: &Path) -> Result<Vec<DirEntry>, StorageError> {
    let entries = std::fs::read_dir(dir).map_err(|e| StorageError::ReadFailed {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::ReadFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        files.push(DirEntry {
            path: entry.path(),
            name: entry.file_name().to_string_lossy().into_owned(),
            len: metadata.len(),
        });
    }
    Ok(files)
}

fn remove_quietly(path: &Path) -> bool {
    std::fs::remove_file(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::make_episode;
    use crate::library::record::{OfflineEpisode, write_record};
    use chrono::Utc;
    use tempfile::tempdir;

    fn layout() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        for sub in [EPISODES_DIR, AUDIO_DIR, BLOBS_DIR] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        dir
    }

    fn write_pair(root: &Path, id: &str, bytes: &[u8], recorded_size: u64) -> String {
        let stem = record_stem(id);
        std::fs::write(root.join(AUDIO_DIR).join(format!("{stem}.audio")), bytes).unwrap();
        let record = OfflineEpisode {
            episode: make_episode(id),
            downloaded_at: Utc::now(),
            file_size: recorded_size,
            content_hash: None,
        };
        write_record(&record, &root.join(EPISODES_DIR).join(format!("{stem}.json"))).unwrap();
        stem
    }

    #[test]
    fn empty_library_is_clean() {
        let dir = layout();
        let report = reconcile(dir.path()).unwrap();
        assert_eq!(report, ReconcileReport::default());
    }

    #[test]
    fn complete_pairs_are_kept() {
        let dir = layout();
        let stem = write_pair(dir.path(), "ep-1", b"audio", 5);

        let report = reconcile(dir.path()).unwrap();

        assert_eq!(report.offline_episodes, 1);
        assert_eq!(report.repaired(), 0);
        assert!(dir.path().join(AUDIO_DIR).join(format!("{stem}.audio")).exists());
    }

    #[test]
    fn audio_without_metadata_is_removed() {
        let dir = layout();
        let orphan = dir.path().join(AUDIO_DIR).join("lonely-0000.audio");
        std::fs::write(&orphan, b"bytes").unwrap();

        let report = reconcile(dir.path()).unwrap();

        assert_eq!(report.orphaned_audio_removed, 1);
        assert!(!orphan.exists());
    }

    #[test]
    fn metadata_without_audio_is_removed() {
        let dir = layout();
        let stem = write_pair(dir.path(), "ep-2", b"audio", 5);
        std::fs::remove_file(dir.path().join(AUDIO_DIR).join(format!("{stem}.audio"))).unwrap();

        let report = reconcile(dir.path()).unwrap();

        assert_eq!(report.orphaned_metadata_removed, 1);
        assert_eq!(report.offline_episodes, 0);
        assert!(!dir.path().join(EPISODES_DIR).join(format!("{stem}.json")).exists());
    }

    #[test]
    fn size_mismatch_discards_both_halves() {
        let dir = layout();
        let stem = write_pair(dir.path(), "ep-3", b"truncated", 9000);

        let report = reconcile(dir.path()).unwrap();

        assert_eq!(report.orphaned_metadata_removed, 1);
        assert_eq!(report.orphaned_audio_removed, 1);
        assert!(!dir.path().join(AUDIO_DIR).join(format!("{stem}.audio")).exists());
    }

    #[test]
    fn partial_files_and_blobs_are_cleaned() {
        let dir = layout();
        std::fs::write(dir.path().join(AUDIO_DIR).join("a.3.audio.partial"), b"x").unwrap();
        std::fs::write(dir.path().join(EPISODES_DIR).join("a.json.partial"), b"{}").unwrap();
        std::fs::write(dir.path().join(BLOBS_DIR).join("blob-1.audio"), b"x").unwrap();

        let report = reconcile(dir.path()).unwrap();

        assert_eq!(report.partial_files_cleaned, 2);
        assert_eq!(report.stale_blobs_cleaned, 1);
        assert_eq!(std::fs::read_dir(dir.path().join(BLOBS_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn unreadable_metadata_is_removed() {
        let dir = layout();
        let path = dir.path().join(EPISODES_DIR).join("junk.json");
        std::fs::write(&path, b"not json").unwrap();

        let report = reconcile(dir.path()).unwrap();

        assert_eq!(report.orphaned_metadata_removed, 1);
        assert!(!path.exists());
    }
}
