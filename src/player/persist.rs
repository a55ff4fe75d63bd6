use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::episode::Episode;
use crate::error::StorageError;
use crate::player::state::PlayerState;
use crate::session::normalize_playback_rate;

const SNAPSHOT_VERSION: u32 = 1;

/// The persisted subset of [`PlayerState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub version: u32,
    #[serde(default)]
    pub current_episode: Option<Episode>,
    #[serde(default)]
    pub current_time: f64,
    #[serde(default = "unit")]
    pub playback_rate: f64,
    #[serde(default = "unit")]
    pub volume: f64,
    #[serde(default)]
    pub queue: Vec<Episode>,
    #[serde(default)]
    pub queue_index: Option<usize>,
}

fn unit() -> f64 {
    1.0
}

impl From<&PlayerState> for PlayerSnapshot {
    fn from(state: &PlayerState) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            current_episode: state.current_episode.clone(),
            current_time: state.current_time,
            playback_rate: state.playback_rate,
            volume: state.volume,
            queue: state.queue.clone(),
            queue_index: state.queue_index,
        }
    }
}

impl PlayerSnapshot {
    /// Turn a snapshot into a state safe to apply.
    ///
    /// Episodes `playable` rejects are dropped, from the queue and as the
    /// current episode. The queue index follows its episode through the
    /// filtering. Playback never resumes on its own: `is_playing` is false.
    pub fn into_state(self, playable: impl Fn(&Episode) -> bool) -> PlayerState {
        let selected_id = self
            .queue_index
            .and_then(|index| self.queue.get(index))
            .map(|e| e.id.clone());

        let queue: Vec<Episode> = self.queue.into_iter().filter(|e| playable(e)).collect();
        let current_episode = self.current_episode.filter(|e| playable(e));

        let queue_index = selected_id
            .as_deref()
            .or(current_episode.as_ref().map(|e| e.id.as_str()))
            .and_then(|id| queue.iter().position(|e| e.id == id));

        let (current_time, duration) = match &current_episode {
            Some(episode) => {
                let duration = episode.duration.filter(|d| d.is_finite() && *d > 0.0);
                let time = if self.current_time.is_finite() {
                    self.current_time.max(0.0)
                } else {
                    0.0
                };
                (duration.map_or(time, |d| time.min(d)), duration.unwrap_or(0.0))
            }
            None => (0.0, 0.0),
        };

        let volume = if self.volume.is_finite() {
            self.volume.clamp(0.0, 1.0)
        } else {
            1.0
        };

        let mut state = PlayerState {
            current_episode,
            is_playing: false,
            current_time,
            duration,
            playback_rate: normalize_playback_rate(self.playback_rate),
            volume,
            is_loading: false,
            is_minimized: false,
            queue,
            queue_index,
        };
        state.normalize();
        state
    }
}

/// Single-file store for the player snapshot
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when nothing was saved yet
    pub fn load(&self) -> Result<Option<PlayerSnapshot>, StorageError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::ReadFailed {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StorageError::JsonParseFailed {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Replace the snapshot; readers see either the old or the new file
    pub fn save(&self, snapshot: &PlayerSnapshot) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(snapshot)?;

        let mut partial = self.path.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        std::fs::write(&partial, json).map_err(|e| StorageError::WriteFailed {
            path: partial.clone(),
            source: e,
        })?;
        std::fs::rename(&partial, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&partial);
            StorageError::WriteFailed {
                path: self.path.clone(),
                source: e,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::make_episode;
    use tempfile::tempdir;

    fn snapshot() -> PlayerSnapshot {
        PlayerSnapshot {
            version: SNAPSHOT_VERSION,
            current_episode: Some(make_episode("b")),
            current_time: 312.5,
            playback_rate: 1.5,
            volume: 0.6,
            queue: vec![make_episode("a"), make_episode("b"), make_episode("c")],
            queue_index: Some(1),
        }
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("player.json"));

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("player.json"));

        store.save(&PlayerSnapshot::from(&PlayerState::default())).unwrap();
        store.save(&snapshot()).unwrap();

        assert_eq!(store.load().unwrap(), Some(snapshot()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("player.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            SnapshotStore::new(path).load(),
            Err(StorageError::JsonParseFailed { .. })
        ));
    }

    #[test]
    fn snapshot_never_restores_as_playing() {
        let state = snapshot().into_state(|_| true);

        assert!(!state.is_playing);
        assert!(!state.is_loading);
        assert_eq!(state.current_id(), Some("b"));
        assert_eq!(state.current_time, 312.5);
        assert_eq!(state.duration, 1800.0);
        assert_eq!(state.queue_index, Some(1));
    }

    #[test]
    fn unplayable_episodes_are_dropped() {
        let state = snapshot().into_state(|e| e.id != "a");

        let ids: Vec<&str> = state.queue.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(state.queue_index, Some(0), "index follows episode b");

        let state = snapshot().into_state(|e| e.id != "b");
        assert!(state.current_episode.is_none());
        assert_eq!(state.current_time, 0.0);
        assert_eq!(state.queue_index, None);
    }

    #[test]
    fn out_of_range_settings_are_renormalized() {
        let mut raw = snapshot();
        raw.volume = 4.0;
        raw.playback_rate = 3.0;
        raw.current_time = 99_999.0;

        let state = raw.into_state(|_| true);

        assert_eq!(state.volume, 1.0);
        assert_eq!(state.playback_rate, 1.0);
        assert_eq!(state.current_time, 1800.0);
    }

    #[test]
    fn older_snapshots_fill_defaults() {
        let json = r#"{"version": 1, "currentTime": 12.0}"#;
        let raw: PlayerSnapshot = serde_json::from_str(json).unwrap();

        assert_eq!(raw.volume, 1.0);
        assert_eq!(raw.playback_rate, 1.0);
        assert!(raw.queue.is_empty());
        assert_eq!(raw.into_state(|_| true), PlayerState::default());
    }
}
