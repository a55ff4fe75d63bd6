use std::fmt;
use std::io;
use std::path::Path;

use tempfile::TempPath;

/// Transient handle to an offline copy, handed to the playback element.
///
/// The file lives under the library's `blobs/` directory and is deleted when the
/// handle is dropped, so the bytes record itself can be removed while a blob is
/// still playing.
pub struct LocalBlob {
    episode_id: String,
    path: TempPath,
}

impl LocalBlob {
    /// Hard-link the bytes record into `blobs_dir`, copying when linking is
    /// not supported by the filesystem
    pub(crate) fn create(episode_id: &str, audio: &Path, blobs_dir: &Path) -> io::Result<Self> {
        let path = tempfile::Builder::new()
            .prefix("blob-")
            .suffix(".audio")
            .tempfile_in(blobs_dir)?
            .into_temp_path();

        std::fs::remove_file(&path)?;
        if std::fs::hard_link(audio, &path).is_err() {
            std::fs::copy(audio, &path)?;
        }

        Ok(Self {
            episode_id: episode_id.to_string(),
            path,
        })
    }

    pub fn episode_id(&self) -> &str {
        &self.episode_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit release; dropping has the same effect
    pub fn release(self) {}
}

impl fmt::Debug for LocalBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBlob")
            .field("episode_id", &self.episode_id)
            .field("path", &self.path())
            .finish()
    }
}
