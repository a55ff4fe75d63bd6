use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::{DownloadError, StorageError};
use crate::http::HttpClient;
use crate::library::{OfflineLibrary, StagedAudio};

/// How a streamed transfer ended when it did not fail
#[derive(Debug)]
pub(crate) enum StreamOutcome {
    Staged(StagedAudio),
    Cancelled,
}

/// Stream an audio URL into `staging`, hashing as it goes.
///
/// `cancel` is checked once per received chunk; a chunk already in flight is
/// never split. `on_chunk` receives the running byte count and the advertised
/// length after every non-empty chunk. The staging file is removed on every
/// path that does not return [`StreamOutcome::Staged`].
pub(crate) async fn stream_to_staging<C, F>(
    client: &C,
    url: &str,
    staging: &Path,
    cancel: &AtomicBool,
    library: &OfflineLibrary,
    on_chunk: F,
) -> Result<StreamOutcome, DownloadError>
where
    C: HttpClient,
    F: FnMut(u64, Option<u64>),
{
    let result = stream_inner(client, url, staging, cancel, library, on_chunk).await;
    if !matches!(result, Ok(StreamOutcome::Staged(_))) {
        let _ = tokio::fs::remove_file(staging).await;
    }
    result
}

async fn stream_inner<C, F>(
    client: &C,
    url: &str,
    staging: &Path,
    cancel: &AtomicBool,
    library: &OfflineLibrary,
    mut on_chunk: F,
) -> Result<StreamOutcome, DownloadError>
where
    C: HttpClient,
    F: FnMut(u64, Option<u64>),
{
    let response = client
        .get_stream(url)
        .await
        .map_err(|e| DownloadError::HttpFailed {
            url: url.to_string(),
            source: e,
        })?;

    if !response.is_success() {
        return Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    if let Some(total) = response.content_length {
        library.ensure_capacity(total)?;
    }

    let write_failed = |e: std::io::Error| {
        DownloadError::Storage(StorageError::WriteFailed {
            path: staging.to_path_buf(),
            source: e,
        })
    };

    let mut file = File::create(staging).await.map_err(write_failed)?;
    let mut hasher = Sha256::new();
    let mut bytes_downloaded: u64 = 0;
    let total_bytes = response.content_length;
    let mut stream = response.body;

    while let Some(chunk_result) = stream.next().await {
        if cancel.load(Ordering::SeqCst) {
            return Ok(StreamOutcome::Cancelled);
        }

        let chunk = chunk_result.map_err(|e| DownloadError::StreamFailed {
            url: url.to_string(),
            source: e,
        })?;
        if chunk.is_empty() {
            continue;
        }

        file.write_all(&chunk).await.map_err(write_failed)?;
        hasher.update(&chunk);
        bytes_downloaded += chunk.len() as u64;

        on_chunk(bytes_downloaded, total_bytes);
    }

    if cancel.load(Ordering::SeqCst) {
        return Ok(StreamOutcome::Cancelled);
    }

    file.flush().await.map_err(write_failed)?;
    file.sync_all().await.map_err(write_failed)?;

    Ok(StreamOutcome::Staged(StagedAudio {
        path: staging.to_path_buf(),
        file_size: bytes_downloaded,
        content_hash: format!("sha256:{:x}", hasher.finalize()),
    }))
}
