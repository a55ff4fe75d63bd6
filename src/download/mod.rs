mod manager;
mod transfer;

pub use manager::{DownloadManager, DownloadOutcome};
