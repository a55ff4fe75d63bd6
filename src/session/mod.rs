// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod element;

use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use url::Url;

use crate::episode::Episode;
use crate::error::PlaybackError;
use crate::library::{LocalBlob, OfflineLibrary};

pub use element::{EventSender, HeadlessElement, MediaElement, MediaEvent};

/// Playback rates the session accepts; anything else resets to 1
pub const PLAYBACK_RATES: [f64; 7] = [0.5, 0.75, 1.0, 1.25, 1.5, 1.75, 2.0];

const EVENT_CAPACITY: usize = 256;

static GLOBAL_SESSION: OnceLock<Arc<MediaSession>> = OnceLock::new();

/// Identity of a resolved playable source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Offline(String),
    Remote(String),
}

/// Point-in-time view of the playback element
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub current_time: f64,
    /// 0 until the element knows the duration
    pub duration: f64,
    pub paused: bool,
    pub volume: f64,
    pub playback_rate: f64,
    pub episode: Option<Episode>,
}

struct ActiveSource {
    /// What the element plays
    key: SourceKey,
    /// What `load_episode` resolved; differs from `key` after falling back
    /// from an unreadable offline copy to the remote URL
    requested: SourceKey,
    episode: Episode,
    /// Dropping it releases the transient offline copy
    _blob: Option<LocalBlob>,
}

struct SessionInner {
    element: Box<dyn MediaElement>,
    active: Option<ActiveSource>,
}

/// The single playback element of the process.
///
/// Install it once with [`MediaSession::global_or_init`] and hand the returned
/// `Arc` to whoever needs it; UI rebuilds never recreate it. The element is
/// owned exclusively here, so all mutation goes through these operations.
pub struct MediaSession {
    inner: Mutex<SessionInner>,
    library: Option<Arc<OfflineLibrary>>,
    events: EventSender,
}

impl MediaSession {
    /// Build a session around `element`. Offline copies are preferred over
    /// remote URLs when a library is given.
    pub fn new(mut element: Box<dyn MediaElement>, library: Option<Arc<OfflineLibrary>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        element.attach(events.clone());

        Self {
            inner: Mutex::new(SessionInner {
                element,
                active: None,
            }),
            library,
            events,
        }
    }

    /// The process-wide session, built by `init` on first use. Later calls
    /// return the same instance and never run `init`.
    pub fn global_or_init(init: impl FnOnce() -> MediaSession) -> Arc<MediaSession> {
        GLOBAL_SESSION.get_or_init(|| Arc::new(init())).clone()
    }

    pub fn global() -> Option<Arc<MediaSession>> {
        GLOBAL_SESSION.get().cloned()
    }

    pub fn library(&self) -> Option<&Arc<OfflineLibrary>> {
        self.library.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    pub(crate) fn dispatch(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    /// Make `episode` the active source.
    ///
    /// Returns `false` without touching the element when the resolved source
    /// is already active, so duplicate calls do not reload.
    pub async fn load_episode(&self, episode: &Episode) -> Result<bool, PlaybackError> {
        let wanted = self.preferred_source(episode).await?;
        let mut inner = self.inner.lock().await;

        if inner
            .active
            .as_ref()
            .is_some_and(|a| a.key == wanted || a.requested == wanted)
        {
            return Ok(false);
        }

        // Release the previous blob before creating another one
        inner.active = None;

        let (key, location, blob) = match &wanted {
            SourceKey::Offline(id) => match self.open_blob(id).await {
                Some(blob) => {
                    let location = file_location(&blob);
                    (wanted.clone(), location, Some(blob))
                }
                None => {
                    let url = remote_url(episode)?;
                    (SourceKey::Remote(url.clone()), url, None)
                }
            },
            SourceKey::Remote(url) => (wanted.clone(), url.clone(), None),
        };

        debug!(episode_id = %episode.id, source = ?key, "loading source");
        inner.element.set_source(Some(&location), episode.duration);
        inner.element.load();
        inner.active = Some(ActiveSource {
            key,
            requested: wanted,
            episode: episode.clone(),
            _blob: blob,
        });

        Ok(true)
    }

    async fn preferred_source(&self, episode: &Episode) -> Result<SourceKey, PlaybackError> {
        if let Some(library) = &self.library
            && library.is_offline(&episode.id).await
        {
            return Ok(SourceKey::Offline(episode.id.clone()));
        }
        remote_url(episode).map(SourceKey::Remote)
    }

    async fn open_blob(&self, episode_id: &str) -> Option<LocalBlob> {
        let library = self.library.as_ref()?;
        match library.open_blob(episode_id).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!(episode_id, "offline copy unavailable, streaming instead: {}", e);
                None
            }
        }
    }

    /// Detach the source and release its blob
    pub async fn unload(&self) {
        let mut inner = self.inner.lock().await;
        inner.element.pause();
        inner.element.set_source(None, None);
        inner.active = None;
    }

    /// Start playback. A refusal is reported as an `error` notification and
    /// `false`, never as a failure of the caller.
    pub async fn play(&self) -> bool {
        let mut inner = self.inner.lock().await;

        let result = if inner.active.is_none() {
            Err(PlaybackError::NoSource)
        } else {
            inner.element.play().await
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                drop(inner);
                warn!("playback failed to start: {}", e);
                self.dispatch(MediaEvent::Error(e.to_string()));
                false
            }
        }
    }

    pub async fn pause(&self) {
        self.inner.lock().await.element.pause();
    }

    /// Returns whether the element is playing afterwards
    pub async fn toggle_play_pause(&self) -> bool {
        let paused = self.inner.lock().await.element.paused();
        if paused {
            self.play().await
        } else {
            self.pause().await;
            false
        }
    }

    /// Seek within `[0, duration]` and return the position applied
    pub async fn seek(&self, seconds: f64) -> f64 {
        let mut inner = self.inner.lock().await;
        let element = &mut inner.element;
        if !seconds.is_finite() {
            return element.current_time();
        }

        let target = clamp_position(seconds, element.duration());
        element.set_current_time(target);
        target
    }

    /// Move relative to the current position, clamped like [`seek`](Self::seek)
    pub async fn skip(&self, seconds: f64) -> f64 {
        let current = self.inner.lock().await.element.current_time();
        self.seek(current + seconds).await
    }

    /// Clamp into `[0, 1]` and return the volume applied
    pub async fn set_volume(&self, volume: f64) -> f64 {
        let mut inner = self.inner.lock().await;
        if volume.is_nan() {
            return inner.element.volume();
        }
        let volume = volume.clamp(0.0, 1.0);
        inner.element.set_volume(volume);
        volume
    }

    /// Apply an allowed rate, or 1 for anything else; returns the rate applied
    pub async fn set_playback_rate(&self, rate: f64) -> f64 {
        let rate = normalize_playback_rate(rate);
        self.inner.lock().await.element.set_playback_rate(rate);
        rate
    }

    pub async fn get_state(&self) -> SessionState {
        let inner = self.inner.lock().await;
        let element = &inner.element;

        SessionState {
            current_time: element.current_time(),
            duration: element.duration().unwrap_or(0.0),
            paused: element.paused(),
            volume: element.volume(),
            playback_rate: element.playback_rate(),
            episode: inner.active.as_ref().map(|a| a.episode.clone()),
        }
    }

    pub async fn active_source(&self) -> Option<SourceKey> {
        self.inner.lock().await.active.as_ref().map(|a| a.key.clone())
    }
}

/// Map a requested rate onto the allow-list
pub fn normalize_playback_rate(rate: f64) -> f64 {
    PLAYBACK_RATES
        .iter()
        .copied()
        .find(|allowed| (allowed - rate).abs() < 1e-9)
        .unwrap_or(1.0)
}

fn clamp_position(seconds: f64, duration: Option<f64>) -> f64 {
    let seconds = seconds.max(0.0);
    match duration {
        Some(duration) if duration.is_finite() && duration > 0.0 => seconds.min(duration),
        _ => seconds,
    }
}

fn remote_url(episode: &Episode) -> Result<String, PlaybackError> {
    if episode.has_audio_url() {
        Ok(episode.audio_url.trim().to_string())
    } else {
        Err(PlaybackError::NoSource)
    }
}

fn file_location(blob: &LocalBlob) -> String {
    Url::from_file_path(blob.path())
        .map(|url| url.to_string())
        .unwrap_or_else(|_| blob.path().to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::make_episode;
    use crate::library::UnknownQuota;
    use crate::library::test_support::store_offline;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn session() -> MediaSession {
        MediaSession::new(Box::new(HeadlessElement::new()), None)
    }

    fn drain(rx: &mut broadcast::Receiver<MediaEvent>) -> Vec<MediaEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn loading_same_episode_twice_does_not_reload() {
        let session = session();
        let mut rx = session.subscribe();
        let episode = make_episode("a");

        assert!(session.load_episode(&episode).await.unwrap());
        assert!(!session.load_episode(&episode).await.unwrap());

        let loads = drain(&mut rx)
            .into_iter()
            .filter(|e| *e == MediaEvent::LoadStart)
            .count();
        assert_eq!(loads, 1);
        assert_eq!(
            session.active_source().await,
            Some(SourceKey::Remote(episode.audio_url.clone()))
        );
    }

    #[tokio::test]
    async fn offline_copy_is_preferred_and_released_on_switch() {
        let dir = tempdir().unwrap();
        let (library, _) =
            OfflineLibrary::open_with_quota(dir.path(), Box::new(UnknownQuota)).unwrap();
        let library = Arc::new(library);
        let offline = make_episode("offline");
        store_offline(&library, &offline, b"local bytes").await;

        let session = MediaSession::new(Box::new(HeadlessElement::new()), Some(library));
        let blobs = || std::fs::read_dir(dir.path().join("blobs")).unwrap().count();

        session.load_episode(&offline).await.unwrap();
        assert_eq!(
            session.active_source().await,
            Some(SourceKey::Offline("offline".to_string()))
        );
        assert_eq!(blobs(), 1);

        session.load_episode(&make_episode("remote")).await.unwrap();
        assert!(matches!(
            session.active_source().await,
            Some(SourceKey::Remote(_))
        ));
        assert_eq!(blobs(), 0, "previous blob must be released");
    }

    #[tokio::test]
    async fn unreadable_offline_copy_falls_back_once() {
        let dir = tempdir().unwrap();
        let (library, _) =
            OfflineLibrary::open_with_quota(dir.path(), Box::new(UnknownQuota)).unwrap();
        let library = Arc::new(library);
        let episode = make_episode("stuck");
        store_offline(&library, &episode, b"local bytes").await;

        // blobs cannot be created while a plain file sits where the directory was
        let blobs = dir.path().join("blobs");
        std::fs::remove_dir_all(&blobs).unwrap();
        std::fs::write(&blobs, b"").unwrap();

        let session = MediaSession::new(Box::new(HeadlessElement::new()), Some(library));
        let mut rx = session.subscribe();

        assert!(session.load_episode(&episode).await.unwrap());
        assert_eq!(
            session.active_source().await,
            Some(SourceKey::Remote(episode.audio_url.clone()))
        );
        assert!(!session.load_episode(&episode).await.unwrap());

        let loads = drain(&mut rx)
            .into_iter()
            .filter(|e| *e == MediaEvent::LoadStart)
            .count();
        assert_eq!(loads, 1);
    }

    #[tokio::test]
    async fn episode_without_any_source_cannot_load() {
        let session = session();
        let mut episode = make_episode("a");
        episode.audio_url = String::new();

        assert_eq!(
            session.load_episode(&episode).await,
            Err(PlaybackError::NoSource)
        );
        assert!(session.active_source().await.is_none());
    }

    #[tokio::test]
    async fn failed_play_returns_false_and_notifies() {
        let element = HeadlessElement::new();
        let blocked = element.autoplay_switch();
        blocked.store(true, Ordering::SeqCst);
        let session = MediaSession::new(Box::new(element), None);
        let mut rx = session.subscribe();

        session.load_episode(&make_episode("a")).await.unwrap();
        assert!(!session.play().await);

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(MediaEvent::Error(_))));
        assert!(session.get_state().await.paused);

        blocked.store(false, Ordering::SeqCst);
        assert!(session.play().await);
    }

    #[tokio::test]
    async fn play_without_source_returns_false() {
        let session = session();
        let mut rx = session.subscribe();

        assert!(!session.play().await);
        assert!(matches!(drain(&mut rx).as_slice(), [MediaEvent::Error(_)]));
    }

    #[tokio::test]
    async fn toggle_flips_between_play_and_pause() {
        let session = session();
        session.load_episode(&make_episode("a")).await.unwrap();

        assert!(session.toggle_play_pause().await);
        assert!(!session.get_state().await.paused);
        assert!(!session.toggle_play_pause().await);
        assert!(session.get_state().await.paused);
    }

    #[tokio::test]
    async fn seek_and_skip_stay_within_duration() {
        let session = session();
        session.load_episode(&make_episode("a")).await.unwrap();

        assert_eq!(session.seek(5000.0).await, 1800.0);
        assert_eq!(session.seek(-3.0).await, 0.0);
        assert_eq!(session.skip(30.0).await, 30.0);
        assert_eq!(session.skip(-90.0).await, 0.0);
        assert_eq!(session.seek(f64::NAN).await, 0.0);
    }

    #[tokio::test]
    async fn volume_is_clamped() {
        let session = session();

        assert_eq!(session.set_volume(1.7).await, 1.0);
        assert_eq!(session.set_volume(-0.3).await, 0.0);
        assert_eq!(session.set_volume(0.4).await, 0.4);
        assert_eq!(session.get_state().await.volume, 0.4);
    }

    #[tokio::test]
    async fn unknown_rates_reset_to_one() {
        let session = session();

        assert_eq!(session.set_playback_rate(1.5).await, 1.5);
        assert_eq!(session.set_playback_rate(1.1).await, 1.0);
        assert_eq!(session.set_playback_rate(3.0).await, 1.0);
        assert_eq!(session.set_playback_rate(0.75).await, 0.75);
        assert_eq!(session.get_state().await.playback_rate, 0.75);
    }

    #[tokio::test]
    async fn unload_detaches_everything() {
        let session = session();
        session.load_episode(&make_episode("a")).await.unwrap();
        session.play().await;

        session.unload().await;

        let state = session.get_state().await;
        assert!(state.paused);
        assert!(state.episode.is_none());
        assert_eq!(state.duration, 0.0);
    }

    #[test]
    fn global_session_is_created_once() {
        let first = MediaSession::global_or_init(session);
        let second = MediaSession::global_or_init(|| panic!("must not rebuild"));

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &MediaSession::global().unwrap()));
    }
}
