// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::episode::Episode;
use crate::error::{PlaybackError, StorageError};
use crate::player::persist::{PlayerSnapshot, SnapshotStore};
use crate::player::state::PlayerState;
use crate::session::{MediaEvent, MediaSession};

/// Timing knobs of the store
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    /// Native play/pause events are delayed by this much, and dropped when
    /// they echo a store action issued less than this long ago
    pub event_debounce: Duration,
    /// Quiet period before a mutation is written to the snapshot
    pub persist_debounce: Duration,
    /// Delay of the pass that re-asserts a cleared player
    pub clear_verify_delay: Duration,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            event_debounce: Duration::from_millis(150),
            persist_debounce: Duration::from_millis(1000),
            clear_verify_delay: Duration::from_millis(200),
        }
    }
}

/// Single source of truth for rendering playback.
///
/// Two writers feed it: actions called on the store, and native events the
/// session emits on its own (or as echoes of those actions). Actions always
/// run against the session first and commit only what the session accepted.
/// Native play/pause events are debounced and compared against the last
/// known state, so an action never triggers a second update through its own
/// echo.
///
/// Cheap to clone; all clones share one state. Must be created inside a
/// Tokio runtime.
#[derive(Clone)]
pub struct PlayerStore {
    pub(super) inner: Arc<StoreInner>,
}

pub(super) struct StoreInner {
    pub(super) session: Arc<MediaSession>,
    state: watch::Sender<PlayerState>,
    revision: AtomicU64,
    options: PlayerOptions,
    snapshots: Option<SnapshotStore>,
    reconciler: Mutex<Reconciler>,
}

#[derive(Default)]
struct Reconciler {
    /// Last play (`true`) or pause (`false`) the store asked for, and when
    last_intent: Option<(bool, Instant)>,
    pending_event: Option<JoinHandle<()>>,
    seeking: bool,
    clear_epoch: u64,
    persist_generation: u64,
    /// A snapshot write is scheduled and has not run yet
    persist_pending: bool,
    pump: Option<JoinHandle<()>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let reconciler = self.reconciler.get_mut();
        for task in [reconciler.pump.take(), reconciler.pending_event.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

impl PlayerStore {
    /// A store without persistence
    pub fn new(session: Arc<MediaSession>, options: PlayerOptions) -> Self {
        Self::build(session, None, options)
    }

    /// A store that writes its snapshot to `snapshots` after every mutation
    pub fn with_snapshots(
        session: Arc<MediaSession>,
        snapshots: SnapshotStore,
        options: PlayerOptions,
    ) -> Self {
        Self::build(session, Some(snapshots), options)
    }

    fn build(
        session: Arc<MediaSession>,
        snapshots: Option<SnapshotStore>,
        options: PlayerOptions,
    ) -> Self {
        let events = session.subscribe();
        let (state, _) = watch::channel(PlayerState::default());

        let inner = Arc::new(StoreInner {
            session,
            state,
            revision: AtomicU64::new(0),
            options,
            snapshots,
            reconciler: Mutex::new(Reconciler::default()),
        });

        let pump = tokio::spawn(pump_events(Arc::downgrade(&inner), events));
        inner.reconciler.lock().pump = Some(pump);

        Self { inner }
    }

    fn from_weak(store: &Weak<StoreInner>) -> Option<Self> {
        store.upgrade().map(|inner| Self { inner })
    }

    pub fn session(&self) -> &Arc<MediaSession> {
        &self.inner.session
    }

    pub fn state(&self) -> PlayerState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.inner.state.subscribe()
    }

    /// Bumped once per commit that changed the state
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::SeqCst)
    }

    /// Apply `mutate` and publish the result if it differs.
    /// Returns whether anything changed.
    pub(super) fn commit(&self, mutate: impl FnOnce(&mut PlayerState)) -> bool {
        self.publish(mutate, true)
    }

    /// Commit playback progress. Progress arrives several times a second
    /// while playing, so it never pushes back a snapshot write already
    /// scheduled.
    fn commit_progress(&self, mutate: impl FnOnce(&mut PlayerState)) -> bool {
        self.publish(mutate, false)
    }

    fn publish(&self, mutate: impl FnOnce(&mut PlayerState), postpone_persist: bool) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            let before = state.clone();
            mutate(state);
            state.normalize();
            *state != before
        });

        if changed {
            self.inner.revision.fetch_add(1, Ordering::SeqCst);
            self.schedule_persist(postpone_persist);
        }
        changed
    }

    /// Record a store action. A native event still waiting out its debounce
    /// is stale from here on and is dropped.
    pub(super) fn note_intent(&self, playing: bool) {
        let mut reconciler = self.inner.reconciler.lock();
        reconciler.last_intent = Some((playing, Instant::now()));
        if let Some(pending) = reconciler.pending_event.take() {
            pending.abort();
        }
    }

    fn cancel_clear_verification(&self) {
        self.inner.reconciler.lock().clear_epoch += 1;
    }

    pub async fn load_episode(&self, episode: &Episode) -> Result<(), PlaybackError> {
        self.load_with(episode, |_| {}).await
    }

    /// Load `episode` into the session, then commit it together with
    /// whatever `also` changes
    pub(super) async fn load_with(
        &self,
        episode: &Episode,
        also: impl FnOnce(&mut PlayerState),
    ) -> Result<(), PlaybackError> {
        let reloaded = self.inner.session.load_episode(episode).await?;
        self.cancel_clear_verification();
        let session = self.inner.session.get_state().await;

        self.commit(|state| {
            if reloaded || state.current_id() != Some(episode.id.as_str()) {
                state.current_episode = Some(episode.clone());
                state.is_playing = !session.paused;
                state.current_time = session.current_time;
                state.duration = if session.duration > 0.0 {
                    session.duration
                } else {
                    episode.duration.unwrap_or(0.0)
                };
                // Metadata may already be there when the element knew the duration up front
                state.is_loading = session.duration <= 0.0;
            }
            also(state);
        });

        Ok(())
    }

    /// Load and start playing. Returns whether playback started.
    pub async fn play_episode(&self, episode: &Episode) -> Result<bool, PlaybackError> {
        self.load_episode(episode).await?;
        Ok(self.play().await)
    }

    /// Returns whether playback started
    pub async fn play(&self) -> bool {
        self.note_intent(true);
        if !self.inner.session.play().await {
            return false;
        }
        self.commit(|state| state.is_playing = true);
        true
    }

    pub async fn pause(&self) {
        self.note_intent(false);
        self.inner.session.pause().await;
        self.commit(|state| state.is_playing = false);
    }

    /// Returns whether the player is playing afterwards
    pub async fn toggle_play_pause(&self) -> bool {
        if self.state().is_playing {
            self.pause().await;
            false
        } else {
            self.play().await
        }
    }

    pub async fn seek(&self, seconds: f64) -> f64 {
        let applied = self.inner.session.seek(seconds).await;
        self.commit(|state| state.current_time = applied);
        applied
    }

    pub async fn skip(&self, seconds: f64) -> f64 {
        let applied = self.inner.session.skip(seconds).await;
        self.commit(|state| state.current_time = applied);
        applied
    }

    pub async fn set_volume(&self, volume: f64) -> f64 {
        let applied = self.inner.session.set_volume(volume).await;
        self.commit(|state| state.volume = applied);
        applied
    }

    pub async fn set_playback_rate(&self, rate: f64) -> f64 {
        let applied = self.inner.session.set_playback_rate(rate).await;
        self.commit(|state| state.playback_rate = applied);
        applied
    }

    pub fn set_minimized(&self, minimized: bool) {
        self.commit(|state| state.is_minimized = minimized);
    }

    /// Stop mirroring native position updates while the user drags a seek
    /// control
    pub fn begin_seek_drag(&self) {
        self.inner.reconciler.lock().seeking = true;
    }

    /// Finish a drag by seeking to where it was released
    pub async fn end_seek_drag(&self, seconds: f64) -> f64 {
        self.inner.reconciler.lock().seeking = false;
        self.seek(seconds).await
    }

    /// Reset to the initial state and detach the source.
    ///
    /// A verification pass after `clear_verify_delay` clears the player again
    /// if a late native event brought anything back, unless an episode was
    /// loaded in the meantime.
    pub async fn clear_player(&self) {
        let epoch = {
            let mut reconciler = self.inner.reconciler.lock();
            reconciler.clear_epoch += 1;
            reconciler.last_intent = None;
            reconciler.seeking = false;
            if let Some(pending) = reconciler.pending_event.take() {
                pending.abort();
            }
            reconciler.clear_epoch
        };

        self.commit(|state| *state = PlayerState::default());

        let session = &self.inner.session;
        session.unload().await;
        session.set_volume(1.0).await;
        session.set_playback_rate(1.0).await;

        let store = Arc::downgrade(&self.inner);
        let delay = self.inner.options.clear_verify_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(store) = Self::from_weak(&store) else {
                return;
            };
            if store.inner.reconciler.lock().clear_epoch != epoch {
                return;
            }
            if store.commit(reassert_cleared) {
                warn!("late media event revived a cleared player; cleared it again");
            }
        });
    }

    /// Apply the saved snapshot, if any.
    ///
    /// Episodes without an offline copy or a remote URL are dropped and
    /// playback is never resumed. Returns whether a snapshot was applied.
    pub async fn restore(&self) -> Result<bool, StorageError> {
        let Some(snapshots) = &self.inner.snapshots else {
            return Ok(false);
        };
        let Some(snapshot) = snapshots.load()? else {
            return Ok(false);
        };

        let offline = self.offline_ids(&snapshot).await;
        let mut restored = snapshot.into_state(|e| e.has_audio_url() || offline.contains(&e.id));

        let session = &self.inner.session;
        if let Some(episode) = restored.current_episode.clone() {
            match session.load_episode(&episode).await {
                Ok(_) => {
                    restored.current_time = session.seek(restored.current_time).await;
                    let loaded = session.get_state().await;
                    if loaded.duration > 0.0 {
                        restored.duration = loaded.duration;
                    }
                    restored.is_loading = loaded.duration <= 0.0;
                }
                Err(e) => {
                    warn!(episode_id = %episode.id, "could not restore episode: {}", e);
                    restored.current_episode = None;
                    restored.current_time = 0.0;
                    restored.duration = 0.0;
                }
            }
        }
        restored.volume = session.set_volume(restored.volume).await;
        restored.playback_rate = session.set_playback_rate(restored.playback_rate).await;

        info!(
            episode_id = restored.current_id().unwrap_or("-"),
            queue = restored.queue.len(),
            "restored player"
        );
        self.cancel_clear_verification();
        self.commit(|state| *state = restored);
        Ok(true)
    }

    async fn offline_ids(&self, snapshot: &PlayerSnapshot) -> HashSet<String> {
        let mut ids = HashSet::new();
        let Some(library) = self.inner.session.library() else {
            return ids;
        };

        for episode in snapshot.current_episode.iter().chain(&snapshot.queue) {
            if library.is_offline(&episode.id).await {
                ids.insert(episode.id.clone());
            }
        }
        ids
    }

    /// Write the snapshot now instead of waiting for the debounce
    pub fn flush(&self) -> Result<(), StorageError> {
        {
            let mut reconciler = self.inner.reconciler.lock();
            reconciler.persist_generation += 1;
            reconciler.persist_pending = false;
        }
        self.write_snapshot()
    }

    fn write_snapshot(&self) -> Result<(), StorageError> {
        let Some(snapshots) = &self.inner.snapshots else {
            return Ok(());
        };
        let snapshot = PlayerSnapshot::from(&*self.inner.state.borrow());
        snapshots.save(&snapshot)
    }

    fn schedule_persist(&self, postpone: bool) {
        if self.inner.snapshots.is_none() {
            return;
        }

        let generation = {
            let mut reconciler = self.inner.reconciler.lock();
            if reconciler.persist_pending && !postpone {
                return;
            }
            reconciler.persist_pending = true;
            reconciler.persist_generation += 1;
            reconciler.persist_generation
        };

        let store = Arc::downgrade(&self.inner);
        let delay = self.inner.options.persist_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(store) = Self::from_weak(&store) else {
                return;
            };
            {
                let mut reconciler = store.inner.reconciler.lock();
                if reconciler.persist_generation != generation {
                    return;
                }
                reconciler.persist_pending = false;
            }
            if let Err(e) = store.write_snapshot() {
                warn!("failed to save player snapshot: {}", e);
            }
        });
    }

    async fn handle_event(&self, event: MediaEvent) {
        match event {
            MediaEvent::Play => self.debounce_play_state(true),
            MediaEvent::Pause => self.debounce_play_state(false),
            MediaEvent::TimeUpdate(seconds) => {
                if self.inner.reconciler.lock().seeking {
                    return;
                }
                self.commit_progress(|state| {
                    if state.current_episode.is_some() {
                        state.current_time = seconds;
                    }
                });
            }
            MediaEvent::DurationKnown(duration) => {
                self.commit(|state| {
                    if state.current_episode.is_some() && duration.is_finite() && duration > 0.0 {
                        state.duration = duration;
                        state.is_loading = false;
                    }
                });
            }
            MediaEvent::CanPlay => {
                self.commit(|state| state.is_loading = false);
            }
            MediaEvent::Ended => self.advance_after_end().await,
            MediaEvent::Error(message) => {
                debug!(error = %message, "media element reported an error");
                self.commit(|state| {
                    state.is_playing = false;
                    state.is_loading = false;
                });
            }
            // load_with already marked the store as loading
            MediaEvent::LoadStart => {}
        }
    }

    fn debounce_play_state(&self, playing: bool) {
        let mut reconciler = self.inner.reconciler.lock();

        if let Some((intent, at)) = reconciler.last_intent
            && intent == playing
            && at.elapsed() < self.inner.options.event_debounce
        {
            debug!(playing, "dropping echo of a store action");
            return;
        }

        if let Some(pending) = reconciler.pending_event.take() {
            pending.abort();
        }

        let store = Arc::downgrade(&self.inner);
        let delay = self.inner.options.event_debounce;
        reconciler.pending_event = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(store) = Self::from_weak(&store) {
                store.apply_native_play_state(playing).await;
            }
        }));
    }

    async fn apply_native_play_state(&self, playing: bool) {
        if self.inner.session.get_state().await.paused == playing {
            debug!(playing, "element has moved on since the event");
            return;
        }
        let changed = self.commit(|state| {
            if state.current_episode.is_some() {
                state.is_playing = playing;
            }
        });
        if !changed {
            debug!(playing, "native event already reflected");
        }
    }
}

fn reassert_cleared(state: &mut PlayerState) {
    let cleared = PlayerState {
        volume: state.volume,
        playback_rate: state.playback_rate,
        is_minimized: state.is_minimized,
        ..PlayerState::default()
    };
    *state = cleared;
}

async fn pump_events(store: Weak<StoreInner>, mut events: broadcast::Receiver<MediaEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "player store fell behind media events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(store) = PlayerStore::from_weak(&store) else {
            break;
        };
        store.handle_event(event).await;
    }
}

#[cfg(test)]
pub(super) fn headless_store() -> PlayerStore {
    use crate::session::HeadlessElement;

    // periodic time updates would add commits to every revision count
    let element = HeadlessElement::new().with_time_updates(None);
    let session = MediaSession::new(Box::new(element), None);
    PlayerStore::new(Arc::new(session), PlayerOptions::default())
}

#[cfg(test)]
pub(super) async fn settle(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
