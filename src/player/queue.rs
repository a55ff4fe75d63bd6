use tracing::{debug, warn};

use crate::episode::Episode;
use crate::error::PlaybackError;
use crate::player::state::PlayerState;
use crate::player::store::PlayerStore;

fn next_index(state: &PlayerState) -> Option<usize> {
    let next = state.queue_index.map_or(0, |index| index + 1);
    (next < state.queue.len()).then_some(next)
}

fn previous_index(state: &PlayerState) -> Option<usize> {
    state.queue_index?.checked_sub(1)
}

impl PlayerStore {
    /// Replace the playlist and select `start_index`, clamped into range.
    ///
    /// The selected episode is loaded but not started; queue, index and
    /// current episode change in one commit. An empty list clears the queue
    /// and leaves the current episode alone.
    pub async fn set_queue(
        &self,
        episodes: Vec<Episode>,
        start_index: usize,
    ) -> Result<(), PlaybackError> {
        if episodes.is_empty() {
            self.commit(|state| {
                state.queue.clear();
                state.queue_index = None;
            });
            return Ok(());
        }

        let index = start_index.min(episodes.len() - 1);
        let target = episodes[index].clone();
        self.load_with(&target, move |state| {
            state.queue = episodes;
            state.queue_index = Some(index);
        })
        .await
    }

    pub fn has_next(&self) -> bool {
        next_index(&self.state()).is_some()
    }

    pub fn has_previous(&self) -> bool {
        previous_index(&self.state()).is_some()
    }

    /// Step forward; a no-op returning `false` at the end of the queue
    pub async fn next_episode(&self) -> Result<bool, PlaybackError> {
        let state = self.state();
        match next_index(&state) {
            Some(index) => self.jump_to(&state, index).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Step back; a no-op returning `false` at the start of the queue
    pub async fn previous_episode(&self) -> Result<bool, PlaybackError> {
        let state = self.state();
        match previous_index(&state) {
            Some(index) => self.jump_to(&state, index).await.map(|_| true),
            None => Ok(false),
        }
    }

    async fn jump_to(&self, state: &PlayerState, index: usize) -> Result<(), PlaybackError> {
        let episode = state.queue[index].clone();
        self.load_with(&episode, |s| s.queue_index = Some(index))
            .await?;

        if state.is_playing {
            self.play().await;
        }
        Ok(())
    }

    /// Continue with the next queue entry when the current one finished,
    /// or stop at the end of the queue
    pub(super) async fn advance_after_end(&self) {
        let state = self.state();
        if state.current_episode.is_none() {
            return;
        }

        if let Some(index) = next_index(&state) {
            let episode = state.queue[index].clone();
            debug!(episode_id = %episode.id, "advancing queue");
            match self
                .load_with(&episode, |s| s.queue_index = Some(index))
                .await
            {
                Ok(()) => {
                    self.play().await;
                    return;
                }
                Err(e) => warn!(episode_id = %episode.id, "cannot continue queue: {}", e),
            }
        }

        self.note_intent(false);
        self.session().pause().await;
        self.commit(|s| s.is_playing = false);
    }
}
