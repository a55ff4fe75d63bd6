use crate::episode::Episode;

/// Everything the UI renders about playback
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub current_episode: Option<Episode>,
    pub is_playing: bool,
    pub current_time: f64,
    /// 0 until known
    pub duration: f64,
    pub playback_rate: f64,
    pub volume: f64,
    pub is_loading: bool,
    pub is_minimized: bool,
    pub queue: Vec<Episode>,
    /// Position in `queue`, `None` when nothing from the queue is selected
    pub queue_index: Option<usize>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            current_episode: None,
            is_playing: false,
            current_time: 0.0,
            duration: 0.0,
            playback_rate: 1.0,
            volume: 1.0,
            is_loading: false,
            is_minimized: false,
            queue: Vec::new(),
            queue_index: None,
        }
    }
}

/// Coarse lifecycle of the player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Loading,
    ReadyPaused,
    ReadyPlaying,
}

impl PlayerState {
    pub fn phase(&self) -> PlaybackPhase {
        match self {
            PlayerState {
                current_episode: None,
                ..
            } => PlaybackPhase::Idle,
            PlayerState {
                is_loading: true, ..
            } => PlaybackPhase::Loading,
            PlayerState {
                is_playing: true, ..
            } => PlaybackPhase::ReadyPlaying,
            _ => PlaybackPhase::ReadyPaused,
        }
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_episode.as_ref().map(|e| e.id.as_str())
    }

    /// Restore the invariants every committed state must satisfy
    pub(crate) fn normalize(&mut self) {
        if self.current_episode.is_none() {
            self.is_playing = false;
            self.is_loading = false;
        }

        self.queue_index = match self.queue_index {
            _ if self.queue.is_empty() => None,
            Some(index) => Some(index.min(self.queue.len() - 1)),
            None => None,
        };
    }
}
