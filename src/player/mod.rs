mod persist;
mod queue;
mod state;
mod store;

pub use persist::{PlayerSnapshot, SnapshotStore};
pub use state::{PlaybackPhase, PlayerState};
pub use store::{PlayerOptions, PlayerStore};
