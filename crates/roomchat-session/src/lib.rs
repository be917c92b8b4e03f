//! Room session core: the per-room controller and the pieces it feeds
//! (message timeline, presence), plus the room list synchronizer.

pub mod controller;
pub mod debounce;
pub mod presence;
pub mod reconciler;
pub mod roster;

pub use controller::{ExitReason, RoomSessionController, RoomView, SessionPhase};
pub use debounce::DebounceTimer;
pub use presence::{PresenceTracker, TypingEmitter};
pub use reconciler::MessageTimeline;
pub use roster::{RoomRoster, RosterState};
