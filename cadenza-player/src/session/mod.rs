//! Per-room playback sessions
//!
//! The orchestrator core: session state machine, queue/history store,
//! recovery policy, autoplay engine, supervisors, and presence fan-out.

pub mod autoplay;
pub mod events;
pub mod player;
pub mod presence;
pub mod recovery;
pub mod store;
pub mod timers;

pub use autoplay::{HttpRecommender, Recommender, SeedInfo};
pub use player::{PositionClock, Session, SessionOptions, StatusLine};
pub use presence::PresenceBroadcaster;
pub use recovery::{ErrorClass, RecoveryAction, RetryCounters, Severity, TrackError};
pub use store::{PlayQueue, QueuePosition};
