//! Guard-side monitoring: event emission, the offline buffer, heartbeats,
//! failure tallies and presence prompts.
pub mod connectivity;
pub mod emitter;
pub mod failure_counter;
pub mod heartbeat;
pub mod offline_queue;
pub mod presence;

pub use connectivity::{Connectivity, ReachabilityProbe};
pub use emitter::{EmitError, Emission, Emitter};
pub use failure_counter::{CounterOutcome, FailureCounter, FailureTallies};
pub use heartbeat::{
    ActiveSession, HeartbeatController, HeartbeatSettings, InactiveReason, PresenceConfirmer,
    SessionError, SessionState,
};
pub use offline_queue::{OfflineEntry, OfflineQueue, SyncError, SyncOutcome};
pub use presence::{PresenceCycle, PresenceEvent, PresenceSettings};
