//! Viewer-side event history kept in step with the store's change-feed.
pub mod hidden;
pub mod reconciler;
pub mod timeline;

pub use hidden::HiddenEvents;
pub use reconciler::{AlertTone, ReconcileOutcome, Reconciler, Silent, TerminalBell};
pub use timeline::{Timeline, TimelineEvent};
