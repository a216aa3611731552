pub mod enums;
pub mod memory_store;
pub mod models;
pub mod pg_store;
pub mod store;

pub use enums::{EventKind, EventStatus};
pub use memory_store::MemoryStore;
pub use models::{
    Company, ComplianceConfig, EventPatch, FailureCount, MonitoringEvent, NewEvent, Post,
};
pub use pg_store::PgStore;
pub use store::{
    ChangeOperation, ErrorClass, EventChange, EventFeed, EventFilter, FeedMessage, MonitoringStore,
    StoreError,
};
