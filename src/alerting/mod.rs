pub mod compliance;

pub use compliance::{save_config, ComplianceConfigs, ComplianceScheduler, MissedTransition, RaisedAlert};
