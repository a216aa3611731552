use thiserror::Error;

use crate::config::ConfigError;
use crate::db::{ErrorClass, StoreError};
use crate::local_storage::LocalStorageError;
use crate::notifications::senders::SenderError;
use crate::viewer::LoginError;

/// Top-level failures of the monitor. `Configuration` means the store is
/// reachable but unusable: the schema is missing or access is denied.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Monitoring store is misconfigured: {0}")]
    Configuration(StoreError),
    #[error("Failed to load monitoring data: {0}")]
    LoadFailed(StoreError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Login(#[from] LoginError),
    #[error(transparent)]
    LocalStorage(#[from] LocalStorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mail(#[from] SenderError),
}

impl MonitorError {
    /// Classifies an error raised while loading the initial state.
    pub fn from_load(err: StoreError) -> Self {
        match err.class() {
            ErrorClass::Integrity | ErrorClass::Policy => MonitorError::Configuration(err),
            ErrorClass::Connectivity | ErrorClass::Other => MonitorError::LoadFailed(err),
        }
    }

    /// Whether the process should stop rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MonitorError::Configuration(_) | MonitorError::Config(_))
    }
}

impl From<StoreError> for MonitorError {
    fn from(err: StoreError) -> Self {
        match err.class() {
            ErrorClass::Integrity => MonitorError::Configuration(err),
            _ => MonitorError::Store(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_errors_are_classified() {
        let missing = MonitorError::from_load(StoreError::SchemaMissing("alerta_vigia_configs".into()));
        assert!(matches!(missing, MonitorError::Configuration(_)));
        assert!(missing.is_fatal());

        let denied = MonitorError::from_load(StoreError::PolicyDenied("rls".into()));
        assert!(denied.is_fatal());

        let offline = MonitorError::from_load(StoreError::Unreachable("timeout".into()));
        assert!(matches!(offline, MonitorError::LoadFailed(_)));
        assert!(!offline.is_fatal());
    }

    #[test]
    fn test_policy_message_is_kept_verbatim() {
        let err: MonitorError = StoreError::PolicyDenied("new row violates row-level security".into()).into();
        assert!(err.to_string().contains("new row violates row-level security"));
        assert!(!err.is_fatal());
    }
}
