pub mod alerting;
pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod local_storage;
pub mod monitoring;
pub mod notifications;
pub mod realtime;
pub mod tasks;
pub mod version;
pub mod viewer;
