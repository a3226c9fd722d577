pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod router;
pub mod schedule;
pub mod store;
pub mod types;
