//! # NSI Common Library
//!
//! Shared code for the NSI normalization services including:
//! - Error types
//! - Event types (NsiEvent enum) and the EventBus
//! - TOML configuration model and root folder resolution
//! - Time helpers
//! - SQLite lock retry

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db_retry;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
