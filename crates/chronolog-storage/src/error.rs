//! Storage Error Types
//!
//! ## Error Categories
//!
//! ### Query Errors (returned to callers of the history interfaces)
//! - `NotYetIndexed`: first history request for a property; index builds were queued, retry later
//! - `BeforeAnyData`: the requested time lies before anything logged for the device
//! - `NoSchema`: no schema archived at or before the requested time
//! - `MissingArchive`: the device has no archive files (never logged)
//!
//! ### Lifecycle Errors
//! - `NotLogging`: a change arrived for a device the pool is not logging
//! - `InvalidState`: a lifecycle step was invoked out of order
//!
//! ### Low-level Errors
//! - `Io`, `Core` and `Join` wrap I/O, format and task failures via `#[from]`
//!
//! Write-path problems on single updates are logged and skipped rather than returned.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("History of {device}.{property} is not indexed yet, retry once index building is done")]
    NotYetIndexed { device: String, property: String },

    #[error("Requested time point {0} is earlier than anything logged")]
    BeforeAnyData(String),

    #[error("No schema archived for {device} at or before {timepoint}")]
    NoSchema { device: String, timepoint: String },

    #[error("Archive missing for device {device}: {path}")]
    MissingArchive { device: String, path: String },

    #[error("Device is not being logged: {0}")]
    NotLogging(String),

    #[error("Invalid logging state for {device}: {reason}")]
    InvalidState { device: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Core(#[from] chronolog_core::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
