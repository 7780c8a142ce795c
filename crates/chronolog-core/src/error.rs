//! Error Types for Chronolog Core
//!
//! ## Error Categories
//!
//! ### Format Errors
//! - `InvalidLine`: A segment, index or schema archive line does not match its format
//! - `InvalidTimestamp`: A decimal or ISO-8601 timestamp could not be parsed
//! - `InvalidRecord`: A binary property index record has the wrong size
//!
//! ### Value Errors
//! - `UnknownType`: A type tag that this version does not know
//! - `InvalidValue`: Text that cannot be decoded as the declared type
//!
//! ### Serialization Errors
//! - `Json` and `Base64`, converted automatically via `#[from]`
//!
//! Everything in this crate returns `Result<T>`, aliased to `Result<T, Error>`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid line: {0}")]
    InvalidLine(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Unknown type tag: {0}")]
    UnknownType(String),

    #[error("Invalid value for {type_tag}: {text}")]
    InvalidValue { type_tag: String, text: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
