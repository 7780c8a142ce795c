//! Chronolog Core
//!
//! Shared data model for the chronolog device property archive. Writers and
//! readers of the archive agree on everything defined here: timestamps, the
//! value type tags, the text encoding of values and the line/record formats
//! of every archive file.
//!
//! ## Modules
//!
//! - [`time`]: `Epochstamp` (seconds + attoseconds) and `Timestamp` (epoch + sequence id)
//! - [`value`]: `Value`, `ValueType` and the text encoding used inside segment lines
//! - [`schema`]: the per-device type descriptor stored in the schema archive
//! - [`configuration`]: configuration documents reconstructed from the archive
//! - [`record`]: segment lines, segment index entries, schema archive lines and
//!   the fixed-size binary property index record

pub mod configuration;
pub mod error;
pub mod record;
pub mod schema;
pub mod time;
pub mod value;

pub use configuration::{ConfigEntry, Configuration};
pub use error::{Error, Result};
pub use record::{
    IndexEvent, LineStatus, PropertyIndexRecord, SchemaArchiveEntry, SegmentIndexEntry,
    SegmentLine,
};
pub use schema::{ArchivePolicy, DeviceSchema, PropertyDescriptor};
pub use time::{Epochstamp, Timestamp};
pub use value::{decode_value, encode_value, Record, Value, ValueType, NEWLINE_MANGLE};
