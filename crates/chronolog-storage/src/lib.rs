//! Chronolog Storage Layer
//!
//! This crate implements the file-based archive of device property changes: it
//! appends every change of a logged device to plain-text segment files and answers
//! history and past-configuration queries from them.
//!
//! ## What is in an Archive?
//!
//! Per device the archive keeps:
//!
//! 1. **Segments**: append-only text files, one line per property change
//! 2. **Segment Index**: a text sidecar recording session starts, stops and segment rollovers
//! 3. **Property Indexes**: binary, time-sorted offset tables per (property, segment)
//! 4. **Schema Archive**: every schema the device ever announced, with its timestamp
//! 5. **Property Registry**: the properties whose indexes are maintained
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │   Devices   │
//! └──────┬──────┘
//!        │ change batches
//!        ▼
//! ┌─────────────────┐
//! │  WriterPool     │  one serialized DeviceWriter per device
//! │  DeviceWriter   │
//! └────────┬────────┘
//!          │ lines, index entries, index records
//!          ▼
//! ┌─────────────────┐        ┌──────────────────────┐
//! │  <root>/<dev>/  │ ◄───── │ IndexBuilderService  │  rebuilds property indexes
//! │  raw/  idx/     │        └──────────▲───────────┘
//! └────────┬────────┘                   │ first request for a property
//!          │                            │
//!          ▼                            │
//! ┌─────────────────┐                   │
//! │  HistoryReader  │ ──────────────────┘
//! │  - history      │
//! │  - config at t  │
//! └────────┬────────┘
//!          ▼
//! ┌─────────────┐
//! │   Clients   │
//! └─────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use chronolog_storage::{ArchiveBackend, ArchiveConfig, FileBackend, HistoryQuery};
//!
//! let backend = FileBackend::new(ArchiveConfig::load(Path::new("archive.toml"))?);
//! let pool = backend.pool();
//! pool.start_logging("SA1/MOTOR/X").await?;
//! pool.update_schema("SA1/MOTOR/X", schema, Timestamp::now()).await?;
//! pool.complete("SA1/MOTOR/X", initial, "operator").await?;
//!
//! backend.append_change("SA1/MOTOR/X", updates, "operator").await?;
//!
//! let history = backend
//!     .get_history("SA1/MOTOR/X", "position", HistoryQuery::from_iso(Some(from), Some(to), 500)?)
//!     .await?;
//! ```
//!
//! ## Design Decisions
//!
//! ### Why Plain Text Segments?
//! - **Recovery**: every index can be rebuilt from the segments alone
//! - **Appends only**: readers never see a rewritten prefix, so no locking is needed
//!
//! ### Why Build Indexes Lazily?
//! - Only properties somebody asked for cost index space
//! - The first request returns `NotYetIndexed` right away instead of blocking on a rebuild
//!
//! ### Timestamps
//! All archive timestamps are device time. Wall-clock time never decides ordering.

pub mod backend;
pub mod config;
pub mod error;
pub mod index_builder;
pub mod layout;
pub mod property_index;
pub mod reader;
pub mod registry;
pub mod schema_archive;
pub mod segment;
pub mod segment_index;
pub mod writer;
pub mod writer_pool;

pub use backend::{ArchiveBackend, FileBackend};
pub use config::ArchiveConfig;
pub use error::{Error, Result};
pub use index_builder::{BuildKey, IndexBuilderService};
pub use layout::ArchiveLayout;
pub use property_index::{build_property_index, PropertyIndexFile, PropertyIndexWriter};
pub use reader::{ConfigAtTimepoint, HistoryPoint, HistoryQuery, HistoryReader};
pub use registry::PropertyRegistry;
pub use schema_archive::SchemaArchive;
pub use segment::{SegmentCounter, SegmentFile};
pub use segment_index::rebuild_segment_index;
pub use writer::{DeviceWriter, LoggingState, PropertyUpdate};
pub use writer_pool::WriterPool;
