//! Archive Writer
//!
//! `DeviceWriter` owns everything written for one device: the current segment, the
//! open property index handles and its view of the property registry. One writer
//! is only ever driven from one execution context at a time (see
//! [`WriterPool`](crate::writer_pool::WriterPool)), so none of this state is locked.
//!
//! ## Lifecycle
//!
//! ```text
//! NONE ── start() ──► STARTED ── update_schema() ──► CONNECTED ── complete() ──► COMPLETE
//!   ▲                                                                              │
//!   └──────────────────────────────── stop() / drop ───────────────────────────────┘
//! ```
//!
//! Changes are archived only in COMPLETE; earlier batches are dropped.
//!
//! ## Write Flow
//!
//! ```text
//! append_batch(updates)
//!     ↓
//! registry changed? ──YES──► close segment, start a fresh one,
//!     ↓                      rebuild indexes of new properties for segments written since
//! per archivable update:
//!     segment line ──► +LOG (first line of a session) or =NEW (first line of a file)
//!                  ──► property index record (registered properties only)
//!                  ──► segment ≥ max size? close it, advance archive.last
//!     ↓
//! flush segment and index handles
//! ```
//!
//! Segment index stamps never decrease: an entry is stamped no earlier than the one
//! before it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chronolog_core::{
    DeviceSchema, IndexEvent, LineStatus, PropertyIndexRecord, SegmentIndexEntry, SegmentLine,
    Timestamp, Value,
};
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::error::{Error, Result};
use crate::index_builder::IndexBuilderService;
use crate::layout::ArchiveLayout;
use crate::property_index::{build_property_index, PropertyIndexWriter};
use crate::registry::PropertyRegistry;
use crate::schema_archive::SchemaArchive;
use crate::segment::{SegmentCounter, SegmentFile};
use crate::segment_index::{append_entry, read_entries};

/// One changed property as delivered by the device layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
    pub property: String,
    /// Device-reported time of the change; updates without one are not archived.
    pub timestamp: Option<Timestamp>,
    pub value: Value,
}

impl PropertyUpdate {
    pub fn new(property: impl Into<String>, timestamp: Timestamp, value: Value) -> Self {
        Self {
            property: property.into(),
            timestamp: Some(timestamp),
            value,
        }
    }

    pub fn untimed(property: impl Into<String>, value: Value) -> Self {
        Self {
            property: property.into(),
            timestamp: None,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingState {
    None,
    Started,
    Connected,
    Complete,
}

pub struct DeviceWriter {
    device_id: String,
    layout: ArchiveLayout,
    max_segment_size: u64,
    default_user: String,
    state: LoggingState,
    schema: Option<DeviceSchema>,
    counter: Option<SegmentCounter>,
    segment: Option<SegmentFile>,
    registry: Option<PropertyRegistry>,
    index_writers: HashMap<String, PropertyIndexWriter>,
    builder: Option<Arc<IndexBuilderService>>,
    /// Segment current at the last registry check.
    checked_segment: Option<u32>,
    /// No line written yet in this session; the next one is a LOGIN line.
    pending_login: bool,
    last_update: Option<Timestamp>,
    last_entry: Option<Timestamp>,
    user: String,
}

impl DeviceWriter {
    pub fn new(device_id: impl Into<String>, config: &ArchiveConfig) -> Self {
        Self {
            device_id: device_id.into(),
            layout: ArchiveLayout::new(&config.directory),
            max_segment_size: config.max_segment_size,
            default_user: config.default_user.clone(),
            state: LoggingState::None,
            schema: None,
            counter: None,
            segment: None,
            registry: None,
            index_writers: HashMap::new(),
            builder: None,
            checked_segment: None,
            pending_login: true,
            last_update: None,
            last_entry: None,
            user: config.default_user.clone(),
        }
    }

    /// Routes index rebuilds through `builder` so they never race its worker.
    pub fn with_builder(mut self, builder: Arc<IndexBuilderService>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> LoggingState {
        self.state
    }

    /// Most recent device timestamp seen, archived or not.
    pub fn last_update(&self) -> Option<Timestamp> {
        self.last_update
    }

    /// Segment currently written to, if logging has started.
    pub fn current_segment(&self) -> Option<u32> {
        self.counter.as_ref().map(SegmentCounter::current)
    }

    fn invalid_state(&self, reason: &str) -> Error {
        Error::InvalidState {
            device: self.device_id.clone(),
            reason: format!("{} (state {:?})", reason, self.state),
        }
    }

    /// NONE → STARTED: prepares directories and loads the segment counter.
    pub fn start(&mut self) -> Result<()> {
        if self.state != LoggingState::None {
            return Err(self.invalid_state("start requires NONE"));
        }
        self.layout.create_device_dirs(&self.device_id)?;
        self.counter = Some(SegmentCounter::load(&self.layout, &self.device_id)?);
        self.registry = Some(PropertyRegistry::open(self.layout.registry(&self.device_id))?);
        self.checked_segment = self.current_segment();
        self.last_entry = match read_entries(&self.layout, &self.device_id) {
            Ok(entries) => entries.iter().map(|entry| entry.timestamp).max(),
            Err(e) => {
                warn!(device = %self.device_id, error = %e, "Failed to read segment index");
                None
            }
        };
        self.pending_login = true;
        self.state = LoggingState::Started;
        info!(
            device = %self.device_id,
            segment = self.current_segment().unwrap_or(0),
            "Device logging started"
        );
        Ok(())
    }

    /// Archives a new schema; STARTED → CONNECTED on the first one.
    pub fn update_schema(&mut self, schema: DeviceSchema, timestamp: Timestamp) -> Result<()> {
        if self.state == LoggingState::None {
            return Err(self.invalid_state("schema update before start"));
        }
        SchemaArchive::new(self.layout.clone()).append(&self.device_id, timestamp, &schema)?;
        self.schema = Some(schema);
        if self.state == LoggingState::Started {
            self.state = LoggingState::Connected;
        }
        Ok(())
    }

    /// CONNECTED → COMPLETE, archiving the initial configuration.
    pub fn complete(&mut self, initial: &[PropertyUpdate], user: &str) -> Result<usize> {
        if self.state != LoggingState::Connected {
            return Err(self.invalid_state("complete requires CONNECTED"));
        }
        self.state = LoggingState::Complete;
        info!(device = %self.device_id, "Device logging complete");
        self.append_batch(initial, user)
    }

    /// Writes one change batch. Returns the number of lines written.
    ///
    /// Single updates that cannot be written are logged and dropped.
    #[tracing::instrument(skip(self, updates), fields(device = %self.device_id, updates = updates.len()))]
    pub fn append_batch(&mut self, updates: &[PropertyUpdate], user: &str) -> Result<usize> {
        if self.state != LoggingState::Complete {
            debug!(state = ?self.state, "Dropping changes received before logging is complete");
            return Ok(0);
        }
        self.user = if user.is_empty() {
            self.default_user.clone()
        } else {
            user.to_string()
        };
        self.check_registry()?;

        let mut accepted: Vec<(&PropertyUpdate, Timestamp)> = Vec::with_capacity(updates.len());
        for update in updates {
            if let Some(ts) = update.timestamp {
                if self.last_update.map_or(true, |last| ts > last) {
                    self.last_update = Some(ts);
                }
            }
            let archived = self
                .schema
                .as_ref()
                .is_some_and(|schema| schema.is_archived(&update.property));
            if !archived {
                continue;
            }
            match update.timestamp {
                Some(ts) => accepted.push((update, ts)),
                None => warn!(property = %update.property, "Skipping update without timestamp"),
            }
        }
        let Some(login_ts) = accepted.iter().map(|(_, ts)| *ts).max() else {
            return Ok(0);
        };

        let mut written = 0;
        for (update, ts) in accepted {
            let status = if self.pending_login {
                LineStatus::Login
            } else {
                LineStatus::Valid
            };
            let line = match SegmentLine::update(ts, &update.property, &update.value, &self.user, status) {
                Ok(line) => line,
                Err(e) => {
                    warn!(property = %update.property, error = %e, "Failed to encode value, update dropped");
                    continue;
                }
            };
            match self.write_line(&update.property, &line, login_ts) {
                Ok(()) => written += 1,
                Err(e) => warn!(
                    property = %update.property,
                    error = %e,
                    "Failed to write update, dropped"
                ),
            }
        }
        if written > 0 {
            if let Err(e) = self.flush_handles() {
                warn!(error = %e, "Failed to flush after batch");
            }
        }
        Ok(written)
    }

    /// Appends one line. Errors mean the line was not written; once it is in the
    /// segment, index and rotation failures are only logged.
    fn write_line(&mut self, property: &str, line: &SegmentLine, login_ts: Timestamp) -> Result<()> {
        self.ensure_segment()?;
        let segment = self
            .segment
            .as_mut()
            .ok_or_else(|| Error::NotLogging(self.device_id.clone()))?;
        let segment_no = segment.segment();
        let new_file = segment.position() == 0;
        let offset = segment.append_line(&line.format())?;
        let position = segment.position();

        let entry = if self.pending_login {
            self.pending_login = false;
            let stamp = self.index_stamp(login_ts);
            Some(SegmentIndexEntry::new(IndexEvent::Login, stamp, offset, &self.user, segment_no))
        } else if new_file {
            let stamp = self.index_stamp(line.timestamp);
            Some(SegmentIndexEntry::new(IndexEvent::NewFile, stamp, offset, &self.user, segment_no))
        } else {
            None
        };
        if let Some(entry) = entry {
            if let Err(e) = append_entry(&self.layout, &self.device_id, &entry) {
                warn!(segment = segment_no, event = %entry.event, error = %e, "Failed to append segment index entry");
            }
        }

        if self.registry.as_ref().is_some_and(|r| r.contains(property)) {
            if let Err(e) = self.append_index_record(property, segment_no, &line.timestamp, offset) {
                warn!(property = %property, segment = segment_no, error = %e, "Failed to extend property index");
            }
        }

        if position >= self.max_segment_size {
            debug!(segment = segment_no, size = position, "Segment reached maximum size");
            if let Err(e) = self.close_segment() {
                warn!(segment = segment_no, error = %e, "Failed to rotate segment");
            }
        }
        Ok(())
    }

    /// Stamp for the next segment index entry, clamped to the previous one.
    fn index_stamp(&mut self, timestamp: Timestamp) -> Timestamp {
        let stamp = match self.last_entry {
            Some(last) if last > timestamp => last,
            _ => timestamp,
        };
        self.last_entry = Some(stamp);
        stamp
    }

    fn append_index_record(
        &mut self,
        property: &str,
        segment: u32,
        timestamp: &Timestamp,
        offset: u64,
    ) -> Result<()> {
        let first = !self.index_writers.contains_key(property);
        if first {
            let path = self.layout.property_index(&self.device_id, property, segment);
            self.index_writers
                .insert(property.to_string(), PropertyIndexWriter::open(&path)?);
        }
        if let Some(writer) = self.index_writers.get_mut(property) {
            writer.append(&PropertyIndexRecord::new(timestamp, offset, first))?;
        }
        Ok(())
    }

    fn ensure_segment(&mut self) -> Result<()> {
        if self.segment.is_some() {
            return Ok(());
        }
        let number = self
            .current_segment()
            .ok_or_else(|| self.invalid_state("no segment counter"))?;
        let path = self.layout.segment(&self.device_id, number);
        self.segment = Some(SegmentFile::open(&path, number)?);
        debug!(device = %self.device_id, segment = number, "Opened segment");
        Ok(())
    }

    /// Registry changes take effect at the start of the batch that observes them.
    ///
    /// Properties added since the last check get their indexes rebuilt for every
    /// segment written since then; a build requested by the reader may have read those
    /// segments before their last lines were written.
    fn check_registry(&mut self) -> Result<()> {
        let Some(registry) = self.registry.as_mut() else {
            return Ok(());
        };
        let known: HashSet<String> = registry.properties().iter().cloned().collect();
        if registry.refresh()? {
            let added: Vec<String> = registry
                .properties()
                .iter()
                .filter(|property| !known.contains(*property))
                .cloned()
                .collect();
            let written = self.checked_segment.zip(self.current_segment());
            info!(
                device = %self.device_id,
                added = added.len(),
                "Property registry changed, starting a new segment"
            );
            self.force_new_segment()?;
            if let Some((from, to)) = written {
                self.rebuild_indexes(&added, from, to);
            }
        }
        self.checked_segment = self.current_segment();
        Ok(())
    }

    /// Moves to a fresh segment number, so no build queued for an earlier number can
    /// replace an index this writer extends incrementally.
    fn force_new_segment(&mut self) -> Result<()> {
        if self.segment.is_some() {
            return self.close_segment();
        }
        self.index_writers.clear();
        if let Some(counter) = self.counter.as_mut() {
            let next = counter.advance()?;
            debug!(device = %self.device_id, segment = next, "Skipped to a fresh segment");
        }
        Ok(())
    }

    fn rebuild_indexes(&self, properties: &[String], from: u32, to: u32) {
        for segment in from..=to {
            if !self.layout.segment(&self.device_id, segment).exists() {
                continue;
            }
            for property in properties {
                let built = match &self.builder {
                    Some(builder) => builder.build_blocking(&self.device_id, property, segment),
                    None => build_property_index(&self.layout, &self.device_id, property, segment),
                };
                if let Err(e) = built {
                    warn!(
                        device = %self.device_id,
                        property = %property,
                        segment = segment,
                        error = %e,
                        "Failed to rebuild property index"
                    );
                }
            }
        }
    }

    /// Flushes and closes the current segment and moves the counter on.
    fn close_segment(&mut self) -> Result<()> {
        if let Some(mut segment) = self.segment.take() {
            segment.flush()?;
        }
        self.flush_index_writers()?;
        self.index_writers.clear();
        if let Some(counter) = self.counter.as_mut() {
            let next = counter.advance()?;
            debug!(device = %self.device_id, segment = next, "Advanced to next segment");
        }
        Ok(())
    }

    fn flush_index_writers(&mut self) -> Result<()> {
        for writer in self.index_writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Flushes open handles. A logging writer picks up registry changes here too, so
    /// new indexes do not wait for the device's next change.
    pub fn flush(&mut self) -> Result<()> {
        if self.state == LoggingState::Complete {
            self.check_registry()?;
        }
        self.flush_handles()
    }

    /// Segment content first so index records never lead it.
    fn flush_handles(&mut self) -> Result<()> {
        if let Some(segment) = self.segment.as_mut() {
            segment.flush()?;
        }
        self.flush_index_writers()
    }

    /// Ends the session: LOGOUT line and `-LOG` entry stamped with the last device time.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == LoggingState::None {
            return Ok(());
        }
        let result = self.write_logout();
        let flushed = self.flush();
        self.segment = None;
        self.index_writers.clear();
        self.state = LoggingState::None;
        self.pending_login = true;
        info!(device = %self.device_id, "Device logging stopped");
        result.and(flushed)
    }

    fn write_logout(&mut self) -> Result<()> {
        if self.state != LoggingState::Complete || self.pending_login {
            return Ok(());
        }
        let Some(last) = self.last_update else {
            return Ok(());
        };
        self.ensure_segment()?;
        let segment = self
            .segment
            .as_mut()
            .ok_or_else(|| Error::NotLogging(self.device_id.clone()))?;
        let segment_no = segment.segment();
        let offset = segment.append_line(&SegmentLine::logout(last, &self.user).format())?;
        let stamp = self.index_stamp(last);
        let entry = SegmentIndexEntry::new(IndexEvent::Logout, stamp, offset, &self.user, segment_no);
        append_entry(&self.layout, &self.device_id, &entry)?;
        Ok(())
    }
}

impl Drop for DeviceWriter {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(device = %self.device_id, error = %e, "Failed to stop device logging cleanly");
        }
    }
}
