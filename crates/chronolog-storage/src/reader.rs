//! History Reader
//!
//! Answers the two read-only queries of the archive:
//!
//! - [`HistoryReader::property_history`]: the values of one property over a time range,
//!   optionally thinned to a maximum number of points
//! - [`HistoryReader::config_at`]: the configuration of a device as it was at one
//!   point in time, rebuilt by replaying the session that contained it
//!
//! ## Property history
//!
//! ```text
//! segment index ──► segment range [from.segment, to.segment]
//!       │
//!       ▼
//! property index files ──► first record ≥ from, last record ≤ to, record counts
//!       │
//!       ▼
//! raw segments ──► seek to each kept record's offset, parse, emit
//! ```
//!
//! A property without an index is registered on first request and its indexes are
//! queued on the [`IndexBuilderService`]; that request fails with
//! [`Error::NotYetIndexed`] and the caller retries later.
//!
//! All methods block on file I/O. Async callers wrap them in `spawn_blocking`.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::{Arc, Mutex, PoisonError};

use chronolog_core::time::round_1ms;
use chronolog_core::{
    Configuration, DeviceSchema, Epochstamp, LineStatus, SegmentLine, Timestamp,
    Value,
};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::index_builder::IndexBuilderService;
use crate::layout::ArchiveLayout;
use crate::property_index::PropertyIndexFile;
use crate::registry::PropertyRegistry;
use crate::schema_archive::SchemaArchive;
use crate::segment::{read_line_at, SegmentCounter, SegmentLines};
use crate::segment_index::{find_login_at, find_nearest, read_entries};

/// Time range and point budget of a history request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    /// Start of the range; the Unix epoch when absent
    pub from: Option<Epochstamp>,
    /// End of the range; the current time when absent
    pub to: Option<Epochstamp>,
    /// Upper bound on returned points, 0 for no thinning
    pub max_points: usize,
}

impl HistoryQuery {
    pub fn between(from: Epochstamp, to: Epochstamp) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            max_points: 0,
        }
    }

    /// Builds a query from optional ISO 8601 bounds.
    pub fn from_iso(from: Option<&str>, to: Option<&str>, max_points: usize) -> Result<Self> {
        Ok(Self {
            from: from.map(Epochstamp::from_iso8601).transpose()?,
            to: to.map(Epochstamp::from_iso8601).transpose()?,
            max_points,
        })
    }

    pub fn with_max_points(mut self, max_points: usize) -> Self {
        self.max_points = max_points;
        self
    }
}

/// One value of a property history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPoint {
    pub timestamp: Timestamp,
    pub value: Value,
    /// Last point before the device stopped or restarted logging
    pub is_last: bool,
}

/// Result of [`HistoryReader::config_at`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigAtTimepoint {
    pub configuration: Configuration,
    pub schema: DeviceSchema,
    /// Whether the device was being logged at the requested time
    pub was_online: bool,
    /// Stamp of the latest value applied, the Unix epoch if none was
    pub config_timestamp: Epochstamp,
}

/// Records of a history request located in the property index files.
#[derive(Debug, PartialEq)]
struct IndexRange {
    from_segment: u32,
    to_segment: u32,
    from_record: u64,
    /// Records to read per segment, starting at `from_record` in the first one
    counts: Vec<u64>,
}

impl IndexRange {
    fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

pub struct HistoryReader {
    layout: ArchiveLayout,
    builder: Arc<IndexBuilderService>,
    registries: Mutex<HashMap<String, PropertyRegistry>>,
}

impl HistoryReader {
    pub fn new(layout: ArchiveLayout, builder: Arc<IndexBuilderService>) -> Self {
        Self {
            layout,
            builder,
            registries: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &ArchiveLayout {
        &self.layout
    }

    pub fn builder(&self) -> &Arc<IndexBuilderService> {
        &self.builder
    }

    /// Adds `property` to the device registry. Returns true if it was not listed yet.
    fn register_property(&self, device: &str, property: &str) -> io::Result<bool> {
        let mut registries = self.registries.lock().unwrap_or_else(PoisonError::into_inner);
        let registry = match registries.entry(device.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(PropertyRegistry::new(self.layout.registry(device))),
        };
        registry.register(property)
    }

    /// Values of `property` between the query bounds, in time order.
    #[tracing::instrument(skip(self, query), fields(max_points = query.max_points))]
    pub fn property_history(
        &self,
        device: &str,
        property: &str,
        query: &HistoryQuery,
    ) -> Result<Vec<HistoryPoint>> {
        // Read before registering: once a writer sees the registration it rebuilds what
        // it wrote since its previous check and indexes later segments itself.
        let last_segment = SegmentCounter::read(&self.layout, device)?;

        if self.register_property(device, property)? {
            let mut queued = 0;
            for segment in (0..=last_segment).rev() {
                if self.builder.request_build(device, property, segment) {
                    queued += 1;
                }
            }
            info!(
                device = %device,
                property = %property,
                segments = last_segment + 1,
                queued = queued,
                "Property registered for indexing"
            );
            return Err(Error::NotYetIndexed {
                device: device.to_string(),
                property: property.to_string(),
            });
        }

        let from = query.from.unwrap_or(Epochstamp::UNIX_EPOCH);
        let to = query.to.unwrap_or_else(Epochstamp::now);

        let entries = read_entries(&self.layout, device)?;
        let idx_from = find_nearest(&entries, from, true)
            .ok_or_else(|| Error::BeforeAnyData(from.to_iso8601()))?;
        let idx_to = find_nearest(&entries, to, false).unwrap_or(idx_from);
        let from_segment = idx_from.segment;
        let to_segment = idx_to.segment.max(from_segment);
        debug!(
            device = %device,
            from_segment = from_segment,
            to_segment = to_segment,
            "Segment range located"
        );

        let Some(range) =
            self.locate_records(device, property, from_segment, to_segment, from, to)?
        else {
            return Ok(Vec::new());
        };

        let ndata = range.total();
        let reduction = if query.max_points > 0 {
            ndata.div_ceil(query.max_points as u64)
        } else {
            0
        };
        debug!(ndata = ndata, reduction = reduction, "Reading history records");

        let mut result: Vec<HistoryPoint> = Vec::new();
        let mut running: u64 = 0;
        for (segment, count) in (range.from_segment..=range.to_segment).zip(range.counts.iter().copied()) {
            if count == 0 {
                continue;
            }
            let index_path = self.layout.property_index(device, property, segment);
            let raw_path = self.layout.segment(device, segment);
            let (mut index, raw) = match (PropertyIndexFile::open(&index_path), File::open(&raw_path)) {
                (Ok(index), Ok(raw)) => (index, raw),
                (Err(e), _) => {
                    warn!(path = %index_path.display(), error = %e, "Missing property index");
                    continue;
                }
                (_, Err(e)) => {
                    warn!(path = %raw_path.display(), error = %e, "Missing segment");
                    continue;
                }
            };
            let mut raw = BufReader::new(raw);

            let start = if segment == range.from_segment { range.from_record } else { 0 };
            for record in index.iter_from(start, count)? {
                let record = record?;
                let position = running;
                running += 1;
                if reduction != 0 && position % reduction != 0 && !record.is_first() {
                    continue;
                }

                let Some(text) = read_line_at(&mut raw, record.offset)? else {
                    continue;
                };
                if text.is_empty() {
                    continue;
                }
                let line = match SegmentLine::parse(&text) {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(segment = segment, error = %e, "Skipping unparsable line");
                        continue;
                    }
                };
                if line.is_marker() {
                    if let Some(previous) = result.last_mut() {
                        previous.is_last = true;
                    }
                }
                if line.property != property {
                    warn!(
                        device = %device,
                        property = %property,
                        segment = segment,
                        found = %line.property,
                        "Index record points at another property, skipping"
                    );
                    continue;
                }
                let value = match line.value() {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(segment = segment, error = %e, "Skipping undecodable value");
                        continue;
                    }
                };

                if result.len() == 1 && result[0].timestamp.epoch < from {
                    result.clear();
                }
                result.push(HistoryPoint {
                    timestamp: line.timestamp,
                    value,
                    is_last: false,
                });
            }
        }

        debug!(points = result.len(), "History assembled");
        Ok(result)
    }

    fn open_index(&self, device: &str, property: &str, segment: u32) -> Option<PropertyIndexFile> {
        let path = self.layout.property_index(device, property, segment);
        match PropertyIndexFile::open(&path) {
            Ok(index) => Some(index),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Skipping corrupt property index");
                None
            }
        }
    }

    /// Finds the first record at or after `from` and the last one at or before `to`
    /// over the segment range, with the number of records to read per segment.
    fn locate_records(
        &self,
        device: &str,
        property: &str,
        start: u32,
        end: u32,
        from: Epochstamp,
        to: Epochstamp,
    ) -> Result<Option<IndexRange>> {
        let from = from.to_f64();
        let to = to.to_f64();

        let mut first_hit = None;
        for segment in start..=end {
            let Some(mut index) = self.open_index(device, property, segment) else {
                continue;
            };
            let Some(last) = index.last()? else {
                continue;
            };
            if round_1ms(from) > round_1ms(last.epoch) {
                continue;
            }
            let record = index.find_position(from, 0, index.len() - 1, false)?;
            first_hit = Some((segment, record));
            break;
        }
        let Some((from_segment, from_record)) = first_hit else {
            return Ok(None);
        };

        let mut to_segment = None;
        for segment in (from_segment..=end).rev() {
            let Some(mut index) = self.open_index(device, property, segment) else {
                continue;
            };
            let Some(first) = index.first()? else {
                continue;
            };
            if round_1ms(first.epoch) > round_1ms(to) {
                continue;
            }
            to_segment = Some(segment);
            break;
        }
        let Some(to_segment) = to_segment else {
            return Ok(None);
        };

        let mut counts: Vec<u64> = (from_segment..=to_segment)
            .map(|segment| self.open_index(device, property, segment).map_or(0, |index| index.len()))
            .collect();

        if let Some(last_count) = counts.last_mut() {
            if *last_count > 0 {
                if let Some(mut index) = self.open_index(device, property, to_segment) {
                    let to_record = index.find_position(to, 0, *last_count - 1, true)?;
                    *last_count = to_record + 1;
                }
            }
        }
        if let Some(first_count) = counts.first_mut() {
            *first_count -= from_record.min(*first_count);
        }

        Ok(Some(IndexRange {
            from_segment,
            to_segment,
            from_record,
            counts,
        }))
    }

    /// Configuration of `device` as it was at `timepoint`.
    #[tracing::instrument(skip(self))]
    pub fn config_at(&self, device: &str, timepoint: Epochstamp) -> Result<ConfigAtTimepoint> {
        let (_, schema) = SchemaArchive::new(self.layout.clone()).schema_at(device, timepoint)?;

        let entries = read_entries(&self.layout, device)?;
        let (login, was_online) = find_login_at(&entries, timepoint);
        let login = login.ok_or_else(|| Error::BeforeAnyData(timepoint.to_iso8601()))?;
        let last_segment = SegmentCounter::read(&self.layout, device)?;

        let mut configuration = Configuration::new();
        let mut config_timestamp = Epochstamp::UNIX_EPOCH;
        let mut offset = login.offset;
        'segments: for segment in login.segment..=last_segment {
            let path = self.layout.segment(device, segment);
            let lines = match SegmentLines::open(&path, offset) {
                Ok(lines) => lines,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(segment = segment, "Segment missing, continuing with the next");
                    offset = 0;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            offset = 0;

            for item in lines {
                let (_, text) = item?;
                if text.is_empty() {
                    continue;
                }
                let line = match SegmentLine::parse(&text) {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(segment = segment, error = %e, "Skipping unparsable line");
                        continue;
                    }
                };
                if line.status == LineStatus::Logout {
                    break 'segments;
                }
                if !schema.has(&line.property) {
                    continue;
                }
                if line.timestamp.epoch > timepoint {
                    break 'segments;
                }
                let value = match line.value() {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(segment = segment, property = %line.property, error = %e, "Skipping undecodable value");
                        continue;
                    }
                };
                if line.timestamp.epoch > config_timestamp {
                    config_timestamp = line.timestamp.epoch;
                }
                configuration.set(line.property, value, line.timestamp);
            }
        }

        debug!(
            properties = configuration.len(),
            was_online = was_online,
            "Configuration reconstructed"
        );
        Ok(ConfigAtTimepoint {
            configuration,
            schema,
            was_online,
            config_timestamp,
        })
    }
}
