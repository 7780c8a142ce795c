//! Schema Archive (`archive_schema.txt`)
//!
//! Append-only history of a device's schema. Entries are written in arrival order,
//! which follows device time only as long as device clocks do, so lookups scan the
//! whole file.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};

use chronolog_core::{DeviceSchema, Epochstamp, SchemaArchiveEntry, Timestamp};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::layout::ArchiveLayout;

/// Reader and writer of the per-device schema history.
#[derive(Debug, Clone)]
pub struct SchemaArchive {
    layout: ArchiveLayout,
}

impl SchemaArchive {
    pub fn new(layout: ArchiveLayout) -> Self {
        Self { layout }
    }

    pub fn append(&self, device: &str, timestamp: Timestamp, schema: &DeviceSchema) -> Result<()> {
        let entry = SchemaArchiveEntry::new(timestamp, schema.to_archive_string()?);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.schema_archive(device))?;
        writeln!(file, "{}", entry.format())?;
        debug!(device = %device, class_id = %schema.class_id, "Schema archived");
        Ok(())
    }

    /// Schema valid at `target`: the latest entry stamped at or before it, with its
    /// timestamp. Of entries with equal timestamps the one written last wins.
    pub fn schema_at(&self, device: &str, target: Epochstamp) -> Result<(Timestamp, DeviceSchema)> {
        let path = self.layout.schema_archive(device);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::MissingArchive {
                    device: device.to_string(),
                    path: path.display().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut found: Option<SchemaArchiveEntry> = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = match SchemaArchiveEntry::parse(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(device = %device, error = %e, "Skipping malformed schema archive line");
                    continue;
                }
            };
            if entry.timestamp.epoch > target {
                continue;
            }
            if found
                .as_ref()
                .map_or(true, |best| entry.timestamp.epoch >= best.timestamp.epoch)
            {
                found = Some(entry);
            }
        }

        let entry = found.ok_or_else(|| Error::NoSchema {
            device: device.to_string(),
            timepoint: target.to_iso8601(),
        })?;
        let schema = DeviceSchema::from_archive_str(&entry.serialized)?;
        Ok((entry.timestamp, schema))
    }
}
