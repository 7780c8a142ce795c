//! Property Index
//!
//! One binary file per (device, property, segment) holding a time-sorted array of
//! [`PropertyIndexRecord`]s, each pointing at the byte offset of a line in the raw
//! segment. History queries binary-search these files instead of scanning segments.
//!
//! ## Lifecycle
//!
//! 1. A property is requested for the first time: the history reader registers it and
//!    the index builder derives the file for every past segment with
//!    [`build_property_index`].
//! 2. From then on the archive writer appends one record per written line through a
//!    [`PropertyIndexWriter`].
//! 3. Readers open a [`PropertyIndexFile`] and use [`PropertyIndexFile::find_position`].
//!
//! ## Search
//!
//! ```text
//! left ──────────────── mid ──────────────── right     halve while ≥128 records
//!                  left ── ... ── right                 then scan the window linearly
//! ```
//!
//! Timestamps are compared at millisecond resolution. An exact match always wins;
//! otherwise the first record later than the target is returned, or the one just
//! before it when `prefer_before` is set.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chronolog_core::time::round_1ms;
use chronolog_core::{LineStatus, PropertyIndexRecord, SegmentLine};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::layout::ArchiveLayout;
use crate::segment::SegmentLines;

const RECORD_SIZE: u64 = PropertyIndexRecord::SIZE as u64;
const LINEAR_WINDOW: u64 = 128;

/// Incremental append handle used by the archive writer.
#[derive(Debug)]
pub struct PropertyIndexWriter {
    writer: BufWriter<File>,
}

impl PropertyIndexWriter {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, record: &PropertyIndexRecord) -> io::Result<()> {
        self.writer.write_all(&record.to_bytes())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

fn corrupt(path: &Path, size: u64) -> Error {
    Error::Core(chronolog_core::Error::InvalidRecord(format!(
        "index file {} has size {} which is not a multiple of {}",
        path.display(),
        size,
        RECORD_SIZE
    )))
}

/// Read handle on a property index file.
#[derive(Debug)]
pub struct PropertyIndexFile {
    path: PathBuf,
    file: File,
    records: u64,
}

impl PropertyIndexFile {
    /// Opens an index file, rejecting files whose size is not a whole number of records.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size % RECORD_SIZE != 0 {
            return Err(corrupt(path, size));
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            records: size / RECORD_SIZE,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn read(&mut self, index: u64) -> Result<PropertyIndexRecord> {
        let mut buf = [0u8; PropertyIndexRecord::SIZE];
        self.file.seek(SeekFrom::Start(index * RECORD_SIZE))?;
        self.file.read_exact(&mut buf)?;
        Ok(PropertyIndexRecord::decode(&buf)?)
    }

    pub fn first(&mut self) -> Result<Option<PropertyIndexRecord>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.read(0).map(Some)
    }

    pub fn last(&mut self) -> Result<Option<PropertyIndexRecord>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.read(self.records - 1).map(Some)
    }

    /// Reads `count` consecutive records starting at `start`.
    pub fn read_range(&mut self, start: u64, count: u64) -> Result<Vec<PropertyIndexRecord>> {
        let mut buf = vec![0u8; (count * RECORD_SIZE) as usize];
        self.file.seek(SeekFrom::Start(start * RECORD_SIZE))?;
        self.file.read_exact(&mut buf)?;
        buf.chunks_exact(PropertyIndexRecord::SIZE)
            .map(|chunk| PropertyIndexRecord::decode(chunk).map_err(Error::from))
            .collect()
    }

    /// Streams `count` records starting at `start`.
    pub fn iter_from(&mut self, start: u64, count: u64) -> Result<RecordIter<'_>> {
        self.file.seek(SeekFrom::Start(start * RECORD_SIZE))?;
        Ok(RecordIter {
            reader: BufReader::new(&self.file),
            remaining: count.min(self.records.saturating_sub(start)),
        })
    }

    /// Position of the record closest to `t` within `[left, right]`.
    pub fn find_position(
        &mut self,
        t: f64,
        mut left: u64,
        mut right: u64,
        prefer_before: bool,
    ) -> Result<u64> {
        let rounded = round_1ms(t);
        while right - left >= LINEAR_WINDOW {
            let mid = left + (right - left) / 2;
            let epoch = self.read(mid)?.epoch;
            if round_1ms(epoch) == rounded {
                return Ok(mid);
            } else if t < epoch {
                right = mid;
            } else {
                left = mid;
            }
        }

        let window = self.read_range(left, right - left + 1)?;
        for (i, record) in window.iter().enumerate() {
            let i = i as u64;
            if round_1ms(record.epoch) == rounded {
                return Ok(left + i);
            } else if record.epoch > t {
                if prefer_before && i != 0 {
                    return Ok(left + i - 1);
                }
                return Ok(left + i);
            }
        }
        Ok(right)
    }
}

pub struct RecordIter<'a> {
    reader: BufReader<&'a File>,
    remaining: u64,
}

impl Iterator for RecordIter<'_> {
    type Item = Result<PropertyIndexRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut buf = [0u8; PropertyIndexRecord::SIZE];
        if let Err(e) = self.reader.read_exact(&mut buf) {
            self.remaining = 0;
            return Some(Err(e.into()));
        }
        Some(PropertyIndexRecord::decode(&buf).map_err(Error::from))
    }
}

/// Derives the property index of one segment from scratch.
///
/// Every line of `property` yields one record. The first-in-file flag is set on the
/// first record of the file and on the first record after each LOGIN or LOGOUT
/// line. The result is written to a temporary file and renamed into place, so
/// readers never see a partial index and reruns produce identical bytes.
pub fn build_property_index(
    layout: &ArchiveLayout,
    device: &str,
    property: &str,
    segment: u32,
) -> Result<usize> {
    let raw = layout.segment(device, segment);
    if !raw.exists() {
        return Err(Error::MissingArchive {
            device: device.to_string(),
            path: raw.display().to_string(),
        });
    }

    let mut out = Vec::new();
    let mut first = true;
    let mut count = 0;
    for item in SegmentLines::open(&raw, 0)? {
        let (offset, text) = item?;
        if text.is_empty() {
            continue;
        }
        let line = match SegmentLine::parse(&text) {
            Ok(line) => line,
            Err(e) => {
                debug!(device = %device, segment = segment, error = %e, "Skipping unparsable line");
                continue;
            }
        };
        if line.is_marker() {
            first = true;
            if line.status == LineStatus::Logout {
                continue;
            }
        }
        if line.property != property {
            continue;
        }
        PropertyIndexRecord::new(&line.timestamp, offset, first).encode(&mut out);
        first = false;
        count += 1;
    }

    fs::create_dir_all(layout.idx_dir(device))?;
    let path = layout.property_index(device, property, segment);
    let tmp = path.with_extension("bin.tmp");
    fs::write(&tmp, &out)?;
    fs::rename(&tmp, &path)?;

    info!(
        device = %device,
        property = %property,
        segment = segment,
        records = count,
        "Built property index"
    );
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronolog_core::{Timestamp, Value};
    use tempfile::TempDir;

    fn write_index(path: &Path, epochs: &[f64]) {
        let mut writer = PropertyIndexWriter::open(path).unwrap();
        for (i, epoch) in epochs.iter().enumerate() {
            let record = PropertyIndexRecord::new(&Timestamp::from_secs(*epoch), i as u64 * 10, i == 0);
            writer.append(&record).unwrap();
        }
        writer.flush().unwrap();
    }

    /// Closest record honoring the tie-break, computed by brute force.
    fn expected_position(epochs: &[f64], t: f64, prefer_before: bool) -> u64 {
        let rounded = round_1ms(t);
        for (i, epoch) in epochs.iter().enumerate() {
            if round_1ms(*epoch) == rounded {
                return i as u64;
            }
            if *epoch > t {
                return if prefer_before && i != 0 { i as u64 - 1 } else { i as u64 };
            }
        }
        epochs.len() as u64 - 1
    }

    #[test]
    fn test_find_position_small_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.bin");
        let epochs = [100.0, 200.0, 300.0];
        write_index(&path, &epochs);

        let mut index = PropertyIndexFile::open(&path).unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.find_position(200.0, 0, 2, false).unwrap(), 1);
        assert_eq!(index.find_position(200.0004, 0, 2, true).unwrap(), 1);
        assert_eq!(index.find_position(150.0, 0, 2, false).unwrap(), 1);
        assert_eq!(index.find_position(150.0, 0, 2, true).unwrap(), 0);
        assert_eq!(index.find_position(50.0, 0, 2, true).unwrap(), 0);
        assert_eq!(index.find_position(500.0, 0, 2, false).unwrap(), 2);
    }

    #[test]
    fn test_find_position_matches_brute_force_on_large_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("large.bin");
        let epochs: Vec<f64> = (0..1000).map(|i| 1000.0 + i as f64 * 0.5).collect();
        write_index(&path, &epochs);

        let mut index = PropertyIndexFile::open(&path).unwrap();
        let last = index.len() - 1;
        for target in [999.0, 1000.0, 1000.25, 1100.1, 1250.0, 1333.3, 1499.5, 1600.0] {
            for prefer_before in [false, true] {
                assert_eq!(
                    index.find_position(target, 0, last, prefer_before).unwrap(),
                    expected_position(&epochs, target, prefer_before),
                    "target {} prefer_before {}",
                    target,
                    prefer_before
                );
            }
        }
    }

    #[test]
    fn test_corrupt_size_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("corrupt.bin");
        fs::write(&path, [0u8; 40]).unwrap();
        assert!(PropertyIndexFile::open(&path).is_err());
    }

    #[test]
    fn test_iter_from() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("iter.bin");
        write_index(&path, &[1.0, 2.0, 3.0, 4.0]);
        let mut index = PropertyIndexFile::open(&path).unwrap();
        let epochs: Vec<f64> = index
            .iter_from(1, 10)
            .unwrap()
            .map(|r| r.unwrap().epoch)
            .collect();
        assert_eq!(epochs, vec![2.0, 3.0, 4.0]);
        assert_eq!(index.first().unwrap().unwrap().epoch, 1.0);
        assert_eq!(index.last().unwrap().unwrap().epoch, 4.0);
    }

    fn segment_fixture(layout: &ArchiveLayout) -> String {
        let line = |secs: f64, prop: &str, status| {
            SegmentLine::update(Timestamp::from_secs(secs), prop, &Value::Double(secs), "op", status)
                .unwrap()
                .format()
        };
        let content = [
            line(100.0, "temp", LineStatus::Login),
            line(101.0, "other", LineStatus::Valid),
            line(102.0, "temp", LineStatus::Valid),
            SegmentLine::logout(Timestamp::from_secs(102.0), "op").format(),
            line(200.0, "other", LineStatus::Login),
            line(201.0, "temp", LineStatus::Valid),
            "garbage line".to_string(),
        ]
        .join("\n")
            + "\n";
        layout.create_device_dirs("dev").unwrap();
        fs::write(layout.segment("dev", 0), &content).unwrap();
        content
    }

    #[test]
    fn test_build_points_at_property_lines() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        let content = segment_fixture(&layout);

        assert_eq!(build_property_index(&layout, "dev", "temp", 0).unwrap(), 3);
        let mut index = PropertyIndexFile::open(&layout.property_index("dev", "temp", 0)).unwrap();
        let records = index.read_range(0, 3).unwrap();
        let flags: Vec<bool> = records.iter().map(|r| r.is_first()).collect();
        assert_eq!(flags, vec![true, false, true]);

        for record in records {
            let text = content[record.offset as usize..].lines().next().unwrap();
            let line = SegmentLine::parse(text).unwrap();
            assert_eq!(line.property, "temp");
            assert!((line.timestamp.epoch.to_f64() - record.epoch).abs() < 0.001);
        }
    }

    #[test]
    fn test_rebuild_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        segment_fixture(&layout);
        let path = layout.property_index("dev", "temp", 0);

        build_property_index(&layout, "dev", "temp", 0).unwrap();
        let first = fs::read(&path).unwrap();
        build_property_index(&layout, "dev", "temp", 0).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn test_build_missing_segment_fails() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        assert!(matches!(
            build_property_index(&layout, "dev", "temp", 7),
            Err(Error::MissingArchive { .. })
        ));
    }
}
