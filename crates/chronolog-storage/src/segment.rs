//! Segment Store
//!
//! A segment is an append-only text file holding one [`SegmentLine`] per line. Each
//! device writes to exactly one segment at a time; when it grows past the configured
//! size the writer closes it and the counter in `archive.last` moves on to the next
//! number.
//!
//! ## Components
//!
//! - [`SegmentCounter`]: the persisted number of the segment currently written to.
//!   When `archive.last` is missing the raw directory is listed once and the result
//!   recorded, so a device start never checks file by file.
//! - [`SegmentFile`]: buffered append handle that knows the byte offset of every line
//!   it writes.
//! - [`SegmentLines`]: forward scanner yielding `(offset, line)` pairs, used by the
//!   history reader and the index builder.
//!
//! [`SegmentLine`]: chronolog_core::SegmentLine

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::layout::ArchiveLayout;

/// Sorted numbers of all segment files present for a device.
pub fn list_segments(layout: &ArchiveLayout, device: &str) -> io::Result<Vec<u32>> {
    let mut segments = Vec::new();
    let entries = match fs::read_dir(layout.raw_dir(device)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(segments),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if let Some(n) = entry
            .file_name()
            .to_str()
            .and_then(ArchiveLayout::parse_segment_name)
        {
            segments.push(n);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

fn read_counter(path: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Persisted number of the current segment (`archive.last`).
#[derive(Debug)]
pub struct SegmentCounter {
    path: PathBuf,
    current: u32,
}

impl SegmentCounter {
    /// Loads the counter, determining and recording it first if it was never written.
    pub fn load(layout: &ArchiveLayout, device: &str) -> Result<Self> {
        let path = layout.last_segment(device);
        let current = match read_counter(&path)? {
            Some(n) => n,
            None => {
                let n = list_segments(layout, device)?.last().copied().unwrap_or(0);
                debug!(device = %device, segment = n, "Recording last segment number");
                fs::write(&path, format!("{}\n", n))?;
                n
            }
        };
        Ok(Self { path, current })
    }

    /// Reads the counter without creating it.
    pub fn read(layout: &ArchiveLayout, device: &str) -> Result<u32> {
        let path = layout.last_segment(device);
        read_counter(&path)?.ok_or_else(|| Error::MissingArchive {
            device: device.to_string(),
            path: path.display().to_string(),
        })
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Moves to the next segment number and persists it.
    pub fn advance(&mut self) -> Result<u32> {
        let next = self.current + 1;
        fs::write(&self.path, format!("{}\n", next))?;
        self.current = next;
        Ok(next)
    }
}

/// Append handle on one segment file.
#[derive(Debug)]
pub struct SegmentFile {
    segment: u32,
    writer: BufWriter<File>,
    position: u64,
    fresh: bool,
}

impl SegmentFile {
    /// Opens for appending and makes sure existing content ends with a newline.
    pub fn open(path: &Path, segment: u32) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        let mut position = file.metadata()?.len();
        let fresh = position == 0;
        if !fresh {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(position - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                warn!(path = %path.display(), "Segment ends with a partial line, terminating it");
                file.write_all(b"\n")?;
                position += 1;
            }
        }
        Ok(Self {
            segment,
            writer: BufWriter::new(file),
            position,
            fresh,
        })
    }

    pub fn segment(&self) -> u32 {
        self.segment
    }

    /// Byte offset where the next line will start; equals the file size once flushed.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// True when the file was empty at open time.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Appends one line and returns the offset it starts at.
    pub fn append_line(&mut self, line: &str) -> io::Result<u64> {
        let offset = self.position;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.position += line.len() as u64 + 1;
        Ok(offset)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Reads the line starting at `offset`, without its newline. `None` past the end.
pub fn read_line_at(reader: &mut BufReader<File>, offset: u64) -> io::Result<Option<String>> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end_matches(['\n', '\r']).len();
    line.truncate(trimmed);
    Ok(Some(line))
}

/// Forward scan over the lines of a segment, starting at a byte offset.
pub struct SegmentLines {
    reader: BufReader<File>,
    position: u64,
}

impl SegmentLines {
    pub fn open(path: &Path, start: u64) -> io::Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        reader.seek(SeekFrom::Start(start))?;
        Ok(Self {
            reader,
            position: start,
        })
    }
}

impl Iterator for SegmentLines {
    type Item = io::Result<(u64, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => None,
            Ok(n) => {
                let offset = self.position;
                self.position += n as u64;
                let trimmed = line.trim_end_matches(['\n', '\r']).len();
                line.truncate(trimmed);
                Some(Ok((offset, line)))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
