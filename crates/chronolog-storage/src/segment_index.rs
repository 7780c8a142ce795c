//! Segment Index (`archive_index.txt`)
//!
//! The segment index is a small text sidecar per device listing when logging started
//! (`+LOG`), stopped (`-LOG`) and when a new segment file was begun (`=NEW`), each with
//! the segment number and byte offset where that happened. It gives coarse time to
//! segment navigation for history queries and is the only recovery information needed
//! to reconstruct a configuration: find the session start, then read forward.
//!
//! ```text
//! +LOG 19700101T000140.000000Z 100.000000 0 0 operator 0
//! =NEW 19700101T001000.000000Z 600.000000 0 0 operator 1
//! -LOG 19700101T001500.000000Z 900.000000 0 2048 operator 1
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};

use chronolog_core::{Epochstamp, IndexEvent, LineStatus, SegmentIndexEntry, SegmentLine};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::layout::ArchiveLayout;
use crate::segment::{list_segments, SegmentLines};

/// Appends one entry to the device's segment index.
pub fn append_entry(layout: &ArchiveLayout, device: &str, entry: &SegmentIndexEntry) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(layout.segment_index(device))?;
    writeln!(file, "{}", entry.format())?;
    debug!(
        device = %device,
        event = %entry.event,
        segment = entry.segment,
        offset = entry.offset,
        "Segment index entry written"
    );
    Ok(())
}

/// All parseable entries in file order; malformed lines are logged and skipped.
pub fn read_entries(layout: &ArchiveLayout, device: &str) -> Result<Vec<SegmentIndexEntry>> {
    let path = layout.segment_index(device);
    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(device = %device, "No segment index");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match SegmentIndexEntry::parse(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => error!(
                path = %path.display(),
                line = number + 1,
                error = %e,
                "Skipping malformed segment index line"
            ),
        }
    }
    Ok(entries)
}

/// Entry nearest to `target`.
///
/// With `before` the last entry at or before `target` is returned, or the very first
/// entry when all are later. Without `before` the first entry after `target` is
/// returned, or the last entry when none is later.
pub fn find_nearest(
    entries: &[SegmentIndexEntry],
    target: Epochstamp,
    before: bool,
) -> Option<&SegmentIndexEntry> {
    let mut nearest: Option<&SegmentIndexEntry> = None;
    let mut got_after = false;
    for entry in entries {
        let stamp = entry.timestamp.epoch;
        let at_or_before = stamp <= target;
        if at_or_before || nearest.is_none() || (!before && !got_after) {
            if !at_or_before {
                got_after = true;
            }
            nearest = Some(entry);
        }
        if !at_or_before && (before || got_after) {
            break;
        }
    }
    nearest
}

/// Session containing `target`: the last `+LOG` at or before it, and whether the
/// device was still logged at that time (no later `-LOG` up to `target`).
pub fn find_login_at(
    entries: &[SegmentIndexEntry],
    target: Epochstamp,
) -> (Option<&SegmentIndexEntry>, bool) {
    let mut login: Option<&SegmentIndexEntry> = None;
    let mut logout: Option<Epochstamp> = None;
    for entry in entries {
        if entry.timestamp.epoch > target {
            break;
        }
        match entry.event {
            IndexEvent::Login => login = Some(entry),
            IndexEvent::Logout => logout = Some(entry.timestamp.epoch),
            IndexEvent::NewFile => {}
        }
    }
    let online = match (login, logout) {
        (Some(_), None) => true,
        (Some(login), Some(logout)) => logout < login.timestamp.epoch,
        (None, _) => false,
    };
    (login, online)
}

/// Recreates `archive_index.txt` from the segment files.
///
/// LOGIN lines become `+LOG`, LOGOUT lines `-LOG` and the first line of any segment
/// that does not start a session becomes `=NEW`. Returns the number of entries.
pub fn rebuild_segment_index(layout: &ArchiveLayout, device: &str) -> Result<usize> {
    let mut out = String::new();
    let mut count = 0;
    for segment in list_segments(layout, device)? {
        let mut first = true;
        for item in SegmentLines::open(&layout.segment(device, segment), 0)? {
            let (offset, text) = item?;
            let line = match SegmentLine::parse(&text) {
                Ok(line) => line,
                Err(e) => {
                    debug!(device = %device, segment = segment, error = %e, "Skipping line");
                    continue;
                }
            };
            let event = match line.status {
                LineStatus::Login => Some(IndexEvent::Login),
                LineStatus::Logout => Some(IndexEvent::Logout),
                LineStatus::Valid if first => Some(IndexEvent::NewFile),
                LineStatus::Valid => None,
            };
            first = false;
            if let Some(event) = event {
                let entry =
                    SegmentIndexEntry::new(event, line.timestamp, offset, &line.user, segment);
                out.push_str(&entry.format());
                out.push('\n');
                count += 1;
            }
        }
    }

    let path = layout.segment_index(device);
    let tmp = path.with_extension("txt.tmp");
    fs::write(&tmp, out)?;
    fs::rename(&tmp, &path)?;
    info!(device = %device, entries = count, "Rebuilt segment index");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronolog_core::{Timestamp, Value};
    use tempfile::TempDir;

    fn entry(event: IndexEvent, secs: f64, segment: u32) -> SegmentIndexEntry {
        SegmentIndexEntry::new(event, Timestamp::from_secs(secs), 0, "op", segment)
    }

    fn at(secs: f64) -> Epochstamp {
        Epochstamp::from_f64(secs)
    }

    fn sample() -> Vec<SegmentIndexEntry> {
        vec![
            entry(IndexEvent::Login, 100.0, 0),
            entry(IndexEvent::NewFile, 200.0, 1),
            entry(IndexEvent::Logout, 300.0, 1),
            entry(IndexEvent::Login, 400.0, 2),
        ]
    }

    #[test]
    fn test_find_nearest_before() {
        let entries = sample();
        assert_eq!(find_nearest(&entries, at(250.0), true).unwrap().segment, 1);
        assert_eq!(find_nearest(&entries, at(200.0), true).unwrap().timestamp.epoch, at(200.0));
        // Earlier than everything: the first entry is still taken.
        assert_eq!(find_nearest(&entries, at(10.0), true).unwrap().timestamp.epoch, at(100.0));
        assert!(find_nearest(&[], at(10.0), true).is_none());
    }

    #[test]
    fn test_find_nearest_after() {
        let entries = sample();
        assert_eq!(find_nearest(&entries, at(250.0), false).unwrap().timestamp.epoch, at(300.0));
        assert_eq!(find_nearest(&entries, at(10.0), false).unwrap().timestamp.epoch, at(100.0));
        // Later than everything: the last entry.
        assert_eq!(find_nearest(&entries, at(1000.0), false).unwrap().segment, 2);
    }

    #[test]
    fn test_find_login_at() {
        let entries = sample();
        let (login, online) = find_login_at(&entries, at(250.0));
        assert_eq!(login.unwrap().timestamp.epoch, at(100.0));
        assert!(online);

        let (login, online) = find_login_at(&entries, at(350.0));
        assert_eq!(login.unwrap().timestamp.epoch, at(100.0));
        assert!(!online);

        let (login, online) = find_login_at(&entries, at(450.0));
        assert_eq!(login.unwrap().segment, 2);
        assert!(online);

        let (login, online) = find_login_at(&entries, at(50.0));
        assert!(login.is_none());
        assert!(!online);
    }

    #[test]
    fn test_append_and_read_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        layout.create_device_dirs("dev").unwrap();

        append_entry(&layout, "dev", &entry(IndexEvent::Login, 100.0, 0)).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(layout.segment_index("dev"))
            .unwrap();
        writeln!(file, "not an index line").unwrap();
        append_entry(&layout, "dev", &entry(IndexEvent::Logout, 200.0, 0)).unwrap();

        let entries = read_entries(&layout, "dev").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].event, IndexEvent::Logout);
        assert!(read_entries(&layout, "other").unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_from_segments() {
        let dir = TempDir::new().unwrap();
        let layout = ArchiveLayout::new(dir.path());
        layout.create_device_dirs("dev").unwrap();

        let update = |secs: f64, status| {
            SegmentLine::update(Timestamp::from_secs(secs), "x", &Value::Int32(1), "op", status)
                .unwrap()
                .format()
        };
        let seg0 = format!(
            "{}\n{}\n",
            update(100.0, LineStatus::Login),
            update(110.0, LineStatus::Valid)
        );
        let seg1 = format!(
            "{}\n{}\n",
            update(120.0, LineStatus::Valid),
            SegmentLine::logout(Timestamp::from_secs(120.0), "op").format()
        );
        fs::write(layout.segment("dev", 0), &seg0).unwrap();
        fs::write(layout.segment("dev", 1), &seg1).unwrap();

        assert_eq!(rebuild_segment_index(&layout, "dev").unwrap(), 3);
        let entries = read_entries(&layout, "dev").unwrap();
        let events: Vec<_> = entries.iter().map(|e| (e.event, e.segment)).collect();
        assert_eq!(
            events,
            vec![
                (IndexEvent::Login, 0),
                (IndexEvent::NewFile, 1),
                (IndexEvent::Logout, 1)
            ]
        );
        assert_eq!(entries[2].offset, seg1.find("\n").unwrap() as u64 + 1);
    }
}
