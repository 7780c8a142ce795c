//! Archive Line and Record Formats
//!
//! All archive files of a device are either newline-delimited text or, for property
//! indexes, a flat array of fixed-size binary records. This module owns the exact
//! byte layout of each so that the writer, the reader and the offline index builder
//! cannot disagree.
//!
//! ## Segment line
//!
//! ```text
//! iso|epochFixed|sequenceId|propertyPath|typeTag|valueText|user|STATUS      STATUS = VALID | LOGIN
//! iso|epochFixed|sequenceId|.||nowIso|user|LOGOUT
//! ```
//!
//! The value field may itself contain `|`, so a line is split five fields from the
//! left and two from the right; whatever remains in the middle is the value.
//!
//! ## Segment index line (`archive_index.txt`)
//!
//! ```text
//! +LOG 20191108T034000.000000Z 1573184400.000000 42 1024 operator 3
//! ```
//!
//! ## Schema archive line (`archive_schema.txt`)
//!
//! ```text
//! 1573184400 0 42 {"class_id":"Motor",...}
//! ```
//!
//! ## Property index record (32 bytes, little endian)
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬─────────┬─────────┐
//! │ epoch f64  │ seqId u64  │ offset u64 │ ext1 u32│ ext2 u32│
//! └────────────┴────────────┴────────────┴─────────┴─────────┘
//! ```
//!
//! Only the low 24 bits of the extent words carry data. Bit 30 of `ext2` marks the
//! first record written after a segment start or a login/logout, i.e. a point that
//! down-sampling must never drop.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::time::{Epochstamp, Timestamp};
use crate::value::{decode_value, encode_value, Value};

/// Property field of logout marker lines.
pub const MARKER_PROPERTY: &str = ".";

/// User written when none is known.
pub const UNKNOWN_USER: &str = ".";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineStatus {
    Valid,
    Login,
    Logout,
}

impl LineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineStatus::Valid => "VALID",
            LineStatus::Login => "LOGIN",
            LineStatus::Logout => "LOGOUT",
        }
    }
}

impl FromStr for LineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "VALID" => Ok(LineStatus::Valid),
            "LOGIN" => Ok(LineStatus::Login),
            "LOGOUT" => Ok(LineStatus::Logout),
            other => Err(Error::InvalidLine(format!("unknown status '{}'", other))),
        }
    }
}

/// One line of a segment file.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentLine {
    pub timestamp: Timestamp,
    pub property: String,
    /// Empty for logout markers.
    pub type_tag: String,
    pub value_text: String,
    pub user: String,
    pub status: LineStatus,
}

fn is_iso_field(field: &str) -> bool {
    !field.is_empty()
        && field
            .bytes()
            .all(|b| b.is_ascii_digit() || b == b'T' || b == b'Z' || b == b'.')
}

fn is_type_tag(field: &str) -> bool {
    let mut bytes = field.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_uppercase())
        && bytes.all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

fn user_field(user: &str) -> String {
    if user.is_empty() {
        UNKNOWN_USER.to_string()
    } else {
        user.to_string()
    }
}

impl SegmentLine {
    /// Property update line carrying `value` encoded as text.
    pub fn update(
        timestamp: Timestamp,
        property: &str,
        value: &Value,
        user: &str,
        status: LineStatus,
    ) -> Result<Self> {
        Ok(Self {
            timestamp,
            property: property.to_string(),
            type_tag: value.value_type().as_str().to_string(),
            value_text: encode_value(value)?,
            user: user_field(user),
            status,
        })
    }

    /// Logout marker stamped with the device time; the value field records wall-clock time.
    pub fn logout(timestamp: Timestamp, user: &str) -> Self {
        Self {
            timestamp,
            property: MARKER_PROPERTY.to_string(),
            type_tag: String::new(),
            value_text: Epochstamp::now().to_iso8601(),
            user: user_field(user),
            status: LineStatus::Logout,
        }
    }

    /// Whether this line starts or ends a logging session.
    pub fn is_marker(&self) -> bool {
        self.status != LineStatus::Valid
    }

    pub fn value(&self) -> Result<Value> {
        decode_value(&self.type_tag, &self.value_text)
    }

    /// Text of the line without the trailing newline.
    pub fn format(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.timestamp.epoch.to_iso8601(),
            self.timestamp.epoch.to_fixed_string(),
            self.timestamp.sequence_id,
            self.property,
            self.type_tag,
            self.value_text,
            self.user,
            self.status.as_str()
        )
    }

    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let invalid = |why: &str| Error::InvalidLine(format!("{}: '{}'", why, line));

        let mut left = line.splitn(6, '|');
        let (iso, epoch, sequence, property, type_tag, rest) = match (
            left.next(),
            left.next(),
            left.next(),
            left.next(),
            left.next(),
            left.next(),
        ) {
            (Some(a), Some(b), Some(c), Some(d), Some(e), Some(f)) => (a, b, c, d, e, f),
            _ => return Err(invalid("too few fields")),
        };
        let mut right = rest.rsplitn(3, '|');
        let (status, user, value_text) = match (right.next(), right.next(), right.next()) {
            (Some(s), Some(u), Some(v)) => (s, u, v),
            _ => return Err(invalid("too few fields")),
        };

        if !is_iso_field(iso) {
            return Err(invalid("bad iso timestamp"));
        }
        let epoch = Epochstamp::from_decimal_str(epoch).map_err(|_| invalid("bad epoch"))?;
        let sequence_id: u64 = sequence.parse().map_err(|_| invalid("bad sequence id"))?;
        let status: LineStatus = status.parse().map_err(|_| invalid("bad status"))?;
        match status {
            LineStatus::Logout if property != MARKER_PROPERTY => {
                return Err(invalid("logout marker with property"))
            }
            LineStatus::Valid | LineStatus::Login
                if property.is_empty() || !is_type_tag(type_tag) =>
            {
                return Err(invalid("bad property or type"))
            }
            _ => {}
        }

        Ok(Self {
            timestamp: Timestamp::new(epoch, sequence_id),
            property: property.to_string(),
            type_tag: type_tag.to_string(),
            value_text: value_text.to_string(),
            user: user.to_string(),
            status,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexEvent {
    /// `+LOG`: logging of the device started.
    Login,
    /// `-LOG`: logging of the device stopped.
    Logout,
    /// `=NEW`: a new segment was started while logging.
    NewFile,
}

impl IndexEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexEvent::Login => "+LOG",
            IndexEvent::Logout => "-LOG",
            IndexEvent::NewFile => "=NEW",
        }
    }
}

impl fmt::Display for IndexEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "+LOG" => Ok(IndexEvent::Login),
            "-LOG" => Ok(IndexEvent::Logout),
            "=NEW" => Ok(IndexEvent::NewFile),
            other => Err(Error::InvalidLine(format!("unknown index event '{}'", other))),
        }
    }
}

/// One line of `archive_index.txt`.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentIndexEntry {
    pub event: IndexEvent,
    pub timestamp: Timestamp,
    /// Byte offset into the segment.
    pub offset: u64,
    pub user: String,
    pub segment: u32,
}

impl SegmentIndexEntry {
    pub fn new(
        event: IndexEvent,
        timestamp: Timestamp,
        offset: u64,
        user: &str,
        segment: u32,
    ) -> Self {
        Self {
            event,
            timestamp,
            offset,
            user: user_field(user),
            segment,
        }
    }

    pub fn format(&self) -> String {
        format!(
            "{} {} {} {} {} {} {}",
            self.event,
            self.timestamp.epoch.to_iso8601(),
            self.timestamp.epoch.to_fixed_string(),
            self.timestamp.sequence_id,
            self.offset,
            user_field(&self.user),
            self.segment
        )
    }

    pub fn parse(line: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidLine(format!("{}: '{}'", why, line.trim_end()));
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            return Err(invalid("expected 7 fields"));
        }
        let event: IndexEvent = fields[0].parse()?;
        if !is_iso_field(fields[1]) {
            return Err(invalid("bad iso timestamp"));
        }
        let epoch = Epochstamp::from_decimal_str(fields[2]).map_err(|_| invalid("bad epoch"))?;
        let sequence_id = fields[3].parse().map_err(|_| invalid("bad sequence id"))?;
        let offset = fields[4].parse().map_err(|_| invalid("bad offset"))?;
        let segment = fields[6].parse().map_err(|_| invalid("bad segment"))?;
        Ok(Self {
            event,
            timestamp: Timestamp::new(epoch, sequence_id),
            offset,
            user: fields[5].to_string(),
            segment,
        })
    }
}

/// One line of `archive_schema.txt`: a serialized schema and the time it became valid.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaArchiveEntry {
    pub timestamp: Timestamp,
    pub serialized: String,
}

fn next_token(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    match text.find(char::is_whitespace) {
        Some(end) => Some((&text[..end], &text[end..])),
        None => Some((text, "")),
    }
}

impl SchemaArchiveEntry {
    pub fn new(timestamp: Timestamp, serialized: String) -> Self {
        Self {
            timestamp,
            serialized,
        }
    }

    pub fn format(&self) -> String {
        format!(
            "{} {} {} {}",
            self.timestamp.epoch.seconds,
            self.timestamp.epoch.fractional,
            self.timestamp.sequence_id,
            self.serialized
        )
    }

    pub fn parse(line: &str) -> Result<Self> {
        let invalid = || Error::InvalidLine(format!("bad schema archive line: '{}'", line.trim_end()));
        let (seconds, rest) = next_token(line).ok_or_else(invalid)?;
        let (fractional, rest) = next_token(rest).ok_or_else(invalid)?;
        let (sequence, rest) = next_token(rest).ok_or_else(invalid)?;
        let seconds: u64 = seconds.parse().map_err(|_| invalid())?;
        let fractional: u64 = fractional.parse().map_err(|_| invalid())?;
        let sequence_id: u64 = sequence.parse().map_err(|_| invalid())?;
        let serialized = rest.trim();
        if serialized.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            timestamp: Timestamp::new(Epochstamp::new(seconds, fractional), sequence_id),
            serialized: serialized.to_string(),
        })
    }
}

/// Fixed-size entry of a property index file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyIndexRecord {
    pub epoch: f64,
    pub sequence_id: u64,
    pub offset: u64,
    extent1: u32,
    extent2: u32,
}

impl PropertyIndexRecord {
    pub const SIZE: usize = 32;

    const EXTENT_MASK: u32 = 0x00FF_FFFF;
    const FIRST_FLAG: u32 = 1 << 30;
    const FILLER_EXTENT1: u32 = 0x0A1A2A;
    const FILLER_EXTENT2: u32 = 0x0B1B2B;

    pub fn new(timestamp: &Timestamp, offset: u64, first: bool) -> Self {
        let mut record = Self {
            epoch: timestamp.epoch.to_f64(),
            sequence_id: timestamp.sequence_id,
            offset,
            extent1: Self::FILLER_EXTENT1,
            extent2: Self::FILLER_EXTENT2,
        };
        record.set_first(first);
        record
    }

    pub fn extent1(&self) -> u32 {
        self.extent1 & Self::EXTENT_MASK
    }

    pub fn extent2(&self) -> u32 {
        self.extent2 & Self::EXTENT_MASK
    }

    pub fn set_extents(&mut self, extent1: u32, extent2: u32) {
        self.extent1 = extent1 & Self::EXTENT_MASK;
        self.extent2 = (extent2 & Self::EXTENT_MASK) | (self.extent2 & Self::FIRST_FLAG);
    }

    /// First record after a segment start or a login/logout.
    pub fn is_first(&self) -> bool {
        self.extent2 & Self::FIRST_FLAG != 0
    }

    pub fn set_first(&mut self, first: bool) {
        if first {
            self.extent2 |= Self::FIRST_FLAG;
        } else {
            self.extent2 &= !Self::FIRST_FLAG;
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f64_le(self.epoch);
        buf.put_u64_le(self.sequence_id);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.extent1);
        buf.put_u32_le(self.extent2);
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        self.encode(&mut &mut bytes[..]);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidRecord(format!(
                "expected {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let mut cursor = &bytes[..Self::SIZE];
        Ok(Self {
            epoch: cursor.get_f64_le(),
            sequence_id: cursor.get_u64_le(),
            offset: cursor.get_u64_le(),
            extent1: cursor.get_u32_le(),
            extent2: cursor.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: u64, seq: u64) -> Timestamp {
        Timestamp::new(Epochstamp::new(secs, 250_000_000_000_000_000), seq)
    }

    #[test]
    fn test_update_line_format_and_parse() {
        let line = SegmentLine::update(
            ts(1_573_184_400, 7),
            "motor.position",
            &Value::Double(1.5),
            "bob",
            LineStatus::Login,
        )
        .unwrap();
        let text = line.format();
        assert_eq!(
            text,
            "20191108T034000.250000Z|1573184400.250000|7|motor.position|DOUBLE|1.5|bob|LOGIN"
        );
        let parsed = SegmentLine::parse(&text).unwrap();
        assert_eq!(parsed, line);
        assert_eq!(parsed.value().unwrap(), Value::Double(1.5));
    }

    #[test]
    fn test_value_with_pipes_survives() {
        let line = SegmentLine::update(
            ts(100, 0),
            "label",
            &Value::String("a|b|c".to_string()),
            "",
            LineStatus::Valid,
        )
        .unwrap();
        let parsed = SegmentLine::parse(&format!("{}\n", line.format())).unwrap();
        assert_eq!(parsed.value_text, "a|b|c");
        assert_eq!(parsed.user, ".");
    }

    #[test]
    fn test_logout_marker() {
        let line = SegmentLine::logout(ts(500, 3), "alice");
        let parsed = SegmentLine::parse(&line.format()).unwrap();
        assert_eq!(parsed.status, LineStatus::Logout);
        assert_eq!(parsed.property, ".");
        assert!(parsed.type_tag.is_empty());
        assert!(parsed.is_marker());
    }

    #[test]
    fn test_malformed_lines_rejected() {
        assert!(SegmentLine::parse("").is_err());
        assert!(SegmentLine::parse("garbage").is_err());
        assert!(SegmentLine::parse("2019|100.0|1|p|DOUBLE|1|u|BOGUS").is_err());
        assert!(SegmentLine::parse("2019|100.0|x|p|DOUBLE|1|u|VALID").is_err());
        assert!(SegmentLine::parse("2019|100.0|1|p|double|1|u|VALID").is_err());
        assert!(SegmentLine::parse("20-19|100.0|1|p|DOUBLE|1|u|VALID").is_err());
    }

    #[test]
    fn test_segment_index_entry() {
        let entry = SegmentIndexEntry::new(IndexEvent::Login, ts(50, 9), 1024, "", 3);
        let text = entry.format();
        assert!(text.starts_with("+LOG "));
        assert!(text.ends_with(" 1024 . 3"));
        let parsed = SegmentIndexEntry::parse(&text).unwrap();
        assert_eq!(parsed, entry);

        let spaced = SegmentIndexEntry::parse("=NEW  19700101T000100.000000Z 60.000000  1 0 . 2").unwrap();
        assert_eq!(spaced.event, IndexEvent::NewFile);
        assert_eq!(spaced.segment, 2);
        assert!(SegmentIndexEntry::parse("+LOG 1 2").is_err());
        assert!(SegmentIndexEntry::parse("*LOG a 1.0 1 0 . 2").is_err());
    }

    #[test]
    fn test_schema_archive_entry() {
        let entry = SchemaArchiveEntry::new(ts(10, 1), r#"{"class_id":"A B"}"#.to_string());
        let parsed = SchemaArchiveEntry::parse(&entry.format()).unwrap();
        assert_eq!(parsed, entry);
        assert!(SchemaArchiveEntry::parse("10 0 1").is_err());
    }

    #[test]
    fn test_property_index_record_layout() {
        let record = PropertyIndexRecord::new(&ts(200, 5), 4096, true);
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), PropertyIndexRecord::SIZE);
        assert_eq!(&bytes[16..24], &4096u64.to_le_bytes());
        let decoded = PropertyIndexRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.is_first());
        assert_eq!(decoded.epoch, 200.25);
        assert_eq!(decoded.sequence_id, 5);
    }

    #[test]
    fn test_first_flag_is_independent_of_extents() {
        let mut record = PropertyIndexRecord::new(&ts(1, 0), 0, false);
        assert!(!record.is_first());
        record.set_extents(0xFFFF_FFFF, 0xFFFF_FFFF);
        assert_eq!(record.extent1(), 0x00FF_FFFF);
        assert_eq!(record.extent2(), 0x00FF_FFFF);
        assert!(!record.is_first());
        record.set_first(true);
        assert!(record.is_first());
        assert_eq!(record.extent2(), 0x00FF_FFFF);
        assert!(PropertyIndexRecord::decode(&[0u8; 31]).is_err());
    }
}
