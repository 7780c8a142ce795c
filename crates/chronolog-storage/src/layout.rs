//! On-disk layout of the archive.
//!
//! ```text
//! <root>/<deviceId>/raw/archive_<N>.txt               segments
//! <root>/<deviceId>/raw/archive_index.txt             segment index
//! <root>/<deviceId>/raw/archive.last                  last segment number
//! <root>/<deviceId>/raw/archive_schema.txt            schema archive
//! <root>/<deviceId>/raw/properties_with_index.txt     property registry
//! <root>/<deviceId>/idx/archive_<N>-<property>-index.bin
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn device_dir(&self, device: &str) -> PathBuf {
        self.root.join(device)
    }

    pub fn raw_dir(&self, device: &str) -> PathBuf {
        self.device_dir(device).join("raw")
    }

    pub fn idx_dir(&self, device: &str) -> PathBuf {
        self.device_dir(device).join("idx")
    }

    pub fn segment(&self, device: &str, segment: u32) -> PathBuf {
        self.raw_dir(device).join(format!("archive_{}.txt", segment))
    }

    pub fn segment_index(&self, device: &str) -> PathBuf {
        self.raw_dir(device).join("archive_index.txt")
    }

    pub fn last_segment(&self, device: &str) -> PathBuf {
        self.raw_dir(device).join("archive.last")
    }

    pub fn schema_archive(&self, device: &str) -> PathBuf {
        self.raw_dir(device).join("archive_schema.txt")
    }

    pub fn registry(&self, device: &str) -> PathBuf {
        self.raw_dir(device).join("properties_with_index.txt")
    }

    pub fn property_index(&self, device: &str, property: &str, segment: u32) -> PathBuf {
        self.idx_dir(device)
            .join(format!("archive_{}-{}-index.bin", segment, property))
    }

    /// Segment number encoded in a segment file name, if it is one.
    pub fn parse_segment_name(name: &str) -> Option<u32> {
        name.strip_prefix("archive_")?
            .strip_suffix(".txt")?
            .parse()
            .ok()
    }

    pub fn create_device_dirs(&self, device: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(self.raw_dir(device))?;
        std::fs::create_dir_all(self.idx_dir(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = ArchiveLayout::new("/h");
        assert_eq!(
            layout.segment("SA1/MOTOR/X", 3),
            PathBuf::from("/h/SA1/MOTOR/X/raw/archive_3.txt")
        );
        assert_eq!(
            layout.property_index("dev", "state", 0),
            PathBuf::from("/h/dev/idx/archive_0-state-index.bin")
        );
    }

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(ArchiveLayout::parse_segment_name("archive_12.txt"), Some(12));
        assert_eq!(ArchiveLayout::parse_segment_name("archive_index.txt"), None);
        assert_eq!(ArchiveLayout::parse_segment_name("archive_schema.txt"), None);
        assert_eq!(ArchiveLayout::parse_segment_name("archive.last"), None);
    }
}
