//! Property registry (`properties_with_index.txt`)
//!
//! Lists the properties of a device that have a property index. The history reader
//! appends to it the first time a property is requested; the archive writer watches
//! its size and modification time to learn when it has to start maintaining a new
//! index.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    size: u64,
    modified: Option<SystemTime>,
}

fn stamp_of(path: &Path) -> io::Result<Option<FileStamp>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(FileStamp {
            size: meta.len(),
            modified: meta.modified().ok(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Cached view of one device's registry file.
#[derive(Debug)]
pub struct PropertyRegistry {
    path: PathBuf,
    properties: Vec<String>,
    stamp: Option<FileStamp>,
}

impl PropertyRegistry {
    /// Creates an empty view; call [`refresh`](Self::refresh) to load the file.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            properties: Vec::new(),
            stamp: None,
        }
    }

    pub fn open(path: PathBuf) -> io::Result<Self> {
        let mut registry = Self::new(path);
        registry.refresh()?;
        Ok(registry)
    }

    /// Re-reads the file if its size or modification time changed. Returns true on change.
    pub fn refresh(&mut self) -> io::Result<bool> {
        let stamp = stamp_of(&self.path)?;
        if stamp == self.stamp {
            return Ok(false);
        }
        self.properties = match fs::read_to_string(&self.path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        self.stamp = stamp;
        debug!(
            path = %self.path.display(),
            properties = self.properties.len(),
            "Property registry reloaded"
        );
        Ok(true)
    }

    pub fn contains(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }

    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Appends `property` unless already listed. Returns true when it was added.
    pub fn register(&mut self, property: &str) -> io::Result<bool> {
        self.refresh()?;
        if self.contains(property) {
            return Ok(false);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", property)?;
        drop(file);
        self.properties.push(property.to_string());
        self.stamp = stamp_of(&self.path)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_appends_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("properties_with_index.txt");
        let mut registry = PropertyRegistry::open(path.clone()).unwrap();
        assert!(registry.properties().is_empty());

        assert!(registry.register("temp").unwrap());
        assert!(!registry.register("temp").unwrap());
        assert!(registry.register("speed").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "temp\nspeed\n");
    }

    #[test]
    fn test_refresh_detects_other_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("properties_with_index.txt");
        let mut watcher = PropertyRegistry::open(path.clone()).unwrap();
        assert!(!watcher.refresh().unwrap());

        let mut other = PropertyRegistry::open(path).unwrap();
        other.register("temp").unwrap();

        assert!(watcher.refresh().unwrap());
        assert!(watcher.contains("temp"));
        assert!(!watcher.refresh().unwrap());
    }
}
