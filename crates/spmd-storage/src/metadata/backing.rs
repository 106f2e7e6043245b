//! Persistence backends for [`MetadataStore`](super::MetadataStore)
//!
//! A backing stores the complete line set in one atomic step. It knows
//! nothing about keys or checksums.

use super::store::EOF_MARKER;
use crate::range::ByteRange;
use spmd_common::{Error, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Line-oriented storage for one metadata store
pub trait MetadataBacking: Send + Sync {
    /// Read all stored lines, without trailing newlines
    fn read_lines(&self) -> Result<Vec<String>>;

    /// Replace the stored content with `lines` atomically
    fn write_lines(&self, lines: &[String]) -> Result<()>;

    /// Name used in log lines
    fn name(&self) -> String;
}

/// Metadata kept in a regular file on a file-based domain
pub struct FileMetadata {
    path: PathBuf,
}

impl FileMetadata {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".new");
        PathBuf::from(name)
    }
}

impl MetadataBacking for FileMetadata {
    fn read_lines(&self) -> Result<Vec<String>> {
        match fs::read(&self.path) {
            Ok(content) => Ok(String::from_utf8_lossy(&content)
                .lines()
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("metadata file {:?} does not exist yet", self.path);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        let tmp = self.temp_path();
        {
            let mut file = fs::File::create(&tmp)?;
            for line in lines {
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Metadata kept in a fixed-size slice of a raw range on a block domain.
///
/// The slice is always written whole, padded with NUL bytes, so a reader
/// never sees a mix of old and new lines.
pub struct RangeMetadata {
    range: Arc<dyn ByteRange>,
    offset: u64,
    size: usize,
}

impl RangeMetadata {
    pub fn new(range: Arc<dyn ByteRange>, offset: u64, size: usize) -> Self {
        Self {
            range,
            offset,
            size,
        }
    }
}

impl MetadataBacking for RangeMetadata {
    fn read_lines(&self) -> Result<Vec<String>> {
        let raw = self.range.read_range(self.offset, self.size)?;
        let text = String::from_utf8_lossy(&raw);
        Ok(text
            .split('\n')
            .filter(|line| {
                !line.starts_with('\0') && (line.contains('=') || *line == EOF_MARKER)
            })
            .map(str::to_string)
            .collect())
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        let mut buf = Vec::with_capacity(self.size);
        for line in lines {
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
        }
        if buf.len() > self.size {
            return Err(Error::MetadataOverflow {
                size: buf.len(),
                capacity: self.size,
            });
        }
        buf.resize(self.size, 0);
        self.range.write_range(self.offset, &buf)
    }

    fn name(&self) -> String {
        format!("{}@{}", self.range.name(), self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::MemoryRange;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_file_backing_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backing = FileMetadata::new(dir.path().join("metadata"));
        assert!(backing.read_lines().unwrap().is_empty());
    }

    #[test]
    fn test_file_backing_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata");
        let backing = FileMetadata::new(&path);

        backing.write_lines(&lines(&["A=1", "B=2", "EOF"])).unwrap();
        backing.write_lines(&lines(&["A=3"])).unwrap();

        assert_eq!(backing.read_lines().unwrap(), lines(&["A=3"]));
        assert!(!dir.path().join("metadata.new").exists());
    }

    #[test]
    fn test_range_backing_pads_and_filters() {
        let range = MemoryRange::new(0);
        let backing = RangeMetadata::new(Arc::new(range.clone()), 512, 256);

        backing.write_lines(&lines(&["A=1", "EOF", "B=2"])).unwrap();
        let raw = range.contents();
        assert_eq!(raw.len(), 512 + 256);
        assert_eq!(raw[raw.len() - 1], 0);

        assert_eq!(backing.read_lines().unwrap(), lines(&["A=1", "EOF", "B=2"]));
    }

    #[test]
    fn test_range_backing_drops_garbage_lines() {
        let range = MemoryRange::new(0);
        range.write_range(0, b"A=1\nnoise\n\0\0junk\n").unwrap();
        let backing = RangeMetadata::new(Arc::new(range), 0, 64);
        assert_eq!(backing.read_lines().unwrap(), lines(&["A=1"]));
    }

    #[test]
    fn test_range_backing_overflow_writes_nothing() {
        let range = MemoryRange::new(64);
        let backing = RangeMetadata::new(Arc::new(range.clone()), 0, 8);

        let err = backing.write_lines(&lines(&["LONGKEY=LONGVALUE"])).unwrap_err();
        assert!(matches!(err, Error::MetadataOverflow { size: 18, capacity: 8 }));
        assert!(range.contents().iter().all(|&b| b == 0));
    }
}
