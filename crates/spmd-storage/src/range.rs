//! Byte-range I/O
//!
//! Metadata of block domains and both mailbox regions live in raw ranges
//! addressed by offset. Each call is a single transfer: callers that need
//! atomicity (a mailbox, a metadata slice) pass the whole unit in one write.

use crate::raw_io::{AlignedBuffer, RawFile};
use parking_lot::Mutex;
use spmd_common::Result;
use std::path::Path;
use std::sync::Arc;

/// Offset-addressed storage shared between hosts
pub trait ByteRange: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`
    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset` in one call
    fn write_range(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Name used in log lines
    fn name(&self) -> String;
}

/// A range backed by a file or block device
pub struct RawRange {
    file: RawFile,
}

impl RawRange {
    /// Open an existing region
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        Ok(Self {
            file: RawFile::open(path, direct)?,
        })
    }

    /// Size of the underlying file or device
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.file.size()
    }
}

impl ByteRange for RawRange {
    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if self.file.is_direct() {
            let mut buf = AlignedBuffer::new(len);
            self.file.read_at(offset, buf.as_mut_slice())?;
            Ok(buf.data(len).to_vec())
        } else {
            let mut buf = vec![0u8; len];
            self.file.read_at(offset, &mut buf)?;
            Ok(buf)
        }
    }

    fn write_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.file.is_direct() {
            let mut buf = AlignedBuffer::new(data.len());
            buf.copy_from(data);
            self.file.write_at(offset, buf.as_slice())?;
        } else {
            self.file.write_at(offset, data)?;
        }
        self.file.sync_data()
    }

    fn name(&self) -> String {
        self.file.path().to_string()
    }
}

/// In-memory range, zero-filled and growing on demand.
///
/// Cloning shares the same bytes, which lets two monitors talk over one
/// region in tests.
#[derive(Clone, Default)]
pub struct MemoryRange {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryRange {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; size])),
        }
    }

    /// Copy of the whole content
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Overwrite one byte, bypassing any framing
    pub fn poke(&self, offset: usize, value: u8) {
        let mut data = self.data.lock();
        if offset >= data.len() {
            data.resize(offset + 1, 0);
        }
        data[offset] = value;
    }
}

impl ByteRange for MemoryRange {
    fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.data.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        let mut out = data[start..end].to_vec();
        out.resize(len, 0);
        Ok(out)
    }

    fn write_range(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = usize::try_from(offset).map_err(|_| {
            spmd_common::Error::invalid_parameter("offset", offset)
        })?;
        let end = start + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn name(&self) -> String {
        "memory".to_string()
    }
}
