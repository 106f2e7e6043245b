//! Positional I/O on shared regions
//!
//! Positional reads and writes on a regular file or block device, optionally
//! bypassing the page cache:
//! `O_DIRECT` on Linux and `F_NOCACHE` on macOS.
//!
//! Shared-storage regions are read by other hosts, so a cached read could
//! return a stale mailbox. Direct mode keeps every transfer on the device.

use spmd_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O
pub const ALIGNMENT: usize = 4096;

fn io_context(path: &str, op: &str, e: &io::Error) -> Error {
    Error::Io(io::Error::new(e.kind(), format!("{op} failed on {path}: {e}")))
}

/// Region file or device opened for positional I/O
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    direct: bool,
}

impl RawFile {
    /// Open an existing file or device for raw I/O
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let display = path.as_ref().display().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        Self::apply_direct(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| io_context(&display, "open", &e))?;
        Self::set_nocache(&file, &display, direct)?;

        let size = if Self::is_block_device(&path) {
            Self::device_size(&file, &display)?
        } else {
            file.metadata()
                .map_err(|e| io_context(&display, "stat", &e))?
                .len()
        };

        Ok(Self {
            file,
            path: display,
            size,
            direct,
        })
    }

    /// Create (or truncate) a regular file of the given size.
    ///
    /// Block devices are opened as they are; `size` is ignored for them.
    pub fn create(path: impl AsRef<Path>, size: u64, direct: bool) -> Result<Self> {
        let display = path.as_ref().display().to_string();
        let is_block_device = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(true);
        }
        Self::apply_direct(&mut options, direct);

        let file = options
            .open(&path)
            .map_err(|e| io_context(&display, "create", &e))?;
        Self::set_nocache(&file, &display, direct)?;

        let size = if is_block_device {
            Self::device_size(&file, &display)?
        } else {
            file.set_len(size)
                .map_err(|e| io_context(&display, "truncate", &e))?;
            size
        };

        Ok(Self {
            file,
            path: display,
            size,
            direct,
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_direct(options: &mut OpenOptions, direct: bool) {
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_direct(_options: &mut OpenOptions, _direct: bool) {}

    #[cfg(target_os = "macos")]
    #[allow(unsafe_code)]
    fn set_nocache(file: &File, path: &str, direct: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        if !direct {
            return Ok(());
        }
        // SAFETY: fcntl on a valid, owned descriptor.
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
            return Err(io_context(path, "F_NOCACHE", &io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    #[allow(clippy::unnecessary_wraps)]
    const fn set_nocache(_file: &File, _path: &str, _direct: bool) -> Result<()> {
        Ok(())
    }

    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64 ioctl
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes one u64 into `size`.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(io_context(path, "BLKGETSIZE64", &io::Error::last_os_error()));
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        f.seek(SeekFrom::End(0))
            .map_err(|e| io_context(path, "seek", &e))
    }

    /// Region size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the page cache is bypassed
    #[must_use]
    pub const fn is_direct(&self) -> bool {
        self.direct
    }

    /// Fill `buf` from `offset`.
    ///
    /// In direct mode, offset and buffer length must be aligned to [`ALIGNMENT`].
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| io_context(&self.path, "read", &e))
    }

    /// Write all of `buf` at `offset`.
    ///
    /// In direct mode, offset and buffer length must be aligned to [`ALIGNMENT`].
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| io_context(&self.path, "write", &e))
    }

    /// Flush written data to the device
    pub fn sync_data(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| io_context(&self.path, "sync_data", &e))
    }

    fn check_alignment(&self, offset: u64, size: usize) -> Result<()> {
        if !self.direct {
            return Ok(());
        }
        if offset % ALIGNMENT as u64 != 0 {
            return Err(Error::invalid_parameter(
                "offset",
                format!("{offset} is not aligned to {ALIGNMENT}"),
            ));
        }
        if size % ALIGNMENT != 0 {
            return Err(Error::invalid_parameter(
                "size",
                format!("{size} is not aligned to {ALIGNMENT}"),
            ));
        }
        Ok(())
    }
}

/// Zeroed buffer whose start and length are multiples of [`ALIGNMENT`]
///
/// Over-allocates by one alignment unit and exposes the aligned window, so
/// no custom allocator is needed.
#[derive(Debug)]
pub struct AlignedBuffer {
    data: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// Create a zeroed aligned buffer, rounded up to [`ALIGNMENT`]
    #[must_use]
    pub fn new(size: usize) -> Self {
        let len = size.div_ceil(ALIGNMENT) * ALIGNMENT;
        let data = vec![0u8; len + ALIGNMENT];
        let misalignment = data.as_ptr() as usize % ALIGNMENT;
        let start = if misalignment == 0 {
            0
        } else {
            ALIGNMENT - misalignment
        };
        Self { data, start, len }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.start + self.len]
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill from `src`, zeroing the tail
    pub fn copy_from(&mut self, src: &[u8]) {
        let dst = self.as_mut_slice();
        let copy_len = src.len().min(dst.len());
        dst[..copy_len].copy_from_slice(&src[..copy_len]);
        dst[copy_len..].fill(0);
    }

    /// First `size` bytes
    #[must_use]
    pub fn data(&self, size: usize) -> &[u8] {
        &self.as_slice()[..size.min(self.len)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(100);
        assert_eq!(buf.len(), ALIGNMENT);
        assert_eq!(buf.as_slice().as_ptr() as usize % ALIGNMENT, 0);

        buf.copy_from(b"hello");
        assert_eq!(buf.data(5), b"hello");
        assert!(buf.as_slice()[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_raw_file_create_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let file = RawFile::create(temp.path(), 2 * ALIGNMENT as u64, false).unwrap();
        assert_eq!(file.size(), 2 * ALIGNMENT as u64);

        let mut block = AlignedBuffer::new(ALIGNMENT);
        block.copy_from(b"mailbox");
        file.write_at(ALIGNMENT as u64, block.as_slice()).unwrap();

        let reopened = RawFile::open(temp.path(), false).unwrap();
        let mut out = AlignedBuffer::new(ALIGNMENT);
        reopened.read_at(ALIGNMENT as u64, out.as_mut_slice()).unwrap();
        assert_eq!(out.data(7), b"mailbox");
    }

    #[test]
    fn test_read_past_end_fails() {
        let temp = NamedTempFile::new().unwrap();
        let file = RawFile::create(temp.path(), 16, false).unwrap();
        let mut buf = vec![0u8; 64];
        assert!(matches!(file.read_at(0, &mut buf), Err(Error::Io(_))));
    }

    #[test]
    fn test_unaligned_direct_rejected() {
        let temp = NamedTempFile::new().unwrap();
        let mut file = RawFile::create(temp.path(), 8192, false).unwrap();
        file.direct = true;
        let buf = [0u8; 10];
        assert!(matches!(
            file.write_at(0, &buf),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(
            file.write_at(100, &[0u8; ALIGNMENT]),
            Err(Error::InvalidParameter { .. })
        ));
    }
}
