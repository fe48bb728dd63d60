//! Platform-specific raw device I/O
//!
//! Provides direct disk access bypassing the OS page cache:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! Block devices are sized via ioctl; regular files via metadata. Devices
//! are locked exclusively with flock unless the store is configured not to.

use blockio_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Raw file handle with optional direct I/O.
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
    direct: bool,
    alignment: u64,
}

impl RawFile {
    /// Open a device or file for raw I/O.
    pub fn open(path: impl AsRef<Path>, read_only: bool, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }

        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {}: {}", path_str, e)))?;

        #[cfg(target_os = "macos")]
        if direct {
            set_nocache(&file, &path_str)?;
        }

        let size = device_or_file_size(&file, &path, &path_str)?;

        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
            direct,
            alignment: 4096,
        })
    }

    /// Create a regular file of the given size for raw I/O, or open a block
    /// device (its actual size wins).
    pub fn create(path: impl AsRef<Path>, size: u64, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block = is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block {
            options.create(true);
        }

        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {}: {}", path_str, e)))?;

        #[cfg(target_os = "macos")]
        if direct {
            set_nocache(&file, &path_str)?;
        }

        let actual_size = if is_block {
            block_device_size(&file, &path_str)?
        } else {
            if file
                .metadata()
                .map_err(|e| Error::Storage(format!("stat failed on {}: {}", path_str, e)))?
                .len()
                < size
            {
                file.set_len(size).map_err(|e| {
                    Error::Storage(format!("failed to set size of {}: {}", path_str, e))
                })?;
            }
            size
        };

        Ok(Self {
            file,
            path: path_str,
            size: actual_size,
            read_only: false,
            direct,
            alignment: 4096,
        })
    }

    /// Take an exclusive advisory lock on the device.
    ///
    /// Fails immediately instead of blocking if another process holds it.
    pub fn lock_exclusive(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            return Err(Error::Storage(format!(
                "failed to lock {} exclusively: {}",
                self.path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Get the device size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get the device path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the file was opened for direct I/O.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::Storage(format!("read failed on {}: {}", self.path, e)))
    }

    /// Write the whole buffer at `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.check_alignment(offset, buf.len())?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::Storage(format!("write failed on {}: {}", self.path, e)))
    }

    /// Flush device write cache (data only, no file metadata).
    pub fn sync_data(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("fsync failed on {}: {}", self.path, e)))
    }

    /// Flush everything including file metadata.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::Storage(format!("fsync failed on {}: {}", self.path, e)))
    }

    fn check_alignment(&self, offset: u64, len: usize) -> Result<()> {
        if !self.direct {
            return Ok(());
        }
        if offset % self.alignment != 0 || len as u64 % self.alignment != 0 {
            return Err(Error::Storage(format!(
                "unaligned I/O on {}: offset {} len {} (alignment {})",
                self.path, offset, len, self.alignment
            )));
        }
        Ok(())
    }
}

fn is_block_device(path: impl AsRef<Path>) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(&path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

fn device_or_file_size(file: &File, path: impl AsRef<Path>, path_str: &str) -> Result<u64> {
    if is_block_device(&path) {
        block_device_size(file, path_str)
    } else {
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| Error::Storage(format!("stat failed on {}: {}", path_str, e)))
    }
}

#[cfg(target_os = "linux")]
fn block_device_size(file: &File, path_str: &str) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
    if ret == -1 {
        return Err(Error::Storage(format!(
            "failed to get block device size for {}: {}",
            path_str,
            std::io::Error::last_os_error()
        )));
    }
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File, path_str: &str) -> Result<u64> {
    use std::io::{Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::End(0))
        .map_err(|e| Error::Storage(format!("failed to get device size for {}: {}", path_str, e)))
}

#[cfg(target_os = "macos")]
fn set_nocache(file: &File, path_str: &str) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if ret == -1 {
        return Err(Error::Storage(format!(
            "failed to set F_NOCACHE on {}: {}",
            path_str,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Heap buffer aligned for direct I/O.
///
/// O_DIRECT requires buffers aligned to the device sector size; plain
/// `Vec<u8>` gives no such guarantee.
pub struct AlignedBuffer {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
    layout: std::alloc::Layout,
}

impl AlignedBuffer {
    /// Default buffer alignment.
    pub const ALIGNMENT: usize = 4096;

    /// Allocate a zeroed buffer of `size` bytes, rounded up to the alignment.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, Self::ALIGNMENT)
    }

    /// Allocate a zeroed buffer with a custom alignment.
    #[must_use]
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        let len = size.div_ceil(alignment).max(1) * alignment;
        let layout = std::alloc::Layout::from_size_align(len, alignment)
            .expect("invalid aligned buffer layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = std::ptr::NonNull::new(ptr).expect("aligned buffer allocation failed");
        Self { ptr, len, layout }
    }

    /// Buffer contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable buffer contents.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Buffer length (the rounded-up size).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the buffer, zero-filling the tail.
    pub fn copy_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.len);
        let slice = self.as_mut_slice();
        slice[..n].copy_from_slice(&src[..n]);
        slice[n..].fill(0);
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(5000);
        assert_eq!(buf.len(), 8192);
        assert_eq!(buf.as_slice().as_ptr() as usize % AlignedBuffer::ALIGNMENT, 0);

        buf.copy_from(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert_eq!(buf.as_slice()[5], 0);
    }

    #[test]
    fn test_create_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");

        {
            let file = RawFile::create(&path, 64 * 1024, false).unwrap();
            file.write_at(4096, b"raw io test").unwrap();
            file.sync().unwrap();
        }
        {
            let file = RawFile::open(&path, true, false).unwrap();
            assert_eq!(file.size(), 64 * 1024);
            let mut buf = [0u8; 11];
            file.read_at(4096, &mut buf).unwrap();
            assert_eq!(&buf, b"raw io test");
        }
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        RawFile::create(&path, 8192, false).unwrap();

        let file = RawFile::open(&path, true, false).unwrap();
        assert!(file.write_at(0, &[0u8; 512]).is_err());
    }

    #[test]
    fn test_lock_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.img");
        let file = RawFile::create(&path, 8192, false).unwrap();
        file.lock_exclusive().unwrap();
    }
}
