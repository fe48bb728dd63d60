//! Configuration for a blockstore instance.
//!
//! A blockstore manages three byte ranges (data, metadata, journal) that may
//! live on one shared device or on up to three separate ones. All geometry
//! is fixed at format time; `validate()` rejects configurations the on-disk
//! layout cannot express.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Implicit-commit behavior for writes.
///
/// Only safe when the drive cache is write-through or capacitor-backed;
/// `validate()` enforces that the matching fsyncs are disabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImmediateCommit {
    /// Writes become durable only through an explicit sync.
    #[default]
    None,
    /// Small (journaled) writes and deletes are synced implicitly.
    Small,
    /// All writes, including big redirect writes, are synced implicitly.
    All,
}

/// Configuration for a single blockstore.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the data device or file.
    pub data_device: PathBuf,
    /// Path to the metadata device. Defaults to the data device when empty.
    pub meta_device: PathBuf,
    /// Path to the journal device. Defaults to the meta device when empty.
    pub journal_device: PathBuf,

    /// Byte offset of the data region on its device.
    pub data_offset: u64,
    /// Byte offset of the metadata region on its device.
    pub meta_offset: u64,
    /// Byte offset of the journal region on its device.
    pub journal_offset: u64,

    /// Size of the data region in bytes. 0 means "rest of the device".
    pub data_size: u64,
    /// Size of the journal region in bytes.
    pub journal_size: u64,

    /// Data block size. Power of two, at least `disk_alignment`.
    pub block_size: u32,
    /// Minimum I/O alignment of the devices.
    pub disk_alignment: u32,
    /// Sector size of the journal device.
    pub journal_block_size: u32,
    /// Sector size of the metadata device.
    pub meta_block_size: u32,
    /// Sparse-write tracking unit. Multiple of `disk_alignment`.
    pub bitmap_granularity: u32,

    /// Use direct I/O (O_DIRECT on Linux, F_NOCACHE on macOS).
    pub direct_io: bool,
    /// Disallow writes and skip journal initialization/rewrite.
    pub readonly: bool,
    /// Skip exclusive device locking.
    pub disable_flock: bool,
    /// Skip data device fsyncs.
    pub disable_data_fsync: bool,
    /// Skip metadata device fsyncs.
    pub disable_meta_fsync: bool,
    /// Skip journal device fsyncs.
    pub disable_journal_fsync: bool,
    /// Treat small writes (or all writes) as implicitly synced.
    pub immediate_commit: ImmediateCommit,
    /// Hold the whole metadata region in RAM.
    pub inmemory_meta: bool,

    /// Number of flusher workers.
    pub flusher_count: usize,
    /// Submission slot budget of the I/O queue.
    pub ring_depth: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_device: PathBuf::new(),
            meta_device: PathBuf::new(),
            journal_device: PathBuf::new(),
            data_offset: 0,
            meta_offset: 0,
            journal_offset: 0,
            data_size: 0,
            journal_size: 16 * 1024 * 1024,
            block_size: 128 * 1024,
            disk_alignment: 4096,
            journal_block_size: 4096,
            meta_block_size: 4096,
            bitmap_granularity: 4096,
            direct_io: true,
            readonly: false,
            disable_flock: false,
            disable_data_fsync: false,
            disable_meta_fsync: false,
            disable_journal_fsync: false,
            immediate_commit: ImmediateCommit::None,
            inmemory_meta: true,
            flusher_count: 4,
            ring_depth: 512,
        }
    }
}

impl StoreConfig {
    /// Path of the metadata device, falling back to the data device.
    #[must_use]
    pub fn meta_device_path(&self) -> &PathBuf {
        if self.meta_device.as_os_str().is_empty() {
            &self.data_device
        } else {
            &self.meta_device
        }
    }

    /// Path of the journal device, falling back to the metadata device.
    #[must_use]
    pub fn journal_device_path(&self) -> &PathBuf {
        if self.journal_device.as_os_str().is_empty() {
            self.meta_device_path()
        } else {
            &self.journal_device
        }
    }

    /// Check the configuration for geometry the layout cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.data_device.as_os_str().is_empty() {
            return Err(Error::invalid_argument("data_device is required"));
        }
        if !self.disk_alignment.is_power_of_two() {
            return Err(Error::invalid_argument(
                "disk_alignment must be a power of two",
            ));
        }
        if !self.block_size.is_power_of_two() || self.block_size < self.disk_alignment {
            return Err(Error::invalid_argument(format!(
                "block_size must be a power of two >= disk_alignment ({})",
                self.disk_alignment
            )));
        }
        for (name, value) in [
            ("journal_block_size", self.journal_block_size),
            ("meta_block_size", self.meta_block_size),
        ] {
            if !value.is_power_of_two() || value < 512 {
                return Err(Error::invalid_argument(format!(
                    "{name} must be a power of two >= 512"
                )));
            }
        }
        if self.bitmap_granularity == 0
            || self.bitmap_granularity % self.disk_alignment != 0
            || self.block_size % self.bitmap_granularity != 0
        {
            return Err(Error::invalid_argument(
                "bitmap_granularity must divide block_size and be a multiple of disk_alignment",
            ));
        }
        // Journal payload lengths are granularity multiples; keeping the
        // granularity a multiple of the journal sector keeps every sector
        // start aligned inside the circular region.
        if self.bitmap_granularity % self.journal_block_size != 0 {
            return Err(Error::invalid_argument(
                "bitmap_granularity must be a multiple of journal_block_size",
            ));
        }
        if self.journal_size < 4 * u64::from(self.journal_block_size) {
            return Err(Error::invalid_argument("journal_size is too small"));
        }
        if self.journal_size % u64::from(self.journal_block_size) != 0 {
            return Err(Error::invalid_argument(
                "journal_size must be a multiple of journal_block_size",
            ));
        }
        if self.flusher_count == 0 {
            return Err(Error::invalid_argument("flusher_count must be at least 1"));
        }
        if self.ring_depth == 0 {
            return Err(Error::invalid_argument("ring_depth must be at least 1"));
        }
        match self.immediate_commit {
            ImmediateCommit::None => {}
            ImmediateCommit::Small => {
                if !self.disable_journal_fsync {
                    return Err(Error::invalid_argument(
                        "immediate_commit=small requires disable_journal_fsync",
                    ));
                }
            }
            ImmediateCommit::All => {
                if !self.disable_journal_fsync || !self.disable_data_fsync {
                    return Err(Error::invalid_argument(
                        "immediate_commit=all requires disable_journal_fsync and disable_data_fsync",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> StoreConfig {
        StoreConfig {
            data_device: PathBuf::from("/dev/null"),
            data_size: 16 * 1024 * 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_validates() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_unaligned_block_size() {
        let cfg = StoreConfig {
            block_size: 100_000,
            ..base_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_bitmap_granularity() {
        let cfg = StoreConfig {
            bitmap_granularity: 3000,
            ..base_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_immediate_commit_requires_fsync_off() {
        let cfg = StoreConfig {
            immediate_commit: ImmediateCommit::Small,
            ..base_config()
        };
        assert!(cfg.validate().is_err());

        let cfg = StoreConfig {
            immediate_commit: ImmediateCommit::Small,
            disable_journal_fsync: true,
            ..base_config()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_device_fallbacks() {
        let cfg = base_config();
        assert_eq!(cfg.meta_device_path(), &cfg.data_device);
        assert_eq!(cfg.journal_device_path(), &cfg.data_device);
    }
}
