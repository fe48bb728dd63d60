//! On-disk layout definitions
//!
//! A blockstore spans three byte ranges, on one device or several:
//! ```text
//! +------------------+
//! |   Data region    |  block_count * block_size, unit of big writes
//! +------------------+
//! | Metadata region  |  one fixed-size entry per data block, packed
//! |                  |  into meta_block_size sectors
//! +------------------+
//! |  Journal region  |  circular; block 0 holds the START superblock
//! +------------------+
//! ```
//!
//! A metadata entry records the owner of the data block with the same
//! index: oid.inode (u64), oid.stripe (u64), version (u64), then a bitmap
//! with one bit per `bitmap_granularity` bytes of the block.

use blockio_common::{Error, ObjectId, Result, StoreConfig};
use bytes::{Buf, BufMut};

/// Fixed part of a clean metadata entry (oid + version).
pub const CLEAN_ENTRY_HEADER_SIZE: usize = 24;

/// Align a value up to the given power-of-two alignment.
#[inline]
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Computed geometry of one blockstore instance.
#[derive(Clone, Debug)]
pub struct Layout {
    /// Data block size in bytes.
    pub block_size: u32,
    /// log2(block_size); block index == location >> block_order.
    pub block_order: u32,
    /// Number of data blocks.
    pub block_count: u64,
    /// Sparse-write tracking unit.
    pub bitmap_granularity: u32,
    /// Bytes of bitmap per clean entry.
    pub clean_entry_bitmap_size: usize,
    /// Bytes per clean entry (header + bitmap).
    pub clean_entry_size: usize,
    /// Metadata device sector size.
    pub meta_block_size: u32,
    /// Clean entries per metadata sector.
    pub entries_per_meta_block: usize,
    /// Total metadata region length in bytes.
    pub meta_len: u64,
    /// Journal device sector size.
    pub journal_block_size: u32,
    /// Journal region length in bytes.
    pub journal_len: u64,
    /// Byte offsets of the regions on their devices.
    pub data_offset: u64,
    pub meta_offset: u64,
    pub journal_offset: u64,
    /// Minimum I/O alignment.
    pub disk_alignment: u32,
}

impl Layout {
    /// Compute the layout from a validated configuration and the size of the
    /// data device.
    pub fn from_config(cfg: &StoreConfig, data_device_size: u64) -> Result<Self> {
        cfg.validate()?;

        let block_size = u64::from(cfg.block_size);
        let avail = data_device_size.saturating_sub(cfg.data_offset);
        let data_len = if cfg.data_size > 0 {
            if cfg.data_size > avail {
                return Err(Error::invalid_argument(format!(
                    "data_size {} exceeds device space {}",
                    cfg.data_size, avail
                )));
            }
            cfg.data_size
        } else {
            avail
        };
        let block_count = data_len / block_size;
        if block_count == 0 {
            return Err(Error::invalid_argument(
                "data region smaller than one block",
            ));
        }

        let bits = block_size / u64::from(cfg.bitmap_granularity);
        let clean_entry_bitmap_size = bits.div_ceil(8) as usize;
        let clean_entry_size = CLEAN_ENTRY_HEADER_SIZE + clean_entry_bitmap_size;
        let entries_per_meta_block = cfg.meta_block_size as usize / clean_entry_size;
        if entries_per_meta_block == 0 {
            return Err(Error::invalid_argument(
                "clean entry does not fit in a metadata sector",
            ));
        }
        let meta_blocks = block_count.div_ceil(entries_per_meta_block as u64);
        let meta_len = meta_blocks * u64::from(cfg.meta_block_size);

        Ok(Self {
            block_size: cfg.block_size,
            block_order: cfg.block_size.trailing_zeros(),
            block_count,
            bitmap_granularity: cfg.bitmap_granularity,
            clean_entry_bitmap_size,
            clean_entry_size,
            meta_block_size: cfg.meta_block_size,
            entries_per_meta_block,
            meta_len,
            journal_block_size: cfg.journal_block_size,
            journal_len: cfg.journal_size,
            data_offset: cfg.data_offset,
            meta_offset: cfg.meta_offset,
            journal_offset: cfg.journal_offset,
            disk_alignment: cfg.disk_alignment,
        })
    }

    /// Data block index of a data-region byte location.
    #[inline]
    #[must_use]
    pub fn block_of(&self, location: u64) -> u64 {
        location >> self.block_order
    }

    /// Data-region byte location of a block index.
    #[inline]
    #[must_use]
    pub fn location_of(&self, block: u64) -> u64 {
        block << self.block_order
    }

    /// Byte offset (within the metadata region) of the sector holding the
    /// entry for `block`.
    #[inline]
    #[must_use]
    pub fn meta_sector_of(&self, block: u64) -> u64 {
        (block / self.entries_per_meta_block as u64) * u64::from(self.meta_block_size)
    }

    /// Index of the entry for `block` within its metadata sector.
    #[inline]
    #[must_use]
    pub fn meta_pos_of(&self, block: u64) -> usize {
        (block % self.entries_per_meta_block as u64) as usize
    }
}

/// Encode a clean metadata entry into `buf` (must be `clean_entry_size` long).
pub fn encode_clean_entry(buf: &mut [u8], oid: ObjectId, version: u64, bitmap: &[u8]) {
    let (mut header, tail) = buf.split_at_mut(CLEAN_ENTRY_HEADER_SIZE);
    header.put_u64_le(oid.inode);
    header.put_u64_le(oid.stripe);
    header.put_u64_le(version);
    tail[..bitmap.len()].copy_from_slice(bitmap);
}

/// Decode the fixed part of a clean metadata entry. A zero inode means the
/// slot is unoccupied.
#[must_use]
pub fn decode_clean_entry(buf: &[u8]) -> (ObjectId, u64) {
    let mut cursor = &buf[..CLEAN_ENTRY_HEADER_SIZE];
    let inode = cursor.get_u64_le();
    let stripe = cursor.get_u64_le();
    let version = cursor.get_u64_le();
    (ObjectId::new(inode, stripe), version)
}

/// The bitmap bytes of a clean metadata entry.
#[must_use]
pub fn clean_entry_bitmap(buf: &[u8], bitmap_size: usize) -> &[u8] {
    &buf[CLEAN_ENTRY_HEADER_SIZE..CLEAN_ENTRY_HEADER_SIZE + bitmap_size]
}

/// Set the bits covering `[start, start + len)` in a per-block bitmap.
pub fn bitmap_set(bitmap: &mut [u8], start: u32, len: u32, granularity: u32) {
    if len == 0 {
        return;
    }
    let bit_start = (start / granularity) as usize;
    let bit_end = ((start + len).div_ceil(granularity)) as usize;
    for bit in bit_start..bit_end {
        bitmap[bit / 8] |= 1 << (bit % 8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockio_common::StoreConfig;
    use std::path::PathBuf;

    fn layout_131072() -> Layout {
        let cfg = StoreConfig {
            data_device: PathBuf::from("/x"),
            data_size: 64 * 131072,
            ..Default::default()
        };
        Layout::from_config(&cfg, 64 * 131072).unwrap()
    }

    #[test]
    fn test_geometry() {
        let layout = layout_131072();
        assert_eq!(layout.block_count, 64);
        assert_eq!(layout.block_order, 17);
        // 131072 / 4096 = 32 bits -> 4 bytes of bitmap
        assert_eq!(layout.clean_entry_bitmap_size, 4);
        assert_eq!(layout.clean_entry_size, 28);
        assert_eq!(layout.entries_per_meta_block, 4096 / 28);
    }

    #[test]
    fn test_meta_addressing() {
        let layout = layout_131072();
        let per_block = layout.entries_per_meta_block as u64;
        assert_eq!(layout.meta_sector_of(0), 0);
        assert_eq!(layout.meta_sector_of(per_block), 4096);
        assert_eq!(layout.meta_pos_of(per_block + 3), 3);
    }

    #[test]
    fn test_clean_entry_roundtrip() {
        let layout = layout_131072();
        let mut buf = vec![0u8; layout.clean_entry_size];
        let oid = ObjectId::new(7, 11);
        encode_clean_entry(&mut buf, oid, 42, &[0xff, 0, 0, 0]);

        let (decoded, version) = decode_clean_entry(&buf);
        assert_eq!(decoded, oid);
        assert_eq!(version, 42);
        assert_eq!(clean_entry_bitmap(&buf, 4), &[0xff, 0, 0, 0]);
    }

    #[test]
    fn test_bitmap_set_partial_ranges() {
        let mut bitmap = [0u8; 4];
        bitmap_set(&mut bitmap, 0, 4096, 4096);
        assert_eq!(bitmap[0], 0b0000_0001);

        let mut bitmap = [0u8; 4];
        bitmap_set(&mut bitmap, 131072 - 4096, 4096, 4096);
        assert_eq!(bitmap[3], 0b1000_0000);

        let mut bitmap = [0u8; 4];
        bitmap_set(&mut bitmap, 0, 131072, 4096);
        assert_eq!(bitmap, [0xff; 4]);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
    }
}
