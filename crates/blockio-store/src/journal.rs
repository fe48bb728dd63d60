//! Circular write-ahead journal.
//!
//! Record format:
//! ```text
//! +--------+------+------+--------+------------+----------------+
//! | Magic  | Type | Size | CRC32C | CRC32Cprev | type-specific  |
//! | 4B     | 2B   | 2B   | 4B     | 4B         | var            |
//! +--------+------+------+--------+------------+----------------+
//! ```
//!
//! Entries are packed into sector-sized blocks; the unused tail of a sector
//! is zero-padded. Block 0 of the journal region holds a single START entry
//! (the journal "superblock") whose `journal_start` field is the current
//! tail; it is rewritten only on trim. Every other entry chains to its
//! predecessor through `crc32_prev`, so replay can tell live entries from
//! stale wrapped-around ones.
//!
//! Once any byte of a sector is in flight to the device the sector is
//! closed: later entries start a new sector, because a sector is only ever
//! written whole.

use blockio_common::{ObjVer, ObjectId};
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use tracing::debug;

/// Journal entry magic number.
pub const JOURNAL_MAGIC: u32 = 0x4C4E_524A; // "JRNL"

/// Fixed entry header: magic + type + size + crc32 + crc32_prev.
pub const ENTRY_HEADER_SIZE: usize = 16;

/// Serialized sizes per entry kind.
pub const START_SIZE: usize = ENTRY_HEADER_SIZE + 8;
pub const SMALL_WRITE_SIZE: usize = ENTRY_HEADER_SIZE + 16 + 8 + 4 + 4 + 8 + 4;
pub const BIG_WRITE_SIZE: usize = ENTRY_HEADER_SIZE + 16 + 8 + 4 + 4 + 8;
pub const STABLE_SIZE: usize = ENTRY_HEADER_SIZE + 16 + 8;
pub const ROLLBACK_SIZE: usize = STABLE_SIZE;
pub const DELETE_SIZE: usize = STABLE_SIZE;

/// Number of in-memory sector buffers.
pub const SECTOR_BUFFER_COUNT: usize = 32;

const TYPE_START: u16 = 1;
const TYPE_SMALL_WRITE: u16 = 2;
const TYPE_BIG_WRITE: u16 = 3;
const TYPE_STABLE: u16 = 4;
const TYPE_ROLLBACK: u16 = 5;
const TYPE_DELETE: u16 = 6;

/// One journal record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    /// Superblock anchor; `journal_start` is the tail of the used region.
    Start { journal_start: u64 },
    /// Sub-block write with its payload inline in the journal.
    SmallWrite {
        ov: ObjVer,
        offset: u32,
        len: u32,
        data_offset: u64,
        crc32_data: u32,
    },
    /// Whole-block write redirected to the data region.
    BigWrite {
        ov: ObjVer,
        offset: u32,
        len: u32,
        location: u64,
    },
    /// Marks (oid, version) and everything below it as final.
    Stable { ov: ObjVer },
    /// Discards unstable versions above (oid, version).
    Rollback { ov: ObjVer },
    /// Object deletion marker.
    Delete { ov: ObjVer },
}

impl JournalEntry {
    /// Wire type tag.
    #[must_use]
    pub fn entry_type(&self) -> u16 {
        match self {
            Self::Start { .. } => TYPE_START,
            Self::SmallWrite { .. } => TYPE_SMALL_WRITE,
            Self::BigWrite { .. } => TYPE_BIG_WRITE,
            Self::Stable { .. } => TYPE_STABLE,
            Self::Rollback { .. } => TYPE_ROLLBACK,
            Self::Delete { .. } => TYPE_DELETE,
        }
    }

    /// Serialized size including the header.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Start { .. } => START_SIZE,
            Self::SmallWrite { .. } => SMALL_WRITE_SIZE,
            Self::BigWrite { .. } => BIG_WRITE_SIZE,
            Self::Stable { .. } | Self::Rollback { .. } | Self::Delete { .. } => STABLE_SIZE,
        }
    }

    /// Serialize with the CRC chain link, returning the encoded bytes.
    /// The entry's own CRC lands at bytes 8..12.
    #[must_use]
    pub fn encode(&self, crc32_prev: u32) -> Vec<u8> {
        let size = self.size();
        let mut buf = Vec::with_capacity(size);
        buf.put_u32_le(JOURNAL_MAGIC);
        buf.put_u16_le(self.entry_type());
        buf.put_u16_le(size as u16);
        buf.put_u32_le(0); // crc32, patched below
        buf.put_u32_le(crc32_prev);
        match *self {
            Self::Start { journal_start } => {
                buf.put_u64_le(journal_start);
            }
            Self::SmallWrite {
                ov,
                offset,
                len,
                data_offset,
                crc32_data,
            } => {
                put_obj_ver(&mut buf, ov);
                buf.put_u32_le(offset);
                buf.put_u32_le(len);
                buf.put_u64_le(data_offset);
                buf.put_u32_le(crc32_data);
            }
            Self::BigWrite {
                ov,
                offset,
                len,
                location,
            } => {
                put_obj_ver(&mut buf, ov);
                buf.put_u32_le(offset);
                buf.put_u32_le(len);
                buf.put_u64_le(location);
            }
            Self::Stable { ov } | Self::Rollback { ov } | Self::Delete { ov } => {
                put_obj_ver(&mut buf, ov);
            }
        }
        debug_assert_eq!(buf.len(), size);
        let crc = entry_crc(&buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode and validate one entry at the start of `buf`.
    ///
    /// Returns `None` for anything that is not a well-formed entry: bad
    /// magic, unknown type, wrong size, or CRC mismatch.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<DecodedEntry> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return None;
        }
        let mut cursor = buf;
        let magic = cursor.get_u32_le();
        let entry_type = cursor.get_u16_le();
        let size = cursor.get_u16_le() as usize;
        let crc32 = cursor.get_u32_le();
        let crc32_prev = cursor.get_u32_le();
        if magic != JOURNAL_MAGIC {
            return None;
        }
        let expected_size = match entry_type {
            TYPE_START => START_SIZE,
            TYPE_SMALL_WRITE => SMALL_WRITE_SIZE,
            TYPE_BIG_WRITE => BIG_WRITE_SIZE,
            TYPE_STABLE | TYPE_ROLLBACK | TYPE_DELETE => STABLE_SIZE,
            _ => return None,
        };
        if size != expected_size || buf.len() < size {
            return None;
        }
        if entry_crc(&buf[..size]) != crc32 {
            return None;
        }
        let entry = match entry_type {
            TYPE_START => JournalEntry::Start {
                journal_start: cursor.get_u64_le(),
            },
            TYPE_SMALL_WRITE => JournalEntry::SmallWrite {
                ov: get_obj_ver(&mut cursor),
                offset: cursor.get_u32_le(),
                len: cursor.get_u32_le(),
                data_offset: cursor.get_u64_le(),
                crc32_data: cursor.get_u32_le(),
            },
            TYPE_BIG_WRITE => JournalEntry::BigWrite {
                ov: get_obj_ver(&mut cursor),
                offset: cursor.get_u32_le(),
                len: cursor.get_u32_le(),
                location: cursor.get_u64_le(),
            },
            TYPE_STABLE => JournalEntry::Stable {
                ov: get_obj_ver(&mut cursor),
            },
            TYPE_ROLLBACK => JournalEntry::Rollback {
                ov: get_obj_ver(&mut cursor),
            },
            TYPE_DELETE => JournalEntry::Delete {
                ov: get_obj_ver(&mut cursor),
            },
            _ => unreachable!(),
        };
        Some(DecodedEntry {
            entry,
            size,
            crc32,
            crc32_prev,
        })
    }
}

/// A validated entry plus its chain fields.
#[derive(Clone, Debug)]
pub struct DecodedEntry {
    pub entry: JournalEntry,
    pub size: usize,
    pub crc32: u32,
    pub crc32_prev: u32,
}

fn put_obj_ver(buf: &mut Vec<u8>, ov: ObjVer) {
    buf.put_u64_le(ov.oid.inode);
    buf.put_u64_le(ov.oid.stripe);
    buf.put_u64_le(ov.version);
}

fn get_obj_ver(cursor: &mut &[u8]) -> ObjVer {
    let inode = cursor.get_u64_le();
    let stripe = cursor.get_u64_le();
    let version = cursor.get_u64_le();
    ObjVer::new(ObjectId::new(inode, stripe), version)
}

/// Entry CRC: everything except the crc32 field itself.
#[must_use]
pub fn entry_crc(buf: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&buf[..8]);
    crc32c::crc32c_append(crc, &buf[12..])
}

/// One in-memory sector buffer.
struct SectorInfo {
    /// Byte offset of the sector within the journal region.
    offset: u64,
    /// Entries staged in memory, not yet handed to the device.
    dirty: bool,
    /// Some content of this sector is (or was) in flight; the sector is
    /// closed to further entries.
    written: bool,
    /// Pending device writes referencing this buffer.
    usage_count: u32,
    buf: Vec<u8>,
}

/// Outcome of a journal space reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalCheck {
    /// Reservation fits; `sectors_to_write` counts the sector writes the
    /// caller will submit (a dirty sector already in memory counts as one).
    Fits { sectors_to_write: usize },
    /// The next sector buffer is still owned by an unfinished write.
    WaitBuffer,
    /// No space before the tail; wait until `used_start` moves.
    WaitJournal { used_start: u64 },
}

/// In-memory journal state.
pub struct Journal {
    /// Byte offset of the journal region on its device.
    pub offset: u64,
    /// Total region length including block 0.
    pub len: u64,
    /// Sector size.
    pub block_size: u64,
    /// Tail of the used region (first byte still referenced).
    pub used_start: u64,
    /// Head: next byte to be handed out.
    pub next_free: u64,
    /// CRC of the last appended entry; seed for the next chain link.
    pub crc32_last: u32,
    /// sector offset -> number of dirty entries referencing it.
    pub used_sectors: BTreeMap<u64, u64>,
    sectors: Vec<SectorInfo>,
    cur_sector: usize,
    in_sector_pos: u64,
}

impl Journal {
    /// Create the in-memory state for an empty journal.
    #[must_use]
    pub fn new(offset: u64, len: u64, block_size: u64) -> Self {
        let sectors = (0..SECTOR_BUFFER_COUNT)
            .map(|_| SectorInfo {
                offset: 0,
                dirty: false,
                written: false,
                usage_count: 0,
                buf: vec![0u8; block_size as usize],
            })
            .collect();
        Self {
            offset,
            len,
            block_size,
            used_start: block_size,
            next_free: block_size,
            crc32_last: 0,
            used_sectors: BTreeMap::new(),
            sectors,
            cur_sector: 0,
            // Force the first append to open a fresh sector.
            in_sector_pos: block_size,
        }
    }

    /// Reposition after recovery. The current sector is closed: replayed
    /// sectors are on disk and are never appended to again.
    pub fn reset_position(&mut self, used_start: u64, next_free: u64, crc32_last: u32) {
        self.used_start = used_start;
        self.next_free = next_free;
        self.crc32_last = crc32_last;
        self.in_sector_pos = self.block_size;
    }

    /// Current sector index.
    #[must_use]
    pub fn cur_sector(&self) -> usize {
        self.cur_sector
    }

    /// Whether the current sector has staged entries not yet submitted.
    #[must_use]
    pub fn cur_sector_dirty(&self) -> bool {
        self.sectors[self.cur_sector].dirty
    }

    /// Journal region offset of a sector buffer.
    #[must_use]
    pub fn sector_offset(&self, idx: usize) -> u64 {
        self.sectors[idx].offset
    }

    fn entry_fits(&self, size: usize) -> bool {
        let s = &self.sectors[self.cur_sector];
        !s.written && self.in_sector_pos + size as u64 <= self.block_size
    }

    /// Make room for an entry of `size` bytes in the current sector,
    /// opening a new sector if needed. Returns the index of the previous
    /// sector if it was closed with staged entries still unsubmitted; the
    /// caller must submit that sector's write.
    ///
    /// Space and buffer availability must have been checked beforehand with
    /// [`check_available`].
    pub fn ensure_entry_room(&mut self, size: usize) -> Option<usize> {
        if self.entry_fits(size) {
            return None;
        }
        let prev = self.cur_sector;
        let closed = if self.sectors[prev].dirty { Some(prev) } else { None };
        // Move to the next memory buffer only when this one is still owned
        // (staged entries or a pending write); a submitted-and-completed
        // buffer is reused in place. Mirrors the accounting in
        // `check_available`.
        let prev_busy = {
            let s = &self.sectors[prev];
            s.dirty || s.usage_count > 0
        };
        if prev_busy {
            self.cur_sector = (prev + 1) % self.sectors.len();
        }
        let next_free = self.next_free;
        let s = &mut self.sectors[self.cur_sector];
        debug_assert!(!s.dirty && s.usage_count == 0, "sector buffer still owned");
        s.offset = next_free;
        s.written = false;
        s.buf.fill(0);
        self.in_sector_pos = 0;
        self.next_free += self.block_size;
        if self.next_free >= self.len {
            self.next_free = self.block_size;
        }
        closed
    }

    /// Append an entry to the current sector, advancing the CRC chain.
    /// Returns the offset of the sector holding the entry.
    pub fn push_entry(&mut self, entry: &JournalEntry) -> u64 {
        let bytes = entry.encode(self.crc32_last);
        assert!(
            self.entry_fits(bytes.len()),
            "journal entry does not fit in the current sector"
        );
        let pos = self.in_sector_pos as usize;
        let s = &mut self.sectors[self.cur_sector];
        s.buf[pos..pos + bytes.len()].copy_from_slice(&bytes);
        s.dirty = true;
        let sector_offset = s.offset;
        self.in_sector_pos += bytes.len() as u64;
        self.crc32_last = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        sector_offset
    }

    /// Reserve room for a small-write payload right after the entry
    /// sectors. The payload never wraps mid-way: if it does not fit before
    /// the end of the region it starts over at block 1.
    pub fn reserve_data(&mut self, len: u32) -> u64 {
        let len = u64::from(len);
        if len == 0 {
            return self.next_free;
        }
        if self.next_free + len > self.len {
            self.next_free = self.block_size;
        }
        let location = self.next_free;
        self.next_free += len;
        if self.next_free >= self.len {
            self.next_free = self.block_size;
        }
        location
    }

    /// Close the sector for submission: staged entries stop accumulating
    /// and the buffer is pinned until the write completes. Returns the
    /// device byte offset and a snapshot of the sector contents.
    pub fn prepare_sector_write(&mut self, idx: usize) -> (u64, Vec<u8>) {
        let s = &mut self.sectors[idx];
        s.dirty = false;
        s.written = true;
        s.usage_count += 1;
        (self.offset + s.offset, s.buf.clone())
    }

    /// Release the buffer pin taken by [`prepare_sector_write`].
    pub fn release_sector(&mut self, idx: usize) {
        let s = &mut self.sectors[idx];
        debug_assert!(s.usage_count > 0);
        s.usage_count -= 1;
    }

    /// Free journal bytes (the region can never be fully filled: one block
    /// is kept free to distinguish empty from full).
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        if self.next_free >= self.used_start {
            self.len - self.block_size - (self.next_free - self.used_start)
        } else {
            self.used_start - self.next_free
        }
    }

    /// Advance `used_start` past sectors no dirty entry references anymore.
    /// Returns true if the tail actually moved; the caller then rewrites
    /// the superblock.
    pub fn trim(&mut self) -> bool {
        let first_used = self.used_sectors.range(self.used_start..).next().map(|(&o, _)| o);
        let new_start = match first_used {
            Some(first) => first,
            None => match self.used_sectors.keys().next() {
                // Used region wrapped; resume at the first referenced sector.
                Some(&first) => first,
                // Journal is empty.
                None => self.next_free,
            },
        };
        if new_start == self.used_start {
            return false;
        }
        self.used_start = new_start;
        debug!(
            used_start = self.used_start,
            next_free = self.next_free,
            free_bytes = self.free_bytes(),
            "journal trimmed"
        );
        true
    }

    /// Contents of the superblock sector for the current tail: one START
    /// entry, zero-padded to a full block.
    #[must_use]
    pub fn encode_start_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; self.block_size as usize];
        let entry = JournalEntry::Start {
            journal_start: self.used_start,
        };
        let bytes = entry.encode(0);
        block[..bytes.len()].copy_from_slice(&bytes);
        block
    }
}

/// Check whether `required` entries of `entry_size` bytes plus `data_after`
/// payload bytes can be reserved without catching up with the tail.
#[must_use]
pub fn check_available(
    journal: &Journal,
    required: usize,
    entry_size: usize,
    data_after: usize,
) -> JournalCheck {
    // The head catching up with the tail exactly is only distinguishable
    // from an empty journal by the live entry references.
    if journal.next_free == journal.used_start && !journal.used_sectors.is_empty() {
        return JournalCheck::WaitJournal {
            used_start: journal.used_start,
        };
    }
    let mut required = required as i64;
    let mut sectors_required = 0usize;
    let mut next_pos = journal.next_free;
    let mut next_sector = journal.cur_sector;
    let mut next_in_pos = if journal.sectors[journal.cur_sector].written {
        journal.block_size
    } else {
        journal.in_sector_pos
    };
    let mut right_dir = next_pos >= journal.used_start;

    loop {
        let fits = ((journal.block_size - next_in_pos) / entry_size as u64) as i64;
        if fits > 0 {
            required -= fits;
            next_in_pos += fits as u64 * entry_size as u64;
            sectors_required += 1;
        } else if journal.sectors[next_sector].dirty {
            // Already-staged sector the caller will have to write out.
            sectors_required += 1;
        }
        if required <= 0 {
            break;
        }
        next_pos += journal.block_size;
        if next_pos >= journal.len {
            next_pos = journal.block_size;
            right_dir = false;
        }
        next_in_pos = 0;
        let busy = |s: &SectorInfo| s.dirty || s.usage_count > 0;
        if busy(&journal.sectors[next_sector]) {
            next_sector = (next_sector + 1) % journal.sectors.len();
        }
        if busy(&journal.sectors[next_sector]) {
            debug!(sector = next_sector, "journal sector buffer still in use");
            return JournalCheck::WaitBuffer;
        }
    }
    if data_after > 0 {
        next_pos += data_after as u64;
        if next_pos > journal.len {
            next_pos = journal.block_size + data_after as u64;
            right_dir = false;
        }
    }
    if !right_dir && next_pos >= journal.used_start - journal.block_size {
        debug!(free_bytes = journal.free_bytes(), "journal is out of space");
        return JournalCheck::WaitJournal {
            used_start: journal.used_start,
        };
    }
    JournalCheck::Fits {
        sectors_to_write: sectors_required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_journal() -> Journal {
        // 16 blocks of 4096 (block 0 is the superblock)
        Journal::new(0, 16 * 4096, 4096)
    }

    fn ov(inode: u64, version: u64) -> ObjVer {
        ObjVer::new(ObjectId::new(inode, 0), version)
    }

    #[test]
    fn test_entry_roundtrip() {
        let entry = JournalEntry::SmallWrite {
            ov: ov(3, 7),
            offset: 4096,
            len: 8192,
            data_offset: 12288,
            crc32_data: 0xDEAD_BEEF,
        };
        let bytes = entry.encode(0x1234_5678);
        assert_eq!(bytes.len(), SMALL_WRITE_SIZE);

        let decoded = JournalEntry::decode(&bytes).unwrap();
        assert_eq!(decoded.entry, entry);
        assert_eq!(decoded.crc32_prev, 0x1234_5678);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let entry = JournalEntry::Stable { ov: ov(1, 1) };
        let mut bytes = entry.encode(0);
        bytes[20] ^= 0xff;
        assert!(JournalEntry::decode(&bytes).is_none());

        let bytes = entry.encode(0);
        assert!(JournalEntry::decode(&bytes[..STABLE_SIZE - 1]).is_none());
        assert!(JournalEntry::decode(&[0u8; 64]).is_none());
    }

    #[test]
    fn test_crc_chain() {
        let mut journal = test_journal();
        journal.ensure_entry_room(STABLE_SIZE);
        journal.push_entry(&JournalEntry::Stable { ov: ov(1, 1) });
        let first_crc = journal.crc32_last;
        journal.push_entry(&JournalEntry::Stable { ov: ov(1, 2) });

        let buf = journal.sectors[journal.cur_sector].buf.clone();
        let e0 = JournalEntry::decode(&buf).unwrap();
        let e1 = JournalEntry::decode(&buf[e0.size..]).unwrap();
        assert_eq!(e0.crc32, first_crc);
        assert_eq!(e1.crc32_prev, e0.crc32);
    }

    #[test]
    fn test_sector_advance_and_close() {
        let mut journal = test_journal();
        // First append opens a sector at next_free.
        assert_eq!(journal.ensure_entry_room(STABLE_SIZE), None);
        assert_eq!(journal.sector_offset(journal.cur_sector()), 4096);
        journal.push_entry(&JournalEntry::Stable { ov: ov(1, 1) });

        // A submitted sector takes no further entries.
        let idx = journal.cur_sector();
        journal.prepare_sector_write(idx);
        let closed = journal.ensure_entry_room(STABLE_SIZE);
        assert_eq!(closed, None); // was already submitted, nothing left to flush
        assert_ne!(journal.cur_sector(), idx);
        assert_eq!(journal.sector_offset(journal.cur_sector()), 8192);
    }

    #[test]
    fn test_closing_dirty_sector_reports_it() {
        let mut journal = test_journal();
        journal.ensure_entry_room(STABLE_SIZE);
        // 4096 / 40 = 102 entries fill the sector.
        for v in 0..102 {
            journal.push_entry(&JournalEntry::Stable { ov: ov(1, v) });
        }
        let dirty_idx = journal.cur_sector();
        let closed = journal.ensure_entry_room(STABLE_SIZE);
        assert_eq!(closed, Some(dirty_idx));
    }

    #[test]
    fn test_reserve_data_wraps_whole() {
        let mut journal = test_journal();
        journal.next_free = 15 * 4096;
        let loc = journal.reserve_data(8192);
        // 8 KiB does not fit before the end; payload restarts at block 1.
        assert_eq!(loc, 4096);
        assert_eq!(journal.next_free, 4096 + 8192);
    }

    #[test]
    fn test_check_available_detects_full() {
        let mut journal = test_journal();
        journal.used_start = 2 * 4096;
        journal.next_free = 4096; // wrapped right behind the tail

        match check_available(&journal, 1, STABLE_SIZE, 0) {
            JournalCheck::WaitJournal { used_start } => assert_eq!(used_start, 2 * 4096),
            other => panic!("expected WaitJournal, got {:?}", other),
        }
    }

    #[test]
    fn test_check_available_counts_sectors() {
        let journal = test_journal();
        // 300 stable entries at 40 bytes: 102 per sector -> 3 sectors.
        match check_available(&journal, 300, STABLE_SIZE, 0) {
            JournalCheck::Fits { sectors_to_write } => assert_eq!(sectors_to_write, 3),
            other => panic!("expected Fits, got {:?}", other),
        }
    }

    #[test]
    fn test_trim() {
        let mut journal = test_journal();
        journal.used_start = 4096;
        journal.next_free = 5 * 4096;
        journal.used_sectors.insert(3 * 4096, 2);

        assert!(journal.trim());
        assert_eq!(journal.used_start, 3 * 4096);
        // Nothing to advance past now.
        assert!(!journal.trim());

        journal.used_sectors.clear();
        assert!(journal.trim());
        assert_eq!(journal.used_start, journal.next_free);
    }

    #[test]
    fn test_start_block() {
        let mut journal = test_journal();
        journal.used_start = 3 * 4096;
        let block = journal.encode_start_block();
        assert_eq!(block.len(), 4096);
        let decoded = JournalEntry::decode(&block).unwrap();
        assert_eq!(
            decoded.entry,
            JournalEntry::Start {
                journal_start: 3 * 4096
            }
        );
    }
}
