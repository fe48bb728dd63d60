//! Startup recovery: metadata load and journal replay.
//!
//! Runs before any operation is accepted, reading directly from the
//! devices. The metadata region rebuilds the clean index and the block
//! bitmap; the journal is then replayed forward from its START anchor,
//! rebuilding the dirty index exactly as the pre-crash engine had it for
//! everything that reached the device. Replay stops at the first entry
//! that fails validation (magic, CRC, or chain break); a small write whose
//! payload CRC does not match is corruption from a torn write, so the rest
//! of its sector is zeroed on disk and the journal truncates there.

use crate::flusher::Flusher;
use crate::index::{CleanEntry, DirtyEntry, DirtyState, EntryKind, EntryPhase};
use crate::journal::JournalEntry;
use crate::layout::decode_clean_entry;
use crate::raw_io::AlignedBuffer;
use crate::store::Core;
use blockio_common::{Error, ObjVer, Result};
use std::ops::Bound;
use tracing::{debug, info};

/// Chunk size for the sequential metadata scan.
const META_CHUNK: usize = 1024 * 1024;

pub(crate) fn load(core: &mut Core, flusher: &mut Flusher) -> Result<()> {
    load_meta(core)?;
    load_journal(core, flusher)?;
    Ok(())
}

fn load_meta(core: &mut Core) -> Result<()> {
    let layout = core.layout.clone();
    let entry_size = layout.clean_entry_size;
    let bitmap_size = layout.clean_entry_bitmap_size;
    let meta_block = layout.meta_block_size as usize;
    let mut chunk = AlignedBuffer::new(META_CHUNK - META_CHUNK % meta_block);
    let mut entries_loaded = 0u64;

    let mut read_pos = 0u64;
    while read_pos < layout.meta_len {
        let len = chunk.len().min((layout.meta_len - read_pos) as usize);
        core.meta_file
            .read_at(layout.meta_offset + read_pos, &mut chunk.as_mut_slice()[..len])?;
        if let Some(region) = core.meta_buffer.as_mut() {
            region[read_pos as usize..read_pos as usize + len]
                .copy_from_slice(&chunk.as_slice()[..len]);
        }

        for sector_start in (0..len).step_by(meta_block) {
            let sector_index = (read_pos as usize + sector_start) / meta_block;
            let base_block = sector_index as u64 * layout.entries_per_meta_block as u64;
            for pos in 0..layout.entries_per_meta_block {
                let block = base_block + pos as u64;
                if block >= layout.block_count {
                    break;
                }
                let raw = &chunk.as_slice()[sector_start + pos * entry_size..][..entry_size];
                if core.meta_buffer.is_none() {
                    let dst = block as usize * bitmap_size;
                    core.clean_bitmaps[dst..dst + bitmap_size].copy_from_slice(
                        &raw[crate::layout::CLEAN_ENTRY_HEADER_SIZE..][..bitmap_size],
                    );
                }
                let (oid, version) = decode_clean_entry(raw);
                if oid.inode == 0 {
                    continue;
                }
                // A crash during a metadata rewrite can leave the object in
                // two slots; the higher version wins, the loser's block is
                // free again.
                if let Some(existing) = core.clean_db.get(&oid) {
                    if existing.version >= version {
                        continue;
                    }
                    core.alloc.set(layout.block_of(existing.location), false);
                }
                core.alloc.set(block, true);
                core.clean_db.insert(
                    oid,
                    CleanEntry {
                        version,
                        location: layout.location_of(block),
                    },
                );
                entries_loaded += 1;
            }
        }
        read_pos += len as u64;
    }

    info!(
        entries_loaded,
        free_blocks = core.alloc.free_count(),
        total_blocks = layout.block_count,
        "metadata loaded"
    );
    Ok(())
}

fn load_journal(core: &mut Core, flusher: &mut Flusher) -> Result<()> {
    let block_size = core.journal.block_size;
    let bs = block_size as usize;
    let journal_offset = core.journal.offset;
    let mut block0 = AlignedBuffer::new(bs);
    core.journal_file
        .read_at(journal_offset, &mut block0.as_mut_slice()[..bs])?;

    if block0.as_slice()[..bs].iter().all(|&b| b == 0) {
        // Never used: lay down a fresh anchor.
        core.journal.reset_position(block_size, block_size, 0);
        if core.cfg.readonly {
            info!("empty journal left untouched (readonly)");
        } else {
            let mut init = AlignedBuffer::new(2 * bs);
            let start = JournalEntry::Start {
                journal_start: block_size,
            }
            .encode(0);
            init.as_mut_slice()[..start.len()].copy_from_slice(&start);
            core.journal_file
                .write_at(journal_offset, &init.as_slice()[..2 * bs])?;
            if !core.cfg.disable_journal_fsync {
                core.journal_file.sync_data()?;
            }
            info!("journal initialized");
        }
        return Ok(());
    }

    let decoded = JournalEntry::decode(block0.as_slice())
        .ok_or_else(|| Error::corrupt("first journal entry is corrupt"))?;
    let JournalEntry::Start { journal_start } = decoded.entry else {
        return Err(Error::corrupt("journal block 0 does not hold a START entry"));
    };
    if journal_start < block_size || journal_start >= core.journal.len {
        return Err(Error::corrupt("journal START points outside the region"));
    }

    let mut replay = Replay {
        used_start: journal_start,
        next_free: journal_start,
        crc32_last: 0,
        started: false,
        entries_loaded: 0u64,
    };
    let mut sector = AlignedBuffer::new(bs);
    let mut wrapped = false;
    // Entry sectors plus payload space can never exceed the region, so
    // this bounds a replay of even a fully packed journal.
    let mut sectors_left = 2 * (core.journal.len / block_size) + 2;

    'replay: loop {
        if sectors_left == 0 {
            return Err(Error::corrupt("journal replay did not terminate"));
        }
        sectors_left -= 1;
        let proc_pos = replay.next_free;
        if wrapped && proc_pos >= replay.used_start {
            break;
        }
        replay.next_free += block_size;
        if replay.next_free >= core.journal.len {
            replay.next_free = block_size;
            wrapped = true;
        }
        core.journal_file
            .read_at(journal_offset + proc_pos, &mut sector.as_mut_slice()[..bs])?;

        let mut in_pos = 0usize;
        while in_pos + crate::journal::ENTRY_HEADER_SIZE <= bs {
            let Some(entry) = JournalEntry::decode(&sector.as_slice()[in_pos..bs]) else {
                if in_pos == 0 {
                    // Invalid right at the sector start: the journal ends here.
                    replay.next_free = proc_pos;
                    break 'replay;
                }
                // Partially filled sector; the journal continues in the next.
                break;
            };
            if replay.started && entry.crc32_prev != replay.crc32_last {
                if in_pos == 0 {
                    replay.next_free = proc_pos;
                    break 'replay;
                }
                break;
            }
            match entry.entry {
                JournalEntry::Start { .. } => {
                    // Only block 0 holds a START; anything else is stale.
                    if in_pos == 0 {
                        replay.next_free = proc_pos;
                        break 'replay;
                    }
                    break;
                }
                JournalEntry::SmallWrite {
                    ov,
                    offset,
                    len,
                    data_offset,
                    crc32_data,
                } => {
                    let prev_free = replay.next_free;
                    if replay.next_free + u64::from(len) > core.journal.len {
                        replay.next_free = block_size;
                        wrapped = true;
                    }
                    let location = replay.next_free;
                    replay.next_free += u64::from(len);
                    if replay.next_free >= core.journal.len {
                        replay.next_free = block_size;
                        wrapped = true;
                    }
                    if location != data_offset {
                        return Err(Error::corrupt(format!(
                            "journal data offset mismatch: computed {}, stored {}",
                            location, data_offset
                        )));
                    }
                    if !payload_crc_matches(core, journal_offset, location, len, crc32_data)? {
                        // Torn payload: zero the rest of this sector on
                        // disk and truncate the journal before the entry.
                        debug!(ov = %ov, "corrupt small-write payload; truncating journal");
                        if !core.cfg.readonly {
                            let mut rewrite = AlignedBuffer::new(bs);
                            rewrite.as_mut_slice()[..in_pos]
                                .copy_from_slice(&sector.as_slice()[..in_pos]);
                            core.journal_file
                                .write_at(journal_offset + proc_pos, &rewrite.as_slice()[..bs])?;
                            if !core.cfg.disable_journal_fsync {
                                core.journal_file.sync_data()?;
                            }
                        }
                        // A fully corrupt sector is reused outright so the
                        // entry chain stays contiguous for a later replay;
                        // a valid prefix keeps its sector and new entries
                        // start after it.
                        replay.next_free = if in_pos == 0 { proc_pos } else { prev_free };
                        break 'replay;
                    }
                    let newer_than_clean = core
                        .clean_db
                        .get(&ov.oid)
                        .map_or(true, |c| c.version < ov.version);
                    if newer_than_clean {
                        core.dirty_db.insert(
                            ov,
                            DirtyEntry {
                                state: DirtyState::new(EntryKind::Small, EntryPhase::Synced),
                                location,
                                offset,
                                len,
                                journal_sector: proc_pos,
                            },
                        );
                        *core.journal.used_sectors.entry(proc_pos).or_insert(0) += 1;
                        let unstable = core.unstable_writes.entry(ov.oid).or_insert(0);
                        *unstable = (*unstable).max(ov.version);
                    }
                }
                JournalEntry::BigWrite {
                    ov,
                    offset,
                    len,
                    location,
                } => {
                    let newer_than_clean = core
                        .clean_db
                        .get(&ov.oid)
                        .map_or(true, |c| c.version < ov.version);
                    if newer_than_clean {
                        core.dirty_db.insert(
                            ov,
                            DirtyEntry {
                                state: DirtyState::new(EntryKind::Big, EntryPhase::Synced),
                                location,
                                offset,
                                len,
                                journal_sector: proc_pos,
                            },
                        );
                        core.alloc.set(core.layout.block_of(location), true);
                        *core.journal.used_sectors.entry(proc_pos).or_insert(0) += 1;
                        let unstable = core.unstable_writes.entry(ov.oid).or_insert(0);
                        *unstable = (*unstable).max(ov.version);
                    }
                }
                JournalEntry::Stable { ov } => replay_stable(core, flusher, ov),
                JournalEntry::Rollback { ov } => replay_rollback(core, ov),
                JournalEntry::Delete { ov } => {
                    core.dirty_db.insert(
                        ov,
                        DirtyEntry {
                            state: DirtyState::new(EntryKind::Delete, EntryPhase::Synced),
                            location: 0,
                            offset: 0,
                            len: 0,
                            journal_sector: proc_pos,
                        },
                    );
                    *core.journal.used_sectors.entry(proc_pos).or_insert(0) += 1;
                }
            }
            replay.started = true;
            replay.crc32_last = entry.crc32;
            replay.entries_loaded += 1;
            in_pos += entry.size;
        }
    }

    core.journal
        .reset_position(replay.used_start, replay.next_free, replay.crc32_last);
    // Drop sectors whose referencing entries were all superseded already.
    core.journal.trim();
    info!(
        entries_loaded = replay.entries_loaded,
        free_bytes = core.journal.free_bytes(),
        used_start = core.journal.used_start,
        next_free = core.journal.next_free,
        free_blocks = core.alloc.free_count(),
        "journal replayed"
    );
    Ok(())
}

struct Replay {
    used_start: u64,
    next_free: u64,
    crc32_last: u32,
    started: bool,
    entries_loaded: u64,
}

fn payload_crc_matches(
    core: &Core,
    journal_offset: u64,
    location: u64,
    len: u32,
    expected: u32,
) -> Result<bool> {
    if len == 0 {
        return Ok(expected == 0);
    }
    let alignment = u64::from(core.layout.disk_alignment);
    if location % alignment != 0 || u64::from(len) % alignment != 0 {
        // A legit entry always carries an aligned payload.
        return Ok(false);
    }
    let mut buf = AlignedBuffer::new(len as usize);
    core.journal_file
        .read_at(journal_offset + location, &mut buf.as_mut_slice()[..len as usize])?;
    Ok(crc32c::crc32c(&buf.as_slice()[..len as usize]) == expected)
}

/// STABLE replay: promote the matching dirty entry and everything below it.
/// A STABLE for an unknown version means the journal was trimmed between
/// the write and its STABLE record; it is skipped.
fn replay_stable(core: &mut Core, flusher: &mut Flusher, ov: ObjVer) {
    if core.dirty_db.get(&ov).is_none() {
        debug!(ov = %ov, "STABLE for unknown dirty version; skipping");
    } else {
        let floor = ObjVer::new(ov.oid, 0);
        for (_, entry) in core.dirty_db.range_mut(floor..=ov).rev() {
            if entry.state.is_stable() {
                break;
            }
            entry.state.phase = EntryPhase::Stable;
        }
        flusher.enqueue(ov);
    }
    if let Some(&unstable) = core.unstable_writes.get(&ov.oid) {
        if unstable <= ov.version {
            core.unstable_writes.remove(&ov.oid);
        }
    }
}

/// ROLLBACK replay: drop unstable versions above the target.
fn replay_rollback(core: &mut Core, ov: ObjVer) {
    let keys: Vec<ObjVer> = core
        .dirty_db
        .range((
            Bound::Excluded(ObjVer::new(ov.oid, ov.version)),
            Bound::Included(ObjVer::new(ov.oid, u64::MAX)),
        ))
        .filter(|(_, e)| !e.state.is_stable())
        .map(|(&key, _)| key)
        .collect();
    core.erase_dirty(&keys, None);

    let max_unstable = core
        .dirty_db
        .range(crate::index::object_range(ov.oid))
        .filter(|(_, e)| e.state.phase == EntryPhase::Synced)
        .map(|(key, _)| key.version)
        .max();
    match max_unstable {
        Some(version) => {
            core.unstable_writes.insert(ov.oid, version);
        }
        None => {
            core.unstable_writes.remove(&ov.oid);
        }
    }
}
