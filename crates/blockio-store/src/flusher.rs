//! Background flusher.
//!
//! Workers drain stabilized journal state into its final home: small-write
//! payloads are copied from the journal onto the object's data block, the
//! metadata sector is rewritten with the new version and bitmap, and the
//! superseded dirty entries are dropped, releasing journal space. Every
//! `trim_interval` completed flushes the journal tail is advanced and the
//! START superblock rewritten.
//!
//! One object is never flushed by two workers at once: a worker claims the
//! object in `sync_to_repeat`; a later stabilize for the same object only
//! raises the recorded version, and the active worker re-enqueues it when
//! it finishes. Fsyncs are batched: workers arriving at a data- or
//! metadata-fsync point join a shared batch, one of them issues the fsync
//! once the batch is large enough (or the queue ran dry), and all of them
//! wake on its completion.
//!
//! Workers only start new objects when the queue exceeds the sync
//! threshold or the engine force-starts them because the journal is full.

use crate::index::{CleanEntry, EntryKind};
use crate::layout::{bitmap_set, encode_clean_entry};
use crate::ring::{IoOwner, IoTarget};
use crate::store::Core;
use blockio_common::{ObjVer, ObjectId};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

// Completion tags: payload << 3 | kind.
const TAG_COPY: u64 = 1;
const TAG_META_READ: u64 = 2;
const TAG_WAIT: u64 = 3;
const TAG_FSYNC: u64 = 4;

fn tag(kind: u64, payload: u64) -> u64 {
    payload << 3 | kind
}

/// A journal range to copy onto the data block.
struct CopyBuffer {
    offset: u32,
    len: u32,
    journal_offset: u64,
    buf: Option<Vec<u8>>,
}

/// Shared metadata sector, reference-counted across workers.
struct MetaSector {
    ready: bool,
    buf: Vec<u8>,
    usage_count: u32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct MetaRef {
    sector: u64,
    pos: usize,
}

/// A pending batched fsync.
struct FsyncBatch {
    meta: bool,
    ready_count: usize,
    /// 0 = collecting, 1 = fsync in flight, 2 = done.
    state: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Idle,
    /// Decide the target block (may wait for a free one).
    ResolveBase,
    /// Submit journal -> memory copy reads.
    SubmitCopies,
    WaitCopies,
    /// Acquire (and possibly read) the metadata sectors.
    MetaReads,
    SubmitDataWrites,
    WaitDataWrites,
    DataFsync,
    SubmitMetaWrites,
    WaitMetaWrites,
    MetaFsync,
    /// Final index updates, then possibly a journal trim.
    UpdateState,
    WaitTrim,
}

pub(crate) struct FlushWorker {
    idx: usize,
    state: WorkerState,
    cur: ObjVer,
    copies: Vec<CopyBuffer>,
    dirty_keys: Vec<ObjVer>,
    wait_count: u32,
    clean_loc: Option<u64>,
    old_clean_loc: Option<u64>,
    has_delete: bool,
    has_empty: bool,
    delete_below: bool,
    fresh_block: bool,
    init_bitmap: Option<(u32, u32)>,
    meta_new: Option<MetaRef>,
    meta_old: Option<MetaRef>,
    batch_id: Option<u64>,
}

impl FlushWorker {
    fn new(idx: usize) -> Self {
        Self {
            idx,
            state: WorkerState::Idle,
            cur: ObjVer::new(ObjectId::new(0, 0), 0),
            copies: Vec::new(),
            dirty_keys: Vec::new(),
            wait_count: 0,
            clean_loc: None,
            old_clean_loc: None,
            has_delete: false,
            has_empty: false,
            delete_below: false,
            fresh_block: false,
            init_bitmap: None,
            meta_new: None,
            meta_old: None,
            batch_id: None,
        }
    }

    /// Advance as far as current conditions allow. Returns whether any
    /// progress was made.
    fn step(&mut self, flusher: &mut Flusher, core: &mut Core) -> bool {
        let mut progress = false;
        loop {
            match self.state {
                WorkerState::Idle => {
                    if !self.pick_object(flusher, core) {
                        return progress;
                    }
                    progress = true;
                }
                WorkerState::ResolveBase => {
                    if !self.resolve_base(flusher, core) {
                        return progress;
                    }
                    progress = true;
                }
                WorkerState::SubmitCopies => {
                    if self.copies.is_empty() {
                        self.state = WorkerState::MetaReads;
                        continue;
                    }
                    if !core.ring.has_slots(self.copies.len()) {
                        return progress;
                    }
                    for (i, copy) in self.copies.iter().enumerate() {
                        core.submit_read(
                            IoTarget::Journal,
                            core.journal.offset + copy.journal_offset,
                            copy.len as usize,
                            IoOwner::Flusher(self.idx),
                            tag(TAG_COPY, i as u64),
                        );
                    }
                    self.wait_count = self.copies.len() as u32;
                    self.state = WorkerState::WaitCopies;
                    progress = true;
                }
                WorkerState::WaitCopies => {
                    if self.wait_count > 0 {
                        return progress;
                    }
                    self.state = WorkerState::MetaReads;
                }
                WorkerState::MetaReads => {
                    if !self.acquire_meta_sectors(flusher, core) {
                        return progress;
                    }
                    self.state = WorkerState::SubmitDataWrites;
                }
                WorkerState::SubmitDataWrites => {
                    let clean_loc = self.clean_loc.expect("flush target resolved");
                    if self.has_delete || self.copies.is_empty() && !self.fresh_block {
                        // Big-write base or metadata-only change: the data
                        // is already in place.
                        self.state = WorkerState::SubmitMetaWrites;
                        continue;
                    }
                    let io_count = if self.fresh_block { 1 } else { self.copies.len() };
                    if !core.ring.has_slots(io_count) {
                        return progress;
                    }
                    if self.fresh_block {
                        // Journal-only object: lay the copies over a zeroed
                        // block so untouched ranges read back as zeros.
                        let mut block = vec![0u8; core.layout.block_size as usize];
                        for copy in &self.copies {
                            let buf = copy.buf.as_ref().expect("copy read done");
                            let start = copy.offset as usize;
                            block[start..start + copy.len as usize].copy_from_slice(buf);
                        }
                        core.submit_write(
                            IoTarget::Data,
                            core.layout.data_offset + clean_loc,
                            block,
                            IoOwner::Flusher(self.idx),
                            tag(TAG_WAIT, 0),
                        );
                    } else {
                        for copy in &mut self.copies {
                            let buf = copy.buf.take().expect("copy read done");
                            core.submit_write(
                                IoTarget::Data,
                                core.layout.data_offset + clean_loc + u64::from(copy.offset),
                                buf,
                                IoOwner::Flusher(self.idx),
                                tag(TAG_WAIT, 0),
                            );
                        }
                    }
                    self.wait_count = io_count as u32;
                    self.state = WorkerState::WaitDataWrites;
                    progress = true;
                }
                WorkerState::WaitDataWrites => {
                    if self.wait_count > 0 {
                        return progress;
                    }
                    self.state = WorkerState::DataFsync;
                }
                WorkerState::DataFsync => {
                    if !flusher.fsync_batch_step(core, self, false) {
                        return progress;
                    }
                    self.state = WorkerState::SubmitMetaWrites;
                    progress = true;
                }
                WorkerState::SubmitMetaWrites => {
                    if !self.submit_meta_writes(flusher, core) {
                        return progress;
                    }
                    self.state = WorkerState::WaitMetaWrites;
                    progress = true;
                }
                WorkerState::WaitMetaWrites => {
                    if self.wait_count > 0 {
                        return progress;
                    }
                    self.state = WorkerState::MetaFsync;
                }
                WorkerState::MetaFsync => {
                    if !flusher.fsync_batch_step(core, self, true) {
                        return progress;
                    }
                    self.state = WorkerState::UpdateState;
                    progress = true;
                }
                WorkerState::UpdateState => {
                    self.update_clean_db(flusher, core);
                    core.stats.flushes += 1;
                    flusher.trim_counter += 1;
                    // The last flush of a forced run always trims: the
                    // force came from a full journal, and waiting for the
                    // trim interval could leave it full.
                    let trim_due = flusher.trim_counter >= flusher.trim_interval
                        || flusher.start_forced && flusher.flush_queue.is_empty();
                    if trim_due && core.ring.has_slots(2) {
                        flusher.trim_counter = 0;
                        if core.journal.trim() {
                            let block = core.journal.encode_start_block();
                            core.submit_write(
                                IoTarget::Journal,
                                core.journal.offset,
                                block,
                                IoOwner::Flusher(self.idx),
                                tag(TAG_WAIT, 0),
                            );
                            self.wait_count = 1;
                            if !core.cfg.disable_journal_fsync {
                                core.submit_fsync(
                                    IoTarget::Journal,
                                    IoOwner::Flusher(self.idx),
                                    tag(TAG_WAIT, 0),
                                );
                                self.wait_count += 1;
                            }
                            core.stats.journal_trims += 1;
                            self.state = WorkerState::WaitTrim;
                            progress = true;
                            continue;
                        }
                    }
                    self.finish_object(flusher);
                    return true;
                }
                WorkerState::WaitTrim => {
                    if self.wait_count > 0 {
                        return progress;
                    }
                    self.finish_object(flusher);
                    return true;
                }
            }
        }
    }

    /// Claim the next queued object and scan its dirty history.
    /// Returns false when there is nothing to start.
    fn pick_object(&mut self, flusher: &mut Flusher, core: &mut Core) -> bool {
        if flusher.flush_queue.is_empty() {
            return false;
        }
        if !flusher.start_forced
            && flusher.active_flushers == 0
            && flusher.flush_queue.len() < flusher.sync_threshold
        {
            return false;
        }
        let oid = flusher.flush_queue.pop_front().expect("queue not empty");
        let version = flusher
            .flush_versions
            .remove(&oid)
            .expect("queued object has a version");
        if let Some(repeat) = flusher.sync_to_repeat.get_mut(&oid) {
            // Someone is already flushing this object; leave a note and let
            // them requeue the later version.
            *repeat = (*repeat).max(version);
            return true;
        }
        let cur = ObjVer::new(oid, version);
        if core.dirty_db.get(&cur).is_none() {
            // Already drained (e.g. by a repeat flush at a higher version).
            return true;
        }
        flusher.sync_to_repeat.insert(oid, 0);
        flusher.active_flushers += 1;
        self.cur = cur;
        debug!(ov = %cur, "flush started");
        self.scan_dirty(core);
        self.state = WorkerState::ResolveBase;
        true
    }

    /// Walk the object's dirty versions downward from the target,
    /// collecting journal ranges to copy (newest overlay wins) until a
    /// stable big write or delete provides the base.
    fn scan_dirty(&mut self, core: &Core) {
        let floor = ObjVer::new(self.cur.oid, 0);
        let mut fill = crate::store::read::RangeFill::new(0, core.layout.block_size);
        let mut skip_copy = false;
        let mut newest = true;
        for (&key, entry) in core.dirty_db.range(floor..=self.cur).rev() {
            assert!(
                entry.state.is_stable(),
                "unstable dirty entry {} below flush target {}",
                key,
                self.cur
            );
            self.dirty_keys.push(key);
            if !skip_copy {
                match entry.state.kind {
                    EntryKind::Small => {
                        if entry.len == 0 {
                            self.has_empty = true;
                        } else {
                            for (start, end) in fill.take(entry.offset, entry.offset + entry.len) {
                                self.copies.push(CopyBuffer {
                                    offset: start,
                                    len: end - start,
                                    journal_offset: entry.location
                                        + u64::from(start - entry.offset),
                                    buf: None,
                                });
                            }
                        }
                    }
                    EntryKind::Big => {
                        self.clean_loc = Some(entry.location);
                        self.init_bitmap = Some((entry.offset, entry.len));
                        skip_copy = true;
                    }
                    EntryKind::Delete => {
                        if newest {
                            self.has_delete = true;
                        } else {
                            self.delete_below = true;
                        }
                        skip_copy = true;
                    }
                }
            }
            newest = false;
        }
    }

    /// Decide where the flushed state lands. May wait for a free block.
    fn resolve_base(&mut self, flusher: &mut Flusher, core: &mut Core) -> bool {
        self.old_clean_loc = core.clean_db.get(&self.cur.oid).map(|c| c.location);

        if self.delete_below && self.copies.is_empty() {
            // Deleted, then only version bumps: nothing representable
            // remains, treat as a delete.
            self.has_delete = true;
        }
        if self.has_delete {
            self.clean_loc = self.old_clean_loc;
            if self.clean_loc.is_none() {
                // Never promoted; just drain the journal state.
                self.drain_only(flusher, core);
                return true;
            }
            self.state = WorkerState::SubmitCopies;
            return true;
        }
        if self.clean_loc.is_none() {
            if self.copies.is_empty() {
                if self.has_empty && self.old_clean_loc.is_some() {
                    // Zero-length version bump over existing content: only
                    // the metadata entry changes.
                    self.clean_loc = self.old_clean_loc;
                    self.state = WorkerState::SubmitCopies;
                    return true;
                }
                // Zero-length writes on an object that owns no block: the
                // metadata table is block-indexed, there is nothing to
                // record. Drain.
                self.drain_only(flusher, core);
                return true;
            }
            if self.old_clean_loc.is_none() || self.delete_below {
                let Some(block) = core.alloc.find_free() else {
                    warn!(ov = %self.cur, "no free block for flush; waiting");
                    return false;
                };
                core.alloc.set(block, true);
                self.clean_loc = Some(core.layout.location_of(block));
                self.fresh_block = true;
            } else {
                self.clean_loc = self.old_clean_loc;
            }
        }
        self.state = WorkerState::SubmitCopies;
        true
    }

    /// Nothing reaches the data or metadata regions; erase the dirty
    /// entries and finish.
    fn drain_only(&mut self, flusher: &mut Flusher, core: &mut Core) {
        let keys = std::mem::take(&mut self.dirty_keys);
        core.erase_dirty(&keys, None);
        if self.has_delete {
            core.clean_db.remove(&self.cur.oid);
        }
        core.stats.flushes += 1;
        self.finish_object(flusher);
    }

    /// Reference (and read, when metadata is not held in memory) the
    /// metadata sectors for the new and old clean locations. Returns true
    /// once both are ready.
    fn acquire_meta_sectors(&mut self, flusher: &mut Flusher, core: &mut Core) -> bool {
        if core.cfg.inmemory_meta {
            return true;
        }
        let clean_loc = self.clean_loc.expect("flush target resolved");
        if self.meta_new.is_none() {
            match acquire_sector(flusher, core, self.idx, clean_loc) {
                Some(meta_ref) => self.meta_new = Some(meta_ref),
                None => return false,
            }
        }
        let needs_old = self
            .old_clean_loc
            .is_some_and(|old| Some(old) != self.clean_loc);
        if needs_old && self.meta_old.is_none() {
            match acquire_sector(flusher, core, self.idx, self.old_clean_loc.unwrap()) {
                Some(meta_ref) => self.meta_old = Some(meta_ref),
                None => return false,
            }
        }
        let ready = |r: &Option<MetaRef>| {
            r.as_ref()
                .map_or(true, |r| flusher.meta_sectors[&r.sector].ready)
        };
        ready(&self.meta_new) && ready(&self.meta_old)
    }

    /// Write the affected metadata sector(s): the new entry (or zeros for a
    /// delete), and a zeroed old entry when the object moved blocks.
    fn submit_meta_writes(&mut self, flusher: &mut Flusher, core: &mut Core) -> bool {
        let layout = core.layout.clone();
        let clean_loc = self.clean_loc.expect("flush target resolved");
        let block = layout.block_of(clean_loc);
        let new_sector = layout.meta_sector_of(block);
        let new_pos = layout.meta_pos_of(block);
        let old = self
            .old_clean_loc
            .filter(|&old| Some(old) != self.clean_loc)
            .map(|old| {
                let old_block = layout.block_of(old);
                (layout.meta_sector_of(old_block), layout.meta_pos_of(old_block))
            });
        let io_count = match old {
            Some((old_sector, _)) if old_sector != new_sector => 2,
            _ => 1,
        };
        if !core.ring.has_slots(io_count) {
            return false;
        }

        let bitmap = self.compute_bitmap(core, block);

        // Mutate the sector buffers, then snapshot them for the writes.
        let entry_size = layout.clean_entry_size;
        let mut writes: Vec<(u64, Vec<u8>)> = Vec::with_capacity(2);
        {
            let mut edit = |sector: u64, pos: usize, content: Option<(&ObjVer, &[u8])>| {
                let buf = match core.meta_buffer.as_mut() {
                    Some(region) => {
                        let start = sector as usize;
                        &mut region[start..start + layout.meta_block_size as usize]
                    }
                    None => {
                        &mut flusher
                            .meta_sectors
                            .get_mut(&sector)
                            .expect("sector acquired")
                            .buf[..]
                    }
                };
                let slot = &mut buf[pos * entry_size..(pos + 1) * entry_size];
                match content {
                    Some((ov, bitmap)) => encode_clean_entry(slot, ov.oid, ov.version, bitmap),
                    None => slot.fill(0),
                }
            };
            if self.has_delete {
                edit(new_sector, new_pos, None);
            } else {
                edit(new_sector, new_pos, Some((&self.cur, &bitmap)));
            }
            if let Some((old_sector, old_pos)) = old {
                edit(old_sector, old_pos, None);
            }
        }
        let snapshot = |flusher: &Flusher, core: &Core, sector: u64| -> Vec<u8> {
            match core.meta_buffer.as_ref() {
                Some(region) => {
                    let start = sector as usize;
                    region[start..start + layout.meta_block_size as usize].to_vec()
                }
                None => flusher.meta_sectors[&sector].buf.clone(),
            }
        };
        writes.push((new_sector, snapshot(flusher, core, new_sector)));
        if let Some((old_sector, _)) = old {
            if old_sector != new_sector {
                writes.push((old_sector, snapshot(flusher, core, old_sector)));
            }
        }

        self.wait_count = writes.len() as u32;
        for (sector, buf) in writes {
            core.submit_write(
                IoTarget::Meta,
                layout.meta_offset + sector,
                buf,
                IoOwner::Flusher(self.idx),
                tag(TAG_WAIT, 0),
            );
        }
        true
    }

    /// New bitmap for the clean entry: the big-write base range or the
    /// previous clean bitmap, plus every copied range.
    fn compute_bitmap(&self, core: &mut Core, block: u64) -> Vec<u8> {
        let layout = &core.layout;
        let size = layout.clean_entry_bitmap_size;
        let granularity = layout.bitmap_granularity;
        let mut bitmap = vec![0u8; size];
        if self.has_delete {
            return bitmap;
        }
        if let Some((offset, len)) = self.init_bitmap {
            bitmap_set(&mut bitmap, offset, len, granularity);
        } else if !self.fresh_block {
            // Same block as before: extend the previous bitmap.
            let previous = match core.meta_buffer.as_ref() {
                Some(region) => {
                    let sector = layout.meta_sector_of(block) as usize;
                    let pos = layout.meta_pos_of(block);
                    let entry = sector + pos * layout.clean_entry_size;
                    region[entry + crate::layout::CLEAN_ENTRY_HEADER_SIZE..][..size].to_vec()
                }
                None => core.clean_bitmaps[block as usize * size..][..size].to_vec(),
            };
            bitmap.copy_from_slice(&previous);
        }
        for copy in &self.copies {
            bitmap_set(&mut bitmap, copy.offset, copy.len, granularity);
        }
        if core.meta_buffer.is_none() {
            core.clean_bitmaps[block as usize * size..][..size].copy_from_slice(&bitmap);
        }
        bitmap
    }

    /// The durable state is in place: reconcile the in-memory indices and
    /// the allocator, and drop the drained dirty entries.
    fn update_clean_db(&mut self, flusher: &mut Flusher, core: &mut Core) {
        let oid = self.cur.oid;
        if let (Some(old), Some(new)) = (self.old_clean_loc, self.clean_loc) {
            if old != new {
                core.alloc.set(core.layout.block_of(old), false);
            }
        }
        let keys = std::mem::take(&mut self.dirty_keys);
        if self.has_delete {
            core.clean_db.remove(&oid);
            if let Some(clean_loc) = self.clean_loc {
                core.alloc.set(core.layout.block_of(clean_loc), false);
            }
            core.erase_dirty(&keys, None);
        } else {
            let location = self.clean_loc.expect("flush target resolved");
            core.clean_db.insert(
                oid,
                CleanEntry {
                    version: self.cur.version,
                    location,
                },
            );
            core.erase_dirty(&keys, Some(location));
        }

        if core.meta_buffer.is_none() {
            for meta_ref in [self.meta_new.take(), self.meta_old.take()].into_iter().flatten() {
                let sector = flusher
                    .meta_sectors
                    .get_mut(&meta_ref.sector)
                    .expect("sector acquired");
                sector.usage_count -= 1;
                if sector.usage_count == 0 {
                    flusher.meta_sectors.remove(&meta_ref.sector);
                }
            }
        }
    }

    /// Release the object claim, honoring any stabilize that arrived while
    /// we were flushing, and go idle.
    fn finish_object(&mut self, flusher: &mut Flusher) {
        let cur = self.cur;
        if let Some(repeat) = flusher.sync_to_repeat.remove(&cur.oid) {
            if repeat > cur.version {
                flusher.unshift(ObjVer::new(cur.oid, repeat));
            }
        }
        flusher.active_flushers -= 1;
        debug!(ov = %cur, "flush finished");
        self.reset();
    }

    fn reset(&mut self) {
        let idx = self.idx;
        *self = Self::new(idx);
    }
}

fn acquire_sector(
    flusher: &mut Flusher,
    core: &mut Core,
    worker_idx: usize,
    location: u64,
) -> Option<MetaRef> {
    let layout = &core.layout;
    let block = layout.block_of(location);
    let sector = layout.meta_sector_of(block);
    let pos = layout.meta_pos_of(block);
    if let Some(existing) = flusher.meta_sectors.get_mut(&sector) {
        existing.usage_count += 1;
        return Some(MetaRef { sector, pos });
    }
    if !core.ring.has_slots(1) {
        return None;
    }
    flusher.meta_sectors.insert(
        sector,
        MetaSector {
            ready: false,
            buf: Vec::new(),
            usage_count: 1,
        },
    );
    let meta_offset = core.layout.meta_offset;
    let meta_block_size = core.layout.meta_block_size as usize;
    core.submit_read(
        IoTarget::Meta,
        meta_offset + sector,
        meta_block_size,
        IoOwner::Flusher(worker_idx),
        tag(TAG_META_READ, sector),
    );
    Some(MetaRef { sector, pos })
}

pub(crate) struct Flusher {
    flush_queue: VecDeque<ObjectId>,
    flush_versions: HashMap<ObjectId, u64>,
    sync_to_repeat: HashMap<ObjectId, u64>,
    meta_sectors: HashMap<u64, MetaSector>,
    fsync_batches: HashMap<u64, FsyncBatch>,
    next_batch_id: u64,
    workers: Vec<FlushWorker>,
    active_flushers: usize,
    start_forced: bool,
    /// Set when a force-start arms new work; the event loop reads it so a
    /// suspension that woke the flusher counts as progress.
    wakeup: bool,
    sync_threshold: usize,
    trim_counter: usize,
    trim_interval: usize,
}

impl Flusher {
    pub fn new(flusher_count: usize) -> Self {
        let sync_threshold = (flusher_count / 2).max(1);
        Self {
            flush_queue: VecDeque::new(),
            flush_versions: HashMap::new(),
            sync_to_repeat: HashMap::new(),
            meta_sectors: HashMap::new(),
            fsync_batches: HashMap::new(),
            next_batch_id: 1,
            workers: (0..flusher_count).map(FlushWorker::new).collect(),
            active_flushers: 0,
            start_forced: false,
            wakeup: false,
            sync_threshold,
            trim_interval: sync_threshold,
            trim_counter: 0,
        }
    }

    /// Queue an object for flushing up to `ov.version`.
    pub fn enqueue(&mut self, ov: ObjVer) {
        match self.flush_versions.get_mut(&ov.oid) {
            Some(version) => *version = (*version).max(ov.version),
            None => {
                self.flush_versions.insert(ov.oid, ov.version);
                self.flush_queue.push_back(ov.oid);
            }
        }
    }

    /// Re-queue at the front (repeat flush of a just-released object).
    fn unshift(&mut self, ov: ObjVer) {
        match self.flush_versions.get_mut(&ov.oid) {
            Some(version) => *version = (*version).max(ov.version),
            None => {
                self.flush_versions.insert(ov.oid, ov.version);
                self.flush_queue.push_front(ov.oid);
            }
        }
    }

    /// Start flushing regardless of the queue threshold. Called when the
    /// journal runs out of space. A no-op without queued or active work.
    pub fn force_start(&mut self) {
        if !self.start_forced && self.has_work() {
            self.start_forced = true;
            self.wakeup = true;
        }
    }

    /// Consume the wakeup signal raised by a force-start.
    pub fn take_wakeup(&mut self) -> bool {
        std::mem::take(&mut self.wakeup)
    }

    pub fn is_active(&self) -> bool {
        self.active_flushers > 0
            || (self.start_forced && !self.flush_queue.is_empty())
            || self.flush_queue.len() >= self.sync_threshold
    }

    /// Whether anything is queued or mid-flush.
    pub fn has_work(&self) -> bool {
        !self.flush_queue.is_empty() || self.active_flushers > 0
    }

    /// Step every worker once. Returns whether any of them moved.
    pub fn run(&mut self, core: &mut Core) -> bool {
        let mut progress = false;
        for i in 0..self.workers.len() {
            let mut worker = std::mem::replace(&mut self.workers[i], FlushWorker::new(i));
            progress |= worker.step(self, core);
            self.workers[i] = worker;
        }
        if self.start_forced && self.flush_queue.is_empty() && self.active_flushers == 0 {
            self.start_forced = false;
        }
        progress
    }

    /// Route a ring completion into flusher state.
    pub fn on_completion(&mut self, worker_idx: usize, tag: u64, data: Option<Vec<u8>>) {
        let payload = tag >> 3;
        match tag & 0b111 {
            TAG_COPY => {
                let worker = &mut self.workers[worker_idx];
                worker.copies[payload as usize].buf = data;
                worker.wait_count -= 1;
            }
            TAG_META_READ => {
                let sector = self
                    .meta_sectors
                    .get_mut(&payload)
                    .expect("read sector still referenced");
                sector.buf = data.expect("read completion carries data");
                sector.ready = true;
            }
            TAG_WAIT => {
                self.workers[worker_idx].wait_count -= 1;
            }
            TAG_FSYNC => {
                if let Some(batch) = self.fsync_batches.get_mut(&payload) {
                    batch.state = 2;
                }
            }
            _ => unreachable!("unknown flusher completion tag"),
        }
    }

    /// Join (or create) the fsync batch for the given device and drive it.
    /// Returns true once the batch's fsync has completed.
    fn fsync_batch_step(&mut self, core: &mut Core, worker: &mut FlushWorker, meta: bool) -> bool {
        if meta && core.cfg.disable_meta_fsync || !meta && core.cfg.disable_data_fsync {
            return true;
        }
        let id = match worker.batch_id {
            Some(id) => id,
            None => {
                let id = self
                    .fsync_batches
                    .iter()
                    .find(|(_, b)| b.meta == meta && b.state == 0)
                    .map(|(&id, _)| id)
                    .unwrap_or_else(|| {
                        let id = self.next_batch_id;
                        self.next_batch_id += 1;
                        self.fsync_batches.insert(
                            id,
                            FsyncBatch {
                                meta,
                                ready_count: 0,
                                state: 0,
                            },
                        );
                        id
                    });
                self.fsync_batches
                    .get_mut(&id)
                    .expect("just ensured")
                    .ready_count += 1;
                worker.batch_id = Some(id);
                id
            }
        };
        let (state, ready_count) = {
            let batch = &self.fsync_batches[&id];
            (batch.state, batch.ready_count)
        };
        if state == 0 && (ready_count >= self.sync_threshold || self.flush_queue.is_empty()) {
            if !core.ring.has_slots(1) {
                return false;
            }
            let target = if meta { IoTarget::Meta } else { IoTarget::Data };
            core.submit_fsync(target, IoOwner::Flusher(worker.idx), tag(TAG_FSYNC, id));
            self.fsync_batches.get_mut(&id).expect("exists").state = 1;
        }
        if self.fsync_batches[&id].state == 2 {
            let batch = self.fsync_batches.get_mut(&id).expect("exists");
            batch.ready_count -= 1;
            if batch.ready_count == 0 {
                self.fsync_batches.remove(&id);
            }
            worker.batch_id = None;
            return true;
        }
        false
    }
}
