//! The blockstore engine: operation queue, dispatch and the event loop.
//!
//! Everything runs on one cooperative loop. Operations are tagged-state
//! structs advanced by the loop; each suspension point is either an I/O
//! handed to the ring or a wait on a resource (journal space, a sector
//! buffer, a free data block, submission slots). The submit queue is strict
//! FIFO: an operation that cannot proceed blocks the ones behind it, which
//! is what makes the ordering rules between writes, reads and syncs hold.

mod list;
pub(crate) mod read;
mod rollback;
mod stable;
pub(crate) mod sync;
mod write;

use crate::allocator::BlockBitmap;
use crate::flusher::Flusher;
use crate::index::{
    latest_version, CleanDb, CleanEntry, DirtyDb, DirtyEntry, DirtyState, EntryKind, EntryPhase,
};
use crate::journal::{check_available, Journal, JournalCheck};
use crate::layout::{align_up, Layout};
use crate::raw_io::RawFile;
use crate::recovery;
use crate::ring::{IoKind, IoOwner, IoRequest, IoRing, IoTarget};
use blockio_common::{Error, ObjVer, ObjectId, Result, StoreConfig, Version};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, info};

pub use list::ListFilter;

/// An operation submitted to the engine.
pub enum OpRequest {
    /// Read the latest content of a range of an object.
    Read { oid: ObjectId, offset: u32, len: u32 },
    /// Write a new version. `version == 0` assigns the next one.
    Write {
        oid: ObjectId,
        version: Version,
        offset: u32,
        data: Vec<u8>,
    },
    /// Record a deletion as a new version.
    Delete { oid: ObjectId, version: Version },
    /// Make every previously acknowledged write durable.
    Sync,
    /// Mark synced versions as final, unlocking them for the flusher.
    Stabilize { targets: Vec<ObjVer> },
    /// Discard unstable versions above the given ones.
    Rollback { targets: Vec<ObjVer> },
    /// Snapshot (oid, version) pairs from both indices.
    List { filter: ListFilter },
}

/// What a completed operation hands back.
#[derive(Debug)]
pub enum OpOutput {
    /// Sync, stabilize, rollback.
    Done,
    /// Write and delete: the (possibly engine-assigned) version.
    Version(Version),
    /// Read payload.
    Data(Vec<u8>),
    /// List snapshot: clean then dirty pairs, each sorted.
    List {
        clean: Vec<ObjVer>,
        dirty: Vec<ObjVer>,
    },
}

/// Completion callback. Runs on the loop thread, exactly once, with a
/// terminal outcome; suspensions are invisible to the caller.
pub type OpCallback = Box<dyn FnOnce(Result<OpOutput>)>;

/// Resource an operation is suspended on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitFor {
    /// Ring submission slots.
    Sqe,
    /// Journal space; the flusher has been force-started.
    Journal,
    /// A journal sector buffer still owned by an unfinished write.
    JournalBuffer,
    /// A free data block.
    Free,
    /// Writes to the same object must reach Written before a read starts.
    ObjectWrites,
}

/// Outcome of one dispatch attempt.
pub(crate) enum Advance {
    /// Terminal: complete with this result.
    Done(Result<OpOutput>),
    /// I/O submitted; the operation leaves the queue and is resumed by
    /// completions.
    Pending,
    /// Cannot proceed; stays at the head of the queue.
    Blocked(WaitFor),
}

pub(crate) struct Operation {
    pub id: u64,
    pub kind: OpKind,
    callback: Option<OpCallback>,
}

impl Operation {
    fn complete(mut self, result: Result<OpOutput>) {
        if let Some(cb) = self.callback.take() {
            cb(result);
        }
    }
}

pub(crate) enum OpKind {
    Read(read::ReadOp),
    Write(write::WriteOp),
    Delete(write::DeleteOp),
    Sync(sync::SyncOp),
    Stabilize(stable::StabilizeOp),
    Rollback(rollback::RollbackOp),
    List(list::ListOp),
}

/// Engine counters.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub reads: u64,
    pub small_writes: u64,
    pub big_writes: u64,
    pub deletes: u64,
    pub syncs: u64,
    pub stabilizes: u64,
    pub rollbacks: u64,
    pub flushes: u64,
    pub journal_trims: u64,
    pub data_fsyncs: u64,
    pub meta_fsyncs: u64,
    pub journal_fsyncs: u64,
    /// Times an operation suspended because the journal was full.
    pub journal_full_waits: u64,
}

/// Loop-owned shared state: devices, indices, allocator, journal, ring.
///
/// Operations and the flusher both mutate this; keeping it separate from
/// the operation table and the flusher pool is what lets one borrow drive
/// the other.
pub(crate) struct Core {
    pub cfg: StoreConfig,
    pub layout: Layout,
    pub data_file: Rc<RawFile>,
    pub meta_file: Rc<RawFile>,
    pub journal_file: Rc<RawFile>,
    pub alloc: BlockBitmap,
    pub clean_db: CleanDb,
    pub dirty_db: DirtyDb,
    pub journal: Journal,
    pub ring: IoRing,
    pub unsynced_big: Vec<ObjVer>,
    pub unsynced_small: Vec<ObjVer>,
    pub unstable_writes: HashMap<ObjectId, Version>,
    /// Whole metadata region, when `inmemory_meta`.
    pub meta_buffer: Option<Vec<u8>>,
    /// Standalone per-block bitmaps, when the metadata is not in memory.
    pub clean_bitmaps: Vec<u8>,
    pub stats: StoreStats,
}

impl Core {
    pub fn poll_ring(&mut self) -> Vec<crate::ring::IoCompletion> {
        self.ring
            .poll(&self.data_file, &self.meta_file, &self.journal_file)
    }

    pub fn submit_read(&mut self, target: IoTarget, offset: u64, len: usize, owner: IoOwner, tag: u64) {
        self.ring.submit(IoRequest {
            target,
            kind: IoKind::Read { offset, len },
            owner,
            tag,
        });
    }

    pub fn submit_write(&mut self, target: IoTarget, offset: u64, buf: Vec<u8>, owner: IoOwner, tag: u64) {
        self.ring.submit(IoRequest {
            target,
            kind: IoKind::Write { offset, buf },
            owner,
            tag,
        });
    }

    pub fn submit_fsync(&mut self, target: IoTarget, owner: IoOwner, tag: u64) {
        match target {
            IoTarget::Data => self.stats.data_fsyncs += 1,
            IoTarget::Meta => self.stats.meta_fsyncs += 1,
            IoTarget::Journal => self.stats.journal_fsyncs += 1,
        }
        self.ring.submit(IoRequest {
            target,
            kind: IoKind::Fsync,
            owner,
            tag,
        });
    }

    /// Close a journal sector and hand its write to the ring.
    pub fn submit_journal_sector(&mut self, idx: usize, owner: IoOwner) {
        let (offset, buf) = self.journal.prepare_sector_write(idx);
        self.submit_write(IoTarget::Journal, offset, buf, owner, SECTOR_TAG_BASE + idx as u64);
    }

    /// Remove a contiguous run of dirty entries, dropping their journal
    /// sector references and freeing big-write blocks. `keep_location` is
    /// the data location that must survive (the new clean location during a
    /// flush); pass `None` when rolling back.
    pub fn erase_dirty(&mut self, keys: &[ObjVer], keep_location: Option<u64>) {
        for ov in keys {
            let Some(entry) = self.dirty_db.remove(ov) else {
                continue;
            };
            if entry.journal_sector != 0 {
                self.used_sectors_dec(entry.journal_sector);
            }
            if entry.state.kind == EntryKind::Big && Some(entry.location) != keep_location {
                let block = self.layout.block_of(entry.location);
                debug!(ov = %ov, block, "freeing superseded block");
                self.alloc.set(block, false);
            }
        }
    }

    fn used_sectors_dec(&mut self, sector: u64) -> Option<u64> {
        let count = self.journal.used_sectors.get_mut(&sector)?;
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.journal.used_sectors.remove(&sector);
        }
        Some(remaining)
    }

    /// Whether any write in `set` still has I/O outstanding. Entries
    /// removed by a rollback are treated as complete.
    pub fn any_in_flight(&self, set: &[ObjVer]) -> bool {
        set.iter().any(|ov| {
            self.dirty_db
                .get(ov)
                .is_some_and(|e| e.state.is_in_flight())
        })
    }
}

/// Sector submissions are tagged above this so completion handlers can
/// release the right buffer.
pub(crate) const SECTOR_TAG_BASE: u64 = 1 << 32;

/// A local, crash-consistent block storage engine for versioned objects.
pub struct BlockStore {
    pub(crate) core: Core,
    pub(crate) flusher: Flusher,
    pub(crate) queue: VecDeque<u64>,
    pub(crate) ops: HashMap<u64, Operation>,
    pub(crate) in_progress_syncs: VecDeque<u64>,
    next_op_id: u64,
    started: bool,
}

impl BlockStore {
    /// Initialize the on-disk layout: zero the metadata region and the
    /// journal anchor blocks. The data region is left untouched.
    pub fn format(cfg: &StoreConfig) -> Result<()> {
        cfg.validate()?;
        if cfg.readonly {
            return Err(Error::ReadOnly);
        }
        let (data_file, meta_file, journal_file, layout) = open_devices(cfg, true)?;

        info!(
            blocks = layout.block_count,
            block_size = layout.block_size,
            meta_len = layout.meta_len,
            journal_len = layout.journal_len,
            "formatting blockstore"
        );

        let chunk = crate::raw_io::AlignedBuffer::new(1024 * 1024);
        let mut written = 0u64;
        while written < layout.meta_len {
            let n = chunk.len().min((layout.meta_len - written) as usize);
            meta_file.write_at(layout.meta_offset + written, &chunk.as_slice()[..n])?;
            written += n as u64;
        }
        meta_file.sync_data()?;

        // A zeroed block 0 makes recovery lay down a fresh START entry.
        let zero_blocks = crate::raw_io::AlignedBuffer::new(2 * layout.journal_block_size as usize);
        journal_file.write_at(
            layout.journal_offset,
            &zero_blocks.as_slice()[..2 * layout.journal_block_size as usize],
        )?;
        journal_file.sync_data()?;
        drop((data_file, meta_file, journal_file));
        Ok(())
    }

    /// Open a formatted blockstore: load the metadata region, replay the
    /// journal and become ready for operations.
    pub fn open(cfg: StoreConfig) -> Result<Self> {
        let (data_file, meta_file, journal_file, layout) = open_devices(&cfg, false)?;
        if !cfg.disable_flock {
            data_file.lock_exclusive()?;
            if !Rc::ptr_eq(&meta_file, &data_file) {
                meta_file.lock_exclusive()?;
            }
            if !Rc::ptr_eq(&journal_file, &meta_file) && !Rc::ptr_eq(&journal_file, &data_file) {
                journal_file.lock_exclusive()?;
            }
        }

        let journal = Journal::new(
            layout.journal_offset,
            layout.journal_len,
            u64::from(layout.journal_block_size),
        );
        let flusher = Flusher::new(cfg.flusher_count);
        let meta_buffer = cfg
            .inmemory_meta
            .then(|| vec![0u8; layout.meta_len as usize]);
        let clean_bitmaps = if cfg.inmemory_meta {
            Vec::new()
        } else {
            vec![0u8; layout.block_count as usize * layout.clean_entry_bitmap_size]
        };
        let alloc = BlockBitmap::new(layout.block_count);
        let ring = IoRing::new(cfg.ring_depth);

        let mut store = Self {
            core: Core {
                layout,
                data_file,
                meta_file,
                journal_file,
                alloc,
                clean_db: CleanDb::new(),
                dirty_db: DirtyDb::new(),
                journal,
                ring,
                unsynced_big: Vec::new(),
                unsynced_small: Vec::new(),
                unstable_writes: HashMap::new(),
                meta_buffer,
                clean_bitmaps,
                stats: StoreStats::default(),
                cfg,
            },
            flusher,
            queue: VecDeque::new(),
            ops: HashMap::new(),
            in_progress_syncs: VecDeque::new(),
            next_op_id: 1,
            started: false,
        };
        recovery::load(&mut store.core, &mut store.flusher)?;
        store.started = true;
        Ok(store)
    }

    /// Submit an operation. Validation happens immediately: invalid
    /// requests invoke the callback before this returns. Valid writes and
    /// deletes claim their version slot in the dirty index right away, so
    /// later enqueues observe them.
    pub fn enqueue(&mut self, req: OpRequest, callback: impl FnOnce(Result<OpOutput>) + 'static) {
        let callback: OpCallback = Box::new(callback);
        let kind = match self.prepare(req) {
            Ok(kind) => kind,
            Err(e) => {
                callback(Err(e));
                return;
            }
        };
        let id = self.next_op_id;
        self.next_op_id += 1;
        let op = Operation {
            id,
            kind,
            callback: Some(callback),
        };
        self.ops.insert(id, op);
        self.queue.push_back(id);
    }

    fn prepare(&mut self, req: OpRequest) -> Result<OpKind> {
        let core = &mut self.core;
        match req {
            OpRequest::Read { oid, offset, len } => {
                check_range(&core.layout, offset, len)?;
                Ok(OpKind::Read(read::ReadOp::new(oid, offset, len)))
            }
            OpRequest::Write {
                oid,
                version,
                offset,
                data,
            } => {
                if core.cfg.readonly {
                    return Err(Error::ReadOnly);
                }
                let len = data.len() as u32;
                check_range(&core.layout, offset, len)?;
                let version = resolve_version(core, oid, version)?;
                let kind = if len == core.layout.block_size {
                    EntryKind::Big
                } else {
                    EntryKind::Small
                };
                let ov = ObjVer::new(oid, version);
                core.dirty_db.insert(
                    ov,
                    DirtyEntry {
                        state: DirtyState::new(kind, EntryPhase::InFlight),
                        location: 0,
                        offset,
                        len,
                        journal_sector: 0,
                    },
                );
                Ok(OpKind::Write(write::WriteOp::new(ov, offset, data, kind)))
            }
            OpRequest::Delete { oid, version } => {
                if core.cfg.readonly {
                    return Err(Error::ReadOnly);
                }
                let version = resolve_version(core, oid, version)?;
                let ov = ObjVer::new(oid, version);
                core.dirty_db.insert(
                    ov,
                    DirtyEntry {
                        state: DirtyState::new(EntryKind::Delete, EntryPhase::InFlight),
                        location: 0,
                        offset: 0,
                        len: 0,
                        journal_sector: 0,
                    },
                );
                Ok(OpKind::Delete(write::DeleteOp::new(ov)))
            }
            OpRequest::Sync => Ok(OpKind::Sync(sync::SyncOp::new())),
            OpRequest::Stabilize { targets } => {
                if core.cfg.readonly {
                    return Err(Error::ReadOnly);
                }
                Ok(OpKind::Stabilize(stable::StabilizeOp::new(targets)))
            }
            OpRequest::Rollback { targets } => {
                if core.cfg.readonly {
                    return Err(Error::ReadOnly);
                }
                Ok(OpKind::Rollback(rollback::RollbackOp::new(targets)))
            }
            OpRequest::List { filter } => Ok(OpKind::List(list::ListOp::new(filter))),
        }
    }

    /// One turn of the event loop: deliver completions, step the flusher,
    /// drive pending syncs, process the submit queue. Returns whether any
    /// progress was made.
    pub fn loop_once(&mut self) -> bool {
        let mut progress = false;

        let completions = self.core.poll_ring();
        progress |= !completions.is_empty();
        for completion in completions {
            match completion.owner {
                IoOwner::Op(id) => self.on_op_event(id, completion.tag, completion.data),
                IoOwner::Flusher(idx) => {
                    self.flusher.on_completion(idx, completion.tag, completion.data);
                }
            }
        }

        progress |= self.flusher.run(&mut self.core);
        progress |= self.continue_syncs();
        self.ack_syncs();
        progress |= self.process_queue();
        // A suspension may have armed the flusher after it already ran.
        progress |= self.flusher.take_wakeup();

        progress
    }

    /// Run the loop until nothing is queued, in flight, or flushing.
    pub fn run_until_idle(&mut self) {
        while self.loop_once() || self.core.ring.pending() > 0 {}
    }

    /// Force the flusher to drain everything stabilized so far, then wait
    /// for quiescence.
    pub fn flush_all(&mut self) {
        while self.flusher.has_work() {
            self.flusher.force_start();
            self.run_until_idle();
        }
    }

    fn process_queue(&mut self) -> bool {
        let mut progress = false;
        while let Some(&id) = self.queue.front() {
            let mut op = self.ops.remove(&id).expect("queued op must exist");
            match self.dispatch(&mut op) {
                Advance::Done(result) => {
                    self.queue.pop_front();
                    op.complete(result);
                    progress = true;
                }
                Advance::Pending => {
                    self.queue.pop_front();
                    self.ops.insert(id, op);
                    progress = true;
                }
                Advance::Blocked(wait) => {
                    debug!(op = id, ?wait, "operation suspended");
                    self.ops.insert(id, op);
                    break;
                }
            }
        }
        progress
    }

    fn dispatch(&mut self, op: &mut Operation) -> Advance {
        match op.kind {
            OpKind::Read(_) => self.dequeue_read(op),
            OpKind::Write(_) => self.dequeue_write(op),
            OpKind::Delete(_) => self.dequeue_del(op),
            OpKind::Sync(_) => self.dequeue_sync(op),
            OpKind::Stabilize(_) => self.dequeue_stable(op),
            OpKind::Rollback(_) => self.dequeue_rollback(op),
            OpKind::List(_) => self.dequeue_list(op),
        }
    }

    fn on_op_event(&mut self, id: u64, tag: u64, data: Option<Vec<u8>>) {
        let Some(mut op) = self.ops.remove(&id) else {
            return;
        };
        let outcome = match op.kind {
            OpKind::Read(_) => self.handle_read_event(&mut op, tag, data),
            OpKind::Write(_) | OpKind::Delete(_) => self.handle_write_event(&mut op, tag),
            OpKind::Sync(_) => {
                self.handle_sync_event(&mut op, tag);
                None
            }
            OpKind::Stabilize(_) => self.handle_stable_event(&mut op, tag),
            OpKind::Rollback(_) => self.handle_rollback_event(&mut op, tag),
            OpKind::List(_) => unreachable!("list ops do no I/O"),
        };
        match outcome {
            Some(result) => op.complete(result),
            None => {
                self.ops.insert(id, op);
            }
        }
    }

    /// Check journal room, force-starting the flusher when full.
    pub(crate) fn check_journal_room(
        &mut self,
        required: usize,
        entry_size: usize,
        data_after: usize,
    ) -> std::result::Result<usize, Advance> {
        match check_available(&self.core.journal, required, entry_size, data_after) {
            JournalCheck::Fits { sectors_to_write } => Ok(sectors_to_write),
            JournalCheck::WaitBuffer => Err(Advance::Blocked(WaitFor::JournalBuffer)),
            JournalCheck::WaitJournal { .. } => {
                self.core.stats.journal_full_waits += 1;
                self.flusher.force_start();
                Err(Advance::Blocked(WaitFor::Journal))
            }
        }
    }

    /// True once recovery has finished and operations are being served.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// True when submitted work exists but nothing can currently move.
    pub fn is_stalled(&self) -> bool {
        !self.queue.is_empty() && self.core.ring.pending() == 0 && !self.flusher.is_active()
    }

    pub fn block_size(&self) -> u32 {
        self.core.layout.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.core.layout.block_count
    }

    pub fn free_block_count(&self) -> u64 {
        self.core.alloc.free_count()
    }

    pub fn disk_alignment(&self) -> u32 {
        self.core.layout.disk_alignment
    }

    /// Object -> highest synced-but-unstable version. The layer above reads
    /// this when peering.
    pub fn unstable_writes(&self) -> &HashMap<ObjectId, Version> {
        &self.core.unstable_writes
    }

    /// Clean index entry for an object, if it has one.
    pub fn clean_entry(&self, oid: ObjectId) -> Option<CleanEntry> {
        self.core.clean_db.get(&oid).copied()
    }

    /// All dirty versions of an object with their states, oldest first.
    pub fn dirty_entries(&self, oid: ObjectId) -> Vec<(Version, DirtyState)> {
        self.core
            .dirty_db
            .range(crate::index::object_range(oid))
            .map(|(ov, e)| (ov.version, e.state))
            .collect()
    }

    /// Total number of dirty entries across all objects.
    pub fn dirty_count(&self) -> usize {
        self.core.dirty_db.len()
    }

    /// Journal tail and head offsets.
    pub fn journal_range(&self) -> (u64, u64) {
        (self.core.journal.used_start, self.core.journal.next_free)
    }

    /// Engine counters.
    pub fn stats(&self) -> &StoreStats {
        &self.core.stats
    }

    /// Whether the flusher currently has queued or active work.
    pub fn flusher_is_active(&self) -> bool {
        self.flusher.is_active()
    }
}

fn check_range(layout: &Layout, offset: u32, len: u32) -> Result<()> {
    let alignment = layout.disk_alignment;
    if offset % alignment != 0 || len % alignment != 0 && len != 0 {
        return Err(Error::invalid_argument(format!(
            "offset {} / length {} not aligned to {}",
            offset, len, alignment
        )));
    }
    if u64::from(offset) + u64::from(len) > u64::from(layout.block_size) {
        return Err(Error::invalid_argument(format!(
            "range {}..{} exceeds the object block size {}",
            offset,
            u64::from(offset) + u64::from(len),
            layout.block_size
        )));
    }
    Ok(())
}

fn resolve_version(core: &Core, oid: ObjectId, version: Version) -> Result<Version> {
    let latest = latest_version(&core.clean_db, &core.dirty_db, oid);
    if version == 0 {
        Ok(latest + 1)
    } else if version > latest {
        Ok(version)
    } else {
        Err(Error::invalid_argument(format!(
            "version {} for {} does not advance past {}",
            version, oid, latest
        )))
    }
}

fn open_devices(
    cfg: &StoreConfig,
    create: bool,
) -> Result<(Rc<RawFile>, Rc<RawFile>, Rc<RawFile>, Layout)> {
    cfg.validate()?;
    let data_path = cfg.data_device.clone();
    let meta_path = cfg.meta_device_path().clone();
    let journal_path = cfg.journal_device_path().clone();

    let open_one = |path: &std::path::Path, min_size: u64| -> Result<Rc<RawFile>> {
        let file = if create {
            RawFile::create(path, min_size, cfg.direct_io)?
        } else {
            RawFile::open(path, cfg.readonly, cfg.direct_io)?
        };
        Ok(Rc::new(file))
    };

    // Probe the data device for its size first; the layout follows from it.
    let data_file = open_one(
        &data_path,
        cfg.data_offset + cfg.data_size.max(u64::from(cfg.block_size)),
    )?;
    let layout = Layout::from_config(cfg, data_file.size())?;

    let meta_end = layout.meta_offset + layout.meta_len;
    let meta_file = if meta_path == data_path {
        Rc::clone(&data_file)
    } else {
        open_one(&meta_path, align_up(meta_end, 4096))?
    };
    let journal_end = layout.journal_offset + layout.journal_len;
    let journal_file = if journal_path == data_path {
        Rc::clone(&data_file)
    } else if journal_path == meta_path {
        Rc::clone(&meta_file)
    } else {
        open_one(&journal_path, journal_end)?
    };

    if meta_file.size() < meta_end {
        return Err(Error::invalid_argument(format!(
            "metadata region ({} bytes at {}) exceeds device {}",
            layout.meta_len,
            layout.meta_offset,
            meta_file.path()
        )));
    }
    if journal_file.size() < journal_end {
        return Err(Error::invalid_argument(format!(
            "journal region ({} bytes at {}) exceeds device {}",
            layout.journal_len,
            layout.journal_offset,
            journal_file.path()
        )));
    }
    check_region_overlap(cfg, &layout)?;

    Ok((data_file, meta_file, journal_file, layout))
}

fn check_region_overlap(cfg: &StoreConfig, layout: &Layout) -> Result<()> {
    let data_len = layout.block_count * u64::from(layout.block_size);
    let regions = [
        ("data", &cfg.data_device, layout.data_offset, data_len),
        (
            "metadata",
            cfg.meta_device_path(),
            layout.meta_offset,
            layout.meta_len,
        ),
        (
            "journal",
            cfg.journal_device_path(),
            layout.journal_offset,
            layout.journal_len,
        ),
    ];
    for (i, &(name_a, path_a, off_a, len_a)) in regions.iter().enumerate() {
        for &(name_b, path_b, off_b, len_b) in &regions[i + 1..] {
            if path_a == path_b && off_a < off_b + len_b && off_b < off_a + len_a {
                return Err(Error::invalid_argument(format!(
                    "{} and {} regions overlap on {}",
                    name_a,
                    name_b,
                    path_a.display()
                )));
            }
        }
    }
    Ok(())
}
