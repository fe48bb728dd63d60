//! Sync: the durability boundary.
//!
//! A sync snapshots the writes acknowledged since the previous sync and
//! walks them to durable media:
//! - big writes: fsync the data device, then append their BIG_WRITE journal
//!   entries (only now — the entry must never point at undurable data),
//!   then fsync the journal;
//! - small writes and deletes: write out the staged journal sector if it is
//!   dirty, then fsync the journal.
//!
//! Concurrent syncs form a chain. Each records how many older syncs were in
//! progress when it started and only acknowledges once they have; a later
//! sync whose snapshot drained empty piggybacks on the fsyncs of the
//! earlier one that took its writes. That is the group commit.

use super::{Advance, BlockStore, OpKind, OpOutput, Operation};
use crate::index::EntryPhase;
use crate::journal::{check_available, JournalCheck, JournalEntry, BIG_WRITE_SIZE};
use crate::ring::{IoOwner, IoTarget};
use blockio_common::ObjVer;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncState {
    /// Wait for snapshotted small writes, then flush the staged sector.
    CheckSmall,
    /// Wait for snapshotted big writes, then fsync data.
    CheckBig,
    /// Data fsync in flight.
    DataFsync,
    /// Append BIG_WRITE entries (retried while journal space is short).
    BigEntries,
    /// Journal sector write(s) in flight.
    JournalWrite,
    /// About to fsync the journal (skipped when disabled).
    StartJournalFsync,
    /// Journal fsync in flight.
    JournalFsync,
    /// Finished; waiting for older syncs to acknowledge first.
    Done,
}

pub(crate) struct SyncOp {
    pub state: SyncState,
    pub big: Vec<ObjVer>,
    pub small: Vec<ObjVer>,
    pub prev_sync_count: usize,
    pub pending: u32,
    pub sectors: Vec<usize>,
}

impl SyncOp {
    pub fn new() -> Self {
        Self {
            state: SyncState::Done,
            big: Vec::new(),
            small: Vec::new(),
            prev_sync_count: 0,
            pending: 0,
            sectors: Vec::new(),
        }
    }
}

impl BlockStore {
    pub(crate) fn dequeue_sync(&mut self, op: &mut Operation) -> Advance {
        {
            let OpKind::Sync(s) = &mut op.kind else {
                unreachable!()
            };
            s.big = std::mem::take(&mut self.core.unsynced_big);
            s.small = std::mem::take(&mut self.core.unsynced_small);
            s.state = if !s.big.is_empty() {
                SyncState::CheckBig
            } else if !s.small.is_empty() {
                SyncState::CheckSmall
            } else {
                SyncState::Done
            };
            // Later syncs must not overtake us even if they have nothing to
            // do: we now own the writes they would have covered.
            s.prev_sync_count = self.in_progress_syncs.len();
            self.in_progress_syncs.push_back(op.id);
            self.core.stats.syncs += 1;
            debug!(
                big = s.big.len(),
                small = s.small.len(),
                chained_after = s.prev_sync_count,
                "sync started"
            );
        }
        self.continue_sync(op);
        Advance::Pending
    }

    /// Advance a sync as far as current conditions allow. Returns whether
    /// anything moved.
    pub(crate) fn continue_sync(&mut self, op: &mut Operation) -> bool {
        let id = op.id;
        let OpKind::Sync(s) = &mut op.kind else {
            unreachable!()
        };
        if s.pending > 0 {
            return false;
        }
        let mut progress = false;
        loop {
            match s.state {
                SyncState::CheckSmall => {
                    if self.core.any_in_flight(&s.small) {
                        return progress;
                    }
                    if self.core.journal.cur_sector_dirty() {
                        if !self.core.ring.has_slots(1) {
                            return progress;
                        }
                        let cur = self.core.journal.cur_sector();
                        self.core.submit_journal_sector(cur, IoOwner::Op(id));
                        s.sectors.push(cur);
                        s.pending = 1;
                        s.state = SyncState::JournalWrite;
                        return true;
                    }
                    s.state = SyncState::StartJournalFsync;
                    progress = true;
                }
                SyncState::CheckBig => {
                    if self.core.any_in_flight(&s.big) {
                        return progress;
                    }
                    if self.core.cfg.disable_data_fsync {
                        s.state = SyncState::BigEntries;
                        progress = true;
                        continue;
                    }
                    if !self.core.ring.has_slots(1) {
                        return progress;
                    }
                    self.core.submit_fsync(IoTarget::Data, IoOwner::Op(id), 0);
                    s.pending = 1;
                    s.state = SyncState::DataFsync;
                    return true;
                }
                SyncState::BigEntries => {
                    if self.core.any_in_flight(&s.small) {
                        return progress;
                    }
                    let sectors_to_write = match check_available(
                        &self.core.journal,
                        s.big.len(),
                        BIG_WRITE_SIZE,
                        0,
                    ) {
                        JournalCheck::Fits { sectors_to_write } => sectors_to_write,
                        JournalCheck::WaitBuffer => return progress,
                        JournalCheck::WaitJournal { .. } => {
                            self.flusher.force_start();
                            return progress;
                        }
                    };
                    if !self.core.ring.has_slots(sectors_to_write) {
                        return progress;
                    }
                    for i in 0..s.big.len() {
                        let ov = s.big[i];
                        let Some(entry) = self.core.dirty_db.get(&ov) else {
                            // Rolled back while the sync was in progress.
                            continue;
                        };
                        let (offset, len, location) = (entry.offset, entry.len, entry.location);
                        // The data block is durable; journal the pointer.
                        if let Some(closed) = self.core.journal.ensure_entry_room(BIG_WRITE_SIZE) {
                            self.core.submit_journal_sector(closed, IoOwner::Op(id));
                            s.sectors.push(closed);
                            s.pending += 1;
                        }
                        let sector = self.core.journal.push_entry(&JournalEntry::BigWrite {
                            ov,
                            offset,
                            len,
                            location,
                        });
                        *self.core.journal.used_sectors.entry(sector).or_insert(0) += 1;
                        self.core
                            .dirty_db
                            .get_mut(&ov)
                            .expect("checked above")
                            .journal_sector = sector;
                    }
                    if self.core.journal.cur_sector_dirty() {
                        let cur = self.core.journal.cur_sector();
                        self.core.submit_journal_sector(cur, IoOwner::Op(id));
                        s.sectors.push(cur);
                        s.pending += 1;
                    }
                    if s.pending == 0 {
                        // Every target vanished under us; nothing to write.
                        s.state = SyncState::StartJournalFsync;
                        progress = true;
                        continue;
                    }
                    s.state = SyncState::JournalWrite;
                    return true;
                }
                SyncState::StartJournalFsync => {
                    if self.core.cfg.disable_journal_fsync {
                        s.state = SyncState::Done;
                        return true;
                    }
                    if !self.core.ring.has_slots(1) {
                        return progress;
                    }
                    self.core.submit_fsync(IoTarget::Journal, IoOwner::Op(id), 0);
                    s.pending = 1;
                    s.state = SyncState::JournalFsync;
                    return true;
                }
                SyncState::DataFsync | SyncState::JournalWrite | SyncState::JournalFsync => {
                    // Waiting on completions.
                    return progress;
                }
                SyncState::Done => return progress,
            }
        }
    }

    pub(crate) fn handle_sync_event(&mut self, op: &mut Operation, _tag: u64) {
        {
            let OpKind::Sync(s) = &mut op.kind else {
                unreachable!()
            };
            s.pending -= 1;
            if s.pending > 0 {
                return;
            }
            for idx in s.sectors.drain(..) {
                self.core.journal.release_sector(idx);
            }
            s.state = match s.state {
                SyncState::DataFsync => SyncState::BigEntries,
                SyncState::JournalWrite => SyncState::StartJournalFsync,
                SyncState::JournalFsync => SyncState::Done,
                other => unreachable!("unexpected sync state {:?} at completion", other),
            };
        }
        self.continue_sync(op);
    }

    /// Drive every in-progress sync one step.
    pub(crate) fn continue_syncs(&mut self) -> bool {
        let ids: Vec<u64> = self.in_progress_syncs.iter().copied().collect();
        let mut progress = false;
        for id in ids {
            let Some(mut op) = self.ops.remove(&id) else {
                continue;
            };
            progress |= self.continue_sync(&mut op);
            self.ops.insert(id, op);
        }
        progress
    }

    /// Acknowledge finished syncs in submission order. The front of the
    /// chain acks first; each ack releases the dependency of everything
    /// behind it, so a run of finished syncs collapses in one pass.
    pub(crate) fn ack_syncs(&mut self) {
        loop {
            let Some(&front) = self.in_progress_syncs.front() else {
                return;
            };
            let ready = {
                let op = self.ops.get(&front).expect("in-progress sync exists");
                let OpKind::Sync(s) = &op.kind else {
                    unreachable!()
                };
                s.state == SyncState::Done && s.prev_sync_count == 0
            };
            if !ready {
                return;
            }
            self.in_progress_syncs.pop_front();
            let mut op = self.ops.remove(&front).expect("in-progress sync exists");
            let OpKind::Sync(s) = &mut op.kind else {
                unreachable!()
            };
            for ov in s.big.iter().chain(s.small.iter()) {
                if let Some(entry) = self.core.dirty_db.get_mut(ov) {
                    if entry.state.phase == EntryPhase::Written {
                        entry.state.phase = EntryPhase::Synced;
                    }
                    let unstable = self.core.unstable_writes.entry(ov.oid).or_insert(0);
                    *unstable = (*unstable).max(ov.version);
                }
            }
            for &waiting in &self.in_progress_syncs {
                if let Some(next) = self.ops.get_mut(&waiting) {
                    let OpKind::Sync(next_sync) = &mut next.kind else {
                        unreachable!()
                    };
                    next_sync.prev_sync_count -= 1;
                }
            }
            debug!(op = front, "sync acknowledged");
            op.complete(Ok(OpOutput::Done));
        }
    }
}
