//! Write and delete paths.
//!
//! A write the size of a full block takes the big (redirect) path: a data
//! block is allocated and the payload goes straight to the data region; the
//! journal sees only a small BIG_WRITE pointer entry, appended at sync time
//! once the data is durable. Anything shorter is a small write: the payload
//! itself goes into the journal right after a SMALL_WRITE entry. Deletes
//! journal a DELETE entry and nothing else.
//!
//! The acknowledgement fires when the submitted I/O completes. Durability
//! comes later, from Sync — except under `immediate_commit`, where the
//! drive cache is assumed write-through and completed writes count as
//! synced right away.

use super::{Advance, BlockStore, OpKind, OpOutput, Operation, WaitFor};
use crate::index::{EntryKind, EntryPhase};
use crate::journal::{JournalEntry, BIG_WRITE_SIZE, DELETE_SIZE, SMALL_WRITE_SIZE};
use crate::ring::{IoOwner, IoTarget};
use blockio_common::{Error, ImmediateCommit, ObjVer, Result};
use tracing::debug;

pub(crate) struct WriteOp {
    pub ov: ObjVer,
    pub offset: u32,
    pub len: u32,
    pub kind: EntryKind,
    pub data: Option<Vec<u8>>,
    pub pending: u32,
    pub sectors: Vec<usize>,
}

impl WriteOp {
    pub fn new(ov: ObjVer, offset: u32, data: Vec<u8>, kind: EntryKind) -> Self {
        Self {
            ov,
            offset,
            len: data.len() as u32,
            kind,
            data: Some(data),
            pending: 0,
            sectors: Vec::new(),
        }
    }
}

pub(crate) struct DeleteOp {
    pub ov: ObjVer,
    pub pending: u32,
    pub sectors: Vec<usize>,
}

impl DeleteOp {
    pub fn new(ov: ObjVer) -> Self {
        Self {
            ov,
            pending: 0,
            sectors: Vec::new(),
        }
    }
}

impl BlockStore {
    pub(crate) fn dequeue_write(&mut self, op: &mut Operation) -> Advance {
        let OpKind::Write(w) = &mut op.kind else {
            unreachable!()
        };
        match w.kind {
            EntryKind::Big => self.dequeue_big_write(op.id, w),
            EntryKind::Small => self.dequeue_small_write(op.id, w),
            EntryKind::Delete => unreachable!("deletes have their own op kind"),
        }
    }

    fn dequeue_big_write(&mut self, id: u64, w: &mut WriteOp) -> Advance {
        let journal_now = self.core.cfg.immediate_commit == ImmediateCommit::All;
        if journal_now {
            if let Err(adv) = self.check_journal_room(1, BIG_WRITE_SIZE, 0) {
                return adv;
            }
        }

        let Some(block) = self.core.alloc.find_free() else {
            if self.flusher.is_active() {
                // Flushed blocks will free up; suspend instead of failing.
                return Advance::Blocked(WaitFor::Free);
            }
            // Give back the version slot claimed at enqueue.
            self.core.dirty_db.remove(&w.ov);
            return Advance::Done(Err(Error::OutOfSpace));
        };

        let slots = if journal_now { 3 } else { 1 };
        if !self.core.ring.has_slots(slots) {
            return Advance::Blocked(WaitFor::Sqe);
        }

        let location = self.core.layout.location_of(block);
        self.core.alloc.set(block, true);
        debug!(ov = %w.ov, block, "big write");
        {
            let entry = self.core.dirty_db.get_mut(&w.ov).expect("dirty entry exists");
            entry.location = location;
            entry.state.phase = EntryPhase::Submitted;
        }
        if !journal_now {
            // The next sync snapshots this and waits for it to be written.
            self.core.unsynced_big.push(w.ov);
        }

        let buf = w.data.take().expect("write payload present");
        let dev_offset = self.core.layout.data_offset + location + u64::from(w.offset);
        self.core
            .submit_write(IoTarget::Data, dev_offset, buf, IoOwner::Op(id), 0);
        w.pending = 1;

        if journal_now {
            if let Some(closed) = self.core.journal.ensure_entry_room(BIG_WRITE_SIZE) {
                self.core.submit_journal_sector(closed, IoOwner::Op(id));
                w.sectors.push(closed);
                w.pending += 1;
            }
            let sector = self.core.journal.push_entry(&JournalEntry::BigWrite {
                ov: w.ov,
                offset: w.offset,
                len: w.len,
                location,
            });
            *self.core.journal.used_sectors.entry(sector).or_insert(0) += 1;
            self.core
                .dirty_db
                .get_mut(&w.ov)
                .expect("dirty entry exists")
                .journal_sector = sector;
            let cur = self.core.journal.cur_sector();
            self.core.submit_journal_sector(cur, IoOwner::Op(id));
            w.sectors.push(cur);
            w.pending += 1;
        }

        self.core.stats.big_writes += 1;
        Advance::Pending
    }

    fn dequeue_small_write(&mut self, id: u64, w: &mut WriteOp) -> Advance {
        let implicit = self.core.cfg.immediate_commit != ImmediateCommit::None;
        if let Err(adv) = self.check_journal_room(1, SMALL_WRITE_SIZE, w.len as usize) {
            return adv;
        }
        // Worst case: payload write + a closed sector + the entry's sector.
        let slots = usize::from(w.len > 0) + 2;
        if !self.core.ring.has_slots(slots) {
            return Advance::Blocked(WaitFor::Sqe);
        }

        let data = w.data.take().expect("write payload present");
        let crc32_data = crc32c::crc32c(&data);

        if let Some(closed) = self.core.journal.ensure_entry_room(SMALL_WRITE_SIZE) {
            self.core.submit_journal_sector(closed, IoOwner::Op(id));
            w.sectors.push(closed);
            w.pending += 1;
        }
        let data_offset = self.core.journal.reserve_data(w.len);
        let sector = self.core.journal.push_entry(&JournalEntry::SmallWrite {
            ov: w.ov,
            offset: w.offset,
            len: w.len,
            data_offset,
            crc32_data,
        });
        *self.core.journal.used_sectors.entry(sector).or_insert(0) += 1;
        debug!(ov = %w.ov, data_offset, sector, "small write journaled");
        {
            let entry = self.core.dirty_db.get_mut(&w.ov).expect("dirty entry exists");
            entry.location = data_offset;
            entry.journal_sector = sector;
            entry.state.phase = EntryPhase::Submitted;
        }
        if !implicit {
            self.core.unsynced_small.push(w.ov);
        }

        if w.len > 0 {
            let dev_offset = self.core.journal.offset + data_offset;
            self.core
                .submit_write(IoTarget::Journal, dev_offset, data, IoOwner::Op(id), 0);
            w.pending += 1;
        }
        if implicit {
            // There is no later sync to write the sector out; do it now.
            let cur = self.core.journal.cur_sector();
            self.core.submit_journal_sector(cur, IoOwner::Op(id));
            w.sectors.push(cur);
            w.pending += 1;
        }

        self.core.stats.small_writes += 1;
        if w.pending == 0 {
            // Zero-length version bump with the entry still staged in memory.
            Advance::Done(self.finish_write(w.ov, EntryKind::Small))
        } else {
            Advance::Pending
        }
    }

    pub(crate) fn dequeue_del(&mut self, op: &mut Operation) -> Advance {
        let OpKind::Delete(d) = &mut op.kind else {
            unreachable!()
        };
        let id = op.id;
        let implicit = self.core.cfg.immediate_commit != ImmediateCommit::None;
        if let Err(adv) = self.check_journal_room(1, DELETE_SIZE, 0) {
            return adv;
        }
        if !self.core.ring.has_slots(2) {
            return Advance::Blocked(WaitFor::Sqe);
        }

        if let Some(closed) = self.core.journal.ensure_entry_room(DELETE_SIZE) {
            self.core.submit_journal_sector(closed, IoOwner::Op(id));
            d.sectors.push(closed);
            d.pending += 1;
        }
        let sector = self
            .core
            .journal
            .push_entry(&JournalEntry::Delete { ov: d.ov });
        *self.core.journal.used_sectors.entry(sector).or_insert(0) += 1;
        debug!(ov = %d.ov, sector, "delete journaled");
        {
            let entry = self.core.dirty_db.get_mut(&d.ov).expect("dirty entry exists");
            entry.journal_sector = sector;
            entry.state.phase = EntryPhase::Submitted;
        }
        if implicit {
            let cur = self.core.journal.cur_sector();
            self.core.submit_journal_sector(cur, IoOwner::Op(id));
            d.sectors.push(cur);
            d.pending += 1;
        } else {
            self.core.unsynced_small.push(d.ov);
        }

        self.core.stats.deletes += 1;
        if d.pending == 0 {
            Advance::Done(self.finish_write(d.ov, EntryKind::Delete))
        } else {
            Advance::Pending
        }
    }

    /// Completion handler shared by writes and deletes.
    pub(crate) fn handle_write_event(
        &mut self,
        op: &mut Operation,
        _tag: u64,
    ) -> Option<Result<OpOutput>> {
        let (ov, kind, pending, sectors) = match &mut op.kind {
            OpKind::Write(w) => (w.ov, w.kind, &mut w.pending, &mut w.sectors),
            OpKind::Delete(d) => (d.ov, EntryKind::Delete, &mut d.pending, &mut d.sectors),
            _ => unreachable!(),
        };
        *pending -= 1;
        if *pending > 0 {
            return None;
        }
        for idx in sectors.drain(..) {
            self.core.journal.release_sector(idx);
        }
        Some(self.finish_write(ov, kind))
    }

    /// All I/O for the mutation is done: advance the dirty entry and decide
    /// which durability track it joins.
    fn finish_write(&mut self, ov: ObjVer, kind: EntryKind) -> Result<OpOutput> {
        let implicit = match (kind, self.core.cfg.immediate_commit) {
            (_, ImmediateCommit::All) => true,
            (EntryKind::Small | EntryKind::Delete, ImmediateCommit::Small) => true,
            _ => false,
        };
        let entry = self
            .core
            .dirty_db
            .get_mut(&ov)
            .expect("in-flight dirty entry cannot disappear");
        if implicit {
            entry.state.phase = EntryPhase::Synced;
            let unstable = self.core.unstable_writes.entry(ov.oid).or_insert(0);
            *unstable = (*unstable).max(ov.version);
        } else {
            entry.state.phase = EntryPhase::Written;
        }
        Ok(OpOutput::Version(ov.version))
    }
}
