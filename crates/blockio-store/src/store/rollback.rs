//! Rollback: discard journaled versions above a threshold.
//!
//! Used by the layer above when a replicated write fails partway and the
//! survivors must converge on the highest version everyone has. Only
//! versions that are neither stable nor still in flight can be discarded;
//! a ROLLBACK entry is journaled and fsynced first so a crash cannot
//! resurrect the removed versions during replay.

use super::{Advance, BlockStore, OpKind, OpOutput, Operation, WaitFor};
use crate::index::EntryPhase;
use crate::journal::{JournalEntry, ROLLBACK_SIZE};
use crate::ring::{IoOwner, IoTarget};
use blockio_common::{Error, ObjVer, Result};
use std::ops::Bound;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RollbackState {
    JournalWrite,
    JournalFsync,
}

pub(crate) struct RollbackOp {
    pub targets: Vec<ObjVer>,
    pub todo: Vec<ObjVer>,
    pub pending: u32,
    pub sectors: Vec<usize>,
    pub state: RollbackState,
}

impl RollbackOp {
    pub fn new(targets: Vec<ObjVer>) -> Self {
        Self {
            targets,
            todo: Vec::new(),
            pending: 0,
            sectors: Vec::new(),
            state: RollbackState::JournalWrite,
        }
    }
}

impl BlockStore {
    pub(crate) fn dequeue_rollback(&mut self, op: &mut Operation) -> Advance {
        let id = op.id;
        let OpKind::Rollback(rb) = &mut op.kind else {
            unreachable!()
        };

        rb.todo.clear();
        for i in 0..rb.targets.len() {
            let ov = rb.targets[i];
            let clean_version = self.core.clean_db.get(&ov.oid).map_or(0, |c| c.version);
            let has_any_state = clean_version > 0
                || self
                    .core
                    .dirty_db
                    .range(crate::index::object_range(ov.oid))
                    .next()
                    .is_some();
            if !has_any_state {
                return Advance::Done(Err(Error::NotFound(ov)));
            }
            if ov.version < clean_version {
                return Advance::Done(Err(Error::invalid_argument(format!(
                    "cannot roll {} back below its stable version {}",
                    ov.oid, clean_version
                ))));
            }
            let mut removable = false;
            for (&key, entry) in self.core.dirty_db.range((
                Bound::Excluded(ObjVer::new(ov.oid, ov.version)),
                Bound::Included(ObjVer::new(ov.oid, u64::MAX)),
            )) {
                if entry.state.is_stable() {
                    return Advance::Done(Err(Error::invalid_argument(format!(
                        "{} is stable and cannot be rolled back",
                        key
                    ))));
                }
                if entry.state.is_in_flight() {
                    return Advance::Done(Err(Error::Busy(key)));
                }
                removable = true;
            }
            if removable {
                rb.todo.push(ov);
            }
        }
        if rb.todo.is_empty() {
            return Advance::Done(Ok(OpOutput::Done));
        }

        let sectors_to_write = match self.check_journal_room(rb.todo.len(), ROLLBACK_SIZE, 0) {
            Ok(n) => n,
            Err(adv) => return adv,
        };
        if !self.core.ring.has_slots(sectors_to_write) {
            return Advance::Blocked(WaitFor::Sqe);
        }

        for i in 0..rb.todo.len() {
            let ov = rb.todo[i];
            if let Some(closed) = self.core.journal.ensure_entry_room(ROLLBACK_SIZE) {
                self.core.submit_journal_sector(closed, IoOwner::Op(id));
                rb.sectors.push(closed);
                rb.pending += 1;
            }
            self.core.journal.push_entry(&JournalEntry::Rollback { ov });
        }
        let cur = self.core.journal.cur_sector();
        self.core.submit_journal_sector(cur, IoOwner::Op(id));
        rb.sectors.push(cur);
        rb.pending += 1;

        rb.state = RollbackState::JournalWrite;
        self.core.stats.rollbacks += 1;
        Advance::Pending
    }

    pub(crate) fn handle_rollback_event(
        &mut self,
        op: &mut Operation,
        _tag: u64,
    ) -> Option<Result<OpOutput>> {
        let OpKind::Rollback(rb) = &mut op.kind else {
            unreachable!()
        };
        rb.pending -= 1;
        if rb.pending > 0 {
            return None;
        }
        for idx in rb.sectors.drain(..) {
            self.core.journal.release_sector(idx);
        }
        match rb.state {
            RollbackState::JournalWrite => {
                if !self.core.cfg.disable_journal_fsync {
                    self.core
                        .submit_fsync(IoTarget::Journal, IoOwner::Op(op.id), 0);
                    rb.pending = 1;
                    rb.state = RollbackState::JournalFsync;
                    return None;
                }
            }
            RollbackState::JournalFsync => {}
        }
        let todo = std::mem::take(&mut rb.todo);
        for ov in todo {
            self.mark_rolled_back(ov);
        }
        Some(Ok(OpOutput::Done))
    }

    /// Remove every non-stable, non-in-flight version above the target and
    /// reconcile the allocator, the journal refcounts and the unstable map.
    pub(crate) fn mark_rolled_back(&mut self, ov: ObjVer) {
        let keys: Vec<ObjVer> = self
            .core
            .dirty_db
            .range((
                Bound::Excluded(ObjVer::new(ov.oid, ov.version)),
                Bound::Included(ObjVer::new(ov.oid, u64::MAX)),
            ))
            .filter(|(_, e)| !e.state.is_stable() && !e.state.is_in_flight())
            .map(|(&key, _)| key)
            .collect();
        debug!(ov = %ov, discarded = keys.len(), "rolled back");
        self.core.erase_dirty(&keys, None);
        self.core.unsynced_small.retain(|x| !keys.contains(x));
        self.core.unsynced_big.retain(|x| !keys.contains(x));

        let max_unstable = self
            .core
            .dirty_db
            .range(crate::index::object_range(ov.oid))
            .filter(|(_, e)| e.state.phase == EntryPhase::Synced)
            .map(|(key, _)| key.version)
            .max();
        match max_unstable {
            Some(version) => {
                self.core.unstable_writes.insert(ov.oid, version);
            }
            None => {
                self.core.unstable_writes.remove(&ov.oid);
            }
        }
    }
}
