//! Stabilize: mark synced versions as final.
//!
//! The layer above calls this once a version is durable on enough peers.
//! One STABLE entry per target goes to the journal and is fsynced; then the
//! matching dirty entry and every lower version of the same object advance
//! to Stable and the object is queued for flushing. Stabilizing an already
//! stable version is a no-op, stabilizing an unsynced one is refused.

use super::{Advance, BlockStore, OpKind, OpOutput, Operation, WaitFor};
use crate::index::EntryPhase;
use crate::journal::{JournalEntry, STABLE_SIZE};
use crate::ring::{IoOwner, IoTarget};
use blockio_common::{Error, ObjVer, Result};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StabState {
    JournalWrite,
    JournalFsync,
}

pub(crate) struct StabilizeOp {
    pub targets: Vec<ObjVer>,
    pub todo: Vec<ObjVer>,
    pub pending: u32,
    pub sectors: Vec<usize>,
    pub state: StabState,
}

impl StabilizeOp {
    pub fn new(targets: Vec<ObjVer>) -> Self {
        Self {
            targets,
            todo: Vec::new(),
            pending: 0,
            sectors: Vec::new(),
            state: StabState::JournalWrite,
        }
    }
}

impl BlockStore {
    pub(crate) fn dequeue_stable(&mut self, op: &mut Operation) -> Advance {
        let id = op.id;
        let OpKind::Stabilize(st) = &mut op.kind else {
            unreachable!()
        };

        st.todo.clear();
        for i in 0..st.targets.len() {
            let ov = st.targets[i];
            match self.core.dirty_db.get(&ov) {
                Some(entry) => {
                    if !entry.state.is_synced() {
                        // The caller must sync it first.
                        return Advance::Done(Err(Error::Busy(ov)));
                    }
                    if !entry.state.is_stable() {
                        st.todo.push(ov);
                    }
                }
                None => {
                    let already_stable = self
                        .core
                        .clean_db
                        .get(&ov.oid)
                        .is_some_and(|c| c.version >= ov.version);
                    if !already_stable {
                        return Advance::Done(Err(Error::NotFound(ov)));
                    }
                }
            }
        }
        if st.todo.is_empty() {
            return Advance::Done(Ok(OpOutput::Done));
        }

        let sectors_to_write = match self.check_journal_room(st.todo.len(), STABLE_SIZE, 0) {
            Ok(n) => n,
            Err(adv) => return adv,
        };
        if !self.core.ring.has_slots(sectors_to_write) {
            return Advance::Blocked(WaitFor::Sqe);
        }

        for i in 0..st.todo.len() {
            let ov = st.todo[i];
            if let Some(closed) = self.core.journal.ensure_entry_room(STABLE_SIZE) {
                self.core.submit_journal_sector(closed, IoOwner::Op(id));
                st.sectors.push(closed);
                st.pending += 1;
            }
            self.core.journal.push_entry(&JournalEntry::Stable { ov });
        }
        let cur = self.core.journal.cur_sector();
        self.core.submit_journal_sector(cur, IoOwner::Op(id));
        st.sectors.push(cur);
        st.pending += 1;

        st.state = StabState::JournalWrite;
        self.core.stats.stabilizes += 1;
        Advance::Pending
    }

    pub(crate) fn handle_stable_event(
        &mut self,
        op: &mut Operation,
        _tag: u64,
    ) -> Option<Result<OpOutput>> {
        let OpKind::Stabilize(st) = &mut op.kind else {
            unreachable!()
        };
        st.pending -= 1;
        if st.pending > 0 {
            return None;
        }
        for idx in st.sectors.drain(..) {
            self.core.journal.release_sector(idx);
        }
        match st.state {
            StabState::JournalWrite => {
                if !self.core.cfg.disable_journal_fsync {
                    self.core
                        .submit_fsync(IoTarget::Journal, IoOwner::Op(op.id), 0);
                    st.pending = 1;
                    st.state = StabState::JournalFsync;
                    return None;
                }
            }
            StabState::JournalFsync => {}
        }
        // STABLE records are durable; promote and queue for flushing.
        let todo = std::mem::take(&mut st.todo);
        for ov in todo {
            self.mark_stable(ov);
        }
        Some(Ok(OpOutput::Done))
    }

    /// Promote (oid, version) and every lower version of the object from
    /// Synced to Stable, then hand the object to the flusher.
    pub(crate) fn mark_stable(&mut self, ov: ObjVer) {
        let floor = ObjVer::new(ov.oid, 0);
        for (_, entry) in self.core.dirty_db.range_mut(floor..=ov).rev() {
            if entry.state.is_stable() {
                break;
            }
            if entry.state.phase == EntryPhase::Synced {
                entry.state.phase = EntryPhase::Stable;
            }
        }
        if let Some(&unstable) = self.core.unstable_writes.get(&ov.oid) {
            if unstable <= ov.version {
                self.core.unstable_writes.remove(&ov.oid);
            }
        }
        debug!(ov = %ov, "stabilized");
        self.flusher.enqueue(ov);
    }
}
