//! List: read-only snapshot of both indices.
//!
//! Peers use this during recovery to learn which versions this store
//! holds. The snapshot is taken synchronously under the loop, so it is
//! consistent with respect to every acknowledged operation.

use super::{Advance, BlockStore, OpKind, OpOutput, Operation};
use blockio_common::ObjVer;

/// Inode range filter, inclusive on both ends.
#[derive(Clone, Copy, Debug)]
pub struct ListFilter {
    pub min_inode: u64,
    pub max_inode: u64,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            min_inode: 0,
            max_inode: u64::MAX,
        }
    }
}

impl ListFilter {
    fn matches(&self, inode: u64) -> bool {
        inode >= self.min_inode && inode <= self.max_inode
    }
}

pub(crate) struct ListOp {
    pub filter: ListFilter,
}

impl ListOp {
    pub fn new(filter: ListFilter) -> Self {
        Self { filter }
    }
}

impl BlockStore {
    pub(crate) fn dequeue_list(&mut self, op: &mut Operation) -> Advance {
        let OpKind::List(l) = &op.kind else {
            unreachable!()
        };
        let mut clean: Vec<ObjVer> = self
            .core
            .clean_db
            .iter()
            .filter(|(oid, _)| l.filter.matches(oid.inode))
            .map(|(&oid, e)| ObjVer::new(oid, e.version))
            .collect();
        clean.sort_unstable();
        let dirty: Vec<ObjVer> = self
            .core
            .dirty_db
            .keys()
            .filter(|ov| l.filter.matches(ov.oid.inode))
            .copied()
            .collect();
        Advance::Done(Ok(OpOutput::List { clean, dirty }))
    }
}
