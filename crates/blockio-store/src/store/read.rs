//! Read path.
//!
//! A read reconstructs the latest content of an object from the union of
//! journaled overlays and the clean data block: dirty versions are walked
//! newest-first, each contributing the parts of the requested range no
//! newer version covered, and whatever remains comes from the clean
//! location. Gaps never written at all read as zeros.
//!
//! Visibility is "written", not "synced": a completed write is readable
//! before it is durable. A read enqueued behind in-flight writes to the
//! same object waits for them to complete first, so read-modify-write
//! workflows in the layer above always see their own data.

use super::{Advance, BlockStore, OpKind, OpOutput, Operation, WaitFor};
use crate::index::{object_range, EntryKind};
use crate::ring::{IoOwner, IoTarget};
use blockio_common::{Error, ObjVer, ObjectId, Result};

pub(crate) struct ReadOp {
    pub oid: ObjectId,
    pub offset: u32,
    pub len: u32,
    pub buf: Vec<u8>,
    pub pending: u32,
}

impl ReadOp {
    pub fn new(oid: ObjectId, offset: u32, len: u32) -> Self {
        Self {
            oid,
            offset,
            len,
            buf: Vec::new(),
            pending: 0,
        }
    }
}

/// Uncovered parts of the requested range, shrinking as overlays claim
/// their pieces. The flusher reuses this to lay newer journal fragments
/// over older ones when collecting copy ranges.
pub(crate) struct RangeFill {
    gaps: Vec<(u32, u32)>,
}

impl RangeFill {
    pub(crate) fn new(start: u32, end: u32) -> Self {
        Self {
            gaps: if end > start { vec![(start, end)] } else { Vec::new() },
        }
    }

    /// Claim `[start, end)`: returns the sub-ranges that were still
    /// uncovered and marks them covered.
    pub(crate) fn take(&mut self, start: u32, end: u32) -> Vec<(u32, u32)> {
        let mut claimed = Vec::new();
        let mut remaining = Vec::with_capacity(self.gaps.len() + 1);
        for &(gap_start, gap_end) in &self.gaps {
            let s = gap_start.max(start);
            let e = gap_end.min(end);
            if s < e {
                claimed.push((s, e));
                if gap_start < s {
                    remaining.push((gap_start, s));
                }
                if e < gap_end {
                    remaining.push((e, gap_end));
                }
            } else {
                remaining.push((gap_start, gap_end));
            }
        }
        self.gaps = remaining;
        claimed
    }

    fn full(&self) -> bool {
        self.gaps.is_empty()
    }
}

impl BlockStore {
    pub(crate) fn dequeue_read(&mut self, op: &mut Operation) -> Advance {
        let OpKind::Read(r) = &mut op.kind else {
            unreachable!()
        };
        let oid = r.oid;
        let core = &self.core;

        if core
            .dirty_db
            .range(object_range(oid))
            .any(|(_, e)| e.state.is_in_flight())
        {
            return Advance::Blocked(WaitFor::ObjectWrites);
        }

        let clean = core.clean_db.get(&oid).copied();
        let has_dirty = core.dirty_db.range(object_range(oid)).next().is_some();
        if clean.is_none() && !has_dirty {
            return Advance::Done(Err(Error::NotFound(ObjVer::new(oid, 0))));
        }

        let start = r.offset;
        let end = r.offset + r.len;
        let mut fill = RangeFill::new(start, end);
        // (target, device offset, destination offset in the result, length)
        let mut plan: Vec<(IoTarget, u64, u32, u32)> = Vec::new();
        let mut superseded = false;
        let mut first = true;

        for (_, entry) in core.dirty_db.range(object_range(oid)).rev() {
            if fill.full() {
                break;
            }
            match entry.state.kind {
                EntryKind::Delete => {
                    if first {
                        return Advance::Done(Err(Error::NotFound(ObjVer::new(oid, 0))));
                    }
                    // Everything below the delete is gone; newer writes
                    // above it already claimed their ranges.
                    superseded = true;
                    break;
                }
                EntryKind::Small => {
                    for (s, e) in fill.take(entry.offset, entry.offset + entry.len) {
                        let src = core.journal.offset + entry.location
                            + u64::from(s - entry.offset);
                        plan.push((IoTarget::Journal, src, s - start, e - s));
                    }
                }
                EntryKind::Big => {
                    for (s, e) in fill.take(entry.offset, entry.offset + entry.len) {
                        let src = core.layout.data_offset + entry.location + u64::from(s);
                        plan.push((IoTarget::Data, src, s - start, e - s));
                    }
                }
            }
            first = false;
        }

        if !superseded {
            if let Some(clean) = clean {
                for (s, e) in fill.take(start, end) {
                    let src = core.layout.data_offset + clean.location + u64::from(s);
                    plan.push((IoTarget::Data, src, s - start, e - s));
                }
            }
        }

        if !self.core.ring.has_slots(plan.len()) {
            return Advance::Blocked(WaitFor::Sqe);
        }
        r.buf = vec![0u8; r.len as usize];
        self.core.stats.reads += 1;
        if plan.is_empty() {
            return Advance::Done(Ok(OpOutput::Data(std::mem::take(&mut r.buf))));
        }
        r.pending = plan.len() as u32;
        let id = op.id;
        for (target, src, dst, len) in plan {
            self.core
                .submit_read(target, src, len as usize, IoOwner::Op(id), u64::from(dst));
        }
        Advance::Pending
    }

    pub(crate) fn handle_read_event(
        &mut self,
        op: &mut Operation,
        tag: u64,
        data: Option<Vec<u8>>,
    ) -> Option<Result<OpOutput>> {
        let OpKind::Read(r) = &mut op.kind else {
            unreachable!()
        };
        let payload = data.expect("read completion carries data");
        let dst = tag as usize;
        r.buf[dst..dst + payload.len()].copy_from_slice(&payload);
        r.pending -= 1;
        if r.pending == 0 {
            Some(Ok(OpOutput::Data(std::mem::take(&mut r.buf))))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RangeFill;

    #[test]
    fn test_range_fill_overlay_order() {
        let mut fill = RangeFill::new(0, 100);
        // Newest overlay claims the middle.
        assert_eq!(fill.take(20, 60), vec![(20, 60)]);
        // An older, wider overlay only gets what is left.
        assert_eq!(fill.take(0, 80), vec![(0, 20), (60, 80)]);
        assert!(!fill.full());
        assert_eq!(fill.take(0, 100), vec![(80, 100)]);
        assert!(fill.full());
    }

    #[test]
    fn test_range_fill_disjoint() {
        let mut fill = RangeFill::new(0, 10);
        assert_eq!(fill.take(20, 30), vec![]);
        assert_eq!(fill.take(5, 25), vec![(5, 10)]);
    }

    #[test]
    fn test_range_fill_empty_request() {
        let fill = RangeFill::new(4, 4);
        assert!(fill.full());
    }
}
