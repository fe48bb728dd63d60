//! In-memory object indices.
//!
//! Two indices map object identity to durable location:
//! - `CleanDb` — one entry per object, mirroring the authoritative on-disk
//!   metadata entry (flat hash map; point lookups dominate).
//! - `DirtyDb` — one entry per (object, version) that has not been merged
//!   into clean state yet (ordered map; the engine walks all versions of
//!   one object by key adjacency).
//!
//! States are never stored on disk; they are deduced from the journal on
//! recovery.

use blockio_common::{ObjVer, ObjectId, Version};
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;

/// What kind of mutation a dirty entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Journaled sub-block write; `location` points into the journal.
    Small,
    /// Redirect write of a whole block; `location` points into the data region.
    Big,
    /// Object deletion.
    Delete,
}

/// How far a dirty entry has progressed toward being flushable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryPhase {
    /// Created, no I/O handed to the device yet.
    InFlight,
    /// I/O submitted, completion pending.
    Submitted,
    /// All submitted I/O completed; visible to reads, not yet durable.
    Written,
    /// Covered by a completed sync; eligible for stabilization.
    Synced,
    /// STABLE record durably journaled; eligible for flushing.
    Stable,
}

/// Full state of a dirty entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirtyState {
    pub kind: EntryKind,
    pub phase: EntryPhase,
}

impl DirtyState {
    #[must_use]
    pub const fn new(kind: EntryKind, phase: EntryPhase) -> Self {
        Self { kind, phase }
    }

    /// Still has I/O outstanding.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.phase < EntryPhase::Written
    }

    /// Content is on the device (visible to reads).
    #[must_use]
    pub fn is_written(&self) -> bool {
        self.phase >= EntryPhase::Written
    }

    /// Covered by a durability point.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.phase >= EntryPhase::Synced
    }

    /// Marked final; the flusher may promote it.
    #[must_use]
    pub fn is_stable(&self) -> bool {
        self.phase == EntryPhase::Stable
    }
}

/// Per-(object, version) record of an unmerged mutation.
#[derive(Clone, Debug)]
pub struct DirtyEntry {
    pub state: DirtyState,
    /// Journal byte offset (small writes, deletes) or data-region byte
    /// offset (big writes).
    pub location: u64,
    /// Range within the logical object.
    pub offset: u32,
    pub len: u32,
    /// Offset of the journal sector holding this entry's journal record.
    pub journal_sector: u64,
}

/// Per-object record of the last fully stabilized version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanEntry {
    pub version: Version,
    /// Block-aligned byte offset in the data region.
    pub location: u64,
}

pub type CleanDb = HashMap<ObjectId, CleanEntry>;
pub type DirtyDb = BTreeMap<ObjVer, DirtyEntry>;

/// Key range spanning every version of one object.
#[must_use]
pub fn object_range(oid: ObjectId) -> RangeInclusive<ObjVer> {
    ObjVer::new(oid, 0)..=ObjVer::new(oid, u64::MAX)
}

/// Highest dirty version of an object, if any.
#[must_use]
pub fn latest_dirty_version(dirty_db: &DirtyDb, oid: ObjectId) -> Option<Version> {
    dirty_db
        .range(object_range(oid))
        .next_back()
        .map(|(ov, _)| ov.version)
}

/// Highest known version of an object across both indices.
#[must_use]
pub fn latest_version(clean_db: &CleanDb, dirty_db: &DirtyDb, oid: ObjectId) -> Version {
    let clean = clean_db.get(&oid).map_or(0, |e| e.version);
    latest_dirty_version(dirty_db, oid).map_or(clean, |d| d.max(clean))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: EntryKind, phase: EntryPhase) -> DirtyEntry {
        DirtyEntry {
            state: DirtyState::new(kind, phase),
            location: 0,
            offset: 0,
            len: 0,
            journal_sector: 0,
        }
    }

    #[test]
    fn test_phase_predicates() {
        let s = DirtyState::new(EntryKind::Small, EntryPhase::Submitted);
        assert!(s.is_in_flight());
        assert!(!s.is_written());

        let s = DirtyState::new(EntryKind::Big, EntryPhase::Written);
        assert!(s.is_written());
        assert!(!s.is_synced());

        let s = DirtyState::new(EntryKind::Delete, EntryPhase::Stable);
        assert!(s.is_synced());
        assert!(s.is_stable());
    }

    #[test]
    fn test_object_range_scans_only_that_object() {
        let mut dirty = DirtyDb::new();
        let a = ObjectId::new(1, 0);
        let b = ObjectId::new(1, 1);
        for v in 1..=3 {
            dirty.insert(ObjVer::new(a, v), entry(EntryKind::Small, EntryPhase::Synced));
        }
        dirty.insert(ObjVer::new(b, 9), entry(EntryKind::Small, EntryPhase::Synced));

        let versions: Vec<u64> = dirty
            .range(object_range(a))
            .map(|(ov, _)| ov.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(latest_dirty_version(&dirty, a), Some(3));
        assert_eq!(latest_dirty_version(&dirty, ObjectId::new(2, 0)), None);
    }

    #[test]
    fn test_latest_version_prefers_max() {
        let mut clean = CleanDb::new();
        let mut dirty = DirtyDb::new();
        let oid = ObjectId::new(5, 0);
        clean.insert(oid, CleanEntry { version: 4, location: 0 });
        assert_eq!(latest_version(&clean, &dirty, oid), 4);

        dirty.insert(ObjVer::new(oid, 6), entry(EntryKind::Small, EntryPhase::Written));
        assert_eq!(latest_version(&clean, &dirty, oid), 6);
    }
}
