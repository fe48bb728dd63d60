//! End-to-end scenarios exercising the full write / sync / stabilize /
//! flush / recover protocol against real (temp) files.

use blockio_store::index::{EntryKind, EntryPhase};
use blockio_store::journal::JournalEntry;
use blockio_store::{
    BlockStore, Error, ListFilter, ObjVer, ObjectId, OpOutput, OpRequest, Result, StoreConfig,
};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

const BLOCK: u32 = 131072;
const GRAN: u32 = 4096;

fn test_config(dir: &Path) -> StoreConfig {
    StoreConfig {
        data_device: dir.join("data.img"),
        meta_device: dir.join("meta.img"),
        journal_device: dir.join("journal.img"),
        data_size: 64 * u64::from(BLOCK),
        journal_size: 1024 * 1024,
        block_size: BLOCK,
        bitmap_granularity: GRAN,
        direct_io: false,
        ..Default::default()
    }
}

fn fresh_store(dir: &Path) -> BlockStore {
    let cfg = test_config(dir);
    BlockStore::format(&cfg).unwrap();
    BlockStore::open(cfg).unwrap()
}

/// Enqueue one operation and drive the loop until it completes.
fn run_op(store: &mut BlockStore, req: OpRequest) -> Result<OpOutput> {
    let slot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    store.enqueue(req, move |res| *sink.borrow_mut() = Some(res));
    store.run_until_idle();
    let result = slot.borrow_mut().take().expect("operation did not complete");
    result
}

fn write(store: &mut BlockStore, oid: ObjectId, version: u64, offset: u32, data: Vec<u8>) -> u64 {
    match run_op(store, OpRequest::Write { oid, version, offset, data }).unwrap() {
        OpOutput::Version(v) => v,
        other => panic!("unexpected write output: {:?}", other),
    }
}

fn sync(store: &mut BlockStore) {
    run_op(store, OpRequest::Sync).unwrap();
}

fn stabilize(store: &mut BlockStore, targets: Vec<ObjVer>) -> Result<OpOutput> {
    run_op(store, OpRequest::Stabilize { targets })
}

fn read(store: &mut BlockStore, oid: ObjectId, offset: u32, len: u32) -> Result<Vec<u8>> {
    match run_op(store, OpRequest::Read { oid, offset, len })? {
        OpOutput::Data(data) => Ok(data),
        other => panic!("unexpected read output: {:?}", other),
    }
}

/// Decode consecutive journal entries from one sector's bytes.
fn decode_sector(bytes: &[u8]) -> Vec<JournalEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while let Some(decoded) = JournalEntry::decode(&bytes[pos..]) {
        pos += decoded.size;
        entries.push(decoded.entry);
    }
    entries
}

#[test]
fn test_small_write_then_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(1, 0);
    let data = vec![b'A'; 4096];

    let version = write(&mut store, oid, 0, 0, data.clone());
    assert_eq!(version, 1);
    sync(&mut store);

    assert_eq!(read(&mut store, oid, 0, 4096).unwrap(), data);

    // Not yet stabilized: nothing clean, one synced dirty version.
    assert!(store.clean_entry(oid).is_none());
    let dirty = store.dirty_entries(oid);
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].0, 1);
    assert_eq!(dirty[0].1.kind, EntryKind::Small);
    assert_eq!(dirty[0].1.phase, EntryPhase::Synced);

    // On disk: one SMALL_WRITE in the first entry sector, no STABLE.
    let journal = std::fs::read(dir.path().join("journal.img")).unwrap();
    let entries = decode_sector(&journal[4096..8192]);
    assert_eq!(entries.len(), 1);
    match &entries[0] {
        JournalEntry::SmallWrite { ov, offset, len, data_offset, .. } => {
            assert_eq!(*ov, ObjVer::new(oid, 1));
            assert_eq!(*offset, 0);
            assert_eq!(*len, 4096);
            assert_eq!(*data_offset, 8192);
        }
        other => panic!("expected SMALL_WRITE, found {:?}", other),
    }
    // And the payload itself sits behind the entry sector.
    assert_eq!(&journal[8192..8192 + 4096], &vec![b'A'; 4096][..]);
}

#[test]
fn test_stabilize_and_flush_promote_to_clean() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(1, 0);
    let data = vec![b'A'; 4096];

    write(&mut store, oid, 0, 0, data.clone());
    sync(&mut store);
    stabilize(&mut store, vec![ObjVer::new(oid, 1)]).unwrap();
    store.flush_all();

    let clean = store.clean_entry(oid).expect("promoted to clean");
    assert_eq!(clean.version, 1);
    assert_eq!(clean.location, 0);
    assert_eq!(store.dirty_count(), 0);
    assert_eq!(store.free_block_count(), store.block_count() - 1);

    // Data block 0: the written range, then zeros.
    let data_file = std::fs::read(dir.path().join("data.img")).unwrap();
    assert_eq!(&data_file[..4096], &data[..]);
    assert!(data_file[4096..BLOCK as usize].iter().all(|&b| b == 0));

    // Metadata sector 0, entry 0: oid, version, bitmap bit 0.
    let meta_file = std::fs::read(dir.path().join("meta.img")).unwrap();
    let inode = u64::from_le_bytes(meta_file[0..8].try_into().unwrap());
    let stripe = u64::from_le_bytes(meta_file[8..16].try_into().unwrap());
    let version = u64::from_le_bytes(meta_file[16..24].try_into().unwrap());
    assert_eq!((inode, stripe, version), (1, 0, 1));
    assert_eq!(&meta_file[24..28], &[0x01, 0, 0, 0]);
}

#[test]
fn test_crash_before_metadata_update_recovers_big_write() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(2, 0);
    let data = vec![b'B'; BLOCK as usize];
    {
        let mut store = fresh_store(dir.path());
        let version = write(&mut store, oid, 0, 0, data.clone());
        assert_eq!(version, 1);
        sync(&mut store);
        stabilize(&mut store, vec![ObjVer::new(oid, 1)]).unwrap();
        // The flusher never promoted the object; dropping here simulates a
        // crash after the data fsync but before the metadata update.
        assert!(store.clean_entry(oid).is_none());
    }

    let mut store = BlockStore::open(test_config(dir.path())).unwrap();
    let dirty = store.dirty_entries(oid);
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].1.kind, EntryKind::Big);
    assert_eq!(dirty[0].1.phase, EntryPhase::Stable);

    store.flush_all();
    let clean = store.clean_entry(oid).expect("promoted after recovery");
    assert_eq!(clean.version, 1);
    assert_eq!(store.dirty_count(), 0);
    assert_eq!(read(&mut store, oid, 0, BLOCK).unwrap(), data);
}

#[test]
fn test_rollback_discards_unstable_version() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(3, 0);

    let v1 = write(&mut store, oid, 0, 0, vec![b'C'; 4096]);
    assert_eq!(v1, 1);
    sync(&mut store);
    let v2 = write(&mut store, oid, 0, 0, vec![b'D'; 4096]);
    assert_eq!(v2, 2);
    // v2 is written but never synced.

    run_op(
        &mut store,
        OpRequest::Rollback {
            targets: vec![ObjVer::new(oid, 1)],
        },
    )
    .unwrap();

    let dirty = store.dirty_entries(oid);
    assert_eq!(dirty.len(), 1);
    assert_eq!(dirty[0].0, 1);
    assert_eq!(read(&mut store, oid, 0, 4096).unwrap(), vec![b'C'; 4096]);
}

#[test]
fn test_journal_full_forces_flusher_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        journal_size: 16 * 4096,
        ..test_config(dir.path())
    };
    BlockStore::format(&cfg).unwrap();
    let mut store = BlockStore::open(cfg).unwrap();

    // Stabilized history of one object: flushable, hence trimmable.
    let a = ObjectId::new(5, 0);
    for v in 1..=3 {
        write(&mut store, a, 0, 0, vec![v as u8; 4096]);
        sync(&mut store);
        stabilize(&mut store, vec![ObjVer::new(a, v)]).unwrap();
    }
    assert_eq!(store.stats().journal_trims, 0);

    // Unstabilized writes to another object fill the journal; one of them
    // must suspend until the flusher trims the stabilized history.
    let b = ObjectId::new(6, 0);
    for v in 1..=6u64 {
        let got = write(&mut store, b, 0, 0, vec![v as u8; 4096]);
        assert_eq!(got, v);
        sync(&mut store);
    }

    let stats = store.stats();
    assert!(stats.journal_full_waits >= 1, "no write ever suspended");
    assert!(stats.flushes >= 1, "flusher never ran");
    assert!(stats.journal_trims >= 1, "journal never trimmed");
    // The suspended write resumed: every version of b is present.
    assert_eq!(store.dirty_entries(b).len(), 6);
    assert_eq!(read(&mut store, b, 0, 4096).unwrap(), vec![6u8; 4096]);
}

#[test]
fn test_group_commit_coalesces_syncs() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());

    let writes_done = Rc::new(RefCell::new(0usize));
    for i in 0..10u64 {
        let counter = Rc::clone(&writes_done);
        store.enqueue(
            OpRequest::Write {
                oid: ObjectId::new(7, i),
                version: 0,
                offset: 0,
                data: vec![i as u8; 4096],
            },
            move |res| {
                res.unwrap();
                *counter.borrow_mut() += 1;
            },
        );
    }
    let ack_order = Rc::new(RefCell::new(Vec::new()));
    for i in 0..10usize {
        let order = Rc::clone(&ack_order);
        store.enqueue(OpRequest::Sync, move |res| {
            res.unwrap();
            order.borrow_mut().push(i);
        });
    }
    store.run_until_idle();

    assert_eq!(*writes_done.borrow(), 10);
    // All ten syncs acknowledged, in submission order, off one fsync.
    assert_eq!(*ack_order.borrow(), (0..10).collect::<Vec<_>>());
    assert_eq!(store.stats().journal_fsyncs, 1);
    assert_eq!(store.stats().data_fsyncs, 0);
}

#[test]
fn test_recovery_reconstructs_indices() {
    let dir = tempfile::tempdir().unwrap();
    let small = ObjectId::new(10, 1);
    let big = ObjectId::new(10, 2);

    let (small_dirty, big_dirty, small_unstable, big_unstable) = {
        let mut store = fresh_store(dir.path());
        write(&mut store, small, 0, 0, vec![1u8; 4096]);
        write(&mut store, small, 0, 4096, vec![2u8; 4096]);
        write(&mut store, big, 0, 0, vec![3u8; BLOCK as usize]);
        sync(&mut store);
        stabilize(&mut store, vec![ObjVer::new(small, 1)]).unwrap();
        (
            store.dirty_entries(small),
            store.dirty_entries(big),
            store.unstable_writes().get(&small).copied(),
            store.unstable_writes().get(&big).copied(),
        )
    };

    let mut store = BlockStore::open(test_config(dir.path())).unwrap();
    assert_eq!(store.dirty_entries(small), small_dirty);
    assert_eq!(store.dirty_entries(big), big_dirty);
    assert_eq!(store.unstable_writes().get(&small).copied(), small_unstable);
    assert_eq!(store.unstable_writes().get(&big).copied(), big_unstable);

    // Content survives too.
    assert_eq!(read(&mut store, small, 0, 4096).unwrap(), vec![1u8; 4096]);
    assert_eq!(read(&mut store, small, 4096, 4096).unwrap(), vec![2u8; 4096]);
    assert_eq!(read(&mut store, big, 0, BLOCK).unwrap(), vec![3u8; BLOCK as usize]);
}

#[test]
fn test_torn_journal_payload_truncates_replay() {
    let dir = tempfile::tempdir().unwrap();
    let oid = ObjectId::new(11, 0);
    {
        let mut store = fresh_store(dir.path());
        write(&mut store, oid, 0, 0, vec![b'E'; 4096]);
        sync(&mut store);
    }
    // Tear the journaled payload behind the entry sector.
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("journal.img"))
            .unwrap();
        file.seek(SeekFrom::Start(8192)).unwrap();
        file.write_all(&[0xFF]).unwrap();
    }

    let mut store = BlockStore::open(test_config(dir.path())).unwrap();
    // The torn write is gone, as if the journal ended before it.
    assert_eq!(store.dirty_count(), 0);
    assert!(matches!(
        read(&mut store, oid, 0, 4096),
        Err(Error::NotFound(_))
    ));

    // The store keeps working, and what it writes now survives another
    // restart.
    write(&mut store, oid, 0, 0, vec![b'F'; 4096]);
    sync(&mut store);
    drop(store);

    let mut store = BlockStore::open(test_config(dir.path())).unwrap();
    assert_eq!(read(&mut store, oid, 0, 4096).unwrap(), vec![b'F'; 4096]);
}

#[test]
fn test_stabilize_twice_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(12, 0);

    write(&mut store, oid, 0, 0, vec![b'G'; 4096]);
    sync(&mut store);
    stabilize(&mut store, vec![ObjVer::new(oid, 1)]).unwrap();
    let fsyncs_after_first = store.stats().journal_fsyncs;

    stabilize(&mut store, vec![ObjVer::new(oid, 1)]).unwrap();
    assert_eq!(store.stats().journal_fsyncs, fsyncs_after_first);

    // Still a no-op once the version went clean.
    store.flush_all();
    stabilize(&mut store, vec![ObjVer::new(oid, 1)]).unwrap();
}

#[test]
fn test_stabilize_preconditions() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(13, 0);

    write(&mut store, oid, 0, 0, vec![b'H'; 4096]);
    // Written, not synced.
    assert!(matches!(
        stabilize(&mut store, vec![ObjVer::new(oid, 1)]),
        Err(Error::Busy(_))
    ));
    // Unknown version.
    assert!(matches!(
        stabilize(&mut store, vec![ObjVer::new(oid, 9)]),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_zero_length_write_bumps_version_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(14, 0);

    assert_eq!(write(&mut store, oid, 0, 0, Vec::new()), 1);
    assert_eq!(write(&mut store, oid, 0, 0, Vec::new()), 2);
    sync(&mut store);
    // The object exists with no content: reads fill with zeros.
    assert_eq!(read(&mut store, oid, 0, 4096).unwrap(), vec![0u8; 4096]);
}

#[test]
fn test_version_rules() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(15, 0);

    assert_eq!(write(&mut store, oid, 0, 0, vec![1u8; 4096]), 1);
    // An explicit version may jump forward...
    assert_eq!(write(&mut store, oid, 5, 0, vec![2u8; 4096]), 5);
    // ...but never backwards or sideways.
    let err = run_op(
        &mut store,
        OpRequest::Write {
            oid,
            version: 3,
            offset: 0,
            data: vec![3u8; 4096],
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Alignment is enforced.
    let err = run_op(
        &mut store,
        OpRequest::Write {
            oid,
            version: 0,
            offset: 100,
            data: vec![4u8; 4096],
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn test_overlay_read_small_over_big() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(16, 0);

    write(&mut store, oid, 0, 0, vec![b'X'; BLOCK as usize]);
    sync(&mut store);
    write(&mut store, oid, 0, 4096, vec![b'Y'; 4096]);
    sync(&mut store);

    let data = read(&mut store, oid, 0, BLOCK).unwrap();
    assert!(data[..4096].iter().all(|&b| b == b'X'));
    assert!(data[4096..8192].iter().all(|&b| b == b'Y'));
    assert!(data[8192..].iter().all(|&b| b == b'X'));

    // Flushing both versions merges the overlay into the clean block.
    stabilize(&mut store, vec![ObjVer::new(oid, 2)]).unwrap();
    store.flush_all();
    assert_eq!(store.dirty_count(), 0);
    assert_eq!(store.clean_entry(oid).unwrap().version, 2);
    let data = read(&mut store, oid, 0, BLOCK).unwrap();
    assert!(data[4096..8192].iter().all(|&b| b == b'Y'));
    assert!(data[8192..].iter().all(|&b| b == b'X'));
}

#[test]
fn test_delete_frees_block_and_clears_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(17, 0);

    write(&mut store, oid, 0, 0, vec![b'Z'; BLOCK as usize]);
    sync(&mut store);
    stabilize(&mut store, vec![ObjVer::new(oid, 1)]).unwrap();
    store.flush_all();
    assert_eq!(store.free_block_count(), store.block_count() - 1);

    let v = match run_op(&mut store, OpRequest::Delete { oid, version: 0 }).unwrap() {
        OpOutput::Version(v) => v,
        other => panic!("unexpected delete output: {:?}", other),
    };
    assert_eq!(v, 2);
    sync(&mut store);
    stabilize(&mut store, vec![ObjVer::new(oid, 2)]).unwrap();
    store.flush_all();

    assert!(store.clean_entry(oid).is_none());
    assert_eq!(store.dirty_count(), 0);
    assert_eq!(store.free_block_count(), store.block_count());
    assert!(matches!(
        read(&mut store, oid, 0, 4096),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_big_overwrite_releases_old_block() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());
    let oid = ObjectId::new(18, 0);

    for round in 1..=2u64 {
        write(&mut store, oid, 0, 0, vec![round as u8; BLOCK as usize]);
        sync(&mut store);
        stabilize(&mut store, vec![ObjVer::new(oid, round)]).unwrap();
        store.flush_all();
    }
    // No double ownership: exactly one block stays allocated.
    assert_eq!(store.free_block_count(), store.block_count() - 1);
    assert_eq!(store.clean_entry(oid).unwrap().version, 2);
    assert_eq!(
        read(&mut store, oid, 0, BLOCK).unwrap(),
        vec![2u8; BLOCK as usize]
    );
}

#[test]
fn test_list_snapshots_both_indices() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());

    let promoted = ObjectId::new(20, 0);
    write(&mut store, promoted, 0, 0, vec![1u8; 4096]);
    sync(&mut store);
    stabilize(&mut store, vec![ObjVer::new(promoted, 1)]).unwrap();
    store.flush_all();

    let pending = ObjectId::new(21, 0);
    write(&mut store, pending, 0, 0, vec![2u8; 4096]);
    sync(&mut store);

    let (clean, dirty) = match run_op(
        &mut store,
        OpRequest::List {
            filter: ListFilter::default(),
        },
    )
    .unwrap()
    {
        OpOutput::List { clean, dirty } => (clean, dirty),
        other => panic!("unexpected list output: {:?}", other),
    };
    assert_eq!(clean, vec![ObjVer::new(promoted, 1)]);
    assert_eq!(dirty, vec![ObjVer::new(pending, 1)]);

    // Inode range filter.
    let (clean, dirty) = match run_op(
        &mut store,
        OpRequest::List {
            filter: ListFilter {
                min_inode: 21,
                max_inode: 21,
            },
        },
    )
    .unwrap()
    {
        OpOutput::List { clean, dirty } => (clean, dirty),
        other => panic!("unexpected list output: {:?}", other),
    };
    assert!(clean.is_empty());
    assert_eq!(dirty, vec![ObjVer::new(pending, 1)]);
}

#[test]
fn test_immediate_commit_small() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        immediate_commit: blockio_store::ImmediateCommit::Small,
        disable_journal_fsync: true,
        ..test_config(dir.path())
    };
    BlockStore::format(&cfg).unwrap();
    let mut store = BlockStore::open(cfg).unwrap();
    let oid = ObjectId::new(22, 0);

    write(&mut store, oid, 0, 0, vec![b'Q'; 4096]);
    // The completed write is already synced; no explicit sync needed.
    let dirty = store.dirty_entries(oid);
    assert_eq!(dirty[0].1.phase, EntryPhase::Synced);
    assert_eq!(store.unstable_writes().get(&oid), Some(&1));

    // Sync has nothing left to cover and issues no fsync.
    sync(&mut store);
    assert_eq!(store.stats().journal_fsyncs, 0);

    stabilize(&mut store, vec![ObjVer::new(oid, 1)]).unwrap();
    store.flush_all();
    assert_eq!(store.clean_entry(oid).unwrap().version, 1);
}

#[test]
fn test_out_of_memory_metadata_mode() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig {
        inmemory_meta: false,
        ..test_config(dir.path())
    };
    BlockStore::format(&cfg).unwrap();
    let oid = ObjectId::new(30, 0);
    {
        let mut store = BlockStore::open(cfg.clone()).unwrap();
        write(&mut store, oid, 0, 0, vec![b'M'; 4096]);
        sync(&mut store);
        stabilize(&mut store, vec![ObjVer::new(oid, 1)]).unwrap();
        store.flush_all();
        assert_eq!(store.clean_entry(oid).unwrap().version, 1);

        // A second round exercises the read-modify-write of the metadata
        // sector and the standalone bitmap copy.
        write(&mut store, oid, 0, 4096, vec![b'N'; 4096]);
        sync(&mut store);
        stabilize(&mut store, vec![ObjVer::new(oid, 2)]).unwrap();
        store.flush_all();
        assert_eq!(store.clean_entry(oid).unwrap().version, 2);
    }

    let mut store = BlockStore::open(cfg).unwrap();
    assert_eq!(store.clean_entry(oid).unwrap().version, 2);
    assert_eq!(read(&mut store, oid, 0, 4096).unwrap(), vec![b'M'; 4096]);
    assert_eq!(read(&mut store, oid, 4096, 4096).unwrap(), vec![b'N'; 4096]);
}

#[test]
fn test_journal_quiescent_after_full_flush() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = fresh_store(dir.path());

    for i in 0..4u64 {
        let oid = ObjectId::new(23, i);
        write(&mut store, oid, 0, 0, vec![i as u8; 4096]);
        sync(&mut store);
        stabilize(&mut store, vec![ObjVer::new(oid, 1)]).unwrap();
    }
    store.flush_all();

    // Fully stabilized and flushed: no dirty entries, and the journal tail
    // caught up with the head.
    assert_eq!(store.dirty_count(), 0);
    let (used_start, next_free) = store.journal_range();
    assert_eq!(used_start, next_free);
}
