//! Submission seam to the asynchronous I/O layer.
//!
//! The engine is written against "get a submission slot, submit an I/O,
//! receive a completion" semantics. Submissions queue here and execute when
//! the event loop polls; completions come back as tagged tokens the loop
//! routes to the owning state machine. The slot budget is what produces the
//! WAIT_SQE suspension: an operation that cannot get slots for all its I/Os
//! stays queued and stops submission of the operations behind it.
//!
//! A short or failed I/O aborts the process. After a partially applied
//! write the in-memory indices no longer describe the device, and no safe
//! forward path exists.

use crate::raw_io::RawFile;
use std::collections::VecDeque;

/// Which device an I/O targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoTarget {
    Data,
    Meta,
    Journal,
}

/// Who gets the completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOwner {
    /// An operation in the submit queue, by id.
    Op(u64),
    /// A flusher worker, by index.
    Flusher(usize),
}

/// One queued I/O.
pub struct IoRequest {
    pub target: IoTarget,
    pub kind: IoKind,
    pub owner: IoOwner,
    /// Owner-interpreted routing tag (destination offset, buffer index...).
    pub tag: u64,
}

/// The I/O itself.
pub enum IoKind {
    Read { offset: u64, len: usize },
    Write { offset: u64, buf: Vec<u8> },
    Fsync,
}

/// A finished I/O, handed back to its owner.
pub struct IoCompletion {
    pub owner: IoOwner,
    pub tag: u64,
    /// Read payload; `None` for writes and fsyncs.
    pub data: Option<Vec<u8>>,
}

/// Bounded submission queue.
pub struct IoRing {
    depth: usize,
    in_flight: usize,
    queue: VecDeque<IoRequest>,
}

impl IoRing {
    /// Create a ring with `depth` submission slots.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            in_flight: 0,
            queue: VecDeque::new(),
        }
    }

    /// Whether `count` submission slots are currently free.
    #[must_use]
    pub fn has_slots(&self, count: usize) -> bool {
        self.depth - self.in_flight >= count
    }

    /// Number of I/Os submitted and not yet completed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.in_flight
    }

    /// Queue an I/O. The caller must have checked `has_slots` first.
    pub fn submit(&mut self, req: IoRequest) {
        assert!(self.has_slots(1), "I/O ring slots exhausted");
        self.in_flight += 1;
        self.queue.push_back(req);
    }

    /// Execute every queued I/O and return the completions in submission
    /// order. Panics on any I/O failure: the engine treats that as fatal.
    pub fn poll(&mut self, data: &RawFile, meta: &RawFile, journal: &RawFile) -> Vec<IoCompletion> {
        let mut completions = Vec::with_capacity(self.queue.len());
        while let Some(req) = self.queue.pop_front() {
            let file = match req.target {
                IoTarget::Data => data,
                IoTarget::Meta => meta,
                IoTarget::Journal => journal,
            };
            let payload = match req.kind {
                IoKind::Read { offset, len } => {
                    // Direct I/O needs an alignment-guaranteed buffer; the
                    // submitted length is already a sector multiple then.
                    let buf = if file.is_direct() {
                        let mut aligned = crate::raw_io::AlignedBuffer::new(len);
                        if let Err(e) = file.read_at(offset, &mut aligned.as_mut_slice()[..len]) {
                            panic!(
                                "read of {} bytes at {} failed on {}: {}; \
                                 in-memory state is out of sync with disk",
                                len,
                                offset,
                                file.path(),
                                e
                            );
                        }
                        aligned.as_slice()[..len].to_vec()
                    } else {
                        let mut buf = vec![0u8; len];
                        if let Err(e) = file.read_at(offset, &mut buf) {
                            panic!(
                                "read of {} bytes at {} failed on {}: {}; \
                                 in-memory state is out of sync with disk",
                                len,
                                offset,
                                file.path(),
                                e
                            );
                        }
                        buf
                    };
                    Some(buf)
                }
                IoKind::Write { offset, buf } => {
                    let result = if file.is_direct() {
                        let mut aligned = crate::raw_io::AlignedBuffer::new(buf.len());
                        aligned.copy_from(&buf);
                        file.write_at(offset, &aligned.as_slice()[..buf.len()])
                    } else {
                        file.write_at(offset, &buf)
                    };
                    if let Err(e) = result {
                        panic!(
                            "write of {} bytes at {} failed on {}: {}; \
                             in-memory state is out of sync with disk",
                            buf.len(),
                            offset,
                            file.path(),
                            e
                        );
                    }
                    None
                }
                IoKind::Fsync => {
                    if let Err(e) = file.sync_data() {
                        panic!(
                            "fsync failed on {}: {}; \
                             in-memory state is out of sync with disk",
                            file.path(),
                            e
                        );
                    }
                    None
                }
            };
            self.in_flight -= 1;
            completions.push(IoCompletion {
                owner: req.owner,
                tag: req.tag,
                data: payload,
            });
        }
        completions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw_io::RawFile;
    use tempfile::tempdir;

    #[test]
    fn test_slot_accounting() {
        let mut ring = IoRing::new(2);
        assert!(ring.has_slots(2));
        ring.submit(IoRequest {
            target: IoTarget::Data,
            kind: IoKind::Fsync,
            owner: IoOwner::Op(1),
            tag: 0,
        });
        assert!(ring.has_slots(1));
        assert!(!ring.has_slots(2));
        assert_eq!(ring.pending(), 1);
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let file = RawFile::create(dir.path().join("dev.img"), 64 * 1024, false).unwrap();

        let mut ring = IoRing::new(8);
        ring.submit(IoRequest {
            target: IoTarget::Data,
            kind: IoKind::Write {
                offset: 4096,
                buf: b"ring payload".to_vec(),
            },
            owner: IoOwner::Op(7),
            tag: 11,
        });
        ring.submit(IoRequest {
            target: IoTarget::Data,
            kind: IoKind::Read {
                offset: 4096,
                len: 12,
            },
            owner: IoOwner::Flusher(0),
            tag: 22,
        });

        let completions = ring.poll(&file, &file, &file);
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].owner, IoOwner::Op(7));
        assert_eq!(completions[0].tag, 11);
        assert!(completions[0].data.is_none());
        assert_eq!(completions[1].data.as_deref(), Some(&b"ring payload"[..]));
        assert_eq!(ring.pending(), 0);
    }
}
