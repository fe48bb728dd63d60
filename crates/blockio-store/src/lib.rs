//! blockio-store - crash-consistent block storage engine
//!
//! Manages variable-sized versioned objects on raw block devices. Objects
//! are addressed by a 128-bit (inode, stripe) identifier and versioned
//! monotonically; every mutation is journaled first and later merged into
//! a stable metadata index by a background flusher.
//!
//! ```text
//! write -> journal (small) / data region + journal pointer (big)
//!       -> sync: fsync boundary, group-committed
//!       -> stabilize: STABLE journal record, version is final
//!       -> flush: data + metadata regions updated, journal trimmed
//! ```
//!
//! The engine is single-threaded and cooperative: one event loop drives
//! operations, the flusher and recovery. See [`BlockStore`] for the entry
//! points and [`StoreConfig`](blockio_common::StoreConfig) for the layout
//! and durability knobs.

pub mod allocator;
pub mod index;
pub mod journal;
pub mod layout;
pub mod raw_io;
pub mod ring;
pub mod store;

mod flusher;
mod recovery;

pub use blockio_common::{Error, ImmediateCommit, ObjVer, ObjectId, Result, StoreConfig, Version};
pub use store::{BlockStore, ListFilter, OpCallback, OpOutput, OpRequest, StoreStats};
