//! Log and blob storage capabilities for blogmesh.
//!
//! The replication core never talks to a concrete database. It consumes two
//! capabilities defined here:
//!
//! - [`LogStore`] / [`LogHandle`] -- open, write, materialize and watch
//!   append-only, identity-signed logs
//! - [`BlobStore`] -- add bytes, fetch bytes by [`Cid`](blogmesh_types::Cid),
//!   and optionally pin them
//!
//! # Implementations
//!
//! - [`MemoryNetwork`] / [`MemoryNode`] -- an in-process network of nodes
//!   whose logs replicate between online members. Used by tests and by
//!   single-process embedding; a node may be backed by a [`DataDir`].
//! - [`DataDir`] -- the on-disk layout: a key-value datastore (peer identity,
//!   log metadata, pins) and a content-addressed blockstore. Either may be
//!   deleted independently to reset a node.
//!
//! # Design Rules
//!
//! 1. Blobs are immutable once written (content addressing guarantees this).
//! 2. A log address always resolves to the same handle within a node.
//! 3. Corrupt persisted entries are skipped, logged and deleted, never fatal.
//! 4. Locks are never held across an `.await`.

pub mod error;
pub mod fs;
pub mod memory;
pub mod merge;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use fs::{DataDir, FsBlockstore, FsDatastore};
pub use memory::{MemoryLog, MemoryNetwork, MemoryNode};
pub use merge::materialize;
pub use traits::{BlobStore, LogEvent, LogHandle, LogStore};
