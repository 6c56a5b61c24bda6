//! Relay-side replication for blogmesh.
//!
//! The [`ReplicationTracker`] mirrors every log it learns about, follows the
//! cross-references in settings logs to the posts, comments and media logs,
//! and hands blob references to the [`ContentPinner`], which fetches each
//! blob, verifies it and retains it locally.
//!
//! ```text
//! ConnectionWatcher ──> ReplicationTracker ──open──> LogStore
//!                            │    ^
//!                            │    └── settings: follow postsDBAddress, ...
//!                            └──cids──> ContentPinner ──fetch/pin──> BlobStore
//! ```

pub mod error;
pub mod pinner;
pub mod pinset;
pub mod refs;
pub mod state;
pub mod tracker;

pub use error::{SyncError, SyncResult};
pub use pinner::{ContentPinner, PinOutcome, PinStatus, RetryPolicy};
pub use pinset::PinSet;
pub use state::{LogState, OpenOutcome};
pub use tracker::ReplicationTracker;
