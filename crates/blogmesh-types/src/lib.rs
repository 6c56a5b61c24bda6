//! Foundation types for blogmesh.
//!
//! This crate provides the identifiers and record shapes shared by every
//! other blogmesh crate: the relay, the client acquisition loop, and the
//! storage and transport capabilities they consume.
//!
//! # Key Types
//!
//! - [`LogAddress`] -- Content-derived, immutable identifier of a log manifest
//! - [`Cid`] -- Content identifier of an immutable blob (BLAKE3 hash)
//! - [`PeerId`] -- Identifier of a peer, derived from its public key
//! - [`LogRecord`] -- A signed `PUT`/`DEL` entry of an append-only log
//! - [`LogKind`] -- Conventional role of a log within a blog (settings, posts, ...)
//! - [`MediaRecord`] -- Entry of the media log naming a blob

pub mod address;
pub mod blog;
pub mod cid;
pub mod error;
pub mod peer;
pub mod record;

pub use address::LogAddress;
pub use blog::{settings, LogKind, MediaRecord};
pub use cid::Cid;
pub use error::TypeError;
pub use peer::PeerId;
pub use record::{LogRecord, Op, PublicKeyRef};
