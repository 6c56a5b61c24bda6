//! Consumer side of blogmesh.
//!
//! A [`BlogClient`] turns a settings log address into a [`BlogState`]. The
//! logs of a remote blog replicate in no particular order, so the client
//! polls until the settings name the blog, describe it and point at its
//! posts, and only then publishes the blog to its [`BlogObservers`].
//! Readers never see a half-replicated blog.

pub mod client;
pub mod error;
pub mod observers;
pub mod state;

pub use client::{AcquireOptions, BlogClient};
pub use error::{ClientError, ClientResult};
pub use observers::BlogObservers;
pub use state::{BlogSettings, BlogState, Post};
