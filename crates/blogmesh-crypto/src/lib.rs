//! Identity capability for blogmesh.
//!
//! Log records are authored by an [`Identity`]: something that can sign
//! bytes and name its public key. How the key is derived from user secrets
//! is outside this crate; [`KeypairIdentity`] is the plain Ed25519 version
//! used by relay nodes and tests.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod identity;
pub mod signer;

pub use identity::{sign_record, verify_record, Identity, KeypairIdentity};
pub use signer::{Signature, SignatureError, SigningKey, VerifyingKey};
