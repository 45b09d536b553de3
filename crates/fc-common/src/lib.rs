//! fscompat common types, identities, and errors.
//!
//! This crate provides the foundational types shared across fc-core modules:
//! - Identity newtypes and per-thread credential snapshots
//! - The filesystem quirk bitmask and filesystem identity
//! - Common error types with stable codes

pub mod error;
pub mod id;
pub mod quirks;

pub use error::{Error, ErrorCategory, Result};
pub use id::{CredentialState, FsId, Gid, Identity, Uid};
pub use quirks::Quirks;
