//! fscompat core library
//!
//! Filesystem-compatibility helpers for a file-serving daemon that performs
//! operations on behalf of remote callers:
//! - Per-thread credential impersonation with guaranteed restore
//! - A pool of dedicated worker threads for impersonated operations
//! - Per-filesystem quirk detection with a single-flight cache
//! - Configuration loading and validation
//! - Structured logging

pub mod config;
pub mod credentials;
pub mod logging;
pub mod quirks;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_log;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use fc_common::{CredentialState, Error, FsId, Gid, Identity, Quirks, Result, Uid};
