//! Error types for fscompat.
//!
//! Every error carries a stable numeric code and a category so a dispatcher
//! can decide its handling without string matching:
//! - privilege acquisition failures reject one request
//! - restore failures are process-fatal
//! - probe failures are retryable and never cached

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for fscompat operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The kernel refused to switch the thread to the requested identity.
    Privilege,
    /// The thread could not be switched back to its original identity.
    Restore,
    /// A filesystem quirk probe could not reach a verdict.
    Probe,
    /// Configuration file errors.
    Config,
    /// File I/O errors.
    Io,
    /// Platform compatibility errors.
    Platform,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Privilege => write!(f, "privilege"),
            ErrorCategory::Restore => write!(f, "restore"),
            ErrorCategory::Probe => write!(f, "probe"),
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Io => write!(f, "io"),
            ErrorCategory::Platform => write!(f, "platform"),
        }
    }
}

/// Unified error type for fscompat.
#[derive(Error, Debug)]
pub enum Error {
    // Privilege acquisition (10-19)
    #[error("privilege change rejected: {0}")]
    PrivilegeChange(String),

    #[error("invalid impersonation target: {0}")]
    InvalidTarget(String),

    #[error("thread is already impersonating")]
    NestedImpersonation,

    // Restore (20-29)
    #[error("failed to restore thread credentials: {0}")]
    FatalRestore(String),

    // Probe (30-39)
    #[error("quirk probe failed: {0}")]
    Probe(String),

    // I/O (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Platform (70-79)
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    // Config (80-89)
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the stable error code.
    pub fn code(&self) -> u32 {
        match self {
            Error::PrivilegeChange(_) => 10,
            Error::InvalidTarget(_) => 11,
            Error::NestedImpersonation => 12,
            Error::FatalRestore(_) => 20,
            Error::Probe(_) => 30,
            Error::Io(_) => 60,
            Error::UnsupportedPlatform(_) => 70,
            Error::Config(_) => 80,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::PrivilegeChange(_) | Error::InvalidTarget(_) | Error::NestedImpersonation => {
                ErrorCategory::Privilege
            }
            Error::FatalRestore(_) => ErrorCategory::Restore,
            Error::Probe(_) => ErrorCategory::Probe,
            Error::Io(_) => ErrorCategory::Io,
            Error::UnsupportedPlatform(_) => ErrorCategory::Platform,
            Error::Config(_) => ErrorCategory::Config,
        }
    }

    /// Whether the caller may continue serving requests after this error.
    ///
    /// A restore failure leaves a thread with unknown identity; the process
    /// must not continue.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::PrivilegeChange(_) => true,
            Error::InvalidTarget(_) => true,
            Error::NestedImpersonation => true,
            Error::FatalRestore(_) => false,
            Error::Probe(_) => true,
            Error::Io(_) => true,
            Error::UnsupportedPlatform(_) => false,
            Error::Config(_) => true,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Probe(_) | Error::Io(_))
    }
}
