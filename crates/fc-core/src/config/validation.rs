//! Semantic validation for configuration files.
//!
//! Values that deserialize cleanly can still be unusable: a pool with no
//! workers, an xattr outside the namespace unprivileged callers can write,
//! a classifier id this build does not know.

use super::FsCompatConfig;
use crate::quirks::known_classifiers;
use thiserror::Error;

/// Errors that can occur during semantic validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("impersonation.workers must be at least 1 (got {value})")]
    NoWorkers { value: usize },

    #[error("quirks.probe_len_bytes must be positive")]
    EmptyProbe,

    #[error("quirks.xattr_name must start with \"user.\" (got {name:?})")]
    XattrNamespace { name: String },

    #[error("quirks.xattr_name must not contain NUL bytes")]
    XattrNul,

    #[error("unknown fallocate classifier {id:?} (known: {known})")]
    UnknownClassifier { id: String, known: String },
}

/// Validate a loaded configuration.
pub fn validate_config(config: &FsCompatConfig) -> Result<(), ValidationError> {
    if config.impersonation.workers == 0 {
        return Err(ValidationError::NoWorkers {
            value: config.impersonation.workers,
        });
    }

    let quirks = &config.quirks;
    if quirks.probe_len_bytes == 0 {
        return Err(ValidationError::EmptyProbe);
    }
    if quirks.xattr_name.contains('\0') {
        return Err(ValidationError::XattrNul);
    }
    if !quirks.xattr_name.starts_with("user.") || quirks.xattr_name.len() <= "user.".len() {
        return Err(ValidationError::XattrNamespace {
            name: quirks.xattr_name.clone(),
        });
    }
    if !known_classifiers().contains(&quirks.fallocate_classifier.as_str()) {
        return Err(ValidationError::UnknownClassifier {
            id: quirks.fallocate_classifier.clone(),
            known: known_classifiers().join(", "),
        });
    }

    Ok(())
}
