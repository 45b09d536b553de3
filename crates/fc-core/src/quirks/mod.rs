//! Filesystem quirk detection and caching.
//!
//! This module determines, once per filesystem, which known deviations from
//! POSIX behavior apply to it:
//! - Preallocation that reports success without reserving usable space
//! - Missing support for `user.*` extended attributes
//!
//! Results are cached per filesystem id for the life of the process.
//! Concurrent first lookups of the same filesystem share one probe.

mod cache;
mod classifier;
mod probe;

pub use cache::{detect_quirks, global_cache, install_global_cache, QuirkCache};
pub use classifier::{
    classifier_by_id, default_classifier, fs_magic_from_raw, known_classifiers, CowPreallocV1,
    FallocateClassifier, FallocateObservation, FallocateVerdict, StrictV1, BTRFS_SUPER_MAGIC,
    DEFAULT_CLASSIFIER,
};
pub use fc_common::Quirks;
pub use probe::{FsQuirkProbe, ProbeError, QuirkProbe};
