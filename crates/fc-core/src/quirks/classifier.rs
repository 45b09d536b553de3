//! Preallocation verdicts.
//!
//! What counts as "broken" preallocation is a policy that has changed over
//! time, so classifiers are versioned and selected by id. The probe records
//! what the kernel did; a classifier decides what it means.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// `statfs(2)` magic of Btrfs.
pub const BTRFS_SUPER_MAGIC: i64 = 0x9123_683e;

/// Filesystem magic from a raw `statfs.f_type`.
///
/// `f_type` is a signed 32-bit word on 32-bit x86 and ARM, where magics with
/// the high bit set (Btrfs among them) come back negative. Magics are 32-bit
/// values, so only the low word counts.
pub fn fs_magic_from_raw(raw: i64) -> i64 {
    raw as u32 as i64
}

/// Id of the classifier used when none is configured.
pub const DEFAULT_CLASSIFIER: &str = "cow-prealloc-v1";

/// What one preallocation attempt on a scratch file did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallocateObservation {
    /// `f_type` reported by `fstatfs` on the scratch file.
    pub fs_magic: i64,
    /// `Ok` on success, the errno otherwise.
    pub result: Result<(), i32>,
    pub requested_bytes: u64,
    /// Bytes backing the file after the call (`st_blocks * 512`).
    pub allocated_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallocateVerdict {
    /// Reported success without a usable reservation.
    Broken,
    Supported,
    /// Honestly refused; callers get the error and fall back.
    Unsupported,
    /// An error the classifier cannot attribute. Not cached.
    Indeterminate(i32),
}

pub trait FallocateClassifier: Send + Sync + fmt::Debug {
    /// Stable, versioned id (`<policy>-v<n>`).
    fn id(&self) -> &'static str;

    fn classify(&self, obs: &FallocateObservation) -> FallocateVerdict;
}

fn honest_refusal(errno: i32) -> bool {
    errno == libc::EOPNOTSUPP || errno == libc::ENOSYS
}

fn reserved_nothing(obs: &FallocateObservation) -> bool {
    obs.result.is_ok() && obs.requested_bytes > 0 && obs.allocated_bytes == 0
}

/// Copy-on-write filesystems cannot honor a reservation: the next write
/// allocates new extents regardless, so a successful preallocation there is
/// meaningless. Also flags any filesystem that succeeds while reserving
/// nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CowPreallocV1;

impl FallocateClassifier for CowPreallocV1 {
    fn id(&self) -> &'static str {
        "cow-prealloc-v1"
    }

    fn classify(&self, obs: &FallocateObservation) -> FallocateVerdict {
        match obs.result {
            Ok(()) if obs.fs_magic == BTRFS_SUPER_MAGIC => FallocateVerdict::Broken,
            Ok(()) if reserved_nothing(obs) => FallocateVerdict::Broken,
            Ok(()) => FallocateVerdict::Supported,
            Err(errno) if honest_refusal(errno) => FallocateVerdict::Unsupported,
            Err(errno) => FallocateVerdict::Indeterminate(errno),
        }
    }
}

/// Only the zero-reservation signature counts as broken.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictV1;

impl FallocateClassifier for StrictV1 {
    fn id(&self) -> &'static str {
        "strict-v1"
    }

    fn classify(&self, obs: &FallocateObservation) -> FallocateVerdict {
        match obs.result {
            Ok(()) if reserved_nothing(obs) => FallocateVerdict::Broken,
            Ok(()) => FallocateVerdict::Supported,
            Err(errno) if honest_refusal(errno) => FallocateVerdict::Unsupported,
            Err(errno) => FallocateVerdict::Indeterminate(errno),
        }
    }
}

/// Ids accepted by [`classifier_by_id`].
pub fn known_classifiers() -> &'static [&'static str] {
    &["cow-prealloc-v1", "strict-v1"]
}

pub fn classifier_by_id(id: &str) -> Option<Arc<dyn FallocateClassifier>> {
    match id {
        "cow-prealloc-v1" => Some(Arc::new(CowPreallocV1)),
        "strict-v1" => Some(Arc::new(StrictV1)),
        _ => None,
    }
}

pub fn default_classifier() -> Arc<dyn FallocateClassifier> {
    Arc::new(CowPreallocV1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXT4_SUPER_MAGIC: i64 = 0xef53;

    fn obs(fs_magic: i64, result: Result<(), i32>, allocated_bytes: u64) -> FallocateObservation {
        FallocateObservation {
            fs_magic,
            result,
            requested_bytes: 1 << 20,
            allocated_bytes,
        }
    }

    #[test]
    fn btrfs_success_is_broken_under_default() {
        let v = CowPreallocV1.classify(&obs(BTRFS_SUPER_MAGIC, Ok(()), 1 << 20));
        assert_eq!(v, FallocateVerdict::Broken);
    }

    #[test]
    fn sign_extended_btrfs_magic_is_recognised() {
        let raw = 0x9123_683e_u32 as i32 as i64;
        assert!(raw < 0);
        let magic = fs_magic_from_raw(raw);
        assert_eq!(magic, BTRFS_SUPER_MAGIC);
        assert_eq!(fs_magic_from_raw(BTRFS_SUPER_MAGIC), BTRFS_SUPER_MAGIC);
        let v = CowPreallocV1.classify(&obs(magic, Ok(()), 1 << 20));
        assert_eq!(v, FallocateVerdict::Broken);
    }

    #[test]
    fn ext4_with_reservation_is_supported() {
        let v = CowPreallocV1.classify(&obs(EXT4_SUPER_MAGIC, Ok(()), 1 << 20));
        assert_eq!(v, FallocateVerdict::Supported);
    }

    #[test]
    fn zero_reservation_is_broken_under_both() {
        let o = obs(EXT4_SUPER_MAGIC, Ok(()), 0);
        assert_eq!(CowPreallocV1.classify(&o), FallocateVerdict::Broken);
        assert_eq!(StrictV1.classify(&o), FallocateVerdict::Broken);
    }

    #[test]
    fn strict_does_not_flag_btrfs_by_magic() {
        let v = StrictV1.classify(&obs(BTRFS_SUPER_MAGIC, Ok(()), 1 << 20));
        assert_eq!(v, FallocateVerdict::Supported);
    }

    #[test]
    fn refusals_are_not_quirks() {
        for errno in [libc::EOPNOTSUPP, libc::ENOSYS] {
            let v = CowPreallocV1.classify(&obs(EXT4_SUPER_MAGIC, Err(errno), 0));
            assert_eq!(v, FallocateVerdict::Unsupported);
        }
    }

    #[test]
    fn other_errors_are_indeterminate() {
        let v = CowPreallocV1.classify(&obs(EXT4_SUPER_MAGIC, Err(libc::ENOSPC), 0));
        assert_eq!(v, FallocateVerdict::Indeterminate(libc::ENOSPC));
    }

    #[test]
    fn lookup_by_id() {
        for id in known_classifiers() {
            assert_eq!(classifier_by_id(id).map(|c| c.id()), Some(*id));
        }
        assert!(classifier_by_id("cow-prealloc-v0").is_none());
        assert_eq!(default_classifier().id(), DEFAULT_CLASSIFIER);
    }
}
