//! Filesystem quirk probes.
//!
//! Probes run inside a scratch directory created in the target directory
//! and removed on every exit path. Each probe exercises one primitive and
//! records what the kernel actually did.

use super::classifier::{
    classifier_by_id, default_classifier, FallocateClassifier, FallocateObservation,
    FallocateVerdict,
};
use crate::config::{QuirkConfig, ValidationError};
use crate::logging::event_names;
use fc_common::Quirks;
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// A probe could not reach a verdict. Never cached.
///
/// Cloneable so one failure can be handed to every caller waiting on the
/// same detection.
#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("cannot stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("cannot create scratch space in {dir}: {source}")]
    Scratch {
        dir: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("{probe} probe failed: {source}")]
    Syscall {
        probe: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("preallocation result is indeterminate under {classifier} (errno {errno})")]
    Indeterminate { classifier: &'static str, errno: i32 },

    #[error("quirk probe panicked")]
    Panicked,

    #[error("quirk probes are not supported on this platform")]
    Unsupported,
}

impl ProbeError {
    fn syscall(probe: &'static str, err: io::Error) -> Self {
        ProbeError::Syscall {
            probe,
            source: Arc::new(err),
        }
    }
}

impl From<ProbeError> for fc_common::Error {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Unsupported => fc_common::Error::UnsupportedPlatform(err.to_string()),
            other => fc_common::Error::Probe(other.to_string()),
        }
    }
}

/// Determines the quirks of the filesystem containing `dir`.
pub trait QuirkProbe: Send + Sync {
    fn probe(&self, dir: &Path) -> Result<Quirks, ProbeError>;
}

/// Probes a real filesystem.
#[derive(Debug, Clone)]
pub struct FsQuirkProbe {
    classifier: Arc<dyn FallocateClassifier>,
    probe_len: u64,
    probe_fallocate: bool,
    probe_xattr: bool,
    xattr_name: CString,
}

impl Default for FsQuirkProbe {
    fn default() -> Self {
        let defaults = QuirkConfig::default();
        Self {
            classifier: default_classifier(),
            probe_len: defaults.probe_len_bytes,
            probe_fallocate: defaults.probe_fallocate,
            probe_xattr: defaults.probe_xattr,
            xattr_name: CString::new(defaults.xattr_name).unwrap_or_default(),
        }
    }
}

impl FsQuirkProbe {
    pub fn from_config(config: &QuirkConfig) -> Result<Self, ValidationError> {
        let classifier = classifier_by_id(&config.fallocate_classifier).ok_or_else(|| {
            ValidationError::UnknownClassifier {
                id: config.fallocate_classifier.clone(),
                known: super::known_classifiers().join(", "),
            }
        })?;
        let xattr_name =
            CString::new(config.xattr_name.clone()).map_err(|_| ValidationError::XattrNul)?;
        Ok(Self {
            classifier,
            probe_len: config.probe_len_bytes,
            probe_fallocate: config.probe_fallocate,
            probe_xattr: config.probe_xattr,
            xattr_name,
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FallocateClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn classifier_id(&self) -> &'static str {
        self.classifier.id()
    }
}

impl QuirkProbe for FsQuirkProbe {
    fn probe(&self, dir: &Path) -> Result<Quirks, ProbeError> {
        let scratch = tempfile::Builder::new()
            .prefix(".fscompat-probe-")
            .tempdir_in(dir)
            .map_err(|e| ProbeError::Scratch {
                dir: dir.to_path_buf(),
                source: Arc::new(e),
            })?;
        let file = tempfile::NamedTempFile::new_in(scratch.path()).map_err(|e| {
            ProbeError::Scratch {
                dir: dir.to_path_buf(),
                source: Arc::new(e),
            }
        })?;

        let mut quirks = Quirks::empty();

        if self.probe_fallocate {
            let obs = sys::observe_fallocate(file.as_file(), self.probe_len)?;
            debug!(
                dir = %dir.display(),
                fs_magic = format_args!("{:#x}", obs.fs_magic),
                result = ?obs.result,
                allocated = obs.allocated_bytes,
                classifier = self.classifier.id(),
                "preallocation probe"
            );
            match self.classifier.classify(&obs) {
                FallocateVerdict::Broken => {
                    info!(
                        target: event_names::QUIRK_DETECTED,
                        quirk = "broken_fallocate",
                        dir = %dir.display(),
                        fs_magic = format_args!("{:#x}", obs.fs_magic),
                        classifier = self.classifier.id(),
                        "preallocation reports success without a usable reservation; disabling preallocation"
                    );
                    quirks |= Quirks::BROKEN_FALLOCATE;
                }
                FallocateVerdict::Supported | FallocateVerdict::Unsupported => {}
                FallocateVerdict::Indeterminate(errno) => {
                    return Err(ProbeError::Indeterminate {
                        classifier: self.classifier.id(),
                        errno,
                    });
                }
            }
        }

        if self.probe_xattr && sys::user_xattr_missing(file.as_file(), &self.xattr_name)? {
            info!(
                target: event_names::QUIRK_DETECTED,
                quirk = "no_user_xattr",
                dir = %dir.display(),
                "user extended attributes cannot be stored; keeping metadata elsewhere"
            );
            quirks |= Quirks::NO_USER_XATTR;
        }

        Ok(quirks)
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::{FallocateObservation, ProbeError};
    use crate::quirks::classifier::fs_magic_from_raw;
    use std::ffi::CStr;
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::io::AsRawFd;

    const PROBE_VALUE: &[u8] = b"1";

    pub(super) fn observe_fallocate(
        file: &File,
        len: u64,
    ) -> Result<FallocateObservation, ProbeError> {
        let fd = file.as_raw_fd();

        let mut stfs = std::mem::MaybeUninit::<libc::statfs>::zeroed();
        // SAFETY: `stfs` is a valid out-buffer for one statfs record.
        if unsafe { libc::fstatfs(fd, stfs.as_mut_ptr()) } != 0 {
            return Err(ProbeError::syscall("statfs", io::Error::last_os_error()));
        }
        // SAFETY: fstatfs succeeded and filled the record.
        let fs_magic = fs_magic_from_raw(unsafe { stfs.assume_init() }.f_type as i64);

        // SAFETY: plain fd call, no memory is passed.
        let rc = unsafe {
            libc::fallocate(fd, libc::FALLOC_FL_KEEP_SIZE, 0, len as libc::off_t)
        };
        let result = if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO))
        };

        let allocated_bytes = file
            .metadata()
            .map_err(|e| ProbeError::syscall("fstat", e))?
            .blocks()
            * 512;

        Ok(FallocateObservation {
            fs_magic,
            result,
            requested_bytes: len,
            allocated_bytes,
        })
    }

    fn is_unsupported(errno: i32) -> bool {
        errno == libc::ENOTSUP || errno == libc::EOPNOTSUPP || errno == libc::EPERM
    }

    /// Set, then read back. Refusal or a value that does not survive the
    /// round trip both mean user xattrs are unusable here.
    pub(super) fn user_xattr_missing(file: &File, name: &CStr) -> Result<bool, ProbeError> {
        let fd = file.as_raw_fd();

        // SAFETY: `name` is NUL-terminated and the value buffer is live.
        let rc = unsafe {
            libc::fsetxattr(
                fd,
                name.as_ptr(),
                PROBE_VALUE.as_ptr().cast(),
                PROBE_VALUE.len(),
                0,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(errno) if is_unsupported(errno) => Ok(true),
                _ => Err(ProbeError::syscall("xattr", err)),
            };
        }

        let mut buf = [0u8; 16];
        // SAFETY: `buf` is a live buffer of the stated length.
        let n = unsafe {
            libc::fgetxattr(fd, name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(errno) if is_unsupported(errno) || errno == libc::ENODATA => Ok(true),
                _ => Err(ProbeError::syscall("xattr", err)),
            };
        }
        Ok(&buf[..n as usize] != PROBE_VALUE)
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::{FallocateObservation, ProbeError};
    use std::ffi::CStr;
    use std::fs::File;

    pub(super) fn observe_fallocate(
        _file: &File,
        _len: u64,
    ) -> Result<FallocateObservation, ProbeError> {
        Err(ProbeError::Unsupported)
    }

    pub(super) fn user_xattr_missing(_file: &File, _name: &CStr) -> Result<bool, ProbeError> {
        Err(ProbeError::Unsupported)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::quirks::classifier::FallocateVerdict;

    /// Answers every observation with the same verdict.
    #[derive(Debug)]
    struct FixedVerdict(FallocateVerdict);

    impl FallocateClassifier for FixedVerdict {
        fn id(&self) -> &'static str {
            "fixed-v1"
        }

        fn classify(&self, _obs: &FallocateObservation) -> FallocateVerdict {
            self.0
        }
    }

    fn fallocate_only(verdict: FallocateVerdict) -> FsQuirkProbe {
        let config = QuirkConfig {
            probe_xattr: false,
            ..QuirkConfig::default()
        };
        FsQuirkProbe::from_config(&config)
            .unwrap()
            .with_classifier(Arc::new(FixedVerdict(verdict)))
    }

    #[test]
    fn scratch_space_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let _ = FsQuirkProbe::default().probe(dir.path());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn broken_verdict_sets_flag() {
        let dir = tempfile::tempdir().unwrap();
        let q = fallocate_only(FallocateVerdict::Broken).probe(dir.path()).unwrap();
        assert_eq!(q, Quirks::BROKEN_FALLOCATE);
    }

    #[test]
    fn unsupported_verdict_is_not_a_quirk() {
        let dir = tempfile::tempdir().unwrap();
        let q = fallocate_only(FallocateVerdict::Unsupported).probe(dir.path()).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn indeterminate_verdict_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = fallocate_only(FallocateVerdict::Indeterminate(libc::EIO))
            .probe(dir.path())
            .unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Indeterminate {
                classifier: "fixed-v1",
                errno
            } if errno == libc::EIO
        ));
    }

    #[test]
    fn missing_directory_is_scratch_error() {
        let err = FsQuirkProbe::default()
            .probe(Path::new("/nonexistent/fscompat-probe"))
            .unwrap_err();
        assert!(matches!(err, ProbeError::Scratch { .. }));
    }

    #[test]
    fn observation_records_request() {
        let file = tempfile::tempfile().unwrap();
        let obs = sys::observe_fallocate(&file, 4096).unwrap();
        assert_eq!(obs.requested_bytes, 4096);
        assert_ne!(obs.fs_magic, 0);
    }

    /// Whether `path` takes a user xattr, set through the path-based call.
    fn accepts_user_xattr(path: &Path) -> bool {
        use std::os::unix::ffi::OsStrExt;
        let path = CString::new(path.as_os_str().as_bytes()).unwrap();
        let name = CString::new("user.fscompat.check").unwrap();
        // SAFETY: both strings are NUL-terminated; the value buffer is live.
        unsafe { libc::setxattr(path.as_ptr(), name.as_ptr(), b"x".as_ptr().cast(), 1, 0) == 0 }
    }

    #[test]
    fn user_xattr_round_trip_means_not_missing() {
        let file = tempfile::NamedTempFile::new().unwrap();
        if !accepts_user_xattr(file.path()) {
            crate::test_log!(INFO, "Skipping: temp dir does not take user xattrs");
            return;
        }
        let name = CString::new("user.fscompat.probe").unwrap();
        assert!(!sys::user_xattr_missing(file.as_file(), &name).unwrap());
    }

    #[test]
    fn refused_xattr_means_missing() {
        // No handler claims this namespace, so every filesystem answers
        // EOPNOTSUPP.
        let file = tempfile::NamedTempFile::new().unwrap();
        let name = CString::new("fscompat.probe").unwrap();
        assert!(sys::user_xattr_missing(file.as_file(), &name).unwrap());
    }

    #[test]
    fn unknown_classifier_is_rejected() {
        let config = QuirkConfig {
            fallocate_classifier: "nope-v1".into(),
            ..QuirkConfig::default()
        };
        assert!(FsQuirkProbe::from_config(&config).is_err());
    }
}
