//! Quirk cache behavior through the public API, using both the real probe
//! on a scratch directory and scripted probes.

use fc_core::config::QuirkConfig;
use fc_core::quirks::{FsQuirkProbe, ProbeError, QuirkCache, QuirkProbe, Quirks};
use fc_core::FsId;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn scratch_entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".fscompat-probe-"))
        .collect()
}

#[test]
fn real_probe_result_is_cached_and_leaves_no_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let cache = QuirkCache::new(FsQuirkProbe::default());

    let first = cache.detect(dir.path());
    assert!(scratch_entries(dir.path()).is_empty());

    match first {
        Ok(quirks) => {
            let fs = FsId(std::fs::metadata(dir.path()).unwrap().dev());
            assert_eq!(cache.detect(dir.path()).unwrap(), quirks);
            assert_eq!(cache.probe_count(), 1);
            assert_eq!(cache.cached(fs), Some(quirks));
        }
        // Some sandboxes refuse the probe outright; failures must not stick.
        Err(_) => {
            let _ = cache.detect(dir.path());
            assert_eq!(cache.probe_count(), 2);
            assert!(cache.is_empty());
        }
    }
}

#[test]
fn disabled_probes_report_no_quirks() {
    let dir = tempfile::tempdir().unwrap();
    let config = QuirkConfig {
        probe_fallocate: false,
        probe_xattr: false,
        ..QuirkConfig::default()
    };
    let probe = FsQuirkProbe::from_config(&config).unwrap();
    assert_eq!(probe.probe(dir.path()).unwrap(), Quirks::empty());
}

#[test]
fn file_and_directory_on_same_filesystem_share_an_entry() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("data.bin");
    std::fs::write(&file, b"x").unwrap();

    let cache = QuirkCache::new(Counting::default());
    cache.detect(dir.path()).unwrap();
    cache.detect(&file).unwrap();

    assert_eq!(cache.probe_count(), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn missing_path_fails_without_probing() {
    let cache = QuirkCache::new(Counting::default());
    let err = cache.detect(Path::new("/nonexistent/fscompat/path")).unwrap_err();
    assert!(matches!(err, ProbeError::Stat { .. }));
    assert_eq!(cache.probe_count(), 0);
}

#[test]
fn concurrent_first_lookups_run_one_probe() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(QuirkCache::new(Counting {
        delay: Duration::from_millis(50),
        ..Counting::default()
    }));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let path = dir.path().to_path_buf();
            thread::spawn(move || {
                barrier.wait();
                cache.detect(&path).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Quirks::NO_USER_XATTR);
    }
    assert_eq!(cache.probe_count(), 1);
}

#[test]
fn failure_is_retried_on_next_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let cache = QuirkCache::new(Counting {
        fail_first: true,
        ..Counting::default()
    });

    assert!(cache.detect(dir.path()).is_err());
    assert!(cache.is_empty());
    assert_eq!(cache.detect(dir.path()).unwrap(), Quirks::NO_USER_XATTR);
    assert_eq!(cache.probe_count(), 2);
}

#[test]
fn distinct_filesystems_are_cached_independently() {
    let dir = tempfile::tempdir().unwrap();
    let cache = QuirkCache::new(Counting::default());
    cache.detect_on(FsId(1), dir.path()).unwrap();
    cache.detect_on(FsId(2), dir.path()).unwrap();
    cache.detect_on(FsId(1), dir.path()).unwrap();
    assert_eq!(cache.probe_count(), 2);
    assert_eq!(cache.len(), 2);
}

/// Reports `NO_USER_XATTR` after an optional delay, optionally failing the
/// first call.
#[derive(Default)]
struct Counting {
    calls: AtomicUsize,
    delay: Duration,
    fail_first: bool,
}

impl QuirkProbe for Counting {
    fn probe(&self, _dir: &Path) -> Result<Quirks, ProbeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        if self.fail_first && call == 0 {
            return Err(ProbeError::Indeterminate {
                classifier: "test",
                errno: 5,
            });
        }
        Ok(Quirks::NO_USER_XATTR)
    }
}
