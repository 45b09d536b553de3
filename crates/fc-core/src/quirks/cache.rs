//! Per-filesystem quirk cache with single-flight detection.
//!
//! At most one probe runs per filesystem at a time. Callers that arrive
//! while a probe is running wait for it and share its outcome. Successful
//! results live for the lifetime of the cache; failures are handed to the
//! waiters of that flight and then forgotten, so the next caller re-probes.

use super::probe::{FsQuirkProbe, ProbeError, QuirkProbe};
use crate::logging::event_names;
use fc_common::{FsId, Quirks};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, trace, warn};

type Outcome = Result<Quirks, ProbeError>;

/// One running probe and the callers waiting on it.
#[derive(Debug, Default)]
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
    waiters: AtomicU64,
}

impl Flight {
    fn complete(&self, outcome: Outcome) {
        *lock(&self.outcome) = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Outcome {
        let mut guard = lock(&self.outcome);
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            guard = self.done.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Debug)]
enum Slot {
    Ready(Quirks),
    InFlight(Arc<Flight>),
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Directory holding the file at `path`. A bare relative name has an empty
/// parent, which means the working directory.
fn probe_dir_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Quirks keyed by filesystem, filled on first use.
#[derive(Debug)]
pub struct QuirkCache<P = FsQuirkProbe> {
    probe: P,
    slots: Mutex<HashMap<FsId, Slot>>,
    probes: AtomicU64,
}

impl Default for QuirkCache<FsQuirkProbe> {
    fn default() -> Self {
        Self::new(FsQuirkProbe::default())
    }
}

impl<P: QuirkProbe> QuirkCache<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            slots: Mutex::new(HashMap::new()),
            probes: AtomicU64::new(0),
        }
    }

    /// Quirks of the filesystem containing `path`.
    ///
    /// `path` may be a directory or a file; probes run in the directory.
    pub fn detect(&self, path: &Path) -> Result<Quirks, ProbeError> {
        let meta = std::fs::metadata(path).map_err(|e| ProbeError::Stat {
            path: path.to_path_buf(),
            source: Arc::new(e),
        })?;
        let dir: PathBuf = if meta.is_dir() {
            path.to_path_buf()
        } else {
            path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
        };
        self.detect_on(FsId(meta.dev()), &dir)
    }

    /// Quirks of `fs_id`, probing in `dir` if they are not known yet.
    pub fn detect_on(&self, fs_id: FsId, dir: &Path) -> Result<Quirks, ProbeError> {
        let flight = {
            let mut slots = lock(&self.slots);
            match slots.get(&fs_id) {
                Some(Slot::Ready(quirks)) => {
                    trace!(target: event_names::QUIRK_CACHE_HIT, fs = %fs_id, quirks = %quirks, "quirk cache hit");
                    return Ok(*quirks);
                }
                Some(Slot::InFlight(flight)) => {
                    let flight = Arc::clone(flight);
                    let waiters = flight.waiters.fetch_add(1, Ordering::SeqCst) + 1;
                    drop(slots);
                    trace!(fs = %fs_id, waiters, "waiting on in-flight quirk probe");
                    return flight.wait();
                }
                None => {
                    let flight = Arc::new(Flight::default());
                    slots.insert(fs_id, Slot::InFlight(Arc::clone(&flight)));
                    flight
                }
            }
        };

        debug!(target: event_names::QUIRK_PROBE_STARTED, fs = %fs_id, dir = %dir.display(), "probing filesystem quirks");
        self.probes.fetch_add(1, Ordering::Relaxed);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.probe.probe(dir)))
            .unwrap_or(Err(ProbeError::Panicked));

        {
            let mut slots = lock(&self.slots);
            match &outcome {
                Ok(quirks) => {
                    slots.insert(fs_id, Slot::Ready(*quirks));
                }
                Err(err) => {
                    slots.remove(&fs_id);
                    warn!(target: event_names::QUIRK_PROBE_FAILED, fs = %fs_id, error = %err, "quirk probe failed");
                }
            }
        }
        flight.complete(outcome.clone());
        outcome
    }

    /// Number of probes executed so far.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Cached quirks of `fs_id`, without probing.
    pub fn cached(&self, fs_id: FsId) -> Option<Quirks> {
        match lock(&self.slots).get(&fs_id) {
            Some(Slot::Ready(quirks)) => Some(*quirks),
            _ => None,
        }
    }

    /// Number of filesystems with a cached result.
    pub fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn waiters(&self, fs_id: FsId) -> u64 {
        match lock(&self.slots).get(&fs_id) {
            Some(Slot::InFlight(flight)) => flight.waiters.load(Ordering::SeqCst),
            _ => 0,
        }
    }
}

static GLOBAL: OnceLock<QuirkCache> = OnceLock::new();

/// Install the process-wide cache. Returns `false` if one is already in use.
pub fn install_global_cache(probe: FsQuirkProbe) -> bool {
    GLOBAL.set(QuirkCache::new(probe)).is_ok()
}

/// The process-wide cache; created with the default probe on first use.
pub fn global_cache() -> &'static QuirkCache {
    GLOBAL.get_or_init(QuirkCache::default)
}

/// Quirks of the filesystem containing `path`, via the process-wide cache.
pub fn detect_quirks(path: &Path) -> Result<Quirks, ProbeError> {
    global_cache().detect(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    struct Scripted {
        calls: AtomicUsize,
        script: Vec<Outcome>,
    }

    impl QuirkProbe for Scripted {
        fn probe(&self, _dir: &Path) -> Result<Quirks, ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.script[n.min(self.script.len() - 1)].clone()
        }
    }

    fn scripted(script: Vec<Outcome>) -> QuirkCache<Scripted> {
        QuirkCache::new(Scripted {
            calls: AtomicUsize::new(0),
            script,
        })
    }

    fn transient() -> ProbeError {
        ProbeError::Syscall {
            probe: "statfs",
            source: Arc::new(std::io::Error::from_raw_os_error(libc::EIO)),
        }
    }

    #[test]
    fn bare_file_name_probes_the_working_directory() {
        assert_eq!(probe_dir_of(Path::new("data")), PathBuf::from("."));
        assert_eq!(probe_dir_of(Path::new("dir/data")), PathBuf::from("dir"));
        assert_eq!(probe_dir_of(Path::new("/data")), PathBuf::from("/"));
    }

    #[test]
    fn relative_file_lookup_runs_the_probe_in_cwd() {
        struct SeenDir(Mutex<Option<PathBuf>>);

        impl QuirkProbe for SeenDir {
            fn probe(&self, dir: &Path) -> Result<Quirks, ProbeError> {
                *lock(&self.0) = Some(dir.to_path_buf());
                Ok(Quirks::empty())
            }
        }

        // Tests run from the package root.
        let cache = QuirkCache::new(SeenDir(Mutex::new(None)));
        cache.detect(Path::new("Cargo.toml")).unwrap();
        assert_eq!(lock(&cache.probe.0).clone(), Some(PathBuf::from(".")));
    }

    #[test]
    fn second_lookup_is_a_hit() {
        let cache = scripted(vec![Ok(Quirks::BROKEN_FALLOCATE)]);
        let dir = Path::new("/");
        assert_eq!(cache.detect_on(FsId(1), dir).unwrap(), Quirks::BROKEN_FALLOCATE);
        assert_eq!(cache.detect_on(FsId(1), dir).unwrap(), Quirks::BROKEN_FALLOCATE);
        assert_eq!(cache.probe_count(), 1);
        assert_eq!(cache.cached(FsId(1)), Some(Quirks::BROKEN_FALLOCATE));
    }

    #[test]
    fn filesystems_are_cached_separately() {
        let cache = scripted(vec![Ok(Quirks::empty()), Ok(Quirks::NO_USER_XATTR)]);
        cache.detect_on(FsId(1), Path::new("/")).unwrap();
        cache.detect_on(FsId(2), Path::new("/")).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.cached(FsId(2)), Some(Quirks::NO_USER_XATTR));
    }

    #[test]
    fn errors_are_not_cached() {
        let cache = scripted(vec![Err(transient()), Ok(Quirks::empty())]);
        assert!(cache.detect_on(FsId(9), Path::new("/")).is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.detect_on(FsId(9), Path::new("/")).unwrap(), Quirks::empty());
        assert_eq!(cache.probe_count(), 2);
    }

    /// Blocks inside the probe until released, so callers pile up.
    struct Gate {
        entered: Barrier,
        release: Mutex<bool>,
        released: Condvar,
        calls: AtomicUsize,
        outcome: Outcome,
    }

    impl QuirkProbe for Gate {
        fn probe(&self, _dir: &Path) -> Result<Quirks, ProbeError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.wait();
            }
            let mut open = self.release.lock().unwrap();
            while !*open {
                open = self.released.wait(open).unwrap();
            }
            self.outcome.clone()
        }
    }

    fn gated(outcome: Outcome) -> Arc<QuirkCache<Gate>> {
        Arc::new(QuirkCache::new(Gate {
            entered: Barrier::new(2),
            release: Mutex::new(false),
            released: Condvar::new(),
            calls: AtomicUsize::new(0),
            outcome,
        }))
    }

    fn run_concurrently(cache: &Arc<QuirkCache<Gate>>, waiters: usize) -> Vec<Outcome> {
        let leader = {
            let cache = Arc::clone(cache);
            thread::spawn(move || cache.detect_on(FsId(7), Path::new("/")))
        };
        // The leader is now inside the probe and holds the flight.
        cache.probe.entered.wait();

        let followers: Vec<_> = (0..waiters)
            .map(|_| {
                let cache = Arc::clone(cache);
                thread::spawn(move || cache.detect_on(FsId(7), Path::new("/")))
            })
            .collect();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while cache.waiters(FsId(7)) < waiters as u64 {
            assert!(std::time::Instant::now() < deadline, "followers never queued");
            thread::sleep(Duration::from_millis(1));
        }

        *cache.probe.release.lock().unwrap() = true;
        cache.probe.released.notify_all();

        let mut out = vec![leader.join().unwrap()];
        out.extend(followers.into_iter().map(|h| h.join().unwrap()));
        out
    }

    #[test]
    fn concurrent_callers_share_one_probe() {
        let cache = gated(Ok(Quirks::BROKEN_FALLOCATE));
        let results = run_concurrently(&cache, 8);
        assert!(results.iter().all(|r| matches!(r, Ok(q) if *q == Quirks::BROKEN_FALLOCATE)));
        assert_eq!(cache.probe_count(), 1);
        assert_eq!(cache.probe.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_callers_share_one_failure() {
        let cache = gated(Err(transient()));
        let results = run_concurrently(&cache, 4);
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(cache.probe_count(), 1);
        assert!(cache.cached(FsId(7)).is_none());
    }

    #[test]
    fn panicking_probe_is_reported_and_forgotten() {
        struct Panics;
        impl QuirkProbe for Panics {
            fn probe(&self, _dir: &Path) -> Result<Quirks, ProbeError> {
                panic!("probe exploded")
            }
        }
        let cache = QuirkCache::new(Panics);
        let err = cache.detect_on(FsId(3), Path::new("/")).unwrap_err();
        assert!(matches!(err, ProbeError::Panicked));
        assert!(cache.is_empty());
    }

    #[test]
    fn detect_resolves_filesystem_of_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data");
        std::fs::write(&file, b"x").unwrap();
        let cache = scripted(vec![Ok(Quirks::empty())]);

        cache.detect(&file).unwrap();
        cache.detect(dir.path()).unwrap();
        assert_eq!(cache.probe_count(), 1);
    }

    #[test]
    fn detect_missing_path_is_stat_error() {
        let cache = scripted(vec![Ok(Quirks::empty())]);
        let err = cache.detect(Path::new("/nonexistent/fscompat")).unwrap_err();
        assert!(matches!(err, ProbeError::Stat { .. }));
        assert_eq!(cache.probe_count(), 0);
    }
}
