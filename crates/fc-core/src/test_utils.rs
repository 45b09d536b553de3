//! Test utilities for fc-core.
//!
//! This module provides test infrastructure including:
//! - A simulated credential kernel with fault injection
//! - Common assertions
//! - Environment checks for tests that need root or external tools

use crate::credentials::{CredentialOp, CredentialSyscalls};
use fc_common::{CredentialState, Gid, Uid};
use std::cell::RefCell;
use std::io;
use std::path::Path;
use std::time::Instant;

// ============================================================================
// Macros (must be defined first for use in this module)
// ============================================================================

/// Assert that a Result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($expr:expr, $msg:expr) => {
        match $expr {
            Ok(val) => val,
            Err(e) => panic!("{}: {:?}", $msg, e),
        }
    };
}

/// Assert that a Result is Err.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(val) => panic!("Expected Err, got Ok: {:?}", val),
            Err(_) => {}
        }
    };
    ($expr:expr, $msg:expr) => {
        match $expr {
            Ok(val) => panic!("{}: got Ok({:?})", $msg, val),
            Err(_) => {}
        }
    };
}

// ============================================================================
// Simulated kernel
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Fault {
    op: CredentialOp,
    nth: usize,
    errno: i32,
}

/// In-memory model of one thread's credentials under Linux rules.
///
/// Privilege is modeled as "effective uid is 0". Unprivileged callers may
/// only move ids among their current real/effective/saved values, and
/// `setre[ug]id` moves the saved id along with the effective one whenever
/// the real id is set or the new effective id differs from the old real id.
///
/// Every call is recorded. Faults are matched by operation and occurrence,
/// counted from construction or the last [`clear_calls`].
///
/// [`clear_calls`]: SimulatedKernel::clear_calls
#[derive(Debug)]
pub struct SimulatedKernel {
    state: RefCell<CredentialState>,
    calls: RefCell<Vec<CredentialOp>>,
    faults: RefCell<Vec<Fault>>,
    ignored: RefCell<Vec<CredentialOp>>,
}

impl Default for SimulatedKernel {
    fn default() -> Self {
        Self::root()
    }
}

impl SimulatedKernel {
    /// A thread of a process running as root.
    pub fn root() -> Self {
        Self::with_state(CredentialState::root())
    }

    pub fn with_state(state: CredentialState) -> Self {
        Self {
            state: RefCell::new(state),
            calls: RefCell::new(Vec::new()),
            faults: RefCell::new(Vec::new()),
            ignored: RefCell::new(Vec::new()),
        }
    }

    /// Fail the `nth` (1-based) call of `op` with `errno`.
    pub fn fail_on(self, op: CredentialOp, nth: usize, errno: i32) -> Self {
        self.inject(op, nth, errno);
        self
    }

    pub fn inject(&self, op: CredentialOp, nth: usize, errno: i32) {
        self.faults.borrow_mut().push(Fault { op, nth, errno });
    }

    /// Make `op` report success without changing anything.
    pub fn ignore(self, op: CredentialOp) -> Self {
        self.ignored.borrow_mut().push(op);
        self
    }

    pub fn state(&self) -> CredentialState {
        self.state.borrow().clone()
    }

    pub fn calls(&self) -> Vec<CredentialOp> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Record `op`; returns whether the change should be applied.
    fn enter(&self, op: CredentialOp) -> io::Result<bool> {
        let seen = {
            let mut calls = self.calls.borrow_mut();
            calls.push(op);
            calls.iter().filter(|c| **c == op).count()
        };
        if let Some(fault) = self
            .faults
            .borrow()
            .iter()
            .find(|f| f.op == op && f.nth == seen)
        {
            return Err(io::Error::from_raw_os_error(fault.errno));
        }
        Ok(!self.ignored.borrow().contains(&op))
    }
}

fn eperm() -> io::Error {
    io::Error::from_raw_os_error(libc::EPERM)
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

fn reject_sentinel(ids: &[Option<u32>]) -> io::Result<()> {
    if ids.iter().flatten().any(|id| *id == u32::MAX) {
        return Err(einval());
    }
    Ok(())
}

/// Unprivileged callers may only pick from their current ids.
fn allowed<T: PartialEq + Copy>(want: Option<T>, from: &[T]) -> bool {
    want.map_or(true, |w| from.contains(&w))
}

impl CredentialSyscalls for SimulatedKernel {
    fn setgroups(&self, groups: &[Gid]) -> io::Result<()> {
        let apply = self.enter(CredentialOp::SetGroups)?;
        if groups.iter().any(|g| !g.is_valid()) || groups.len() > 65536 {
            return Err(einval());
        }
        let mut st = self.state.borrow_mut();
        if !st.is_privileged() {
            return Err(eperm());
        }
        if apply {
            st.groups = groups.to_vec();
        }
        Ok(())
    }

    fn setregid(&self, rgid: Option<Gid>, egid: Option<Gid>) -> io::Result<()> {
        let apply = self.enter(CredentialOp::SetReGid)?;
        reject_sentinel(&[rgid.map(|g| g.0), egid.map(|g| g.0)])?;
        let mut st = self.state.borrow_mut();
        if !st.is_privileged()
            && !(allowed(rgid, &[st.rgid, st.egid]) && allowed(egid, &[st.rgid, st.egid, st.sgid]))
        {
            return Err(eperm());
        }
        if apply {
            let old_rgid = st.rgid;
            let new_egid = egid.unwrap_or(st.egid);
            if rgid.is_some() || (egid.is_some() && new_egid != old_rgid) {
                st.sgid = new_egid;
            }
            st.rgid = rgid.unwrap_or(st.rgid);
            st.egid = new_egid;
        }
        Ok(())
    }

    fn setreuid(&self, ruid: Option<Uid>, euid: Option<Uid>) -> io::Result<()> {
        let apply = self.enter(CredentialOp::SetReUid)?;
        reject_sentinel(&[ruid.map(|u| u.0), euid.map(|u| u.0)])?;
        let mut st = self.state.borrow_mut();
        if !st.is_privileged()
            && !(allowed(ruid, &[st.ruid, st.euid]) && allowed(euid, &[st.ruid, st.euid, st.suid]))
        {
            return Err(eperm());
        }
        if apply {
            let old_ruid = st.ruid;
            let new_euid = euid.unwrap_or(st.euid);
            if ruid.is_some() || (euid.is_some() && new_euid != old_ruid) {
                st.suid = new_euid;
            }
            st.ruid = ruid.unwrap_or(st.ruid);
            st.euid = new_euid;
        }
        Ok(())
    }

    fn setresgid(&self, rgid: Option<Gid>, egid: Option<Gid>, sgid: Option<Gid>) -> io::Result<()> {
        let apply = self.enter(CredentialOp::SetResGid)?;
        reject_sentinel(&[rgid.map(|g| g.0), egid.map(|g| g.0), sgid.map(|g| g.0)])?;
        let mut st = self.state.borrow_mut();
        let current = [st.rgid, st.egid, st.sgid];
        if !st.is_privileged()
            && !(allowed(rgid, &current) && allowed(egid, &current) && allowed(sgid, &current))
        {
            return Err(eperm());
        }
        if apply {
            st.rgid = rgid.unwrap_or(st.rgid);
            st.egid = egid.unwrap_or(st.egid);
            st.sgid = sgid.unwrap_or(st.sgid);
        }
        Ok(())
    }

    fn setresuid(&self, ruid: Option<Uid>, euid: Option<Uid>, suid: Option<Uid>) -> io::Result<()> {
        let apply = self.enter(CredentialOp::SetResUid)?;
        reject_sentinel(&[ruid.map(|u| u.0), euid.map(|u| u.0), suid.map(|u| u.0)])?;
        let mut st = self.state.borrow_mut();
        let current = [st.ruid, st.euid, st.suid];
        if !st.is_privileged()
            && !(allowed(ruid, &current) && allowed(euid, &current) && allowed(suid, &current))
        {
            return Err(eperm());
        }
        if apply {
            st.ruid = ruid.unwrap_or(st.ruid);
            st.euid = euid.unwrap_or(st.euid);
            st.suid = suid.unwrap_or(st.suid);
        }
        Ok(())
    }

    fn current(&self) -> io::Result<CredentialState> {
        self.enter(CredentialOp::Read)?;
        Ok(self.state())
    }
}

// ============================================================================
// Environment checks
// ============================================================================

/// Whether the test process runs with effective uid 0.
pub fn running_as_root() -> bool {
    // SAFETY: trivial getter.
    unsafe { libc::geteuid() == 0 }
}

/// Whether `tool` resolves to an executable on `PATH`.
pub fn tool_available(tool: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(tool);
        is_executable(&candidate)
    })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// ============================================================================
// Test Timer
// ============================================================================

/// Test timer for measuring duration of operations.
pub struct TestTimer {
    name: String,
    start: Instant,
}

impl TestTimer {
    /// Start a new timer with the given name.
    pub fn new(name: &str) -> Self {
        let timer = Self {
            name: name.to_string(),
            start: Instant::now(),
        };
        eprintln!("[TIMER] {} started", name);
        timer
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }
}

impl Drop for TestTimer {
    fn drop(&mut self) {
        eprintln!("[TIMER] {} completed in {}ms", self.name, self.elapsed_ms());
    }
}
