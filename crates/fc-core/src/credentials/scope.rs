//! Impersonation scope: assume a caller's identity on the current thread and
//! guarantee the thread gets its own identity back.
//!
//! Ordering is what makes this correct:
//! - acquire: supplementary groups, then gid, then uid (changing the uid
//!   away from root forfeits the right to change the other two)
//! - release: uid first (regains privilege), then gid, then groups, then the
//!   saved-id shadows, then a read-back that must match the snapshot
//!
//! Only the effective half of each uid/gid pair is swapped; the real ids stay
//! put for accounting. The uid switch pins the saved uid to the original
//! effective uid, so the thread can take it back even when its real uid is
//! not root (a setuid-root process).
//!
//! A release that fails leaves the thread with an unknown identity. That is
//! not recoverable: the thread is marked [`ScopePhase::Retired`] and
//! [`FatalRestoreError::terminate`] ends the process.

use super::sys::{CredentialOp, CredentialSyscalls, ThreadCredentials};
use crate::logging::event_names;
use fc_common::{CredentialState, Identity};
use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Where the calling thread is in the impersonation state machine.
///
/// `Unbound -> Privileged -> Impersonating -> Privileged -> Unbound`.
/// `Retired` is entered only when a restore fails; nothing leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePhase {
    /// No scope is active on this thread.
    Unbound,
    /// A scope holds a snapshot of the original identity, which is in force.
    Privileged,
    /// The target identity is in force.
    Impersonating,
    /// A restore failed; the thread must not serve another operation.
    Retired,
}

thread_local! {
    static PHASE: Cell<ScopePhase> = const { Cell::new(ScopePhase::Unbound) };
}

/// Phase of the calling thread.
pub fn current_phase() -> ScopePhase {
    PHASE.with(Cell::get)
}

fn set_phase(phase: ScopePhase) {
    PHASE.with(|p| p.set(phase));
}

/// Acquisition was refused. The thread is back at its original identity.
#[derive(Debug, Error)]
pub enum PrivilegeChangeError {
    #[error("{op} rejected while switching to {target}: {source}")]
    Rejected {
        op: CredentialOp,
        target: Identity,
        #[source]
        source: io::Error,
    },
    #[error("invalid impersonation target: {field} holds the unchanged sentinel")]
    InvalidTarget { field: &'static str },
    #[error("thread is already impersonating; scopes do not nest")]
    Nested,
    #[error("thread was retired after a failed restore")]
    ThreadRetired,
}

impl PrivilegeChangeError {
    /// The kernel errno behind a rejection, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            PrivilegeChangeError::Rejected { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Restoring the original identity failed. Process-fatal.
#[derive(Debug, Error)]
pub enum FatalRestoreError {
    #[error("{op} failed while restoring {expected}: {source}")]
    Syscall {
        op: CredentialOp,
        expected: CredentialState,
        #[source]
        source: io::Error,
    },
    #[error("credentials after restore differ in {fields:?}: expected {expected}, got {actual}")]
    Mismatch {
        expected: CredentialState,
        actual: CredentialState,
        fields: Vec<&'static str>,
    },
}

/// Called by [`FatalRestoreError::terminate`] before the process aborts.
pub type FatalHook = fn(&FatalRestoreError);

static FATAL_HOOK: RwLock<Option<FatalHook>> = RwLock::new(None);

/// Install a hook that runs before a fatal restore error aborts the process.
///
/// A hook may flush state or panic (test harnesses use that to observe the
/// fatal path); if it returns, the process still aborts.
pub fn set_fatal_hook(hook: Option<FatalHook>) {
    let mut slot = FATAL_HOOK
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *slot = hook;
}

impl FatalRestoreError {
    /// Log, run the fatal hook, abort.
    pub fn terminate(self) -> ! {
        set_phase(ScopePhase::Retired);
        error!(
            target: event_names::IMPERSONATE_RESTORE_FAILED,
            error = %self,
            "thread identity could not be restored; terminating"
        );
        let hook = *FATAL_HOOK
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(hook) = hook {
            hook(&self);
        }
        std::process::abort()
    }
}

impl From<PrivilegeChangeError> for fc_common::Error {
    fn from(err: PrivilegeChangeError) -> Self {
        match err {
            PrivilegeChangeError::InvalidTarget { field } => {
                fc_common::Error::InvalidTarget(field.to_string())
            }
            PrivilegeChangeError::Nested => fc_common::Error::NestedImpersonation,
            other => fc_common::Error::PrivilegeChange(other.to_string()),
        }
    }
}

impl From<FatalRestoreError> for fc_common::Error {
    fn from(err: FatalRestoreError) -> Self {
        fc_common::Error::FatalRestore(err.to_string())
    }
}

/// How far acquisition got before a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Applied {
    Nothing,
    Groups,
    Gid,
}

/// An active impersonation on the current thread.
///
/// The handle is neither `Send` nor `Sync`: it must be released on the
/// thread that created it. Dropping it without calling [`release`] restores
/// the identity as well, and aborts the process if that fails.
///
/// [`release`]: ImpersonationScope::release
#[must_use = "dropping the scope immediately restores the original identity"]
pub struct ImpersonationScope<'a, S: CredentialSyscalls + ?Sized = ThreadCredentials> {
    sys: &'a S,
    saved: CredentialState,
    target: Identity,
    released: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl<S: CredentialSyscalls + ?Sized> std::fmt::Debug for ImpersonationScope<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpersonationScope")
            .field("saved", &self.saved)
            .field("target", &self.target)
            .field("released", &self.released)
            .finish()
    }
}

/// Begin impersonating `target` on the current thread using the real
/// kernel primitives.
pub fn impersonate(target: &Identity) -> Result<ImpersonationScope<'static>, PrivilegeChangeError> {
    static SYS: ThreadCredentials = ThreadCredentials;
    ImpersonationScope::begin(&SYS, target)
}

/// Run `body` as `target` on the current thread.
///
/// The identity is restored on every exit path, including a panic in `body`.
/// A failed restore terminates the process.
pub fn run_as<T>(target: &Identity, body: impl FnOnce() -> T) -> Result<T, PrivilegeChangeError> {
    run_as_with(&ThreadCredentials, target, body)
}

/// [`run_as`] against an explicit set of primitives.
pub fn run_as_with<S, T>(
    sys: &S,
    target: &Identity,
    body: impl FnOnce() -> T,
) -> Result<T, PrivilegeChangeError>
where
    S: CredentialSyscalls + ?Sized,
{
    let scope = ImpersonationScope::begin(sys, target)?;
    let out = body();
    if let Err(err) = scope.release() {
        err.terminate();
    }
    Ok(out)
}

impl<'a, S: CredentialSyscalls + ?Sized> ImpersonationScope<'a, S> {
    /// Switch the calling thread to `target`.
    ///
    /// The caller must hold the privilege to change identity and must keep
    /// the current task on this OS thread until the scope ends. If any step
    /// is refused, the steps already taken are undone before returning.
    pub fn begin(sys: &'a S, target: &Identity) -> Result<Self, PrivilegeChangeError> {
        if let Some(field) = target.invalid_field() {
            return Err(PrivilegeChangeError::InvalidTarget { field });
        }
        match current_phase() {
            ScopePhase::Unbound => {}
            ScopePhase::Retired => return Err(PrivilegeChangeError::ThreadRetired),
            ScopePhase::Privileged | ScopePhase::Impersonating => {
                return Err(PrivilegeChangeError::Nested)
            }
        }

        debug!(
            target: event_names::IMPERSONATE_BEGIN,
            uid = target.uid.0,
            gid = target.gid.0,
            groups = ?target.groups,
            "begin impersonation"
        );

        let saved = sys
            .current()
            .map_err(|source| PrivilegeChangeError::Rejected {
                op: CredentialOp::Read,
                target: target.clone(),
                source,
            })?;
        set_phase(ScopePhase::Privileged);

        if let Err((op, applied, source)) = acquire(sys, &saved, target) {
            warn!(
                target: event_names::IMPERSONATE_ROLLBACK,
                op = %op,
                error = %source,
                uid = target.uid.0,
                "identity change rejected; rolling back"
            );
            if let Err(err) = rollback(sys, &saved, applied) {
                err.terminate();
            }
            set_phase(ScopePhase::Unbound);
            return Err(PrivilegeChangeError::Rejected {
                op,
                target: target.clone(),
                source,
            });
        }

        set_phase(ScopePhase::Impersonating);
        trace!(
            target: event_names::IMPERSONATE_ACQUIRED,
            uid = target.uid.0,
            gid = target.gid.0,
            "impersonation active"
        );

        Ok(ImpersonationScope {
            sys,
            saved,
            target: target.clone(),
            released: false,
            _thread_bound: PhantomData,
        })
    }

    /// The identity that will be restored.
    pub fn saved(&self) -> &CredentialState {
        &self.saved
    }

    /// The identity currently assumed.
    pub fn target(&self) -> &Identity {
        &self.target
    }

    /// Phase of the owning thread; `Impersonating` while the scope is live.
    pub fn phase(&self) -> ScopePhase {
        current_phase()
    }

    /// Restore the original identity and end the scope.
    ///
    /// An error here is fatal: the caller must retire the thread and
    /// terminate, normally via [`FatalRestoreError::terminate`].
    pub fn release(mut self) -> Result<(), FatalRestoreError> {
        self.released = true;
        restore(self.sys, &self.saved)
    }
}

impl<S: CredentialSyscalls + ?Sized> Drop for ImpersonationScope<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = restore(self.sys, &self.saved) {
            err.terminate();
        }
    }
}

/// Groups, then gid, then uid. On failure, reports the refused step and how
/// much had already been applied.
///
/// `setreuid` would move the saved uid to the target whenever the real uid
/// differs from it, leaving nothing to regain privilege from. The uid step
/// therefore sets the saved uid explicitly to the uid being given up.
fn acquire<S: CredentialSyscalls + ?Sized>(
    sys: &S,
    saved: &CredentialState,
    target: &Identity,
) -> Result<(), (CredentialOp, Applied, io::Error)> {
    sys.setgroups(&target.groups)
        .map_err(|e| (CredentialOp::SetGroups, Applied::Nothing, e))?;
    sys.setregid(None, Some(target.gid))
        .map_err(|e| (CredentialOp::SetReGid, Applied::Groups, e))?;
    sys.setresuid(None, Some(target.uid), Some(saved.euid))
        .map_err(|e| (CredentialOp::SetResUid, Applied::Gid, e))
}

fn syscall_err(op: CredentialOp, expected: &CredentialState) -> impl FnOnce(io::Error) -> FatalRestoreError + '_ {
    move |source| FatalRestoreError::Syscall {
        op,
        expected: expected.clone(),
        source,
    }
}

/// Reverse-order restore of `saved`, including the saved-id shadows.
fn restore<S: CredentialSyscalls + ?Sized>(
    sys: &S,
    saved: &CredentialState,
) -> Result<(), FatalRestoreError> {
    let res = restore_inner(sys, saved);
    match &res {
        Ok(()) => {
            set_phase(ScopePhase::Unbound);
            debug!(
                target: event_names::IMPERSONATE_RELEASED,
                euid = saved.euid.0,
                egid = saved.egid.0,
                "identity restored"
            );
        }
        Err(_) => set_phase(ScopePhase::Retired),
    }
    res
}

fn restore_inner<S: CredentialSyscalls + ?Sized>(
    sys: &S,
    saved: &CredentialState,
) -> Result<(), FatalRestoreError> {
    sys.setreuid(None, Some(saved.euid))
        .map_err(syscall_err(CredentialOp::SetReUid, saved))?;
    set_phase(ScopePhase::Privileged);
    sys.setregid(None, Some(saved.egid))
        .map_err(syscall_err(CredentialOp::SetReGid, saved))?;
    sys.setgroups(&saved.groups)
        .map_err(syscall_err(CredentialOp::SetGroups, saved))?;
    reconcile_shadows(sys, saved)?;
    verify(sys, saved)
}

/// Undo a partial acquisition. The uid was never changed, so privilege is
/// still held.
fn rollback<S: CredentialSyscalls + ?Sized>(
    sys: &S,
    saved: &CredentialState,
    applied: Applied,
) -> Result<(), FatalRestoreError> {
    if applied >= Applied::Gid {
        sys.setregid(None, Some(saved.egid))
            .map_err(syscall_err(CredentialOp::SetReGid, saved))?;
    }
    if applied >= Applied::Groups {
        sys.setgroups(&saved.groups)
            .map_err(syscall_err(CredentialOp::SetGroups, saved))?;
    }
    if applied >= Applied::Gid {
        sys.setresgid(Some(saved.rgid), Some(saved.egid), Some(saved.sgid))
            .map_err(syscall_err(CredentialOp::SetResGid, saved))?;
    }
    verify(sys, saved)
}

/// `setre[ug]id` moved the saved ids along with the effective ones; put all
/// three back explicitly.
fn reconcile_shadows<S: CredentialSyscalls + ?Sized>(
    sys: &S,
    saved: &CredentialState,
) -> Result<(), FatalRestoreError> {
    sys.setresuid(Some(saved.ruid), Some(saved.euid), Some(saved.suid))
        .map_err(syscall_err(CredentialOp::SetResUid, saved))?;
    sys.setresgid(Some(saved.rgid), Some(saved.egid), Some(saved.sgid))
        .map_err(syscall_err(CredentialOp::SetResGid, saved))
}

fn verify<S: CredentialSyscalls + ?Sized>(
    sys: &S,
    saved: &CredentialState,
) -> Result<(), FatalRestoreError> {
    let actual = sys
        .current()
        .map_err(syscall_err(CredentialOp::Read, saved))?;
    if actual == *saved {
        return Ok(());
    }
    let fields = saved.diff(&actual);
    Err(FatalRestoreError::Mismatch {
        expected: saved.clone(),
        actual,
        fields,
    })
}
