//! Per-thread credential impersonation.
//!
//! This module lets a privileged server act on behalf of an unprivileged
//! caller so the kernel's own permission checks (mode bits, ACLs,
//! supplementary groups, quota, reserved space) apply to the caller:
//! - Thread-scoped identity primitives that never touch sibling threads
//! - A scope that acquires an identity and guarantees its release
//! - A pool of dedicated OS threads that serves impersonated jobs
//!
//! Identity is a property of the OS thread. Code running inside a scope must
//! not migrate to another thread, which is why the scope handle is `!Send`
//! and why async callers should go through [`ImpersonationPool`].

mod pool;
mod scope;
mod sys;

pub use pool::{ImpersonateError, ImpersonationPool, PendingOperation};
pub use scope::{
    current_phase, impersonate, run_as, run_as_with, set_fatal_hook, FatalHook,
    FatalRestoreError, ImpersonationScope, PrivilegeChangeError, ScopePhase,
};
pub use sys::{CredentialOp, CredentialSyscalls, ThreadCredentials};
