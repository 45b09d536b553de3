//! Thread-scoped credential primitives.
//!
//! POSIX requires all threads of a process to share credentials, so the libc
//! wrappers (`setreuid(3)`, `setgroups(3)`, ...) signal every thread and
//! repeat the change there. Impersonation needs the opposite: only the
//! calling thread may change. Everything here therefore goes through
//! `syscall(2)` directly, which the kernel applies to the calling task only.
//!
//! 32-bit x86 and 32-bit ARM kept the 16-bit-uid syscalls under the plain
//! names; the 32-bit-uid variants carry a `32` suffix there.

use fc_common::{CredentialState, Gid, Uid};
use std::fmt;
use std::io;

/// One of the identity primitives, used for error attribution and fault
/// injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialOp {
    SetGroups,
    SetReGid,
    SetReUid,
    SetResGid,
    SetResUid,
    Read,
}

impl fmt::Display for CredentialOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialOp::SetGroups => "setgroups",
            CredentialOp::SetReGid => "setregid",
            CredentialOp::SetReUid => "setreuid",
            CredentialOp::SetResGid => "setresgid",
            CredentialOp::SetResUid => "setresuid",
            CredentialOp::Read => "getres[ug]id",
        };
        write!(f, "{}", s)
    }
}

/// Identity-changing primitives acting on the calling OS thread only.
///
/// `None` is the "leave unchanged" sentinel: `setreuid(None, Some(uid))`
/// swaps the effective uid and keeps the real uid used for accounting.
pub trait CredentialSyscalls {
    fn setgroups(&self, groups: &[Gid]) -> io::Result<()>;
    fn setregid(&self, rgid: Option<Gid>, egid: Option<Gid>) -> io::Result<()>;
    fn setreuid(&self, ruid: Option<Uid>, euid: Option<Uid>) -> io::Result<()>;
    fn setresgid(&self, rgid: Option<Gid>, egid: Option<Gid>, sgid: Option<Gid>)
        -> io::Result<()>;
    fn setresuid(&self, ruid: Option<Uid>, euid: Option<Uid>, suid: Option<Uid>)
        -> io::Result<()>;
    /// Snapshot of the calling thread's credentials.
    fn current(&self) -> io::Result<CredentialState>;
}

/// The real kernel primitives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadCredentials;

#[cfg(target_os = "linux")]
mod nr {
    #[cfg(any(target_arch = "x86", target_arch = "arm"))]
    mod table {
        pub const SETGROUPS: libc::c_long = libc::SYS_setgroups32;
        pub const SETREGID: libc::c_long = libc::SYS_setregid32;
        pub const SETREUID: libc::c_long = libc::SYS_setreuid32;
        pub const SETRESGID: libc::c_long = libc::SYS_setresgid32;
        pub const SETRESUID: libc::c_long = libc::SYS_setresuid32;
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "arm")))]
    mod table {
        pub const SETGROUPS: libc::c_long = libc::SYS_setgroups;
        pub const SETREGID: libc::c_long = libc::SYS_setregid;
        pub const SETREUID: libc::c_long = libc::SYS_setreuid;
        pub const SETRESGID: libc::c_long = libc::SYS_setresgid;
        pub const SETRESUID: libc::c_long = libc::SYS_setresuid;
    }

    pub use table::*;
}

#[cfg(target_os = "linux")]
fn raw_id(id: Option<u32>) -> libc::c_long {
    match id {
        // (uid_t)-1, sign-extended the way the kernel ABI expects it
        None => -1,
        Some(v) => v as libc::c_long,
    }
}

#[cfg(target_os = "linux")]
fn check(res: libc::c_long) -> io::Result<()> {
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
impl CredentialSyscalls for ThreadCredentials {
    fn setgroups(&self, groups: &[Gid]) -> io::Result<()> {
        let list: Vec<libc::gid_t> = groups.iter().map(|g| g.0).collect();
        // SAFETY: the kernel only reads `list.len()` entries from a live buffer.
        let res = unsafe {
            libc::syscall(
                nr::SETGROUPS,
                list.len() as libc::c_long,
                list.as_ptr(),
            )
        };
        check(res)
    }

    fn setregid(&self, rgid: Option<Gid>, egid: Option<Gid>) -> io::Result<()> {
        // SAFETY: no memory is passed to the kernel.
        let res = unsafe {
            libc::syscall(
                nr::SETREGID,
                raw_id(rgid.map(|g| g.0)),
                raw_id(egid.map(|g| g.0)),
            )
        };
        check(res)
    }

    fn setreuid(&self, ruid: Option<Uid>, euid: Option<Uid>) -> io::Result<()> {
        // SAFETY: no memory is passed to the kernel.
        let res = unsafe {
            libc::syscall(
                nr::SETREUID,
                raw_id(ruid.map(|u| u.0)),
                raw_id(euid.map(|u| u.0)),
            )
        };
        check(res)
    }

    fn setresgid(
        &self,
        rgid: Option<Gid>,
        egid: Option<Gid>,
        sgid: Option<Gid>,
    ) -> io::Result<()> {
        // SAFETY: no memory is passed to the kernel.
        let res = unsafe {
            libc::syscall(
                nr::SETRESGID,
                raw_id(rgid.map(|g| g.0)),
                raw_id(egid.map(|g| g.0)),
                raw_id(sgid.map(|g| g.0)),
            )
        };
        check(res)
    }

    fn setresuid(
        &self,
        ruid: Option<Uid>,
        euid: Option<Uid>,
        suid: Option<Uid>,
    ) -> io::Result<()> {
        // SAFETY: no memory is passed to the kernel.
        let res = unsafe {
            libc::syscall(
                nr::SETRESUID,
                raw_id(ruid.map(|u| u.0)),
                raw_id(euid.map(|u| u.0)),
                raw_id(suid.map(|u| u.0)),
            )
        };
        check(res)
    }

    fn current(&self) -> io::Result<CredentialState> {
        let (mut ruid, mut euid, mut suid) = (0, 0, 0);
        let (mut rgid, mut egid, mut sgid) = (0, 0, 0);
        // SAFETY: the out-pointers reference live stack locals.
        if unsafe { libc::getresuid(&mut ruid, &mut euid, &mut suid) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        if unsafe { libc::getresgid(&mut rgid, &mut egid, &mut sgid) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(CredentialState {
            ruid: Uid(ruid),
            euid: Uid(euid),
            suid: Uid(suid),
            rgid: Gid(rgid),
            egid: Gid(egid),
            sgid: Gid(sgid),
            groups: current_groups()?,
        })
    }
}

#[cfg(target_os = "linux")]
fn current_groups() -> io::Result<Vec<Gid>> {
    // EINVAL means the list grew between the sizing call and the read.
    for _ in 0..3 {
        // SAFETY: size query, no buffer is written.
        let n = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut buf: Vec<libc::gid_t> = vec![0; n as usize];
        // SAFETY: `buf` holds exactly `n` entries.
        let got = unsafe { libc::getgroups(n, buf.as_mut_ptr()) };
        if got >= 0 {
            buf.truncate(got as usize);
            return Ok(buf.into_iter().map(Gid).collect());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(err);
        }
    }
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

#[cfg(not(target_os = "linux"))]
impl CredentialSyscalls for ThreadCredentials {
    fn setgroups(&self, _groups: &[Gid]) -> io::Result<()> {
        Err(unsupported())
    }

    fn setregid(&self, _rgid: Option<Gid>, _egid: Option<Gid>) -> io::Result<()> {
        Err(unsupported())
    }

    fn setreuid(&self, _ruid: Option<Uid>, _euid: Option<Uid>) -> io::Result<()> {
        Err(unsupported())
    }

    fn setresgid(
        &self,
        _rgid: Option<Gid>,
        _egid: Option<Gid>,
        _sgid: Option<Gid>,
    ) -> io::Result<()> {
        Err(unsupported())
    }

    fn setresuid(
        &self,
        _ruid: Option<Uid>,
        _euid: Option<Uid>,
        _suid: Option<Uid>,
    ) -> io::Result<()> {
        Err(unsupported())
    }

    fn current(&self) -> io::Result<CredentialState> {
        Err(unsupported())
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "per-thread credentials are only available on Linux",
    )
}
