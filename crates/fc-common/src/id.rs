//! User, group, and filesystem identity types.
//!
//! A thread's identity is the tuple of real/effective/saved user and group
//! ids plus its supplementary group list. [`Identity`] is what a caller asks
//! to become; [`CredentialState`] is what a thread actually holds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// User ID wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u32);

/// Group ID wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gid(pub u32);

impl Uid {
    pub const ROOT: Uid = Uid(0);

    /// The kernel treats `(uid_t)-1` as "leave unchanged", so it can never
    /// name a real user.
    pub fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl Gid {
    pub const ROOT: Gid = Gid(0);

    pub fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Uid {
    fn from(uid: u32) -> Self {
        Uid(uid)
    }
}

impl From<u32> for Gid {
    fn from(gid: u32) -> Self {
        Gid(gid)
    }
}

/// The identity a caller wants the current thread to assume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
    /// Supplementary groups, in the order the caller supplied them.
    #[serde(default)]
    pub groups: Vec<Gid>,
}

impl Identity {
    pub fn new(uid: impl Into<Uid>, gid: impl Into<Gid>) -> Self {
        Identity {
            uid: uid.into(),
            gid: gid.into(),
            groups: Vec::new(),
        }
    }

    pub fn with_groups<I, G>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = G>,
        G: Into<Gid>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn root() -> Self {
        Identity::new(Uid::ROOT, Gid::ROOT)
    }

    /// Name of the first field that holds the "unchanged" sentinel, if any.
    pub fn invalid_field(&self) -> Option<&'static str> {
        if !self.uid.is_valid() {
            return Some("uid");
        }
        if !self.gid.is_valid() {
            return Some("gid");
        }
        if self.groups.iter().any(|g| !g.is_valid()) {
            return Some("groups");
        }
        None
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uid={} gid={}", self.uid, self.gid)?;
        if !self.groups.is_empty() {
            let groups: Vec<String> = self.groups.iter().map(|g| g.to_string()).collect();
            write!(f, " groups={}", groups.join(","))?;
        }
        Ok(())
    }
}

/// Full credential snapshot of one OS thread.
///
/// Includes the saved set-user-ID and set-group-ID: a restore that leaves
/// them stale is not a complete restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialState {
    pub ruid: Uid,
    pub euid: Uid,
    pub suid: Uid,
    pub rgid: Gid,
    pub egid: Gid,
    pub sgid: Gid,
    pub groups: Vec<Gid>,
}

impl CredentialState {
    /// A thread that has never changed identity under a root process.
    pub fn root() -> Self {
        CredentialState {
            ruid: Uid::ROOT,
            euid: Uid::ROOT,
            suid: Uid::ROOT,
            rgid: Gid::ROOT,
            egid: Gid::ROOT,
            sgid: Gid::ROOT,
            groups: Vec::new(),
        }
    }

    /// Whether the effective uid carries the privilege to change identity.
    pub fn is_privileged(&self) -> bool {
        self.euid == Uid::ROOT
    }

    /// The identity used for permission checks.
    pub fn effective_identity(&self) -> Identity {
        Identity {
            uid: self.euid,
            gid: self.egid,
            groups: self.groups.clone(),
        }
    }

    /// Real, effective and saved ids all agree for both uid and gid.
    pub fn shadow_consistent(&self) -> bool {
        self.ruid == self.euid
            && self.euid == self.suid
            && self.rgid == self.egid
            && self.egid == self.sgid
    }

    /// Names of the fields that differ between `self` and `other`.
    pub fn diff(&self, other: &CredentialState) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.ruid != other.ruid {
            fields.push("ruid");
        }
        if self.euid != other.euid {
            fields.push("euid");
        }
        if self.suid != other.suid {
            fields.push("suid");
        }
        if self.rgid != other.rgid {
            fields.push("rgid");
        }
        if self.egid != other.egid {
            fields.push("egid");
        }
        if self.sgid != other.sgid {
            fields.push("sgid");
        }
        if self.groups != other.groups {
            fields.push("groups");
        }
        fields
    }
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.groups.iter().map(|g| g.to_string()).collect();
        write!(
            f,
            "uid={}/{}/{} gid={}/{}/{} groups=[{}]",
            self.ruid,
            self.euid,
            self.suid,
            self.rgid,
            self.egid,
            self.sgid,
            groups.join(",")
        )
    }
}

/// Filesystem identity: the device number a path resides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FsId(pub u64);

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // major:minor is how mount tables print it
        let major = ((self.0 >> 8) & 0xfff) | ((self.0 >> 32) & 0xffff_f000);
        let minor = (self.0 & 0xff) | ((self.0 >> 12) & 0xffff_ff00);
        write!(f, "{}:{}", major, minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_builder_collects_groups() {
        let id = Identity::new(1235, 1235).with_groups([1234u32, 1236]);
        assert_eq!(id.uid, Uid(1235));
        assert_eq!(id.groups, vec![Gid(1234), Gid(1236)]);
        assert_eq!(id.to_string(), "uid=1235 gid=1235 groups=1234,1236");
    }

    #[test]
    fn sentinel_ids_are_invalid_targets() {
        assert_eq!(Identity::new(u32::MAX, 1).invalid_field(), Some("uid"));
        assert_eq!(Identity::new(1, u32::MAX).invalid_field(), Some("gid"));
        assert_eq!(
            Identity::new(1, 1).with_groups([u32::MAX]).invalid_field(),
            Some("groups")
        );
        assert_eq!(Identity::new(1, 1).invalid_field(), None);
    }

    #[test]
    fn root_state_is_privileged_and_consistent() {
        let state = CredentialState::root();
        assert!(state.is_privileged());
        assert!(state.shadow_consistent());
    }

    #[test]
    fn stale_saved_uid_is_inconsistent() {
        let mut state = CredentialState::root();
        state.suid = Uid(1234);
        assert!(!state.shadow_consistent());
        assert_eq!(state.diff(&CredentialState::root()), vec!["suid"]);
    }

    #[test]
    fn diff_lists_every_changed_field() {
        let a = CredentialState::root();
        let b = CredentialState {
            euid: Uid(7),
            egid: Gid(8),
            groups: vec![Gid(9)],
            ..CredentialState::root()
        };
        assert_eq!(a.diff(&b), vec!["euid", "egid", "groups"]);
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn effective_identity_uses_effective_ids() {
        let state = CredentialState {
            euid: Uid(1000),
            egid: Gid(100),
            groups: vec![Gid(5)],
            ..CredentialState::root()
        };
        assert_eq!(
            state.effective_identity(),
            Identity::new(1000, 100).with_groups([5u32])
        );
    }

    #[test]
    fn fs_id_displays_major_minor() {
        // makedev(8, 1)
        assert_eq!(FsId(0x801).to_string(), "8:1");
    }

    #[test]
    fn uid_serializes_transparently() {
        assert_eq!(serde_json::to_string(&Uid(42)).unwrap(), "42");
    }
}
