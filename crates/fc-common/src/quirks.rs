//! Filesystem quirk flags.
//!
//! A quirk is a known deviation of a filesystem/kernel combination from
//! expected POSIX behavior. Storage-facing code checks these bits to decide
//! whether it may rely on preallocation or extended-attribute metadata.

use bitflags::bitflags;

bitflags! {
    /// Bitmask of detected quirks for one filesystem.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[derive(serde::Serialize, serde::Deserialize)]
    #[serde(transparent)]
    pub struct Quirks: u64 {
        /// Preallocation reports success without a usable reservation.
        const BROKEN_FALLOCATE = 1 << 0;
        /// `user.*` extended attributes cannot be stored.
        const NO_USER_XATTR = 1 << 1;
    }
}

impl Quirks {
    /// Stable snake_case names of the set flags, in bit order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.contains(Quirks::BROKEN_FALLOCATE) {
            out.push("broken_fallocate");
        }
        if self.contains(Quirks::NO_USER_XATTR) {
            out.push("no_user_xattr");
        }
        out
    }

    /// Look up a flag by its stable snake_case name. The generated
    /// `from_name` takes the constant names (`BROKEN_FALLOCATE`) instead.
    pub fn from_snake_name(name: &str) -> Option<Quirks> {
        match name {
            "broken_fallocate" => Some(Quirks::BROKEN_FALLOCATE),
            "no_user_xattr" => Some(Quirks::NO_USER_XATTR),
            _ => None,
        }
    }
}

impl std::fmt::Display for Quirks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", self.names().join("|"))
    }
}
