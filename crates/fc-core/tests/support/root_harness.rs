//! Harness for tests that need real root privileges.
//!
//! Provides the root check, a skip macro, and loop-mounted scratch
//! filesystems that are detached on drop.

#![allow(dead_code)]
// Test support intentionally provides more helpers than any single test uses.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

pub use fc_core::test_utils::{running_as_root as is_root, tool_available};

/// Return early from the current test unless running as root with every
/// named tool on `PATH`.
#[macro_export]
macro_rules! require_root {
    ($($tool:expr),* $(,)?) => {
        if !$crate::support::root_harness::is_root() {
            fc_core::test_log!(INFO, "Skipping: must run as root");
            return;
        }
        $(
            if !$crate::support::root_harness::tool_available($tool) {
                fc_core::test_log!(INFO, "Skipping: tool not found", tool = $tool);
                return;
            }
        )*
    };
}

fn run(cmd: &mut Command) -> io::Result<()> {
    let out = cmd.output()?;
    if out.status.success() {
        return Ok(());
    }
    Err(io::Error::other(format!(
        "{:?} failed ({}): {}",
        cmd,
        out.status,
        String::from_utf8_lossy(&out.stderr).trim()
    )))
}

/// A freshly formatted filesystem on a loop-mounted image file.
#[derive(Debug)]
pub struct LoopFs {
    dir: tempfile::TempDir,
    image: PathBuf,
    mount: PathBuf,
}

impl LoopFs {
    /// Format a `size`-byte image as `fstype` and mount it.
    pub fn create(fstype: &str, size: u64) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("fc-loopfs-").tempdir()?;
        let image = dir.path().join(format!("{fstype}.img"));
        File::create(&image)?.set_len(size)?;

        let flags: &[&str] = match fstype {
            "btrfs" => &["-q", "-f"],
            // mkfs.fat has no quiet mode, and -F picks the FAT size.
            "vfat" => &[],
            _ => &["-q", "-F"],
        };
        run(Command::new(format!("mkfs.{fstype}"))
            .args(flags)
            .arg(&image))?;

        let mount = dir.path().join("mnt");
        fs::create_dir(&mount)?;
        run(Command::new("mount").arg("-o").arg("loop").arg(&image).arg(&mount))?;

        Ok(Self { dir, image, mount })
    }

    pub fn path(&self) -> &Path {
        &self.mount
    }

    pub fn image(&self) -> &Path {
        &self.image
    }
}

impl Drop for LoopFs {
    fn drop(&mut self) {
        // Lazy detach: a straggling fd from a failed test must not wedge
        // the cleanup.
        let _ = Command::new("umount").arg("-l").arg(&self.mount).status();
    }
}

/// Directory under the system temp dir that other users may traverse.
pub fn shared_tempdir() -> io::Result<tempfile::TempDir> {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::Builder::new().prefix("fc-root-").tempdir()?;
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;
    Ok(dir)
}
