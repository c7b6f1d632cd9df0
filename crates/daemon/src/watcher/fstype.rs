//! Decide between push notifications and polling for a source directory
//!
//! inotify only sees changes made through the local kernel. Network and
//! userspace filesystems can change underneath us, so those are polled.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Push,
    Poll,
}

/// Filesystem magic numbers (`statfs.f_type`) that need polling
#[cfg(target_os = "linux")]
const POLLED_FILESYSTEMS: &[(u32, &str)] = &[
    (0x0000_6969, "nfs"),
    (0xFF53_4D42, "cifs"),
    (0xFE53_4D42, "smb2"),
    (0x0000_517B, "smb"),
    (0x6573_5546, "fuse"),
    (0x0102_1997, "9p"),
    (0x5346_414F, "afs"),
    (0x0000_564C, "ncp"),
    (0x7375_7245, "coda"),
    (0x00C3_6400, "ceph"),
    (0x0BD0_0BD0, "lustre"),
    (0x4750_4653, "gpfs"),
];

/// How changes under `dir` should be detected
///
/// Directories that cannot be inspected are polled.
pub fn watch_mode(dir: &Path) -> WatchMode {
    match filesystem_name(dir) {
        Ok(Some(name)) => {
            tracing::debug!(dir = %dir.display(), fs = name, "remote filesystem, polling");
            WatchMode::Poll
        }
        Ok(None) => WatchMode::Push,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "statfs failed, polling");
            WatchMode::Poll
        }
    }
}

/// Name of the filesystem under `dir` if it is one we poll
#[cfg(target_os = "linux")]
fn filesystem_name(dir: &Path) -> std::io::Result<Option<&'static str>> {
    let stat = nix::sys::statfs::statfs(dir)?;

    // f_type width differs between targets; every magic fits in 32 bits
    let magic = stat.filesystem_type().0 as u32;
    Ok(POLLED_FILESYSTEMS
        .iter()
        .find(|(m, _)| *m == magic)
        .map(|(_, name)| *name))
}

#[cfg(not(target_os = "linux"))]
fn filesystem_name(dir: &Path) -> std::io::Result<Option<&'static str>> {
    std::fs::metadata(dir).map(|_| None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_directory_is_polled() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert_eq!(watch_mode(&missing), WatchMode::Poll);
    }

    #[test]
    fn test_interior_nul_is_polled() {
        use std::os::unix::ffi::OsStrExt;
        let path = Path::new(std::ffi::OsStr::from_bytes(b"/tmp/a\0b"));
        assert_eq!(watch_mode(path), WatchMode::Poll);
    }

    #[test]
    fn test_existing_directory_is_inspected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(filesystem_name(dir.path()).is_ok());
        assert!(filesystem_name(&dir.path().join("missing")).is_err());
    }
}
