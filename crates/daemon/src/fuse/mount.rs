//! Mounting a [`MountRoot`] and keeping the session alive

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fuser::{BackgroundSession, MountOption};
use tokio::runtime::Handle;

use super::media_fs::MediaFs;
use crate::fs::{KernelNotifier, MountRoot};

impl KernelNotifier for fuser::Notifier {
    fn inval_entry(&self, parent: u64, name: &OsStr) -> std::io::Result<()> {
        fuser::Notifier::inval_entry(self, parent, name)
    }

    fn inval_inode(&self, ino: u64) -> std::io::Result<()> {
        fuser::Notifier::inval_inode(self, ino, 0, 0)
    }

    fn delete(&self, parent: u64, child: u64, name: &OsStr) -> std::io::Result<()> {
        fuser::Notifier::delete(self, parent, child, name)
    }
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
    pub attr_ttl: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
            attr_ttl: Duration::from_secs(1),
        }
    }
}

impl MountOptions {
    pub fn fuse_options(&self) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::RO,
            MountOption::FSName("mediadup".to_string()),
            MountOption::Subtype("mediadup".to_string()),
            MountOption::DefaultPermissions,
        ];
        if self.allow_other {
            options.push(MountOption::AllowOther);
        }
        if self.auto_unmount {
            options.push(MountOption::AutoUnmount);
        }
        options
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("mount point {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to mount at {path}: {source}")]
    Mount {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A running FUSE session; unmounts when dropped
pub struct LiveMount {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl std::fmt::Debug for LiveMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveMount")
            .field("mountpoint", &self.mountpoint)
            .field("running", &self.session.is_some())
            .finish()
    }
}

impl LiveMount {
    /// Mount `root` at `mountpoint` on a background session thread
    ///
    /// The kernel notifier is attached before the session starts serving, so
    /// invalidations flow as soon as the init handshake completes.
    pub fn spawn(
        root: Arc<MountRoot>,
        mountpoint: &Path,
        options: &MountOptions,
        runtime: Handle,
    ) -> Result<Self, MountError> {
        if !mountpoint.is_dir() {
            return Err(MountError::NotADirectory(mountpoint.to_path_buf()));
        }
        let mount_err = |source| MountError::Mount {
            path: mountpoint.to_path_buf(),
            source,
        };

        let fs = MediaFs::new(root.clone(), runtime, options.attr_ttl);
        let session = fuser::Session::new(fs, mountpoint, &options.fuse_options())
            .map_err(mount_err)?;
        root.kernel().attach(Box::new(session.notifier()));
        let session = session.spawn().map_err(mount_err)?;

        tracing::info!(mountpoint = %mountpoint.display(), "filesystem mounted");
        Ok(Self {
            session: Some(session),
            mountpoint: mountpoint.to_path_buf(),
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount and wait for the session thread
    pub fn unmount(mut self) {
        if let Some(session) = self.session.take() {
            session.join();
            tracing::info!(mountpoint = %self.mountpoint.display(), "filesystem unmounted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuse_options() {
        let options = MountOptions {
            allow_other: true,
            auto_unmount: false,
            attr_ttl: Duration::from_secs(1),
        };
        let fuse = options.fuse_options();
        assert!(fuse.contains(&MountOption::RO));
        assert!(fuse.contains(&MountOption::DefaultPermissions));
        assert!(fuse.contains(&MountOption::AllowOther));
        assert!(!fuse.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn test_missing_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let perms = Arc::new(crate::permissions::PermissionStore::new(
            crate::permissions::Defaults::owned_by(0, 0),
            None,
        ));
        let root = Arc::new(MountRoot::new(
            &[],
            Arc::new(common::segment::SegmentReaderFactory),
            perms,
        ));
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let err = LiveMount::spawn(
            root,
            &dir.path().join("nope"),
            &MountOptions::default(),
            runtime.handle().clone(),
        )
        .unwrap_err();
        assert!(matches!(err, MountError::NotADirectory(_)));
    }
}
