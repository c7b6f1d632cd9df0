//! Kernel cache invalidation
//!
//! The FUSE notifier only exists once a session has been created and may only
//! be used after the kernel has completed the `init` handshake. [`KernelBridge`]
//! models that as a one-way transition: notifications are dropped until the
//! notifier is attached *and* the mount is marked ready.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

/// Kernel cache invalidation primitives
pub trait KernelNotifier: Send + Sync {
    /// Forget the cached lookup (positive or negative) of `name` in `parent`
    fn inval_entry(&self, parent: u64, name: &OsStr) -> std::io::Result<()>;

    /// Drop cached attributes and content of `ino`
    fn inval_inode(&self, ino: u64) -> std::io::Result<()>;

    /// Tell the kernel that `child`, cached as `name` in `parent`, is gone
    fn delete(&self, parent: u64, child: u64, name: &OsStr) -> std::io::Result<()>;
}

/// One invalidation to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Entry { parent: u64, name: String },
    Content { ino: u64 },
    Delete { parent: u64, child: u64, name: String },
}

#[derive(Default)]
pub struct KernelBridge {
    notifier: OnceLock<Box<dyn KernelNotifier>>,
    ready: AtomicBool,
}

impl std::fmt::Debug for KernelBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBridge")
            .field("attached", &self.notifier.get().is_some())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl KernelBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the notifier; later calls are ignored
    pub fn attach(&self, notifier: Box<dyn KernelNotifier>) {
        if self.notifier.set(notifier).is_err() {
            tracing::warn!("kernel notifier already attached");
        }
    }

    /// Called once the kernel has finished the init handshake
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn get(&self) -> Option<&dyn KernelNotifier> {
        if !self.is_ready() {
            return None;
        }
        self.notifier.get().map(|n| n.as_ref())
    }

    /// Deliver invalidations in order; returns how many were sent
    ///
    /// Must not be called while holding any filesystem lock: the kernel can
    /// call back into the filesystem while processing a notification.
    pub fn send(&self, batch: &[Invalidation]) -> usize {
        let Some(notifier) = self.get() else {
            if !batch.is_empty() {
                tracing::debug!(count = batch.len(), "mount not ready, skipping invalidations");
            }
            return 0;
        };

        let mut sent = 0;
        for item in batch {
            let result = match item {
                Invalidation::Entry { parent, name } => {
                    notifier.inval_entry(*parent, OsStr::new(name))
                }
                Invalidation::Content { ino } => notifier.inval_inode(*ino),
                Invalidation::Delete {
                    parent,
                    child,
                    name,
                } => notifier.delete(*parent, *child, OsStr::new(name)),
            };
            match result {
                Ok(()) => sent += 1,
                // ENOENT just means the kernel had nothing cached
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => tracing::debug!(?item, error = %e, "kernel invalidation failed"),
            }
        }
        sent
    }
}
