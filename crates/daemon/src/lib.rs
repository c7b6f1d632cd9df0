// Filesystem core
pub mod fs;
pub mod permissions;
pub mod watcher;

// Kernel transport
#[cfg(feature = "fuse")]
pub mod fuse;

// Service wiring and command line
pub mod cli;
pub mod service;
pub mod service_config;

pub use fs::{FsError, MountRoot, ReloadReport, VirtualFile};
pub use permissions::{Defaults, PermissionStore};
pub use service::{Service, ServiceError};
pub use service_config::Config as ServiceConfig;
pub use watcher::{ChangePolicy, SourceWatcher, WatcherConfig};
