//! FUSE transport for the mediadup filesystem
//!
//! # Architecture
//!
//! - `MediaFs`: fuser `Filesystem` adapter translating callbacks into
//!   [`crate::fs::MountRoot`] operations
//! - `LiveMount`: session lifecycle; attaches the kernel notifier to the root

mod media_fs;
mod mount;

pub use media_fs::MediaFs;
pub use mount::{LiveMount, MountError, MountOptions};
