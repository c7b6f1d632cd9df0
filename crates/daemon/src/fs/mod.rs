//! Filesystem core, independent of the FUSE transport
//!
//! # Architecture
//!
//! - `MountRoot`: flat file index, live tree, reload and kernel-facing operations
//! - `DirNode`: in-memory directory hierarchy with in-place merge
//! - `VirtualFile`: one reconstructed file and its lazily built reader
//! - `InodeTable`: path-derived inode numbers and the nodes the kernel holds
//! - `KernelBridge`: cache invalidations, gated on the mount being ready

mod dir_tree;
mod error;
mod inode_table;
mod kernel;
mod root;
mod virtual_file;

#[cfg(test)]
pub(crate) mod testing;

pub use dir_tree::{clean_path, join_path, split_parent, Child, DirAttr, DirNode};
pub use error::{FsError, FsResult};
pub use inode_table::{InodeTable, Node};
pub use kernel::{Invalidation, KernelBridge, KernelNotifier};
pub use root::{DirEntry, MountRoot, NodeAttr, NodeKind, ReloadReport};
pub use virtual_file::VirtualFile;
