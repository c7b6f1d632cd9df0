//! Inode numbers and the set of nodes the kernel currently holds
//!
//! Inode numbers are derived from the path string, so the same path always
//! maps to the same number across reloads. The table itself only tracks
//! which nodes the kernel has been handed (via `lookup`) and not yet
//! forgotten, together with the exact object it was handed.

use std::collections::HashMap;
use std::sync::Arc;

use super::dir_tree::DirNode;
use super::virtual_file::VirtualFile;

/// A node as registered with the kernel
#[derive(Debug, Clone)]
pub enum Node {
    Dir(Arc<DirNode>),
    File { path: String, file: Arc<VirtualFile> },
}

impl Node {
    pub fn path(&self) -> &str {
        match self {
            Node::Dir(dir) => dir.path(),
            Node::File { path, .. } => path,
        }
    }

    pub fn inode(&self) -> u64 {
        InodeTable::inode_for(self.path())
    }

    /// Same underlying object
    pub fn same(&self, other: &Node) -> bool {
        match (self, other) {
            (Node::Dir(a), Node::Dir(b)) => Arc::ptr_eq(a, b),
            (Node::File { file: a, .. }, Node::File { file: b, .. }) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Entry {
    node: Node,
    lookups: u64,
}

#[derive(Debug)]
pub struct InodeTable {
    entries: HashMap<u64, Entry>,
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    /// Create a table with the root pinned
    pub fn new(root: Arc<DirNode>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            Self::ROOT_INODE,
            Entry {
                node: Node::Dir(root),
                lookups: 1,
            },
        );
        Self { entries }
    }

    /// Inode number for a normalized path (`""` is the root)
    pub fn inode_for(path: &str) -> u64 {
        if path.is_empty() {
            return Self::ROOT_INODE;
        }
        let hash = blake3::hash(path.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        match u64::from_le_bytes(bytes) {
            0 | Self::ROOT_INODE => 2,
            ino => ino,
        }
    }

    /// Record that the kernel was handed `node`; returns its inode
    ///
    /// A different object registered under the same inode is replaced.
    pub fn remember(&mut self, node: Node) -> u64 {
        let ino = node.inode();
        match self.entries.get_mut(&ino) {
            Some(entry) => {
                if !entry.node.same(&node) {
                    entry.node = node;
                }
                if ino != Self::ROOT_INODE {
                    entry.lookups += 1;
                }
            }
            None => {
                self.entries.insert(ino, Entry { node, lookups: 1 });
            }
        }
        ino
    }

    /// Drop `nlookup` references; the entry goes away at zero
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == Self::ROOT_INODE {
            return;
        }
        if let Some(entry) = self.entries.get_mut(&ino) {
            entry.lookups = entry.lookups.saturating_sub(nlookup);
            if entry.lookups == 0 {
                self.entries.remove(&ino);
            }
        }
    }

    pub fn get(&self, ino: u64) -> Option<Node> {
        self.entries.get(&ino).map(|entry| entry.node.clone())
    }

    /// Inode of `node` if the kernel holds this very object
    pub fn handle_of(&self, node: &Node) -> Option<u64> {
        let ino = node.inode();
        self.entries
            .get(&ino)
            .filter(|entry| entry.node.same(node))
            .map(|_| ino)
    }
}
