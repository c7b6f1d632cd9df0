//! The mount root: flat file index, live directory tree and kernel bookkeeping
//!
//! [`MountRoot`] owns everything the kernel-facing adapter needs and is the
//! only place that reconciles the mount with a new set of [`MountEntry`]s.
//! Operations here are synchronous and free of any FUSE types so they can be
//! driven directly from tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};

use common::config::MountEntry;
use common::reader::ReaderFactory;

use super::dir_tree::{apply_perm_change, clean_path, split_parent, Child, DirNode};
use super::error::{FsError, FsResult};
use super::inode_table::{InodeTable, Node};
use super::kernel::{Invalidation, KernelBridge};
use super::virtual_file::VirtualFile;
use crate::permissions::{Caller, EntryKind, PermissionStore, ResolvedPerms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Attributes handed to the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub perms: ResolvedPerms,
    pub nlink: u32,
    pub mtime: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: NodeKind,
    pub name: String,
}

/// Outcome of a reload, for logging
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReloadReport {
    pub added: usize,
    pub removed: usize,
    /// Names kept whose encoding, source directory or size changed
    pub updated: usize,
    pub unchanged: usize,
    /// Entries whose encoding could not be opened
    pub skipped: usize,
    pub notifications: usize,
}

pub struct MountRoot {
    files: RwLock<HashMap<String, Arc<VirtualFile>>>,
    tree: Arc<DirNode>,
    inodes: Mutex<InodeTable>,
    perms: Arc<PermissionStore>,
    factory: Arc<dyn ReaderFactory>,
    kernel: KernelBridge,
    reload_lock: Mutex<()>,
    mounted_at: SystemTime,
}

impl std::fmt::Debug for MountRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountRoot")
            .field("files", &self.files.read().len())
            .field("kernel", &self.kernel)
            .finish()
    }
}

impl MountRoot {
    /// Initial build from resolved mount entries
    ///
    /// Entries whose encoding cannot be opened are skipped. Permission
    /// overlays for paths that are not part of the resulting tree are pruned.
    pub fn new(
        entries: &[MountEntry],
        factory: Arc<dyn ReaderFactory>,
        perms: Arc<PermissionStore>,
    ) -> Self {
        let (fresh, skipped) = probe_entries(entries, &factory);
        let files: HashMap<String, Arc<VirtualFile>> = fresh
            .into_iter()
            .map(|(name, file)| (name, Arc::new(file)))
            .collect();
        let tree = DirNode::build(&sorted_files(&files), perms.clone());

        let root = Self {
            inodes: Mutex::new(InodeTable::new(tree.clone())),
            files: RwLock::new(files),
            tree,
            perms,
            factory,
            kernel: KernelBridge::new(),
            reload_lock: Mutex::new(()),
            mounted_at: SystemTime::now(),
        };
        root.prune_permissions();
        tracing::info!(files = root.files.read().len(), skipped, "mount tree built");
        root
    }

    pub fn kernel(&self) -> &KernelBridge {
        &self.kernel
    }

    pub fn perms(&self) -> &Arc<PermissionStore> {
        &self.perms
    }

    pub fn tree(&self) -> &Arc<DirNode> {
        &self.tree
    }

    pub fn mounted_at(&self) -> SystemTime {
        self.mounted_at
    }

    /// Every live virtual file, ordered by name
    pub fn files(&self) -> Vec<Arc<VirtualFile>> {
        sorted_files(&self.files.read())
    }

    pub fn file(&self, name: &str) -> Option<Arc<VirtualFile>> {
        self.files.read().get(name).cloned()
    }

    /// Reconcile the live mount with `entries`
    ///
    /// Files present before and after keep their object identity. Kernel
    /// invalidations are sent only after every internal lock is released.
    pub fn reload(&self, entries: &[MountEntry]) -> ReloadReport {
        let guard = self.reload_lock.lock();
        let (fresh, skipped) = probe_entries(entries, &self.factory);
        let mut report = ReloadReport {
            skipped,
            ..Default::default()
        };

        let plan = {
            let mut files = self.files.write();

            let removed: Vec<String> = files
                .keys()
                .filter(|name| !fresh.contains_key(*name))
                .cloned()
                .collect();
            let added: Vec<String> = fresh
                .keys()
                .filter(|name| !files.contains_key(*name))
                .cloned()
                .collect();
            let (_, old_dirs) = self.valid_paths();

            // Handles must be captured while the removed nodes are still in place
            let held = self.capture_handles(&removed, &files);

            for name in &removed {
                files.remove(name);
            }
            let mut changed = Vec::new();
            for (name, file) in fresh {
                match files.get(&name) {
                    Some(existing) => {
                        if existing.same_mapping(&file) {
                            report.unchanged += 1;
                        } else {
                            report.updated += 1;
                            changed.push(name.clone());
                        }
                        existing.update_from(&file);
                    }
                    None => {
                        files.insert(name, Arc::new(file));
                    }
                }
            }
            report.added = added.len();
            report.removed = removed.len();

            let fresh_tree = DirNode::build(&sorted_files(&files), self.perms.clone());
            DirNode::merge(&self.tree, &fresh_tree);
            drop(files);

            self.plan_invalidations(&removed, &added, &changed, &held, &old_dirs)
        };

        match self.perms.reload() {
            Ok(()) => {
                self.prune_permissions();
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to reload permissions, skipping stale entry cleanup");
            }
        }
        drop(guard);

        report.notifications = self.kernel.send(&plan);
        tracing::info!(
            added = report.added,
            removed = report.removed,
            updated = report.updated,
            skipped = report.skipped,
            notifications = report.notifications,
            "mount reloaded"
        );
        report
    }

    fn valid_paths(&self) -> (HashSet<String>, HashSet<String>) {
        let (mut files, mut dirs) = (Vec::new(), Vec::new());
        self.tree.collect_paths(&mut files, &mut dirs);
        (files.into_iter().collect(), dirs.into_iter().collect())
    }

    fn prune_permissions(&self) -> usize {
        let (files, dirs) = self.valid_paths();
        self.perms.prune(&files, &dirs)
    }

    /// Kernel handles of removed files and their ancestor directories
    fn capture_handles(
        &self,
        removed: &[String],
        files: &HashMap<String, Arc<VirtualFile>>,
    ) -> HashMap<String, u64> {
        let inodes = self.inodes.lock();
        let mut held = HashMap::new();
        for name in removed {
            let (Some(path), Some(file)) = (normalize(name), files.get(name)) else {
                continue;
            };
            let node = Node::File {
                path: path.clone(),
                file: file.clone(),
            };
            if let Some(ino) = inodes.handle_of(&node) {
                held.insert(path.clone(), ino);
            }

            let mut dir_path = split_parent(&path).0;
            while !dir_path.is_empty() && !held.contains_key(dir_path) {
                if let Some(dir) = self.tree.find_dir(dir_path) {
                    if let Some(ino) = inodes.handle_of(&Node::Dir(dir)) {
                        held.insert(dir_path.to_string(), ino);
                    }
                }
                dir_path = split_parent(dir_path).0;
            }
        }
        held
    }

    /// Work out invalidations against the post-merge tree
    fn plan_invalidations(
        &self,
        removed: &[String],
        added: &[String],
        changed: &[String],
        held: &HashMap<String, u64>,
        old_dirs: &HashSet<String>,
    ) -> Vec<Invalidation> {
        let inodes = self.inodes.lock();
        let visible = |dir: &Arc<DirNode>| inodes.handle_of(&Node::Dir(dir.clone()));

        let mut plan = Vec::new();
        let mut seen: HashSet<(u64, String)> = HashSet::new();
        let mut touched: Vec<String> = Vec::new();

        for name in removed {
            let Some(path) = normalize(name) else {
                continue;
            };
            // Climb to the deepest directory that survived the merge
            let mut child = path.as_str();
            let (mut parent_path, mut child_name) = split_parent(child);
            let parent = loop {
                match self.tree.find_dir(parent_path) {
                    Some(dir) => break dir,
                    None => {
                        child = parent_path;
                        (parent_path, child_name) = split_parent(child);
                    }
                }
            };
            let Some(parent_ino) = visible(&parent) else {
                continue;
            };
            if !seen.insert((parent_ino, child_name.to_string())) {
                continue;
            }
            let replaced = parent.lookup(child_name).is_some();
            plan.push(match held.get(child) {
                Some(&child_ino) if !replaced => Invalidation::Delete {
                    parent: parent_ino,
                    child: child_ino,
                    name: child_name.to_string(),
                },
                _ => Invalidation::Entry {
                    parent: parent_ino,
                    name: child_name.to_string(),
                },
            });
            touched.push(parent.path().to_string());
        }

        for name in added {
            let Some(path) = normalize(name) else {
                continue;
            };
            // Directories created by this reload are unknown to the kernel,
            // so the entry to invalidate is the topmost new one
            let (mut parent_path, mut child_name) = split_parent(&path);
            while !parent_path.is_empty() && !old_dirs.contains(parent_path) {
                (parent_path, child_name) = split_parent(parent_path);
            }
            let Some(parent) = self.tree.find_dir(parent_path) else {
                continue;
            };
            let Some(parent_ino) = visible(&parent) else {
                continue;
            };
            if seen.insert((parent_ino, child_name.to_string())) {
                plan.push(Invalidation::Entry {
                    parent: parent_ino,
                    name: child_name.to_string(),
                });
                touched.push(parent_path.to_string());
            }
        }

        for name in changed {
            let Some(path) = normalize(name) else {
                continue;
            };
            let Some(file) = self.tree.find_file(&path) else {
                continue;
            };
            if let Some(ino) = inodes.handle_of(&Node::File { path, file }) {
                plan.push(Invalidation::Content { ino });
            }
        }

        let mut notified: HashSet<String> = HashSet::new();
        for dir_path in &touched {
            let mut current = dir_path.as_str();
            while notified.insert(current.to_string()) {
                plan.push(Invalidation::Content {
                    ino: InodeTable::inode_for(current),
                });
                if current.is_empty() {
                    break;
                }
                current = split_parent(current).0;
            }
        }

        plan
    }

    fn node(&self, ino: u64) -> FsResult<Node> {
        self.inodes.lock().get(ino).ok_or(FsError::NotFound)
    }

    fn dir(&self, ino: u64) -> FsResult<Arc<DirNode>> {
        match self.node(ino)? {
            Node::Dir(dir) => Ok(dir),
            Node::File { .. } => Err(FsError::NotDirectory),
        }
    }

    fn file_node(&self, ino: u64) -> FsResult<(String, Arc<VirtualFile>)> {
        match self.node(ino)? {
            Node::File { path, file } => Ok((path, file)),
            Node::Dir(_) => Err(FsError::IsDirectory),
        }
    }

    fn attr_of(&self, node: &Node) -> NodeAttr {
        match node {
            Node::Dir(dir) => {
                let attr = dir.attr();
                NodeAttr {
                    ino: node.inode(),
                    kind: NodeKind::Directory,
                    size: 0,
                    perms: attr.perms,
                    nlink: attr.nlink,
                    mtime: self.mounted_at,
                }
            }
            Node::File { path, file } => NodeAttr {
                ino: node.inode(),
                kind: NodeKind::File,
                size: file.size(),
                perms: self.perms.get_file_perms(path),
                nlink: 1,
                mtime: self.mounted_at,
            },
        }
    }

    /// Resolve `name` in `parent` and register the result with the kernel
    pub fn lookup(&self, parent: u64, name: &str) -> FsResult<NodeAttr> {
        let dir = self.dir(parent)?;
        let node = match dir.lookup(name).ok_or(FsError::NotFound)? {
            Child::Dir(sub) => Node::Dir(sub),
            Child::File(file) => Node::File {
                path: dir.child_path(name),
                file,
            },
        };
        let attr = self.attr_of(&node);
        self.inodes.lock().remember(node);
        Ok(attr)
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.inodes.lock().forget(ino, nlookup);
    }

    pub fn getattr(&self, ino: u64) -> FsResult<NodeAttr> {
        let node = self.node(ino)?;
        Ok(self.attr_of(&node))
    }

    /// Ownership and mode changes only; anything else is unsupported
    pub fn setattr(
        &self,
        ino: u64,
        caller: Caller,
        uid: Option<u32>,
        gid: Option<u32>,
        mode: Option<u32>,
        other_fields: bool,
    ) -> FsResult<NodeAttr> {
        let node = self.node(ino)?;
        match &node {
            Node::Dir(dir) => {
                dir.setattr(caller, uid, gid, mode, other_fields)?;
            }
            Node::File { path, .. } => {
                if other_fields {
                    return Err(FsError::NotSupported);
                }
                apply_perm_change(&self.perms, EntryKind::File, path, caller, uid, gid, mode)?;
            }
        }
        Ok(self.attr_of(&node))
    }

    /// Listing including `.` and `..`
    pub fn readdir(&self, ino: u64) -> FsResult<Vec<DirEntry>> {
        let dir = self.dir(ino)?;
        let parent = InodeTable::inode_for(split_parent(dir.path()).0);
        let mut entries = vec![
            DirEntry {
                ino,
                kind: NodeKind::Directory,
                name: ".".to_string(),
            },
            DirEntry {
                ino: parent,
                kind: NodeKind::Directory,
                name: "..".to_string(),
            },
        ];
        entries.extend(dir.readdir().into_iter().map(|(name, child)| {
            let kind = match child {
                Child::Dir(_) => NodeKind::Directory,
                Child::File(_) => NodeKind::File,
            };
            DirEntry {
                ino: InodeTable::inode_for(&dir.child_path(&name)),
                kind,
                name,
            }
        }));
        Ok(entries)
    }

    pub fn open(&self, ino: u64, flags: i32) -> FsResult<()> {
        let (_, file) = self.file_node(ino)?;
        file.open(flags)
    }

    pub fn read(&self, ino: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let (_, file) = self.file_node(ino)?;
        file.read(offset, size)
    }

    pub fn mkdir(&self, parent: u64, name: &str) -> FsResult<()> {
        self.dir(parent)?.mkdir(name)
    }

    pub fn rmdir(&self, parent: u64, name: &str) -> FsResult<()> {
        self.dir(parent)?.rmdir(name)
    }

    pub fn unlink(&self, parent: u64, name: &str) -> FsResult<()> {
        self.dir(parent)?.unlink(name)
    }

    pub fn create(&self, parent: u64, name: &str) -> FsResult<()> {
        self.dir(parent)?.create(name)
    }
}

/// Open every entry lazily; later duplicates replace earlier ones
fn probe_entries(
    entries: &[MountEntry],
    factory: &Arc<dyn ReaderFactory>,
) -> (HashMap<String, VirtualFile>, usize) {
    let mut files = HashMap::new();
    let mut skipped = 0;
    for entry in entries {
        match VirtualFile::probe(entry, factory.clone()) {
            Ok(file) => {
                if files.insert(entry.name.clone(), file).is_some() {
                    tracing::warn!(name = %entry.name, "duplicate virtual file name, last entry wins");
                }
            }
            Err(e) => {
                tracing::warn!(
                    name = %entry.name,
                    encoding = %entry.encoding_path.display(),
                    error = %e,
                    "skipping virtual file"
                );
                skipped += 1;
            }
        }
    }
    (files, skipped)
}

fn sorted_files(files: &HashMap<String, Arc<VirtualFile>>) -> Vec<Arc<VirtualFile>> {
    let mut named: Vec<_> = files.iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    named.into_iter().map(|(_, file)| file.clone()).collect()
}

fn normalize(name: &str) -> Option<String> {
    clean_path(name).map(|components| components.join("/"))
}
