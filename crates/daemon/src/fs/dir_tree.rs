//! In-memory directory hierarchy built from flat virtual file names
//!
//! Directories are shared `Arc<DirNode>` objects. The kernel may hold on to a
//! directory between calls, so [`DirNode::merge`] reconciles a live tree with a
//! freshly built one in place instead of swapping it out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::{FsError, FsResult};
use super::virtual_file::VirtualFile;
use crate::permissions::{Caller, EntryKind, PermissionError, PermissionStore, ResolvedPerms};

/// Normalize a virtual path into its components
///
/// Empty and `.` components are dropped. Returns `None` when the path has no
/// components or contains `..` anywhere.
pub fn clean_path(path: &str) -> Option<Vec<&str>> {
    let mut components = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => return None,
            other => components.push(other),
        }
    }
    if components.is_empty() {
        None
    } else {
        Some(components)
    }
}

/// Join two path levels; the root is the empty string
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Split `a/b/c` into (`a/b`, `c`); top-level names have parent `""`
pub fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

#[derive(Clone)]
pub enum Child {
    Dir(Arc<DirNode>),
    File(Arc<VirtualFile>),
}

#[derive(Default, Clone)]
struct Children {
    files: HashMap<String, Arc<VirtualFile>>,
    dirs: HashMap<String, Arc<DirNode>>,
}

/// Directory attributes resolved from the permission store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirAttr {
    pub perms: ResolvedPerms,
    pub nlink: u32,
}

pub struct DirNode {
    name: String,
    path: String,
    children: RwLock<Children>,
    perms: Arc<PermissionStore>,
}

impl std::fmt::Debug for DirNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let children = self.children.read();
        f.debug_struct("DirNode")
            .field("path", &self.path)
            .field("dirs", &children.dirs.len())
            .field("files", &children.files.len())
            .finish()
    }
}

impl DirNode {
    pub fn new_root(perms: Arc<PermissionStore>) -> Arc<Self> {
        Arc::new(Self {
            name: String::new(),
            path: String::new(),
            children: RwLock::new(Children::default()),
            perms,
        })
    }

    fn new_child(&self, name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            path: join_path(&self.path, name),
            children: RwLock::new(Children::default()),
            perms: self.perms.clone(),
        })
    }

    /// Build a tree from `files`, keyed by each file's display name
    ///
    /// Names containing `..` are rejected. When a name is used both as a file
    /// and as a directory, the directory wins regardless of insertion order.
    pub fn build(files: &[Arc<VirtualFile>], perms: Arc<PermissionStore>) -> Arc<Self> {
        let root = Self::new_root(perms);
        for file in files {
            let name = file.name();
            let Some(components) = clean_path(&name) else {
                tracing::warn!(name = %name, "rejecting virtual file with invalid path");
                continue;
            };
            let Some((leaf, parents)) = components.split_last() else {
                continue;
            };

            let mut dir = root.clone();
            for component in parents {
                dir = dir.ensure_subdir(component);
            }
            dir.insert_file(leaf, file.clone());
        }
        root
    }

    fn ensure_subdir(&self, name: &str) -> Arc<Self> {
        let mut children = self.children.write();
        if children.files.remove(name).is_some() {
            tracing::warn!(
                path = %join_path(&self.path, name),
                "file shadowed by directory of the same name"
            );
        }
        children
            .dirs
            .entry(name.to_string())
            .or_insert_with(|| self.new_child(name))
            .clone()
    }

    fn insert_file(&self, name: &str, file: Arc<VirtualFile>) {
        let mut children = self.children.write();
        if children.dirs.contains_key(name) {
            tracing::warn!(
                path = %join_path(&self.path, name),
                "dropping file that collides with a directory"
            );
            return;
        }
        children.files.insert(name.to_string(), file);
    }

    /// Reconcile `existing` with `new` in place
    ///
    /// Subdirectories present in both keep their `existing` object. Anything
    /// only in `new` is adopted as is, so those directories are unknown to the
    /// kernel until it looks them up.
    pub fn merge(existing: &Arc<Self>, new: &Arc<Self>) {
        let incoming = new.children.read().clone();

        let shared = {
            let mut children = existing.children.write();
            children
                .files
                .retain(|name, _| incoming.files.contains_key(name));
            children
                .dirs
                .retain(|name, _| incoming.dirs.contains_key(name));
            for (name, file) in incoming.files {
                children.files.insert(name, file);
            }

            let mut shared = Vec::new();
            for (name, dir) in incoming.dirs {
                match children.dirs.get(&name) {
                    Some(current) => shared.push((current.clone(), dir)),
                    None => {
                        children.dirs.insert(name, dir);
                    }
                }
            }
            shared
        };

        for (current, incoming) in shared {
            Self::merge(&current, &incoming);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn perms(&self) -> &Arc<PermissionStore> {
        &self.perms
    }

    pub fn child_path(&self, name: &str) -> String {
        join_path(&self.path, name)
    }

    /// Directories shadow files of the same name
    pub fn lookup(&self, name: &str) -> Option<Child> {
        let children = self.children.read();
        if let Some(dir) = children.dirs.get(name) {
            return Some(Child::Dir(dir.clone()));
        }
        children.files.get(name).cloned().map(Child::File)
    }

    pub fn subdir(&self, name: &str) -> Option<Arc<DirNode>> {
        self.children.read().dirs.get(name).cloned()
    }

    pub fn file(&self, name: &str) -> Option<Arc<VirtualFile>> {
        self.children.read().files.get(name).cloned()
    }

    /// Subdirectories by name, then files by name
    pub fn readdir(&self) -> Vec<(String, Child)> {
        let children = self.children.read();
        let mut dirs: Vec<_> = children
            .dirs
            .iter()
            .map(|(name, dir)| (name.clone(), Child::Dir(dir.clone())))
            .collect();
        let mut files: Vec<_> = children
            .files
            .iter()
            .map(|(name, file)| (name.clone(), Child::File(file.clone())))
            .collect();
        dirs.sort_by(|a, b| a.0.cmp(&b.0));
        files.sort_by(|a, b| a.0.cmp(&b.0));
        dirs.extend(files);
        dirs
    }

    /// Walk down to the directory at `path` (`""` is this node)
    pub fn find_dir(self: &Arc<Self>, path: &str) -> Option<Arc<DirNode>> {
        let mut dir = self.clone();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            dir = dir.subdir(component)?;
        }
        Some(dir)
    }

    pub fn find_file(self: &Arc<Self>, path: &str) -> Option<Arc<VirtualFile>> {
        let (parent, name) = split_parent(path);
        self.find_dir(parent)?.file(name)
    }

    /// Collect every file path and directory path (including this one)
    pub fn collect_paths(&self, files: &mut Vec<String>, dirs: &mut Vec<String>) {
        dirs.push(self.path.clone());
        let (subdirs, names): (Vec<_>, Vec<_>) = {
            let children = self.children.read();
            (
                children.dirs.values().cloned().collect(),
                children.files.keys().cloned().collect(),
            )
        };
        files.extend(names.iter().map(|name| join_path(&self.path, name)));
        for dir in subdirs {
            dir.collect_paths(files, dirs);
        }
    }

    pub fn attr(&self) -> DirAttr {
        let subdirs = self.children.read().dirs.len() as u32;
        DirAttr {
            perms: self.perms.get_dir_perms(&self.path),
            nlink: 2 + subdirs,
        }
    }

    /// Only ownership and mode may change on directories
    pub fn setattr(
        &self,
        caller: Caller,
        uid: Option<u32>,
        gid: Option<u32>,
        mode: Option<u32>,
        other_fields: bool,
    ) -> FsResult<DirAttr> {
        if other_fields {
            return Err(FsError::NotSupported);
        }
        apply_perm_change(&self.perms, EntryKind::Directory, &self.path, caller, uid, gid, mode)?;
        Ok(self.attr())
    }

    pub fn mkdir(&self, _name: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    pub fn rmdir(&self, _name: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    pub fn unlink(&self, _name: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    pub fn create(&self, _name: &str) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }
}

/// Route a chown/chmod through the permission store's authorization
pub fn apply_perm_change(
    perms: &PermissionStore,
    kind: EntryKind,
    path: &str,
    caller: Caller,
    uid: Option<u32>,
    gid: Option<u32>,
    mode: Option<u32>,
) -> FsResult<ResolvedPerms> {
    perms
        .change(kind, path, caller, uid, gid, mode)
        .map_err(|e| match e {
            PermissionError::Auth(crate::permissions::AuthError::Denied) => {
                FsError::PermissionDenied
            }
            PermissionError::Auth(crate::permissions::AuthError::NotSupported) => {
                FsError::NotSupported
            }
            other => {
                tracing::error!(path = %path, error = %other, "failed to persist permissions");
                FsError::Persist(other.to_string())
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::MemoryFactory;
    use crate::permissions::Defaults;

    fn store() -> Arc<PermissionStore> {
        Arc::new(PermissionStore::new(Defaults::owned_by(1000, 1000), None))
    }

    fn files(factory: &Arc<MemoryFactory>, specs: &[(&str, u64)]) -> Vec<Arc<VirtualFile>> {
        specs
            .iter()
            .map(|(name, size)| {
                Arc::new(VirtualFile::new(*name, "/enc", "/src", *size, factory.clone()))
            })
            .collect()
    }

    fn names(dir: &DirNode) -> Vec<String> {
        dir.readdir().into_iter().map(|(name, _)| name).collect()
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("a/b.mkv"), Some(vec!["a", "b.mkv"]));
        assert_eq!(clean_path("/a//./b.mkv/"), Some(vec!["a", "b.mkv"]));
        assert_eq!(clean_path("a/../b.mkv"), None);
        assert_eq!(clean_path("../b.mkv"), None);
        assert_eq!(clean_path("/"), None);
        assert_eq!(clean_path(""), None);
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("a.mkv"), ("", "a.mkv"));
        assert_eq!(split_parent("a/b/c.mkv"), ("a/b", "c.mkv"));
    }

    #[test]
    fn test_build_nested() {
        let factory = MemoryFactory::new();
        let files = files(&factory, &[("Movies/Action/a.mkv", 100), ("root.mkv", 50)]);
        let root = DirNode::build(&files, store());

        assert_eq!(names(&root), vec!["Movies", "root.mkv"]);
        let action = root.find_dir("Movies/Action").unwrap();
        assert_eq!(action.path(), "Movies/Action");
        assert_eq!(names(&action), vec!["a.mkv"]);
        assert_eq!(action.file("a.mkv").unwrap().size(), 100);
        assert!(Arc::ptr_eq(
            &root.find_file("Movies/Action/a.mkv").unwrap(),
            &files[0]
        ));
    }

    #[test]
    fn test_readdir_dirs_before_files_sorted() {
        let factory = MemoryFactory::new();
        let files = files(
            &factory,
            &[("z.mkv", 1), ("b/x.mkv", 1), ("a.mkv", 1), ("c/y.mkv", 1)],
        );
        let root = DirNode::build(&files, store());
        assert_eq!(names(&root), vec!["b", "c", "a.mkv", "z.mkv"]);
    }

    #[test]
    fn test_dotdot_rejected() {
        let factory = MemoryFactory::new();
        let files = files(&factory, &[("../escape.mkv", 1), ("a/../../b.mkv", 1), ("ok.mkv", 1)]);
        let root = DirNode::build(&files, store());
        assert_eq!(names(&root), vec!["ok.mkv"]);
    }

    #[test]
    fn test_directory_wins_either_order() {
        let factory = MemoryFactory::new();

        let file_first = files(&factory, &[("x", 1), ("x/y.mkv", 2)]);
        let root = DirNode::build(&file_first, store());
        assert!(matches!(root.lookup("x"), Some(Child::Dir(_))));
        assert!(root.file("x").is_none());

        let dir_first = files(&factory, &[("x/y.mkv", 2), ("x", 1)]);
        let root = DirNode::build(&dir_first, store());
        assert!(matches!(root.lookup("x"), Some(Child::Dir(_))));
        assert!(root.file("x").is_none());
        assert_eq!(names(&root.subdir("x").unwrap()), vec!["y.mkv"]);
    }

    #[test]
    fn test_last_write_wins_for_same_name() {
        let factory = MemoryFactory::new();
        let files = files(&factory, &[("a.mkv", 1), ("/a.mkv", 2)]);
        let root = DirNode::build(&files, store());
        assert_eq!(root.file("a.mkv").unwrap().size(), 2);
    }

    #[test]
    fn test_merge_preserves_directory_identity() {
        let factory = MemoryFactory::new();
        let perms = store();
        let old = files(&factory, &[("A/B/one.mkv", 1), ("A/gone/two.mkv", 1), ("top.mkv", 1)]);
        let live = DirNode::build(&old, perms.clone());
        let a_before = live.find_dir("A").unwrap();
        let b_before = live.find_dir("A/B").unwrap();

        let new = files(&factory, &[("A/B/three.mkv", 1), ("C/four.mkv", 1)]);
        let fresh = DirNode::build(&new, perms);
        DirNode::merge(&live, &fresh);

        assert!(Arc::ptr_eq(&live.find_dir("A").unwrap(), &a_before));
        assert!(Arc::ptr_eq(&live.find_dir("A/B").unwrap(), &b_before));
        assert_eq!(names(&live), vec!["A", "C"]);
        assert_eq!(names(&a_before), vec!["B"]);
        assert_eq!(names(&b_before), vec!["three.mkv"]);
        assert!(live.find_dir("A/gone").is_none());
        assert!(Arc::ptr_eq(
            &live.find_dir("C").unwrap(),
            &fresh.find_dir("C").unwrap()
        ));
    }

    #[test]
    fn test_collect_paths() {
        let factory = MemoryFactory::new();
        let files = files(&factory, &[("a/b.mkv", 1), ("c.mkv", 1)]);
        let root = DirNode::build(&files, store());

        let (mut f, mut d) = (Vec::new(), Vec::new());
        root.collect_paths(&mut f, &mut d);
        f.sort();
        d.sort();
        assert_eq!(f, vec!["a/b.mkv", "c.mkv"]);
        assert_eq!(d, vec!["", "a"]);
    }

    #[test]
    fn test_dir_attr_link_count() {
        let factory = MemoryFactory::new();
        let files = files(&factory, &[("a/x.mkv", 1), ("b/y.mkv", 1), ("z.mkv", 1)]);
        let root = DirNode::build(&files, store());
        let attr = root.attr();
        assert_eq!(attr.nlink, 4);
        assert_eq!(attr.perms.mode, 0o555);
    }

    #[test]
    fn test_setattr_rules() {
        let root = DirNode::new_root(store());
        assert!(matches!(
            root.setattr(Caller::new(1000, 1000), None, None, None, true),
            Err(FsError::NotSupported)
        ));
        assert!(matches!(
            root.setattr(Caller::new(7, 7), None, None, Some(0o700), false),
            Err(FsError::PermissionDenied)
        ));
        let attr = root
            .setattr(Caller::new(1000, 1000), None, None, Some(0o750), false)
            .unwrap();
        assert_eq!(attr.perms.mode, 0o750);
    }

    #[test]
    fn test_write_operations_rejected() {
        let root = DirNode::new_root(store());
        assert!(matches!(root.mkdir("x"), Err(FsError::ReadOnly)));
        assert!(matches!(root.rmdir("x"), Err(FsError::ReadOnly)));
        assert!(matches!(root.unlink("x"), Err(FsError::ReadOnly)));
        assert!(matches!(root.create("x"), Err(FsError::ReadOnly)));
    }
}
