//! Persisted ownership and mode overlay
//!
//! The mount has no real inode table, so uid/gid/mode live here: one sparse
//! [`Perms`] record per file or directory path, resolved field by field
//! against [`Defaults`]. The overlay is persisted as a TOML document:
//!
//! ```toml
//! [defaults]
//! file_uid = 1000
//! file_gid = 1000
//! file_mode = 0o444
//! dir_uid = 1000
//! dir_gid = 1000
//! dir_mode = 0o555
//!
//! [files."Movies/a.mkv"]
//! mode = 0o440
//!
//! [directories."Movies"]
//! gid = 20
//! ```
//!
//! Zero-valued defaults in the document count as "not specified".

pub mod authz;
pub mod groups;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use authz::{AuthError, Caller};
pub use groups::{GroupLookup, StaticGroups, SystemGroups};

/// Sparse per-path overlay; `None` inherits from defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perms {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// Fully resolved ownership and mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPerms {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    pub file_uid: u32,
    pub file_gid: u32,
    pub file_mode: u32,
    pub dir_uid: u32,
    pub dir_gid: u32,
    pub dir_mode: u32,
}

impl Defaults {
    /// Owned by `uid:gid`, read-only modes
    pub fn owned_by(uid: u32, gid: u32) -> Self {
        Self {
            file_uid: uid,
            file_gid: gid,
            file_mode: 0o444,
            dir_uid: uid,
            dir_gid: gid,
            dir_mode: 0o555,
        }
    }

    /// Non-zero fields of `other` replace ours
    fn overlay(mut self, other: &Defaults) -> Self {
        let pick = |ours: &mut u32, theirs: u32| {
            if theirs != 0 {
                *ours = theirs;
            }
        };
        pick(&mut self.file_uid, other.file_uid);
        pick(&mut self.file_gid, other.file_gid);
        pick(&mut self.file_mode, other.file_mode);
        pick(&mut self.dir_uid, other.dir_uid);
        pick(&mut self.dir_gid, other.dir_gid);
        pick(&mut self.dir_mode, other.dir_mode);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PermDocument {
    #[serde(default)]
    defaults: DiskDefaults,
    #[serde(default)]
    files: BTreeMap<String, Perms>,
    #[serde(default)]
    directories: BTreeMap<String, Perms>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
struct DiskDefaults {
    #[serde(default)]
    file_uid: u32,
    #[serde(default)]
    file_gid: u32,
    #[serde(default)]
    file_mode: u32,
    #[serde(default)]
    dir_uid: u32,
    #[serde(default)]
    dir_gid: u32,
    #[serde(default)]
    dir_mode: u32,
}

impl From<DiskDefaults> for Defaults {
    fn from(d: DiskDefaults) -> Self {
        Self {
            file_uid: d.file_uid,
            file_gid: d.file_gid,
            file_mode: d.file_mode,
            dir_uid: d.dir_uid,
            dir_gid: d.dir_gid,
            dir_mode: d.dir_mode,
        }
    }
}

impl From<Defaults> for DiskDefaults {
    fn from(d: Defaults) -> Self {
        Self {
            file_uid: d.file_uid,
            file_gid: d.file_gid,
            file_mode: d.file_mode,
            dir_uid: d.dir_uid,
            dir_gid: d.dir_gid,
            dir_mode: d.dir_mode,
        }
    }
}

struct Inner {
    defaults: Defaults,
    files: HashMap<String, Perms>,
    dirs: HashMap<String, Perms>,
}

impl Inner {
    fn map(&self, kind: EntryKind) -> &HashMap<String, Perms> {
        match kind {
            EntryKind::File => &self.files,
            EntryKind::Directory => &self.dirs,
        }
    }

    fn map_mut(&mut self, kind: EntryKind) -> &mut HashMap<String, Perms> {
        match kind {
            EntryKind::File => &mut self.files,
            EntryKind::Directory => &mut self.dirs,
        }
    }

    fn resolve(&self, kind: EntryKind, path: &str) -> ResolvedPerms {
        let overlay = self.map(kind).get(path).copied().unwrap_or_default();
        let d = &self.defaults;
        let (uid, gid, mode) = match kind {
            EntryKind::File => (d.file_uid, d.file_gid, d.file_mode),
            EntryKind::Directory => (d.dir_uid, d.dir_gid, d.dir_mode),
        };
        ResolvedPerms {
            uid: overlay.uid.unwrap_or(uid),
            gid: overlay.gid.unwrap_or(gid),
            mode: overlay.mode.unwrap_or(mode),
        }
    }
}

/// Ownership/mode overlay for every path in the mount
pub struct PermissionStore {
    path: Option<PathBuf>,
    base_defaults: Defaults,
    inner: Mutex<Inner>,
    save_lock: Mutex<()>,
    groups: Arc<dyn GroupLookup>,
}

impl std::fmt::Debug for PermissionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PermissionStore")
            .field("path", &self.path)
            .field("defaults", &inner.defaults)
            .field("files", &inner.files.len())
            .field("directories", &inner.dirs.len())
            .finish()
    }
}

impl PermissionStore {
    /// Empty in-memory store, persisted to `path` if given
    pub fn new(defaults: Defaults, path: Option<PathBuf>) -> Self {
        Self {
            path,
            base_defaults: defaults,
            inner: Mutex::new(Inner {
                defaults,
                files: HashMap::new(),
                dirs: HashMap::new(),
            }),
            save_lock: Mutex::new(()),
            groups: Arc::new(SystemGroups::default()),
        }
    }

    /// Load from `path`; a missing file yields an empty store
    pub fn load(defaults: Defaults, path: PathBuf) -> Result<Self, PermissionError> {
        let store = Self::new(defaults, Some(path));
        store.reload()?;
        Ok(store)
    }

    pub fn with_groups(mut self, groups: Arc<dyn GroupLookup>) -> Self {
        self.groups = groups;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn defaults(&self) -> Defaults {
        self.inner.lock().defaults
    }

    /// Re-read the backing document, replacing the in-memory overlay
    ///
    /// On error the in-memory state is left untouched.
    pub fn reload(&self) -> Result<(), PermissionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let doc = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<PermDocument>(&text).map_err(|source| {
                PermissionError::Parse {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PermDocument::default(),
            Err(source) => {
                return Err(PermissionError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };

        let mut inner = self.inner.lock();
        inner.defaults = self.base_defaults.overlay(&doc.defaults.into());
        inner.files = doc.files.into_iter().collect();
        inner.dirs = doc.directories.into_iter().collect();
        tracing::debug!(
            path = %path.display(),
            files = inner.files.len(),
            directories = inner.dirs.len(),
            "loaded permissions"
        );
        Ok(())
    }

    /// Persist the overlay; a no-op for in-memory stores
    pub fn save(&self) -> Result<(), PermissionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.save_lock.lock();
        let text = {
            let inner = self.inner.lock();
            let doc = PermDocument {
                defaults: inner.defaults.into(),
                files: inner.files.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                directories: inner.dirs.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            };
            toml::to_string_pretty(&doc)?
        };

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let io_err = |source| PermissionError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(text.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    pub fn get(&self, kind: EntryKind, path: &str) -> ResolvedPerms {
        self.inner.lock().resolve(kind, path)
    }

    pub fn get_file_perms(&self, path: &str) -> ResolvedPerms {
        self.get(EntryKind::File, path)
    }

    pub fn get_dir_perms(&self, path: &str) -> ResolvedPerms {
        self.get(EntryKind::Directory, path)
    }

    /// Update the supplied fields, saving if anything changed
    pub fn set(
        &self,
        kind: EntryKind,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
        mode: Option<u32>,
    ) -> Result<(), PermissionError> {
        if uid.is_none() && gid.is_none() && mode.is_none() {
            return Ok(());
        }

        let changed = {
            let mut inner = self.inner.lock();
            let entry = inner.map_mut(kind).entry(path.to_string()).or_default();
            let before = *entry;
            if uid.is_some() {
                entry.uid = uid;
            }
            if gid.is_some() {
                entry.gid = gid;
            }
            if mode.is_some() {
                entry.mode = mode;
            }
            *entry != before
        };

        if changed {
            self.save()?;
        }
        Ok(())
    }

    pub fn set_file_perms(
        &self,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
        mode: Option<u32>,
    ) -> Result<(), PermissionError> {
        self.set(EntryKind::File, path, uid, gid, mode)
    }

    pub fn set_dir_perms(
        &self,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
        mode: Option<u32>,
    ) -> Result<(), PermissionError> {
        self.set(EntryKind::Directory, path, uid, gid, mode)
    }

    /// Authorized attribute change on behalf of `caller`
    ///
    /// Ownership is checked first, then mode. Nothing is written unless both
    /// checks pass.
    pub fn change(
        &self,
        kind: EntryKind,
        path: &str,
        caller: Caller,
        uid: Option<u32>,
        gid: Option<u32>,
        mode: Option<u32>,
    ) -> Result<ResolvedPerms, PermissionError> {
        let current = self.get(kind, path);
        if uid.is_some() || gid.is_some() {
            authz::check_chown(caller, &current, uid, gid, self.groups.as_ref())?;
        }
        let mode = match mode {
            Some(mode) => Some(authz::check_chmod(caller, &current, mode)?),
            None => None,
        };
        self.set(kind, path, uid, gid, mode)?;
        Ok(self.get(kind, path))
    }

    /// Drop overlay entries for paths no longer in the mount
    pub fn cleanup_stale(&self, valid_files: &HashSet<String>, valid_dirs: &HashSet<String>) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.files.len() + inner.dirs.len();
        inner.files.retain(|path, _| valid_files.contains(path));
        inner.dirs.retain(|path, _| valid_dirs.contains(path));
        before - (inner.files.len() + inner.dirs.len())
    }

    /// `cleanup_stale` followed by a save when anything was removed
    pub fn prune(&self, valid_files: &HashSet<String>, valid_dirs: &HashSet<String>) -> usize {
        let removed = self.cleanup_stale(valid_files, valid_dirs);
        if removed > 0 {
            tracing::info!(removed, "removed stale permission entries");
            if let Err(e) = self.save() {
                tracing::warn!(error = %e, "failed to save permissions after cleanup");
            }
        }
        removed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize permissions: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
}
