//! Shared fixtures: a temporary media library with real segment-map encodings

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::checksum::sha256_bytes;
use common::prelude::*;
use tempfile::TempDir;

use mediadup_daemon::{Defaults, MountRoot, PermissionStore, VirtualFile};

/// Source files, encodings and mount configs under one temp directory
pub struct Library {
    pub dir: TempDir,
}

/// Route test logs through the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Library {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join("configs")).unwrap();
        Self { dir }
    }

    pub fn source_dir(&self) -> PathBuf {
        self.dir.path().join("src")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.dir.path().join("configs")
    }

    pub fn source_path(&self, name: &str) -> PathBuf {
        self.source_dir().join(name)
    }

    /// Write a source file and describe it as a dependency
    pub fn source(&self, name: &str, data: &[u8]) -> SourceDependency {
        std::fs::write(self.source_path(name), data).unwrap();
        SourceDependency {
            relative_path: PathBuf::from(name),
            size: data.len() as u64,
            checksum: sha256_bytes(data),
        }
    }

    /// Encode `name` as every dependency in order followed by `tail`, and
    /// write its mount config
    pub fn add(&self, name: &str, deps: &[SourceDependency], tail: &[u8]) {
        let mut segments: Vec<Segment> = deps
            .iter()
            .enumerate()
            .map(|(index, dep)| Segment::Source {
                source: index as u32,
                source_offset: 0,
                len: dep.size,
            })
            .collect();
        if !tail.is_empty() {
            segments.push(Segment::Inline(tail.to_vec()));
        }

        let stem = config_stem(name);
        let encoding = self.configs_dir().join(format!("{stem}.enc"));
        SegmentMap::new(deps.to_vec(), segments)
            .write_to(&encoding)
            .unwrap();

        let config = format!(
            "name = \"{name}\"\nencoding = \"{stem}.enc\"\nsource_dir = \"{}\"\n",
            self.source_dir().display()
        );
        std::fs::write(self.configs_dir().join(format!("{stem}.toml")), config).unwrap();
    }

    /// A file made of inline bytes only
    pub fn add_inline(&self, name: &str, data: &[u8]) {
        self.add(name, &[], data);
    }

    pub fn remove(&self, name: &str) {
        let stem = config_stem(name);
        std::fs::remove_file(self.configs_dir().join(format!("{stem}.toml"))).unwrap();
    }

    pub fn entries(&self) -> Vec<MountEntry> {
        mediadup_daemon::service::load_entries(&[self.configs_dir()], &TomlConfigReader).unwrap()
    }

    pub fn mount_root(&self) -> MountRoot {
        MountRoot::new(&self.entries(), Arc::new(SegmentReaderFactory), perms())
    }
}

fn config_stem(name: &str) -> String {
    name.replace('/', "__")
}

pub fn perms() -> Arc<PermissionStore> {
    Arc::new(PermissionStore::new(Defaults::owned_by(1000, 1000), None))
}

/// Read a whole virtual file through the inode interface
pub fn read_all(root: &MountRoot, ino: u64) -> Vec<u8> {
    root.open(ino, libc::O_RDONLY).unwrap();
    let size = root.getattr(ino).unwrap().size as usize;
    root.read(ino, 0, size + 16).unwrap()
}

/// Poll `cond` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

pub fn file(root: &MountRoot, name: &str) -> Arc<VirtualFile> {
    root.file(name)
        .unwrap_or_else(|| panic!("{name} missing from mount"))
}

pub fn touch(path: &Path, data: &[u8]) {
    std::fs::write(path, data).unwrap();
}
