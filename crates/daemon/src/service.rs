//! Service wiring: mount entries, root, watcher and notifier
//!
//! The FUSE session itself is attached by the caller; everything here runs
//! without a kernel mount so it can be driven from tests.

use std::path::PathBuf;
use std::sync::Arc;

use common::prelude::*;
use tokio::task::JoinHandle;

use crate::fs::{MountRoot, ReloadReport};
use crate::permissions::{PermissionError, PermissionStore};
use crate::service_config::Config;
use crate::watcher::{notifier, SourceWatcher, WatcherError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Permissions(#[from] PermissionError),
    #[error(transparent)]
    Watcher(#[from] WatcherError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Resolve every mount entry under `inputs`
///
/// Unreadable or invalid config files are logged and skipped; only failing to
/// list an input directory is an error.
pub fn load_entries(
    inputs: &[PathBuf],
    reader: &dyn ConfigReader,
) -> Result<Vec<MountEntry>, ConfigError> {
    let paths = collect_config_paths(inputs)?;
    let mut entries = Vec::with_capacity(paths.len());
    for path in &paths {
        match reader.read_config(path) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping mount config"),
        }
    }
    tracing::debug!(configs = paths.len(), entries = entries.len(), "resolved mount entries");
    Ok(entries)
}

/// Permission store for `settings`, owned by `uid:gid` where unset
pub fn permission_store(
    settings: &Config,
    uid: u32,
    gid: u32,
) -> Result<PermissionStore, PermissionError> {
    let defaults = settings.permission_defaults(uid, gid);
    match &settings.permissions_file {
        Some(path) => PermissionStore::load(defaults, path.clone()),
        None => Ok(PermissionStore::new(defaults, None)),
    }
}

pub struct Service {
    root: Arc<MountRoot>,
    inputs: Vec<PathBuf>,
    reader: Arc<dyn ConfigReader>,
    watcher: Option<Arc<SourceWatcher>>,
    notifier_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("inputs", &self.inputs)
            .field("files", &self.root.files().len())
            .field("watching", &self.watcher.is_some())
            .finish()
    }
}

impl Service {
    /// Build the tree and start background tasks
    ///
    /// Encodings are opened and source directories inspected on the blocking
    /// pool.
    pub async fn start(
        settings: &Config,
        inputs: Vec<PathBuf>,
        reader: Arc<dyn ConfigReader>,
        factory: Arc<dyn ReaderFactory>,
        perms: Arc<PermissionStore>,
    ) -> Result<Self, ServiceError> {
        let root = {
            let inputs = inputs.clone();
            let reader = reader.clone();
            tokio::task::spawn_blocking(move || {
                let entries = load_entries(&inputs, reader.as_ref())?;
                Ok::<_, ConfigError>(Arc::new(MountRoot::new(&entries, factory, perms)))
            })
            .await??
        };

        let (sink, notifier_task) = match settings.notifier_config() {
            Some(config) => {
                let (handle, task) = notifier::spawn(config);
                (Some(handle), Some(task))
            }
            None => (None, None),
        };

        let watcher = match settings.watcher_config() {
            Some(config) => {
                let watcher = Arc::new(SourceWatcher::start(config, sink)?);
                refresh_watches(&watcher, &root).await?;
                Some(watcher)
            }
            None => {
                tracing::info!("source watcher disabled");
                None
            }
        };

        Ok(Self {
            root,
            inputs,
            reader,
            watcher,
            notifier_task,
        })
    }

    pub fn root(&self) -> &Arc<MountRoot> {
        &self.root
    }

    pub fn watcher(&self) -> Option<&SourceWatcher> {
        self.watcher.as_deref()
    }

    /// Re-read every mount config and reconcile the tree
    ///
    /// When the inputs cannot be listed the current tree is kept.
    pub async fn reload(&self) -> Result<ReloadReport, ServiceError> {
        let inputs = self.inputs.clone();
        let reader = self.reader.clone();
        let root = self.root.clone();

        let report = tokio::task::spawn_blocking(move || {
            let entries = load_entries(&inputs, reader.as_ref())?;
            Ok::<_, ConfigError>(root.reload(&entries))
        })
        .await??;

        if let Some(watcher) = &self.watcher {
            refresh_watches(watcher, &self.root).await?;
        }
        tracing::info!(
            added = report.added,
            removed = report.removed,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            notifications = report.notifications,
            "reload complete"
        );
        Ok(report)
    }

    /// Stop the watcher, then flush the notifier
    pub async fn shutdown(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown().await;
        }
        if let Some(task) = self.notifier_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "notifier task failed");
            }
        }
        tracing::info!("service stopped");
    }
}

/// Point the watcher at the current files
async fn refresh_watches(
    watcher: &Arc<SourceWatcher>,
    root: &MountRoot,
) -> Result<(), ServiceError> {
    let watcher = watcher.clone();
    let files = root.files();
    tokio::task::spawn_blocking(move || watcher.update(&files)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Defaults;
    use std::path::Path;

    fn write_entry(dir: &Path, file: &str, name: &str) {
        let body = format!("name = \"{name}\"\nencoding = \"{name}.enc\"\nsource_dir = \"src\"\n");
        std::fs::write(dir.join(file), body).unwrap();
    }

    #[test]
    fn test_load_entries_skips_bad_configs() {
        let dir = tempfile::tempdir().unwrap();
        write_entry(dir.path(), "a.toml", "a.mkv");
        std::fs::write(dir.path().join("b.toml"), "name = ").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let entries = load_entries(&[dir.path().to_path_buf()], &TomlConfigReader).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.mkv");
        assert_eq!(entries[0].encoding_path, dir.path().join("a.mkv.enc"));
    }

    #[test]
    fn test_load_entries_missing_file_is_skipped() {
        let entries =
            load_entries(&[PathBuf::from("/nonexistent/a.toml")], &TomlConfigReader).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_permission_store_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Config::default();
        settings.permissions_file = Some(dir.path().join("perms.toml"));
        settings.defaults.file_mode = Some(0o400);

        let store = permission_store(&settings, 1000, 100).unwrap();
        assert_eq!(store.path(), Some(dir.path().join("perms.toml").as_path()));
        assert_eq!(
            store.defaults(),
            Defaults {
                file_mode: 0o400,
                ..Defaults::owned_by(1000, 100)
            }
        );
    }

    #[tokio::test]
    async fn test_start_without_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Config::default();
        settings.watcher.enabled = false;

        let service = Service::start(
            &settings,
            vec![dir.path().to_path_buf()],
            Arc::new(TomlConfigReader),
            Arc::new(SegmentReaderFactory),
            Arc::new(PermissionStore::new(Defaults::owned_by(0, 0), None)),
        )
        .await
        .unwrap();
        assert!(service.watcher().is_none());
        assert!(service.root().files().is_empty());

        let report = service.reload().await.unwrap();
        assert_eq!(report.added, 0);
        service.shutdown().await;
    }
}
