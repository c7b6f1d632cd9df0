//! Source integrity watcher
//!
//! Every virtual file declares the source files it is reconstructed from,
//! with their expected size and SHA-256. The watcher keeps a reverse index
//! from source path to dependent [`VirtualFile`]s and reacts when a source
//! changes, according to a [`ChangePolicy`].
//!
//! # Architecture
//!
//! - push events come from a `notify` watcher on each source directory
//! - directories on network or userspace filesystems are polled instead
//! - verification runs on checksum workers fed by a bounded queue; at most
//!   one job per source path is queued at any time
//!
//! Disable/mismatch/warn events are forwarded to the batching
//! [`notifier`].

pub mod fstype;
pub mod notifier;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::fs::VirtualFile;
use fstype::WatchMode;
use notifier::{ChangeEvent, ChangeKind, NotifierHandle};

/// What to do when a source file changes
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ChangePolicy {
    /// Log only
    Warn,
    /// Disable every dependent file
    Disable,
    /// Verify size, then content; disable on mismatch, re-enable on match
    #[default]
    Checksum,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub policy: ChangePolicy,
    pub poll_interval: Duration,
    pub checksum_workers: usize,
    pub queue_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            policy: ChangePolicy::Checksum,
            poll_interval: Duration::from_secs(60),
            checksum_workers: 1,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("source watcher must be started inside a tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone)]
struct Expected {
    size: u64,
    checksum: String,
}

/// Reverse index, rebuilt wholesale on every update
#[derive(Default)]
struct Index {
    dependents: HashMap<PathBuf, Vec<Arc<VirtualFile>>>,
    /// Virtual file name to every source it reads from
    sources_of: HashMap<String, Vec<PathBuf>>,
    /// Sources whose last check failed
    failed: HashSet<PathBuf>,
    expected: HashMap<PathBuf, Expected>,
    /// Last seen modification time of polled sources
    baselines: HashMap<PathBuf, Option<SystemTime>>,
    watched: Vec<PathBuf>,
}

struct Shared {
    policy: ChangePolicy,
    index: RwLock<Index>,
    pending: Mutex<HashSet<PathBuf>>,
    jobs: Mutex<Option<flume::Sender<PathBuf>>>,
    sink: Option<NotifierHandle>,
}

pub struct SourceWatcher {
    shared: Arc<Shared>,
    config: WatcherConfig,
    runtime: Handle,
    watcher: Mutex<Option<RecommendedWatcher>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SourceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.shared.index.read();
        f.debug_struct("SourceWatcher")
            .field("policy", &self.shared.policy)
            .field("sources", &index.dependents.len())
            .field("watched_dirs", &index.watched.len())
            .field("polled", &index.baselines.len())
            .finish()
    }
}

impl SourceWatcher {
    /// Start the event task and checksum workers; nothing is watched until
    /// [`SourceWatcher::update`] is called
    pub fn start(
        config: WatcherConfig,
        sink: Option<NotifierHandle>,
    ) -> Result<Self, WatcherError> {
        let runtime = Handle::try_current().map_err(|_| WatcherError::NoRuntime)?;

        let (job_tx, job_rx) = flume::bounded(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            policy: config.policy,
            index: RwLock::new(Index::default()),
            pending: Mutex::new(HashSet::new()),
            jobs: Mutex::new(Some(job_tx)),
            sink,
        });

        let (event_tx, event_rx) = flume::unbounded();
        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = event_tx.send(result);
            },
            notify::Config::default(),
        )?;

        let event_task = runtime.spawn(event_loop(shared.clone(), event_rx));
        let workers = (0..config.checksum_workers.max(1))
            .map(|id| runtime.spawn(checksum_worker(id, shared.clone(), job_rx.clone())))
            .collect();

        tracing::info!(policy = ?config.policy, workers = config.checksum_workers.max(1), "source watcher started");

        Ok(Self {
            shared,
            config,
            runtime,
            watcher: Mutex::new(Some(watcher)),
            event_task: Mutex::new(Some(event_task)),
            poll_task: Mutex::new(None),
            workers: Mutex::new(workers),
        })
    }

    /// Replace all watches with the dependencies of `files`
    pub fn update(&self, files: &[Arc<VirtualFile>]) {
        let mut index = Index::default();
        for file in files {
            let deps = match file.source_dependencies() {
                Ok(deps) => deps,
                Err(e) => {
                    tracing::warn!(name = %file.name(), error = %e, "cannot read source dependencies");
                    continue;
                }
            };
            let source_dir = file.source_dir();
            let name = file.name();
            for dep in deps {
                let path = source_dir.join(&dep.relative_path);
                index
                    .sources_of
                    .entry(name.clone())
                    .or_default()
                    .push(path.clone());
                index
                    .dependents
                    .entry(path.clone())
                    .or_default()
                    .push(file.clone());
                match index.expected.get(&path) {
                    Some(existing)
                        if existing.size != dep.size
                            || !existing.checksum.eq_ignore_ascii_case(&dep.checksum) =>
                    {
                        tracing::warn!(
                            source = %path.display(),
                            name = %file.name(),
                            "conflicting expectations for source file, keeping the first"
                        );
                    }
                    Some(_) => {}
                    None => {
                        index.expected.insert(
                            path,
                            Expected {
                                size: dep.size,
                                checksum: dep.checksum,
                            },
                        );
                    }
                }
            }
        }

        let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
        for path in index.dependents.keys() {
            let dir = path.parent().unwrap_or_else(|| Path::new("/")).to_path_buf();
            by_dir.entry(dir).or_default().push(path.clone());
        }

        {
            let mut guard = self.watcher.lock();
            let Some(watcher) = guard.as_mut() else {
                tracing::warn!("source watcher is shut down, ignoring update");
                return;
            };
            for dir in &self.shared.index.read().watched {
                if let Err(e) = watcher.unwatch(dir) {
                    tracing::debug!(dir = %dir.display(), error = %e, "failed to remove watch");
                }
            }

            for (dir, sources) in by_dir {
                let pushed = fstype::watch_mode(&dir) == WatchMode::Push
                    && match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(dir = %dir.display(), error = %e, "cannot watch directory, polling instead");
                            false
                        }
                    };
                if pushed {
                    index.watched.push(dir);
                } else {
                    for source in sources {
                        let baseline = modified(&source);
                        index.baselines.insert(source, baseline);
                    }
                }
            }
        }

        let polling = !index.baselines.is_empty();
        tracing::info!(
            sources = index.dependents.len(),
            watched_dirs = index.watched.len(),
            polled = index.baselines.len(),
            "source watches updated"
        );
        *self.shared.index.write() = index;

        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
        if polling {
            let task = self
                .runtime
                .spawn(poll_loop(self.shared.clone(), self.config.poll_interval));
            *self.poll_task.lock() = Some(task);
        }
    }

    /// React to a change of `path` as if a watch event had arrived
    pub async fn handle_change(&self, path: &Path) {
        self.shared.handle_change(path).await;
    }

    /// Source paths currently tracked
    pub fn sources(&self) -> Vec<PathBuf> {
        let mut sources: Vec<_> = self.shared.index.read().dependents.keys().cloned().collect();
        sources.sort();
        sources
    }

    #[cfg(test)]
    pub fn is_polled(&self, source: &Path) -> bool {
        self.shared.index.read().baselines.contains_key(source)
    }

    /// Stop watching, then let queued verifications finish
    pub async fn shutdown(&self) {
        drop(self.watcher.lock().take());
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }

        drop(self.shared.jobs.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "checksum worker ended abnormally");
            }
        }
        tracing::info!("source watcher stopped");
    }
}

impl Shared {
    fn lookup(&self, path: &Path) -> Option<(Vec<Arc<VirtualFile>>, Option<Expected>)> {
        let index = self.index.read();
        let files = index.dependents.get(path)?.clone();
        Some((files, index.expected.get(path).cloned()))
    }

    fn report(&self, source: &Path, files: &[Arc<VirtualFile>], kind: ChangeKind) {
        if let Some(sink) = &self.sink {
            let names = files.iter().map(|f| f.name()).collect();
            sink.report(ChangeEvent::new(source, names, kind));
        }
    }

    fn disable_all(&self, source: &Path, files: &[Arc<VirtualFile>], kind: ChangeKind) {
        self.index.write().failed.insert(source.to_path_buf());
        for file in files {
            file.disable();
        }
        tracing::warn!(
            source = %source.display(),
            files = files.len(),
            reason = %kind,
            "disabled dependent files"
        );
        self.report(source, files, kind);
    }

    async fn handle_change(&self, path: &Path) {
        let Some((files, expected)) = self.lookup(path) else {
            return;
        };

        match self.policy {
            ChangePolicy::Warn => {
                tracing::warn!(source = %path.display(), files = files.len(), "source file changed");
                self.report(path, &files, ChangeKind::Changed);
            }
            ChangePolicy::Disable => self.disable_all(path, &files, ChangeKind::Disabled),
            ChangePolicy::Checksum => {
                let Some(expected) = expected else {
                    return;
                };
                let target = path.to_path_buf();
                let stat = tokio::task::spawn_blocking(move || std::fs::metadata(target)).await;
                let stat = match stat {
                    Ok(stat) => stat,
                    Err(e) => {
                        tracing::error!(source = %path.display(), error = %e, "stat task failed");
                        return;
                    }
                };
                match stat {
                    Err(e) => {
                        tracing::debug!(source = %path.display(), error = %e, "stat failed");
                        self.disable_all(path, &files, ChangeKind::Missing);
                    }
                    Ok(meta) if meta.len() != expected.size => self.disable_all(
                        path,
                        &files,
                        ChangeKind::SizeMismatch {
                            expected: expected.size,
                            actual: meta.len(),
                        },
                    ),
                    Ok(_) => self.enqueue(path).await,
                }
            }
        }
    }

    /// Mark `source` healthy and return the dependents with no failing source left
    fn clear_failure(&self, source: &Path, files: &[Arc<VirtualFile>]) -> Vec<Arc<VirtualFile>> {
        let mut index = self.index.write();
        index.failed.remove(source);
        files
            .iter()
            .filter(|file| {
                index
                    .sources_of
                    .get(&file.name())
                    .map_or(true, |sources| !sources.iter().any(|s| index.failed.contains(s)))
            })
            .cloned()
            .collect()
    }

    /// Queue a verification unless one is already pending for `path`
    async fn enqueue(&self, path: &Path) {
        if !self.pending.lock().insert(path.to_path_buf()) {
            tracing::debug!(source = %path.display(), "verification already pending");
            return;
        }
        let jobs = self.jobs.lock().clone();
        let queued = match jobs {
            Some(jobs) => jobs.send_async(path.to_path_buf()).await.is_ok(),
            None => false,
        };
        if !queued {
            self.pending.lock().remove(path);
        }
    }

    async fn verify(&self, path: PathBuf) {
        let Some((files, Some(expected))) = self.lookup(&path) else {
            return;
        };

        let target = path.clone();
        let hashed =
            tokio::task::spawn_blocking(move || common::checksum::sha256_file(&target)).await;
        match hashed {
            Ok(Ok(actual)) if actual.eq_ignore_ascii_case(&expected.checksum) => {
                let healthy = self.clear_failure(&path, &files);
                let restored = healthy.iter().filter(|f| f.is_disabled()).count();
                for file in &healthy {
                    file.enable();
                }
                if restored > 0 {
                    tracing::info!(source = %path.display(), restored, "checksum matches, files re-enabled");
                } else {
                    tracing::debug!(source = %path.display(), "checksum matches");
                }
                let blocked = files.len() - healthy.len();
                if blocked > 0 {
                    tracing::info!(
                        source = %path.display(),
                        blocked,
                        "files stay disabled, another source still fails"
                    );
                }
            }
            Ok(Ok(actual)) => {
                tracing::warn!(
                    source = %path.display(),
                    expected = %expected.checksum,
                    actual = %actual,
                    "checksum mismatch"
                );
                self.disable_all(&path, &files, ChangeKind::ChecksumMismatch);
            }
            Ok(Err(e)) => {
                tracing::warn!(source = %path.display(), error = %e, "cannot hash source file");
                self.disable_all(&path, &files, ChangeKind::Unreadable);
            }
            Err(e) => {
                tracing::error!(source = %path.display(), error = %e, "checksum task failed");
            }
        }
    }

    /// Polled sources whose modification time moved
    fn poll_changes(&self) -> Vec<PathBuf> {
        let snapshot: Vec<(PathBuf, Option<SystemTime>)> = self
            .index
            .read()
            .baselines
            .iter()
            .map(|(path, baseline)| (path.clone(), *baseline))
            .collect();

        let changed: Vec<(PathBuf, Option<SystemTime>)> = snapshot
            .into_iter()
            .filter_map(|(path, baseline)| {
                let current = modified(&path);
                (current != baseline).then_some((path, current))
            })
            .collect();

        let mut index = self.index.write();
        changed
            .into_iter()
            .filter_map(|(path, current)| {
                let baseline = index.baselines.get_mut(&path)?;
                *baseline = current;
                Some(path)
            })
            .collect()
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

async fn event_loop(shared: Arc<Shared>, events: flume::Receiver<notify::Result<Event>>) {
    while let Ok(result) = events.recv_async().await {
        match result {
            Ok(event) => {
                if !matches!(
                    event.kind,
                    EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                for path in &event.paths {
                    shared.handle_change(path).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "file watcher error"),
        }
    }
}

async fn poll_once(shared: &Arc<Shared>) {
    let scan = shared.clone();
    let changed = match tokio::task::spawn_blocking(move || scan.poll_changes()).await {
        Ok(changed) => changed,
        Err(e) => {
            tracing::error!(error = %e, "poll scan failed");
            return;
        }
    };
    for path in changed {
        tracing::debug!(source = %path.display(), "polled source changed");
        shared.handle_change(&path).await;
    }
}

async fn poll_loop(shared: Arc<Shared>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        poll_once(&shared).await;
    }
}

async fn checksum_worker(id: usize, shared: Arc<Shared>, jobs: flume::Receiver<PathBuf>) {
    while let Ok(path) = jobs.recv_async().await {
        shared.pending.lock().remove(&path);
        shared.verify(path).await;
    }
    tracing::debug!(worker = id, "checksum worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::MemoryFactory;
    use common::checksum::sha256_bytes;
    use common::reader::SourceDependency;

    struct Fixture {
        _dir: tempfile::TempDir,
        source: PathBuf,
        file: Arc<VirtualFile>,
        shared: Arc<Shared>,
        jobs: flume::Receiver<PathBuf>,
    }

    /// Shared state wired to a queue nobody drains
    fn fixture(policy: ChangePolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"original bytes").unwrap();

        let factory = MemoryFactory::new();
        factory.insert("/enc/a", vec![0u8; 4]);
        let file = Arc::new(VirtualFile::new("a.mkv", "/enc/a", dir.path(), 4, factory));

        let mut index = Index::default();
        index.dependents.insert(source.clone(), vec![file.clone()]);
        index
            .sources_of
            .insert("a.mkv".to_string(), vec![source.clone()]);
        index.expected.insert(
            source.clone(),
            Expected {
                size: 14,
                checksum: sha256_bytes(b"original bytes"),
            },
        );

        let (tx, rx) = flume::bounded(16);
        let shared = Arc::new(Shared {
            policy,
            index: RwLock::new(index),
            pending: Mutex::new(HashSet::new()),
            jobs: Mutex::new(Some(tx)),
            sink: None,
        });
        Fixture {
            _dir: dir,
            source,
            file,
            shared,
            jobs: rx,
        }
    }

    #[tokio::test]
    async fn test_repeated_events_queue_one_job() {
        let fx = fixture(ChangePolicy::Checksum);
        for _ in 0..5 {
            fx.shared.handle_change(&fx.source).await;
        }
        assert_eq!(fx.jobs.len(), 1);
        assert_eq!(fx.shared.pending.lock().len(), 1);
        assert!(!fx.file.is_disabled());
    }

    #[tokio::test]
    async fn test_size_change_disables_without_hashing() {
        let fx = fixture(ChangePolicy::Checksum);
        std::fs::write(&fx.source, b"shorter").unwrap();
        fx.shared.handle_change(&fx.source).await;
        assert!(fx.file.is_disabled());
        assert!(fx.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_disables() {
        let fx = fixture(ChangePolicy::Checksum);
        std::fs::remove_file(&fx.source).unwrap();
        fx.shared.handle_change(&fx.source).await;
        assert!(fx.file.is_disabled());
    }

    #[tokio::test]
    async fn test_verify_mismatch_then_restore() {
        let fx = fixture(ChangePolicy::Checksum);
        std::fs::write(&fx.source, b"tampered bytes").unwrap();
        fx.shared.verify(fx.source.clone()).await;
        assert!(fx.file.is_disabled());

        std::fs::write(&fx.source, b"original bytes").unwrap();
        fx.shared.verify(fx.source.clone()).await;
        assert!(!fx.file.is_disabled());
    }

    #[tokio::test]
    async fn test_match_waits_for_every_failed_source() {
        let fx = fixture(ChangePolicy::Checksum);
        let second = fx._dir.path().join("second.bin");
        std::fs::write(&second, b"second").unwrap();
        {
            let mut index = fx.shared.index.write();
            index.dependents.insert(second.clone(), vec![fx.file.clone()]);
            index.expected.insert(
                second.clone(),
                Expected {
                    size: 6,
                    checksum: sha256_bytes(b"second"),
                },
            );
            index
                .sources_of
                .insert("a.mkv".to_string(), vec![fx.source.clone(), second.clone()]);
        }

        std::fs::write(&fx.source, b"tampered bytes").unwrap();
        fx.shared.verify(fx.source.clone()).await;
        assert!(fx.file.is_disabled());

        fx.shared.verify(second.clone()).await;
        assert!(fx.file.is_disabled());

        std::fs::write(&fx.source, b"original bytes").unwrap();
        fx.shared.verify(fx.source.clone()).await;
        assert!(!fx.file.is_disabled());
    }

    #[tokio::test]
    async fn test_warn_and_disable_policies() {
        let fx = fixture(ChangePolicy::Warn);
        fx.shared.handle_change(&fx.source).await;
        assert!(!fx.file.is_disabled());
        assert!(fx.jobs.is_empty());

        let fx = fixture(ChangePolicy::Disable);
        fx.shared.handle_change(&fx.source).await;
        assert!(fx.file.is_disabled());
    }

    #[tokio::test]
    async fn test_unknown_path_ignored() {
        let fx = fixture(ChangePolicy::Disable);
        fx.shared.handle_change(Path::new("/not/a/source")).await;
        assert!(!fx.file.is_disabled());
    }

    #[test]
    fn test_poll_detects_mtime_change() {
        let fx = fixture(ChangePolicy::Checksum);
        let old = SystemTime::UNIX_EPOCH;
        fx.shared
            .index
            .write()
            .baselines
            .insert(fx.source.clone(), Some(old));

        assert_eq!(fx.shared.poll_changes(), vec![fx.source.clone()]);
        assert!(fx.shared.poll_changes().is_empty());
    }

    #[tokio::test]
    async fn test_update_indexes_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryFactory::new();
        factory.insert("/enc/a", vec![0u8; 4]);
        factory.set_deps(
            "/enc/a",
            vec![SourceDependency {
                relative_path: PathBuf::from("disc/title.m2ts"),
                size: 10,
                checksum: "00".into(),
            }],
        );
        let file = Arc::new(VirtualFile::new("a.mkv", "/enc/a", dir.path(), 4, factory));

        let watcher = SourceWatcher::start(WatcherConfig::default(), None).unwrap();
        watcher.update(&[file]);
        assert_eq!(watcher.sources(), vec![dir.path().join("disc/title.m2ts")]);

        // the "disc" directory does not exist, so it cannot be push-watched
        assert!(watcher.is_polled(&dir.path().join("disc/title.m2ts")));

        watcher.update(&[]);
        assert!(watcher.sources().is_empty());
        watcher.shutdown().await;
    }
}
