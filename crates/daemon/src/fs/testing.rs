//! In-memory reader doubles and a recording kernel notifier for unit tests

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use common::reader::{Reader, ReaderError, ReaderFactory, SourceDependency};

use super::kernel::KernelNotifier;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderLog {
    pub created: usize,
    pub prepared: usize,
    pub closed: usize,
}

#[derive(Debug, Default)]
struct Shared {
    contents: HashMap<PathBuf, Arc<Vec<u8>>>,
    deps: HashMap<PathBuf, Vec<SourceDependency>>,
    log: ReaderLog,
    fail_prepare: bool,
    fail_close: bool,
    close_failures: usize,
}

#[derive(Debug, Default)]
pub struct MemoryFactory {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, encoding: impl Into<PathBuf>, data: Vec<u8>) {
        self.shared
            .lock()
            .contents
            .insert(encoding.into(), Arc::new(data));
    }

    pub fn set_deps(&self, encoding: impl Into<PathBuf>, deps: Vec<SourceDependency>) {
        self.shared.lock().deps.insert(encoding.into(), deps);
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.shared.lock().fail_prepare = fail;
    }

    pub fn fail_close(&self, fail: bool) {
        self.shared.lock().fail_close = fail;
    }

    /// Close calls that returned an error
    pub fn close_failures(&self) -> usize {
        self.shared.lock().close_failures
    }

    pub fn log(&self) -> ReaderLog {
        self.shared.lock().log
    }
}

impl ReaderFactory for MemoryFactory {
    fn new_lazy_reader(
        &self,
        encoding_path: &Path,
        _source_dir: &Path,
    ) -> Result<Box<dyn Reader>, ReaderError> {
        let mut shared = self.shared.lock();
        let data = shared.contents.get(encoding_path).cloned().ok_or_else(|| {
            ReaderError::io(
                encoding_path,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )
        })?;
        let deps = shared.deps.get(encoding_path).cloned().unwrap_or_default();
        shared.log.created += 1;
        Ok(Box::new(MemoryReader {
            data,
            deps,
            prepared: false,
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryReader {
    data: Arc<Vec<u8>>,
    deps: Vec<SourceDependency>,
    prepared: bool,
    shared: Arc<Mutex<Shared>>,
}

impl Reader for MemoryReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn prepare_for_reading(&mut self, source_dir: &Path) -> Result<(), ReaderError> {
        let mut shared = self.shared.lock();
        if shared.fail_prepare {
            return Err(ReaderError::io(
                source_dir,
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }
        shared.log.prepared += 1;
        self.prepared = true;
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ReaderError> {
        if !self.prepared {
            return Err(ReaderError::NotPrepared);
        }
        let start = (offset as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn source_dependencies(&self) -> Vec<SourceDependency> {
        self.deps.clone()
    }

    fn close(&mut self) -> Result<(), ReaderError> {
        let mut shared = self.shared.lock();
        if shared.fail_close {
            shared.close_failures += 1;
            return Err(ReaderError::io(
                "memory",
                std::io::Error::from(std::io::ErrorKind::Other),
            ));
        }
        drop(shared);
        if self.prepared {
            self.prepared = false;
            self.shared.lock().log.closed += 1;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    InvalEntry { parent: u64, name: String },
    InvalInode { ino: u64 },
    Delete { parent: u64, child: u64, name: String },
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl KernelNotifier for Arc<RecordingNotifier> {
    fn inval_entry(&self, parent: u64, name: &OsStr) -> std::io::Result<()> {
        self.sent.lock().push(Sent::InvalEntry {
            parent,
            name: name.to_string_lossy().into_owned(),
        });
        Ok(())
    }

    fn inval_inode(&self, ino: u64) -> std::io::Result<()> {
        self.sent.lock().push(Sent::InvalInode { ino });
        Ok(())
    }

    fn delete(&self, parent: u64, child: u64, name: &OsStr) -> std::io::Result<()> {
        self.sent.lock().push(Sent::Delete {
            parent,
            child,
            name: name.to_string_lossy().into_owned(),
        });
        Ok(())
    }
}
