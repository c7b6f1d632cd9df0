//! A single reconstructed file exposed by the mount
//!
//! `VirtualFile` objects are shared by the flat file index, the directory
//! tree, the inode registry and the source watcher. Reloads mutate them in
//! place so every holder keeps seeing the same object.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use common::config::MountEntry;
use common::reader::{Reader, ReaderError, ReaderFactory, SourceDependency};

use super::error::{FsError, FsResult};

struct FileState {
    name: String,
    encoding_path: PathBuf,
    source_dir: PathBuf,
    size: u64,
    factory: Arc<dyn ReaderFactory>,
    reader: Option<Box<dyn Reader>>,
    disabled: bool,
}

pub struct VirtualFile {
    state: RwLock<FileState>,
}

impl std::fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("VirtualFile")
            .field("name", &state.name)
            .field("encoding_path", &state.encoding_path)
            .field("source_dir", &state.source_dir)
            .field("size", &state.size)
            .field("open", &state.reader.is_some())
            .field("disabled", &state.disabled)
            .finish()
    }
}

impl VirtualFile {
    pub fn new(
        name: impl Into<String>,
        encoding_path: impl Into<PathBuf>,
        source_dir: impl Into<PathBuf>,
        size: u64,
        factory: Arc<dyn ReaderFactory>,
    ) -> Self {
        Self {
            state: RwLock::new(FileState {
                name: name.into(),
                encoding_path: encoding_path.into(),
                source_dir: source_dir.into(),
                size,
                factory,
                reader: None,
                disabled: false,
            }),
        }
    }

    /// Open the encoding lazily to learn its size
    ///
    /// The probing reader is closed again; the real one is built on first open.
    pub fn probe(entry: &MountEntry, factory: Arc<dyn ReaderFactory>) -> Result<Self, ReaderError> {
        let mut reader = factory.new_lazy_reader(&entry.encoding_path, &entry.source_dir)?;
        let size = reader.size();
        if let Err(e) = reader.close() {
            tracing::debug!(name = %entry.name, error = %e, "failed to close probe reader");
        }
        Ok(Self::new(
            entry.name.clone(),
            entry.encoding_path.clone(),
            entry.source_dir.clone(),
            size,
            factory,
        ))
    }

    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    pub fn source_dir(&self) -> PathBuf {
        self.state.read().source_dir.clone()
    }

    pub fn encoding_path(&self) -> PathBuf {
        self.state.read().encoding_path.clone()
    }

    pub fn is_disabled(&self) -> bool {
        self.state.read().disabled
    }

    pub fn is_open(&self) -> bool {
        self.state.read().reader.is_some()
    }

    /// Prepare the backing reader for reads
    ///
    /// Only pure read access is accepted. The reader is built at most once;
    /// a failed initialization leaves the file closed so the next open retries.
    pub fn open(&self, flags: i32) -> FsResult<()> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & (libc::O_TRUNC | libc::O_CREAT) != 0
        {
            return Err(FsError::ReadOnly);
        }

        {
            let state = self.state.read();
            if state.disabled {
                return Err(FsError::Disabled);
            }
            if state.reader.is_some() {
                return Ok(());
            }
        }

        let mut state = self.state.write();
        if state.disabled {
            return Err(FsError::Disabled);
        }
        if state.reader.is_some() {
            return Ok(());
        }

        let reader = Self::init_reader(&state).map_err(|e| {
            tracing::error!(name = %state.name, error = %e, "failed to initialize reader");
            FsError::Reader(e)
        })?;
        state.reader = Some(reader);
        tracing::debug!(name = %state.name, "reader initialized");
        Ok(())
    }

    fn init_reader(state: &FileState) -> Result<Box<dyn Reader>, ReaderError> {
        let mut reader = state
            .factory
            .new_lazy_reader(&state.encoding_path, &state.source_dir)?;
        reader.prepare_for_reading(&state.source_dir)?;
        Ok(reader)
    }

    /// Read up to `len` bytes at `offset`, clamped to the file size
    pub fn read(&self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let state = self.state.read();
        if state.disabled {
            return Err(FsError::Disabled);
        }
        let reader = state.reader.as_ref().ok_or(FsError::NotOpen)?;

        if offset >= state.size {
            return Ok(Vec::new());
        }
        let len = (len as u64).min(state.size - offset) as usize;
        let mut buf = vec![0u8; len];

        match reader.read_at(&mut buf, offset) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => {
                tracing::error!(name = %state.name, offset, len, error = %e, "read failed");
                Err(FsError::Reader(e))
            }
        }
    }

    /// Block reads until re-enabled, closing any open reader
    pub fn disable(&self) {
        let mut state = self.state.write();
        state.disabled = true;
        Self::close_reader(&mut state);
    }

    /// Allow reads again; the reader is rebuilt on next open
    pub fn enable(&self) {
        self.state.write().disabled = false;
    }

    /// Take over the mapping of a freshly built replacement
    ///
    /// Identity is preserved. An open reader is dropped only when the encoding
    /// or source directory changed. The disabled flag is always cleared.
    pub fn update_from(&self, other: &VirtualFile) {
        let (name, encoding_path, source_dir, size, factory) = {
            let o = other.state.read();
            (
                o.name.clone(),
                o.encoding_path.clone(),
                o.source_dir.clone(),
                o.size,
                o.factory.clone(),
            )
        };

        let mut state = self.state.write();
        if state.encoding_path != encoding_path || state.source_dir != source_dir {
            Self::close_reader(&mut state);
        }
        state.name = name;
        state.encoding_path = encoding_path;
        state.source_dir = source_dir;
        state.size = size;
        state.factory = factory;
        state.disabled = false;
    }

    /// Same encoding, source directory and size
    pub fn same_mapping(&self, other: &VirtualFile) -> bool {
        let (a, b) = (self.state.read(), other.state.read());
        a.encoding_path == b.encoding_path && a.source_dir == b.source_dir && a.size == b.size
    }

    /// Declared source files, read from a lazy reader
    pub fn source_dependencies(&self) -> Result<Vec<SourceDependency>, ReaderError> {
        let (factory, encoding_path, source_dir) = {
            let state = self.state.read();
            (
                state.factory.clone(),
                state.encoding_path.clone(),
                state.source_dir.clone(),
            )
        };
        let mut reader = factory.new_lazy_reader(&encoding_path, &source_dir)?;
        let deps = reader.source_dependencies();
        if let Err(e) = reader.close() {
            tracing::debug!(encoding = %encoding_path.display(), error = %e, "failed to close dependency reader");
        }
        Ok(deps)
    }

    fn close_reader(state: &mut FileState) {
        if let Some(mut reader) = state.reader.take() {
            if let Err(e) = reader.close() {
                tracing::warn!(name = %state.name, error = %e, "failed to close reader");
            }
        }
    }
}
