//! Reader contracts for reconstructed virtual files
//!
//! A virtual file is never stored as plain bytes. Its content is rebuilt from
//! an encoding plus a set of source files. The filesystem layer only talks to
//! the encoding through the two traits in this module:
//!
//! - [`ReaderFactory`]: opens an encoding lazily, just far enough to answer
//!   [`Reader::size`] and [`Reader::source_dependencies`]
//! - [`Reader`]: once prepared against a source directory, serves byte ranges

use std::fmt;
use std::path::{Path, PathBuf};

/// A source file that a virtual file's content depends on
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SourceDependency {
    /// Path relative to the virtual file's source directory
    pub relative_path: PathBuf,
    /// Expected size in bytes
    pub size: u64,
    /// Expected SHA-256 of the full file, lowercase hex
    pub checksum: String,
}

/// A reader over one virtual file
///
/// Readers start out lazy. `prepare_for_reading` must succeed before
/// `read_at` is called.
pub trait Reader: Send + Sync {
    /// Total size of the virtual file in bytes
    fn size(&self) -> u64;

    /// Resolve and open source files under `source_dir`
    fn prepare_for_reading(&mut self, source_dir: &Path) -> Result<(), ReaderError>;

    /// Fill `buf` with bytes starting at `offset`
    ///
    /// Returns the number of bytes written. A short count is not an error;
    /// `Ok(0)` means end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ReaderError>;

    /// Source files this virtual file is built from
    fn source_dependencies(&self) -> Vec<SourceDependency>;

    /// Release any open source handles
    fn close(&mut self) -> Result<(), ReaderError>;
}

/// Constructs lazy readers from a stored encoding
pub trait ReaderFactory: fmt::Debug + Send + Sync {
    /// Open `encoding_path` without materializing the full reader
    fn new_lazy_reader(
        &self,
        encoding_path: &Path,
        source_dir: &Path,
    ) -> Result<Box<dyn Reader>, ReaderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid encoding {path}: {reason}")]
    InvalidEncoding { path: PathBuf, reason: String },
    #[error("source file {path} has size {actual}, expected {expected}")]
    SourceSizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("reader is not prepared for reading")]
    NotPrepared,
}

impl ReaderError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidEncoding {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
