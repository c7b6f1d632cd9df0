//! Segment map encoding
//!
//! A simple reference encoding for virtual files. The file starts with a
//! fixed header so a lazy reader can learn the virtual size and the source
//! dependencies without touching the (potentially large) segment table.
//!
//! ```text
//! magic(8) | version u32 | size u64 | deps_len u32 | deps (bincode)
//!          | body_len u64 | segments (bincode)
//! ```
//!
//! Segments tile `[0, size)` in order. Each one either copies a range out of
//! a source file or carries its bytes inline (the "delta" part).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::reader::{Reader, ReaderError, ReaderFactory, SourceDependency};

pub const MAGIC: &[u8; 8] = b"MDUPSEG1";
pub const VERSION: u32 = 1;
const FIXED_HEADER_LEN: u64 = 8 + 4 + 8 + 4;
const MAX_DEPS_LEN: u32 = 16 * 1024 * 1024;

/// One contiguous run of virtual file bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    /// Bytes copied from `sources[source]` at `source_offset`
    Source {
        source: u32,
        source_offset: u64,
        len: u64,
    },
    /// Bytes stored in the encoding itself
    Inline(Vec<u8>),
}

impl Segment {
    pub fn len(&self) -> u64 {
        match self {
            Segment::Source { len, .. } => *len,
            Segment::Inline(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory form of an encoding, used to write new encodings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMap {
    pub sources: Vec<SourceDependency>,
    pub segments: Vec<Segment>,
}

impl SegmentMap {
    pub fn new(sources: Vec<SourceDependency>, segments: Vec<Segment>) -> Self {
        Self { sources, segments }
    }

    pub fn size(&self) -> u64 {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Serialize to `path`, replacing any existing file
    pub fn write_to(&self, path: &Path) -> Result<(), ReaderError> {
        let deps = bincode::serialize(&self.sources)
            .map_err(|e| ReaderError::invalid(path, e.to_string()))?;
        let body = bincode::serialize(&self.segments)
            .map_err(|e| ReaderError::invalid(path, e.to_string()))?;

        let mut out = Vec::with_capacity(FIXED_HEADER_LEN as usize + deps.len() + 8 + body.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.size().to_le_bytes());
        out.extend_from_slice(&(deps.len() as u32).to_le_bytes());
        out.extend_from_slice(&deps);
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&body);

        let mut file = File::create(path).map_err(|e| ReaderError::io(path, e))?;
        file.write_all(&out).map_err(|e| ReaderError::io(path, e))?;
        file.sync_all().map_err(|e| ReaderError::io(path, e))
    }
}

/// Factory for [`SegmentReader`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SegmentReaderFactory;

impl ReaderFactory for SegmentReaderFactory {
    fn new_lazy_reader(
        &self,
        encoding_path: &Path,
        _source_dir: &Path,
    ) -> Result<Box<dyn Reader>, ReaderError> {
        Ok(Box::new(SegmentReader::open_lazy(encoding_path)?))
    }
}

struct Prepared {
    segments: Vec<Segment>,
    /// Virtual offset at which each segment starts
    starts: Vec<u64>,
    sources: Vec<File>,
}

/// Reader over a segment map encoding
pub struct SegmentReader {
    encoding_path: PathBuf,
    size: u64,
    deps: Vec<SourceDependency>,
    body_offset: u64,
    prepared: Option<Prepared>,
}

impl SegmentReader {
    /// Read only the fixed header and dependency list
    pub fn open_lazy(encoding_path: &Path) -> Result<Self, ReaderError> {
        let io_err = |e| ReaderError::io(encoding_path, e);
        let mut file = File::open(encoding_path).map_err(io_err)?;

        let mut fixed = [0u8; FIXED_HEADER_LEN as usize];
        file.read_exact(&mut fixed).map_err(io_err)?;
        if &fixed[0..8] != MAGIC {
            return Err(ReaderError::invalid(encoding_path, "bad magic"));
        }
        let version = u32::from_le_bytes(le_array(&fixed[8..12]));
        if version != VERSION {
            return Err(ReaderError::invalid(
                encoding_path,
                format!("unsupported version {}", version),
            ));
        }
        let size = u64::from_le_bytes(le_array(&fixed[12..20]));
        let deps_len = u32::from_le_bytes(le_array(&fixed[20..24]));
        if deps_len > MAX_DEPS_LEN {
            return Err(ReaderError::invalid(encoding_path, "dependency table too large"));
        }

        let mut deps_buf = vec![0u8; deps_len as usize];
        file.read_exact(&mut deps_buf).map_err(io_err)?;
        let deps: Vec<SourceDependency> = bincode::deserialize(&deps_buf)
            .map_err(|e| ReaderError::invalid(encoding_path, e.to_string()))?;

        Ok(Self {
            encoding_path: encoding_path.to_path_buf(),
            size,
            deps,
            body_offset: FIXED_HEADER_LEN + deps_len as u64,
            prepared: None,
        })
    }

    fn load_segments(&self) -> Result<Vec<Segment>, ReaderError> {
        let path = &self.encoding_path;
        let mut file = File::open(path).map_err(|e| ReaderError::io(path, e))?;
        file.seek(SeekFrom::Start(self.body_offset))
            .map_err(|e| ReaderError::io(path, e))?;

        let mut len_buf = [0u8; 8];
        file.read_exact(&mut len_buf)
            .map_err(|e| ReaderError::io(path, e))?;
        let body_len = u64::from_le_bytes(len_buf);

        let mut body = Vec::new();
        file.take(body_len)
            .read_to_end(&mut body)
            .map_err(|e| ReaderError::io(path, e))?;
        if body.len() as u64 != body_len {
            return Err(ReaderError::invalid(path, "truncated segment table"));
        }
        bincode::deserialize(&body).map_err(|e| ReaderError::invalid(path, e.to_string()))
    }

    fn open_sources(&self, source_dir: &Path) -> Result<Vec<File>, ReaderError> {
        self.deps
            .iter()
            .map(|dep| {
                let path = source_dir.join(&dep.relative_path);
                let file = File::open(&path).map_err(|e| ReaderError::io(&path, e))?;
                let actual = file
                    .metadata()
                    .map_err(|e| ReaderError::io(&path, e))?
                    .len();
                if actual != dep.size {
                    return Err(ReaderError::SourceSizeMismatch {
                        path,
                        expected: dep.size,
                        actual,
                    });
                }
                Ok(file)
            })
            .collect()
    }

    fn validate(&self, segments: &[Segment]) -> Result<Vec<u64>, ReaderError> {
        let mut starts = Vec::with_capacity(segments.len());
        let mut offset = 0u64;
        for segment in segments {
            if let Segment::Source {
                source,
                source_offset,
                len,
            } = segment
            {
                let dep = self.deps.get(*source as usize).ok_or_else(|| {
                    ReaderError::invalid(&self.encoding_path, format!("unknown source {}", source))
                })?;
                let end = source_offset.checked_add(*len);
                if end.map_or(true, |end| end > dep.size) {
                    return Err(ReaderError::invalid(
                        &self.encoding_path,
                        format!("segment exceeds source {}", dep.relative_path.display()),
                    ));
                }
            }
            starts.push(offset);
            offset += segment.len();
        }
        if offset != self.size {
            return Err(ReaderError::invalid(
                &self.encoding_path,
                format!("segments cover {} bytes, header says {}", offset, self.size),
            ));
        }
        Ok(starts)
    }
}

impl Reader for SegmentReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn prepare_for_reading(&mut self, source_dir: &Path) -> Result<(), ReaderError> {
        if self.prepared.is_some() {
            return Ok(());
        }
        let segments = self.load_segments()?;
        let starts = self.validate(&segments)?;
        let sources = self.open_sources(source_dir)?;
        self.prepared = Some(Prepared {
            segments,
            starts,
            sources,
        });
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ReaderError> {
        let prepared = self.prepared.as_ref().ok_or(ReaderError::NotPrepared)?;
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let mut idx = match prepared.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let mut pos = offset;
        let mut written = 0usize;

        while written < buf.len() && idx < prepared.segments.len() {
            let segment = &prepared.segments[idx];
            let within = pos - prepared.starts[idx];
            let avail = segment.len() - within;
            let want = (buf.len() - written).min(avail as usize);
            let dst = &mut buf[written..written + want];

            let got = match segment {
                Segment::Inline(bytes) => {
                    dst.copy_from_slice(&bytes[within as usize..within as usize + want]);
                    want
                }
                Segment::Source {
                    source,
                    source_offset,
                    ..
                } => {
                    let file = &prepared.sources[*source as usize];
                    read_full_at(file, dst, source_offset + within).map_err(|e| {
                        let dep = &self.deps[*source as usize];
                        ReaderError::io(&dep.relative_path, e)
                    })?
                }
            };

            written += got;
            pos += got as u64;
            if got < want {
                // source shrank underneath us; hand back what we have
                break;
            }
            idx += 1;
        }
        Ok(written)
    }

    fn source_dependencies(&self) -> Vec<SourceDependency> {
        self.deps.clone()
    }

    fn close(&mut self) -> Result<(), ReaderError> {
        self.prepared = None;
        Ok(())
    }
}

fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
