//! Mount entry configuration
//!
//! Each virtual file is declared by a small TOML document:
//!
//! ```toml
//! name = "Movies/Action/a.mkv"
//! encoding = "a.mkvdup"
//! source_dir = "/srv/discs/a"
//! ```
//!
//! Relative `encoding` and `source_dir` values resolve against the directory
//! containing the config file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// One resolved virtual file declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Display path inside the mount, may contain `/`
    pub name: String,
    /// Path to the stored encoding
    pub encoding_path: PathBuf,
    /// Directory the encoding's source files live in
    pub source_dir: PathBuf,
}

impl MountEntry {
    pub fn new(
        name: impl Into<String>,
        encoding_path: impl Into<PathBuf>,
        source_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            encoding_path: encoding_path.into(),
            source_dir: source_dir.into(),
        }
    }
}

/// Turns a configuration file into a [`MountEntry`]
pub trait ConfigReader: Send + Sync {
    fn read_config(&self, path: &Path) -> Result<MountEntry, ConfigError>;
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    name: String,
    encoding: PathBuf,
    source_dir: PathBuf,
}

/// Reads mount entries from TOML files
#[derive(Debug, Default, Clone, Copy)]
pub struct TomlConfigReader;

impl ConfigReader for TomlConfigReader {
    fn read_config(&self, path: &Path) -> Result<MountEntry, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawEntry = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if raw.name.trim().is_empty() {
            return Err(ConfigError::EmptyName(path.to_path_buf()));
        }

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(MountEntry {
            name: raw.name,
            encoding_path: resolve(base, raw.encoding),
            source_dir: resolve(base, raw.source_dir),
        })
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Expand a list of files and directories into config file paths
///
/// Directories contribute their `*.toml` children, sorted by name.
pub fn collect_config_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, ConfigError> {
    let mut out = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let entries = std::fs::read_dir(input).map_err(|source| ConfigError::Read {
                path: input.clone(),
                source,
            })?;
            let mut found: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            found.sort();
            out.extend(found);
        } else {
            out.push(input.clone());
        }
    }
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
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
    #[error("{0}: name must not be empty")]
    EmptyName(PathBuf),
}
