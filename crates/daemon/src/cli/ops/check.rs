use std::fmt;
use std::path::{Path, PathBuf};

use clap::Args;
use common::checksum::sha256_file;
use common::prelude::*;
use owo_colors::OwoColorize;
use serde::Serialize;

use crate::cli::op::{Op, OpContext};

#[derive(Args, Debug, Clone)]
pub struct Check {
    /// Mount config files, or directories of `*.toml` configs
    #[arg(required = true)]
    pub configs: Vec<PathBuf>,

    /// Compare sizes only, skip hashing
    #[arg(long)]
    pub quick: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Verification result for one config
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    /// Virtual file name, or the config path when it could not be read
    pub name: String,
    pub sources: usize,
    pub problems: Vec<String>,
}

impl FileReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub files: Vec<FileReport>,
}

impl CheckReport {
    pub fn failed(&self) -> usize {
        self.files.iter().filter(|f| !f.is_ok()).count()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for file in &self.files {
            if file.is_ok() {
                writeln!(
                    f,
                    "{} {} {}",
                    "ok".green(),
                    file.name,
                    format!("({} sources)", file.sources).dimmed()
                )?;
            } else {
                writeln!(f, "{} {}", "FAIL".red().bold(), file.name)?;
                for problem in &file.problems {
                    writeln!(f, "  {} {}", "-".dimmed(), problem)?;
                }
            }
        }
        write!(
            f,
            "{} checked, {} failed",
            self.files.len(),
            self.failed()
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("verification task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("failed to encode report: {0}")]
    Json(#[from] serde_json::Error),
    /// Rendered report of a run with failures
    #[error("{0}")]
    Failed(String),
}

#[async_trait::async_trait]
impl Op for Check {
    type Error = CheckError;
    type Output = String;

    async fn execute(&self, _ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let configs = self.configs.clone();
        let quick = self.quick;
        let report = tokio::task::spawn_blocking(move || {
            run_check(&configs, &TomlConfigReader, &SegmentReaderFactory, quick)
        })
        .await??;

        let output = if self.json {
            serde_json::to_string_pretty(&report)?
        } else {
            report.to_string()
        };
        if report.failed() > 0 {
            return Err(CheckError::Failed(output));
        }
        Ok(output)
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "check ({} inputs)", self.configs.len())
    }
}

/// Verify every config under `inputs`
pub fn run_check(
    inputs: &[PathBuf],
    reader: &dyn ConfigReader,
    factory: &dyn ReaderFactory,
    quick: bool,
) -> Result<CheckReport, ConfigError> {
    let mut report = CheckReport::default();
    for path in collect_config_paths(inputs)? {
        let file = match reader.read_config(&path) {
            Ok(entry) => verify_entry(&entry, factory, quick),
            Err(e) => FileReport {
                name: path.display().to_string(),
                sources: 0,
                problems: vec![e.to_string()],
            },
        };
        if !file.is_ok() {
            tracing::warn!(name = %file.name, problems = ?file.problems, "verification failed");
        }
        report.files.push(file);
    }
    Ok(report)
}

/// Open the encoding lazily and check each declared source
pub fn verify_entry(entry: &MountEntry, factory: &dyn ReaderFactory, quick: bool) -> FileReport {
    let mut report = FileReport {
        name: entry.name.clone(),
        sources: 0,
        problems: Vec::new(),
    };

    let mut reader = match factory.new_lazy_reader(&entry.encoding_path, &entry.source_dir) {
        Ok(reader) => reader,
        Err(e) => {
            report.problems.push(format!("encoding: {e}"));
            return report;
        }
    };

    let deps = reader.source_dependencies();
    report.sources = deps.len();
    for dep in &deps {
        if let Some(problem) = verify_source(&entry.source_dir, dep, quick) {
            report.problems.push(problem);
        }
    }

    if let Err(e) = reader.close() {
        tracing::debug!(name = %entry.name, error = %e, "closing reader failed");
    }
    report
}

fn verify_source(source_dir: &Path, dep: &SourceDependency, quick: bool) -> Option<String> {
    let path = source_dir.join(&dep.relative_path);
    let shown = dep.relative_path.display();

    let meta = match std::fs::metadata(&path) {
        Ok(meta) => meta,
        Err(e) => return Some(format!("{shown}: {e}")),
    };
    if meta.len() != dep.size {
        return Some(format!(
            "{shown}: size {} differs from expected {}",
            meta.len(),
            dep.size
        ));
    }
    if quick {
        return None;
    }
    match sha256_file(&path) {
        Ok(sum) if sum == dep.checksum => None,
        Ok(_) => Some(format!("{shown}: checksum mismatch")),
        Err(e) => Some(format!("{shown}: {e}")),
    }
}
