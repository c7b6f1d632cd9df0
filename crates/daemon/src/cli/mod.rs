//! Command line interface

pub mod op;
pub mod ops;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use op::{Op, OpContext};

#[derive(Parser, Debug)]
#[command(name = "mediadup", version, about = "Mount deduplicated media as plain files")]
pub struct Cli {
    /// Service settings file (TOML)
    #[arg(long, short, global = true, env = "MEDIADUP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `mediadup_daemon=debug`
    #[arg(long, global = true, env = "MEDIADUP_LOG", default_value = "info")]
    pub log_level: String,

    /// Also write logs to this file
    #[arg(long, global = true, env = "MEDIADUP_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Mount virtual files and serve them until interrupted
    #[cfg(feature = "fuse")]
    Mount(ops::Mount),
    /// Verify that every source file an encoding depends on is intact
    Check(ops::Check),
}

impl Command {
    pub async fn execute(&self, ctx: &OpContext) -> anyhow::Result<String> {
        match self {
            #[cfg(feature = "fuse")]
            Command::Mount(op) => Ok(op.execute(ctx).await?.to_string()),
            Command::Check(op) => Ok(op.execute(ctx).await?.to_string()),
        }
    }
}
