use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use common::prelude::*;
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};

use crate::cli::op::{Op, OpContext};
use crate::fuse::{LiveMount, MountError};
use crate::permissions::PermissionError;
use crate::service::{permission_store, Service, ServiceError};
use crate::service_config::{Config, SettingsError};
use crate::watcher::ChangePolicy;

#[derive(Args, Debug, Clone)]
pub struct Mount {
    /// Directory to mount on
    pub mountpoint: PathBuf,

    /// Mount config files, or directories of `*.toml` configs
    #[arg(required = true)]
    pub configs: Vec<PathBuf>,

    /// Let other users access the mount
    #[arg(long)]
    pub allow_other: bool,

    /// Reaction to changed source files
    #[arg(long, value_enum)]
    pub policy: Option<ChangePolicy>,

    /// Persisted ownership/mode overlay
    #[arg(long, env = "MEDIADUP_PERMISSIONS")]
    pub permissions_file: Option<PathBuf>,

    /// Seconds between scans of polled source directories
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Do not watch source files
    #[arg(long)]
    pub no_watch: bool,
}

impl Mount {
    /// Overlay flags onto file settings
    pub fn apply(&self, settings: &mut Config) {
        if self.allow_other {
            settings.mount.allow_other = true;
        }
        if let Some(policy) = self.policy {
            settings.watcher.policy = policy;
        }
        if let Some(path) = &self.permissions_file {
            settings.permissions_file = Some(path.clone());
        }
        if let Some(secs) = self.poll_interval {
            settings.watcher.poll_interval_secs = secs;
        }
        if self.no_watch {
            settings.watcher.enabled = false;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountCmdError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Permissions(#[from] PermissionError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error("signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
    #[error("unmount task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[async_trait::async_trait]
impl Op for Mount {
    type Error = MountCmdError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let mut settings = ctx.settings.clone();
        self.apply(&mut settings);
        settings.validate()?;

        let uid = nix::unistd::Uid::current().as_raw();
        let gid = nix::unistd::Gid::current().as_raw();
        let perms = Arc::new(permission_store(&settings, uid, gid)?);

        let service = Service::start(
            &settings,
            self.configs.clone(),
            Arc::new(TomlConfigReader),
            Arc::new(SegmentReaderFactory),
            perms,
        )
        .await?;

        let mount = match LiveMount::spawn(
            service.root().clone(),
            &self.mountpoint,
            &settings.mount_options(),
            Handle::current(),
        ) {
            Ok(mount) => mount,
            Err(e) => {
                service.shutdown().await;
                return Err(e.into());
            }
        };

        let served = serve(&service).await;

        tokio::task::spawn_blocking(move || mount.unmount()).await?;
        service.shutdown().await;
        served?;

        Ok(format!("unmounted {}", self.mountpoint.display()))
    }
}

/// Reload on SIGHUP until SIGINT or SIGTERM
async fn serve(service: &Service) -> Result<(), std::io::Error> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                tracing::info!("SIGHUP received, reloading mount configs");
                if let Err(e) = service.reload().await {
                    tracing::error!(error = %e, "reload failed, keeping current tree");
                }
            }
            _ = interrupt.recv() => {
                tracing::info!("SIGINT received, shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                return Ok(());
            }
        }
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mount {}", self.mountpoint.display())
    }
}
