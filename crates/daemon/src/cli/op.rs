use std::path::PathBuf;

use crate::service_config::Config;

/// Shared state handed to every command
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    /// Settings loaded from `--config`, or defaults
    pub settings: Config,
    pub settings_path: Option<PathBuf>,
}

/// One CLI command
#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Output: std::fmt::Display;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}
