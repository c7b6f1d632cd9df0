//! Runtime settings for the mount service
//!
//! Loaded from an optional TOML file; every section has defaults, so an
//! empty file (or none at all) is a valid configuration.
//!
//! ```toml
//! permissions_file = "/var/lib/mediadup/perms.toml"
//!
//! [defaults]
//! file_mode = 0o440
//!
//! [watcher]
//! policy = "checksum"
//! poll_interval_secs = 60
//!
//! [notify]
//! command = ["notify-send", "mediadup: %event%", "%files%"]
//! batch_interval_secs = 5
//!
//! [mount]
//! allow_other = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::permissions::Defaults;
use crate::watcher::notifier::{NotifierConfig, NotifyCommand};
use crate::watcher::{ChangePolicy, WatcherConfig};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Persisted ownership/mode overlay; in-memory only when unset
    pub permissions_file: Option<PathBuf>,
    pub defaults: DefaultsSection,
    pub watcher: WatcherSection,
    pub notify: NotifySection,
    pub mount: MountSection,
}

/// Unset fields fall back to the mounting user and read-only modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsSection {
    pub file_uid: Option<u32>,
    pub file_gid: Option<u32>,
    pub file_mode: Option<u32>,
    pub dir_uid: Option<u32>,
    pub dir_gid: Option<u32>,
    pub dir_mode: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherSection {
    pub enabled: bool,
    pub policy: ChangePolicy,
    pub poll_interval_secs: u64,
    pub checksum_workers: usize,
    pub queue_capacity: usize,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: ChangePolicy::Checksum,
            poll_interval_secs: 60,
            checksum_workers: 1,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifySection {
    pub command: Option<NotifyCommand>,
    pub timeout_secs: u64,
    pub batch_interval_secs: u64,
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 30,
            batch_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountSection {
    pub allow_other: bool,
    pub auto_unmount: bool,
    pub attr_ttl_secs: u64,
}

impl Default for MountSection {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
            attr_ttl_secs: 1,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.watcher.poll_interval_secs == 0 {
            return Err(SettingsError::Invalid(
                "watcher.poll_interval_secs must be positive".into(),
            ));
        }
        if self.watcher.checksum_workers == 0 {
            return Err(SettingsError::Invalid(
                "watcher.checksum_workers must be positive".into(),
            ));
        }
        if let Some(NotifyCommand::Args(args)) = &self.notify.command {
            if args.is_empty() {
                return Err(SettingsError::Invalid("notify.command is empty".into()));
            }
        }
        let modes = [
            self.defaults.file_mode,
            self.defaults.dir_mode,
        ];
        if modes.into_iter().flatten().any(|mode| mode > 0o7777) {
            return Err(SettingsError::Invalid(
                "default modes must be permission bits only".into(),
            ));
        }
        Ok(())
    }

    /// Resolve permission defaults, owned by `uid:gid` where unset
    pub fn permission_defaults(&self, uid: u32, gid: u32) -> Defaults {
        let base = Defaults::owned_by(uid, gid);
        let d = &self.defaults;
        Defaults {
            file_uid: d.file_uid.unwrap_or(base.file_uid),
            file_gid: d.file_gid.unwrap_or(base.file_gid),
            file_mode: d.file_mode.unwrap_or(base.file_mode),
            dir_uid: d.dir_uid.unwrap_or(base.dir_uid),
            dir_gid: d.dir_gid.unwrap_or(base.dir_gid),
            dir_mode: d.dir_mode.unwrap_or(base.dir_mode),
        }
    }

    /// `None` when the watcher is disabled
    pub fn watcher_config(&self) -> Option<WatcherConfig> {
        let w = &self.watcher;
        w.enabled.then(|| WatcherConfig {
            policy: w.policy,
            poll_interval: Duration::from_secs(w.poll_interval_secs),
            checksum_workers: w.checksum_workers,
            queue_capacity: w.queue_capacity,
        })
    }

    /// `None` when no command is configured
    pub fn notifier_config(&self) -> Option<NotifierConfig> {
        let n = &self.notify;
        n.command.clone().map(|command| NotifierConfig {
            command,
            timeout: Duration::from_secs(n.timeout_secs),
            batch_interval: Duration::from_secs(n.batch_interval_secs),
        })
    }

    #[cfg(feature = "fuse")]
    pub fn mount_options(&self) -> crate::fuse::MountOptions {
        crate::fuse::MountOptions {
            allow_other: self.mount.allow_other,
            auto_unmount: self.mount.auto_unmount,
            attr_ttl: Duration::from_secs(self.mount.attr_ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
        assert!(config.notifier_config().is_none());
        assert_eq!(config.watcher_config().unwrap().policy, ChangePolicy::Checksum);
    }

    #[test]
    fn test_full_document() {
        let text = r#"
            permissions_file = "/tmp/perms.toml"

            [defaults]
            file_mode = 0o440
            dir_gid = 20

            [watcher]
            policy = "disable"
            poll_interval_secs = 10
            checksum_workers = 4

            [notify]
            command = ["notify-send", "%event%", "%files%"]
            timeout_secs = 3

            [mount]
            allow_other = true
        "#;
        let config: Config = toml::from_str(text).unwrap();
        config.validate().unwrap();

        assert_eq!(config.permissions_file, Some(PathBuf::from("/tmp/perms.toml")));
        let defaults = config.permission_defaults(1000, 1000);
        assert_eq!(defaults.file_mode, 0o440);
        assert_eq!(defaults.file_uid, 1000);
        assert_eq!(defaults.dir_gid, 20);
        assert_eq!(defaults.dir_mode, 0o555);

        let watcher = config.watcher_config().unwrap();
        assert_eq!(watcher.policy, ChangePolicy::Disable);
        assert_eq!(watcher.poll_interval, Duration::from_secs(10));
        assert_eq!(watcher.checksum_workers, 4);
        assert_eq!(watcher.queue_capacity, 256);

        let notifier = config.notifier_config().unwrap();
        assert!(matches!(notifier.command, NotifyCommand::Args(ref a) if a.len() == 3));
        assert_eq!(notifier.timeout, Duration::from_secs(3));
        assert_eq!(notifier.batch_interval, Duration::from_secs(5));

        assert!(config.mount.allow_other);
        assert!(config.mount.auto_unmount);
    }

    #[test]
    fn test_shell_command() {
        let config: Config =
            toml::from_str("[notify]\ncommand = \"logger %event%\"").unwrap();
        assert_eq!(
            config.notify.command,
            Some(NotifyCommand::Shell("logger %event%".into()))
        );
    }

    #[test]
    fn test_watcher_disabled() {
        let config: Config = toml::from_str("[watcher]\nenabled = false").unwrap();
        assert!(config.watcher_config().is_none());
    }

    #[test]
    fn test_invalid_settings() {
        let config: Config = toml::from_str("[watcher]\npoll_interval_secs = 0").unwrap();
        assert!(matches!(config.validate(), Err(SettingsError::Invalid(_))));

        let config: Config = toml::from_str("[notify]\ncommand = []").unwrap();
        assert!(matches!(config.validate(), Err(SettingsError::Invalid(_))));

        let config: Config = toml::from_str("[defaults]\nfile_mode = 0o100444").unwrap();
        assert!(matches!(config.validate(), Err(SettingsError::Invalid(_))));

        assert!(toml::from_str::<Config>("unknown = 1").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[mount]\nattr_ttl_secs = 5").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.mount.attr_ttl_secs, 5);

        let missing = Config::load(Path::new("/nonexistent/mediadup.toml"));
        assert!(matches!(missing, Err(SettingsError::Read { .. })));
        assert_eq!(Config::load_or_default(None).unwrap(), Config::default());
    }
}
