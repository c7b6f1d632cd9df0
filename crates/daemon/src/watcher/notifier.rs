//! Batching external-command notifier
//!
//! Change events are collected for a short interval and then handed to one
//! invocation of a user-configured command. The command sees the batch
//! through three placeholders:
//!
//! - `%source%`: affected source files
//! - `%files%`: affected virtual files
//! - `%event%`: combined description of what happened
//!
//! In argument-list mode an argument that is exactly a placeholder expands
//! to one argument per value; placeholders embedded in a longer argument are
//! replaced by the values joined with `", "`. In shell mode each value is
//! single-quoted before substitution.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// Source changed; no action taken
    Changed,
    /// Dependents disabled without verification
    Disabled,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch,
    Unreadable,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Changed => write!(f, "source changed"),
            ChangeKind::Disabled => write!(f, "source changed, files disabled"),
            ChangeKind::Missing => write!(f, "source missing"),
            ChangeKind::SizeMismatch { expected, actual } => {
                write!(f, "source size changed ({} -> {})", expected, actual)
            }
            ChangeKind::ChecksumMismatch => write!(f, "source checksum mismatch"),
            ChangeKind::Unreadable => write!(f, "source unreadable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub source: PathBuf,
    pub files: Vec<String>,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(source: &Path, files: Vec<String>, kind: ChangeKind) -> Self {
        Self {
            source: source.to_path_buf(),
            files,
            kind,
        }
    }
}

/// Command to run per batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotifyCommand {
    /// Program and arguments, run directly
    Args(Vec<String>),
    /// Interpreted by `/bin/sh -c`
    Shell(String),
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub command: NotifyCommand,
    pub timeout: Duration,
    pub batch_interval: Duration,
}

/// Cheap handle for reporting events; clone freely
#[derive(Debug, Clone)]
pub struct NotifierHandle {
    tx: flume::Sender<ChangeEvent>,
}

impl NotifierHandle {
    /// Queue an event for the next batch
    pub fn report(&self, event: ChangeEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("notifier stopped, dropping change event");
        }
    }
}

/// Events of one batch, deduplicated in arrival order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Batch {
    pub sources: Vec<String>,
    pub files: Vec<String>,
    pub events: Vec<String>,
}

impl Batch {
    pub fn push(&mut self, event: ChangeEvent) {
        push_unique(&mut self.sources, event.source.display().to_string());
        for file in event.files {
            push_unique(&mut self.files, file);
        }
        push_unique(
            &mut self.events,
            format!("{}: {}", event.kind, event.source.display()),
        );
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn description(&self) -> String {
        self.events.join("; ")
    }

    fn values(&self, placeholder: &str) -> Option<Vec<String>> {
        match placeholder {
            "%source%" => Some(self.sources.clone()),
            "%files%" => Some(self.files.clone()),
            "%event%" => Some(vec![self.description()]),
            _ => None,
        }
    }

    /// Substitute placeholders into an argument list
    pub fn expand_args(&self, args: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            match self.values(arg) {
                Some(values) => out.extend(values),
                None => out.push(self.substitute(arg, |values| values.join(", "))),
            }
        }
        out
    }

    /// Substitute shell-quoted placeholders into a shell command line
    pub fn expand_shell(&self, command: &str) -> String {
        self.substitute(command, |values| {
            values
                .iter()
                .map(|v| shell_quote(v))
                .collect::<Vec<_>>()
                .join(" ")
        })
    }

    /// Expand placeholders in one left-to-right pass
    ///
    /// Substituted text is never scanned again, so values containing
    /// placeholder syntax are emitted literally.
    fn substitute(&self, template: &str, render: impl Fn(&[String]) -> String) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('%') {
            let placeholder = rest[start + 1..]
                .find('%')
                .map(|end| &rest[start..start + end + 2]);
            match placeholder.and_then(|p| self.values(p).map(|values| (p, values))) {
                Some((placeholder, values)) => {
                    out.push_str(&rest[..start]);
                    out.push_str(&render(&values));
                    rest = &rest[start + placeholder.len()..];
                }
                None => {
                    out.push_str(&rest[..=start]);
                    rest = &rest[start + 1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Quote `value` for POSIX sh
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Start the batching task
///
/// The task ends, after flushing its last batch, once every handle is dropped.
pub fn spawn(config: NotifierConfig) -> (NotifierHandle, JoinHandle<()>) {
    let (tx, rx) = flume::unbounded();
    let task = tokio::spawn(batch_loop(config, rx));
    (NotifierHandle { tx }, task)
}

async fn batch_loop(config: NotifierConfig, rx: flume::Receiver<ChangeEvent>) {
    while let Ok(first) = rx.recv_async().await {
        let mut batch = Batch::default();
        batch.push(first);

        let window = tokio::time::sleep(config.batch_interval);
        tokio::pin!(window);
        let mut closed = false;
        loop {
            tokio::select! {
                _ = &mut window => break,
                next = rx.recv_async() => match next {
                    Ok(event) => batch.push(event),
                    Err(_) => {
                        closed = true;
                        break;
                    }
                },
            }
        }

        run_command(&config, &batch).await;
        if closed {
            break;
        }
    }
    tracing::debug!("change notifier stopped");
}

/// Run the configured command for `batch`; failures are only logged
pub async fn run_command(config: &NotifierConfig, batch: &Batch) {
    if batch.is_empty() {
        return;
    }

    let mut command = match &config.command {
        NotifyCommand::Args(args) => {
            let args = batch.expand_args(args);
            let Some((program, rest)) = args.split_first() else {
                tracing::warn!("notify command is empty");
                return;
            };
            let mut command = tokio::process::Command::new(program);
            command.args(rest);
            command
        }
        NotifyCommand::Shell(line) => {
            let mut command = tokio::process::Command::new("/bin/sh");
            command.arg("-c").arg(batch.expand_shell(line));
            command
        }
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(config.timeout, command.output()).await {
        Err(_) => {
            tracing::warn!(
                timeout_secs = config.timeout.as_secs_f64(),
                "notify command timed out and was killed"
            );
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to run notify command");
        }
        Ok(Ok(output)) if !output.status.success() => {
            tracing::warn!(
                status = %output.status,
                stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "notify command failed"
            );
        }
        Ok(Ok(_)) => {
            tracing::debug!(
                sources = batch.sources.len(),
                files = batch.files.len(),
                "notify command completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn event(source: &str, files: &[&str], kind: ChangeKind) -> ChangeEvent {
        ChangeEvent::new(
            Path::new(source),
            files.iter().map(|f| f.to_string()).collect(),
            kind,
        )
    }

    fn sample_batch() -> Batch {
        let mut batch = Batch::default();
        batch.push(event("/src/a.mkv", &["A.mkv", "B.mkv"], ChangeKind::ChecksumMismatch));
        batch.push(event("/src/b.mkv", &["B.mkv"], ChangeKind::Missing));
        batch.push(event("/src/a.mkv", &["A.mkv"], ChangeKind::ChecksumMismatch));
        batch
    }

    #[test]
    fn test_batch_deduplicates() {
        let batch = sample_batch();
        assert_eq!(batch.sources, vec!["/src/a.mkv", "/src/b.mkv"]);
        assert_eq!(batch.files, vec!["A.mkv", "B.mkv"]);
        assert_eq!(
            batch.description(),
            "source checksum mismatch: /src/a.mkv; source missing: /src/b.mkv"
        );
    }

    #[test]
    fn test_expand_args() {
        let batch = sample_batch();
        let args: Vec<String> = ["notify-send", "%files%", "changed: %source%"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            batch.expand_args(&args),
            vec![
                "notify-send",
                "A.mkv",
                "B.mkv",
                "changed: /src/a.mkv, /src/b.mkv"
            ]
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_expand_shell_quotes_each_value() {
        let mut batch = Batch::default();
        batch.push(event("/src/it's.mkv", &["x y.mkv"], ChangeKind::Changed));
        assert_eq!(
            batch.expand_shell("echo %files% %source%"),
            "echo 'x y.mkv' '/src/it'\\''s.mkv'"
        );
    }

    #[test]
    fn test_placeholders_inside_values_stay_literal() {
        let mut batch = Batch::default();
        batch.push(event("/src/%files%", &["$(touch x) %source%"], ChangeKind::Changed));

        assert_eq!(
            batch.expand_shell("echo %source% %files%"),
            "echo '/src/%files%' '$(touch x) %source%'"
        );
        let args = vec!["notify".to_string(), "at %source%: %event%".to_string()];
        assert_eq!(
            batch.expand_args(&args),
            vec!["notify", "at /src/%files%: source changed: /src/%files%"]
        );
        assert_eq!(batch.expand_shell("100% done %files"), "100% done %files");
    }

    #[tokio::test]
    async fn test_shell_values_are_never_executed() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let out = dir.path().join("out.txt");
        let config = NotifierConfig {
            command: NotifyCommand::Shell(format!(
                "echo %source% > {}",
                shell_quote(&out.display().to_string())
            )),
            timeout: Duration::from_secs(10),
            batch_interval: Duration::from_millis(10),
        };
        let mut batch = Batch::default();
        let payload = format!("$(touch {})", marker.display());
        batch.push(event("/src/%files%", &[payload.as_str()], ChangeKind::Changed));

        run_command(&config, &batch).await;
        assert!(!marker.exists());
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "/src/%files%\n");
    }

    #[tokio::test]
    async fn test_shell_command_receives_batch() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let config = NotifierConfig {
            command: NotifyCommand::Shell(format!(
                "printf '%s\\n' %files% > {}",
                shell_quote(&out.display().to_string())
            )),
            timeout: Duration::from_secs(10),
            batch_interval: Duration::from_millis(50),
        };

        let (handle, task) = spawn(config);
        handle.report(event("/src/a.mkv", &["one two.mkv"], ChangeKind::Changed));
        handle.report(event("/src/a.mkv", &["three.mkv"], ChangeKind::Changed));
        drop(handle);
        task.await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "one two.mkv\nthree.mkv\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let config = NotifierConfig {
            command: NotifyCommand::Args(vec!["sleep".into(), "30".into()]),
            timeout: Duration::from_millis(100),
            batch_interval: Duration::from_millis(10),
        };
        let mut batch = Batch::default();
        batch.push(event("/src/a.mkv", &["a.mkv"], ChangeKind::Changed));

        let started = Instant::now();
        run_command(&config, &batch).await;
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_failing_command_is_not_fatal() {
        let config = NotifierConfig {
            command: NotifyCommand::Args(vec!["/nonexistent/notify-bin".into()]),
            timeout: Duration::from_secs(1),
            batch_interval: Duration::from_millis(10),
        };
        let mut batch = Batch::default();
        batch.push(event("/src/a.mkv", &["a.mkv"], ChangeKind::Changed));
        run_command(&config, &batch).await;
    }
}
