use crate::models::{ConnectionProbeOutcome, SyncItemResult};
use crate::process::{
    run_streaming, CancelToken, OutputLine, ProcessError, ProcessExit, ProcessLimits,
};
use crate::rclone::{classify_failure, RcloneSession};
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferItemKind {
    Project,
    Codex,
    Agents,
}

impl TransferItemKind {
    pub fn is_fixed(self) -> bool {
        !matches!(self, Self::Project)
    }
}

/// One logical item of a run, fully resolved to local and remote paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub label: String,
    pub kind: TransferItemKind,
    pub source: PathBuf,
    pub destination: String,
    pub backup_destination: String,
    pub mirror_delete: bool,
    pub excludes: Vec<String>,
    pub filters: Vec<String>,
}

impl TransferJob {
    /// `sync` removes remote-only files; `copy` never deletes. Both route
    /// every replaced or removed remote file into `--backup-dir`.
    pub fn arguments(&self, session: &RcloneSession) -> Vec<String> {
        let mode = if self.mirror_delete { "sync" } else { "copy" };
        let mut args = vec![
            String::from(mode),
            self.source.to_string_lossy().to_string(),
            session.remote(&self.destination),
            String::from("--backup-dir"),
            session.remote(&self.backup_destination),
            String::from("--stats"),
            String::from("1s"),
            String::from("--stats-one-line"),
            String::from("--stats-log-level"),
            String::from("NOTICE"),
        ];

        if self.kind == TransferItemKind::Project {
            for pattern in &self.excludes {
                args.push(String::from("--exclude"));
                args.push(pattern.clone());
            }
        }
        for rule in &self.filters {
            args.push(String::from("--filter"));
            args.push(rule.clone());
        }

        args
    }
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub result: SyncItemResult,
    pub cancelled: bool,
    /// Set when the failure means the remote cannot be reached at all.
    pub connection_failure: Option<ConnectionProbeOutcome>,
}

impl TransferReport {
    fn finished(result: SyncItemResult) -> Self {
        Self {
            result,
            cancelled: false,
            connection_failure: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferExecutor {
    limits: ProcessLimits,
}

impl TransferExecutor {
    pub fn run(
        &self,
        session: &RcloneSession,
        job: &TransferJob,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> TransferReport {
        if let Some(report) = self.check_source(job) {
            return report;
        }

        let args = job.arguments(session);
        debug!(item = %job.label, command = %session.render(&args), "starting transfer");

        let mut command = session.command(&args);
        let outcome = match run_streaming(&mut command, cancel, self.limits, &mut |line: &OutputLine| {
            on_line(&line.text)
        }) {
            Ok(outcome) => outcome,
            Err(ProcessError::Spawn(error)) => {
                warn!(item = %job.label, %error, "failed to start transfer");
                return TransferReport::finished(SyncItemResult::failed(
                    &job.label,
                    format!(
                        "could not start {}: {error}",
                        session.binary().path.display()
                    ),
                ));
            }
            Err(error @ ProcessError::Supervise(_)) => {
                warn!(item = %job.label, %error, "transfer aborted");
                return TransferReport::finished(SyncItemResult::failed(
                    &job.label,
                    format!("aborted: {error}"),
                ));
            }
        };

        match outcome.exit {
            ProcessExit::Exited { success: true, .. } => {
                let detail = outcome
                    .tail
                    .iter()
                    .rev()
                    .find(|line| line.contains("Transferred") || line.contains('%'))
                    .cloned();
                let message = match detail {
                    Some(stats) => format!("completed ({})", compact(&stats)),
                    None => String::from("completed"),
                };
                TransferReport::finished(SyncItemResult::ok(&job.label, message))
            }
            ProcessExit::Exited { code, .. } => {
                let tail = outcome.tail_text();
                let code_text = code
                    .map(|value| value.to_string())
                    .unwrap_or_else(|| String::from("signal"));
                let mut message = format!("failed (exit code {code_text})");
                if let Some(reason) = last_error_line(&outcome.tail) {
                    message.push_str(": ");
                    message.push_str(&compact(reason));
                }
                warn!(item = %job.label, exit = %code_text, "transfer failed");
                TransferReport {
                    result: SyncItemResult::failed(&job.label, message),
                    cancelled: false,
                    connection_failure: classify_failure(&tail)
                        .filter(|outcome| outcome.is_connection_level()),
                }
            }
            ProcessExit::Cancelled => TransferReport {
                result: SyncItemResult::failed(&job.label, "cancelled"),
                cancelled: true,
                connection_failure: None,
            },
            ProcessExit::TimedOut => TransferReport {
                result: SyncItemResult::failed(&job.label, "timed out"),
                cancelled: false,
                connection_failure: None,
            },
        }
    }

    /// Projects need a readable source directory; the two fixed items are
    /// skipped when the local directory is absent.
    fn check_source(&self, job: &TransferJob) -> Option<TransferReport> {
        let source = &job.source;
        if !source.exists() {
            let result = if job.kind.is_fixed() {
                SyncItemResult::ok(
                    &job.label,
                    format!("skipped: {} not found locally", source.display()),
                )
            } else {
                SyncItemResult::failed(
                    &job.label,
                    format!("source does not exist: {}", source.display()),
                )
            };
            return Some(TransferReport::finished(result));
        }

        if !source.is_dir() {
            return Some(TransferReport::finished(SyncItemResult::failed(
                &job.label,
                format!("source is not a directory: {}", source.display()),
            )));
        }

        if let Err(error) = std::fs::read_dir(source) {
            return Some(TransferReport::finished(SyncItemResult::failed(
                &job.label,
                format!("source is not readable: {} ({error})", source.display()),
            )));
        }

        None
    }
}

fn last_error_line(tail: &[String]) -> Option<&str> {
    tail.iter()
        .rev()
        .find(|line| line.contains("ERROR") || line.contains("Failed") || line.contains("error"))
        .or_else(|| tail.last())
        .map(String::as_str)
}

fn compact(line: &str) -> String {
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= 200 {
        return collapsed;
    }
    let mut shortened: String = collapsed.chars().take(200).collect();
    shortened.push('…');
    shortened
}
