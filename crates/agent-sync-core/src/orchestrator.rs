use crate::config::AgentSyncConfig;
use crate::error::SyncEngineError;
use crate::history_store::{RunHistoryStore, RunLogWriter};
use crate::models::{now_ms, RunPhase, SyncItemResult, SyncRunStatus, SyncRunSummary};
use crate::paths::{join_remote, normalize_remote_path, path_display};
use crate::process::CancelToken;
use crate::rclone::{parse_progress_percent, RcloneSession};
use crate::transfer::{TransferExecutor, TransferItemKind, TransferJob};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

const MAX_PROGRESS_LINE_CHARS: usize = 260;
const CODEX_FILTERS: &[&str] = &["+ /config.toml", "+ /sessions/**", "- *"];

/// Builds the ordered work list: enabled projects in config order, then the
/// Codex directory, then the agents directory.
pub fn plan_work(config: &AgentSyncConfig, run_id: &str, home: &Path) -> Vec<TransferJob> {
    let projects_root = normalize_remote_path(&config.remote.projects_root);
    let run_backup_root = join_remote(&config.remote.backup_root, run_id);
    let mirror_delete = config.flags.mirror_delete;
    let excludes = config.effective_excludes();

    let mut jobs: Vec<TransferJob> = config
        .enabled_projects()
        .map(|project| {
            let remote_name = normalize_remote_path(&project.remote_dir_name);
            let name = if project.name.trim().is_empty() {
                remote_name.as_str()
            } else {
                project.name.trim()
            };
            TransferJob {
                label: format!("Project: {name}"),
                kind: TransferItemKind::Project,
                source: expand_local_path(&project.local_path, home),
                destination: join_remote(&projects_root, &remote_name),
                backup_destination: join_remote(
                    &run_backup_root,
                    &format!("projects/{remote_name}"),
                ),
                mirror_delete,
                excludes: excludes.clone(),
                filters: Vec::new(),
            }
        })
        .collect();

    if config.flags.sync_codex {
        jobs.push(TransferJob {
            label: String::from("Codex"),
            kind: TransferItemKind::Codex,
            source: home.join(".codex"),
            destination: String::from(".codex"),
            backup_destination: join_remote(&run_backup_root, "codex"),
            mirror_delete,
            excludes: Vec::new(),
            filters: CODEX_FILTERS.iter().map(|rule| rule.to_string()).collect(),
        });
    }

    if config.flags.sync_agents {
        jobs.push(TransferJob {
            label: String::from("Agents"),
            kind: TransferItemKind::Agents,
            source: home.join(".agents"),
            destination: String::from(".agents"),
            backup_destination: join_remote(&run_backup_root, "agents"),
            mirror_delete,
            excludes: Vec::new(),
            filters: Vec::new(),
        });
    }

    jobs
}

fn expand_local_path(raw: &str, home: &Path) -> PathBuf {
    let trimmed = raw.trim();
    if trimmed == "~" {
        return home.to_path_buf();
    }
    match trimmed.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(trimmed),
    }
}

#[derive(Debug)]
struct RunSlot {
    status: SyncRunStatus,
    cancel: Option<CancelToken>,
    handle: Option<JoinHandle<SyncRunSummary>>,
}

type SharedSlot = Arc<Mutex<RunSlot>>;

fn lock(slot: &SharedSlot) -> MutexGuard<'_, RunSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the single live run. Every public method is safe to call from any
/// thread while a run executes in the background.
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    history: RunHistoryStore,
    executor: TransferExecutor,
    home_directory: PathBuf,
    slot: SharedSlot,
}

impl SyncOrchestrator {
    pub fn new(history: RunHistoryStore, home_directory: PathBuf) -> Self {
        Self {
            history,
            executor: TransferExecutor::default(),
            home_directory,
            slot: Arc::new(Mutex::new(RunSlot {
                status: SyncRunStatus::idle(),
                cancel: None,
                handle: None,
            })),
        }
    }

    pub fn history(&self) -> &RunHistoryStore {
        &self.history
    }

    pub fn start(&self, config: &AgentSyncConfig) -> Result<String, SyncEngineError> {
        let mut slot = lock(&self.slot);
        if slot.status.running {
            let active = slot.status.run_id.clone().unwrap_or_default();
            return Err(SyncEngineError::AlreadyRunning(active));
        }

        for warning in config.validate_for_run()? {
            warn!(%warning, "configuration warning");
        }
        let session = RcloneSession::prepare(config)?;

        let run_id = Uuid::new_v4().simple().to_string();
        let jobs = plan_work(config, &run_id, &self.home_directory);
        let backup_root = join_remote(&config.remote.backup_root, &run_id);
        let log = self.history.create_log(&run_id)?;
        let started_at_ms = now_ms();

        let cancel = CancelToken::new();
        let total_items = jobs.len() as u32;
        info!(run_id = %run_id, items = total_items, "sync run started");

        let run = ActiveRun {
            run_id: run_id.clone(),
            started_at_ms,
            backup_root,
            session,
            jobs,
            cancel: cancel.clone(),
            log: RunLog::new(log),
            slot: Arc::clone(&self.slot),
            history: self.history.clone(),
            executor: self.executor.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("agentsync-run-{run_id}"))
            .spawn(move || run.execute())
            .map_err(|e| SyncEngineError::io(self.history.paths().log_path(&run_id), e))?;

        // The run thread blocks on this guard until the slot is populated.
        slot.status = SyncRunStatus {
            phase: RunPhase::Running,
            running: true,
            run_id: Some(run_id.clone()),
            started_at_ms: Some(started_at_ms),
            total_items,
            ..SyncRunStatus::idle()
        };
        slot.cancel = Some(cancel);
        slot.handle = Some(handle);

        Ok(run_id)
    }

    /// Snapshot of the live run, or of the last finished run.
    pub fn status(&self) -> SyncRunStatus {
        lock(&self.slot).status.clone()
    }

    /// Returns false when `run_id` is not the run currently executing.
    pub fn cancel(&self, run_id: &str) -> bool {
        let slot = lock(&self.slot);
        if !slot.status.running || slot.status.run_id.as_deref() != Some(run_id) {
            return false;
        }
        match &slot.cancel {
            Some(token) => {
                info!(run_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Blocks until the latest run has finished and returns its summary.
    pub fn wait(&self) -> Option<SyncRunSummary> {
        let handle = lock(&self.slot).handle.take();
        match handle {
            Some(handle) => match handle.join() {
                Ok(summary) => Some(summary),
                Err(_) => {
                    warn!("sync run thread panicked");
                    self.status().summary
                }
            },
            None => self.status().summary,
        }
    }
}

/// Run log that never fails the run: write errors are reported once.
struct RunLog {
    writer: RunLogWriter,
    broken: bool,
}

impl RunLog {
    fn new(writer: RunLogWriter) -> Self {
        Self {
            writer,
            broken: false,
        }
    }

    fn line(&mut self, text: &str) {
        if self.broken {
            return;
        }
        if let Err(error) = self.writer.line(text) {
            warn!(%error, "run log write failed");
            self.broken = true;
        }
    }

    fn path(&self) -> String {
        path_display(self.writer.path())
    }
}

struct ActiveRun {
    run_id: String,
    started_at_ms: u64,
    backup_root: String,
    session: RcloneSession,
    jobs: Vec<TransferJob>,
    cancel: CancelToken,
    log: RunLog,
    slot: SharedSlot,
    history: RunHistoryStore,
    executor: TransferExecutor,
}

impl ActiveRun {
    fn update(&self, apply: impl FnOnce(&mut SyncRunStatus)) {
        apply(&mut lock(&self.slot).status);
    }

    fn execute(mut self) -> SyncRunSummary {
        let total = self.jobs.len();
        self.log.line(&format!("backup_root: {}", self.backup_root));
        self.log.line(&format!("items: {total}"));

        let jobs = std::mem::take(&mut self.jobs);
        let mut items: Vec<SyncItemResult> = Vec::with_capacity(total);
        let mut cancelled = false;
        let mut connection_error: Option<String> = None;

        for (index, job) in jobs.iter().enumerate() {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                self.log.line("run cancelled before next item");
            }

            let result = if cancelled {
                SyncItemResult::failed(&job.label, "not attempted: run cancelled")
            } else if connection_error.is_some() {
                SyncItemResult::failed(&job.label, "skipped: connection unavailable")
            } else {
                self.transfer(index, total, job, &mut cancelled, &mut connection_error)
            };

            self.log.line(&format!(
                "<== {}: {} {}",
                result.label,
                if result.ok { "ok" } else { "FAILED" },
                result.message
            ));
            items.push(result);
            let snapshot = items.clone();
            self.update(|status| {
                status.done_items = snapshot.len() as u32;
                status.items = snapshot;
            });
        }

        self.finish(items, cancelled, connection_error)
    }

    fn transfer(
        &mut self,
        index: usize,
        total: usize,
        job: &TransferJob,
        cancelled: &mut bool,
        connection_error: &mut Option<String>,
    ) -> SyncItemResult {
        self.update(|status| {
            status.current_label = Some(job.label.clone());
            status.last_line = None;
            status.progress_percent = None;
        });
        self.log.line("");
        self.log
            .line(&format!("==> [{}/{}] {}", index + 1, total, job.label));
        self.log.line(&format!(
            "    {} -> {}",
            job.source.display(),
            self.session.remote(&job.destination)
        ));
        self.log
            .line(&format!("$ {}", self.session.render(&job.arguments(&self.session))));

        let slot = Arc::clone(&self.slot);
        let log = &mut self.log;
        let report = self
            .executor
            .run(&self.session, job, &self.cancel, &mut |line: &str| {
                log.line(line);
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return;
                }
                let shown = cap_line(trimmed);
                let percent = parse_progress_percent(trimmed);
                let mut guard = lock(&slot);
                guard.status.last_line = Some(shown);
                if percent.is_some() {
                    guard.status.progress_percent = percent;
                }
            });

        if report.cancelled {
            *cancelled = true;
        }
        if let Some(outcome) = report.connection_failure {
            let error = SyncEngineError::ConnectionUnavailable(format!(
                "{} ({})",
                report.result.message,
                outcome.as_str()
            ));
            warn!(run_id = %self.run_id, item = %job.label, "remote connection lost");
            self.log.line(&error.to_string());
            *connection_error = Some(error.to_string());
        } else if !report.result.ok && !report.cancelled {
            let error = SyncEngineError::ItemTransferFailed {
                label: job.label.clone(),
                message: report.result.message.clone(),
            };
            self.log.line(&error.to_string());
        }

        report.result
    }

    fn finish(
        mut self,
        items: Vec<SyncItemResult>,
        cancelled: bool,
        connection_error: Option<String>,
    ) -> SyncRunSummary {
        let ended_at_ms = now_ms();
        let ok = !cancelled && items.iter().all(|item| item.ok);
        let mut error = if cancelled {
            Some(SyncEngineError::Cancelled.to_string().to_lowercase())
        } else {
            connection_error
        };

        let summary = SyncRunSummary {
            run_id: self.run_id.clone(),
            started_at_ms: self.started_at_ms,
            ended_at_ms,
            ok,
            cancelled,
            backup_root: self.backup_root.clone(),
            log_path: self.log.path(),
            items,
        };

        self.log.line("");
        self.log.line("== summary ==");
        for item in &summary.items {
            self.log.line(&format!(
                "{} {}: {}",
                if item.ok { "OK  " } else { "FAIL" },
                item.label,
                item.message
            ));
        }
        self.log.line(&format!(
            "result: {}",
            if cancelled {
                "cancelled"
            } else if ok {
                "ok"
            } else {
                "failed"
            }
        ));
        self.log.line(&format!("backup: {}", summary.backup_root));

        if let Err(history_error) = self.history.append(&summary) {
            warn!(run_id = %self.run_id, error = %history_error, "failed to record run history");
            self.log
                .line(&format!("history write failed: {history_error}"));
            let text = format!("history write failed: {history_error}");
            error = Some(match error {
                Some(existing) => format!("{existing}; {text}"),
                None => text,
            });
        }

        let phase = if cancelled {
            RunPhase::Cancelled
        } else if ok {
            RunPhase::Succeeded
        } else {
            RunPhase::Failed
        };
        info!(run_id = %self.run_id, ok, cancelled, "sync run finished");

        let recorded = summary.clone();
        let released = release_slot(&mut lock(&self.slot), &self.run_id, |status| {
            status.phase = phase;
            status.ended_at_ms = Some(ended_at_ms);
            status.ok = Some(ok);
            status.current_label = None;
            status.error = error;
            status.items = recorded.items.clone();
            status.done_items = recorded.items.len() as u32;
            status.summary = Some(recorded);
        });
        if !released {
            warn!(run_id = %self.run_id, "run slot already taken by another run");
        }

        summary
    }
}

/// Marks `run_id` finished and drops its cancel token under one guard. A
/// slot already owned by another run is left untouched.
fn release_slot(
    slot: &mut RunSlot,
    run_id: &str,
    apply: impl FnOnce(&mut SyncRunStatus),
) -> bool {
    if slot.status.run_id.as_deref() != Some(run_id) {
        return false;
    }
    apply(&mut slot.status);
    slot.status.running = false;
    slot.cancel = None;
    true
}

fn cap_line(line: &str) -> String {
    if line.chars().count() <= MAX_PROGRESS_LINE_CHARS {
        return line.to_string();
    }
    line.chars().take(MAX_PROGRESS_LINE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::{cap_line, plan_work, release_slot, RunSlot, MAX_PROGRESS_LINE_CHARS};
    use crate::config::{AgentSyncConfig, ProjectItem};
    use crate::models::{RunPhase, SyncRunStatus};
    use crate::process::CancelToken;
    use crate::transfer::TransferItemKind;
    use std::path::{Path, PathBuf};

    fn project(id: &str, enabled: bool) -> ProjectItem {
        ProjectItem {
            id: id.to_string(),
            name: format!("Repo {id}"),
            local_path: format!("~/code/{id}"),
            remote_dir_name: id.to_string(),
            enabled,
        }
    }

    #[test]
    fn work_list_orders_projects_then_codex_then_agents() {
        let mut config = AgentSyncConfig::default();
        config.projects = vec![project("a", true), project("off", false), project("b", true)];
        config.flags.sync_agents = false;

        let jobs = plan_work(&config, "run1", Path::new("/home/dev"));
        let labels: Vec<&str> = jobs.iter().map(|job| job.label.as_str()).collect();
        assert_eq!(labels, vec!["Project: Repo a", "Project: Repo b", "Codex"]);

        assert_eq!(jobs[0].source, PathBuf::from("/home/dev/code/a"));
        assert_eq!(jobs[0].destination, "AgentSync/projects/a");
        assert_eq!(
            jobs[0].backup_destination,
            "AgentSync/.agentsync-backup/run1/projects/a"
        );
        assert_eq!(jobs[2].kind, TransferItemKind::Codex);
        assert_eq!(jobs[2].source, PathBuf::from("/home/dev/.codex"));
        assert_eq!(jobs[2].backup_destination, "AgentSync/.agentsync-backup/run1/codex");
        assert!(jobs[2].excludes.is_empty());
        assert_eq!(jobs[2].filters.last().map(String::as_str), Some("- *"));
    }

    #[test]
    fn every_job_gets_a_run_scoped_backup() {
        let mut config = AgentSyncConfig::default();
        config.remote.backup_root = String::from("~/bk/");
        config.flags.mirror_delete = false;
        config.projects = vec![project("a", true)];

        let jobs = plan_work(&config, "r42", Path::new("/h"));
        assert_eq!(jobs.len(), 3);
        for job in &jobs {
            assert!(job.backup_destination.starts_with("bk/r42/"));
            assert!(!job.mirror_delete);
        }
        assert_eq!(jobs[2].destination, ".agents");
    }

    #[test]
    fn progress_lines_are_capped() {
        let long = "x".repeat(MAX_PROGRESS_LINE_CHARS + 40);
        assert_eq!(cap_line(&long).chars().count(), MAX_PROGRESS_LINE_CHARS);
        assert_eq!(cap_line("short"), "short");
    }

    fn running_slot(run_id: &str) -> RunSlot {
        RunSlot {
            status: SyncRunStatus {
                phase: RunPhase::Running,
                running: true,
                run_id: Some(run_id.to_string()),
                ..SyncRunStatus::idle()
            },
            cancel: Some(CancelToken::new()),
            handle: None,
        }
    }

    #[test]
    fn releasing_a_run_clears_its_token_with_the_running_flag() {
        let mut slot = running_slot("current");
        assert!(release_slot(&mut slot, "current", |status| {
            status.phase = RunPhase::Succeeded;
        }));
        assert!(!slot.status.running);
        assert_eq!(slot.status.phase, RunPhase::Succeeded);
        assert!(slot.cancel.is_none());
    }

    #[test]
    fn stale_release_keeps_the_newer_run_cancellable() {
        let mut slot = running_slot("newer");
        assert!(!release_slot(&mut slot, "older", |status| {
            status.phase = RunPhase::Failed;
        }));
        assert!(slot.status.running);
        assert_eq!(slot.status.phase, RunPhase::Running);
        assert!(slot.cancel.is_some());
    }
}
