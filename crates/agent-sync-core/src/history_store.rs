use crate::error::SyncEngineError;
use crate::models::SyncRunSummary;
use crate::paths::{is_plain_identifier, AgentSyncPaths};
use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Append-only run history: one JSON summary per line plus one verbatim
/// log file per run.
#[derive(Debug, Clone)]
pub struct RunHistoryStore {
    paths: AgentSyncPaths,
    append_lock: Arc<Mutex<()>>,
}

impl Default for RunHistoryStore {
    fn default() -> Self {
        Self::new(AgentSyncPaths::detect())
    }
}

impl RunHistoryStore {
    pub fn new(paths: AgentSyncPaths) -> Self {
        Self {
            paths,
            append_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn append(&self, summary: &SyncRunSummary) -> Result<(), SyncEngineError> {
        self.paths
            .ensure_runtime_dir()
            .map_err(|e| SyncEngineError::io(&self.paths.runtime_directory, e))?;

        let mut line = serde_json::to_vec(summary)?;
        line.push(b'\n');

        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| SyncEngineError::Unsupported(String::from("history lock poisoned")))?;
        let path = &self.paths.history_path;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SyncEngineError::io(path, e))?;
        // One write per record keeps readers from seeing half a summary.
        file.write_all(&line)
            .and_then(|()| file.sync_data())
            .map_err(|e| SyncEngineError::io(path, e))
    }

    /// Most recent first; ties on start time keep the later append first.
    pub fn list(&self) -> Vec<SyncRunSummary> {
        let Ok(file) = File::open(&self.paths.history_path) else {
            return Vec::new();
        };

        let mut runs: Vec<SyncRunSummary> = BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        runs.reverse();
        runs.sort_by(|lhs, rhs| rhs.started_at_ms.cmp(&lhs.started_at_ms));
        runs
    }

    pub fn read_log(&self, run_id: &str) -> Result<String, SyncEngineError> {
        if !is_plain_identifier(run_id) {
            return Err(SyncEngineError::HistoryNotFound(run_id.to_string()));
        }
        let path = self.paths.log_path(run_id);
        if !path.is_file() {
            return Err(SyncEngineError::HistoryNotFound(run_id.to_string()));
        }
        std::fs::read_to_string(&path).map_err(|e| SyncEngineError::io(&path, e))
    }

    pub fn create_log(&self, run_id: &str) -> Result<RunLogWriter, SyncEngineError> {
        std::fs::create_dir_all(&self.paths.logs_directory)
            .map_err(|e| SyncEngineError::io(&self.paths.logs_directory, e))?;
        RunLogWriter::create(self.paths.log_path(run_id), run_id)
    }

    pub fn paths(&self) -> &AgentSyncPaths {
        &self.paths
    }
}

/// Line-oriented run log, flushed after every line so it survives a
/// failed or cancelled run.
#[derive(Debug)]
pub struct RunLogWriter {
    path: PathBuf,
    file: File,
}

impl RunLogWriter {
    fn create(path: PathBuf, run_id: &str) -> Result<Self, SyncEngineError> {
        let file = File::create(&path).map_err(|e| SyncEngineError::io(&path, e))?;
        let mut writer = Self { path, file };
        writer.line(&format!("AgentSync run_id: {run_id}"))?;
        writer.line(&format!(
            "started_at: {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        ))?;
        Ok(writer)
    }

    pub fn line(&mut self, text: &str) -> Result<(), SyncEngineError> {
        writeln!(self.file, "{text}")
            .and_then(|()| self.file.flush())
            .map_err(|e| SyncEngineError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::RunHistoryStore;
    use crate::error::SyncEngineError;
    use crate::models::{SyncItemResult, SyncRunSummary};
    use crate::paths::AgentSyncPaths;
    use tempfile::tempdir;

    fn summary(run_id: &str, started_at_ms: u64) -> SyncRunSummary {
        SyncRunSummary {
            run_id: run_id.to_string(),
            started_at_ms,
            ended_at_ms: started_at_ms + 10,
            ok: true,
            cancelled: false,
            backup_root: format!("AgentSync/.agentsync-backup/{run_id}"),
            log_path: format!("/tmp/{run_id}.log"),
            items: vec![SyncItemResult::ok("Project: a", "completed")],
        }
    }

    #[test]
    fn list_is_newest_first_and_counts_every_append() {
        let dir = tempdir().expect("tempdir");
        let store = RunHistoryStore::new(AgentSyncPaths::from_runtime(dir.path().to_path_buf()));

        store.append(&summary("first", 100)).expect("append");
        store.append(&summary("third", 300)).expect("append");
        store.append(&summary("second", 200)).expect("append");
        store.append(&summary("tie", 300)).expect("append");

        let ids: Vec<String> = store.list().into_iter().map(|run| run.run_id).collect();
        assert_eq!(ids, vec!["tie", "third", "second", "first"]);
    }

    #[test]
    fn unparseable_lines_are_skipped() {
        let dir = tempdir().expect("tempdir");
        let paths = AgentSyncPaths::from_runtime(dir.path().to_path_buf());
        let store = RunHistoryStore::new(paths.clone());
        store.append(&summary("good", 1)).expect("append");
        let mut raw = std::fs::read_to_string(&paths.history_path).expect("read");
        raw.push_str("{\"runId\": \"trunc\n\n");
        std::fs::write(&paths.history_path, raw).expect("write");

        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn read_log_returns_verbatim_lines() {
        let dir = tempdir().expect("tempdir");
        let store = RunHistoryStore::new(AgentSyncPaths::from_runtime(dir.path().to_path_buf()));
        let mut log = store.create_log("abc123").expect("log");
        log.line("Transferred:   1 / 2, 50%").expect("line");
        drop(log);

        let text = store.read_log("abc123").expect("read");
        assert!(text.starts_with("AgentSync run_id: abc123\n"));
        assert!(text.contains("Transferred:   1 / 2, 50%\n"));
    }

    #[test]
    fn read_log_misses_are_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = RunHistoryStore::new(AgentSyncPaths::from_runtime(dir.path().to_path_buf()));
        assert!(matches!(
            store.read_log("missing"),
            Err(SyncEngineError::HistoryNotFound(_))
        ));
        assert!(matches!(
            store.read_log("../config"),
            Err(SyncEngineError::HistoryNotFound(_))
        ));
    }
}
