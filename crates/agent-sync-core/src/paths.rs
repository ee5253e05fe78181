use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Tool-owned files, all rooted under one runtime directory.
#[derive(Debug, Clone)]
pub struct AgentSyncPaths {
    pub runtime_directory: PathBuf,
    pub config_path: PathBuf,
    pub history_path: PathBuf,
    pub logs_directory: PathBuf,
    pub keys_directory: PathBuf,
}

impl AgentSyncPaths {
    pub fn detect() -> Self {
        if let Ok(override_dir) = std::env::var("AGENT_SYNC_HOME") {
            if !override_dir.trim().is_empty() {
                return Self::from_runtime(PathBuf::from(override_dir));
            }
        }

        if let Some(home) = home_dir() {
            return Self::from_runtime(home.join(".agentsync"));
        }

        if let Some(project_dirs) = ProjectDirs::from("dev", "agentsync", "AgentSync") {
            return Self::from_runtime(project_dirs.data_dir().to_path_buf());
        }

        Self::from_runtime(PathBuf::from(".agentsync"))
    }

    pub fn from_runtime(runtime_directory: PathBuf) -> Self {
        let config_path = runtime_directory.join("config.json");
        let history_path = runtime_directory.join("history.jsonl");
        let logs_directory = runtime_directory.join("logs");
        let keys_directory = runtime_directory.join("keys");
        Self {
            runtime_directory,
            config_path,
            history_path,
            logs_directory,
            keys_directory,
        }
    }

    pub fn ensure_runtime_dir(&self) -> Result<(), std::io::Error> {
        std::fs::create_dir_all(&self.runtime_directory)
    }

    pub fn log_path(&self, run_id: &str) -> PathBuf {
        self.logs_directory.join(format!("{run_id}.log"))
    }
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()))
}

/// Normalizes a remote path relative to the remote home: backslashes become
/// `/`, a leading `~/` is dropped and `~` alone means the home itself.
pub fn normalize_remote_path(input: &str) -> String {
    let normalized = input.trim().replace('\\', "/");
    if normalized == "~" {
        return String::new();
    }
    let stripped = normalized.strip_prefix("~/").unwrap_or(&normalized);
    stripped.trim_end_matches('/').to_string()
}

pub fn join_remote(base: &str, child: &str) -> String {
    let base = normalize_remote_path(base);
    let child = normalize_remote_path(child);
    if base.is_empty() {
        return child;
    }
    if child.is_empty() {
        return base;
    }
    format!("{}/{}", base, child.trim_start_matches('/'))
}

pub fn is_plain_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

pub fn path_display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::{is_plain_identifier, join_remote, normalize_remote_path, AgentSyncPaths};
    use std::path::PathBuf;

    #[test]
    fn normalize_remote_path_strips_home_prefix_and_backslashes() {
        assert_eq!(normalize_remote_path("~/AgentSync/projects/"), "AgentSync/projects");
        assert_eq!(normalize_remote_path("Agent\\Sync"), "Agent/Sync");
        assert_eq!(normalize_remote_path("~"), "");
    }

    #[test]
    fn join_remote_skips_empty_sides() {
        assert_eq!(join_remote("", ".codex"), ".codex");
        assert_eq!(join_remote("root/", "/child"), "root/child");
        assert_eq!(join_remote("root", ""), "root");
    }

    #[test]
    fn runtime_layout_is_rooted_in_one_directory() {
        let paths = AgentSyncPaths::from_runtime(PathBuf::from("/tmp/agentsync"));
        assert_eq!(paths.config_path, PathBuf::from("/tmp/agentsync/config.json"));
        assert_eq!(
            paths.log_path("abc"),
            PathBuf::from("/tmp/agentsync/logs/abc.log")
        );
    }

    #[test]
    fn plain_identifier_rejects_path_fragments() {
        assert!(is_plain_identifier("0f3a9c"));
        assert!(!is_plain_identifier("../config"));
        assert!(!is_plain_identifier(""));
    }
}
