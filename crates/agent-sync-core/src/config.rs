use crate::error::SyncEngineError;
use crate::paths::normalize_remote_path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSyncConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub rclone_path: Option<String>,
    pub connection: ConnectionConfig,
    pub remote: RemoteConfig,
    pub flags: FlagsConfig,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub projects: Vec<ProjectItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub projects_root: String,
    pub backup_root: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagsConfig {
    pub mirror_delete: bool,
    pub sync_codex: bool,
    pub sync_agents: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectItem {
    pub id: String,
    pub name: String,
    pub local_path: String,
    pub remote_dir_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ConfigWarning {
    /// Several enabled projects write into the same remote directory.
    DuplicateRemoteDirName {
        remote_dir_name: String,
        project_ids: Vec<String>,
    },
    /// One project's remote directory lies inside another's, so the outer
    /// mirror also sweeps the inner project's files.
    NestedRemoteDirName {
        outer_remote_dir_name: String,
        inner_remote_dir_name: String,
        project_ids: Vec<String>,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateRemoteDirName {
                remote_dir_name,
                project_ids,
            } => write!(
                f,
                "remote directory '{remote_dir_name}' is shared by projects {}",
                project_ids.join(", ")
            ),
            Self::NestedRemoteDirName {
                outer_remote_dir_name,
                inner_remote_dir_name,
                project_ids,
            } => write!(
                f,
                "remote directory '{inner_remote_dir_name}' lies inside '{outer_remote_dir_name}' (projects {})",
                project_ids.join(", ")
            ),
        }
    }
}

impl Default for AgentSyncConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            rclone_path: None,
            connection: ConnectionConfig {
                host: String::new(),
                port: 22,
                user: String::new(),
                key_path: String::new(),
            },
            remote: RemoteConfig {
                projects_root: String::from("AgentSync/projects"),
                backup_root: String::from("AgentSync/.agentsync-backup"),
            },
            flags: FlagsConfig {
                mirror_delete: true,
                sync_codex: true,
                sync_agents: true,
            },
            excludes: [
                "node_modules/**",
                "dist/**",
                "build/**",
                ".venv/**",
                ".git/**",
                ".DS_Store",
            ]
            .iter()
            .map(|pattern| pattern.to_string())
            .collect(),
            projects: Vec::new(),
        }
    }
}

impl AgentSyncConfig {
    pub fn enabled_projects(&self) -> impl Iterator<Item = &ProjectItem> {
        self.projects.iter().filter(|project| project.enabled)
    }

    /// Exclude patterns with blank entries dropped.
    pub fn effective_excludes(&self) -> Vec<String> {
        self.excludes
            .iter()
            .map(|pattern| pattern.trim())
            .filter(|pattern| !pattern.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn rclone_override(&self) -> Option<&str> {
        self.rclone_path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn validate_schema(&self) -> Result<(), SyncEngineError> {
        if self.schema_version != CONFIG_SCHEMA_VERSION {
            return Err(SyncEngineError::invalid_config(format!(
                "schemaVersion {} does not match expected {}",
                self.schema_version, CONFIG_SCHEMA_VERSION
            )));
        }
        Ok(())
    }

    /// Full check required before a run or a connection test. Returns the
    /// non-fatal warnings when the config is usable.
    pub fn validate_for_run(&self) -> Result<Vec<ConfigWarning>, SyncEngineError> {
        let mut issues = Vec::new();

        if self.schema_version != CONFIG_SCHEMA_VERSION {
            issues.push(format!(
                "schemaVersion {} does not match expected {}",
                self.schema_version, CONFIG_SCHEMA_VERSION
            ));
        }
        if self.connection.host.trim().is_empty() {
            issues.push(String::from("connection.host must not be empty"));
        }
        if self.connection.port == 0 {
            issues.push(String::from("connection.port must be within 1-65535"));
        }
        if self.connection.user.trim().is_empty() {
            issues.push(String::from("connection.user must not be empty"));
        }
        let key_path = self.connection.key_path.trim();
        if key_path.is_empty() {
            issues.push(String::from("connection.keyPath must not be empty"));
        } else if !Path::new(key_path).is_file() {
            issues.push(format!("private key file does not exist: {key_path}"));
        }

        if let Some(issue) = remote_path_issue("remote.projectsRoot", &self.remote.projects_root) {
            issues.push(issue);
        }
        if let Some(issue) = remote_path_issue("remote.backupRoot", &self.remote.backup_root) {
            issues.push(issue);
        } else if roots_overlap(&self.remote.projects_root, &self.remote.backup_root) {
            // rclone refuses a --backup-dir that overlaps the destination.
            issues.push(String::from(
                "remote.backupRoot and remote.projectsRoot must not contain each other",
            ));
        }

        for project in self.enabled_projects() {
            if project.local_path.trim().is_empty() {
                issues.push(format!("project '{}' has an empty localPath", project.name));
            }
            let label = format!("project '{}' remoteDirName", project.name);
            if let Some(issue) = remote_path_issue(&label, &project.remote_dir_name) {
                issues.push(issue);
            }
        }

        if !issues.is_empty() {
            return Err(SyncEngineError::InvalidConfig(issues));
        }

        Ok(self.warnings())
    }

    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut by_remote: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for project in self.enabled_projects() {
            by_remote
                .entry(normalize_remote_path(&project.remote_dir_name))
                .or_default()
                .push(project.id.clone());
        }

        let mut warnings: Vec<ConfigWarning> = by_remote
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(remote_dir_name, project_ids)| ConfigWarning::DuplicateRemoteDirName {
                remote_dir_name: remote_dir_name.clone(),
                project_ids: project_ids.clone(),
            })
            .collect();

        for (outer, outer_ids) in &by_remote {
            for (inner, inner_ids) in &by_remote {
                if outer.is_empty() || !inner.starts_with(&format!("{outer}/")) {
                    continue;
                }
                warnings.push(ConfigWarning::NestedRemoteDirName {
                    outer_remote_dir_name: outer.clone(),
                    inner_remote_dir_name: inner.clone(),
                    project_ids: outer_ids.iter().chain(inner_ids).cloned().collect(),
                });
            }
        }

        warnings
    }
}

fn roots_overlap(lhs: &str, rhs: &str) -> bool {
    let lhs = normalize_remote_path(lhs);
    let rhs = normalize_remote_path(rhs);
    if lhs.is_empty() || rhs.is_empty() {
        return false;
    }
    let nested = |outer: &str, inner: &str| {
        inner == outer || inner.starts_with(&format!("{outer}/"))
    };
    nested(&lhs, &rhs) || nested(&rhs, &lhs)
}

fn remote_path_issue(label: &str, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || normalize_remote_path(trimmed).is_empty() {
        return Some(format!("{label} must not be empty"));
    }
    let normalized = trimmed.replace('\\', "/");
    let is_absolute = normalized.starts_with('/')
        || normalized
            .chars()
            .nth(1)
            .map(|second| second == ':')
            .unwrap_or(false);
    if is_absolute {
        return Some(format!(
            "{label} must be relative to the remote home: {trimmed}"
        ));
    }
    if normalized.split('/').any(|segment| segment == "..") {
        return Some(format!("{label} must not contain '..': {trimmed}"));
    }
    if normalized.split('/').any(|segment| segment == ".") {
        return Some(format!("{label} must not contain '.' segments: {trimmed}"));
    }
    None
}
