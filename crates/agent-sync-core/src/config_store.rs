use crate::config::AgentSyncConfig;
use crate::error::SyncEngineError;
use crate::paths::AgentSyncPaths;

#[derive(Debug, Clone)]
pub struct ConfigStore {
    paths: AgentSyncPaths,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self {
            paths: AgentSyncPaths::detect(),
        }
    }
}

impl ConfigStore {
    pub fn new(paths: AgentSyncPaths) -> Self {
        Self { paths }
    }

    /// Missing file yields the default config; a file that exists but cannot
    /// be parsed is an error so a broken config is never silently replaced.
    pub fn load_or_default(&self) -> Result<AgentSyncConfig, SyncEngineError> {
        let path = &self.paths.config_path;
        if !path.exists() {
            return Ok(AgentSyncConfig::default());
        }

        let data = std::fs::read(path).map_err(|e| SyncEngineError::io(path, e))?;
        let config: AgentSyncConfig = serde_json::from_slice(&data)?;
        config.validate_schema()?;
        Ok(config)
    }

    pub fn save(&self, config: &AgentSyncConfig) -> Result<(), SyncEngineError> {
        config.validate_schema()?;
        self.paths
            .ensure_runtime_dir()
            .map_err(|e| SyncEngineError::io(&self.paths.runtime_directory, e))?;

        let mut payload = serde_json::to_vec_pretty(config)?;
        payload.push(b'\n');

        let staging = self.paths.config_path.with_extension("json.tmp");
        std::fs::write(&staging, payload).map_err(|e| SyncEngineError::io(&staging, e))?;
        std::fs::rename(&staging, &self.paths.config_path)
            .map_err(|e| SyncEngineError::io(&self.paths.config_path, e))
    }

    pub fn paths(&self) -> &AgentSyncPaths {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigStore;
    use crate::config::{AgentSyncConfig, ProjectItem};
    use crate::paths::AgentSyncPaths;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::new(AgentSyncPaths::from_runtime(dir.path().join("rt")));
        let config = store.load_or_default().expect("load");
        assert_eq!(config, AgentSyncConfig::default());
    }

    #[test]
    fn save_then_load_preserves_projects() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::new(AgentSyncPaths::from_runtime(dir.path().join("rt")));
        let mut config = AgentSyncConfig::default();
        config.connection.host = String::from("mini.local");
        config.projects.push(ProjectItem {
            id: String::from("p1"),
            name: String::from("Notes"),
            local_path: String::from("/Users/me/notes"),
            remote_dir_name: String::from("notes"),
            enabled: true,
        });

        store.save(&config).expect("save");
        let raw = std::fs::read_to_string(&store.paths().config_path).expect("read");
        assert!(raw.contains("\"remoteDirName\": \"notes\""));
        assert!(raw.ends_with('\n'));
        assert_eq!(store.load_or_default().expect("load"), config);
    }

    #[test]
    fn save_rejects_foreign_schema_version() {
        let dir = tempdir().expect("tempdir");
        let store = ConfigStore::new(AgentSyncPaths::from_runtime(dir.path().join("rt")));
        let mut config = AgentSyncConfig::default();
        config.schema_version = 7;
        assert!(store.save(&config).is_err());
        assert!(!store.paths().config_path.exists());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().expect("tempdir");
        let paths = AgentSyncPaths::from_runtime(dir.path().to_path_buf());
        std::fs::write(&paths.config_path, "{not json").expect("write");
        let store = ConfigStore::new(paths);
        assert!(store.load_or_default().is_err());
    }
}
