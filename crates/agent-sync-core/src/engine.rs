use crate::config::{AgentSyncConfig, ConfigWarning};
use crate::config_store::ConfigStore;
use crate::connection::ConnectionTester;
use crate::error::SyncEngineError;
use crate::history_store::RunHistoryStore;
use crate::keypair::KeypairManager;
use crate::models::{
    ConnectionTestResult, EnsureKeypairResult, ShareStartResult, SyncRunStatus, SyncRunSummary,
};
use crate::orchestrator::SyncOrchestrator;
use crate::paths::{home_dir, AgentSyncPaths};
use crate::remote_setup::{render_setup_script, SetupScriptTarget};
use crate::share_server::ShareServer;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SyncEngineEnvironment {
    /// Local home holding `.codex` and `.agents`.
    pub home_directory: PathBuf,
    pub runtime_directory: PathBuf,
}

impl SyncEngineEnvironment {
    pub fn current() -> Self {
        Self {
            home_directory: home_dir().unwrap_or_else(|| PathBuf::from("/")),
            runtime_directory: AgentSyncPaths::detect().runtime_directory,
        }
    }
}

/// Every operation the caller needs, wired to one runtime directory.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    environment: SyncEngineEnvironment,
    config_store: ConfigStore,
    keypairs: KeypairManager,
    tester: ConnectionTester,
    orchestrator: SyncOrchestrator,
    share: Arc<ShareServer>,
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::current()
    }
}

impl SyncEngine {
    pub fn current() -> Self {
        Self::new(SyncEngineEnvironment::current())
    }

    pub fn new(environment: SyncEngineEnvironment) -> Self {
        let paths = AgentSyncPaths::from_runtime(environment.runtime_directory.clone());
        Self {
            config_store: ConfigStore::new(paths.clone()),
            keypairs: KeypairManager::new(paths.keys_directory.clone()),
            tester: ConnectionTester::default(),
            orchestrator: SyncOrchestrator::new(
                RunHistoryStore::new(paths),
                environment.home_directory.clone(),
            ),
            share: Arc::new(ShareServer::default()),
            environment,
        }
    }

    pub fn with_keygen_program(mut self, program: impl Into<OsString>) -> Self {
        self.keypairs = self.keypairs.with_keygen_program(program);
        self
    }

    pub fn with_connection_tester(mut self, tester: ConnectionTester) -> Self {
        self.tester = tester;
        self
    }

    pub fn with_share_server(mut self, share: ShareServer) -> Self {
        self.share = Arc::new(share);
        self
    }

    pub fn environment(&self) -> &SyncEngineEnvironment {
        &self.environment
    }

    pub fn paths(&self) -> &AgentSyncPaths {
        self.config_store.paths()
    }

    pub fn load_config(&self) -> Result<AgentSyncConfig, SyncEngineError> {
        self.config_store.load_or_default()
    }

    pub fn save_config(&self, config: &AgentSyncConfig) -> Result<(), SyncEngineError> {
        self.config_store.save(config)
    }

    pub fn validate_config(
        &self,
        config: &AgentSyncConfig,
    ) -> Result<Vec<ConfigWarning>, SyncEngineError> {
        config.validate_for_run()
    }

    pub fn start(&self, config: &AgentSyncConfig) -> Result<String, SyncEngineError> {
        self.orchestrator.start(config)
    }

    pub fn status(&self) -> SyncRunStatus {
        self.orchestrator.status()
    }

    pub fn cancel(&self, run_id: &str) -> bool {
        self.orchestrator.cancel(run_id)
    }

    pub fn wait(&self) -> Option<SyncRunSummary> {
        self.orchestrator.wait()
    }

    pub fn test_connection(
        &self,
        config: &AgentSyncConfig,
    ) -> Result<ConnectionTestResult, SyncEngineError> {
        self.tester.test(config)
    }

    pub fn ensure_keypair(&self, force: bool) -> Result<EnsureKeypairResult, SyncEngineError> {
        self.keypairs.ensure(force)
    }

    pub fn read_public_key(&self, private_key_path: &Path) -> Result<String, SyncEngineError> {
        self.keypairs.read_public_key(private_key_path)
    }

    pub fn list_runs(&self) -> Vec<SyncRunSummary> {
        self.orchestrator.history().list()
    }

    pub fn read_run_log(&self, run_id: &str) -> Result<String, SyncEngineError> {
        self.orchestrator.history().read_log(run_id)
    }

    pub fn share_start(&self, content: &str) -> Result<ShareStartResult, SyncEngineError> {
        self.share.start(content)
    }

    /// Uses the public half of the configured key, falling back to the
    /// dedicated key pair when no key is configured.
    pub fn render_setup_script(
        &self,
        target: SetupScriptTarget,
        config: &AgentSyncConfig,
    ) -> Result<String, SyncEngineError> {
        let configured = config.connection.key_path.trim();
        let public_key = if configured.is_empty() {
            self.keypairs
                .read_public_key(&self.keypairs.private_key_path())?
        } else {
            self.keypairs.read_public_key(Path::new(configured))?
        };
        render_setup_script(
            target,
            &public_key,
            &config.remote.projects_root,
            &config.remote.backup_root,
        )
    }
}
