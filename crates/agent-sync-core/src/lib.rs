pub mod config;
pub mod config_store;
pub mod connection;
pub mod engine;
pub mod error;
pub mod history_store;
pub mod keypair;
pub mod models;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod rclone;
pub mod remote_setup;
pub mod share_server;
pub mod transfer;

pub use config::{
    AgentSyncConfig, ConfigWarning, ConnectionConfig, FlagsConfig, ProjectItem, RemoteConfig,
    CONFIG_SCHEMA_VERSION,
};
pub use config_store::ConfigStore;
pub use connection::{ConnectionTester, DEFAULT_CONNECTION_TIMEOUT};
pub use engine::{SyncEngine, SyncEngineEnvironment};
pub use error::SyncEngineError;
pub use history_store::{RunHistoryStore, RunLogWriter};
pub use keypair::KeypairManager;
pub use models::{
    now_ms, ConnectionProbeOutcome, ConnectionTestResult, EnsureKeypairResult, RunPhase,
    ShareStartResult, SyncItemResult, SyncRunStatus, SyncRunSummary,
};
pub use orchestrator::{plan_work, SyncOrchestrator};
pub use paths::AgentSyncPaths;
pub use remote_setup::{render_setup_script, SetupScriptTarget};
pub use share_server::{ShareServer, DEFAULT_SHARE_PORT, DEFAULT_SHARE_TTL};
pub use transfer::{TransferExecutor, TransferItemKind, TransferJob};
