use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncItemResult {
    pub label: String,
    pub ok: bool,
    pub message: String,
}

impl SyncItemResult {
    pub fn ok(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            message: message.into(),
        }
    }

    pub fn failed(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunSummary {
    pub run_id: String,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    pub ok: bool,
    #[serde(default)]
    pub cancelled: bool,
    pub backup_root: String,
    pub log_path: String,
    pub items: Vec<SyncItemResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunStatus {
    pub phase: RunPhase,
    pub running: bool,
    pub run_id: Option<String>,
    pub started_at_ms: Option<u64>,
    pub ended_at_ms: Option<u64>,
    pub ok: Option<bool>,
    pub total_items: u32,
    pub done_items: u32,
    pub current_label: Option<String>,
    pub last_line: Option<String>,
    /// Parsed from the transfer tool's stats line; display hint only.
    pub progress_percent: Option<u8>,
    pub error: Option<String>,
    pub items: Vec<SyncItemResult>,
    pub summary: Option<SyncRunSummary>,
}

impl SyncRunStatus {
    pub fn idle() -> Self {
        Self {
            phase: RunPhase::Idle,
            running: false,
            run_id: None,
            started_at_ms: None,
            ended_at_ms: None,
            ok: None,
            total_items: 0,
            done_items: 0,
            current_label: None,
            last_line: None,
            progress_percent: None,
            error: None,
            items: Vec::new(),
            summary: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionProbeOutcome {
    Connected,
    Unreachable,
    TimedOut,
    CredentialsRejected,
    PathNotFound,
    ToolUnavailable,
}

impl ConnectionProbeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Unreachable => "unreachable",
            Self::TimedOut => "timed_out",
            Self::CredentialsRejected => "credentials_rejected",
            Self::PathNotFound => "path_not_found",
            Self::ToolUnavailable => "tool_unavailable",
        }
    }

    /// Failures that make every later transfer in the same run pointless.
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            Self::Unreachable | Self::TimedOut | Self::CredentialsRejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub ok: bool,
    pub outcome: ConnectionProbeOutcome,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureKeypairResult {
    pub private_key_path: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareStartResult {
    pub local_url: String,
    pub lan_url: Option<String>,
    pub local_raw_url: String,
    pub lan_raw_url: Option<String>,
    pub expires_at_ms: u64,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
