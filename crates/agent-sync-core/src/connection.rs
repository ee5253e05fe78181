use crate::config::AgentSyncConfig;
use crate::error::SyncEngineError;
use crate::models::{ConnectionProbeOutcome, ConnectionTestResult};
use crate::paths::normalize_remote_path;
use crate::process::{run_streaming, CancelToken, ProcessError, ProcessExit, ProcessLimits};
use crate::rclone::{classify_failure, RcloneSession};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(8);

/// Read-only probe: `lsjson --stat` on the remote home, then on the
/// projects root.
#[derive(Debug, Clone)]
pub struct ConnectionTester {
    timeout: Duration,
}

impl Default for ConnectionTester {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_TIMEOUT)
    }
}

impl ConnectionTester {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn test(&self, config: &AgentSyncConfig) -> Result<ConnectionTestResult, SyncEngineError> {
        config.validate_for_run()?;

        let session = match RcloneSession::prepare(config) {
            Ok(session) => session,
            Err(SyncEngineError::TransferToolUnavailable(message)) => {
                return Ok(result(ConnectionProbeOutcome::ToolUnavailable, message));
            }
            Err(error) => return Err(error),
        };

        let started = Instant::now();
        let target = format!(
            "{}@{}:{}",
            config.connection.user.trim(),
            config.connection.host.trim(),
            config.connection.port
        );

        let home = self.probe(&session, "", started)?;
        if home != ConnectionProbeOutcome::Connected {
            return Ok(result(home, describe(home, &target, "")));
        }

        let projects_root = normalize_remote_path(&config.remote.projects_root);
        let outcome = self.probe(&session, &projects_root, started)?;
        info!(target = %target, outcome = outcome.as_str(), "connection test finished");
        Ok(result(outcome, describe(outcome, &target, &projects_root)))
    }

    fn probe(
        &self,
        session: &RcloneSession,
        remote_path: &str,
        started: Instant,
    ) -> Result<ConnectionProbeOutcome, SyncEngineError> {
        let remaining = self.timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Ok(ConnectionProbeOutcome::TimedOut);
        }

        let seconds = remaining.as_secs().max(1);
        let args = vec![
            String::from("lsjson"),
            String::from("--stat"),
            session.remote(remote_path),
            String::from("--contimeout"),
            format!("{seconds}s"),
            String::from("--timeout"),
            format!("{seconds}s"),
            String::from("--retries"),
            String::from("1"),
            String::from("--low-level-retries"),
            String::from("1"),
        ];
        debug!(command = %session.render(&args), "probing remote");

        let limits = ProcessLimits {
            deadline: Some(remaining),
            grace: Duration::from_millis(500),
            poll: Duration::from_millis(50),
        };
        let mut command = session.command(&args);
        let outcome = run_streaming(&mut command, &CancelToken::new(), limits, &mut |_| {})
            .map_err(|error| match error {
                ProcessError::Spawn(e) => SyncEngineError::TransferToolUnavailable(format!(
                    "could not start {}: {e}",
                    session.binary().path.display()
                )),
                ProcessError::Supervise(e) => SyncEngineError::io(&session.binary().path, e),
            })?;

        Ok(match outcome.exit {
            ProcessExit::Exited { success: true, .. } => ConnectionProbeOutcome::Connected,
            ProcessExit::Exited { .. } => {
                // Unrecognized stderr is treated as the host not answering.
                classify_failure(&outcome.tail_text()).unwrap_or(ConnectionProbeOutcome::Unreachable)
            }
            ProcessExit::TimedOut | ProcessExit::Cancelled => ConnectionProbeOutcome::TimedOut,
        })
    }
}

fn result(outcome: ConnectionProbeOutcome, message: String) -> ConnectionTestResult {
    ConnectionTestResult {
        ok: outcome == ConnectionProbeOutcome::Connected,
        outcome,
        message,
    }
}

fn describe(outcome: ConnectionProbeOutcome, target: &str, projects_root: &str) -> String {
    match outcome {
        ConnectionProbeOutcome::Connected => {
            format!("Connected to {target}; {projects_root} is reachable")
        }
        ConnectionProbeOutcome::Unreachable => format!("Host unreachable: {target}"),
        ConnectionProbeOutcome::TimedOut => format!("Timed out connecting to {target}"),
        ConnectionProbeOutcome::CredentialsRejected => {
            format!("Credentials rejected by {target}; check the user and key")
        }
        ConnectionProbeOutcome::PathNotFound => {
            format!("Connected to {target}, but {projects_root} does not exist yet")
        }
        ConnectionProbeOutcome::ToolUnavailable => String::from("rclone is not available"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::ConnectionTester;
    use crate::config::AgentSyncConfig;
    use crate::models::ConnectionProbeOutcome;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn config_with_fake_rclone(temp: &TempDir, script: &str) -> AgentSyncConfig {
        let binary = temp.path().join("rclone");
        std::fs::write(&binary, format!("#!/bin/sh\n{script}\n")).expect("write fake rclone");
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");
        let key = temp.path().join("id_test");
        std::fs::write(&key, "private").expect("write key");

        let mut config = AgentSyncConfig::default();
        config.rclone_path = Some(binary.to_string_lossy().to_string());
        config.connection.host = String::from("mini.local");
        config.connection.user = String::from("dev");
        config.connection.key_path = key.to_string_lossy().to_string();
        config
    }

    #[test]
    fn reachable_remote_reports_connected() {
        let temp = TempDir::new().expect("tempdir");
        let config = config_with_fake_rclone(&temp, "echo '{}'\nexit 0");
        let result = ConnectionTester::default().test(&config).expect("test");
        assert!(result.ok);
        assert_eq!(result.outcome, ConnectionProbeOutcome::Connected);
    }

    #[test]
    fn rejected_key_is_distinguished_from_unreachable() {
        let temp = TempDir::new().expect("tempdir");
        let config = config_with_fake_rclone(
            &temp,
            "echo 'Failed to create file system: NewFs: couldn'\"'\"'t connect SSH: ssh: handshake failed: ssh: unable to authenticate' >&2\nexit 1",
        );
        let result = ConnectionTester::default().test(&config).expect("test");
        assert!(!result.ok);
        assert_eq!(result.outcome, ConnectionProbeOutcome::CredentialsRejected);
        assert!(result.message.contains("Credentials rejected"));
    }

    #[test]
    fn missing_projects_root_fails_after_home_succeeds() {
        let temp = TempDir::new().expect("tempdir");
        let config = config_with_fake_rclone(
            &temp,
            "case \"$*\" in\n  *agentsync:AgentSync*) echo 'error: directory not found' >&2; exit 3 ;;\nesac\nexit 0",
        );
        let result = ConnectionTester::default().test(&config).expect("test");
        assert!(!result.ok);
        assert_eq!(result.outcome, ConnectionProbeOutcome::PathNotFound);
    }

    #[test]
    fn hanging_probe_is_bounded_by_timeout() {
        let temp = TempDir::new().expect("tempdir");
        let config = config_with_fake_rclone(&temp, "exec sleep 30");
        let started = Instant::now();
        let result = ConnectionTester::new(Duration::from_millis(600))
            .test(&config)
            .expect("test");
        assert_eq!(result.outcome, ConnectionProbeOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_tool_is_an_outcome_not_an_error() {
        let temp = TempDir::new().expect("tempdir");
        let mut config = config_with_fake_rclone(&temp, "exit 0");
        config.rclone_path = Some(String::from("/definitely/not/rclone"));
        let result = ConnectionTester::default().test(&config).expect("test");
        assert_eq!(result.outcome, ConnectionProbeOutcome::ToolUnavailable);
    }
}
