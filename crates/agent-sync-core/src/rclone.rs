use crate::config::AgentSyncConfig;
use crate::error::SyncEngineError;
use crate::models::ConnectionProbeOutcome;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;

pub const REMOTE_NAME: &str = "agentsync";
const RCLONE_BINARY_NAME: &str = "rclone";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcloneBinarySource {
    Config,
    Environment,
    SystemPath,
}

#[derive(Debug, Clone)]
pub struct RcloneBinary {
    pub path: PathBuf,
    pub source: RcloneBinarySource,
}

/// Config override first, then `AGENT_SYNC_RCLONE_BIN`, then `PATH`.
pub fn resolve_binary(config: &AgentSyncConfig) -> Result<RcloneBinary, SyncEngineError> {
    if let Some(raw) = config.rclone_override() {
        let path = PathBuf::from(raw);
        if !path.is_file() {
            return Err(SyncEngineError::TransferToolUnavailable(format!(
                "configured rclone path does not exist: {raw}"
            )));
        }
        return Ok(RcloneBinary {
            path,
            source: RcloneBinarySource::Config,
        });
    }

    if let Some(path) = env::var("AGENT_SYNC_RCLONE_BIN")
        .ok()
        .map(|raw| raw.trim().to_owned())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
    {
        if path.is_file() {
            return Ok(RcloneBinary {
                path,
                source: RcloneBinarySource::Environment,
            });
        }
    }

    find_in_path()
        .map(|path| RcloneBinary {
            path,
            source: RcloneBinarySource::SystemPath,
        })
        .ok_or_else(|| {
            SyncEngineError::TransferToolUnavailable(String::from(
                "rclone not found: install it and add it to PATH, or set rclonePath",
            ))
        })
}

fn find_in_path() -> Option<PathBuf> {
    let path_env = env::var_os("PATH")?;
    let binary_name = rclone_binary_name();
    env::split_paths(&path_env)
        .map(|entry| entry.join(binary_name))
        .find(|candidate| candidate.is_file())
}

fn rclone_binary_name() -> &'static str {
    if env::consts::OS == "windows" {
        "rclone.exe"
    } else {
        RCLONE_BINARY_NAME
    }
}

/// A resolved binary plus a throwaway SFTP remote definition. The config
/// file is deleted when the session is dropped.
#[derive(Debug)]
pub struct RcloneSession {
    binary: RcloneBinary,
    config_file: NamedTempFile,
}

impl RcloneSession {
    pub fn prepare(config: &AgentSyncConfig) -> Result<Self, SyncEngineError> {
        let binary = resolve_binary(config)?;

        let mut config_file = tempfile::Builder::new()
            .prefix("agentsync-rclone-")
            .suffix(".conf")
            .tempfile()
            .map_err(|e| SyncEngineError::io(env::temp_dir(), e))?;
        let body = remote_definition(config);
        config_file
            .as_file_mut()
            .write_all(body.as_bytes())
            .map_err(|e| SyncEngineError::io(config_file.path(), e))?;

        Ok(Self {
            binary,
            config_file,
        })
    }

    pub fn binary(&self) -> &RcloneBinary {
        &self.binary
    }

    pub fn config_path(&self) -> &Path {
        self.config_file.path()
    }

    pub fn remote(&self, path: &str) -> String {
        format!("{REMOTE_NAME}:{path}")
    }

    /// Arguments shared by every invocation, ahead of the subcommand.
    pub fn common_args(&self) -> Vec<String> {
        vec![
            String::from("--config"),
            self.config_path().to_string_lossy().to_string(),
            String::from("--log-level"),
            String::from("INFO"),
        ]
    }

    pub fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.binary.path);
        command.args(self.common_args());
        command.args(args);
        command.env("RCLONE_ASK_PASSWORD", "false");
        command
    }

    pub fn render(&self, args: &[String]) -> String {
        let mut parts = vec![String::from("rclone")];
        parts.extend(self.common_args());
        parts.extend(args.iter().cloned());
        parts.join(" ")
    }
}

fn remote_definition(config: &AgentSyncConfig) -> String {
    format!(
        "[{REMOTE_NAME}]\ntype = sftp\nhost = {host}\nuser = {user}\nport = {port}\nkey_file = {key_file}\n",
        host = config.connection.host.trim(),
        user = config.connection.user.trim(),
        port = config.connection.port,
        key_file = config.connection.key_path.trim().replace('\\', "/"),
    )
}

/// Maps rclone/ssh error text to the failure classes callers care about.
pub fn classify_failure(output: &str) -> Option<ConnectionProbeOutcome> {
    let text = output.to_ascii_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if contains_any(&[
        "unable to authenticate",
        "no supported methods remain",
        "permission denied (publickey",
        "authentication failed",
        "failed to parse private key",
        "couldn't read ssh key",
        "ssh: no key found",
    ]) {
        return Some(ConnectionProbeOutcome::CredentialsRejected);
    }

    if contains_any(&[
        "i/o timeout",
        "connection timed out",
        "operation timed out",
        "context deadline exceeded",
    ]) {
        return Some(ConnectionProbeOutcome::TimedOut);
    }

    if contains_any(&[
        "connection refused",
        "no route to host",
        "no such host",
        "network is unreachable",
        "host is down",
        "couldn't connect ssh",
    ]) {
        return Some(ConnectionProbeOutcome::Unreachable);
    }

    if contains_any(&[
        "directory not found",
        "object not found",
        "file does not exist",
        "no such file or directory",
    ]) {
        return Some(ConnectionProbeOutcome::PathNotFound);
    }

    None
}

/// Extracts `NN` from a one-line stats entry such as
/// `1.2 MiB / 10 MiB, 12%, 300 KiB/s, ETA 30s`.
pub fn parse_progress_percent(line: &str) -> Option<u8> {
    line.split(',')
        .map(str::trim)
        .filter_map(|segment| segment.strip_suffix('%'))
        .filter(|digits| !digits.is_empty() && digits.len() <= 3)
        .filter_map(|digits| digits.parse::<u16>().ok())
        .find(|value| *value <= 100)
        .map(|value| value as u8)
}

#[cfg(test)]
mod tests {
    use super::{classify_failure, parse_progress_percent, remote_definition, RcloneSession};
    use crate::config::AgentSyncConfig;
    use crate::models::ConnectionProbeOutcome;

    #[test]
    fn classify_failure_separates_auth_from_reachability() {
        assert_eq!(
            classify_failure("couldn't connect SSH: ssh: handshake failed: ssh: unable to authenticate, attempted methods [none publickey]"),
            Some(ConnectionProbeOutcome::CredentialsRejected)
        );
        assert_eq!(
            classify_failure("NewFs: couldn't connect SSH: dial tcp 10.0.0.9:22: i/o timeout"),
            Some(ConnectionProbeOutcome::TimedOut)
        );
        assert_eq!(
            classify_failure("couldn't connect SSH: dial tcp 127.0.0.1:2222: connect: connection refused"),
            Some(ConnectionProbeOutcome::Unreachable)
        );
        assert_eq!(
            classify_failure("error listing: directory not found"),
            Some(ConnectionProbeOutcome::PathNotFound)
        );
        assert_eq!(classify_failure("Transferred: 0 B / 0 B"), None);
    }

    #[test]
    fn progress_percent_is_best_effort() {
        assert_eq!(
            parse_progress_percent("1.2 MiB / 10 MiB, 12%, 300 KiB/s, ETA 30s"),
            Some(12)
        );
        assert_eq!(parse_progress_percent("0 B / 0 B, -, 0 B/s, ETA -"), None);
        assert_eq!(parse_progress_percent("INFO  : notes.md: Copied (new)"), None);
    }

    #[test]
    fn remote_definition_uses_sftp_with_key_file() {
        let mut config = AgentSyncConfig::default();
        config.connection.host = String::from(" mini.local ");
        config.connection.user = String::from("dev");
        config.connection.port = 2222;
        config.connection.key_path = String::from("C:\\keys\\id");
        let body = remote_definition(&config);
        assert!(body.starts_with("[agentsync]\ntype = sftp\n"));
        assert!(body.contains("host = mini.local\n"));
        assert!(body.contains("port = 2222\n"));
        assert!(body.contains("key_file = C:/keys/id\n"));
    }

    #[test]
    fn missing_configured_binary_is_reported() {
        let mut config = AgentSyncConfig::default();
        config.rclone_path = Some(String::from("/definitely/not/rclone"));
        let error = RcloneSession::prepare(&config).expect_err("missing binary");
        assert!(error.to_string().contains("Transfer tool unavailable"));
    }
}
