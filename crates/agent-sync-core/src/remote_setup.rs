use crate::error::SyncEngineError;
use crate::paths::normalize_remote_path;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupScriptTarget {
    Posix,
    Windows,
}

impl SetupScriptTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Posix => "posix",
            Self::Windows => "windows",
        }
    }
}

impl FromStr for SetupScriptTarget {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "posix" | "mac" | "macos" | "linux" | "mac_linux" => Ok(Self::Posix),
            "windows" | "win" | "powershell" => Ok(Self::Windows),
            other => Err(format!("unknown setup script target: {other}")),
        }
    }
}

/// One-shot script for the target machine: authorizes `public_key` for the
/// current user and creates both remote roots.
pub fn render_setup_script(
    target: SetupScriptTarget,
    public_key: &str,
    projects_root: &str,
    backup_root: &str,
) -> Result<String, SyncEngineError> {
    let public_key = public_key.trim();
    let projects_root = normalize_remote_path(projects_root);
    let backup_root = normalize_remote_path(backup_root);

    let mut issues = Vec::new();
    if public_key.is_empty() {
        issues.push(String::from("public key must not be empty"));
    }
    if public_key.contains('\n') || public_key.contains('\r') {
        issues.push(String::from("public key must be a single line"));
    }
    if projects_root.is_empty() {
        issues.push(String::from("remote.projectsRoot must not be empty"));
    }
    if backup_root.is_empty() {
        issues.push(String::from("remote.backupRoot must not be empty"));
    }
    if !issues.is_empty() {
        return Err(SyncEngineError::InvalidConfig(issues));
    }

    let projects_root = projects_root.trim_start_matches('/');
    let backup_root = backup_root.trim_start_matches('/');

    Ok(match target {
        SetupScriptTarget::Posix => posix_script(public_key, projects_root, backup_root),
        SetupScriptTarget::Windows => powershell_script(public_key, projects_root, backup_root),
    })
}

fn posix_script(public_key: &str, projects_root: &str, backup_root: &str) -> String {
    let lines = [
        String::from("set -e"),
        format!("KEY={}", sh_quote(public_key)),
        String::from("SSH_DIR=\"$HOME/.ssh\""),
        String::from("AK=\"$SSH_DIR/authorized_keys\""),
        String::from("mkdir -p \"$SSH_DIR\""),
        String::from("touch \"$AK\""),
        String::from("chmod 700 \"$SSH_DIR\""),
        String::from("chmod 600 \"$AK\""),
        String::from("grep -qxF \"$KEY\" \"$AK\" || echo \"$KEY\" >> \"$AK\""),
        format!(
            "mkdir -p \"$HOME\"/{} \"$HOME\"/{}",
            sh_quote(projects_root),
            sh_quote(backup_root)
        ),
        String::from("echo 'AgentSync SSH setup done'"),
    ];
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

fn powershell_script(public_key: &str, projects_root: &str, backup_root: &str) -> String {
    let lines = [
        String::from("$ErrorActionPreference = 'Stop'"),
        String::from("$sshDir = Join-Path $env:USERPROFILE '.ssh'"),
        String::from("New-Item -ItemType Directory -Force -Path $sshDir | Out-Null"),
        String::from("$ak = Join-Path $sshDir 'authorized_keys'"),
        String::from("if (!(Test-Path $ak)) { Set-Content -Path $ak -Value '' -Encoding ascii }"),
        format!("$key = {}", ps_quote(public_key)),
        String::from("$exists = Select-String -Path $ak -SimpleMatch -Quiet -Pattern $key"),
        String::from("if (-not $exists) { Add-Content -Path $ak -Value $key -Encoding ascii }"),
        format!(
            "New-Item -ItemType Directory -Force -Path (Join-Path $env:USERPROFILE {}) | Out-Null",
            ps_quote(&projects_root.replace('/', "\\"))
        ),
        format!(
            "New-Item -ItemType Directory -Force -Path (Join-Path $env:USERPROFILE {}) | Out-Null",
            ps_quote(&backup_root.replace('/', "\\"))
        ),
        String::from("Write-Host 'AgentSync SSH setup done'"),
    ];
    let mut script = lines.join("\r\n");
    script.push_str("\r\n");
    script
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
