use agent_sync_core::{
    now_ms, AgentSyncConfig, ProjectItem, SetupScriptTarget, ShareStartResult, SyncEngine,
    SyncRunSummary,
};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "agent-sync")]
#[command(about = "Mirror local projects, Codex and agent files to a remote machine over SFTP")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    Sync {
        /// Cancel the run once it has been going for this long.
        #[arg(long = "max-duration-secs")]
        max_duration_secs: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    Test,
    Keypair {
        #[command(subcommand)]
        command: KeypairCommands,
    },
    Runs {
        #[command(subcommand)]
        command: RunsCommands,
    },
    SetupScript {
        #[arg(long, default_value = "posix")]
        target: String,
        /// Publish the script on the LAN instead of printing it.
        #[arg(long)]
        share: bool,
    },
    Share {
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    Show,
    Init {
        #[arg(long)]
        force: bool,
    },
    Validate,
    SetConnection {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long = "key-path")]
        key_path: Option<String>,
    },
    AddProject {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "remote-dir")]
        remote_dir: Option<String>,
        #[arg(long)]
        disabled: bool,
    },
}

#[derive(Subcommand, Debug)]
enum KeypairCommands {
    Ensure {
        #[arg(long)]
        force: bool,
    },
    Public {
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum RunsCommands {
    List {
        #[arg(long)]
        json: bool,
    },
    Log {
        run_id: String,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let engine = SyncEngine::current();

    match cli.command {
        Commands::Config { command } => run_config(&engine, command)?,
        Commands::Sync {
            max_duration_secs,
            json,
        } => {
            let config = engine.load_config()?;
            let summary = run_sync(&engine, &config, max_duration_secs.map(Duration::from_secs))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if !summary.ok {
                bail!("sync run {} did not complete cleanly", summary.run_id);
            }
        }
        Commands::Test => {
            let config = engine.load_config()?;
            let result = engine
                .test_connection(&config)
                .context("connection test could not run")?;
            println!("{}\t{}", result.outcome.as_str(), result.message);
            if !result.ok {
                bail!("connection test failed");
            }
        }
        Commands::Keypair { command } => match command {
            KeypairCommands::Ensure { force } => {
                let keypair = engine.ensure_keypair(force)?;
                println!("private_key={}", keypair.private_key_path);
                println!("{}", keypair.public_key);
            }
            KeypairCommands::Public { path } => {
                println!("{}", engine.read_public_key(&path)?);
            }
        },
        Commands::Runs { command } => match command {
            RunsCommands::List { json } => {
                let runs = engine.list_runs();
                if json {
                    println!("{}", serde_json::to_string_pretty(&runs)?);
                } else {
                    for run in runs {
                        let failed = run.items.iter().filter(|item| !item.ok).count();
                        println!(
                            "{}\t{}\t{}\titems={}\tfailed={}\t{}",
                            run.run_id,
                            run.started_at_ms,
                            run_result(&run),
                            run.items.len(),
                            failed,
                            run.backup_root
                        );
                    }
                }
            }
            RunsCommands::Log { run_id } => {
                print!("{}", engine.read_run_log(&run_id)?);
            }
        },
        Commands::SetupScript { target, share } => {
            let target = target
                .parse::<SetupScriptTarget>()
                .map_err(anyhow::Error::msg)?;
            let config = engine.load_config()?;
            let script = engine.render_setup_script(target, &config)?;
            if share {
                let session = engine.share_start(&script)?;
                serve_until_expired(&session);
            } else {
                print!("{script}");
            }
        }
        Commands::Share { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let session = engine.share_start(&content)?;
            serve_until_expired(&session);
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_config(engine: &SyncEngine, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = engine.load_config()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigCommands::Init { force } => {
            let path = &engine.paths().config_path;
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            engine.save_config(&AgentSyncConfig::default())?;
            println!("wrote {}", path.display());
        }
        ConfigCommands::Validate => {
            let config = engine.load_config()?;
            let warnings = engine.validate_config(&config)?;
            for warning in &warnings {
                println!("warning: {warning}");
            }
            println!("config ok ({} warnings)", warnings.len());
        }
        ConfigCommands::SetConnection {
            host,
            port,
            user,
            key_path,
        } => {
            let mut config = engine.load_config()?;
            if let Some(host) = host {
                config.connection.host = host;
            }
            if let Some(port) = port {
                config.connection.port = port;
            }
            if let Some(user) = user {
                config.connection.user = user;
            }
            if let Some(key_path) = key_path {
                config.connection.key_path = key_path;
            }
            engine.save_config(&config)?;
            println!(
                "connection={}@{}:{} key={}",
                config.connection.user,
                config.connection.host,
                config.connection.port,
                config.connection.key_path
            );
        }
        ConfigCommands::AddProject {
            path,
            name,
            remote_dir,
            disabled,
        } => {
            let mut config = engine.load_config()?;
            let absolute = std::fs::canonicalize(&path)
                .with_context(|| format!("project path not found: {}", path.display()))?;
            let file_name = absolute
                .file_name()
                .map(|value| value.to_string_lossy().to_string())
                .ok_or_else(|| anyhow!("cannot derive a name from {}", absolute.display()))?;

            let remote_dir_name = remote_dir.unwrap_or_else(|| sanitize_dir_name(&file_name));
            let project = ProjectItem {
                id: unique_project_id(&config, &remote_dir_name),
                name: name.unwrap_or(file_name),
                local_path: absolute.to_string_lossy().to_string(),
                remote_dir_name,
                enabled: !disabled,
            };
            println!(
                "added {}\t{}\t{}",
                project.id, project.local_path, project.remote_dir_name
            );
            config.projects.push(project);
            for warning in config.warnings() {
                println!("warning: {warning}");
            }
            engine.save_config(&config)?;
        }
    }
    Ok(())
}

fn run_sync(
    engine: &SyncEngine,
    config: &AgentSyncConfig,
    max_duration: Option<Duration>,
) -> Result<SyncRunSummary> {
    let run_id = engine.start(config).context("sync run was not started")?;
    eprintln!("run {run_id} started");

    let started = Instant::now();
    let mut cancel_requested = false;
    let mut last_seen: Option<(u32, Option<String>)> = None;

    loop {
        let status = engine.status();
        if !status.running {
            break;
        }

        let current = (status.done_items, status.last_line.clone());
        if last_seen.as_ref() != Some(&current) {
            if let (Some(label), Some(line)) = (&status.current_label, &status.last_line) {
                eprintln!(
                    "[{}/{}] {}: {}",
                    status.done_items, status.total_items, label, line
                );
            }
            last_seen = Some(current);
        }

        if let Some(limit) = max_duration {
            if !cancel_requested && started.elapsed() >= limit {
                debug!(run_id = %run_id, "max duration reached");
                eprintln!("max duration reached, cancelling {run_id}");
                cancel_requested = engine.cancel(&run_id);
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }

    engine
        .wait()
        .ok_or_else(|| anyhow!("run {run_id} finished without a summary"))
}

fn print_summary(summary: &SyncRunSummary) {
    println!("run={} result={}", summary.run_id, run_result(summary));
    for item in &summary.items {
        println!(
            "{}\t{}\t{}",
            if item.ok { "ok" } else { "FAIL" },
            item.label,
            item.message
        );
    }
    println!("backup={}", summary.backup_root);
    println!("log={}", summary.log_path);
}

fn run_result(summary: &SyncRunSummary) -> &'static str {
    if summary.cancelled {
        "cancelled"
    } else if summary.ok {
        "ok"
    } else {
        "failed"
    }
}

fn serve_until_expired(session: &ShareStartResult) {
    println!("local: {}", session.local_url);
    println!("local raw: {}", session.local_raw_url);
    if let (Some(lan), Some(lan_raw)) = (&session.lan_url, &session.lan_raw_url) {
        println!("lan: {lan}");
        println!("lan raw: {lan_raw}");
    }
    eprintln!("serving until the link expires; press Ctrl-C to stop");

    std::thread::sleep(remaining_until(session.expires_at_ms, now_ms()));
}

fn remaining_until(expires_at_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(expires_at_ms.saturating_sub(now_ms))
}

fn sanitize_dir_name(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        String::from("project")
    } else {
        cleaned
    }
}

fn unique_project_id(config: &AgentSyncConfig, base: &str) -> String {
    let taken = |candidate: &str| config.projects.iter().any(|project| project.id == candidate);
    if !taken(base) {
        return base.to_string();
    }
    (2..)
        .map(|index| format!("{base}-{index}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
