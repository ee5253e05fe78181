//! Supervised child processes: line streaming over a channel, cooperative
//! cancellation and an optional wall-clock deadline.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const TAIL_LINES: usize = 20;
const DRAIN_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub deadline: Option<Duration>,
    pub grace: Duration,
    pub poll: Duration,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            deadline: None,
            grace: Duration::from_secs(5),
            poll: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    Exited { code: Option<i32>, success: bool },
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit: ProcessExit,
    /// Last non-empty output lines, oldest first.
    pub tail: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("could not start: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("lost track of the running process: {0}")]
    Supervise(#[source] std::io::Error),
}

impl ProcessOutcome {
    pub fn tail_text(&self) -> String {
        self.tail.join("\n")
    }
}

/// Runs `command` to completion, forwarding every output line to `on_line`
/// as it arrives. Returns only after the child has exited.
pub fn run_streaming(
    command: &mut Command,
    cancel: &CancelToken,
    limits: ProcessLimits,
    on_line: &mut dyn FnMut(&OutputLine),
) -> Result<ProcessOutcome, ProcessError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(ProcessError::Spawn)?;

    let (tx, rx) = mpsc::channel::<OutputLine>();
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, OutputStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, OutputStream::Stderr, tx.clone());
    }
    drop(tx);

    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    let (status, forced) = match supervise(&mut child, &rx, cancel, limits, &mut tail, on_line) {
        Ok(finished) => finished,
        Err(error) => {
            reap(&mut child);
            return Err(ProcessError::Supervise(error));
        }
    };

    // Readers may outlive the child if a grandchild still holds the pipe.
    while let Ok(line) = rx.recv_timeout(DRAIN_WINDOW) {
        record_line(&mut tail, &line, on_line);
    }

    let exit = forced.unwrap_or(ProcessExit::Exited {
        code: status.code(),
        success: status.success(),
    });

    Ok(ProcessOutcome {
        exit,
        tail: tail.into_iter().collect(),
    })
}

fn supervise(
    child: &mut Child,
    rx: &Receiver<OutputLine>,
    cancel: &CancelToken,
    limits: ProcessLimits,
    tail: &mut VecDeque<String>,
    on_line: &mut dyn FnMut(&OutputLine),
) -> std::io::Result<(ExitStatus, Option<ProcessExit>)> {
    let started = Instant::now();
    let mut forced: Option<ProcessExit> = None;
    let mut streams_open = true;

    loop {
        if streams_open {
            match rx.recv_timeout(limits.poll) {
                Ok(line) => record_line(tail, &line, on_line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => streams_open = false,
            }
        } else {
            thread::sleep(limits.poll);
        }

        if forced.is_none() {
            if cancel.is_cancelled() {
                forced = Some(ProcessExit::Cancelled);
                terminate(child, limits.grace)?;
            } else if limits
                .deadline
                .map(|deadline| started.elapsed() >= deadline)
                .unwrap_or(false)
            {
                forced = Some(ProcessExit::TimedOut);
                terminate(child, limits.grace)?;
            }
        }

        if let Some(status) = child.try_wait()? {
            return Ok((status, forced));
        }
    }
}

/// Best-effort kill and wait after supervision failed.
fn reap(child: &mut Child) {
    if let Err(error) = child.kill() {
        debug!(pid = child.id(), %error, "kill after supervision failure");
    }
    if let Err(error) = child.wait() {
        debug!(pid = child.id(), %error, "wait after supervision failure");
    }
}

fn record_line(
    tail: &mut VecDeque<String>,
    line: &OutputLine,
    on_line: &mut dyn FnMut(&OutputLine),
) {
    on_line(line);
    let trimmed = line.text.trim();
    if trimmed.is_empty() {
        return;
    }
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(trimmed.to_string());
}

fn spawn_reader<R: Read + Send + 'static>(
    source: R,
    stream: OutputStream,
    tx: Sender<OutputLine>,
) {
    thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.split(b'\n') {
            let Ok(bytes) = line else {
                break;
            };
            let text = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\r')
                .to_string();
            if tx.send(OutputLine { stream, text }).is_err() {
                break;
            }
        }
    });
}

/// Asks the child to stop, then kills it once `grace` has elapsed.
fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        match Command::new("kill")
            .arg("-TERM")
            .arg(child.id().to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => debug!(pid = child.id(), %status, "kill -TERM did not succeed"),
            Err(error) => debug!(pid = child.id(), %error, "could not run kill -TERM"),
        }

        let asked = Instant::now();
        while asked.elapsed() < grace {
            if child.try_wait()?.is_some() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    match child.kill() {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::InvalidInput => {}
        Err(error) => return Err(error),
    }
    child.wait().map(|_| ())
}

#[cfg(all(test, unix))]
mod tests {
    use super::{
        run_streaming, CancelToken, OutputStream, ProcessError, ProcessExit, ProcessLimits,
    };
    use std::process::Command;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn streams_both_pipes_and_reports_exit_code() {
        let mut seen = Vec::new();
        let outcome = run_streaming(
            &mut sh("echo out; echo err >&2; exit 3"),
            &CancelToken::new(),
            ProcessLimits::default(),
            &mut |line| seen.push((line.stream, line.text.clone())),
        )
        .expect("run");

        assert_eq!(
            outcome.exit,
            ProcessExit::Exited {
                code: Some(3),
                success: false
            }
        );
        assert!(seen.contains(&(OutputStream::Stdout, String::from("out"))));
        assert!(seen.contains(&(OutputStream::Stderr, String::from("err"))));
        assert_eq!(outcome.tail.len(), 2);
    }

    #[test]
    fn deadline_kills_the_child() {
        let limits = ProcessLimits {
            deadline: Some(Duration::from_millis(300)),
            grace: Duration::from_millis(500),
            poll: Duration::from_millis(20),
        };
        let started = Instant::now();
        let outcome = run_streaming(
            &mut sh("exec sleep 30"),
            &CancelToken::new(),
            limits,
            &mut |_| {},
        )
        .expect("run");

        assert_eq!(outcome.exit, ProcessExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancelled_token_stops_a_running_child() {
        let token = CancelToken::new();
        let trigger = token.clone();
        let outcome = run_streaming(
            &mut sh("echo started; exec sleep 30"),
            &token,
            ProcessLimits {
                poll: Duration::from_millis(20),
                ..ProcessLimits::default()
            },
            &mut |line| {
                if line.text == "started" {
                    trigger.cancel();
                }
            },
        )
        .expect("run");

        assert_eq!(outcome.exit, ProcessExit::Cancelled);
        assert_eq!(outcome.tail, vec![String::from("started")]);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let error = run_streaming(
            &mut Command::new("/definitely/not/a/program"),
            &CancelToken::new(),
            ProcessLimits::default(),
            &mut |_| {},
        )
        .expect_err("spawn must fail");
        assert!(matches!(error, ProcessError::Spawn(_)));
        assert!(error.to_string().starts_with("could not start"));
    }

    #[test]
    fn cancel_with_short_grace_still_reaps_a_child_ignoring_term() {
        let token = CancelToken::new();
        token.cancel();
        let started = Instant::now();
        let outcome = run_streaming(
            &mut sh("trap '' TERM; sleep 30"),
            &token,
            ProcessLimits {
                grace: Duration::from_millis(300),
                poll: Duration::from_millis(20),
                ..ProcessLimits::default()
            },
            &mut |_| {},
        )
        .expect("run");

        assert_eq!(outcome.exit, ProcessExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
