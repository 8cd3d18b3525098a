//! Argument-list subprocess execution shared by the gates and collaborators.
//!
//! Commands are never passed through a shell. Each child runs in its own
//! process group so a timeout can terminate everything it spawned.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use warden_types::{Result, WardenError};

const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CommandLine(Vec<String>);

impl CommandLine {
    pub fn new<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        match argv.first() {
            Some(program) if !program.trim().is_empty() => Ok(Self(argv)),
            _ => Err(WardenError::Config(
                "command must name a program as its first element".into(),
            )),
        }
    }

    pub fn program(&self) -> &str {
        &self.0[0]
    }

    pub fn args(&self) -> &[String] {
        &self.0[1..]
    }
}

impl TryFrom<Vec<String>> for CommandLine {
    type Error = WardenError;

    fn try_from(argv: Vec<String>) -> Result<Self> {
        Self::new(argv)
    }
}

impl From<CommandLine> for Vec<String> {
    fn from(cmd: CommandLine) -> Self {
        cmd.0
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, "{arg:?}")?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

/// How to run one command.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub cwd: PathBuf,
    pub stdin: Option<String>,
    pub env: HashMap<String, String>,
    /// Start from an empty environment instead of inheriting the parent's.
    pub clear_env: bool,
    pub timeout: Duration,
}

impl ExecOptions {
    pub fn new(cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cwd: cwd.into(),
            stdin: None,
            env: HashMap::new(),
            clear_env: false,
            timeout,
        }
    }

    /// Run with exactly `base` plus any later [`with_env`](Self::with_env) values.
    pub fn with_clean_env(mut self, base: HashMap<String, String>) -> Self {
        self.clear_env = true;
        self.env.extend(base);
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }
}

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal or timed out.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Run `command` to completion or until `opts.timeout` elapses.
///
/// A spawn failure is an error; a nonzero exit or a timeout is reported in
/// the returned [`ExecResult`] so callers can classify it.
pub async fn run_command(command: &CommandLine, opts: &ExecOptions) -> Result<ExecResult> {
    let mut cmd = tokio::process::Command::new(command.program());
    cmd.args(command.args())
        .current_dir(&opts.cwd)
        .stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if opts.clear_env {
        cmd.env_clear();
    }
    cmd.envs(&opts.env);

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let start = tokio::time::Instant::now();
    let deadline = start + opts.timeout;
    let mut child = cmd.spawn().map_err(|e| WardenError::ToolError {
        tool: command.program().to_string(),
        message: format!("failed to spawn: {e}"),
    })?;
    let pid = child.id();

    if let (Some(input), Some(mut pipe)) = (opts.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            // The child may exit without reading its input.
            let _ = pipe.write_all(input.as_bytes()).await;
        });
    }
    let stdout_task = tokio::spawn(drain(child.stdout.take()));
    let stderr_task = tokio::spawn(drain(child.stderr.take()));

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => (status?.code(), false),
        _ = tokio::time::sleep_until(deadline) => {
            terminate(&mut child).await;
            (None, true)
        }
    };
    // Background processes left in the group would otherwise keep the pipes open.
    kill_group(pid);

    // Output is collected under the same deadline, plus a short grace period
    // for what was already buffered.
    let drain_deadline = deadline.max(tokio::time::Instant::now()) + DRAIN_GRACE;
    let stdout = collect(stdout_task, drain_deadline, command).await;
    let stderr = collect(stderr_task, drain_deadline, command).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    tracing::debug!(
        program = %command.program(),
        exit_code = ?exit_code,
        timed_out,
        duration_ms,
        "Command finished"
    );

    Ok(ExecResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        timed_out,
        duration_ms,
    })
}

async fn collect(
    mut task: tokio::task::JoinHandle<Vec<u8>>,
    deadline: tokio::time::Instant,
    command: &CommandLine,
) -> Vec<u8> {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            tracing::warn!(program = %command.program(), "Output still open after deadline, discarding it");
            task.abort();
            Vec::new()
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        let _ = r.read_to_end(&mut buf).await;
    }
    buf
}

/// SIGKILL whatever is left of the process group led by `pid`.
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// SIGTERM the process group, then SIGKILL after a two second grace period.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
        tokio::select! {
            _ = child.wait() => {}
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                let _ = child.kill().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}

/// Filter a parent environment for collaborator processes.
///
/// Drops variables whose names look secret-bearing and every name in
/// `hidden`, so a pooled credential reaches a child only through its lease.
pub fn filtered_env<I>(vars: I, hidden: &[String]) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    const EXCLUDE_SUFFIXES: &[&str] = &["_api_key", "_secret", "_token", "_password", "_credential"];
    const ALWAYS_INCLUDE: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "TERM", "TMPDIR"];

    vars.into_iter()
        .filter(|(key, _)| {
            if hidden.iter().any(|h| h == key) {
                return false;
            }
            if ALWAYS_INCLUDE.contains(&key.as_str()) {
                return true;
            }
            let lower = key.to_lowercase();
            !EXCLUDE_SUFFIXES.iter().any(|s| lower.ends_with(s))
        })
        .collect()
}

/// Keep the first 40% and last 60% of `output` when it exceeds `max_bytes`,
/// with a marker in the middle. Cuts only on UTF-8 boundaries.
pub fn truncate_head_tail(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let head_end = floor_boundary(output, max_bytes * 40 / 100);
    let tail_start = ceil_boundary(output, output.len() - (max_bytes - max_bytes * 40 / 100));
    let removed = tail_start - head_end;
    format!(
        "{}\n[WARNING: Output truncated. {} bytes removed from middle]\n{}",
        &output[..head_end],
        removed,
        &output[tail_start..]
    )
}

fn floor_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
