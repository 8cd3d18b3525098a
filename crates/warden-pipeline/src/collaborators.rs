//! External collaborators driven by the engine: authors that produce
//! artifacts, and the workspace that can undo uncommitted effects.
//!
//! Command-backed collaborators receive a JSON [`CollaboratorRequest`] on
//! stdin, run with the workspace root as their working directory, and print
//! JSON on stdout. What they write is opaque to the engine beyond the shape
//! checked here.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use warden_types::{Finding, InstanceId, Result, TestExecutionResult, WardenError};

use crate::credentials::CollaboratorEnv;
use crate::process::{run_command, truncate_head_tail, CommandLine, ExecOptions};
use crate::validator::ContextFile;

pub const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Draft,
    ScaffoldTests,
    Implement,
    Review,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Task::Draft => "draft",
            Task::ScaffoldTests => "scaffold_tests",
            Task::Implement => "implement",
            Task::Review => "review",
        };
        f.write_str(s)
    }
}

/// Everything a collaborator is told about the work in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorRequest {
    pub task: Task,
    pub instance_id: InstanceId,
    pub work_unit: String,
    pub workspace_root: PathBuf,
    /// Retry attempt for the counter governing this task, starting at 0.
    pub attempt: u32,
    /// Findings carried forward from the last review or test failure.
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub context: Vec<ContextFile>,
    /// Artifacts written so far, relative to the workspace root.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test: Option<TestExecutionResult>,
}

/// One file an author proposes to write, relative to the workspace root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub content: String,
}

#[async_trait]
pub trait Author: Send + Sync {
    async fn draft(&self, request: &CollaboratorRequest, env: &CollaboratorEnv) -> Result<Vec<Artifact>>;

    async fn scaffold_tests(
        &self,
        request: &CollaboratorRequest,
        env: &CollaboratorEnv,
    ) -> Result<Vec<Artifact>>;

    async fn implement(&self, request: &CollaboratorRequest, env: &CollaboratorEnv) -> Result<Vec<Artifact>>;
}

/// Run a collaborator command with `request` on stdin and return its stdout.
///
/// A timeout or nonzero exit is a tool error; the caller decides how it routes.
pub(crate) async fn invoke_collaborator(
    command: &CommandLine,
    timeout: Duration,
    base_env: Option<&HashMap<String, String>>,
    request: &CollaboratorRequest,
    env: &CollaboratorEnv,
) -> Result<String> {
    let input = serde_json::to_string(request)?;
    let mut opts = ExecOptions::new(&request.workspace_root, timeout);
    if let Some(base) = base_env {
        opts = opts.with_clean_env(base.clone());
    }
    let opts = opts.with_stdin(input).with_env(env.vars().clone());

    tracing::debug!(task = %request.task, command = %command, "Invoking collaborator");
    let exec = run_command(command, &opts).await?;
    if exec.timed_out {
        return Err(WardenError::CommandTimeout {
            timeout_ms: timeout.as_millis() as u64,
        });
    }
    match exec.exit_code {
        Some(0) => Ok(exec.stdout),
        code => Err(WardenError::ToolError {
            tool: command.program().to_string(),
            message: format!(
                "{} exited with {}: {}",
                request.task,
                code.map(|c| c.to_string()).unwrap_or_else(|| "a signal".into()),
                truncate_head_tail(exec.stderr.trim(), 2048)
            ),
        }),
    }
}

// ---------------------------------------------------------------------------
// CommandAuthor
// ---------------------------------------------------------------------------

/// Author backed by one external command per task.
pub struct CommandAuthor {
    draft: CommandLine,
    scaffold: CommandLine,
    implement: CommandLine,
    timeout: Duration,
    base_env: Option<HashMap<String, String>>,
}

impl CommandAuthor {
    pub fn new(draft: CommandLine, scaffold: CommandLine, implement: CommandLine) -> Self {
        Self {
            draft,
            scaffold,
            implement,
            timeout: DEFAULT_COLLABORATOR_TIMEOUT,
            base_env: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the inherited environment with `base`.
    pub fn with_base_env(mut self, base: HashMap<String, String>) -> Self {
        self.base_env = Some(base);
        self
    }

    async fn author(
        &self,
        command: &CommandLine,
        request: &CollaboratorRequest,
        env: &CollaboratorEnv,
    ) -> Result<Vec<Artifact>> {
        let stdout =
            invoke_collaborator(command, self.timeout, self.base_env.as_ref(), request, env).await?;
        parse_artifacts(&stdout).map_err(|message| WardenError::ToolError {
            tool: command.program().to_string(),
            message,
        })
    }
}

#[async_trait]
impl Author for CommandAuthor {
    async fn draft(&self, request: &CollaboratorRequest, env: &CollaboratorEnv) -> Result<Vec<Artifact>> {
        self.author(&self.draft, request, env).await
    }

    async fn scaffold_tests(
        &self,
        request: &CollaboratorRequest,
        env: &CollaboratorEnv,
    ) -> Result<Vec<Artifact>> {
        self.author(&self.scaffold, request, env).await
    }

    async fn implement(&self, request: &CollaboratorRequest, env: &CollaboratorEnv) -> Result<Vec<Artifact>> {
        self.author(&self.implement, request, env).await
    }
}

fn parse_artifacts(stdout: &str) -> std::result::Result<Vec<Artifact>, String> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| format!("output is not an artifact list: {e}"))
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollback {
    /// Where the undone changes can be recovered from, if anything was undone.
    pub recoverable_as: Option<String>,
}

#[async_trait]
pub trait Workspace: Send + Sync {
    /// Undo uncommitted changes to `paths`, the artifacts `instance` wrote.
    /// Nothing outside `paths` may be touched.
    async fn rollback(&self, instance: &InstanceId, paths: &[PathBuf]) -> Result<Rollback>;
}

/// Rolls back by stashing the instance's artifacts, untracked ones included.
/// Other changes in the checkout, and the checkpoint directory, stay in place.
pub struct GitWorkspace {
    root: PathBuf,
    timeout: Duration,
}

impl GitWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let command = CommandLine::new(std::iter::once("git").chain(args.iter().copied()))?;
        let exec = run_command(&command, &ExecOptions::new(&self.root, self.timeout)).await?;
        match exec.exit_code {
            Some(0) if !exec.timed_out => Ok(exec.stdout),
            _ => Err(WardenError::ToolError {
                tool: "git".into(),
                message: format!("git {} failed: {}", args.join(" "), exec.stderr.trim()),
            }),
        }
    }

    /// Literal pathspecs for the artifacts that still exist on disk.
    async fn pathspecs(&self, paths: &[PathBuf]) -> Result<Vec<String>> {
        let mut specs = Vec::with_capacity(paths.len());
        for path in paths {
            if path.starts_with(".warden") {
                continue;
            }
            if tokio::fs::try_exists(self.root.join(path)).await? {
                specs.push(format!(":(literal){}", path.display()));
            }
        }
        Ok(specs)
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    async fn rollback(&self, instance: &InstanceId, paths: &[PathBuf]) -> Result<Rollback> {
        let specs = self.pathspecs(paths).await?;
        let nothing = Rollback {
            recoverable_as: None,
        };
        if specs.is_empty() {
            tracing::info!(instance = %instance, "Nothing to roll back");
            return Ok(nothing);
        }

        let mut status_args = vec!["status", "--porcelain", "--"];
        status_args.extend(specs.iter().map(String::as_str));
        if self.git(&status_args).await?.trim().is_empty() {
            tracing::info!(instance = %instance, "Artifacts match HEAD, nothing to roll back");
            return Ok(nothing);
        }

        let name = format!(
            "warden-rollback {} {}",
            instance,
            chrono::Utc::now().format("%Y%m%dT%H%M%SZ")
        );
        let mut stash_args = vec!["stash", "push", "--include-untracked", "-m", name.as_str(), "--"];
        stash_args.extend(specs.iter().map(String::as_str));
        self.git(&stash_args).await?;
        tracing::warn!(instance = %instance, stash = %name, files = specs.len(), "Rolled back instance artifacts");
        Ok(Rollback {
            recoverable_as: Some(format!("git stash entry '{name}'")),
        })
    }
}

/// Workspace without version control; rollback is a no-op.
pub struct NoopWorkspace;

#[async_trait]
impl Workspace for NoopWorkspace {
    async fn rollback(&self, instance: &InstanceId, _paths: &[PathBuf]) -> Result<Rollback> {
        tracing::warn!(instance = %instance, "Rollback requested but workspace has no version control");
        Ok(Rollback {
            recoverable_as: None,
        })
    }
}
