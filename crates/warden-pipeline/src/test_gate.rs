//! Test-execution gate: runs the project's test command and classifies the
//! result through the exit-code table.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use warden_types::{Result, TestCategory, TestExecutionResult, WardenError};

use crate::credentials::CollaboratorEnv;
use crate::exit_codes::{ExitCodeTable, TestPhase};
use crate::process::{run_command, truncate_head_tail, CommandLine, ExecOptions};

pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured runner output kept in state, per stream.
pub const MAX_CAPTURED_OUTPUT: usize = 16 * 1024;

#[async_trait]
pub trait TestExecutor: Send + Sync {
    /// Run the tests once under the instance's leased `env`. The result is
    /// classified but not routed.
    async fn run_tests(
        &self,
        workspace_root: &Path,
        phase: TestPhase,
        env: &CollaboratorEnv,
    ) -> Result<TestExecutionResult>;

    /// Human-readable description of what is run, recorded in red-phase proofs.
    fn describe(&self) -> String;
}

pub struct CommandTestGate {
    command: CommandLine,
    timeout: Duration,
    table: ExitCodeTable,
    base_env: Option<HashMap<String, String>>,
}

impl CommandTestGate {
    pub fn new(command: CommandLine) -> Self {
        Self {
            command,
            timeout: DEFAULT_TEST_TIMEOUT,
            table: ExitCodeTable::default(),
            base_env: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_table(mut self, table: ExitCodeTable) -> Self {
        self.table = table;
        self
    }

    /// Run the tests with exactly this environment instead of the inherited one.
    pub fn with_base_env(mut self, base: HashMap<String, String>) -> Self {
        self.base_env = Some(base);
        self
    }
}

#[async_trait]
impl TestExecutor for CommandTestGate {
    async fn run_tests(
        &self,
        workspace_root: &Path,
        phase: TestPhase,
        env: &CollaboratorEnv,
    ) -> Result<TestExecutionResult> {
        tracing::info!(command = %self.command, %phase, "Running tests");
        let mut opts = ExecOptions::new(workspace_root, self.timeout);
        if let Some(base) = &self.base_env {
            opts = opts.with_clean_env(base.clone());
        }
        let opts = opts.with_env(env.vars().clone());
        let exec = match run_command(&self.command, &opts).await {
            Ok(exec) => exec,
            Err(WardenError::ToolError { tool, message }) => {
                // A runner that cannot start is an internal error, not a test result.
                tracing::warn!(%tool, %message, "Test runner failed to start");
                return Ok(TestExecutionResult {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: message,
                    duration_ms: 0,
                    category: TestCategory::InternalError,
                    table_version: self.table.version,
                });
            }
            Err(e) => return Err(e),
        };

        let category = self.table.classify(exec.exit_code, exec.timed_out);
        tracing::info!(
            exit_code = ?exec.exit_code,
            %category,
            duration_ms = exec.duration_ms,
            "Tests finished"
        );
        Ok(TestExecutionResult {
            exit_code: exec.exit_code,
            stdout: truncate_head_tail(&exec.stdout, MAX_CAPTURED_OUTPUT),
            stderr: truncate_head_tail(&exec.stderr, MAX_CAPTURED_OUTPUT),
            duration_ms: exec.duration_ms,
            category,
            table_version: self.table.version,
        })
    }

    fn describe(&self) -> String {
        self.command.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(script: &str) -> CommandTestGate {
        CommandTestGate::new(CommandLine::new(["sh", "-c", script]).unwrap())
    }

    #[tokio::test]
    async fn exit_zero_is_pass() {
        let dir = tempfile::tempdir().unwrap();
        let res = gate("echo ok")
            .run_tests(dir.path(), TestPhase::MustPass, &CollaboratorEnv::empty())
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::Pass);
        assert_eq!(res.exit_code, Some(0));
        assert_eq!(res.table_version, 1);
        assert_eq!(res.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn exit_one_is_expected_fail() {
        let dir = tempfile::tempdir().unwrap();
        let res = gate("exit 1")
            .run_tests(dir.path(), TestPhase::MustFailFirst, &CollaboratorEnv::empty())
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::ExpectedFail);
    }

    #[tokio::test]
    async fn collection_error_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let res = gate("exit 4")
            .run_tests(dir.path(), TestPhase::MustPass, &CollaboratorEnv::empty())
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::Malformed);
    }

    #[tokio::test]
    async fn unknown_code_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let res = gate("exit 70")
            .run_tests(dir.path(), TestPhase::MustPass, &CollaboratorEnv::empty())
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::InternalError);
    }

    #[tokio::test]
    async fn timeout_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let res = gate("sleep 30")
            .with_timeout(Duration::from_millis(100))
            .run_tests(dir.path(), TestPhase::MustPass, &CollaboratorEnv::empty())
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::Timeout);
        assert_eq!(res.exit_code, None);
    }

    #[tokio::test]
    async fn runs_in_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let res = gate("test -f marker")
            .run_tests(dir.path(), TestPhase::MustPass, &CollaboratorEnv::empty())
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::Pass);
    }

    #[tokio::test]
    async fn missing_runner_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let gate = CommandTestGate::new(CommandLine::new(["no-such-test-runner-warden"]).unwrap());
        let res = gate
            .run_tests(dir.path(), TestPhase::MustPass, &CollaboratorEnv::empty())
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::InternalError);
        assert!(!res.stderr.is_empty());
    }

    #[tokio::test]
    async fn base_env_replaces_inherited_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        env.insert("MARKER".to_string(), "1".to_string());
        let res = gate(r#"test "$MARKER" = 1 && test -z "$HOME""#)
            .with_base_env(env)
            .run_tests(dir.path(), TestPhase::MustPass, &CollaboratorEnv::empty())
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::Pass);
    }

    #[tokio::test]
    async fn leased_credential_reaches_the_runner() {
        let dir = tempfile::tempdir().unwrap();
        let lease_env = crate::credentials::Credential::new("KEY_A", "s3cret").env();
        let mut base = HashMap::new();
        base.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        let res = gate(r#"test "$WARDEN_CREDENTIAL_ID/$WARDEN_CREDENTIAL" = KEY_A/s3cret"#)
            .with_base_env(base)
            .run_tests(dir.path(), TestPhase::MustPass, &lease_env)
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::Pass);
    }

    #[tokio::test]
    async fn background_process_cannot_hold_the_gate_open() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let res = gate("sleep 8 & exit 1")
            .with_timeout(Duration::from_millis(500))
            .run_tests(dir.path(), TestPhase::MustFailFirst, &CollaboratorEnv::empty())
            .await
            .unwrap();
        assert_eq!(res.category, TestCategory::ExpectedFail);
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }
}
