//! Shared data model, errors, and exit-code contract for the Warden orchestrator.
//!
//! This crate provides the foundational types used across all other Warden crates:
//! - `WardenError`: unified error taxonomy
//! - `WorkflowInstance` / `Node`: one run of the pipeline and its position
//! - `CheckpointRecord`: the durable record written after each transition
//! - `ReviewVerdict`, `TestExecutionResult`: normalised gate signals
//! - `CredentialLease`, `PathValidationResult`: coordinator and validator records

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unified error type for all Warden subsystems.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    // === Validation Errors ===
    #[error("Path '{path}' rejected: {reason}")]
    PathRejected {
        path: String,
        reason: RejectionReason,
    },

    #[error(
        "Context budget exceeded: ~{estimated_tokens} tokens across {files} files (budget {budget_tokens})"
    )]
    ContextBudgetExceeded {
        files: usize,
        estimated_tokens: u64,
        budget_tokens: u64,
    },

    #[error("Invalid work unit '{work_unit}': {message}")]
    InvalidWorkUnit { work_unit: String, message: String },

    #[error("Malformed review verdict: {0}")]
    MalformedVerdict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // === Tool Execution Errors ===
    #[error("Tool '{tool}' error: {message}")]
    ToolError { tool: String, message: String },

    #[error("Command timed out after {timeout_ms}ms")]
    CommandTimeout { timeout_ms: u64 },

    // === Coordination Errors ===
    #[error("Cannot resolve checkpoint location: {0}")]
    LocationUnresolved(String),

    #[error("Checkpoint store failure at {path}: {message}")]
    CheckpointStore { path: String, message: String },

    #[error("Instance '{instance}' already has an active checkpoint at {path}; pass --resume to continue or --restart to discard it")]
    CheckpointExists { instance: String, path: String },

    #[error("Credential pool exhausted: no lease within {waited_ms}ms (pool size {pool_size})")]
    CredentialPoolExhausted { pool_size: usize, waited_ms: u64 },

    // === Policy Errors ===
    #[error("Policy rejection at '{node}': {reason}")]
    PolicyRejection { node: String, reason: String },

    #[error("Escalation required at '{node}': {reason}")]
    EscalationRequired { node: String, reason: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse error classes used for routing and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    ToolExecution,
    Coordination,
    PolicyRejection,
    EscalationRequired,
    Internal,
}

impl WardenError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WardenError::PathRejected { .. }
            | WardenError::ContextBudgetExceeded { .. }
            | WardenError::InvalidWorkUnit { .. }
            | WardenError::MalformedVerdict(_)
            | WardenError::Config(_) => ErrorCategory::Validation,
            WardenError::ToolError { .. } | WardenError::CommandTimeout { .. } => {
                ErrorCategory::ToolExecution
            }
            WardenError::LocationUnresolved(_)
            | WardenError::CheckpointStore { .. }
            | WardenError::CheckpointExists { .. }
            | WardenError::CredentialPoolExhausted { .. } => ErrorCategory::Coordination,
            WardenError::PolicyRejection { .. } => ErrorCategory::PolicyRejection,
            WardenError::EscalationRequired { .. } => ErrorCategory::EscalationRequired,
            WardenError::Io(_) | WardenError::Json(_) | WardenError::Other(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            WardenError::CommandTimeout { .. } => true,
            WardenError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns `true` for admission and location failures that must stop the
    /// run before anything is written.
    pub fn is_fail_closed(&self) -> bool {
        matches!(
            self,
            WardenError::PathRejected { .. }
                | WardenError::ContextBudgetExceeded { .. }
                | WardenError::InvalidWorkUnit { .. }
                | WardenError::LocationUnresolved(_)
        )
    }

    /// Maps the error to the process exit status reported by the CLI.
    pub fn exit_status(&self) -> ExitStatus {
        if self.is_fail_closed() {
            return ExitStatus::FailClosed;
        }
        match self.category() {
            ErrorCategory::PolicyRejection | ErrorCategory::EscalationRequired => {
                ExitStatus::HumanAttention
            }
            _ => ExitStatus::Failure,
        }
    }
}

/// A convenience alias for `Result<T, WardenError>`.
pub type Result<T> = std::result::Result<T, WardenError>;

// ---------------------------------------------------------------------------
// ExitStatus: the CLI exit-code contract
// ---------------------------------------------------------------------------

/// Process exit status. Variants are ordered by reporting precedence, so the
/// `max` over several work units is the status the process exits with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExitStatus {
    /// `0`: completed and approved.
    Completed,
    /// `2`: awaiting a human, escalated, or aborted by a human.
    HumanAttention,
    /// `1`: generic failure.
    Failure,
    /// `3`: validator or checkpoint-location fail-closed error.
    FailClosed,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Completed => 0,
            ExitStatus::Failure => 1,
            ExitStatus::HumanAttention => 2,
            ExitStatus::FailClosed => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Node: named pipeline steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Draft,
    HumanEdit,
    Review,
    ScaffoldTests,
    RedPhase,
    Implement,
    GreenPhase,
    Complete,
    HumanGate,
}

impl Node {
    pub const ALL: [Node; 9] = [
        Node::Draft,
        Node::HumanEdit,
        Node::Review,
        Node::ScaffoldTests,
        Node::RedPhase,
        Node::Implement,
        Node::GreenPhase,
        Node::Complete,
        Node::HumanGate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Node::Draft => "draft",
            Node::HumanEdit => "human_edit",
            Node::Review => "review",
            Node::ScaffoldTests => "scaffold_tests",
            Node::RedPhase => "red_phase",
            Node::Implement => "implement",
            Node::GreenPhase => "green_phase",
            Node::Complete => "complete",
            Node::HumanGate => "human_gate",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance: one run of the pipeline for one work unit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Approved,
    Aborted,
    Escalated,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Approved => "approved",
            WorkflowStatus::Aborted => "aborted",
            WorkflowStatus::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

/// Which retry budget a loop-back draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCounter {
    Authoring,
    Implementation,
}

impl fmt::Display for RetryCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryCounter::Authoring => f.write_str("authoring"),
            RetryCounter::Implementation => f.write_str("implementation"),
        }
    }
}

/// Filesystem-safe identifier of a workflow instance.
///
/// Derived deterministically from the work-unit reference so that a resumed
/// run finds the same checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Sanitise a work-unit reference into an instance id.
    ///
    /// Characters outside `[A-Za-z0-9._-]` become `-`; leading dots and dashes
    /// are stripped so the id can never name a hidden or relative path. When
    /// sanitising changed the reference, a short digest of the original is
    /// appended so distinct references keep distinct ids.
    pub fn from_work_unit(work_unit: &str) -> Result<Self> {
        let reference = work_unit.trim();
        let mapped: String = reference
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let trimmed = mapped.trim_start_matches(['.', '-']);
        if trimmed.is_empty() {
            return Err(WardenError::InvalidWorkUnit {
                work_unit: work_unit.to_string(),
                message: "no usable characters for an instance id".into(),
            });
        }
        if trimmed == reference {
            return Ok(Self(trimmed.to_string()));
        }
        Ok(Self(format!("{trimmed}-{}", short_digest(reference))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// First four bytes of the SHA-256 of `text`, as lowercase hex.
fn short_digest(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workspace_root: PathBuf,
    pub work_unit: String,
    pub current_node: Node,
    pub authoring_retries: u32,
    pub implementation_retries: u32,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    pub fn new(id: InstanceId, workspace_root: PathBuf, work_unit: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            workspace_root,
            work_unit: work_unit.into(),
            current_node: Node::Draft,
            authoring_retries: 0,
            implementation_retries: 0,
            status: WorkflowStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != WorkflowStatus::Active
    }

    pub fn counter(&self, counter: RetryCounter) -> u32 {
        match counter {
            RetryCounter::Authoring => self.authoring_retries,
            RetryCounter::Implementation => self.implementation_retries,
        }
    }

    /// Total automated loop-backs taken so far.
    pub fn total_retries(&self) -> u32 {
        self.authoring_retries + self.implementation_retries
    }
}

// ---------------------------------------------------------------------------
// CheckpointRecord: durable snapshot of one instance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub instance_id: InstanceId,
    pub node: Node,
    pub state: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ReviewVerdict: normalised policy review
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Overall {
    Approve,
    Revise,
    Discuss,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Finding {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            location: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub overall: Overall,
    pub blocking: Vec<Finding>,
    pub high_priority: Vec<Finding>,
    pub suggestions: Vec<Finding>,
    pub coverage_percent: f64,
}

impl ReviewVerdict {
    /// Findings that must be carried into the next authoring attempt.
    pub fn carried_findings(&self) -> Vec<Finding> {
        self.blocking
            .iter()
            .chain(self.high_priority.iter())
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// TestExecutionResult: one invocation of the test gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestCategory {
    Pass,
    /// Tests ran and at least one failed. Accepted only by a must-fail-first node.
    ExpectedFail,
    Malformed,
    InternalError,
    Timeout,
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestCategory::Pass => "pass",
            TestCategory::ExpectedFail => "expected-fail",
            TestCategory::Malformed => "malformed",
            TestCategory::InternalError => "internal-error",
            TestCategory::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecutionResult {
    /// `None` when the runner was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub category: TestCategory,
    pub table_version: u32,
}

// ---------------------------------------------------------------------------
// CredentialLease: audit record of one credential claim
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialLease {
    pub credential_id: String,
    pub holder: InstanceId,
    pub acquired_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// PathValidationResult: admission-control verdict for one file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathVerdict {
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    EmptyPath,
    ParentTraversal,
    AbsoluteOutsideRoot,
    /// A symlink on the path resolves outside the declared root.
    LinkOutsideRoot,
    SecretLikeName { pattern: String },
    SecretLikeContent { marker: String },
    FileTooLarge { size: u64, limit: u64 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::EmptyPath => f.write_str("empty path"),
            RejectionReason::ParentTraversal => f.write_str("path escapes the declared root"),
            RejectionReason::AbsoluteOutsideRoot => {
                f.write_str("absolute path outside the declared root")
            }
            RejectionReason::LinkOutsideRoot => {
                f.write_str("path follows a symlink outside the declared root")
            }
            RejectionReason::SecretLikeName { pattern } => {
                write!(f, "filename matches secret pattern '{pattern}'")
            }
            RejectionReason::SecretLikeContent { marker } => {
                write!(f, "content contains {marker}")
            }
            RejectionReason::FileTooLarge { size, limit } => {
                write!(f, "file is {size} bytes (limit {limit})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathValidationResult {
    pub path: PathBuf,
    pub verdict: PathVerdict,
    pub reason: Option<RejectionReason>,
}

impl PathValidationResult {
    pub fn valid(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            verdict: PathVerdict::Valid,
            reason: None,
        }
    }

    pub fn invalid(path: impl Into<PathBuf>, reason: RejectionReason) -> Self {
        Self {
            path: path.into(),
            verdict: PathVerdict::Invalid,
            reason: Some(reason),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.verdict == PathVerdict::Valid
    }

    /// Convert an invalid result into the matching error.
    pub fn into_result(self) -> Result<PathBuf> {
        match self.reason {
            None => Ok(self.path),
            Some(reason) => Err(WardenError::PathRejected {
                path: self.path.display().to_string(),
                reason,
            }),
        }
    }
}
