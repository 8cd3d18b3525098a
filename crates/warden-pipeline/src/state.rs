//! The serialized state carried in every checkpoint.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_types::{
    Finding, Node, Result, RetryCounter, ReviewVerdict, TestCategory, TestExecutionResult,
    WorkflowInstance,
};

/// Evidence that the tests were observed failing before implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedPhaseProof {
    pub command: String,
    pub exit_code: i32,
    pub table_version: u32,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    IterationCapExceeded {
        counter: RetryCounter,
        max_iterations: u32,
    },
    ReviewDiscuss,
    MalformedVerdict {
        message: String,
    },
    ReviewerFailed {
        message: String,
    },
    TestsInconclusive {
        category: TestCategory,
        exit_code: Option<i32>,
    },
    /// A human gate was reached with nobody available to answer it.
    HumanApprovalRequired,
    UnexpectedSignal {
        signal: String,
    },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::IterationCapExceeded {
                counter,
                max_iterations,
            } => write!(
                f,
                "iteration cap of {max_iterations} reached while the {counter} counter requested another loop"
            ),
            EscalationReason::ReviewDiscuss => f.write_str("reviewer asked for discussion"),
            EscalationReason::MalformedVerdict { message } => {
                write!(f, "malformed review verdict: {message}")
            }
            EscalationReason::ReviewerFailed { message } => write!(f, "reviewer failed: {message}"),
            EscalationReason::TestsInconclusive {
                category,
                exit_code,
            } => match exit_code {
                Some(code) => write!(f, "test runner result {category} (exit {code})"),
                None => write!(f, "test runner result {category}"),
            },
            EscalationReason::HumanApprovalRequired => {
                f.write_str("human approval required but no one is available to answer")
            }
            EscalationReason::UnexpectedSignal { signal } => {
                write!(f, "unexpected signal '{signal}'")
            }
        }
    }
}

/// A pending hand-off to the human gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub from: Node,
    pub reason: EscalationReason,
    /// Where an accepted escalation continues.
    pub resume_node: Node,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Node,
    pub to: String,
    pub reason: String,
    pub authoring_retries: u32,
    pub implementation_retries: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub instance: WorkflowInstance,
    /// Findings to hand to the next authoring attempt.
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Artifacts written so far, relative to the workspace root.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub last_verdict: Option<ReviewVerdict>,
    #[serde(default)]
    pub last_test: Option<TestExecutionResult>,
    #[serde(default)]
    pub red_phase_proof: Option<RedPhaseProof>,
    #[serde(default)]
    pub escalation: Option<Escalation>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl WorkflowState {
    pub fn new(instance: WorkflowInstance) -> Self {
        Self {
            instance,
            findings: Vec::new(),
            artifacts: Vec::new(),
            last_verdict: None,
            last_test: None,
            red_phase_proof: None,
            escalation: None,
            history: Vec::new(),
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn last_transition(&self) -> Option<&TransitionRecord> {
        self.history.last()
    }

    /// Record newly written artifacts, keeping first-seen order.
    pub fn add_artifacts(&mut self, paths: impl IntoIterator<Item = PathBuf>) {
        for path in paths {
            if !self.artifacts.contains(&path) {
                self.artifacts.push(path);
            }
        }
    }
}
