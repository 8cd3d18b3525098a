//! Pure routing: `(node, state, signal, policy) -> transition`.
//!
//! Node effects run in the engine and reduce whatever happened to a
//! structured [`Signal`]. This module decides where the instance goes next,
//! updates counters and history, and never performs I/O. The clock is an
//! argument so results are reproducible.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use warden_types::{
    Finding, Node, RetryCounter, ReviewVerdict, TestExecutionResult, WorkflowStatus,
};

use crate::exit_codes::{decide, GateDecision, TestPhase};
use crate::human_gate::HumanResponse;
use crate::review_gate::{ReviewDecision, ReviewPolicy};
use crate::state::{Escalation, EscalationReason, RedPhaseProof, TransitionRecord, WorkflowState};

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingPolicy {
    /// Cap on automated loop-backs across both counters.
    pub max_iterations: u32,
    /// Whether a fresh draft waits for a human edit before review.
    pub human_edit: bool,
    pub review: ReviewPolicy,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            human_edit: true,
            review: ReviewPolicy::default(),
        }
    }
}

/// Structured outcome of one node's effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// The author produced artifacts, all admitted and written.
    Authored { artifacts: Vec<PathBuf> },
    /// The author failed or proposed an artifact the validator rejected.
    AuthoringFailed { reason: String },
    Human(HumanResponse),
    /// A human gate was reached in non-interactive mode.
    NoHuman,
    Verdict(ReviewVerdict),
    VerdictMalformed { message: String },
    ReviewerFailed { message: String },
    Tests {
        result: TestExecutionResult,
        command: String,
    },
    /// The green phase was entered without a recorded red phase.
    ProofMissing,
    Finished,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Authored { .. } => "authored",
            Signal::AuthoringFailed { .. } => "authoring_failed",
            Signal::Human(_) => "human",
            Signal::NoHuman => "no_human",
            Signal::Verdict(_) => "verdict",
            Signal::VerdictMalformed { .. } => "verdict_malformed",
            Signal::ReviewerFailed { .. } => "reviewer_failed",
            Signal::Tests { .. } => "tests",
            Signal::ProofMissing => "proof_missing",
            Signal::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Goto(Node),
    Finish(WorkflowStatus),
    /// Stay at the current gate until a human answers.
    AwaitHuman,
}

impl fmt::Display for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Next::Goto(node) => write!(f, "{node}"),
            Next::Finish(status) => write!(f, "{status}"),
            Next::AwaitHuman => f.write_str("awaiting_human"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: WorkflowState,
    pub next: Next,
    pub reason: String,
    /// Uncommitted effects must be undone before this transition is saved.
    pub rollback: bool,
}

/// Decide the transition out of `node` given `signal`.
pub fn route(
    node: Node,
    mut state: WorkflowState,
    signal: Signal,
    policy: &RoutingPolicy,
    now: DateTime<Utc>,
) -> Transition {
    match (node, signal) {
        // --- authoring nodes ---
        (Node::Draft, Signal::Authored { artifacts }) => {
            state.add_artifacts(artifacts);
            let to = if policy.human_edit {
                Node::HumanEdit
            } else {
                Node::Review
            };
            goto(state, node, to, "draft written", now)
        }
        (Node::ScaffoldTests, Signal::Authored { artifacts }) => {
            state.add_artifacts(artifacts);
            state.red_phase_proof = None;
            goto(state, node, Node::RedPhase, "tests scaffolded", now)
        }
        (Node::Implement, Signal::Authored { artifacts }) => {
            state.add_artifacts(artifacts);
            goto(state, node, Node::GreenPhase, "implementation written", now)
        }
        (Node::Draft | Node::ScaffoldTests, Signal::AuthoringFailed { reason }) => {
            loop_back(state, node, node, RetryCounter::Authoring, &reason, policy, now)
        }
        (Node::Implement, Signal::AuthoringFailed { reason }) => loop_back(
            state,
            node,
            node,
            RetryCounter::Implementation,
            &reason,
            policy,
            now,
        ),

        // --- human gates ---
        (Node::HumanEdit, Signal::Human(HumanResponse::Accept)) => {
            goto(state, node, Node::Review, "draft accepted", now)
        }
        (Node::HumanEdit | Node::HumanGate, Signal::Human(HumanResponse::Reject)) => {
            let mut t = finish(state, node, WorkflowStatus::Aborted, "rejected by human", now);
            t.rollback = true;
            t
        }
        (Node::HumanEdit | Node::HumanGate, Signal::Human(HumanResponse::TimedOut)) => {
            stay(state, node, "no human response before timeout", now)
        }
        (Node::HumanEdit, Signal::NoHuman) => escalate(
            state,
            node,
            EscalationReason::HumanApprovalRequired,
            Node::Review,
            now,
        ),
        (Node::HumanGate, Signal::Human(HumanResponse::Accept)) => {
            let resume = state
                .escalation
                .take()
                .map(|e| e.resume_node)
                .unwrap_or(Node::Draft);
            state.instance.authoring_retries = 0;
            state.instance.implementation_retries = 0;
            state.instance.status = WorkflowStatus::Active;
            goto(state, node, resume, "escalation accepted, counters reset", now)
        }
        (Node::HumanGate, Signal::NoHuman) => {
            let reason = state
                .escalation
                .as_ref()
                .map(|e| e.reason.to_string())
                .unwrap_or_else(|| "escalated".into());
            finish(state, node, WorkflowStatus::Escalated, &reason, now)
        }

        // --- review ---
        (Node::Review, Signal::Verdict(verdict)) => {
            let decision = policy.review.decide(&verdict);
            state.last_verdict = Some(verdict);
            match decision {
                ReviewDecision::Proceed => {
                    state.findings.clear();
                    goto(state, node, Node::ScaffoldTests, "review approved", now)
                }
                ReviewDecision::Revise { findings } => {
                    state.findings = findings;
                    loop_back(
                        state,
                        node,
                        Node::Draft,
                        RetryCounter::Authoring,
                        "review requested revision",
                        policy,
                        now,
                    )
                }
                ReviewDecision::Escalate { .. } => escalate(
                    state,
                    node,
                    EscalationReason::ReviewDiscuss,
                    Node::ScaffoldTests,
                    now,
                ),
            }
        }
        (Node::Review, Signal::VerdictMalformed { message }) => escalate(
            state,
            node,
            EscalationReason::MalformedVerdict { message },
            Node::Review,
            now,
        ),
        (Node::Review, Signal::ReviewerFailed { message }) => escalate(
            state,
            node,
            EscalationReason::ReviewerFailed { message },
            Node::Review,
            now,
        ),

        // --- test phases ---
        (Node::RedPhase, Signal::Tests { result, command }) => {
            let category = result.category;
            let exit_code = result.exit_code;
            let table_version = result.table_version;
            state.last_test = Some(result);
            match decide(TestPhase::MustFailFirst, category) {
                GateDecision::Advance => {
                    state.red_phase_proof = Some(RedPhaseProof {
                        command,
                        exit_code: exit_code.unwrap_or(1),
                        table_version,
                        observed_at: now,
                    });
                    state.findings.clear();
                    goto(state, node, Node::Implement, "tests fail as required", now)
                }
                GateDecision::InvalidTddEntry => {
                    state.findings = vec![Finding::new(
                        "tests passed before any implementation; scaffold tests that fail first",
                    )];
                    loop_back(
                        state,
                        node,
                        Node::ScaffoldTests,
                        RetryCounter::Authoring,
                        "invalid TDD entry",
                        policy,
                        now,
                    )
                }
                GateDecision::AuthoringRetry => {
                    state.findings = vec![malformed_tests_finding(exit_code)];
                    loop_back(
                        state,
                        node,
                        Node::ScaffoldTests,
                        RetryCounter::Authoring,
                        "generated tests are malformed",
                        policy,
                        now,
                    )
                }
                GateDecision::ImplementationRetry | GateDecision::Escalate => escalate(
                    state,
                    node,
                    EscalationReason::TestsInconclusive {
                        category,
                        exit_code,
                    },
                    Node::RedPhase,
                    now,
                ),
            }
        }
        (Node::GreenPhase, Signal::ProofMissing) => goto(
            state,
            node,
            Node::RedPhase,
            "no red-phase proof recorded",
            now,
        ),
        (Node::GreenPhase, Signal::Tests { result, .. }) => {
            let category = result.category;
            let exit_code = result.exit_code;
            state.last_test = Some(result);
            match decide(TestPhase::MustPass, category) {
                GateDecision::Advance => {
                    state.findings.clear();
                    goto(state, node, Node::Complete, "tests pass", now)
                }
                GateDecision::ImplementationRetry => {
                    state.findings = vec![Finding::new("tests still fail against the implementation")];
                    loop_back(
                        state,
                        node,
                        Node::Implement,
                        RetryCounter::Implementation,
                        "tests failing",
                        policy,
                        now,
                    )
                }
                GateDecision::AuthoringRetry => {
                    state.findings = vec![malformed_tests_finding(exit_code)];
                    loop_back(
                        state,
                        node,
                        Node::ScaffoldTests,
                        RetryCounter::Authoring,
                        "generated tests are malformed",
                        policy,
                        now,
                    )
                }
                GateDecision::InvalidTddEntry | GateDecision::Escalate => escalate(
                    state,
                    node,
                    EscalationReason::TestsInconclusive {
                        category,
                        exit_code,
                    },
                    Node::GreenPhase,
                    now,
                ),
            }
        }

        (Node::Complete, Signal::Finished) => {
            finish(state, node, WorkflowStatus::Approved, "all gates passed", now)
        }

        (node, other) => escalate(
            state,
            node,
            EscalationReason::UnexpectedSignal {
                signal: other.name().to_string(),
            },
            node,
            now,
        ),
    }
}

fn malformed_tests_finding(exit_code: Option<i32>) -> Finding {
    match exit_code {
        Some(code) => Finding::new(format!(
            "test runner could not collect or run the generated tests (exit {code})"
        )),
        None => Finding::new("test runner could not collect or run the generated tests"),
    }
}

/// Take a loop-back if the iteration budget allows, otherwise escalate.
fn loop_back(
    mut state: WorkflowState,
    from: Node,
    to: Node,
    counter: RetryCounter,
    why: &str,
    policy: &RoutingPolicy,
    now: DateTime<Utc>,
) -> Transition {
    if state.instance.total_retries() >= policy.max_iterations {
        return escalate(
            state,
            from,
            EscalationReason::IterationCapExceeded {
                counter,
                max_iterations: policy.max_iterations,
            },
            to,
            now,
        );
    }
    let n = match counter {
        RetryCounter::Authoring => {
            state.instance.authoring_retries += 1;
            state.instance.authoring_retries
        }
        RetryCounter::Implementation => {
            state.instance.implementation_retries += 1;
            state.instance.implementation_retries
        }
    };
    let reason = format!("{why}; {counter} retry {n}");
    goto(state, from, to, &reason, now)
}

fn escalate(
    mut state: WorkflowState,
    from: Node,
    reason: EscalationReason,
    resume_node: Node,
    now: DateTime<Utc>,
) -> Transition {
    let text = reason.to_string();
    state.escalation = Some(Escalation {
        from,
        reason,
        resume_node,
        raised_at: now,
    });
    transition(state, from, Next::Goto(Node::HumanGate), &text, now)
}

fn goto(state: WorkflowState, from: Node, to: Node, reason: &str, now: DateTime<Utc>) -> Transition {
    transition(state, from, Next::Goto(to), reason, now)
}

fn finish(
    state: WorkflowState,
    from: Node,
    status: WorkflowStatus,
    reason: &str,
    now: DateTime<Utc>,
) -> Transition {
    transition(state, from, Next::Finish(status), reason, now)
}

fn stay(state: WorkflowState, at: Node, reason: &str, now: DateTime<Utc>) -> Transition {
    transition(state, at, Next::AwaitHuman, reason, now)
}

fn transition(
    mut state: WorkflowState,
    from: Node,
    next: Next,
    reason: &str,
    now: DateTime<Utc>,
) -> Transition {
    match next {
        Next::Goto(to) => state.instance.current_node = to,
        Next::Finish(status) => state.instance.status = status,
        Next::AwaitHuman => {}
    }
    state.instance.updated_at = now;
    state.history.push(TransitionRecord {
        from,
        to: next.to_string(),
        reason: reason.to_string(),
        authoring_retries: state.instance.authoring_retries,
        implementation_retries: state.instance.implementation_retries,
        at: now,
    });
    Transition {
        state,
        next,
        reason: reason.to_string(),
        rollback: false,
    }
}
