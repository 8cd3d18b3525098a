//! Orchestration engine: drives one work unit through the node table.
//!
//! Each step runs the current node's effect, reduces the result to a
//! [`Signal`], asks the router for the transition, and saves the new state
//! before the next node begins. Cancellation is only observed between
//! nodes, once the checkpoint is durable.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use warden_types::{
    ExitStatus, InstanceId, Node, RejectionReason, Result, TestCategory, TestExecutionResult,
    WardenError, WorkflowInstance, WorkflowStatus,
};

use crate::checkpoint::CheckpointStore;
use crate::collaborators::{Artifact, Author, CollaboratorRequest, Task, Workspace};
use crate::credentials::CollaboratorEnv;
use crate::events::{EventEmitter, WorkflowEvent};
use crate::exit_codes::TestPhase;
use crate::human_gate::HumanGate;
use crate::review_gate::{normalize, Reviewer};
use crate::router::{route, Next, RoutingPolicy, Signal};
use crate::state::WorkflowState;
use crate::test_gate::TestExecutor;
use crate::validator::{confine, ContextBundle, Validator};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A work-unit reference and the instance id derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub reference: String,
    pub id: InstanceId,
}

impl WorkUnit {
    pub fn new(reference: impl Into<String>) -> Result<Self> {
        let reference = reference.into();
        let id = InstanceId::from_work_unit(&reference)?;
        Ok(Self { reference, id })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Start from scratch; refuse if an active checkpoint exists.
    Fresh,
    /// Continue from the last durable node.
    Resume,
    /// Discard any checkpoint and start from scratch.
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Approved,
    Aborted,
    AwaitingHuman,
    Escalated,
    Interrupted,
}

impl RunOutcome {
    pub fn exit_status(self) -> ExitStatus {
        match self {
            RunOutcome::Approved => ExitStatus::Completed,
            RunOutcome::Aborted
            | RunOutcome::AwaitingHuman
            | RunOutcome::Escalated
            | RunOutcome::Interrupted => ExitStatus::HumanAttention,
        }
    }

    fn from_status(status: WorkflowStatus) -> Option<Self> {
        match status {
            WorkflowStatus::Active => None,
            WorkflowStatus::Approved => Some(RunOutcome::Approved),
            WorkflowStatus::Aborted => Some(RunOutcome::Aborted),
            WorkflowStatus::Escalated => Some(RunOutcome::Escalated),
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::Approved => "approved",
            RunOutcome::Aborted => "aborted",
            RunOutcome::AwaitingHuman => "awaiting-human",
            RunOutcome::Escalated => "escalated",
            RunOutcome::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// How one run ended. Every outcome names the checkpoint to resume from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub instance: InstanceId,
    pub work_unit: String,
    pub outcome: RunOutcome,
    pub node: Node,
    pub reason: String,
    pub checkpoint: PathBuf,
    pub authoring_retries: u32,
    pub implementation_retries: u32,
}

impl RunReport {
    /// The policy error a run that stopped short of approval amounts to.
    ///
    /// A human reject is a rejection; budget caps, unresolved human gates
    /// and interrupts all need someone to look at the instance.
    pub fn policy_error(&self) -> Option<WardenError> {
        let node = self.node.to_string();
        let reason = self.reason.clone();
        match self.outcome {
            RunOutcome::Approved => None,
            RunOutcome::Aborted => Some(WardenError::PolicyRejection { node, reason }),
            RunOutcome::AwaitingHuman | RunOutcome::Escalated | RunOutcome::Interrupted => {
                Some(WardenError::EscalationRequired { node, reason })
            }
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.policy_error()
            .map_or(ExitStatus::Completed, |e| e.exit_status())
    }
}

/// What a run would do, computed without side effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedRun {
    pub instance: InstanceId,
    pub work_unit: String,
    pub action: String,
    pub checkpoint: PathBuf,
}

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub policy: RoutingPolicy,
    /// When false, human gates end the run as escalated instead of prompting.
    pub interactive: bool,
    /// Files admitted as context for every authoring call.
    pub context_paths: Vec<PathBuf>,
}

impl EngineConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            policy: RoutingPolicy::default(),
            interactive: true,
            context_paths: Vec::new(),
        }
    }
}

/// The engine's external dependencies.
#[derive(Clone)]
pub struct Collaborators {
    pub author: Arc<dyn Author>,
    pub reviewer: Arc<dyn Reviewer>,
    pub tests: Arc<dyn TestExecutor>,
    pub human: Arc<HumanGate>,
    pub workspace: Arc<dyn Workspace>,
    pub store: Arc<dyn CheckpointStore>,
    pub validator: Arc<Validator>,
}

pub struct WorkflowEngine {
    config: EngineConfig,
    deps: Collaborators,
    events: EventEmitter,
}

// ---------------------------------------------------------------------------
// Context admission
// ---------------------------------------------------------------------------

/// Read and admit user-requested context files.
///
/// Paths and sizes are checked before anything is read, then the full set
/// is admitted as one bundle. Any rejection fails the whole set.
pub async fn admit_context(
    validator: &Validator,
    root: &Path,
    paths: &[PathBuf],
) -> Result<ContextBundle> {
    let limit = validator.config().max_file_bytes;
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let precheck = validator.validate(path, root, b"");
        if !precheck.is_valid() {
            tracing::warn!(path = %path.display(), reason = ?precheck.reason, "Context path rejected");
            precheck.into_result()?;
        }
        let absolute = confine(path, root).await?;
        let file = tokio::fs::File::open(&absolute).await?;
        let size = file.metadata().await?.len();
        if size > limit {
            tracing::warn!(path = %path.display(), size, limit, "Context file too large");
            return Err(WardenError::PathRejected {
                path: path.display().to_string(),
                reason: RejectionReason::FileTooLarge { size, limit },
            });
        }
        // A file still growing is cut one byte past the limit so validation rejects it.
        let mut content = Vec::with_capacity(size as usize);
        file.take(limit + 1).read_to_end(&mut content).await?;
        files.push((path.clone(), content));
    }
    validator.admit(root, files)
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

impl WorkflowEngine {
    pub fn new(config: EngineConfig, deps: Collaborators) -> Self {
        Self {
            config,
            deps,
            events: EventEmitter::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Describe what [`run`](Self::run) would do. Reads the checkpoint only.
    pub async fn plan(&self, unit: &WorkUnit, mode: RunMode) -> Result<PlannedRun> {
        let existing = self.load_state(&unit.id).await?;
        let action = match (mode, existing) {
            (RunMode::Restart, Some(_)) => "discard checkpoint and start at draft".to_string(),
            (_, None) => "start at draft".to_string(),
            (RunMode::Fresh, Some(s)) if !s.instance.is_terminal() => format!(
                "refuse: active checkpoint at {}",
                s.instance.current_node
            ),
            (RunMode::Fresh, Some(s)) => {
                format!("start at draft, replacing {} checkpoint", s.instance.status)
            }
            (RunMode::Resume, Some(s)) => match s.instance.status {
                WorkflowStatus::Active => format!("resume at {}", s.instance.current_node),
                WorkflowStatus::Escalated => "resume at human_gate".to_string(),
                status => format!("report {status} outcome"),
            },
        };
        Ok(PlannedRun {
            instance: unit.id.clone(),
            work_unit: unit.reference.clone(),
            action,
            checkpoint: self.deps.store.record_path(&unit.id),
        })
    }

    /// Drive `unit` until it finishes, needs a human, or is cancelled.
    pub async fn run(
        &self,
        unit: &WorkUnit,
        mode: RunMode,
        env: &CollaboratorEnv,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let id = &unit.id;
        let existing = self.load_state(id).await?;

        let (mut state, resumed) = match (mode, existing) {
            (RunMode::Resume, Some(mut state)) => match state.instance.status {
                WorkflowStatus::Approved | WorkflowStatus::Aborted => {
                    tracing::info!(instance = %id, status = %state.instance.status, "Instance already finished");
                    return Ok(self.report(&state, self.terminal_reason(&state)));
                }
                WorkflowStatus::Escalated => {
                    state.instance.status = WorkflowStatus::Active;
                    state.instance.current_node = Node::HumanGate;
                    (state, true)
                }
                WorkflowStatus::Active => (state, true),
            },
            (RunMode::Fresh, Some(state)) if !state.instance.is_terminal() => {
                return Err(WardenError::CheckpointExists {
                    instance: id.to_string(),
                    path: self.deps.store.record_path(id).display().to_string(),
                });
            }
            (mode, existing) => {
                if mode == RunMode::Resume {
                    tracing::warn!(instance = %id, "No checkpoint to resume, starting fresh");
                }
                if mode == RunMode::Restart && existing.is_some() {
                    self.deps.store.clear(id).await?;
                    tracing::info!(instance = %id, "Discarded previous checkpoint");
                }
                let instance = WorkflowInstance::new(
                    id.clone(),
                    self.config.workspace_root.clone(),
                    unit.reference.clone(),
                );
                (WorkflowState::new(instance), false)
            }
        };

        // User-supplied context fails the run closed before anything is written.
        let context = admit_context(
            &self.deps.validator,
            &self.config.workspace_root,
            &self.config.context_paths,
        )
        .await?;

        if !resumed {
            self.save(&state).await?;
        }
        tracing::info!(instance = %id, node = %state.instance.current_node, resumed, "Run started");
        self.events.emit(WorkflowEvent::RunStarted {
            instance: id.clone(),
            node: state.instance.current_node,
            resumed,
        });

        loop {
            let node = state.instance.current_node;
            let started = tokio::time::Instant::now();
            tracing::info!(instance = %id, node = %node, "Stage started");
            self.events.emit(WorkflowEvent::StageStarted {
                instance: id.clone(),
                node,
            });

            let signal = self.execute(node, &state, &context, env).await?;
            let escalated_before = state.escalation.is_some();
            let mut transition = route(node, state, signal, &self.config.policy, Utc::now());

            if transition.rollback {
                let artifacts = transition.state.artifacts.clone();
                match self.deps.workspace.rollback(id, &artifacts).await {
                    Ok(rollback) => {
                        if let Some(where_) = rollback.recoverable_as {
                            transition.reason = format!("{}; changes kept in {where_}", transition.reason);
                        }
                    }
                    Err(e) => {
                        tracing::error!(instance = %id, error = %e, "Rollback failed, workspace left as is");
                        transition.reason = format!("{}; rollback failed: {e}", transition.reason);
                    }
                }
                // The checkpoint carries the rollback result, not just the live report.
                if let Some(record) = transition.state.history.last_mut() {
                    record.reason = transition.reason.clone();
                }
            }

            self.save(&transition.state).await?;
            state = transition.state;

            self.events.emit(WorkflowEvent::StageCompleted {
                instance: id.clone(),
                node,
                next: transition.next.to_string(),
                reason: transition.reason.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
            if transition.next == Next::Goto(Node::HumanGate) && !escalated_before {
                tracing::warn!(instance = %id, node = %node, reason = %transition.reason, "Escalating to human gate");
                self.events.emit(WorkflowEvent::Escalated {
                    instance: id.clone(),
                    node,
                    reason: transition.reason.clone(),
                });
            }

            let finished = match transition.next {
                Next::Goto(_) => None,
                Next::AwaitHuman => Some(RunOutcome::AwaitingHuman),
                Next::Finish(status) => RunOutcome::from_status(status),
            };
            if let Some(outcome) = finished {
                let mut report = self.report(&state, transition.reason);
                report.outcome = outcome;
                self.finish(&report);
                return Ok(report);
            }

            if cancel.is_cancelled() {
                let mut report = self.report(
                    &state,
                    format!("cancelled before {}", state.instance.current_node),
                );
                report.outcome = RunOutcome::Interrupted;
                self.finish(&report);
                return Ok(report);
            }
        }
    }

    async fn execute(
        &self,
        node: Node,
        state: &WorkflowState,
        context: &ContextBundle,
        env: &CollaboratorEnv,
    ) -> Result<Signal> {
        match node {
            Node::Draft => self.author(Task::Draft, state, context, env).await,
            Node::ScaffoldTests => self.author(Task::ScaffoldTests, state, context, env).await,
            Node::Implement => self.author(Task::Implement, state, context, env).await,
            Node::HumanEdit => {
                let message = format!(
                    "Draft for '{}' is ready in {}.\nArtifacts: {}",
                    state.instance.work_unit,
                    self.config.workspace_root.display(),
                    list_paths(&state.artifacts)
                );
                self.ask_human(&message).await
            }
            Node::HumanGate => {
                let why = state
                    .escalation
                    .as_ref()
                    .map(|e| format!("{} (raised at {})", e.reason, e.from))
                    .unwrap_or_else(|| "escalated".into());
                let message = format!(
                    "'{}' needs a decision: {}.\nCheckpoint: {}",
                    state.instance.work_unit,
                    why,
                    self.deps.store.record_path(&state.instance.id).display()
                );
                self.ask_human(&message).await
            }
            Node::Review => {
                let request = self.request(Task::Review, state, context);
                Ok(match self.deps.reviewer.review(&request, env).await {
                    Ok(doc) => match normalize(&doc) {
                        Ok(verdict) => {
                            tracing::info!(
                                instance = %state.instance.id,
                                overall = ?verdict.overall,
                                coverage = verdict.coverage_percent,
                                blocking = verdict.blocking.len(),
                                "Review verdict"
                            );
                            Signal::Verdict(verdict)
                        }
                        Err(e) => Signal::VerdictMalformed {
                            message: e.to_string(),
                        },
                    },
                    Err(WardenError::MalformedVerdict(message)) => {
                        Signal::VerdictMalformed { message }
                    }
                    Err(e) => Signal::ReviewerFailed {
                        message: e.to_string(),
                    },
                })
            }
            Node::RedPhase => self.run_tests(TestPhase::MustFailFirst, env).await,
            Node::GreenPhase => {
                if state.red_phase_proof.is_none() {
                    tracing::warn!(instance = %state.instance.id, "Green phase without red-phase proof");
                    return Ok(Signal::ProofMissing);
                }
                self.run_tests(TestPhase::MustPass, env).await
            }
            Node::Complete => Ok(Signal::Finished),
        }
    }

    async fn author(
        &self,
        task: Task,
        state: &WorkflowState,
        context: &ContextBundle,
        env: &CollaboratorEnv,
    ) -> Result<Signal> {
        let request = self.request(task, state, context);
        let author = &self.deps.author;
        let produced = match task {
            Task::Draft => author.draft(&request, env).await,
            Task::ScaffoldTests => author.scaffold_tests(&request, env).await,
            Task::Implement | Task::Review => author.implement(&request, env).await,
        };
        let artifacts = match produced {
            Ok(artifacts) => artifacts,
            Err(e) => {
                tracing::warn!(instance = %state.instance.id, %task, error = %e, "Author failed");
                return Ok(Signal::AuthoringFailed {
                    reason: format!("{task} failed: {e}"),
                });
            }
        };

        // Validate everything before writing anything.
        let root = &self.config.workspace_root;
        let mut admitted = Vec::with_capacity(artifacts.len());
        for Artifact { path, content } in artifacts {
            let result = self.deps.validator.validate(&path, root, content.as_bytes());
            if let Some(reason) = result.reason {
                tracing::warn!(instance = %state.instance.id, path = %path.display(), %reason, "Artifact rejected");
                return Ok(Signal::AuthoringFailed {
                    reason: format!("artifact '{}' rejected: {reason}", path.display()),
                });
            }
            let absolute = match confine(&path, root).await {
                Ok(absolute) => absolute,
                Err(WardenError::PathRejected { reason, .. }) => {
                    tracing::warn!(instance = %state.instance.id, path = %path.display(), %reason, "Artifact rejected");
                    return Ok(Signal::AuthoringFailed {
                        reason: format!("artifact '{}' rejected: {reason}", path.display()),
                    });
                }
                Err(e) => return Err(e),
            };
            admitted.push((path, absolute, content));
        }

        let mut written = Vec::with_capacity(admitted.len());
        for (path, absolute, content) in admitted {
            if let Some(parent) = absolute.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&absolute, content).await?;
            tracing::debug!(instance = %state.instance.id, path = %path.display(), "Artifact written");
            written.push(path);
        }
        Ok(Signal::Authored { artifacts: written })
    }

    async fn ask_human(&self, message: &str) -> Result<Signal> {
        if !self.config.interactive {
            return Ok(Signal::NoHuman);
        }
        Ok(Signal::Human(self.deps.human.ask(message).await?))
    }

    async fn run_tests(&self, phase: TestPhase, env: &CollaboratorEnv) -> Result<Signal> {
        let tests = &self.deps.tests;
        let result = match tests.run_tests(&self.config.workspace_root, phase, env).await {
            Ok(result) => result,
            Err(e) => TestExecutionResult {
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
                duration_ms: 0,
                category: TestCategory::InternalError,
                table_version: crate::exit_codes::CURRENT_TABLE_VERSION,
            },
        };
        Ok(Signal::Tests {
            result,
            command: tests.describe(),
        })
    }

    fn request(&self, task: Task, state: &WorkflowState, context: &ContextBundle) -> CollaboratorRequest {
        let attempt = match task {
            Task::Implement => state.instance.implementation_retries,
            _ => state.instance.authoring_retries,
        };
        CollaboratorRequest {
            task,
            instance_id: state.instance.id.clone(),
            work_unit: state.instance.work_unit.clone(),
            workspace_root: self.config.workspace_root.clone(),
            attempt,
            findings: state.findings.clone(),
            context: context.files.clone(),
            artifacts: state.artifacts.clone(),
            last_test: state.last_test.clone(),
        }
    }

    async fn load_state(&self, id: &InstanceId) -> Result<Option<WorkflowState>> {
        match self.deps.store.load(id).await? {
            Some(record) => Ok(Some(WorkflowState::from_value(record.state).map_err(|e| {
                WardenError::CheckpointStore {
                    path: self.deps.store.record_path(id).display().to_string(),
                    message: format!("checkpoint state does not match this version: {e}"),
                }
            })?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &WorkflowState) -> Result<()> {
        let ack = self
            .deps
            .store
            .save(&state.instance.id, state.instance.current_node, &state.to_value()?)
            .await?;
        self.events.emit(WorkflowEvent::CheckpointSaved {
            instance: state.instance.id.clone(),
            node: state.instance.current_node,
            written: ack.written,
        });
        Ok(())
    }

    fn report(&self, state: &WorkflowState, reason: String) -> RunReport {
        RunReport {
            instance: state.instance.id.clone(),
            work_unit: state.instance.work_unit.clone(),
            outcome: RunOutcome::from_status(state.instance.status).unwrap_or(RunOutcome::Interrupted),
            node: state.instance.current_node,
            reason,
            checkpoint: self.deps.store.record_path(&state.instance.id),
            authoring_retries: state.instance.authoring_retries,
            implementation_retries: state.instance.implementation_retries,
        }
    }

    fn terminal_reason(&self, state: &WorkflowState) -> String {
        state
            .last_transition()
            .map(|t| t.reason.clone())
            .unwrap_or_else(|| format!("instance is {}", state.instance.status))
    }

    fn finish(&self, report: &RunReport) {
        tracing::info!(
            instance = %report.instance,
            outcome = %report.outcome,
            node = %report.node,
            reason = %report.reason,
            checkpoint = %report.checkpoint.display(),
            "Run finished"
        );
        self.events.emit(WorkflowEvent::RunFinished {
            instance: report.instance.clone(),
            outcome: report.outcome.to_string(),
            reason: report.reason.clone(),
        });
    }
}

fn list_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "(none)".into();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
