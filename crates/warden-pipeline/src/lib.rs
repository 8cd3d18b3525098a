//! Workflow engine, gates, checkpointing and parallel coordination.
//!
//! This crate implements the governance-gated TDD workflow: context admission,
//! the node table and its pure router, durable per-instance checkpoints, the
//! test/review/human gates, and a bounded coordinator that runs many work
//! units against a finite credential pool.

pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod engine;
pub mod events;
pub mod exit_codes;
pub mod human_gate;
pub mod process;
pub mod retry;
pub mod review_gate;
pub mod router;
pub mod state;
pub mod test_gate;
pub mod validator;

pub use checkpoint::{
    discover_workspace_root, resolve_location, CheckpointStore, FileCheckpointStore,
    LocationContext, SaveAck,
};
pub use collaborators::{
    Artifact, Author, CollaboratorRequest, CommandAuthor, GitWorkspace, NoopWorkspace, Task,
    Workspace,
};
pub use config::WardenConfig;
pub use coordinator::{
    clamp_workers, Coordinator, CoordinatorReport, TaggedOutput, UnitOutcome, UnitResult,
    MAX_WORKERS,
};
pub use credentials::{CollaboratorEnv, Credential, CredentialPool, LeaseGuard};
pub use engine::{
    admit_context, Collaborators, EngineConfig, PlannedRun, RunMode, RunOutcome, RunReport,
    WorkUnit, WorkflowEngine,
};
pub use events::{EventEmitter, WorkflowEvent};
pub use exit_codes::{ExitCodeTable, GateDecision, TestPhase};
pub use human_gate::{ConsolePrompter, HumanGate, HumanResponse, Prompter, ScriptedPrompter};
pub use process::{filtered_env, CommandLine};
pub use retry::BackoffPolicy;
pub use review_gate::{normalize, CommandReviewer, ReviewDecision, ReviewPolicy, Reviewer};
pub use router::{route, Next, RoutingPolicy, Signal, Transition};
pub use state::{Escalation, EscalationReason, RedPhaseProof, WorkflowState};
pub use test_gate::{CommandTestGate, TestExecutor};
pub use validator::{Validator, ValidatorConfig};
