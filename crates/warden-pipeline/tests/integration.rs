//! End-to-end runs of the engine and coordinator with scripted collaborators.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use warden_pipeline::collaborators::Rollback;
use warden_pipeline::exit_codes::ExitCodeTable;
use warden_pipeline::*;
use warden_types::{
    ExitStatus, InstanceId, Node, Result, TestExecutionResult, WardenError, WorkflowInstance,
    WorkflowStatus,
};

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SeenRequest {
    task: Task,
    attempt: u32,
    findings: usize,
}

#[derive(Default)]
struct ScriptedAuthor {
    seen: Mutex<Vec<SeenRequest>>,
    delay: Option<Duration>,
    cancel_on_draft: Option<CancellationToken>,
}

impl ScriptedAuthor {
    fn calls(&self, task: Task) -> usize {
        self.seen.lock().unwrap().iter().filter(|r| r.task == task).count()
    }

    async fn respond(&self, request: &CollaboratorRequest, path: &str) -> Result<Vec<Artifact>> {
        self.seen.lock().unwrap().push(SeenRequest {
            task: request.task,
            attempt: request.attempt,
            findings: request.findings.len(),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(vec![Artifact {
            path: PathBuf::from(path),
            content: format!("{} for {}", request.task, request.work_unit),
        }])
    }
}

#[async_trait]
impl Author for ScriptedAuthor {
    async fn draft(&self, request: &CollaboratorRequest, _env: &CollaboratorEnv) -> Result<Vec<Artifact>> {
        if let Some(token) = &self.cancel_on_draft {
            token.cancel();
        }
        self.respond(request, "docs/design.md").await
    }

    async fn scaffold_tests(
        &self,
        request: &CollaboratorRequest,
        _env: &CollaboratorEnv,
    ) -> Result<Vec<Artifact>> {
        self.respond(request, "tests/feature_test.sh").await
    }

    async fn implement(&self, request: &CollaboratorRequest, _env: &CollaboratorEnv) -> Result<Vec<Artifact>> {
        self.respond(request, "src/feature.sh").await
    }
}

/// Replays verdict documents, repeating the last one forever.
struct ScriptedReviewer {
    docs: Mutex<VecDeque<Value>>,
    calls: AtomicUsize,
}

impl ScriptedReviewer {
    fn new(docs: Vec<Value>) -> Self {
        Self {
            docs: Mutex::new(docs.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Reviewer for ScriptedReviewer {
    async fn review(&self, _request: &CollaboratorRequest, _env: &CollaboratorEnv) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut docs = self.docs.lock().unwrap();
        let doc = if docs.len() > 1 {
            docs.pop_front()
        } else {
            docs.front().cloned()
        };
        doc.ok_or_else(|| WardenError::Other("no verdict scripted".into()))
    }
}

/// Replays exit codes through the real classification table. Once the script
/// runs out, the red phase fails and the green phase passes.
struct ScriptedTests {
    codes: Mutex<VecDeque<i32>>,
    phases: Mutex<Vec<TestPhase>>,
}

impl ScriptedTests {
    fn new(codes: &[i32]) -> Self {
        Self {
            codes: Mutex::new(codes.iter().copied().collect()),
            phases: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TestExecutor for ScriptedTests {
    async fn run_tests(
        &self,
        _root: &Path,
        phase: TestPhase,
        _env: &CollaboratorEnv,
    ) -> Result<TestExecutionResult> {
        self.phases.lock().unwrap().push(phase);
        let code = self.codes.lock().unwrap().pop_front().unwrap_or(match phase {
            TestPhase::MustFailFirst => 1,
            TestPhase::MustPass => 0,
        });
        let table = ExitCodeTable::v1();
        Ok(TestExecutionResult {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 3,
            category: table.classify(Some(code), false),
            table_version: table.version,
        })
    }

    fn describe(&self) -> String {
        "scripted-tests".into()
    }
}

#[derive(Default)]
struct CountingWorkspace {
    rollbacks: AtomicUsize,
    paths: Mutex<Vec<PathBuf>>,
    broken: AtomicBool,
}

#[async_trait]
impl Workspace for CountingWorkspace {
    async fn rollback(&self, _instance: &InstanceId, paths: &[PathBuf]) -> Result<Rollback> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().extend_from_slice(paths);
        if self.broken.load(Ordering::SeqCst) {
            return Err(WardenError::ToolError {
                tool: "git".into(),
                message: "index.lock exists".into(),
            });
        }
        Ok(Rollback {
            recoverable_as: Some("scripted stash".into()),
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    root: tempfile::TempDir,
    author: Arc<ScriptedAuthor>,
    reviewer: Arc<ScriptedReviewer>,
    tests: Arc<ScriptedTests>,
    workspace: Arc<CountingWorkspace>,
    prompter: Arc<ScriptedPrompter>,
    interactive: bool,
    human_edit: bool,
}

impl Harness {
    fn new(reviews: Vec<Value>, codes: &[i32]) -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            author: Arc::new(ScriptedAuthor::default()),
            reviewer: Arc::new(ScriptedReviewer::new(reviews)),
            tests: Arc::new(ScriptedTests::new(codes)),
            workspace: Arc::new(CountingWorkspace::default()),
            prompter: Arc::new(ScriptedPrompter::silent()),
            interactive: false,
            human_edit: false,
        }
    }

    fn with_human(mut self, replies: &[&str]) -> Self {
        self.prompter = Arc::new(ScriptedPrompter::new(replies.iter().copied()));
        self.interactive = true;
        self.human_edit = true;
        self
    }

    fn root(&self) -> &Path {
        self.root.path()
    }

    fn store(&self) -> FileCheckpointStore {
        FileCheckpointStore::new(self.root().join(".warden/checkpoints"))
    }

    fn engine(&self) -> WorkflowEngine {
        let mut config = EngineConfig::new(self.root());
        config.interactive = self.interactive;
        config.policy.human_edit = self.human_edit;
        WorkflowEngine::new(
            config,
            Collaborators {
                author: self.author.clone(),
                reviewer: self.reviewer.clone(),
                tests: self.tests.clone(),
                human: Arc::new(
                    HumanGate::new(self.prompter.clone()).with_timeout(Duration::from_secs(5)),
                ),
                workspace: self.workspace.clone(),
                store: Arc::new(self.store()),
                validator: Arc::new(Validator::new(ValidatorConfig::default()).unwrap()),
            },
        )
    }

    async fn run(&self, unit: &str, mode: RunMode) -> Result<RunReport> {
        self.engine()
            .run(
                &WorkUnit::new(unit).unwrap(),
                mode,
                &CollaboratorEnv::empty(),
                &CancellationToken::new(),
            )
            .await
    }

    async fn state(&self, unit: &str) -> WorkflowState {
        let id = InstanceId::from_work_unit(unit).unwrap();
        let record = self.store().load(&id).await.unwrap().unwrap();
        WorkflowState::from_value(record.state).unwrap()
    }
}

fn approve(coverage: f64) -> Value {
    json!({ "overall": "approve", "coverage": coverage })
}

fn revise() -> Value {
    json!({
        "verdict": "request_changes",
        "findings": { "blocking": [{ "summary": "missing error handling" }] },
        "coverage_percent": 80
    })
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_approved_with_full_coverage() {
    let h = Harness::new(vec![approve(100.0)], &[1, 0]);
    let report = h.run("issue-101", RunMode::Fresh).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Approved);
    assert_eq!(report.outcome.exit_status(), ExitStatus::Completed);
    assert_eq!(report.node, Node::Complete);
    assert!(h.root().join("docs/design.md").exists());
    assert!(h.root().join("tests/feature_test.sh").exists());
    assert!(h.root().join("src/feature.sh").exists());

    let state = h.state("issue-101").await;
    assert_eq!(state.instance.status, WorkflowStatus::Approved);
    let proof = state.red_phase_proof.unwrap();
    assert_eq!(proof.exit_code, 1);
    assert_eq!(proof.command, "scripted-tests");
    assert_eq!(
        *h.tests.phases.lock().unwrap(),
        vec![TestPhase::MustFailFirst, TestPhase::MustPass]
    );
}

#[tokio::test]
async fn scenario_b_revise_loops_to_draft_with_findings() {
    let h = Harness::new(vec![revise(), approve(97.5)], &[1, 0]);
    let report = h.run("issue-102", RunMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Approved);
    assert_eq!(report.authoring_retries, 1);

    let state = h.state("issue-102").await;
    let loop_back = state
        .history
        .iter()
        .find(|t| t.from == Node::Review && t.to == "draft")
        .unwrap();
    assert_eq!(loop_back.authoring_retries, 1);
    assert_eq!(loop_back.implementation_retries, 0);

    let seen = h.author.seen.lock().unwrap().clone();
    let drafts: Vec<_> = seen.iter().filter(|r| r.task == Task::Draft).collect();
    assert_eq!(drafts.len(), 2);
    assert_eq!((drafts[0].attempt, drafts[0].findings), (0, 0));
    assert_eq!((drafts[1].attempt, drafts[1].findings), (1, 1));
}

#[tokio::test]
async fn scenario_c_iteration_cap_forces_human_gate() {
    let h = Harness::new(vec![revise()], &[]);
    let report = h.run("issue-103", RunMode::Fresh).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Escalated);
    assert_eq!(report.outcome.exit_status().code(), 2);
    assert_eq!(report.node, Node::HumanGate);
    assert!(report.reason.contains("iteration cap of 5"));
    assert_eq!(report.authoring_retries, 5);
    // One initial draft plus five automated loop-backs, then no more.
    assert_eq!(h.author.calls(Task::Draft), 6);
    assert_eq!(h.reviewer.calls.load(Ordering::SeqCst), 6);

    let state = h.state("issue-103").await;
    assert!(state
        .history
        .iter()
        .all(|t| t.authoring_retries + t.implementation_retries <= 5));
}

#[tokio::test]
async fn scenario_d_unresolvable_location_fails_closed() {
    let cwd_before: Vec<_> = std::fs::read_dir(".").unwrap().collect();
    let err = FileCheckpointStore::resolve(&LocationContext::default()).unwrap_err();
    assert!(matches!(err, WardenError::LocationUnresolved(_)));
    assert_eq!(err.exit_status().code(), 3);
    assert!(err.to_string().contains("--checkpoint-dir"));
    let cwd_after: Vec<_> = std::fs::read_dir(".").unwrap().collect();
    assert_eq!(cwd_before.len(), cwd_after.len());
}

#[tokio::test]
async fn scenario_e_pool_of_two_bounds_three_instances() {
    let h = Harness {
        author: Arc::new(ScriptedAuthor {
            delay: Some(Duration::from_millis(40)),
            ..Default::default()
        }),
        ..Harness::new(vec![approve(100.0)], &[])
    };
    let pool = Arc::new(CredentialPool::anonymous(2).unwrap());
    let coordinator = Coordinator::new(Arc::new(h.engine()), pool.clone(), 3)
        .with_output(Arc::new(TaggedOutput::new(Box::new(std::io::sink()))));

    let units = ["e-1", "e-2", "e-3"]
        .iter()
        .map(|u| WorkUnit::new(*u).unwrap())
        .collect();
    let report = coordinator
        .run(units, RunMode::Fresh, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.exit_status(), ExitStatus::Completed);
    assert_eq!(report.peak_leases, 2);
    assert_eq!(report.leases.len(), 3);
    assert!(report.leases.iter().all(|l| l.released_at.is_some()));

    // The third lease was granted only after one of the first two ended.
    let third = &report.leases[2];
    let first_release = report.leases[..2]
        .iter()
        .filter_map(|l| l.released_at)
        .min()
        .unwrap();
    assert!(third.acquired_at >= first_release);
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn scenario_f_exit_one_is_red_then_retry() {
    let h = Harness::new(vec![approve(100.0)], &[1, 1, 0]);
    let report = h.run("issue-106", RunMode::Fresh).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Approved);
    assert_eq!(report.implementation_retries, 1);
    assert_eq!(report.authoring_retries, 0);
    assert_eq!(h.author.calls(Task::Implement), 2);

    let state = h.state("issue-106").await;
    let transitions: Vec<_> = state
        .history
        .iter()
        .map(|t| (t.from.to_string(), t.to.clone()))
        .collect();
    assert!(transitions.contains(&("red_phase".into(), "implement".into())));
    assert!(transitions.contains(&("green_phase".into(), "implement".into())));
    assert!(transitions.contains(&("green_phase".into(), "complete".into())));
}

#[tokio::test]
async fn tests_passing_before_implementation_is_invalid_entry() {
    let h = Harness::new(vec![approve(100.0)], &[0, 1, 0]);
    let report = h.run("issue-107", RunMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Approved);
    assert_eq!(report.authoring_retries, 1);
    assert_eq!(h.author.calls(Task::ScaffoldTests), 2);
}

#[tokio::test]
async fn unknown_exit_code_escalates_without_retry() {
    let h = Harness::new(vec![approve(100.0)], &[1, 139]);
    let report = h.run("issue-108", RunMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Escalated);
    assert_eq!(h.author.calls(Task::Implement), 1);
    assert!(report.reason.contains("internal-error"));
}

#[tokio::test]
async fn low_coverage_approve_is_revised() {
    let h = Harness::new(vec![approve(60.0), approve(96.0)], &[1, 0]);
    let report = h.run("issue-109", RunMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Approved);
    assert_eq!(h.author.calls(Task::Draft), 2);
}

#[tokio::test]
async fn discuss_escalates_regardless_of_counters() {
    let h = Harness::new(vec![json!({ "decision": "discuss", "coverage": 100 })], &[]);
    let report = h.run("issue-110", RunMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Escalated);
    assert_eq!(report.authoring_retries, 0);
    assert!(report.reason.contains("discussion"));
}

#[tokio::test]
async fn malformed_verdict_escalates() {
    let h = Harness::new(vec![json!({ "overall": "looks fine to me" })], &[]);
    let report = h.run("issue-111", RunMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Escalated);
    assert!(report.reason.contains("malformed"));
}

// ---------------------------------------------------------------------------
// Human gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn human_reject_rolls_back_exactly_once() {
    let h = Harness::new(vec![approve(100.0)], &[]).with_human(&["reject"]);
    let report = h.run("issue-120", RunMode::Fresh).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert_eq!(report.outcome.exit_status().code(), 2);
    assert!(report.reason.contains("scripted stash"));
    assert_eq!(h.workspace.rollbacks.load(Ordering::SeqCst), 1);

    // Resuming a terminal instance reports it again without side effects.
    let again = h.run("issue-120", RunMode::Resume).await.unwrap();
    assert_eq!(again.outcome, RunOutcome::Aborted);
    assert_eq!(h.workspace.rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(h.author.calls(Task::Draft), 1);
}

#[tokio::test]
async fn rollback_is_scoped_to_the_instance_artifacts() {
    let h = Harness::new(vec![approve(100.0)], &[]).with_human(&["reject"]);
    h.run("issue-121", RunMode::Fresh).await.unwrap();

    assert_eq!(
        *h.workspace.paths.lock().unwrap(),
        vec![PathBuf::from("docs/design.md")]
    );
}

#[tokio::test]
async fn failed_rollback_is_reported_and_checkpointed() {
    let h = Harness::new(vec![approve(100.0)], &[]).with_human(&["reject"]);
    h.workspace.broken.store(true, Ordering::SeqCst);
    let report = h.run("issue-122", RunMode::Fresh).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Aborted);
    assert!(report.reason.contains("rollback failed"), "{}", report.reason);
    assert!(report.reason.contains("index.lock exists"));

    let state = h.state("issue-122").await;
    assert_eq!(state.instance.status, WorkflowStatus::Aborted);
    let last = state.last_transition().unwrap();
    assert!(last.reason.contains("rollback failed"), "{}", last.reason);
}

#[tokio::test]
async fn human_accept_continues_to_review() {
    let h = Harness::new(vec![approve(100.0)], &[1, 0]).with_human(&["", "yes", "approve"]);
    let report = h.run("issue-121", RunMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Approved);
    assert_eq!(h.prompter.prompts().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn human_timeout_awaits_and_resume_reenters_gate() {
    let h = Harness::new(vec![approve(100.0)], &[1, 0]).with_human(&[]);
    let report = h.run("issue-122", RunMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::AwaitingHuman);
    assert_eq!(report.node, Node::HumanEdit);

    let h2 = Harness {
        root: h.root,
        author: h.author.clone(),
        ..Harness::new(vec![approve(100.0)], &[1, 0]).with_human(&["approve"])
    };
    let resumed = h2.run("issue-122", RunMode::Resume).await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Approved);
    // The draft was not replayed.
    assert_eq!(h2.author.calls(Task::Draft), 1);
}

#[tokio::test]
async fn escalated_instance_resumes_at_human_gate() {
    let h = Harness::new(vec![json!({ "overall": "discuss" })], &[]);
    let report = h.run("issue-123", RunMode::Fresh).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Escalated);

    let h2 = Harness {
        root: h.root,
        author: h.author.clone(),
        ..Harness::new(vec![approve(100.0)], &[1, 0]).with_human(&["approve"])
    };
    let resumed = h2.run("issue-123", RunMode::Resume).await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Approved);
    // Accepting a discussion continues past review to the tests.
    assert_eq!(h2.author.calls(Task::Draft), 1);
    assert_eq!(h2.reviewer.calls.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Checkpoint and resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_after_crash_reenters_last_durable_node() {
    let h = Harness::new(vec![approve(100.0)], &[0]);
    let unit = WorkUnit::new("issue-130").unwrap();

    // A crash after the red phase was checkpointed but before implement ran.
    let mut state = WorkflowState::new(WorkflowInstance::new(
        unit.id.clone(),
        h.root().to_path_buf(),
        "issue-130",
    ));
    state.instance.current_node = Node::Implement;
    state.red_phase_proof = Some(RedPhaseProof {
        command: "scripted-tests".into(),
        exit_code: 1,
        table_version: 1,
        observed_at: chrono::Utc::now(),
    });
    h.store()
        .save(&unit.id, Node::Implement, &state.to_value().unwrap())
        .await
        .unwrap();

    let report = h.run("issue-130", RunMode::Resume).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Approved);
    assert_eq!(h.author.calls(Task::Draft), 0);
    assert_eq!(h.author.calls(Task::ScaffoldTests), 0);
    assert_eq!(h.author.calls(Task::Implement), 1);
    assert_eq!(*h.tests.phases.lock().unwrap(), vec![TestPhase::MustPass]);
}

#[tokio::test]
async fn cancelled_run_stops_after_checkpoint_and_resumes() {
    let token = CancellationToken::new();
    let h = Harness {
        author: Arc::new(ScriptedAuthor {
            cancel_on_draft: Some(token.clone()),
            ..Default::default()
        }),
        ..Harness::new(vec![approve(100.0)], &[1, 0])
    };
    let unit = WorkUnit::new("issue-131").unwrap();
    let report = h
        .engine()
        .run(&unit, RunMode::Fresh, &CollaboratorEnv::empty(), &token)
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(report.node, Node::Review);
    assert_eq!(h.state("issue-131").await.instance.current_node, Node::Review);

    let resumed = h.run("issue-131", RunMode::Resume).await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Approved);
    assert_eq!(h.author.calls(Task::Draft), 1);
}

#[tokio::test]
async fn restart_discards_previous_checkpoint() {
    let h = Harness::new(vec![json!({ "overall": "discuss" })], &[]);
    h.run("issue-132", RunMode::Fresh).await.unwrap();
    let err = h.run("issue-132", RunMode::Fresh).await;
    // Escalated is terminal, so a fresh run may replace it.
    assert!(err.is_ok());

    let report = h.run("issue-132", RunMode::Restart).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Escalated);
    assert_eq!(h.author.calls(Task::Draft), 3);
    let history = h.store().history(&InstanceId::from_work_unit("issue-132").unwrap()).await.unwrap();
    assert!(history.iter().any(|e| e.node == Node::Draft));
}

#[tokio::test]
async fn rejected_artifact_is_retried_not_written() {
    struct SneakyAuthor(AtomicUsize);

    #[async_trait]
    impl Author for SneakyAuthor {
        async fn draft(&self, _r: &CollaboratorRequest, _e: &CollaboratorEnv) -> Result<Vec<Artifact>> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            let path = if n == 0 { "../escape.md" } else { "docs/design.md" };
            Ok(vec![Artifact {
                path: path.into(),
                content: "x".into(),
            }])
        }
        async fn scaffold_tests(&self, _r: &CollaboratorRequest, _e: &CollaboratorEnv) -> Result<Vec<Artifact>> {
            Ok(vec![])
        }
        async fn implement(&self, _r: &CollaboratorRequest, _e: &CollaboratorEnv) -> Result<Vec<Artifact>> {
            Ok(vec![])
        }
    }

    let h = Harness::new(vec![approve(100.0)], &[1, 0]);
    let mut config = EngineConfig::new(h.root());
    config.interactive = false;
    config.policy.human_edit = false;
    let engine = WorkflowEngine::new(
        config,
        Collaborators {
            author: Arc::new(SneakyAuthor(AtomicUsize::new(0))),
            reviewer: h.reviewer.clone(),
            tests: h.tests.clone(),
            human: Arc::new(HumanGate::new(h.prompter.clone())),
            workspace: h.workspace.clone(),
            store: Arc::new(h.store()),
            validator: Arc::new(Validator::new(ValidatorConfig::default()).unwrap()),
        },
    );
    let report = engine
        .run(
            &WorkUnit::new("issue-133").unwrap(),
            RunMode::Fresh,
            &CollaboratorEnv::empty(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Approved);
    assert_eq!(report.authoring_retries, 1);
    assert!(!h.root().parent().unwrap().join("escape.md").exists());
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_drains_queued_units() {
    let token = CancellationToken::new();
    let h = Harness {
        author: Arc::new(ScriptedAuthor {
            cancel_on_draft: Some(token.clone()),
            ..Default::default()
        }),
        ..Harness::new(vec![approve(100.0)], &[1, 0])
    };
    let pool = Arc::new(CredentialPool::anonymous(1).unwrap());
    let coordinator = Coordinator::new(Arc::new(h.engine()), pool.clone(), 1)
        .with_output(Arc::new(TaggedOutput::new(Box::new(std::io::sink()))));
    let units = ["c-1", "c-2", "c-3"]
        .iter()
        .map(|u| WorkUnit::new(*u).unwrap())
        .collect();

    let report = coordinator.run(units, RunMode::Fresh, &token).await.unwrap();

    let started: Vec<_> = report
        .units
        .iter()
        .filter(|u| matches!(u.result, UnitResult::Finished(_)))
        .collect();
    let drained = report
        .units
        .iter()
        .filter(|u| u.result == UnitResult::Drained)
        .count();
    assert_eq!(started.len(), 1);
    assert_eq!(drained, 2);
    if let UnitResult::Finished(r) = &started[0].result {
        assert_eq!(r.outcome, RunOutcome::Interrupted);
    }
    assert_eq!(h.author.calls(Task::Draft), 1);
    assert_eq!(report.leases.len(), 1);
    assert_eq!(pool.active(), 0);
}

#[tokio::test]
async fn dry_run_acquires_nothing_and_writes_nothing() {
    let h = Harness::new(vec![approve(100.0)], &[]);
    let pool = Arc::new(CredentialPool::anonymous(2).unwrap());
    let coordinator = Coordinator::new(Arc::new(h.engine()), pool.clone(), 4);
    let units: Vec<_> = ["d-1", "d-2"].iter().map(|u| WorkUnit::new(*u).unwrap()).collect();

    let plan = coordinator.plan(&units, RunMode::Fresh).await.unwrap();
    assert_eq!(plan.len(), 2);
    assert!(plan.iter().all(|p| p.action == "start at draft"));
    assert!(pool.lease_log().is_empty());
    assert!(!h.root().join(".warden").exists());
    assert_eq!(h.author.calls(Task::Draft), 0);
}

#[tokio::test]
async fn colliding_units_are_refused_before_anything_runs() {
    let h = Harness::new(vec![approve(100.0)], &[1, 0]);
    let pool = Arc::new(CredentialPool::anonymous(2).unwrap());
    let coordinator = Coordinator::new(Arc::new(h.engine()), pool.clone(), 2)
        .with_output(Arc::new(TaggedOutput::new(Box::new(std::io::sink()))));
    // Whitespace is trimmed, so both references land on the same instance id.
    let units = ["g-1", " g-1 "]
        .iter()
        .map(|u| WorkUnit::new(*u).unwrap())
        .collect();

    let err = coordinator
        .run(units, RunMode::Fresh, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, WardenError::InvalidWorkUnit { .. }));
    assert_eq!(h.author.calls(Task::Draft), 0);
    assert!(pool.lease_log().is_empty());
    assert!(!h.root().join(".warden").exists());
}

#[tokio::test]
async fn failing_instance_does_not_affect_siblings() {
    let h = Harness::new(vec![approve(100.0)], &[1, 0]);
    // An active checkpoint makes the fresh run of one unit fail.
    let blocked = WorkUnit::new("f-1").unwrap();
    let state = WorkflowState::new(WorkflowInstance::new(
        blocked.id.clone(),
        h.root().to_path_buf(),
        "f-1",
    ));
    h.store()
        .save(&blocked.id, Node::Draft, &state.to_value().unwrap())
        .await
        .unwrap();

    let coordinator = Coordinator::new(
        Arc::new(h.engine()),
        Arc::new(CredentialPool::anonymous(2).unwrap()),
        2,
    )
    .with_output(Arc::new(TaggedOutput::new(Box::new(std::io::sink()))));
    let report = coordinator
        .run(
            vec![blocked, WorkUnit::new("f-2").unwrap()],
            RunMode::Fresh,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(report.units[0].result, UnitResult::Failed { exit_code: 1, .. }));
    assert!(matches!(&report.units[1].result, UnitResult::Finished(r) if r.outcome == RunOutcome::Approved));
    assert_eq!(report.exit_status(), ExitStatus::Failure);
}
