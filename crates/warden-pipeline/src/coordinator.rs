//! Parallel execution coordinator.
//!
//! Runs many engine instances under two bounds: a worker cap and the
//! credential pool. Every instance holds one lease for its whole run.
//! Cancellation drains units that have not started and lets in-flight
//! units stop at their next checkpoint.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use warden_types::{CredentialLease, ExitStatus, InstanceId, Result, WardenError};

use crate::credentials::CredentialPool;
use crate::engine::{PlannedRun, RunMode, RunReport, WorkUnit, WorkflowEngine};
use crate::events::WorkflowEvent;

/// Hard cap on concurrently running instances.
pub const MAX_WORKERS: usize = 10;

/// Clamp a requested parallelism into `1..=MAX_WORKERS`.
pub fn clamp_workers(requested: usize) -> usize {
    requested.clamp(1, MAX_WORKERS)
}

// ---------------------------------------------------------------------------
// TaggedOutput
// ---------------------------------------------------------------------------

/// Line-oriented output shared by concurrent instances.
///
/// Each call writes all of its lines with a single `write_all` while holding
/// the lock, so lines from different instances never interleave.
pub struct TaggedOutput {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl TaggedOutput {
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn line(&self, instance: &InstanceId, message: &str) {
        let mut buf = String::new();
        for line in message.lines() {
            buf.push_str(&format!("[{instance}] {line}\n"));
        }
        if buf.is_empty() {
            buf = format!("[{instance}]\n");
        }
        let mut sink = self.sink.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = sink.write_all(buf.as_bytes()).and_then(|_| sink.flush()) {
            tracing::warn!(error = %e, "Failed to write progress line");
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UnitResult {
    Finished(RunReport),
    Failed { error: String, exit_code: i32 },
    /// Cancelled before it started.
    Drained,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitOutcome {
    pub work_unit: String,
    pub instance: InstanceId,
    #[serde(flatten)]
    pub result: UnitResult,
}

impl UnitOutcome {
    pub fn exit_status(&self) -> ExitStatus {
        match &self.result {
            UnitResult::Finished(report) => report.exit_status(),
            UnitResult::Failed { exit_code, .. } => match exit_code {
                3 => ExitStatus::FailClosed,
                2 => ExitStatus::HumanAttention,
                _ => ExitStatus::Failure,
            },
            UnitResult::Drained => ExitStatus::HumanAttention,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorReport {
    pub workers: usize,
    pub units: Vec<UnitOutcome>,
    pub leases: Vec<CredentialLease>,
    pub peak_leases: usize,
}

impl CoordinatorReport {
    /// Worst status across all units.
    pub fn exit_status(&self) -> ExitStatus {
        self.units
            .iter()
            .map(UnitOutcome::exit_status)
            .max()
            .unwrap_or(ExitStatus::Completed)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    engine: Arc<WorkflowEngine>,
    pool: Arc<CredentialPool>,
    workers: usize,
    output: Arc<TaggedOutput>,
}

impl Coordinator {
    pub fn new(engine: Arc<WorkflowEngine>, pool: Arc<CredentialPool>, workers: usize) -> Self {
        let clamped = clamp_workers(workers);
        if clamped != workers {
            tracing::warn!(requested = workers, workers = clamped, "Parallelism clamped");
        }
        Self {
            engine,
            pool,
            workers: clamped,
            output: Arc::new(TaggedOutput::stdout()),
        }
    }

    pub fn with_output(mut self, output: Arc<TaggedOutput>) -> Self {
        self.output = output;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Enumerate what [`run`](Self::run) would dispatch. Acquires no leases
    /// and writes nothing.
    pub async fn plan(&self, units: &[WorkUnit], mode: RunMode) -> Result<Vec<PlannedRun>> {
        ensure_distinct(units)?;
        let mut planned = Vec::with_capacity(units.len());
        for unit in units {
            planned.push(self.engine.plan(unit, mode).await?);
        }
        Ok(planned)
    }

    /// Run every unit to an outcome.
    ///
    /// Fails before dispatching anything if two units share an instance id.
    pub async fn run(
        &self,
        units: Vec<WorkUnit>,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<CoordinatorReport> {
        ensure_distinct(&units)?;
        tracing::info!(
            units = units.len(),
            workers = self.workers,
            credentials = self.pool.size(),
            "Dispatching work units"
        );

        let stop_forwarding = CancellationToken::new();
        let forwarder = tokio::spawn(forward_events(
            self.engine.events().subscribe(),
            Arc::clone(&self.output),
            stop_forwarding.clone(),
        ));

        let slots = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let count = units.len();
        let mut names = Vec::with_capacity(count);

        for (index, unit) in units.into_iter().enumerate() {
            names.push((unit.reference.clone(), unit.id.clone()));
            let engine = Arc::clone(&self.engine);
            let pool = Arc::clone(&self.pool);
            let slots = Arc::clone(&slots);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = run_unit(engine, pool, slots, &unit, mode, &cancel).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<UnitResult>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!(error = %e, "Worker task failed"),
            }
        }

        stop_forwarding.cancel();
        let _ = forwarder.await;

        let units: Vec<UnitOutcome> = names
            .into_iter()
            .zip(results)
            .map(|((work_unit, instance), result)| {
                let result = result.unwrap_or_else(|| UnitResult::Failed {
                    error: "worker task panicked".into(),
                    exit_code: ExitStatus::Failure.code(),
                });
                if let UnitResult::Failed { error, .. } = &result {
                    self.output.line(&instance, &format!("failed: {error}"));
                }
                UnitOutcome {
                    work_unit,
                    instance,
                    result,
                }
            })
            .collect();

        Ok(CoordinatorReport {
            workers: self.workers,
            units,
            leases: self.pool.lease_log(),
            peak_leases: self.pool.peak(),
        })
    }
}

/// Every instance owns its checkpoint record, so two units may not share an id.
fn ensure_distinct(units: &[WorkUnit]) -> Result<()> {
    let mut seen: HashMap<&InstanceId, &str> = HashMap::with_capacity(units.len());
    for unit in units {
        if let Some(first) = seen.insert(&unit.id, &unit.reference) {
            return Err(WardenError::InvalidWorkUnit {
                work_unit: unit.reference.clone(),
                message: format!("resolves to instance '{}', same as '{first}'", unit.id),
            });
        }
    }
    Ok(())
}

async fn run_unit(
    engine: Arc<WorkflowEngine>,
    pool: Arc<CredentialPool>,
    slots: Arc<Semaphore>,
    unit: &WorkUnit,
    mode: RunMode,
    cancel: &CancellationToken,
) -> UnitResult {
    let events = engine.events();
    let drained = || {
        tracing::info!(instance = %unit.id, "Drained before start");
        events.emit(WorkflowEvent::UnitDrained {
            instance: unit.id.clone(),
        });
        UnitResult::Drained
    };

    let _slot = tokio::select! {
        biased;
        _ = cancel.cancelled() => return drained(),
        slot = slots.acquire_owned() => match slot {
            Ok(slot) => slot,
            Err(_) => return drained(),
        },
    };
    // Backpressure: a unit without a credential does not start.
    let lease = tokio::select! {
        biased;
        _ = cancel.cancelled() => return drained(),
        lease = pool.acquire(&unit.id) => lease,
    };
    let lease = match lease {
        Ok(lease) => lease,
        Err(e) => {
            tracing::error!(instance = %unit.id, error = %e, "Could not lease a credential");
            return UnitResult::Failed {
                exit_code: e.exit_status().code(),
                error: e.to_string(),
            };
        }
    };
    let credential_id = lease.credential_id().to_string();
    events.emit(WorkflowEvent::LeaseAcquired {
        instance: unit.id.clone(),
        credential_id: credential_id.clone(),
    });

    let result = engine
        .run(unit, mode, &lease.env(), &cancel.child_token())
        .await;

    drop(lease);
    events.emit(WorkflowEvent::LeaseReleased {
        instance: unit.id.clone(),
        credential_id,
    });

    match result {
        Ok(report) => UnitResult::Finished(report),
        Err(e) => {
            tracing::error!(instance = %unit.id, error = %e, "Instance failed");
            UnitResult::Failed {
                exit_code: e.exit_status().code(),
                error: e.to_string(),
            }
        }
    }
}

async fn forward_events(
    mut rx: tokio::sync::broadcast::Receiver<WorkflowEvent>,
    output: Arc<TaggedOutput>,
    stop: CancellationToken,
) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Ok(event) => output.line(event.instance(), &event.message()),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Progress output lagged"),
                Err(RecvError::Closed) => return,
            },
            _ = stop.cancelled() => return,
        }
    }
}
