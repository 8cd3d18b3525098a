//! Workflow event stream.
//!
//! Emits [`WorkflowEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (the coordinator's tagged output, tests) can follow progress
//! without coupling to engine internals.

use serde::{Deserialize, Serialize};
use warden_types::{InstanceId, Node};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        instance: InstanceId,
        node: Node,
        resumed: bool,
    },
    StageStarted {
        instance: InstanceId,
        node: Node,
    },
    StageCompleted {
        instance: InstanceId,
        node: Node,
        next: String,
        reason: String,
        duration_ms: u64,
    },
    CheckpointSaved {
        instance: InstanceId,
        node: Node,
        written: bool,
    },
    Escalated {
        instance: InstanceId,
        node: Node,
        reason: String,
    },
    RunFinished {
        instance: InstanceId,
        outcome: String,
        reason: String,
    },
    LeaseAcquired {
        instance: InstanceId,
        credential_id: String,
    },
    LeaseReleased {
        instance: InstanceId,
        credential_id: String,
    },
    UnitDrained {
        instance: InstanceId,
    },
}

impl WorkflowEvent {
    pub fn instance(&self) -> &InstanceId {
        match self {
            WorkflowEvent::RunStarted { instance, .. }
            | WorkflowEvent::StageStarted { instance, .. }
            | WorkflowEvent::StageCompleted { instance, .. }
            | WorkflowEvent::CheckpointSaved { instance, .. }
            | WorkflowEvent::Escalated { instance, .. }
            | WorkflowEvent::RunFinished { instance, .. }
            | WorkflowEvent::LeaseAcquired { instance, .. }
            | WorkflowEvent::LeaseReleased { instance, .. }
            | WorkflowEvent::UnitDrained { instance } => instance,
        }
    }

    /// One-line human description, without the instance tag.
    pub fn message(&self) -> String {
        match self {
            WorkflowEvent::RunStarted { node, resumed, .. } => {
                if *resumed {
                    format!("resuming at {node}")
                } else {
                    format!("starting at {node}")
                }
            }
            WorkflowEvent::StageStarted { node, .. } => format!("{node}: started"),
            WorkflowEvent::StageCompleted {
                node, next, reason, ..
            } => format!("{node} -> {next} ({reason})"),
            WorkflowEvent::CheckpointSaved { node, written, .. } => {
                if *written {
                    format!("checkpoint saved at {node}")
                } else {
                    format!("checkpoint unchanged at {node}")
                }
            }
            WorkflowEvent::Escalated { node, reason, .. } => {
                format!("escalated from {node}: {reason}")
            }
            WorkflowEvent::RunFinished {
                outcome, reason, ..
            } => format!("{outcome}: {reason}"),
            WorkflowEvent::LeaseAcquired { credential_id, .. } => {
                format!("leased credential {credential_id}")
            }
            WorkflowEvent::LeaseReleased { credential_id, .. } => {
                format!("released credential {credential_id}")
            }
            WorkflowEvent::UnitDrained { .. } => "drained before start".to_string(),
        }
    }
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<WorkflowEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}
