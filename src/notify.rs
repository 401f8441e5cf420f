//! Outbound events for the notification collaborator.
//!
//! The engine never depends on delivery: every call goes through [`dispatch`],
//! which logs and swallows failures.

use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::stats::RunStats;

#[derive(Error, Debug)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// One candidate successor offered when a step has several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextStepOption {
    pub step_id: Uuid,
    pub name: String,
    pub assignee: Option<Uuid>,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskCreated {
        task: Uuid,
        definition: Uuid,
        definition_name: String,
        client: Uuid,
        deadline: NaiveDate,
    },
    GenerationCompleted {
        stats: RunStats,
    },
    GenerationError {
        message: String,
    },
    ApprovalNeeded {
        task: Uuid,
        step: Uuid,
        approvers: Vec<Uuid>,
    },
    ApprovalRecorded {
        task: Uuid,
        step: Uuid,
        approver: Uuid,
        approved: bool,
    },
    ManualAdvanceNeeded {
        task: Uuid,
        step: Uuid,
        options: Vec<NextStepOption>,
    },
    StepReady {
        task: Uuid,
        step: Uuid,
        assignee: Option<Uuid>,
    },
    StepCompleted {
        task: Uuid,
        step: Uuid,
        actor: Option<Uuid>,
    },
    WorkflowCompleted {
        task: Uuid,
        /// Final step of the workflow.
        step: Uuid,
        actor: Option<Uuid>,
    },
    ObligationPruned {
        task: Uuid,
        assignee: Option<Uuid>,
        deadline: Option<NaiveDate>,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::TaskCreated { .. } => "task_created",
            EngineEvent::GenerationCompleted { .. } => "generation_completed",
            EngineEvent::GenerationError { .. } => "generation_error",
            EngineEvent::ApprovalNeeded { .. } => "approval_needed",
            EngineEvent::ApprovalRecorded { .. } => "approval_recorded",
            EngineEvent::ManualAdvanceNeeded { .. } => "manual_advance_needed",
            EngineEvent::StepReady { .. } => "step_ready",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::WorkflowCompleted { .. } => "workflow_completed",
            EngineEvent::ObligationPruned { .. } => "obligation_pruned",
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &EngineEvent) -> Result<(), NotifyError>;
}

/// Sends `event`, logging instead of propagating delivery failures.
pub fn dispatch(notifier: &dyn Notifier, event: EngineEvent) {
    if let Err(e) = notifier.notify(&event) {
        warn!("Dropping '{}' notification: {}", event.kind(), e);
    }
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: &EngineEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Writes every event to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &EngineEvent) -> Result<(), NotifyError> {
        match event {
            EngineEvent::GenerationCompleted { stats } => info!("{}", stats.summary()),
            EngineEvent::GenerationError { message } => warn!("Generation error: {}", message),
            other => debug!("{}: {:?}", other.kind(), other),
        }
        Ok(())
    }
}

/// Keeps every event in memory; useful for callers that batch deliveries.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &EngineEvent) -> Result<(), NotifyError> {
        self.events
            .lock()
            .map_err(|_| NotifyError("recording buffer poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingNotifier;

    impl Notifier for FailingNotifier {
        fn notify(&self, _event: &EngineEvent) -> Result<(), NotifyError> {
            Err(NotifyError("smtp unreachable".to_string()))
        }
    }

    #[test]
    fn test_dispatch_swallows_delivery_failures() {
        dispatch(
            &FailingNotifier,
            EngineEvent::GenerationError {
                message: "boom".to_string(),
            },
        );
    }

    #[test]
    fn test_recording_notifier_counts_by_kind() {
        let notifier = RecordingNotifier::new();
        let task = Uuid::new_v4();
        dispatch(
            &notifier,
            EngineEvent::WorkflowCompleted {
                task,
                step: Uuid::new_v4(),
                actor: None,
            },
        );
        dispatch(
            &notifier,
            EngineEvent::StepCompleted {
                task,
                step: Uuid::new_v4(),
                actor: None,
            },
        );

        assert_eq!(notifier.count("workflow_completed"), 1);
        assert_eq!(notifier.count("step_completed"), 1);
        assert_eq!(notifier.events().len(), 2);

        notifier.clear();
        assert!(notifier.events().is_empty());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = EngineEvent::GenerationError {
            message: "bad template".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"generation_error\""));
    }
}
