//! Workflow progress, derived from the append-only history.
//!
//! This is the only place progress is computed; reporting and the state machine
//! both call [`reconstruct_progress`] instead of storing a percentage.

use crate::schema::{HistoryAction, WorkflowHistoryEntry};
use crate::workflow::WorkflowGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub current_step: Option<Uuid>,
    /// Completed steps ordered by their position in the workflow.
    pub completed_steps: Vec<Uuid>,
    pub total_steps: usize,
    pub percentage: u8,
    pub is_completed: bool,
}

fn marks_step_done(entry: &WorkflowHistoryEntry) -> Option<Uuid> {
    match entry.action {
        HistoryAction::StepCompleted
        | HistoryAction::StepAdvanced
        | HistoryAction::WorkflowCompleted => entry.from_step,
        _ => None,
    }
}

/// Rebuilds progress from `history` (oldest first) and the task's step pointer.
///
/// When `current_step` is absent and the workflow has not completed, the current
/// step is the target of the latest assignment or advance in the history.
pub fn reconstruct_progress(
    graph: &WorkflowGraph<'_>,
    history: &[WorkflowHistoryEntry],
    current_step: Option<Uuid>,
) -> WorkflowProgress {
    let is_completed = history
        .iter()
        .any(|e| e.action == HistoryAction::WorkflowCompleted);

    let done: HashSet<Uuid> = history.iter().filter_map(marks_step_done).collect();
    let completed_steps: Vec<Uuid> = graph
        .steps_by_order()
        .into_iter()
        .map(|s| s.id)
        .filter(|id| done.contains(id))
        .collect();

    let current_step = if is_completed {
        None
    } else {
        current_step.or_else(|| {
            history
                .iter()
                .rev()
                .find(|e| {
                    matches!(
                        e.action,
                        HistoryAction::WorkflowAssigned | HistoryAction::StepAdvanced
                    ) && e.to_step.is_some()
                })
                .and_then(|e| e.to_step)
        })
    };

    let total_steps = graph.len();
    let percentage = if is_completed {
        100
    } else if total_steps == 0 {
        0
    } else {
        ((completed_steps.len() * 100) / total_steps).min(100) as u8
    };

    WorkflowProgress {
        current_step,
        completed_steps,
        total_steps,
        percentage,
        is_completed,
    }
}
