//! Workflow advancement state machine.
//!
//! A task is either outside any workflow, at exactly one step of its workflow,
//! or done with it. The step pointer on the task is the only mutable workflow
//! state; every transition appends exactly one history entry, and the pointer
//! only moves through [`TaskStore::compare_and_set_step`] so concurrent
//! completions of the same step cannot both advance.
//!
//! Waiting for an approval or for a manual choice between several successors
//! are ordinary outcomes ([`AdvanceOutcome`]), not errors. The caller re-invokes
//! [`WorkflowEngine::advance`] once the missing input exists.

use crate::error::{EngineError, Result};
use crate::notify::{dispatch, EngineEvent, NextStepOption, Notifier};
use crate::progress::{reconstruct_progress, WorkflowProgress};
use crate::schema::{
    HistoryAction, ObligationCatalog, Task, TaskApproval, TaskStatus, WorkflowDefinition,
    WorkflowHistoryEntry, WorkflowStep,
};
use crate::store::TaskStore;
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Steps of one workflow stored flat, with successor lists keyed by step id.
pub struct WorkflowGraph<'a> {
    definition: &'a WorkflowDefinition,
    index: HashMap<Uuid, usize>,
    successors: HashMap<Uuid, Vec<Uuid>>,
}

impl<'a> WorkflowGraph<'a> {
    /// Validates the definition: unique step ids and orders, edges inside the
    /// workflow, and no cycles.
    pub fn build(definition: &'a WorkflowDefinition) -> Result<Self> {
        let invalid = |details: String| EngineError::InvalidWorkflow {
            workflow: definition.name.clone(),
            details,
        };

        let mut index = HashMap::new();
        let mut orders = HashSet::new();
        for (position, step) in definition.steps.iter().enumerate() {
            if index.insert(step.id, position).is_some() {
                return Err(invalid(format!("duplicate step id {}", step.id)));
            }
            if !orders.insert(step.order) {
                return Err(invalid(format!("duplicate step order {}", step.order)));
            }
        }

        let mut successors: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for edge in &definition.transitions {
            if !index.contains_key(&edge.from) || !index.contains_key(&edge.to) {
                return Err(invalid(format!(
                    "transition {} -> {} leaves the workflow",
                    edge.from, edge.to
                )));
            }
            let targets = successors.entry(edge.from).or_default();
            if !targets.contains(&edge.to) {
                targets.push(edge.to);
            }
        }

        for targets in successors.values_mut() {
            targets.sort_by_key(|id| definition.steps[index[id]].order);
        }

        let graph = Self {
            definition,
            index,
            successors,
        };

        if graph.has_cycle() {
            return Err(invalid("transitions form a cycle".to_string()));
        }

        Ok(graph)
    }

    fn has_cycle(&self) -> bool {
        let mut in_degree: HashMap<Uuid, usize> =
            self.definition.steps.iter().map(|s| (s.id, 0)).collect();
        for targets in self.successors.values() {
            for target in targets {
                *in_degree.entry(*target).or_default() += 1;
            }
        }

        let mut queue: VecDeque<Uuid> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for target in self.successors(id) {
                if let Some(degree) = in_degree.get_mut(target) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*target);
                    }
                }
            }
        }

        visited != self.definition.steps.len()
    }

    pub fn definition(&self) -> &'a WorkflowDefinition {
        self.definition
    }

    pub fn len(&self) -> usize {
        self.definition.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.steps.is_empty()
    }

    pub fn step(&self, id: Uuid) -> Option<&'a WorkflowStep> {
        let definition = self.definition;
        self.index.get(&id).map(|&i| &definition.steps[i])
    }

    /// Step with the lowest order.
    pub fn first_step(&self) -> Option<&'a WorkflowStep> {
        self.definition.steps.iter().min_by_key(|s| s.order)
    }

    /// Successors of a step, ordered by step order.
    pub fn successors(&self, id: Uuid) -> &[Uuid] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn steps_by_order(&self) -> Vec<&'a WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> = self.definition.steps.iter().collect();
        steps.sort_by_key(|s| s.order);
        steps
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkflowState {
    NoWorkflow,
    AtStep { step: Uuid },
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    Advanced {
        from: Uuid,
        to: Uuid,
    },
    Completed {
        from: Uuid,
    },
    /// The step needs an approval that has not been granted yet.
    AwaitingApproval {
        step: Uuid,
        approvers: Vec<Uuid>,
    },
    /// The step has several successors and no choice was given.
    AwaitingManualChoice {
        step: Uuid,
        options: Vec<NextStepOption>,
    },
    /// The task already left the step, e.g. a retried or concurrent request.
    AlreadyAdvanced {
        current: Option<Uuid>,
    },
}

pub struct WorkflowEngine<'a> {
    catalog: &'a ObligationCatalog,
    store: &'a dyn TaskStore,
    notifier: &'a dyn Notifier,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(
        catalog: &'a ObligationCatalog,
        store: &'a dyn TaskStore,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            catalog,
            store,
            notifier,
        }
    }

    pub fn graph(&self, workflow: Uuid) -> Result<WorkflowGraph<'a>> {
        let definition = self.catalog.workflow(workflow).ok_or(EngineError::NotFound {
            entity: "Workflow",
            id: workflow,
        })?;
        WorkflowGraph::build(definition)
    }

    fn graph_for(&self, task: &Task) -> Result<WorkflowGraph<'a>> {
        let workflow = task.workflow.ok_or_else(|| {
            EngineError::InvalidInput(format!("task {} has no workflow", task.id))
        })?;
        self.graph(workflow)
    }

    fn step_in<'g>(&self, graph: &WorkflowGraph<'g>, step: Uuid) -> Result<&'g WorkflowStep> {
        graph.step(step).ok_or(EngineError::NotFound {
            entity: "WorkflowStep",
            id: step,
        })
    }

    /// Puts `task` on the first step of `workflow` and records the assignment.
    ///
    /// Returns the starting step, or `None` when the workflow has no steps (the
    /// task is left untouched).
    pub fn attach_workflow(
        &self,
        task: &mut Task,
        workflow: Uuid,
        actor: Option<Uuid>,
    ) -> Result<Option<Uuid>> {
        let graph = self.graph(workflow)?;
        let Some(first) = graph.first_step() else {
            return Ok(None);
        };

        if !self
            .store
            .compare_and_set_step(task.id, task.current_workflow_step, Some(first.id))?
        {
            return Err(EngineError::StepMismatch {
                task: task.id,
                step: first.id,
            });
        }
        self.store.set_workflow(task.id, Some(workflow))?;
        task.workflow = Some(workflow);
        task.current_workflow_step = Some(first.id);

        self.store.append_history(
            WorkflowHistoryEntry::new(task.id, HistoryAction::WorkflowAssigned, actor)
                .to_step(Some(first.id))
                .comment(format!("Workflow '{}' assigned", graph.definition().name)),
        )?;

        dispatch(
            self.notifier,
            EngineEvent::StepReady {
                task: task.id,
                step: first.id,
                assignee: first.assign_to.or(task.assigned_to),
            },
        );

        Ok(Some(first.id))
    }

    pub fn start_step(
        &self,
        task_id: Uuid,
        step: Uuid,
        actor: Option<Uuid>,
        comment: &str,
    ) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        let graph = self.graph_for(&task)?;
        self.step_in(&graph, step)?;

        if task.current_workflow_step != Some(step) {
            return Err(EngineError::StepMismatch {
                task: task_id,
                step,
            });
        }

        self.store.append_history(
            WorkflowHistoryEntry::new(task_id, HistoryAction::StepStarted, actor)
                .from_step(Some(step))
                .comment(comment),
        )?;

        self.store
            .compare_and_set_status(task_id, TaskStatus::Pending, TaskStatus::InProgress)?;
        Ok(())
    }

    pub fn log_work(
        &self,
        task_id: Uuid,
        step: Uuid,
        actor: Option<Uuid>,
        comment: &str,
        time_spent_minutes: Option<u32>,
    ) -> Result<()> {
        let task = self.store.get_task(task_id)?;
        let graph = self.graph_for(&task)?;
        self.step_in(&graph, step)?;

        self.store.append_history(
            WorkflowHistoryEntry::new(task_id, HistoryAction::StepWorkLogged, actor)
                .from_step(Some(step))
                .comment(comment)
                .time_spent(time_spent_minutes),
        )
    }

    /// Records an approval decision. The approver must hold the step's approver role.
    pub fn record_approval(
        &self,
        task_id: Uuid,
        step: Uuid,
        approver: Uuid,
        approved: bool,
        comment: &str,
    ) -> Result<TaskApproval> {
        let task = self.store.get_task(task_id)?;
        let graph = self.graph_for(&task)?;
        let workflow_step = self.step_in(&graph, step)?;

        let user = self.catalog.user(approver).ok_or(EngineError::NotFound {
            entity: "User",
            id: approver,
        })?;
        if let Some(role) = &workflow_step.approver_role {
            if !user.has_role(role) {
                return Err(EngineError::NotAuthorized {
                    user: approver,
                    step,
                    role: role.clone(),
                });
            }
        }

        let approval = TaskApproval {
            task: task_id,
            workflow_step: step,
            approver,
            approved,
            comment: comment.to_string(),
            decided_at: Utc::now(),
        };
        self.store.upsert_approval(approval.clone())?;

        let action = if approved {
            HistoryAction::StepApproved
        } else {
            HistoryAction::StepRejected
        };
        self.store.append_history(
            WorkflowHistoryEntry::new(task_id, action, Some(approver))
                .from_step(Some(step))
                .comment(comment),
        )?;

        dispatch(
            self.notifier,
            EngineEvent::ApprovalRecorded {
                task: task_id,
                step,
                approver,
                approved,
            },
        );

        Ok(approval)
    }

    /// Moves `task_id` past `completed_step`.
    pub fn advance(
        &self,
        task_id: Uuid,
        completed_step: Uuid,
        actor: Option<Uuid>,
        comment: &str,
        manual_next_step: Option<Uuid>,
    ) -> Result<AdvanceOutcome> {
        let task = self.store.get_task(task_id)?;
        let graph = self.graph_for(&task)?;
        let step = self.step_in(&graph, completed_step)?;

        if task.current_workflow_step != Some(completed_step) {
            return self.already_left(&task, &graph, completed_step);
        }

        if step.requires_approval {
            let approvals = self.store.approvals_for(task_id, completed_step)?;
            if !approvals.iter().any(|a| a.approved) {
                let approvers: Vec<Uuid> = step
                    .approver_role
                    .as_deref()
                    .map(|role| self.catalog.users_with_role(role))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|u| u.id)
                    .collect();

                debug!("Task {} awaits approval of step '{}'", task_id, step.name);
                dispatch(
                    self.notifier,
                    EngineEvent::ApprovalNeeded {
                        task: task_id,
                        step: completed_step,
                        approvers: approvers.clone(),
                    },
                );
                return Ok(AdvanceOutcome::AwaitingApproval {
                    step: completed_step,
                    approvers,
                });
            }
        }

        let successors = graph.successors(completed_step);
        let next = match (successors, manual_next_step) {
            ([], _) => return self.complete_workflow(&task, completed_step, actor, comment),
            (candidates, Some(choice)) => {
                if !candidates.contains(&choice) {
                    return Err(EngineError::InvalidInput(format!(
                        "step {} is not a successor of '{}'",
                        choice, step.name
                    )));
                }
                choice
            }
            ([only], None) => *only,
            (candidates, None) => {
                let options: Vec<NextStepOption> = candidates
                    .iter()
                    .filter_map(|id| graph.step(*id))
                    .map(|s| NextStepOption {
                        step_id: s.id,
                        name: s.name.clone(),
                        assignee: s.assign_to,
                        requires_approval: s.requires_approval,
                    })
                    .collect();

                debug!(
                    "Task {} needs a manual choice among {} next steps",
                    task_id,
                    options.len()
                );
                dispatch(
                    self.notifier,
                    EngineEvent::ManualAdvanceNeeded {
                        task: task_id,
                        step: completed_step,
                        options: options.clone(),
                    },
                );
                return Ok(AdvanceOutcome::AwaitingManualChoice {
                    step: completed_step,
                    options,
                });
            }
        };

        self.move_to(&task, &graph, completed_step, next, actor, comment)
    }

    fn move_to(
        &self,
        task: &Task,
        graph: &WorkflowGraph<'_>,
        from: Uuid,
        to: Uuid,
        actor: Option<Uuid>,
        comment: &str,
    ) -> Result<AdvanceOutcome> {
        if !self
            .store
            .compare_and_set_step(task.id, Some(from), Some(to))?
        {
            return self.lost_race(task.id);
        }

        self.store.append_history(
            WorkflowHistoryEntry::new(task.id, HistoryAction::StepAdvanced, actor)
                .from_step(Some(from))
                .to_step(Some(to))
                .comment(comment),
        )?;

        let next_step = graph.step(to);
        let assignee = next_step.and_then(|s| s.assign_to);

        if let Some(user) = assignee {
            self.store.reassign(task.id, Some(user))?;
        }
        self.store
            .compare_and_set_status(task.id, TaskStatus::Pending, TaskStatus::InProgress)?;

        info!(
            "Task {} advanced to step '{}'",
            task.id,
            next_step.map(|s| s.name.as_str()).unwrap_or("?")
        );

        dispatch(
            self.notifier,
            EngineEvent::StepReady {
                task: task.id,
                step: to,
                assignee: assignee.or(task.assigned_to),
            },
        );
        dispatch(
            self.notifier,
            EngineEvent::StepCompleted {
                task: task.id,
                step: from,
                actor,
            },
        );

        Ok(AdvanceOutcome::Advanced { from, to })
    }

    fn complete_workflow(
        &self,
        task: &Task,
        from: Uuid,
        actor: Option<Uuid>,
        comment: &str,
    ) -> Result<AdvanceOutcome> {
        if !self.store.compare_and_set_step(task.id, Some(from), None)? {
            return self.lost_race(task.id);
        }

        if task.status != TaskStatus::Completed {
            self.store
                .update_status(task.id, TaskStatus::Completed, Some(Utc::now()))?;
        }

        self.store.append_history(
            WorkflowHistoryEntry::new(task.id, HistoryAction::WorkflowCompleted, actor)
                .from_step(Some(from))
                .comment(comment),
        )?;

        info!("Task {} completed its workflow", task.id);
        dispatch(
            self.notifier,
            EngineEvent::WorkflowCompleted {
                task: task.id,
                step: from,
                actor,
            },
        );

        Ok(AdvanceOutcome::Completed { from })
    }

    /// Another request moved the pointer between our read and our swap.
    fn lost_race(&self, task_id: Uuid) -> Result<AdvanceOutcome> {
        let current = self.store.get_task(task_id)?.current_workflow_step;
        debug!("Task {} was advanced concurrently", task_id);
        Ok(AdvanceOutcome::AlreadyAdvanced { current })
    }

    /// Outcome for a request about a step the task is no longer on.
    fn already_left(
        &self,
        task: &Task,
        graph: &WorkflowGraph<'_>,
        step: Uuid,
    ) -> Result<AdvanceOutcome> {
        let successors = graph.successors(step);
        // The pointer moves before the history entry is written.
        let moved_on = match task.current_workflow_step {
            Some(current) => successors.contains(&current),
            None => successors.is_empty(),
        };

        let left = moved_on
            || self.store.history_for_task(task.id)?.iter().any(|e| {
                matches!(
                    e.action,
                    HistoryAction::StepAdvanced | HistoryAction::WorkflowCompleted
                ) && e.from_step == Some(step)
            });

        if left {
            debug!("Task {} already left step {}", task.id, step);
            Ok(AdvanceOutcome::AlreadyAdvanced {
                current: task.current_workflow_step,
            })
        } else {
            Err(EngineError::StepMismatch {
                task: task.id,
                step,
            })
        }
    }

    /// Logs the completion of `step` and advances. A retried call finds the
    /// completion already logged and goes straight to [`Self::advance`].
    pub fn complete_step_and_advance(
        &self,
        task_id: Uuid,
        step: Uuid,
        actor: Option<Uuid>,
        comment: &str,
        time_spent_minutes: Option<u32>,
    ) -> Result<AdvanceOutcome> {
        let task = self.store.get_task(task_id)?;
        let graph = self.graph_for(&task)?;
        self.step_in(&graph, step)?;

        let history = self.store.history_for_task(task_id)?;
        let already_completed = history.iter().any(|e| {
            matches!(
                e.action,
                HistoryAction::StepCompleted
                    | HistoryAction::StepAdvanced
                    | HistoryAction::WorkflowCompleted
            ) && e.from_step == Some(step)
        });

        if !already_completed {
            if task.current_workflow_step != Some(step) {
                return Err(EngineError::StepMismatch {
                    task: task_id,
                    step,
                });
            }

            self.store.append_history(
                WorkflowHistoryEntry::new(task_id, HistoryAction::StepCompleted, actor)
                    .from_step(Some(step))
                    .comment(comment)
                    .time_spent(time_spent_minutes),
            )?;
            dispatch(
                self.notifier,
                EngineEvent::StepCompleted {
                    task: task_id,
                    step,
                    actor,
                },
            );
        }

        self.advance(task_id, step, actor, comment, None)
    }

    pub fn progress(&self, task_id: Uuid) -> Result<WorkflowProgress> {
        let task = self.store.get_task(task_id)?;
        if task.workflow.is_none() {
            return Ok(WorkflowProgress::default());
        }

        let graph = self.graph_for(&task)?;
        let history = self.store.history_for_task(task_id)?;
        Ok(reconstruct_progress(
            &graph,
            &history,
            task.current_workflow_step,
        ))
    }

    pub fn state(&self, task_id: Uuid) -> Result<WorkflowState> {
        let task = self.store.get_task(task_id)?;
        if task.workflow.is_none() {
            return Ok(WorkflowState::NoWorkflow);
        }
        if let Some(step) = task.current_workflow_step {
            return Ok(WorkflowState::AtStep { step });
        }

        let progress = self.progress(task_id)?;
        Ok(if progress.is_completed {
            WorkflowState::Completed
        } else {
            WorkflowState::NoWorkflow
        })
    }
}
