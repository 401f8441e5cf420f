//! Persistence port for tasks, workflow history and approvals.
//!
//! Implementations must enforce two invariants themselves:
//!
//! - `(client, source_fiscal_obligation, obligation_period_key)` is unique;
//!   a colliding insert fails with [`EngineError::DuplicateTask`].
//! - `compare_and_set_step` changes the current workflow step atomically, so
//!   two concurrent advances of the same task cannot both succeed. It is the
//!   only operation that writes the step pointer.
//!
//! [`InMemoryStore`] is the reference implementation.

use crate::error::{EngineError, Result};
use crate::schema::{Task, TaskApproval, TaskStatus, WorkflowHistoryEntry};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub organization: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub source_fiscal_obligation: Option<Uuid>,
    pub obligations_only: bool,
    pub deadline_before: Option<NaiveDate>,
}

impl TaskFilter {
    pub fn obligations() -> Self {
        Self {
            obligations_only: true,
            ..Default::default()
        }
    }

    pub fn organization(mut self, organization: Option<Uuid>) -> Self {
        self.organization = organization;
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn deadline_before(mut self, date: NaiveDate) -> Self {
        self.deadline_before = Some(date);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if self.obligations_only && !task.is_obligation() {
            return false;
        }
        if self.organization.is_some_and(|org| task.organization != org) {
            return false;
        }
        if self.status.is_some_and(|status| task.status != status) {
            return false;
        }
        if self
            .source_fiscal_obligation
            .is_some_and(|def| task.source_fiscal_obligation != Some(def))
        {
            return false;
        }
        if let Some(limit) = self.deadline_before {
            if !task.deadline.is_some_and(|d| d < limit) {
                return false;
            }
        }
        true
    }
}

pub trait TaskStore: Send + Sync {
    fn find_by_obligation_key(
        &self,
        client: Uuid,
        definition: Uuid,
        period_key: &str,
    ) -> Result<Option<Task>>;

    /// Inserts a new task, rejecting duplicates of the obligation key.
    fn insert_task(&self, task: Task) -> Result<Task>;

    fn get_task(&self, id: Uuid) -> Result<Task>;

    fn set_workflow(&self, id: Uuid, workflow: Option<Uuid>) -> Result<()>;

    fn reassign(&self, id: Uuid, assignee: Option<Uuid>) -> Result<()>;

    fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Sets the status to `next` only if it is still `expected`.
    fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool>;

    /// Sets the current workflow step to `next` only if it is still `expected`.
    /// Returns whether the swap happened.
    fn compare_and_set_step(
        &self,
        id: Uuid,
        expected: Option<Uuid>,
        next: Option<Uuid>,
    ) -> Result<bool>;

    fn delete_task(&self, id: Uuid) -> Result<()>;

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    fn append_history(&self, entry: WorkflowHistoryEntry) -> Result<()>;

    /// History of a task in insertion order.
    fn history_for_task(&self, task: Uuid) -> Result<Vec<WorkflowHistoryEntry>>;

    /// Records a decision, replacing an earlier one by the same approver for the same step.
    fn upsert_approval(&self, approval: TaskApproval) -> Result<()>;

    fn approvals_for(&self, task: Uuid, step: Uuid) -> Result<Vec<TaskApproval>>;
}

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, Task>,
    obligation_keys: HashMap<(Uuid, Uuid, String), Uuid>,
    history: Vec<WorkflowHistoryEntry>,
    approvals: Vec<TaskApproval>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with [`EngineError::Storage`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn task_count(&self) -> usize {
        self.state.lock().map(|s| s.tasks.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("store unavailable".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| EngineError::Storage("store lock poisoned".to_string()))
    }
}

fn obligation_key(task: &Task) -> Option<(Uuid, Uuid, String)> {
    match (
        task.client,
        task.source_fiscal_obligation,
        task.obligation_period_key.as_ref(),
    ) {
        (Some(client), Some(definition), Some(key)) => Some((client, definition, key.clone())),
        _ => None,
    }
}

fn task_not_found(id: Uuid) -> EngineError {
    EngineError::NotFound { entity: "Task", id }
}

impl TaskStore for InMemoryStore {
    fn find_by_obligation_key(
        &self,
        client: Uuid,
        definition: Uuid,
        period_key: &str,
    ) -> Result<Option<Task>> {
        let state = self.lock()?;
        Ok(state
            .obligation_keys
            .get(&(client, definition, period_key.to_string()))
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }

    fn insert_task(&self, task: Task) -> Result<Task> {
        let mut state = self.lock()?;

        if let Some(key) = obligation_key(&task) {
            if state.obligation_keys.contains_key(&key) {
                let (client, definition, period_key) = key;
                return Err(EngineError::DuplicateTask {
                    client,
                    definition,
                    period_key,
                });
            }
            state.obligation_keys.insert(key, task.id);
        }

        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn get_task(&self, id: Uuid) -> Result<Task> {
        self.lock()?
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| task_not_found(id))
    }

    fn set_workflow(&self, id: Uuid, workflow: Option<Uuid>) -> Result<()> {
        let mut state = self.lock()?;
        let task = state.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;
        task.workflow = workflow;
        Ok(())
    }

    fn reassign(&self, id: Uuid, assignee: Option<Uuid>) -> Result<()> {
        let mut state = self.lock()?;
        let task = state.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;
        task.assigned_to = assignee;
        Ok(())
    }

    fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let task = state.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;
        task.status = status;
        task.completed_at = completed_at;
        Ok(())
    }

    fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let task = state.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;

        if task.status != expected {
            return Ok(false);
        }
        task.status = next;
        Ok(true)
    }

    fn compare_and_set_step(
        &self,
        id: Uuid,
        expected: Option<Uuid>,
        next: Option<Uuid>,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let task = state.tasks.get_mut(&id).ok_or_else(|| task_not_found(id))?;

        if task.current_workflow_step != expected {
            return Ok(false);
        }
        task.current_workflow_step = next;
        Ok(true)
    }

    fn delete_task(&self, id: Uuid) -> Result<()> {
        let mut state = self.lock()?;
        let task = state.tasks.remove(&id).ok_or_else(|| task_not_found(id))?;
        if let Some(key) = obligation_key(&task) {
            state.obligation_keys.remove(&key);
        }
        Ok(())
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let state = self.lock()?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.deadline.cmp(&b.deadline).then(a.title.cmp(&b.title)));
        Ok(tasks)
    }

    fn append_history(&self, entry: WorkflowHistoryEntry) -> Result<()> {
        self.lock()?.history.push(entry);
        Ok(())
    }

    fn history_for_task(&self, task: Uuid) -> Result<Vec<WorkflowHistoryEntry>> {
        Ok(self
            .lock()?
            .history
            .iter()
            .filter(|e| e.task == task)
            .cloned()
            .collect())
    }

    fn upsert_approval(&self, approval: TaskApproval) -> Result<()> {
        let mut state = self.lock()?;
        state.approvals.retain(|a| {
            !(a.task == approval.task
                && a.workflow_step == approval.workflow_step
                && a.approver == approval.approver)
        });
        state.approvals.push(approval);
        Ok(())
    }

    fn approvals_for(&self, task: Uuid, step: Uuid) -> Result<Vec<TaskApproval>> {
        Ok(self
            .lock()?
            .approvals
            .iter()
            .filter(|a| a.task == task && a.workflow_step == step)
            .cloned()
            .collect())
    }
}
