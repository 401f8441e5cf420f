use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Tag value that makes a definition apply to every client.
pub const ALL_CLIENTS_TAG: &str = "ALL";
/// Largest accepted `deadline_month_offset` (100 years).
pub const MAX_DEADLINE_MONTH_OFFSET: u32 = 1200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Periodicity {
    #[schemars(description = "One period per calendar month (e.g. monthly VAT return)")]
    Monthly,

    #[schemars(description = "Three-month blocks ending in March, June, September and December")]
    Quarterly,

    #[schemars(description = "One period per calendar year")]
    Annual,

    #[schemars(description = "Two semesters: January-June and July-December")]
    Biannual,

    #[schemars(
        description = "A single one-month period, fired only in the month named by specific_month_reference or by a known obligation rule"
    )]
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalculationBasis {
    #[schemars(description = "Deadline counted from the last day of the covered period")]
    EndOfPeriod,

    #[schemars(
        description = "Deadline counted from the 1st of specific_month_reference in the period's year"
    )]
    SpecificDate,

    #[schemars(description = "Created by external events only; never generated on a schedule")]
    EventDriven,
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObligationDefinition {
    pub id: Uuid,

    #[schemars(description = "Human readable obligation name (e.g. 'IVA Periódico')")]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    pub periodicity: Periodicity,

    pub calculation_basis: CalculationBasis,

    #[schemars(
        description = "Day of the month the obligation is due (1-31). Clamped to the last day of shorter months."
    )]
    pub deadline_day: u32,

    #[serde(default)]
    #[schemars(description = "Months added to the base month before applying deadline_day")]
    pub deadline_month_offset: u32,

    #[serde(default)]
    #[schemars(
        description = "Month (1-12) anchoring SPECIFIC_DATE annual deadlines, or the firing month of OTHER obligations"
    )]
    pub specific_month_reference: Option<u32>,

    #[serde(default)]
    #[schemars(
        description = "Client fiscal tags this obligation applies to. Empty or containing 'ALL' means every client."
    )]
    pub applies_to_client_tags: BTreeSet<String>,

    #[schemars(
        description = "Task title with {obligation_name}, {client_name}, {period_description}, {year}, {month_name}, {quarter} or {deadline} placeholders"
    )]
    pub title_template: String,

    #[serde(default)]
    pub description_template: Option<String>,

    #[serde(default)]
    pub default_priority: Priority,

    #[serde(default)]
    pub default_task_category: Option<String>,

    #[serde(default)]
    pub default_workflow: Option<Uuid>,

    #[serde(default)]
    #[schemars(description = "Days before the deadline from which the task is generated")]
    pub generation_trigger_offset_days: u32,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    #[schemars(description = "Owning organization. Absent for global definitions.")]
    pub organization: Option<Uuid>,
}

impl ObligationDefinition {
    pub fn new(name: impl Into<String>, periodicity: Periodicity) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            periodicity,
            calculation_basis: CalculationBasis::EndOfPeriod,
            deadline_day: 20,
            deadline_month_offset: 1,
            specific_month_reference: None,
            applies_to_client_tags: BTreeSet::new(),
            title_template: "{obligation_name} - {client_name} - {period_description}".to_string(),
            description_template: None,
            default_priority: Priority::Medium,
            default_task_category: None,
            default_workflow: None,
            generation_trigger_offset_days: 15,
            is_active: true,
            organization: None,
        }
    }

    pub fn is_global(&self) -> bool {
        self.organization.is_none()
    }

    pub fn applies_to_all_clients(&self) -> bool {
        self.applies_to_client_tags.is_empty()
            || self.applies_to_client_tags.contains(ALL_CLIENTS_TAG)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=31).contains(&self.deadline_day) {
            return Err(self.invalid(format!(
                "deadline_day {} must be between 1 and 31",
                self.deadline_day
            )));
        }

        if self.deadline_month_offset > MAX_DEADLINE_MONTH_OFFSET {
            return Err(self.invalid(format!(
                "deadline_month_offset {} must be at most {}",
                self.deadline_month_offset, MAX_DEADLINE_MONTH_OFFSET
            )));
        }

        if let Some(month) = self.specific_month_reference {
            if !(1..=12).contains(&month) {
                return Err(self.invalid(format!(
                    "specific_month_reference {} must be between 1 and 12",
                    month
                )));
            }
        }

        if self.periodicity == Periodicity::Annual
            && self.calculation_basis == CalculationBasis::SpecificDate
            && self.specific_month_reference.is_none()
        {
            return Err(self.invalid(
                "annual SPECIFIC_DATE obligations need a specific_month_reference".to_string(),
            ));
        }

        Ok(())
    }

    fn invalid(&self, details: String) -> EngineError {
        EngineError::InvalidDefinition {
            definition: self.name.clone(),
            details,
        }
    }
}

/// Per-organization generation settings. Missing values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OrganizationSettings {
    #[serde(default = "default_true")]
    #[schemars(description = "When false, scheduled runs skip this organization entirely")]
    pub auto_generation_enabled: bool,

    #[serde(default = "default_months_ahead")]
    #[schemars(description = "Months after the current one evaluated by scheduled runs")]
    pub months_ahead: u32,

    #[serde(default = "default_cleanup_threshold_days")]
    #[schemars(description = "Pending obligations this many days past their deadline are pruned")]
    pub cleanup_threshold_days: u32,

    #[serde(default)]
    #[schemars(description = "Prune stale obligations before each scheduled generation")]
    pub clean_old_first: bool,
}

impl Default for OrganizationSettings {
    fn default() -> Self {
        Self {
            auto_generation_enabled: true,
            months_ahead: default_months_ahead(),
            cleanup_threshold_days: default_cleanup_threshold_days(),
            clean_old_first: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_months_ahead() -> u32 {
    3
}

fn default_cleanup_threshold_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub settings: OrganizationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    #[schemars(description = "Role names matched against a workflow step's approver_role")]
    pub roles: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl User {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub organization: Uuid,
    #[serde(default)]
    #[schemars(description = "Tax-profile tags such as 'IVA_MENSAL' or 'EMPRESA'")]
    pub fiscal_tags: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub account_manager: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub organization: Uuid,
    pub client: Option<Uuid>,
    pub category: Option<String>,
    pub priority: Priority,
    pub assigned_to: Option<Uuid>,
    pub status: TaskStatus,
    pub deadline: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Definition that generated this task; `None` for manually created tasks.
    pub source_fiscal_obligation: Option<Uuid>,
    pub obligation_period_key: Option<String>,
    pub workflow: Option<Uuid>,
    pub current_workflow_step: Option<Uuid>,
}

impl Task {
    pub fn new(organization: Uuid, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            organization,
            client: None,
            category: None,
            priority: Priority::Medium,
            assigned_to: None,
            status: TaskStatus::Pending,
            deadline: None,
            created_at: Utc::now(),
            completed_at: None,
            source_fiscal_obligation: None,
            obligation_period_key: None,
            workflow: None,
            current_workflow_step: None,
        }
    }

    pub fn is_obligation(&self) -> bool {
        self.source_fiscal_obligation.is_some()
    }

    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.status.is_open() && self.deadline.is_some_and(|d| d < today)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub name: String,
    #[schemars(description = "Position of the step inside its workflow; unique per workflow")]
    pub order: u32,
    #[serde(default)]
    pub assign_to: Option<Uuid>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub approver_role: Option<String>,
}

/// Directed edge between two steps of the same workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StepTransition {
    pub from: Uuid,
    pub to: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub organization: Option<Uuid>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub transitions: Vec<StepTransition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    StepStarted,
    StepWorkLogged,
    StepCompleted,
    StepAdvanced,
    StepApproved,
    StepRejected,
    WorkflowAssigned,
    WorkflowCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowHistoryEntry {
    pub id: Uuid,
    pub task: Uuid,
    pub from_step: Option<Uuid>,
    pub to_step: Option<Uuid>,
    pub actor: Option<Uuid>,
    pub action: HistoryAction,
    pub comment: String,
    pub time_spent_minutes: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowHistoryEntry {
    pub fn new(task: Uuid, action: HistoryAction, actor: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            from_step: None,
            to_step: None,
            actor,
            action,
            comment: String::new(),
            time_spent_minutes: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_step(mut self, step: Option<Uuid>) -> Self {
        self.from_step = step;
        self
    }

    pub fn to_step(mut self, step: Option<Uuid>) -> Self {
        self.to_step = step;
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn time_spent(mut self, minutes: Option<u32>) -> Self {
        self.time_spent_minutes = minutes;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskApproval {
    pub task: Uuid,
    pub workflow_step: Uuid,
    pub approver: Uuid,
    pub approved: bool,
    pub comment: String,
    pub decided_at: DateTime<Utc>,
}

/// Read-only inputs of a generation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ObligationCatalog {
    #[serde(default)]
    pub organizations: Vec<Organization>,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub definitions: Vec<ObligationDefinition>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,
}

impl ObligationCatalog {
    pub fn organization(&self, id: Uuid) -> Option<&Organization> {
        self.organizations.iter().find(|o| o.id == id)
    }

    pub fn client(&self, id: Uuid) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == id)
    }

    pub fn definition(&self, id: Uuid) -> Option<&ObligationDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }

    pub fn workflow(&self, id: Uuid) -> Option<&WorkflowDefinition> {
        self.workflows.iter().find(|w| w.id == id)
    }

    pub fn user(&self, id: Uuid) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn users_with_role(&self, role: &str) -> Vec<&User> {
        self.users
            .iter()
            .filter(|u| u.is_active && u.has_role(role))
            .collect()
    }

    /// Settings for an organization, or the defaults when it has none.
    pub fn settings_for(&self, organization: Uuid) -> OrganizationSettings {
        self.organization(organization)
            .map(|o| o.settings.clone())
            .unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ObligationCatalog)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
