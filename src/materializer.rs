//! Turns one (definition, client, period) into at most one task.
//!
//! The period key `<prefix>_<suffix>` makes materialization idempotent: the store
//! refuses a second task with the same (client, definition, key), and the
//! materializer reports that case as skipped rather than as an error.

use crate::error::{EngineError, Result};
use crate::generator::GenerationOptions;
use crate::notify::{dispatch, EngineEvent, Notifier};
use crate::period::{is_due, PeriodWindow};
use crate::schema::{Client, ObligationCatalog, ObligationDefinition, Task};
use crate::store::TaskStore;
use crate::template::{render_or_default, TemplateContext};
use crate::utils::fold_ascii;
use crate::workflow::WorkflowEngine;
use log::{debug, info};

pub const DEFAULT_TITLE_TEMPLATE: &str = "{obligation_name} - {client_name} - {period_description}";
pub const DEFAULT_DESCRIPTION_TEMPLATE: &str =
    "{obligation_name} for {client_name}, period {period_description}. Deadline: {deadline}.";

const PREFIX_MAX_LEN: usize = 20;

#[derive(Debug, Clone)]
pub enum MaterializeOutcome {
    Created(Task),
    /// A task for this period already exists.
    Skipped { period_key: String },
    /// Outside the trigger window (and the backfill window, if any).
    NotDue,
    /// Would have been created; nothing was written.
    DryRun { period_key: String },
}

/// Stable short form of a definition name: accent-folded, lowercase alphanumerics.
pub fn obligation_prefix(name: &str) -> String {
    let prefix: String = fold_ascii(name)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(PREFIX_MAX_LEN)
        .collect();

    if prefix.is_empty() {
        "obligation".to_string()
    } else {
        prefix
    }
}

pub fn period_key(definition: &ObligationDefinition, window: &PeriodWindow) -> String {
    format!("{}_{}", obligation_prefix(&definition.name), window.key_suffix)
}

pub fn template_context(
    definition: &ObligationDefinition,
    client: &Client,
    window: &PeriodWindow,
) -> TemplateContext {
    TemplateContext {
        obligation_name: definition.name.clone(),
        client_name: client.name.clone(),
        period_description: window.label.clone(),
        year: window.year.to_string(),
        month_name: window.month_name().to_string(),
        quarter: window.quarter.to_string(),
        deadline: window.deadline.format("%Y-%m-%d").to_string(),
    }
}

pub struct TaskMaterializer<'a> {
    store: &'a dyn TaskStore,
    notifier: &'a dyn Notifier,
    workflows: WorkflowEngine<'a>,
}

impl<'a> TaskMaterializer<'a> {
    pub fn new(
        catalog: &'a ObligationCatalog,
        store: &'a dyn TaskStore,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            store,
            notifier,
            workflows: WorkflowEngine::new(catalog, store, notifier),
        }
    }

    fn build_task(
        &self,
        definition: &ObligationDefinition,
        client: &Client,
        window: &PeriodWindow,
        key: String,
    ) -> Task {
        let context = template_context(definition, client, window);
        let title = render_or_default(
            &definition.title_template,
            &context,
            DEFAULT_TITLE_TEMPLATE,
        );
        let description = render_or_default(
            definition
                .description_template
                .as_deref()
                .unwrap_or(DEFAULT_DESCRIPTION_TEMPLATE),
            &context,
            DEFAULT_DESCRIPTION_TEMPLATE,
        );

        let mut task = Task::new(client.organization, title);
        task.description = description;
        task.client = Some(client.id);
        task.category = definition.default_task_category.clone();
        task.priority = definition.default_priority;
        task.assigned_to = client.account_manager;
        task.deadline = Some(window.deadline);
        task.source_fiscal_obligation = Some(definition.id);
        task.obligation_period_key = Some(key);
        task
    }

    pub fn materialize(
        &self,
        definition: &ObligationDefinition,
        client: &Client,
        window: &PeriodWindow,
        options: &GenerationOptions,
    ) -> Result<MaterializeOutcome> {
        let key = period_key(definition, window);
        if self
            .store
            .find_by_obligation_key(client.id, definition.id, &key)?
            .is_some()
        {
            debug!("Task {} for client '{}' already exists", key, client.name);
            return Ok(MaterializeOutcome::Skipped { period_key: key });
        }

        if !is_due(window, options.today, options.backfill_days) {
            return Ok(MaterializeOutcome::NotDue);
        }

        if options.dry_run {
            return Ok(MaterializeOutcome::DryRun { period_key: key });
        }

        // Fail before inserting so a broken workflow never leaves a half-built task.
        if let Some(workflow) = definition.default_workflow {
            self.workflows.graph(workflow)?;
        }

        let task = self.build_task(definition, client, window, key.clone());
        let mut task = match self.store.insert_task(task) {
            Ok(task) => task,
            Err(EngineError::DuplicateTask { .. }) => {
                debug!("Lost insert race for {} / '{}'", key, client.name);
                return Ok(MaterializeOutcome::Skipped { period_key: key });
            }
            Err(e) => return Err(e),
        };

        if let Some(workflow) = definition.default_workflow {
            self.workflows.attach_workflow(&mut task, workflow, None)?;
        }

        info!(
            "Created '{}' for client '{}' (deadline {})",
            task.title, client.name, window.deadline
        );
        dispatch(
            self.notifier,
            EngineEvent::TaskCreated {
                task: task.id,
                definition: definition.id,
                definition_name: definition.name.clone(),
                client: client.id,
                deadline: window.deadline,
            },
        );

        Ok(MaterializeOutcome::Created(task))
    }
}
