//! Generation runs: definitions × eligible clients × due periods.
//!
//! A run never stops because one definition or one client is broken. Those
//! failures are counted in [`RunStats`] and reported through the notifier. Only
//! storage failures abort, since nothing after them can be trusted.

use crate::eligibility::{definition_in_scope, eligible_clients, TagMatchMode};
use crate::error::{EngineError, Result};
use crate::materializer::{MaterializeOutcome, TaskMaterializer};
use crate::notify::{dispatch, EngineEvent, Notifier};
use crate::period::compute_periods_and_deadline;
use crate::schema::{Client, ObligationCatalog, ObligationDefinition, TaskStatus};
use crate::stats::{DefinitionBreakdown, GenerationStats, RunStats, DEFAULT_MAX_REPORTED_ERRORS};
use crate::store::{TaskFilter, TaskStore};
use crate::utils::{add_months, first_day_of_month, validate_month};
use chrono::{Datelike, Days, NaiveDate};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub const MAX_MONTHS_AHEAD: u32 = 24;
const MIN_YEAR: i32 = 1900;
const MAX_YEAR: i32 = 2200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Reference date for trigger windows and cleanup.
    pub today: NaiveDate,
    pub tag_match: TagMatchMode,
    /// Evaluate everything, write nothing.
    pub dry_run: bool,
    /// Also generate periods whose deadline passed at most this many days ago.
    pub backfill_days: Option<u32>,
    pub max_reported_errors: usize,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::new(chrono::Local::now().date_naive())
    }
}

impl GenerationOptions {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            tag_match: TagMatchMode::default(),
            dry_run: false,
            backfill_days: None,
            max_reported_errors: DEFAULT_MAX_REPORTED_ERRORS,
        }
    }

    pub fn with_tag_match(mut self, mode: TagMatchMode) -> Self {
        self.tag_match = mode;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_backfill_days(mut self, days: u32) -> Self {
        self.backfill_days = Some(days);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduledOutcome {
    Skipped { reason: String },
    Completed { cleaned: usize, runs: Vec<RunStats> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRun {
    pub organization: Uuid,
    pub outcome: ScheduledOutcome,
}

pub struct FiscalObligationGenerator<'a> {
    catalog: &'a ObligationCatalog,
    store: &'a dyn TaskStore,
    notifier: &'a dyn Notifier,
    options: GenerationOptions,
    materializer: TaskMaterializer<'a>,
}

impl<'a> FiscalObligationGenerator<'a> {
    pub fn new(
        catalog: &'a ObligationCatalog,
        store: &'a dyn TaskStore,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            catalog,
            store,
            notifier,
            options: GenerationOptions::default(),
            materializer: TaskMaterializer::new(catalog, store, notifier),
        }
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }

    fn check_organization(&self, organization: Option<Uuid>) -> Result<()> {
        match organization {
            Some(id) if self.catalog.organization(id).is_none() => Err(EngineError::NotFound {
                entity: "Organization",
                id,
            }),
            _ => Ok(()),
        }
    }

    fn definitions_in_scope(&self, organization: Option<Uuid>) -> Vec<&'a ObligationDefinition> {
        let mut definitions: Vec<&ObligationDefinition> = self
            .catalog
            .definitions
            .iter()
            .filter(|d| definition_in_scope(d, organization))
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        definitions
    }

    fn clients_for(
        &self,
        definition: &ObligationDefinition,
        organization: Option<Uuid>,
    ) -> Vec<&'a Client> {
        eligible_clients(self.catalog, definition, organization, self.options.tag_match)
            .into_iter()
            .filter(|c| {
                self.catalog
                    .organization(c.organization)
                    .map_or(true, |org| org.is_active)
            })
            .collect()
    }

    fn isolate(&self, stats: &mut RunStats, context: &str, error: EngineError) -> Result<()> {
        if error.is_fatal() {
            error!("Aborting generation run: {}: {}", context, error);
            dispatch(
                self.notifier,
                EngineEvent::GenerationError {
                    message: format!("{}: {}", context, error),
                },
            );
            return Err(error);
        }

        warn!("{}: {}", context, error);
        stats.record_error(context, &error, self.options.max_reported_errors);
        dispatch(
            self.notifier,
            EngineEvent::GenerationError {
                message: format!("{}: {}", context, error),
            },
        );
        Ok(())
    }

    /// Generates the tasks whose deadline falls in `year`/`month` and whose
    /// trigger window contains today.
    pub fn generate_for_period(
        &self,
        year: i32,
        month: u32,
        organization: Option<Uuid>,
    ) -> Result<RunStats> {
        validate_month(month).map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(EngineError::InvalidInput(format!(
                "year {} outside {}..={}",
                year, MIN_YEAR, MAX_YEAR
            )));
        }
        self.check_organization(organization)?;

        let anchor = first_day_of_month(year, month)?;
        let mut stats = RunStats::new(year, month, organization, self.options.dry_run);
        let mut seen_clients = BTreeSet::new();

        for definition in self.definitions_in_scope(organization) {
            stats.definitions_processed += 1;

            let windows = match compute_periods_and_deadline(definition, anchor) {
                Ok(windows) => windows,
                Err(e) => {
                    self.isolate(&mut stats, &definition.name, e)?;
                    continue;
                }
            };
            if windows.is_empty() {
                continue;
            }

            let clients = self.clients_for(definition, organization);
            debug!(
                "'{}': {} period(s), {} eligible client(s) for {:04}-{:02}",
                definition.name,
                windows.len(),
                clients.len(),
                year,
                month
            );

            for window in &windows {
                for client in &clients {
                    seen_clients.insert(client.id);
                    match self
                        .materializer
                        .materialize(definition, client, window, &self.options)
                    {
                        Ok(MaterializeOutcome::Created(task)) => {
                            stats.tasks_created += 1;
                            stats.created_task_ids.push(task.id);
                        }
                        Ok(MaterializeOutcome::DryRun { .. }) => stats.tasks_created += 1,
                        Ok(MaterializeOutcome::Skipped { .. }) => stats.tasks_skipped += 1,
                        Ok(MaterializeOutcome::NotDue) => stats.tasks_not_due += 1,
                        Err(e) => {
                            let context = format!("{} / {}", definition.name, client.name);
                            self.isolate(&mut stats, &context, e)?;
                        }
                    }
                }
            }
        }

        stats.clients_processed = seen_clients.len();
        info!("{}", stats.summary());
        dispatch(
            self.notifier,
            EngineEvent::GenerationCompleted {
                stats: stats.clone(),
            },
        );
        Ok(stats)
    }

    /// Runs the current month and each of the next `months_ahead` months.
    pub fn generate_for_next_months(
        &self,
        months_ahead: u32,
        organization: Option<Uuid>,
    ) -> Result<Vec<RunStats>> {
        if months_ahead > MAX_MONTHS_AHEAD {
            return Err(EngineError::InvalidInput(format!(
                "months_ahead {} exceeds {}",
                months_ahead, MAX_MONTHS_AHEAD
            )));
        }
        self.check_organization(organization)?;

        let today = self.options.today;
        (0..=months_ahead)
            .map(|offset| {
                let (year, month) = add_months(today.year(), today.month(), offset as i32)?;
                self.generate_for_period(year, month, organization)
            })
            .collect()
    }

    /// Deletes obligation tasks still pending more than `days_old` days after
    /// their deadline. Returns how many were (or, in dry-run, would be) deleted.
    pub fn clean_old_pending_obligations(
        &self,
        days_old: u32,
        organization: Option<Uuid>,
    ) -> Result<usize> {
        self.check_organization(organization)?;

        let cutoff = self
            .options
            .today
            .checked_sub_days(Days::new(days_old as u64))
            .ok_or_else(|| EngineError::DateError(format!("{} days before {}", days_old, self.options.today)))?;

        let stale = self.store.list_tasks(
            &TaskFilter::obligations()
                .organization(organization)
                .status(TaskStatus::Pending)
                .deadline_before(cutoff),
        )?;

        if self.options.dry_run {
            info!("{} stale obligation task(s) would be deleted", stale.len());
            return Ok(stale.len());
        }

        let mut deleted = 0;
        for task in stale {
            dispatch(
                self.notifier,
                EngineEvent::ObligationPruned {
                    task: task.id,
                    assignee: task.assigned_to,
                    deadline: task.deadline,
                },
            );
            self.store.delete_task(task.id)?;
            deleted += 1;
        }

        info!(
            "Deleted {} pending obligation task(s) with deadline before {}",
            deleted, cutoff
        );
        Ok(deleted)
    }

    pub fn get_generation_stats(&self, organization: Option<Uuid>) -> Result<GenerationStats> {
        self.check_organization(organization)?;

        let tasks = self
            .store
            .list_tasks(&TaskFilter::obligations().organization(organization))?;

        let mut stats = GenerationStats {
            organization,
            total: tasks.len(),
            active_definitions: self.definitions_in_scope(organization).len(),
            ..Default::default()
        };

        let mut per_definition: BTreeMap<Uuid, DefinitionBreakdown> = BTreeMap::new();
        for task in &tasks {
            *stats.by_status.entry(task.status.to_string()).or_default() += 1;

            if let Some(deadline) = task.deadline {
                let month = format!("{:04}-{:02}", deadline.year(), deadline.month());
                *stats.per_month.entry(month).or_default() += 1;
            }
            if task.is_overdue(self.options.today) {
                stats.overdue += 1;
            }

            if let Some(definition) = task.source_fiscal_obligation {
                let row = per_definition
                    .entry(definition)
                    .or_insert_with(|| DefinitionBreakdown {
                        definition,
                        name: self
                            .catalog
                            .definition(definition)
                            .map(|d| d.name.clone())
                            .unwrap_or_else(|| definition.to_string()),
                        total: 0,
                        open: 0,
                        completed: 0,
                    });
                row.total += 1;
                if task.status.is_open() {
                    row.open += 1;
                }
                if task.status == TaskStatus::Completed {
                    row.completed += 1;
                }
            }
        }

        stats.per_definition = per_definition.into_values().collect();
        stats
            .per_definition
            .sort_by(|a, b| b.total.cmp(&a.total).then(a.name.cmp(&b.name)));
        Ok(stats)
    }

    /// Runs generation for each active organization (or just `organization`)
    /// following its settings.
    pub fn run_scheduled(&self, organization: Option<Uuid>) -> Result<Vec<ScheduledRun>> {
        self.check_organization(organization)?;

        let organizations: Vec<_> = self
            .catalog
            .organizations
            .iter()
            .filter(|o| organization.map_or(o.is_active, |id| o.id == id))
            .collect();

        let mut runs = Vec::with_capacity(organizations.len());
        for org in organizations {
            let settings = self.catalog.settings_for(org.id);

            let outcome = if !org.is_active {
                ScheduledOutcome::Skipped {
                    reason: "organization is inactive".to_string(),
                }
            } else if !settings.auto_generation_enabled {
                info!("Auto-generation disabled for '{}'", org.name);
                ScheduledOutcome::Skipped {
                    reason: "auto-generation disabled".to_string(),
                }
            } else {
                let cleaned = if settings.clean_old_first {
                    self.clean_old_pending_obligations(
                        settings.cleanup_threshold_days,
                        Some(org.id),
                    )?
                } else {
                    0
                };
                let months = settings.months_ahead.min(MAX_MONTHS_AHEAD);
                let runs = self.generate_for_next_months(months, Some(org.id))?;
                ScheduledOutcome::Completed { cleaned, runs }
            };

            runs.push(ScheduledRun {
                organization: org.id,
                outcome,
            });
        }

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingNotifier;
    use crate::schema::{Organization, OrganizationSettings, Periodicity, Task};
    use crate::store::InMemoryStore;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn organization(name: &str) -> Organization {
        Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            is_active: true,
            settings: OrganizationSettings::default(),
        }
    }

    fn client(name: &str, organization: Uuid, tags: &[&str]) -> Client {
        Client {
            id: Uuid::new_v4(),
            name: name.to_string(),
            organization,
            fiscal_tags: tags.iter().map(|t| t.to_string()).collect(),
            is_active: true,
            account_manager: None,
        }
    }

    fn monthly_vat() -> ObligationDefinition {
        let mut definition = ObligationDefinition::new("IVA Mensal", Periodicity::Monthly);
        definition.deadline_day = 10;
        definition.deadline_month_offset = 2;
        definition.generation_trigger_offset_days = 20;
        definition
            .applies_to_client_tags
            .insert("IVA_MENSAL".to_string());
        definition
    }

    fn catalog() -> ObligationCatalog {
        let org = organization("Contabilidade Lda");
        let clients = vec![
            client("Padaria Central", org.id, &["IVA_MENSAL"]),
            client("Café Avenida", org.id, &["IVA_TRIMESTRAL"]),
        ];
        ObligationCatalog {
            organizations: vec![org],
            clients,
            definitions: vec![monthly_vat()],
            ..Default::default()
        }
    }

    #[test]
    fn test_second_run_skips_everything() {
        let catalog = catalog();
        let store = InMemoryStore::new();
        let notifier = RecordingNotifier::new();
        let generator = FiscalObligationGenerator::new(&catalog, &store, &notifier)
            .with_options(GenerationOptions::new(date(2024, 3, 1)));

        let first = generator.generate_for_period(2024, 3, None).unwrap();
        assert_eq!(first.definitions_processed, 1);
        assert_eq!(first.tasks_created, 1);
        assert_eq!(first.error_count, 0);

        let second = generator.generate_for_period(2024, 3, None).unwrap();
        assert_eq!(second.tasks_created, 0);
        assert_eq!(second.tasks_skipped, first.tasks_created);
        assert_eq!(store.task_count(), 1);
        assert_eq!(notifier.count("generation_completed"), 2);
    }

    #[test]
    fn test_rerun_after_window_closes_still_skips() {
        let catalog = catalog();
        let store = InMemoryStore::new();

        let first = FiscalObligationGenerator::new(&catalog, &store, &crate::notify::NoopNotifier)
            .with_options(GenerationOptions::new(date(2024, 3, 1)))
            .generate_for_period(2024, 3, None)
            .unwrap();
        assert_eq!(first.tasks_created, 1);

        let later = FiscalObligationGenerator::new(&catalog, &store, &crate::notify::NoopNotifier)
            .with_options(GenerationOptions::new(date(2024, 3, 25)))
            .generate_for_period(2024, 3, None)
            .unwrap();
        assert_eq!(later.tasks_created, 0);
        assert_eq!(later.tasks_not_due, 0);
        assert_eq!(later.tasks_skipped, first.tasks_created);
    }

    #[test]
    fn test_clients_counted_once_per_run() {
        let mut catalog = catalog();
        let mut payroll = ObligationDefinition::new("DMR", Periodicity::Monthly);
        payroll.deadline_day = 10;
        payroll.generation_trigger_offset_days = 20;
        payroll.applies_to_client_tags.insert("IVA_MENSAL".to_string());
        catalog.definitions.push(payroll);

        let store = InMemoryStore::new();
        let generator = FiscalObligationGenerator::new(&catalog, &store, &crate::notify::NoopNotifier)
            .with_options(GenerationOptions::new(date(2024, 3, 1)));

        let stats = generator.generate_for_period(2024, 3, None).unwrap();
        assert_eq!(stats.tasks_created, 2);
        assert_eq!(stats.clients_processed, 1);
    }

    #[test]
    fn test_invalid_input() {
        let catalog = catalog();
        let store = InMemoryStore::new();
        let generator = FiscalObligationGenerator::new(&catalog, &store, &crate::notify::NoopNotifier);

        assert!(matches!(
            generator.generate_for_period(2024, 13, None),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(generator.generate_for_period(10_000, 1, None).is_err());
        assert!(matches!(
            generator.generate_for_period(2024, 3, Some(Uuid::new_v4())),
            Err(EngineError::NotFound { .. })
        ));
        assert!(generator.generate_for_next_months(25, None).is_err());
    }

    #[test]
    fn test_broken_definition_is_isolated() {
        let mut catalog = catalog();
        let mut broken = ObligationDefinition::new("Modelo Partido", Periodicity::Monthly);
        broken.deadline_day = 40;
        catalog.definitions.push(broken);

        let store = InMemoryStore::new();
        let notifier = RecordingNotifier::new();
        let generator = FiscalObligationGenerator::new(&catalog, &store, &notifier)
            .with_options(GenerationOptions::new(date(2024, 3, 1)));

        let stats = generator.generate_for_period(2024, 3, None).unwrap();
        assert_eq!(stats.definitions_processed, 2);
        assert_eq!(stats.tasks_created, 1);
        assert_eq!(stats.error_count, 1);
        assert!(stats.errors[0].starts_with("Modelo Partido"));
        assert_eq!(notifier.count("generation_error"), 1);
    }

    #[test]
    fn test_storage_failure_aborts() {
        let catalog = catalog();
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let generator = FiscalObligationGenerator::new(&catalog, &store, &crate::notify::NoopNotifier)
            .with_options(GenerationOptions::new(date(2024, 3, 1)));

        assert!(matches!(
            generator.generate_for_period(2024, 3, None),
            Err(EngineError::Storage(_))
        ));
    }

    #[test]
    fn test_next_months_returns_one_run_per_month() {
        let catalog = catalog();
        let store = InMemoryStore::new();
        let generator = FiscalObligationGenerator::new(&catalog, &store, &crate::notify::NoopNotifier)
            .with_options(GenerationOptions::new(date(2024, 11, 25)));

        let runs = generator.generate_for_next_months(2, None).unwrap();
        let months: Vec<(i32, u32)> = runs.iter().map(|r| (r.year, r.month)).collect();
        assert_eq!(months, vec![(2024, 11), (2024, 12), (2025, 1)]);
    }

    #[test]
    fn test_cleanup_removes_only_stale_pending_obligations() {
        let catalog = catalog();
        let org = catalog.organizations[0].id;
        let store = InMemoryStore::new();
        let notifier = RecordingNotifier::new();

        let mut stale = Task::new(org, "IVA Mensal - antigo");
        stale.source_fiscal_obligation = Some(catalog.definitions[0].id);
        stale.obligation_period_key = Some("ivamensal_2023-10".to_string());
        stale.client = Some(catalog.clients[0].id);
        stale.deadline = Some(date(2023, 12, 10));
        store.insert_task(stale).unwrap();

        let mut worked = Task::new(org, "IVA Mensal - em curso");
        worked.source_fiscal_obligation = Some(catalog.definitions[0].id);
        worked.obligation_period_key = Some("ivamensal_2023-11".to_string());
        worked.client = Some(catalog.clients[0].id);
        worked.deadline = Some(date(2024, 1, 10));
        worked.status = TaskStatus::InProgress;
        store.insert_task(worked).unwrap();

        let mut manual = Task::new(org, "Reunião");
        manual.deadline = Some(date(2023, 12, 1));
        store.insert_task(manual).unwrap();

        let dry = FiscalObligationGenerator::new(&catalog, &store, &notifier)
            .with_options(GenerationOptions::new(date(2024, 3, 1)).with_dry_run(true));
        assert_eq!(dry.clean_old_pending_obligations(30, None).unwrap(), 1);
        assert_eq!(store.task_count(), 3);

        let generator = FiscalObligationGenerator::new(&catalog, &store, &notifier)
            .with_options(GenerationOptions::new(date(2024, 3, 1)));
        assert_eq!(generator.clean_old_pending_obligations(30, Some(org)).unwrap(), 1);
        assert_eq!(store.task_count(), 2);
        assert_eq!(notifier.count("obligation_pruned"), 1);
    }

    #[test]
    fn test_generation_stats() {
        let catalog = catalog();
        let store = InMemoryStore::new();
        let generator = FiscalObligationGenerator::new(&catalog, &store, &crate::notify::NoopNotifier)
            .with_options(GenerationOptions::new(date(2024, 3, 1)));
        generator.generate_for_period(2024, 3, None).unwrap();

        let later = FiscalObligationGenerator::new(&catalog, &store, &crate::notify::NoopNotifier)
            .with_options(GenerationOptions::new(date(2024, 3, 15)));
        let stats = later.get_generation_stats(None).unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.count(TaskStatus::Pending), 1);
        assert_eq!(stats.overdue, 1);
        assert_eq!(stats.per_month.get("2024-03"), Some(&1));
        assert_eq!(stats.per_definition[0].name, "IVA Mensal");
        assert_eq!(stats.active_definitions, 1);
    }

    #[test]
    fn test_scheduled_run_respects_settings() {
        let mut catalog = catalog();
        let mut paused = organization("Parada Lda");
        paused.settings.auto_generation_enabled = false;
        catalog.organizations.push(paused.clone());

        let store = InMemoryStore::new();
        let generator = FiscalObligationGenerator::new(&catalog, &store, &crate::notify::NoopNotifier)
            .with_options(GenerationOptions::new(date(2024, 3, 1)));

        let runs = generator.run_scheduled(None).unwrap();
        assert_eq!(runs.len(), 2);

        let paused_run = runs.iter().find(|r| r.organization == paused.id).unwrap();
        assert!(matches!(paused_run.outcome, ScheduledOutcome::Skipped { .. }));

        let active_run = runs.iter().find(|r| r.organization != paused.id).unwrap();
        match &active_run.outcome {
            ScheduledOutcome::Completed { cleaned, runs } => {
                assert_eq!(*cleaned, 0);
                assert_eq!(runs.len(), 4);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
