//! # Fiscal Obligation Engine
//!
//! A library for turning a catalog of recurring fiscal obligations (VAT returns,
//! payroll declarations, annual filings) into concrete, deadline-bearing tasks for
//! each eligible client, and for walking those tasks through approval workflows.
//!
//! ## Core Concepts
//!
//! - **Obligation Definition**: A reusable rule ("quarterly VAT, due the 20th of the
//!   month after the quarter") with a periodicity, deadline arithmetic, client tag
//!   filter and task templates
//! - **Period**: One closing month of a definition, with an exact deadline and a
//!   generation trigger date `generation_trigger_offset_days` before it
//! - **Period Key**: `<definition prefix>_<period suffix>` (e.g. `ivatrimestral_2024-Q1`);
//!   at most one task exists per (client, definition, period key)
//! - **Workflow**: A directed graph of steps a task moves through; every move is
//!   appended to the task's history and progress is derived from that history
//!
//! ## Example
//!
//! ```rust,ignore
//! use fiscal_obligation_engine::*;
//! use chrono::NaiveDate;
//!
//! let catalog = ObligationCatalog::from_json(&std::fs::read_to_string("catalog.json")?)?;
//! let store = InMemoryStore::new();
//!
//! let generator = FiscalObligationGenerator::new(&catalog, &store, &LogNotifier)
//!     .with_options(GenerationOptions::new(NaiveDate::from_ymd_opt(2024, 4, 8).unwrap()));
//!
//! let stats = generator.generate_for_period(2024, 4, None)?;
//! println!("{}", stats.summary());
//! ```

pub mod eligibility;
pub mod error;
pub mod generator;
pub mod materializer;
pub mod notify;
pub mod period;
pub mod progress;
pub mod schema;
pub mod stats;
pub mod store;
pub mod template;
pub mod utils;
pub mod workflow;

pub use eligibility::{client_matches_tags, eligible_clients, period_applicable, TagMatchMode};
pub use error::{EngineError, Result};
pub use generator::{
    FiscalObligationGenerator, GenerationOptions, ScheduledOutcome, ScheduledRun,
    MAX_MONTHS_AHEAD,
};
pub use materializer::{obligation_prefix, period_key, MaterializeOutcome, TaskMaterializer};
pub use notify::{
    dispatch, EngineEvent, LogNotifier, NextStepOption, NoopNotifier, Notifier, NotifyError,
    RecordingNotifier,
};
pub use period::{compute_periods_and_deadline, is_due, PeriodWindow};
pub use progress::{reconstruct_progress, WorkflowProgress};
pub use schema::*;
pub use stats::{DefinitionBreakdown, GenerationStats, RunStats};
pub use store::{InMemoryStore, TaskFilter, TaskStore};
pub use template::{render_template, TemplateContext};
pub use workflow::{AdvanceOutcome, WorkflowEngine, WorkflowGraph, WorkflowState};

use chrono::NaiveDate;
use log::{debug, info, warn};

/// Runs the scheduled generation for every active organization of a JSON catalog.
///
/// Only unparseable JSON fails the call. Invalid definitions and workflows are
/// logged here and then skipped by the run, which records them in its errors.
pub fn process_catalog(
    catalog_json: &str,
    store: &dyn TaskStore,
    notifier: &dyn Notifier,
    today: NaiveDate,
) -> Result<Vec<ScheduledRun>> {
    let catalog = ObligationCatalog::from_json(catalog_json)?;
    info!(
        "Loaded catalog: {} organizations, {} clients, {} definitions, {} workflows",
        catalog.organizations.len(),
        catalog.clients.len(),
        catalog.definitions.len(),
        catalog.workflows.len()
    );

    let mut invalid = 0;
    for definition in &catalog.definitions {
        if let Err(e) = definition.validate() {
            warn!("{}", e);
            invalid += 1;
        }
    }
    for workflow in &catalog.workflows {
        if let Err(e) = WorkflowGraph::build(workflow) {
            warn!("{}", e);
            invalid += 1;
        }
    }
    debug!("Catalog validated: {} invalid entries", invalid);

    let generator = FiscalObligationGenerator::new(&catalog, store, notifier)
        .with_options(GenerationOptions::new(today));
    let runs = generator.run_scheduled(None)?;

    let created: usize = runs
        .iter()
        .filter_map(|r| match &r.outcome {
            ScheduledOutcome::Completed { runs, .. } => {
                Some(runs.iter().map(|s| s.tasks_created).sum::<usize>())
            }
            ScheduledOutcome::Skipped { .. } => None,
        })
        .sum();
    info!(
        "Scheduled generation finished: {} organizations, {} tasks created",
        runs.len(),
        created
    );

    Ok(runs)
}
