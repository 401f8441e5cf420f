//! Run reports and the generation dashboard.

use crate::error::EngineError;
use crate::schema::TaskStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const DEFAULT_MAX_REPORTED_ERRORS: usize = 50;

/// Outcome of one generation run for a single (year, month).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub year: i32,
    pub month: u32,
    pub organization: Option<Uuid>,
    pub dry_run: bool,
    pub definitions_processed: usize,
    /// Distinct clients evaluated against at least one period.
    pub clients_processed: usize,
    pub tasks_created: usize,
    pub tasks_skipped: usize,
    pub tasks_not_due: usize,
    /// First errors of the run; `error_count` keeps the full total.
    pub errors: Vec<String>,
    pub error_count: usize,
    pub created_task_ids: Vec<Uuid>,
}

impl RunStats {
    pub fn new(year: i32, month: u32, organization: Option<Uuid>, dry_run: bool) -> Self {
        Self {
            year,
            month,
            organization,
            dry_run,
            ..Default::default()
        }
    }

    pub fn record_error(&mut self, context: &str, error: &EngineError, cap: usize) {
        self.error_count += 1;
        if self.errors.len() < cap {
            self.errors.push(format!("{}: {}", context, error));
        }
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Generation {:04}-{:02}{}: {} created, {} skipped, {} not due, {} errors ({} definitions, {} clients)",
            self.year,
            self.month,
            if self.dry_run { " (dry run)" } else { "" },
            self.tasks_created,
            self.tasks_skipped,
            self.tasks_not_due,
            self.error_count,
            self.definitions_processed,
            self.clients_processed
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionBreakdown {
    pub definition: Uuid,
    pub name: String,
    pub total: usize,
    pub open: usize,
    pub completed: usize,
}

/// Counts over obligation-generated tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub organization: Option<Uuid>,
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub per_definition: Vec<DefinitionBreakdown>,
    /// Keyed by deadline month, `YYYY-MM`.
    pub per_month: BTreeMap<String, usize>,
    pub overdue: usize,
    pub active_definitions: usize,
}

impl GenerationStats {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status
            .get(&status.to_string())
            .copied()
            .unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        output.push_str("# Fiscal Obligation Tasks\n\n");
        output.push_str(&format!("**Total:** {}\n\n", self.total));
        output.push_str(&format!("**Overdue:** {}\n\n", self.overdue));
        output.push_str(&format!(
            "**Active definitions:** {}\n\n",
            self.active_definitions
        ));

        output.push_str("## By Status\n\n");
        for (status, count) in &self.by_status {
            output.push_str(&format!("- {}: {}\n", status, count));
        }
        output.push('\n');

        output.push_str("## By Obligation\n\n");
        output.push_str("| Obligation | Total | Open | Completed |\n");
        output.push_str("|---|---|---|---|\n");
        for row in &self.per_definition {
            output.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                row.name, row.total, row.open, row.completed
            ));
        }
        output.push('\n');

        output.push_str("## By Deadline Month\n\n");
        for (month, count) in &self.per_month {
            output.push_str(&format!("- {}: {}\n", month, count));
        }

        output
    }
}
