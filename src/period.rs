//! Period and deadline arithmetic for obligation definitions.
//!
//! A definition produces one period per "closing month" in which it applies
//! (every month for monthly obligations, March/June/September/December for
//! quarterly ones, and so on). Each period gets an exact deadline:
//!
//! 1. The base month is the month the period closes in, or for annual
//!    `SPECIFIC_DATE` obligations the `specific_month_reference` of that year.
//! 2. `deadline_month_offset` is added with year carry.
//! 3. `deadline_day` is clamped to the last day of the resulting month.
//!
//! The generation trigger date is `deadline - generation_trigger_offset_days`.

use crate::eligibility::period_applicable;
use crate::error::{EngineError, Result};
use crate::schema::{CalculationBasis, ObligationDefinition, Periodicity};
use crate::utils::{
    add_months, clamped_date, first_day_of_month, from_month_index, last_day_of_month,
    month_index, month_name, quarter_of, semester_of,
};
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Months walked back from the generation month, on top of the deadline offset.
const LOOKBACK_MONTHS: i32 = 24;
/// Months walked forward; covers annual SPECIFIC_DATE deadlines that precede their period end.
const LOOKAHEAD_MONTHS: i32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub deadline: NaiveDate,
    pub trigger_date: NaiveDate,
    /// Human readable period, e.g. "Q1 2024".
    pub label: String,
    /// Period part of the idempotency key, e.g. "2024-Q1".
    pub key_suffix: String,
    /// Year and month the period closes in.
    pub year: i32,
    pub month: u32,
    pub quarter: u32,
}

impl PeriodWindow {
    pub fn month_name(&self) -> &'static str {
        month_name(self.month)
    }
}

/// Deadline of the period that closes in `year`/`month`.
pub fn deadline_for_period(
    definition: &ObligationDefinition,
    year: i32,
    month: u32,
) -> Result<NaiveDate> {
    let (base_year, base_month) = match (definition.periodicity, definition.calculation_basis) {
        (Periodicity::Annual, CalculationBasis::SpecificDate) => {
            let reference = definition.specific_month_reference.ok_or_else(|| {
                EngineError::InvalidDefinition {
                    definition: definition.name.clone(),
                    details: "annual SPECIFIC_DATE obligations need a specific_month_reference"
                        .to_string(),
                }
            })?;
            (year, reference)
        }
        (Periodicity::Annual, _) => (year, 12),
        _ => (year, month),
    };

    let offset = i32::try_from(definition.deadline_month_offset)
        .map_err(|_| EngineError::InvalidDefinition {
            definition: definition.name.clone(),
            details: format!(
                "deadline_month_offset {} is out of range",
                definition.deadline_month_offset
            ),
        })?;
    let (deadline_year, deadline_month) = add_months(base_year, base_month, offset)?;

    clamped_date(deadline_year, deadline_month, definition.deadline_day)
}

pub fn trigger_date(definition: &ObligationDefinition, deadline: NaiveDate) -> Result<NaiveDate> {
    deadline
        .checked_sub_days(Days::new(definition.generation_trigger_offset_days as u64))
        .ok_or_else(|| {
            EngineError::DateError(format!(
                "Trigger offset of {} days before {} is out of range",
                definition.generation_trigger_offset_days, deadline
            ))
        })
}

/// Builds the period of `definition` that closes in `year`/`month`.
///
/// Callers are expected to check [`period_applicable`] first; this function
/// only shapes the interval.
pub fn period_for(definition: &ObligationDefinition, year: i32, month: u32) -> Result<PeriodWindow> {
    let quarter = quarter_of(month);

    let (start, label, key_suffix) = match definition.periodicity {
        Periodicity::Monthly | Periodicity::Other => (
            first_day_of_month(year, month)?,
            format!("{} {}", month_name(month), year),
            format!("{:04}-{:02}", year, month),
        ),
        Periodicity::Quarterly => (
            first_day_of_month(year, quarter * 3 - 2)?,
            format!("Q{} {}", quarter, year),
            format!("{:04}-Q{}", year, quarter),
        ),
        Periodicity::Biannual => {
            let semester = semester_of(month);
            (
                first_day_of_month(year, semester * 6 - 5)?,
                format!("H{} {}", semester, year),
                format!("{:04}-S{}", year, semester),
            )
        }
        Periodicity::Annual => (
            first_day_of_month(year, 1)?,
            format!("FY {}", year),
            format!("{:04}", year),
        ),
    };

    let end = last_day_of_month(year, month)?;
    let deadline = deadline_for_period(definition, year, month)?;
    let trigger = trigger_date(definition, deadline)?;

    Ok(PeriodWindow {
        period_start: start,
        period_end: end,
        deadline,
        trigger_date: trigger,
        label,
        key_suffix,
        year,
        month,
        quarter,
    })
}

/// Candidate periods of `definition` whose deadline falls in the month of `anchor_date`.
///
/// Event-driven definitions never produce periods here.
pub fn compute_periods_and_deadline(
    definition: &ObligationDefinition,
    anchor_date: NaiveDate,
) -> Result<Vec<PeriodWindow>> {
    definition.validate()?;

    if definition.calculation_basis == CalculationBasis::EventDriven {
        return Ok(Vec::new());
    }

    let target = month_index(anchor_date.year(), anchor_date.month());
    let scan_range = i32::try_from(definition.deadline_month_offset)
        .ok()
        .and_then(|offset| offset.checked_add(LOOKBACK_MONTHS))
        .and_then(|back| Some((target.checked_sub(back)?, target.checked_add(LOOKAHEAD_MONTHS)?)));
    let (first, last) = scan_range.ok_or_else(|| {
        EngineError::DateError(format!(
            "Cannot scan {} months back from {}",
            definition.deadline_month_offset, anchor_date
        ))
    })?;

    let mut windows = Vec::new();
    for index in first..=last {
        let (year, month) = from_month_index(index);
        if !period_applicable(definition, year, month) {
            continue;
        }

        let window = period_for(definition, year, month)?;
        if month_index(window.deadline.year(), window.deadline.month()) == target {
            windows.push(window);
        }
    }

    Ok(windows)
}

/// Whether a period should be generated on `today`.
///
/// Inside the trigger window (`trigger_date <= today <= deadline`) it always is.
/// With `backfill_days`, periods whose deadline passed at most that many days ago
/// are also accepted.
pub fn is_due(window: &PeriodWindow, today: NaiveDate, backfill_days: Option<u32>) -> bool {
    if window.trigger_date <= today && today <= window.deadline {
        return true;
    }

    match backfill_days {
        Some(days) => {
            let limit = window
                .deadline
                .checked_add_days(Days::new(days as u64))
                .unwrap_or(NaiveDate::MAX);
            window.deadline < today && today <= limit
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn quarterly() -> ObligationDefinition {
        let mut definition = ObligationDefinition::new("IVA Trimestral", Periodicity::Quarterly);
        definition.deadline_day = 20;
        definition.deadline_month_offset = 1;
        definition.generation_trigger_offset_days = 15;
        definition
    }

    #[test]
    fn test_quarterly_end_to_end() {
        let definition = quarterly();

        let windows = compute_periods_and_deadline(&definition, date(2024, 4, 1)).unwrap();
        assert_eq!(windows.len(), 1);

        let q1 = &windows[0];
        assert_eq!(q1.period_start, date(2024, 1, 1));
        assert_eq!(q1.period_end, date(2024, 3, 31));
        assert_eq!(q1.deadline, date(2024, 4, 20));
        assert_eq!(q1.trigger_date, date(2024, 4, 5));
        assert_eq!(q1.key_suffix, "2024-Q1");
        assert_eq!(q1.label, "Q1 2024");

        assert!(is_due(q1, date(2024, 4, 8), None));
        assert!(!is_due(q1, date(2024, 3, 20), None));
    }

    #[test]
    fn test_quarterly_has_no_deadline_in_off_months() {
        let definition = quarterly();
        assert!(compute_periods_and_deadline(&definition, date(2024, 5, 10))
            .unwrap()
            .is_empty());
        assert!(compute_periods_and_deadline(&definition, date(2024, 6, 10))
            .unwrap()
            .is_empty());
        assert_eq!(
            compute_periods_and_deadline(&definition, date(2024, 7, 10)).unwrap()[0].key_suffix,
            "2024-Q2"
        );
    }

    #[test]
    fn test_deadline_clamped_to_end_of_february() {
        let mut definition = ObligationDefinition::new("Retenções", Periodicity::Monthly);
        definition.deadline_day = 31;
        definition.deadline_month_offset = 1;

        assert_eq!(
            deadline_for_period(&definition, 2024, 1).unwrap(),
            date(2024, 2, 29)
        );
        assert_eq!(
            deadline_for_period(&definition, 2023, 1).unwrap(),
            date(2023, 2, 28)
        );

        let windows = compute_periods_and_deadline(&definition, date(2023, 2, 1)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].deadline, date(2023, 2, 28));
        assert_eq!(windows[0].key_suffix, "2023-01");
    }

    #[test]
    fn test_month_offset_wraps_across_years() {
        let mut definition = ObligationDefinition::new("Declaração Tardia", Periodicity::Monthly);
        definition.deadline_month_offset = 13;
        definition.deadline_day = 15;

        let deadline = deadline_for_period(&definition, 2023, 11).unwrap();
        assert_eq!(deadline, date(2024, 12, 15));

        let windows = compute_periods_and_deadline(&definition, date(2024, 12, 1)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].period_start, date(2023, 11, 1));
    }

    #[test]
    fn test_annual_specific_date_rolls_into_next_year() {
        let mut definition = ObligationDefinition::new("IES", Periodicity::Annual);
        definition.calculation_basis = CalculationBasis::SpecificDate;
        definition.specific_month_reference = Some(7);
        definition.deadline_month_offset = 12;
        definition.deadline_day = 15;

        let windows = compute_periods_and_deadline(&definition, date(2024, 7, 1)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].period_start, date(2023, 1, 1));
        assert_eq!(windows[0].period_end, date(2023, 12, 31));
        assert_eq!(windows[0].deadline, date(2024, 7, 15));
        assert_eq!(windows[0].key_suffix, "2023");
        assert_eq!(windows[0].label, "FY 2023");
    }

    #[test]
    fn test_annual_end_of_period_anchors_on_december() {
        let mut definition = ObligationDefinition::new("Modelo 22", Periodicity::Annual);
        definition.deadline_month_offset = 5;
        definition.deadline_day = 31;

        let windows = compute_periods_and_deadline(&definition, date(2025, 5, 1)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].deadline, date(2025, 5, 31));
        assert_eq!(windows[0].key_suffix, "2024");
    }

    #[test]
    fn test_biannual_semesters() {
        let mut definition = ObligationDefinition::new("Semestral", Periodicity::Biannual);
        definition.deadline_month_offset = 2;
        definition.deadline_day = 10;

        let windows = compute_periods_and_deadline(&definition, date(2024, 8, 1)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].period_start, date(2024, 1, 1));
        assert_eq!(windows[0].period_end, date(2024, 6, 30));
        assert_eq!(windows[0].key_suffix, "2024-S1");

        let windows = compute_periods_and_deadline(&definition, date(2025, 2, 1)).unwrap();
        assert_eq!(windows[0].key_suffix, "2024-S2");
        assert_eq!(windows[0].period_start, date(2024, 7, 1));
    }

    #[test]
    fn test_event_driven_never_generates() {
        let mut definition = ObligationDefinition::new("Início de Atividade", Periodicity::Other);
        definition.calculation_basis = CalculationBasis::EventDriven;
        definition.specific_month_reference = Some(3);
        assert!(compute_periods_and_deadline(&definition, date(2024, 4, 1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_invalid_definition_is_rejected() {
        let mut definition = quarterly();
        definition.deadline_day = 40;
        assert!(matches!(
            compute_periods_and_deadline(&definition, date(2024, 4, 1)),
            Err(EngineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_huge_month_offset_is_rejected_not_wrapped() {
        let mut definition = quarterly();
        definition.deadline_month_offset = 2_147_483_648;
        assert!(matches!(
            compute_periods_and_deadline(&definition, date(2024, 4, 1)),
            Err(EngineError::InvalidDefinition { .. })
        ));
        assert!(deadline_for_period(&definition, 2024, 3).is_err());
    }

    #[test]
    fn test_monthly_offset_zero_is_due_in_its_own_month() {
        let mut definition = ObligationDefinition::new("Pagamento Especial", Periodicity::Monthly);
        definition.deadline_month_offset = 0;
        definition.deadline_day = 25;

        let windows = compute_periods_and_deadline(&definition, date(2024, 4, 1)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].key_suffix, "2024-04");
        assert_eq!(windows[0].period_start, date(2024, 4, 1));
        assert_eq!(windows[0].period_end, date(2024, 4, 30));
        assert_eq!(windows[0].deadline, date(2024, 4, 25));
    }

    #[test]
    fn test_trigger_window_relative_to_today() {
        let mut definition = ObligationDefinition::new("Pagamento por Conta", Periodicity::Monthly);
        definition.generation_trigger_offset_days = 30;
        definition.deadline_month_offset = 0;
        definition.deadline_day = 31;

        let today = date(2024, 3, 1);

        // Deadline 45 days away: outside the 30-day window.
        let mut far = period_for(&definition, 2024, 4).unwrap();
        far.deadline = today + Days::new(45);
        far.trigger_date = trigger_date(&definition, far.deadline).unwrap();
        assert!(!is_due(&far, today, None));

        // Deadline 20 days away: inside the window.
        let mut near = far.clone();
        near.deadline = today + Days::new(20);
        near.trigger_date = trigger_date(&definition, near.deadline).unwrap();
        assert!(is_due(&near, today, None));
    }

    #[test]
    fn test_backfill_window() {
        let definition = quarterly();
        let window = period_for(&definition, 2024, 3).unwrap();

        assert!(!is_due(&window, date(2024, 4, 25), None));
        assert!(is_due(&window, date(2024, 4, 25), Some(10)));
        assert!(!is_due(&window, date(2024, 5, 5), Some(10)));
    }
}
