use crate::error::{EngineError, Result};
use chrono::{Datelike, NaiveDate};

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

pub fn validate_month(month: u32) -> Result<()> {
    if !(1..=12).contains(&month) {
        return Err(EngineError::DateError(format!(
            "Invalid month {}: must be between 1 and 12",
            month
        )));
    }
    Ok(())
}

pub fn first_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    validate_month(month)?;
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| EngineError::DateError(format!("Year {} is out of range", year)))
}

pub fn last_day_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    validate_month(month)?;
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .ok_or_else(|| EngineError::DateError(format!("Year {} is out of range", year)))
}

/// Builds `year-month-day`, clamping `day` to the last valid day of the month.
///
/// Day 31 in February resolves to the 28th (or 29th); it never rolls into March.
pub fn clamped_date(year: i32, month: u32, day: u32) -> Result<NaiveDate> {
    let last = last_day_of_month(year, month)?;
    let day = day.clamp(1, last.day());
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
        EngineError::DateError(format!("Cannot build date {}-{:02}-{:02}", year, month, day))
    })
}

/// Last day of the month before `date`'s month.
pub fn prev_month_end(date: NaiveDate) -> Result<NaiveDate> {
    let (year, month) = add_months(date.year(), date.month(), -1)?;
    last_day_of_month(year, month)
}

/// Last day of the month after `date`'s month.
pub fn next_month_end(date: NaiveDate) -> Result<NaiveDate> {
    let (year, month) = add_months(date.year(), date.month(), 1)?;
    last_day_of_month(year, month)
}

/// Adds `offset` months to (year, month), carrying overflow into the year.
pub fn add_months(year: i32, month: u32, offset: i32) -> Result<(i32, u32)> {
    validate_month(month)?;
    let overflow = || {
        EngineError::DateError(format!(
            "Adding {} months to {}-{:02} is out of range",
            offset, year, month
        ))
    };

    let raw = (month as i32 - 1).checked_add(offset).ok_or_else(overflow)?;
    let carry = raw.div_euclid(12);
    let normalized = raw.rem_euclid(12) + 1;
    let year = year.checked_add(carry).ok_or_else(overflow)?;
    Ok((year, normalized as u32))
}

/// Linear month index, used to walk ranges of months without date arithmetic.
pub fn month_index(year: i32, month: u32) -> i32 {
    year * 12 + (month as i32 - 1)
}

pub fn from_month_index(index: i32) -> (i32, u32) {
    (index.div_euclid(12), (index.rem_euclid(12) + 1) as u32)
}

pub fn quarter_of(month: u32) -> u32 {
    (month.saturating_sub(1)) / 3 + 1
}

pub fn semester_of(month: u32) -> u32 {
    if month <= 6 {
        1
    } else {
        2
    }
}

pub fn month_name(month: u32) -> &'static str {
    month
        .checked_sub(1)
        .and_then(|index| MONTH_NAMES.get(index as usize))
        .copied()
        .unwrap_or("Unknown")
}

/// Lowercases and strips Portuguese/Latin accents, leaving other characters untouched.
pub fn fold_ascii(text: &str) -> String {
    text.chars()
        .flat_map(|c| c.to_lowercase())
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(
            last_day_of_month(2023, 2).unwrap(),
            NaiveDate::from_ymd_opt(2023, 2, 28).unwrap()
        );
        assert_eq!(
            last_day_of_month(2024, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            last_day_of_month(2023, 4).unwrap(),
            NaiveDate::from_ymd_opt(2023, 4, 30).unwrap()
        );
        assert!(last_day_of_month(2023, 13).is_err());
    }

    #[test]
    fn test_clamped_date_never_rolls_over() {
        assert_eq!(
            clamped_date(2023, 2, 31).unwrap(),
            NaiveDate::from_ymd_opt(2023, 2, 28).unwrap()
        );
        assert_eq!(
            clamped_date(2024, 2, 31).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            clamped_date(2024, 4, 31).unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 30).unwrap()
        );
        assert_eq!(
            clamped_date(2024, 5, 20).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 20).unwrap()
        );
    }

    #[test]
    fn test_add_months_normalization() {
        assert_eq!(add_months(2023, 11, 13).unwrap(), (2024, 12));
        assert_eq!(add_months(2023, 12, 1).unwrap(), (2024, 1));
        assert_eq!(add_months(2023, 12, 0).unwrap(), (2023, 12));
        assert_eq!(add_months(2024, 1, -1).unwrap(), (2023, 12));
        assert_eq!(add_months(2024, 3, 24).unwrap(), (2026, 3));
    }

    #[test]
    fn test_add_months_rejects_overflow() {
        assert!(add_months(2024, 6, i32::MAX).is_err());
        assert!(add_months(i32::MAX, 12, 1).is_err());
        assert!(add_months(2024, 13, 1).is_err());
    }

    #[test]
    fn test_adjacent_month_ends() {
        let mid_march = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(
            prev_month_end(mid_march).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
        assert_eq!(
            next_month_end(mid_march).unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 30).unwrap()
        );

        let new_year = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(
            prev_month_end(new_year).unwrap(),
            NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()
        );
        assert_eq!(
            next_month_end(NaiveDate::from_ymd_opt(2023, 12, 31).unwrap()).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()
        );
    }

    #[test]
    fn test_month_index_round_trip_across_years() {
        let idx = month_index(2024, 1);
        assert_eq!(from_month_index(idx - 1), (2023, 12));
        assert_eq!(from_month_index(idx + 11), (2024, 12));
    }

    #[test]
    fn test_quarter_and_semester() {
        assert_eq!(quarter_of(1), 1);
        assert_eq!(quarter_of(3), 1);
        assert_eq!(quarter_of(4), 2);
        assert_eq!(quarter_of(12), 4);
        assert_eq!(semester_of(6), 1);
        assert_eq!(semester_of(7), 2);
    }

    #[test]
    fn test_fold_ascii() {
        assert_eq!(fold_ascii("IVA Período"), "iva periodo");
        assert_eq!(fold_ascii("Retenções na Fonte"), "retencoes na fonte");
    }

    #[test]
    fn test_month_name() {
        assert_eq!(month_name(1), "January");
        assert_eq!(month_name(12), "December");
        assert_eq!(month_name(0), "Unknown");
        assert_eq!(month_name(13), "Unknown");
    }
}
