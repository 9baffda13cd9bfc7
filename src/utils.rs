use crate::error::{ReconciliationError, Result};
use chrono::{Datelike, Months, NaiveDate};

/// Decimal places kept on every emitted monetary aggregate.
pub const AGGREGATE_DECIMAL_PLACES: i32 = 4;

/// Truncates a date to the first day of its month.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the month following `date`'s month.
pub fn next_month_start(date: NaiveDate) -> Option<NaiveDate> {
    month_start(date).checked_add_months(Months::new(1))
}

/// Returns the fiscal year a date belongs to.
///
/// A fiscal year is named after the calendar year in which it ends, so with a
/// May start: April 2010 is FY2010 and May 2010 is FY2011. A January start
/// makes the fiscal year equal the calendar year.
pub fn fiscal_year(date: NaiveDate, start_month: u32) -> i32 {
    if start_month > 1 && date.month() >= start_month {
        date.year() + 1
    } else {
        date.year()
    }
}

/// Integer date key in `YYYYMM01` form, as used by the reporting warehouse.
pub fn date_key(date: NaiveDate) -> u32 {
    let first = month_start(date);
    first.year().max(0) as u32 * 10_000 + first.month() * 100 + 1
}

pub fn round_to(value: f64, decimal_places: i32) -> f64 {
    let factor = 10f64.powi(decimal_places);
    (value * factor).round() / factor
}

pub fn round_aggregate(value: f64) -> f64 {
    round_to(value, AGGREGATE_DECIMAL_PLACES)
}

pub fn validate_fiscal_year_start_month(month: u32) -> Result<()> {
    if !(1..=12).contains(&month) {
        return Err(ReconciliationError::InvalidFiscalYearStartMonth(month));
    }
    Ok(())
}

/// Keeps the trailing `count` characters of an identifier.
pub fn trailing_chars(value: &str, count: usize) -> &str {
    let len = value.chars().count();
    if len <= count {
        return value;
    }
    let skip = len - count;
    match value.char_indices().nth(skip) {
        Some((idx, _)) => &value[idx..],
        None => value,
    }
}
