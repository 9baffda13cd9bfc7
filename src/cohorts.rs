//! Go-live detection and cohort assignment.
//!
//! A client family "goes live" in the first month its revenue satisfies the
//! methodology in force for that month's fiscal year. Before the methodology
//! year the family needs a run of consecutive months at or above the go-live
//! threshold; from then on any positive month counts.

use crate::contracts::FirstBookings;
use crate::customers::Customer;
use crate::ingestion::RevenueEntry;
use crate::schema::ReconciliationConfig;
use crate::utils::{fiscal_year, next_month_start};
use chrono::NaiveDate;
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopNameMonth {
    pub month: NaiveDate,
    pub top_name: String,
}

/// Positive revenue summed per (month, top name). Entries whose client is not
/// in the customer table are dropped.
pub fn revenue_by_top_name(
    entries: &[RevenueEntry],
    customers: &BTreeMap<String, Customer>,
) -> BTreeMap<TopNameMonth, f64> {
    let mut index = BTreeMap::new();
    let mut unresolved = 0usize;

    for entry in entries.iter().filter(|e| e.amount > 0.0) {
        let Some(customer) = customers.get(&entry.client_id) else {
            unresolved += 1;
            continue;
        };
        *index
            .entry(TopNameMonth {
                month: entry.month,
                top_name: customer.top_name.clone(),
            })
            .or_insert(0.0) += entry.amount;
    }

    if unresolved > 0 {
        debug!(
            "{} positive revenue entries skipped for go-live: client not in customer table",
            unresolved
        );
    }

    index
}

fn sustained_from(
    index: &BTreeMap<TopNameMonth, f64>,
    start: &TopNameMonth,
    config: &ReconciliationConfig,
) -> bool {
    let mut month = Some(start.month);

    for _ in 0..config.legacy_consecutive_months {
        let Some(current) = month else {
            return false;
        };
        let amount = index.get(&TopNameMonth {
            month: current,
            top_name: start.top_name.clone(),
        });
        match amount {
            Some(amount) if *amount >= config.go_live_threshold => {}
            _ => return false,
        }
        month = next_month_start(current);
    }

    true
}

/// Go-live month per top name.
pub fn compute_go_live_dates(
    entries: &[RevenueEntry],
    customers: &BTreeMap<String, Customer>,
    config: &ReconciliationConfig,
) -> BTreeMap<String, NaiveDate> {
    let index = revenue_by_top_name(entries, customers);
    let mut go_live: BTreeMap<String, NaiveDate> = BTreeMap::new();

    for (key, amount) in &index {
        if let Some(existing) = go_live.get(&key.top_name) {
            if *existing <= key.month {
                continue;
            }
        }

        let qualifies = if fiscal_year(key.month, config.fiscal_year_start_month)
            < config.go_live_methodology_year
        {
            sustained_from(&index, key, config)
        } else {
            *amount > 0.0
        };

        if qualifies {
            go_live.insert(key.top_name.clone(), key.month);
        }
    }

    info!(
        "Go-live found for {} of {} client families",
        go_live.len(),
        index
            .keys()
            .map(|k| k.top_name.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    );

    go_live
}

/// Fills first booking, cohort, go-live cohort and the old-never-live flag.
///
/// A cohort override for the customer's native id replaces the computed
/// cohort and is also what `old_never_live` is judged on.
pub fn apply_first_bookings_and_cohorts(
    customers: &mut BTreeMap<String, Customer>,
    first_bookings: &FirstBookings,
    go_live: &BTreeMap<String, NaiveDate>,
    cohort_overrides: &BTreeMap<String, i32>,
    config: &ReconciliationConfig,
) {
    let start_month = config.fiscal_year_start_month;
    let mut overridden = 0usize;

    for customer in customers.values_mut() {
        customer.first_booking = first_bookings.for_top_name(&customer.top_name);
        customer.cohort = customer
            .first_booking
            .map(|date| fiscal_year(date, start_month));
        customer.go_live_cohort = go_live
            .get(&customer.top_name)
            .map(|date| fiscal_year(*date, start_month));

        if let Some(year) = cohort_overrides.get(&customer.native_id) {
            customer.cohort = Some(*year);
            overridden += 1;
        }

        customer.old_never_live = matches!(
            customer.cohort,
            Some(cohort) if cohort < config.go_live_methodology_year
        ) && customer.go_live_cohort.is_none();
    }

    debug!("Applied {} cohort overrides", overridden);
}
