//! Month-by-month "current client" flags per account family.

use crate::customers::Customer;
use crate::error::{ReconciliationError, Result};
use crate::ingestion::RevenueEntry;
use crate::overrides::{ActiveClientOverrides, ActivityGrid};
use crate::schema::SourceSystem;
use crate::utils::date_key;
use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct FamilyClientMonth {
    family_id: String,
    native_id: String,
    month: NaiveDate,
}

/// The native client that reports for an account family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyAssignment {
    pub native_id: String,
    /// Latest month the client had recurring revenue. `None` for families
    /// that only exist in the override sheet.
    pub month: Option<NaiveDate>,
    pub source: SourceSystem,
}

impl FamilyAssignment {
    /// True when `self` should replace `current` as the family's reporter.
    fn outranks(&self, current: &FamilyAssignment) -> bool {
        self.month
            .cmp(&current.month)
            .then_with(|| {
                current
                    .source
                    .priority_rank()
                    .cmp(&self.source.priority_rank())
            })
            .then_with(|| current.native_id.cmp(&self.native_id))
            .is_gt()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveClientRow {
    pub family_id: String,
    pub client_id: String,
    pub month: NaiveDate,
    pub date_key: u32,
    pub current_client: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActiveClientReport {
    pub grid: ActivityGrid,
    pub assignments: BTreeMap<String, FamilyAssignment>,
}

impl ActiveClientReport {
    /// Flattened grid, ordered by family then month.
    pub fn rows(&self) -> Vec<ActiveClientRow> {
        self.grid
            .iter()
            .filter_map(|(family_id, months)| {
                let assignment = self.assignments.get(family_id)?;
                Some(months.iter().map(move |(month, active)| ActiveClientRow {
                    family_id: family_id.clone(),
                    client_id: assignment.native_id.clone(),
                    month: *month,
                    date_key: date_key(*month),
                    current_client: u8::from(*active),
                }))
            })
            .flatten()
            .collect()
    }

    pub fn is_active(&self, family_id: &str, month: NaiveDate) -> bool {
        self.grid
            .get(family_id)
            .and_then(|months| months.get(&month))
            .copied()
            .unwrap_or(false)
    }
}

/// Fills single-month gaps: an inactive month between two active ones is
/// flipped to active. The first and last months are never changed.
pub fn smooth_up_down_up(flags: &[bool]) -> Vec<bool> {
    let mut smoothed = flags.to_vec();
    for i in 1..flags.len().saturating_sub(1) {
        if !flags[i] && flags[i - 1] && flags[i + 1] {
            smoothed[i] = true;
        }
    }
    smoothed
}

/// Builds the active-client grid from recurring revenue and layers the manual
/// overrides on top.
pub fn resolve_active_clients(
    entries: &[RevenueEntry],
    customers: &BTreeMap<String, Customer>,
    overrides: &ActiveClientOverrides,
    threshold: f64,
) -> Result<ActiveClientReport> {
    let mut sums: BTreeMap<FamilyClientMonth, f64> = BTreeMap::new();
    let mut months: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut assignments: BTreeMap<String, FamilyAssignment> = BTreeMap::new();

    for entry in entries {
        if !entry.recurring || entry.amount == 0.0 || overrides.is_excluded(&entry.client_id) {
            continue;
        }
        let Some(customer) = customers.get(&entry.client_id) else {
            continue;
        };

        months.insert(entry.month);
        *sums
            .entry(FamilyClientMonth {
                family_id: customer.family_id.clone(),
                native_id: entry.client_id.clone(),
                month: entry.month,
            })
            .or_insert(0.0) += entry.amount;

        let candidate = FamilyAssignment {
            native_id: entry.client_id.clone(),
            month: Some(entry.month),
            source: entry.source,
        };
        match assignments.get_mut(&customer.family_id) {
            Some(current) => {
                if candidate.outranks(current) {
                    *current = candidate;
                }
            }
            None => {
                assignments.insert(customer.family_id.clone(), candidate);
            }
        }
    }

    let mut present: BTreeSet<(String, NaiveDate)> = BTreeSet::new();
    for (key, amount) in &sums {
        if *amount > threshold {
            present.insert((key.family_id.clone(), key.month));
        }
    }

    let months: Vec<NaiveDate> = months.into_iter().collect();
    let mut computed = ActivityGrid::new();
    for family_id in assignments.keys() {
        let flags: Vec<bool> = months
            .iter()
            .map(|month| present.contains(&(family_id.clone(), *month)))
            .collect();
        let smoothed = smooth_up_down_up(&flags);
        computed.insert(
            family_id.clone(),
            months.iter().copied().zip(smoothed).collect(),
        );
    }

    debug!(
        "Computed activity for {} families over {} months",
        computed.len(),
        months.len()
    );

    let grid = overrides.apply(&computed);

    for family_id in grid.keys() {
        if assignments.contains_key(family_id) {
            continue;
        }
        let customer = customers
            .values()
            .find(|c| &c.family_id == family_id)
            .ok_or_else(|| ReconciliationError::UnknownOverrideFamily(family_id.clone()))?;
        assignments.insert(
            family_id.clone(),
            FamilyAssignment {
                native_id: customer.native_id.clone(),
                month: None,
                source: customer.source,
            },
        );
    }

    info!(
        "Active client grid covers {} families ({} from overrides only)",
        grid.len(),
        grid.len() - computed.len()
    );

    Ok(ActiveClientReport { grid, assignments })
}
