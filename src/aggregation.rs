//! Monthly ASF series built from classified contracts.

use crate::contracts::{BookingCategory, Contract, ContractType};
use crate::error::{ReconciliationError, Result};
use crate::utils::{month_start, round_aggregate};
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CumulativeKey {
    pub product_id: i64,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IncrementalKey {
    pub product_id: i64,
    pub client_id: String,
    pub contract_type: ContractType,
    pub booking_category: BookingCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativeAsfRow {
    pub month: NaiveDate,
    pub product_id: i64,
    pub client_id: String,
    pub asf: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalAsfRow {
    pub month: NaiveDate,
    pub product_id: i64,
    pub client_id: String,
    pub contract_type: ContractType,
    pub booking_category: BookingCategory,
    pub asf: f64,
}

/// month -> client -> product -> cumulative ASF at the end of that month.
pub type BookingSnapshots = BTreeMap<NaiveDate, BTreeMap<String, BTreeMap<i64, f64>>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CumulativeBookings {
    pub rows: Vec<CumulativeAsfRow>,
    pub snapshots: BookingSnapshots,
}

/// Buckets contracts by month, skipping months after `as_of`. Contracts inside
/// a bucket are kept in (effective date, id) order so sums are reproducible.
fn contracts_by_month(contracts: &[Contract], as_of: NaiveDate) -> BTreeMap<NaiveDate, Vec<&Contract>> {
    let mut by_month: BTreeMap<NaiveDate, Vec<&Contract>> = BTreeMap::new();

    for contract in contracts {
        let month = month_start(contract.effective_date);
        if month <= as_of {
            by_month.entry(month).or_default().push(contract);
        }
    }

    for bucket in by_month.values_mut() {
        bucket.sort_by(|a, b| {
            a.effective_date
                .cmp(&b.effective_date)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    by_month
}

/// Running ASF per (product, client). Accumulators are never reset, so every
/// month re-emits every key seen so far.
pub fn cumulative_asf(contracts: &[Contract], as_of: NaiveDate) -> CumulativeBookings {
    let mut accumulators: BTreeMap<CumulativeKey, f64> = BTreeMap::new();
    let mut result = CumulativeBookings::default();

    for (month, month_contracts) in contracts_by_month(contracts, as_of) {
        for contract in month_contracts {
            *accumulators
                .entry(CumulativeKey {
                    product_id: contract.product_id,
                    client_id: contract.client_id.clone(),
                })
                .or_insert(0.0) += contract.asf;
        }

        let snapshot = result.snapshots.entry(month).or_default();
        for (key, asf) in &accumulators {
            result.rows.push(CumulativeAsfRow {
                month,
                product_id: key.product_id,
                client_id: key.client_id.clone(),
                asf: round_aggregate(*asf),
            });
            snapshot
                .entry(key.client_id.clone())
                .or_default()
                .insert(key.product_id, *asf);
        }
    }

    debug!(
        "Cumulative bookings: {} rows over {} months",
        result.rows.len(),
        result.snapshots.len()
    );

    result
}

/// Net ASF change per (product, client, contract type, booking category) and
/// month.
pub fn incremental_asf(contracts: &[Contract], as_of: NaiveDate) -> Result<Vec<IncrementalAsfRow>> {
    let mut rows = Vec::new();

    for (month, month_contracts) in contracts_by_month(contracts, as_of) {
        let mut accumulators: BTreeMap<IncrementalKey, f64> = BTreeMap::new();

        for contract in month_contracts {
            let contract_type = contract
                .contract_type
                .ok_or_else(|| ReconciliationError::UnclassifiedContract(contract.id.clone()))?;

            *accumulators
                .entry(IncrementalKey {
                    product_id: contract.product_id,
                    client_id: contract.client_id.clone(),
                    contract_type,
                    booking_category: contract.booking_category,
                })
                .or_insert(0.0) += contract.asf;
        }

        rows.extend(accumulators.into_iter().map(|(key, asf)| IncrementalAsfRow {
            month,
            product_id: key.product_id,
            client_id: key.client_id,
            contract_type: key.contract_type,
            booking_category: key.booking_category,
            asf: round_aggregate(asf),
        }));
    }

    debug!("Incremental bookings: {} rows", rows.len());

    Ok(rows)
}

/// Clients whose latest cumulative bookings are all on connections products,
/// allowing `slop` of ASF on anything else.
pub fn connections_only_clients(
    snapshots: &BookingSnapshots,
    connections_products: &BTreeSet<i64>,
    slop: f64,
) -> BTreeSet<String> {
    let Some((_, latest)) = snapshots.iter().next_back() else {
        return BTreeSet::new();
    };

    latest
        .iter()
        .filter_map(|(client_id, products)| {
            let (connections, other) =
                products
                    .iter()
                    .fold((0.0, 0.0), |(connections, other), (product_id, asf)| {
                        if connections_products.contains(product_id) {
                            (connections + asf, other)
                        } else {
                            (connections, other + asf)
                        }
                    });

            (connections > 0.0 && other < slop).then(|| client_id.clone())
        })
        .collect()
}
