use crate::contracts::MONTHS_PER_YEAR;
use crate::customers::{SourceCustomer, MISSING_PRODUCT_ID, OTHER};
use crate::schema::{
    BillingLine, ClientMonth, CoreCustomerRecord, ExchangeRate, ExpressRow, ImplementationRecord,
    LedgerKind, LegacyBibleRow, PaymentLine, ReferenceTables, RevenueRecord, SourceSystem,
};
use crate::utils::{month_start, trailing_chars};
use chrono::NaiveDate;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const USD_CURRENCY_ID: i64 = 1;
pub const PRIMARY_SUBSIDIARY_ID: i64 = 1;
pub const LEGACY_ID_PREFIX: &str = "PR";
pub const UNKNOWN_BILLING_FREQUENCY_ID: i64 = -1;
pub const UNKNOWN_BILLING_FREQUENCY: &str = "Unknown";
pub const UNKNOWN_IMPLEMENTATION_PHASE: &str = "N/A";
/// Implementation phases that no longer belong in the pipeline.
const CLOSED_IMPLEMENTATION_PHASES: [&str; 3] =
    ["Completed", "Cancelled", "Not Implemented - Retired"];
const LEGACY_ID_DIGITS: usize = 5;
const ARCHIVE_VERTICAL: &str = "Retail";
const ARCHIVE_COUNTRY: &str = "US";
const ARCHIVE_REGION: &str = "North America";
/// Verticals folded into retail for reporting.
const RETAIL_ALIASES: [&str; 2] = ["Media", "Travel & Leisure"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueEntry {
    pub month: NaiveDate,
    pub client_id: String,
    pub product_id: i64,
    pub recurring: bool,
    pub amount: f64,
    pub source: SourceSystem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEntry {
    pub month: NaiveDate,
    pub client_id: String,
    pub invoice_type: i8,
    pub billing_frequency_id: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEntry {
    pub month: NaiveDate,
    pub client_id: String,
    pub amount: f64,
}

pub fn core_customers(
    records: &[CoreCustomerRecord],
    reference: &ReferenceTables,
) -> Vec<SourceCustomer> {
    records
        .iter()
        .map(|record| {
            let vertical = record
                .vertical_id
                .and_then(|id| reference.verticals.get(&id))
                .map(|name| {
                    if RETAIL_ALIASES.contains(&name.as_str()) {
                        ARCHIVE_VERTICAL.to_string()
                    } else {
                        name.clone()
                    }
                })
                .unwrap_or_else(|| OTHER.to_string());

            let country = record
                .country
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| OTHER.to_string());
            let region = reference
                .country_regions
                .get(&country)
                .cloned()
                .unwrap_or_else(|| OTHER.to_string());

            let parent_id = record
                .parent_id
                .filter(|id| *id != 0)
                .map(|id| id.to_string());

            SourceCustomer {
                native_id: record.id.to_string(),
                name: record.full_name.clone(),
                country,
                region,
                vertical,
                parent_id,
                source: SourceSystem::Core,
            }
        })
        .collect()
}

pub fn legacy_client_id(raw_id: &str) -> String {
    format!(
        "{}{}",
        LEGACY_ID_PREFIX,
        trailing_chars(raw_id.trim(), LEGACY_ID_DIGITS)
    )
}

fn archive_customer(native_id: String, name: &str, source: SourceSystem) -> SourceCustomer {
    SourceCustomer {
        parent_id: Some(native_id.clone()),
        native_id,
        name: name.to_string(),
        country: ARCHIVE_COUNTRY.to_string(),
        region: ARCHIVE_REGION.to_string(),
        vertical: ARCHIVE_VERTICAL.to_string(),
        source,
    }
}

/// Picks one name per client id: the name on the latest month, with ties
/// going to the smallest name.
fn names_by_latest_month<'a>(
    rows: impl IntoIterator<Item = (String, NaiveDate, &'a str)>,
) -> BTreeMap<String, &'a str> {
    let mut latest: BTreeMap<String, (NaiveDate, &str)> = BTreeMap::new();
    for (id, month, name) in rows {
        let name = name.trim();
        latest
            .entry(id)
            .and_modify(|current| {
                if month > current.0 || (month == current.0 && name < current.1) {
                    *current = (month, name);
                }
            })
            .or_insert((month, name));
    }

    latest
        .into_iter()
        .map(|(id, (_, name))| (id, name))
        .collect()
}

/// One customer per legacy id. Several raw ids can share a legacy id; the
/// name on the latest month wins.
pub fn legacy_customers(rows: &[LegacyBibleRow]) -> Vec<SourceCustomer> {
    let names = names_by_latest_month(
        rows.iter()
            .map(|row| (legacy_client_id(&row.raw_id), row.month, row.name.as_str())),
    );

    names
        .into_iter()
        .map(|(id, name)| archive_customer(id, name, SourceSystem::Legacy))
        .collect()
}

pub fn express_customers(rows: &[ExpressRow]) -> Vec<SourceCustomer> {
    let names = names_by_latest_month(
        rows.iter()
            .map(|row| (row.client_id.trim().to_string(), row.month, row.name.as_str())),
    );

    names
        .into_iter()
        .map(|(id, name)| archive_customer(id, name, SourceSystem::Express))
        .collect()
}

pub fn core_revenue_entries(records: &[RevenueRecord]) -> Vec<RevenueEntry> {
    records
        .iter()
        .map(|record| RevenueEntry {
            month: month_start(record.date),
            client_id: record.client_id.to_string(),
            product_id: record.product_id,
            recurring: record.recurring,
            amount: record.amount,
            source: SourceSystem::Core,
        })
        .collect()
}

fn collapse_legacy(rows: &[LegacyBibleRow], kind: LedgerKind) -> BTreeMap<ClientMonth, f64> {
    let mut sums: BTreeMap<ClientMonth, f64> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.kind == kind) {
        *sums
            .entry(ClientMonth {
                client_id: legacy_client_id(&row.raw_id),
                month: month_start(row.month),
            })
            .or_insert(0.0) += row.amount.unwrap_or(0.0);
    }
    sums
}

/// Legacy revenue lines summed per client and month. The archive carries no
/// product detail and only recurring revenue.
pub fn legacy_revenue_entries(rows: &[LegacyBibleRow]) -> Vec<RevenueEntry> {
    collapse_legacy(rows, LedgerKind::Revenue)
        .into_iter()
        .map(|(key, amount)| RevenueEntry {
            month: key.month,
            client_id: key.client_id,
            product_id: MISSING_PRODUCT_ID,
            recurring: true,
            amount,
            source: SourceSystem::Legacy,
        })
        .collect()
}

pub fn legacy_billing_entries(rows: &[LegacyBibleRow]) -> Vec<BillingEntry> {
    collapse_legacy(rows, LedgerKind::Billing)
        .into_iter()
        .map(|(key, amount)| BillingEntry {
            month: key.month,
            client_id: key.client_id,
            invoice_type: -1,
            billing_frequency_id: UNKNOWN_BILLING_FREQUENCY_ID,
            amount,
        })
        .collect()
}

/// Express activity expressed as recurring revenue. Only the active-client
/// grid consumes these.
pub fn express_revenue_entries(rows: &[ExpressRow]) -> Vec<RevenueEntry> {
    rows.iter()
        .map(|row| RevenueEntry {
            month: month_start(row.month),
            client_id: row.client_id.trim().to_string(),
            product_id: MISSING_PRODUCT_ID,
            recurring: true,
            amount: row.amount,
            source: SourceSystem::Express,
        })
        .collect()
}

/// Puts revenue entries in (month, client, product, source) order so output
/// does not depend on extract order.
pub fn sort_revenue_entries(entries: &mut [RevenueEntry]) {
    entries.sort_by(|a, b| {
        a.month
            .cmp(&b.month)
            .then_with(|| a.client_id.cmp(&b.client_id))
            .then_with(|| a.product_id.cmp(&b.product_id))
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.recurring.cmp(&b.recurring))
            .then_with(|| a.amount.total_cmp(&b.amount))
    });
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct CurrencyDate {
    currency_id: i64,
    date: NaiveDate,
}

/// Exchange rates to USD by currency and effective date.
#[derive(Debug, Clone, Default)]
pub struct ExchangeRateIndex {
    rates: BTreeMap<CurrencyDate, f64>,
}

impl ExchangeRateIndex {
    pub fn from_rates(rates: &[ExchangeRate]) -> Self {
        let rates = rates
            .iter()
            .map(|rate| {
                (
                    CurrencyDate {
                        currency_id: rate.currency_id,
                        date: rate.date,
                    },
                    rate.rate,
                )
            })
            .collect();
        Self { rates }
    }

    /// Multiplier that brings an amount to USD. Amounts booked in USD or by the
    /// primary subsidiary pass through; a missing rate zeroes the amount.
    pub fn usd_factor(&self, currency_id: i64, subsidiary_id: i64, date: NaiveDate) -> f64 {
        if currency_id == USD_CURRENCY_ID || subsidiary_id == PRIMARY_SUBSIDIARY_ID {
            return 1.0;
        }

        match self.rates.get(&CurrencyDate { currency_id, date }) {
            Some(rate) => *rate,
            None => {
                warn!(
                    "No exchange rate for currency {} on {}; treating amount as zero",
                    currency_id, date
                );
                0.0
            }
        }
    }
}

fn client_key(client_id: Option<i64>) -> String {
    client_id.unwrap_or(0).to_string()
}

/// Payments received, in USD, per client and month. Receivable lines are
/// credits, so the sign is flipped.
pub fn payment_entries(lines: &[PaymentLine], rates: &ExchangeRateIndex) -> Vec<PaymentEntry> {
    let mut sums: BTreeMap<ClientMonth, f64> = BTreeMap::new();

    for line in lines {
        let factor = rates.usd_factor(line.currency_id, line.subsidiary_id, line.date);
        *sums
            .entry(ClientMonth {
                client_id: client_key(line.client_id),
                month: month_start(line.date),
            })
            .or_insert(0.0) += -line.amount * factor;
    }

    debug!("Collapsed {} payment lines into {} entries", lines.len(), sums.len());

    sums.into_iter()
        .map(|(key, amount)| PaymentEntry {
            month: key.month,
            client_id: key.client_id,
            amount,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct BillingKey {
    client_id: String,
    month: NaiveDate,
    invoice_type: i8,
    billing_frequency_id: i64,
}

/// Net billings (invoices less credit memos), in USD, per client, month,
/// invoice type and billing frequency.
pub fn billing_entries(lines: &[BillingLine], rates: &ExchangeRateIndex) -> Vec<BillingEntry> {
    let mut sums: BTreeMap<BillingKey, f64> = BTreeMap::new();

    for line in lines {
        let factor = rates.usd_factor(line.currency_id, line.subsidiary_id, line.period_start);
        *sums
            .entry(BillingKey {
                client_id: client_key(line.client_id),
                month: month_start(line.period_start),
                invoice_type: line.transaction_type.code(),
                billing_frequency_id: line
                    .billing_frequency_id
                    .unwrap_or(UNKNOWN_BILLING_FREQUENCY_ID),
            })
            .or_insert(0.0) += line.amount * factor;
    }

    debug!("Collapsed {} billing lines into {} entries", lines.len(), sums.len());

    sums.into_iter()
        .map(|(key, amount)| BillingEntry {
            month: key.month,
            client_id: key.client_id,
            invoice_type: key.invoice_type,
            billing_frequency_id: key.billing_frequency_id,
            amount,
        })
        .collect()
}

/// Billing frequency names by id, including the placeholder that billing
/// entries without a frequency point at.
pub fn billing_frequencies(names: &BTreeMap<i64, String>) -> BTreeMap<i64, String> {
    let mut frequencies = names.clone();
    frequencies.insert(
        UNKNOWN_BILLING_FREQUENCY_ID,
        UNKNOWN_BILLING_FREQUENCY.to_string(),
    );
    frequencies
}

/// Open implementation ASF per client, launch month and phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplementationEntry {
    pub month: NaiveDate,
    pub client_id: String,
    pub phase: String,
    pub asf: f64,
}

/// An open implementation with neither an actual nor a projected launch date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndatedImplementation {
    pub client_id: String,
    pub phase: String,
    pub asf: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImplementationPipeline {
    pub entries: Vec<ImplementationEntry>,
    pub undated: Vec<UndatedImplementation>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct ImplementationKey {
    client_id: String,
    month: NaiveDate,
    phase: String,
}

/// Implementation records still in flight, dated by actual launch or else the
/// projected launch. Closed phases are dropped.
pub fn implementation_entries(
    records: &[ImplementationRecord],
    phases: &BTreeMap<i64, String>,
) -> ImplementationPipeline {
    let mut sums: BTreeMap<ImplementationKey, f64> = BTreeMap::new();
    let mut undated = Vec::new();
    let mut closed = 0usize;

    for record in records {
        let phase = record
            .phase_id
            .and_then(|id| phases.get(&id))
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_IMPLEMENTATION_PHASE);
        if CLOSED_IMPLEMENTATION_PHASES.contains(&phase) {
            closed += 1;
            continue;
        }

        let client_id = client_key(record.customer_id);
        let asf = record.monthly_fee.unwrap_or(0.0) * MONTHS_PER_YEAR;

        match record.actual_launch.or(record.projected_launch) {
            Some(date) => {
                *sums
                    .entry(ImplementationKey {
                        client_id,
                        month: month_start(date),
                        phase: phase.to_string(),
                    })
                    .or_insert(0.0) += asf;
            }
            None => undated.push(UndatedImplementation {
                client_id,
                phase: phase.to_string(),
                asf,
            }),
        }
    }

    undated.sort_by(|a, b| {
        a.client_id
            .cmp(&b.client_id)
            .then_with(|| a.phase.cmp(&b.phase))
            .then_with(|| a.asf.total_cmp(&b.asf))
    });

    debug!(
        "Implementations: {} entries, {} undated, {} closed",
        sums.len(),
        undated.len(),
        closed
    );

    ImplementationPipeline {
        entries: sums
            .into_iter()
            .map(|(key, asf)| ImplementationEntry {
                month: key.month,
                client_id: key.client_id,
                phase: key.phase,
                asf,
            })
            .collect(),
        undated,
    }
}
