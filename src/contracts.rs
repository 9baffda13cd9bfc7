use crate::customers::{Customer, Product, MISSING_ID, MISSING_NAME, MISSING_PRODUCT_ID};
use crate::error::{ReconciliationError, Result};
use crate::schema::{ClientMonth, ContractRecord};
use crate::utils::{date_key, month_start};
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Months of subscription fee in one ASF.
pub const MONTHS_PER_YEAR: f64 = 12.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BookingCategory {
    Gross,
    LiveAdjustment,
    Debooking,
    Unknown,
}

impl BookingCategory {
    /// Derives the category from the live adjustment and implementation
    /// debooking flags. Both flags set at once is corrupt data.
    pub fn from_flags(
        contract_id: &str,
        live_adjustment: Option<bool>,
        debooking: Option<bool>,
    ) -> Result<Self> {
        match (live_adjustment, debooking) {
            (None, None) => Ok(Self::Unknown),
            (Some(true), Some(true)) => Err(ReconciliationError::AmbiguousBookingFlags {
                contract_id: contract_id.to_string(),
            }),
            (Some(true), _) => Ok(Self::LiveAdjustment),
            (_, Some(true)) => Ok(Self::Debooking),
            _ => Ok(Self::Gross),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContractType {
    New,
    Uptick,
    Downtick,
}

impl ContractType {
    /// A contract on the family's first booking date is new business no matter
    /// its sign; afterwards the sign of the ASF decides.
    pub fn classify(
        effective_date: NaiveDate,
        asf: f64,
        first_booking: Option<NaiveDate>,
    ) -> Self {
        if first_booking == Some(effective_date) {
            Self::New
        } else if asf < 0.0 {
            Self::Downtick
        } else {
            Self::Uptick
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub client_id: String,
    pub client_top_name: String,
    pub product_id: i64,
    pub isf: Option<f64>,
    pub monthly_value: f64,
    pub asf: f64,
    pub effective_date: NaiveDate,
    pub booking_category: BookingCategory,
    pub contract_type: Option<ContractType>,
}

/// Builds the contract set from raw rows, dropping renewals, undated
/// contracts and contracts without a monthly value.
///
/// The result is ordered by effective date, then id.
pub fn build_contracts(
    records: &[ContractRecord],
    customers: &BTreeMap<String, Customer>,
    products: &BTreeMap<i64, Product>,
) -> Result<Vec<Contract>> {
    let mut contracts = Vec::new();
    let mut skipped = 0usize;

    for record in records {
        let (effective_date, monthly_value) = match (record.effective_date, record.monthly_value)
        {
            (Some(date), Some(value)) if !record.renewal && value != 0.0 => (date, value),
            _ => {
                skipped += 1;
                continue;
            }
        };

        let id = record.id.to_string();

        let (client_id, client_top_name) = match record.customer_id {
            Some(customer_id) => {
                let key = customer_id.to_string();
                let customer = customers.get(&key).ok_or_else(|| {
                    ReconciliationError::UnknownContractCustomer(id.clone(), key.clone())
                })?;
                (customer.native_id.clone(), customer.top_name.clone())
            }
            None => (MISSING_ID.to_string(), MISSING_NAME.to_string()),
        };

        let product_id = match record.product_id {
            Some(product_id) if products.contains_key(&product_id) => product_id,
            Some(product_id) => {
                warn!(
                    "Contract {} references unknown product {}; using placeholder",
                    id, product_id
                );
                MISSING_PRODUCT_ID
            }
            None => MISSING_PRODUCT_ID,
        };

        let booking_category =
            BookingCategory::from_flags(&id, record.live_adjustment, record.debooking)?;

        contracts.push(Contract {
            id,
            client_id,
            client_top_name,
            product_id,
            isf: record.isf,
            monthly_value,
            asf: monthly_value * MONTHS_PER_YEAR,
            effective_date,
            booking_category,
            contract_type: None,
        });
    }

    sort_by_effective_date(&mut contracts);

    info!(
        "Built {} contracts ({} renewal, undated or zero-value rows skipped)",
        contracts.len(),
        skipped
    );

    Ok(contracts)
}

pub(crate) fn sort_by_effective_date(contracts: &mut [Contract]) {
    contracts.sort_by(|a, b| {
        a.effective_date
            .cmp(&b.effective_date)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopNameProduct {
    pub top_name: String,
    pub product_id: i64,
}

/// Earliest booking per client family, overall and per product.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirstBookings {
    pub by_top_name: BTreeMap<String, NaiveDate>,
    pub by_top_name_and_product: BTreeMap<TopNameProduct, NaiveDate>,
}

impl FirstBookings {
    pub fn for_top_name(&self, top_name: &str) -> Option<NaiveDate> {
        self.by_top_name.get(top_name).copied()
    }
}

pub fn compute_first_bookings(contracts: &[Contract]) -> FirstBookings {
    let mut first = FirstBookings::default();

    for contract in contracts {
        first
            .by_top_name
            .entry(contract.client_top_name.clone())
            .and_modify(|date| *date = (*date).min(contract.effective_date))
            .or_insert(contract.effective_date);

        first
            .by_top_name_and_product
            .entry(TopNameProduct {
                top_name: contract.client_top_name.clone(),
                product_id: contract.product_id,
            })
            .and_modify(|date| *date = (*date).min(contract.effective_date))
            .or_insert(contract.effective_date);
    }

    first
}

/// Sets the contract type on every contract, in effective-date order, looking
/// the first booking up by the client's top name.
pub fn classify_contracts(contracts: &mut [Contract], first_bookings: &FirstBookings) {
    sort_by_effective_date(contracts);

    for contract in contracts.iter_mut() {
        let first_booking = first_bookings.for_top_name(&contract.client_top_name);
        contract.contract_type = Some(ContractType::classify(
            contract.effective_date,
            contract.asf,
            first_booking,
        ));
    }

    debug!("Classified {} contracts", contracts.len());
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealCountRow {
    pub client_id: String,
    pub month: NaiveDate,
    pub date_key: u32,
    pub count: usize,
}

/// Number of distinct gross-booking dates per client and month.
pub fn monthly_deal_counts(contracts: &[Contract]) -> Vec<DealCountRow> {
    let mut deal_dates: BTreeMap<ClientMonth, BTreeSet<NaiveDate>> = BTreeMap::new();

    for contract in contracts
        .iter()
        .filter(|c| c.booking_category == BookingCategory::Gross)
    {
        deal_dates
            .entry(ClientMonth {
                client_id: contract.client_id.clone(),
                month: month_start(contract.effective_date),
            })
            .or_default()
            .insert(contract.effective_date);
    }

    deal_dates
        .into_iter()
        .map(|(key, dates)| DealCountRow {
            date_key: date_key(key.month),
            client_id: key.client_id,
            month: key.month,
            count: dates.len(),
        })
        .collect()
}
