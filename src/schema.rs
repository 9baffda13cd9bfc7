use crate::error::{ReconciliationError, Result};
use crate::identity::IdentityMappingRecord;
use crate::overrides::{ActiveClientOverrideSheet, EntityOverrideRecord};
use crate::utils::validate_fiscal_year_start_month;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// The system a record originated from.
///
/// The variant order is the reporting priority used when several native
/// clients compete to represent one account family: a core-system record
/// beats a legacy record, which beats a connections-only record, which beats
/// an express import.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
pub enum SourceSystem {
    #[serde(rename = "BV")]
    #[schemars(description = "Core CRM/ERP system")]
    Core,

    #[serde(rename = "PR")]
    #[schemars(description = "Legacy spreadsheet archive (the 'bible')")]
    Legacy,

    #[serde(rename = "CN")]
    #[schemars(description = "Connections-only client carved out of the core system")]
    Connections,

    #[serde(rename = "EX")]
    #[schemars(description = "Express import file")]
    Express,
}

impl SourceSystem {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Core => "BV",
            Self::Legacy => "PR",
            Self::Connections => "CN",
            Self::Express => "EX",
        }
    }

    /// Lower rank wins a tie.
    pub fn priority_rank(&self) -> u8 {
        match self {
            Self::Core => 0,
            Self::Legacy => 1,
            Self::Connections => 2,
            Self::Express => 3,
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SourceSystem {
    type Err = ReconciliationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BV" => Ok(Self::Core),
            "PR" => Ok(Self::Legacy),
            "CN" => Ok(Self::Connections),
            "EX" => Ok(Self::Express),
            other => Err(ReconciliationError::UnknownSourceSystem(other.to_string())),
        }
    }
}

/// Composite key for per-client, per-month sums.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientMonth {
    pub client_id: String,
    pub month: NaiveDate,
}

/// Tunables for a reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReconciliationConfig {
    #[schemars(
        description = "Run date. Months after this date are ignored by the booking aggregators."
    )]
    pub as_of: NaiveDate,

    #[schemars(
        description = "First month of the fiscal year (1-12). Months on or after it belong to the next calendar year's fiscal year."
    )]
    pub fiscal_year_start_month: u32,

    #[schemars(
        description = "Monthly revenue a client must reach in each consecutive month to go live under the legacy methodology."
    )]
    pub go_live_threshold: f64,

    #[schemars(
        description = "First fiscal year evaluated under the current go-live methodology (any positive revenue)."
    )]
    pub go_live_methodology_year: i32,

    #[schemars(
        description = "Number of consecutive months at or above the threshold required by the legacy methodology."
    )]
    pub legacy_consecutive_months: u32,

    #[schemars(
        description = "Recurring revenue above this amount counts as real activity for a native client in a month."
    )]
    pub active_revenue_threshold: f64,

    #[schemars(description = "Product ids that make up a connections-only booking.")]
    pub connections_products: BTreeSet<i64>,

    #[schemars(
        description = "Cumulative ASF on other products tolerated before a client stops being connections-only."
    )]
    pub connections_slop: f64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            as_of: chrono::Local::now().date_naive(),
            fiscal_year_start_month: 5,
            go_live_threshold: 500.0,
            go_live_methodology_year: 2011,
            legacy_consecutive_months: 3,
            active_revenue_threshold: 0.1,
            connections_products: [81, 82, 83, 84, 85, 123, 355, 356, 357]
                .into_iter()
                .collect(),
            connections_slop: 10.0,
        }
    }
}

impl ReconciliationConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_fiscal_year_start_month(self.fiscal_year_start_month)?;

        if self.go_live_threshold < 0.0 {
            return Err(ReconciliationError::InvalidConfig(format!(
                "go_live_threshold must be non-negative, got {}",
                self.go_live_threshold
            )));
        }
        if self.active_revenue_threshold < 0.0 {
            return Err(ReconciliationError::InvalidConfig(format!(
                "active_revenue_threshold must be non-negative, got {}",
                self.active_revenue_threshold
            )));
        }
        if self.legacy_consecutive_months == 0 {
            return Err(ReconciliationError::InvalidConfig(
                "legacy_consecutive_months must be at least 1".to_string(),
            ));
        }
        if self.connections_slop < 0.0 {
            return Err(ReconciliationError::InvalidConfig(format!(
                "connections_slop must be non-negative, got {}",
                self.connections_slop
            )));
        }
        Ok(())
    }
}

/// Customer row from the core system's customer table.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CoreCustomerRecord {
    pub id: i64,
    pub full_name: String,
    #[schemars(description = "ISO country code, if known")]
    pub country: Option<String>,
    pub vertical_id: Option<i64>,
    #[schemars(description = "Parent customer id. Missing or 0 means the customer is its own parent.")]
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    #[serde(alias = "b")]
    Billing,
    #[serde(alias = "r")]
    Revenue,
}

/// One month of one client line from the legacy revenue/billing archive.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LegacyBibleRow {
    pub raw_id: String,
    pub name: String,
    pub kind: LedgerKind,
    pub pay_frequency: Option<String>,
    pub month: NaiveDate,
    #[schemars(description = "Blank cells arrive as null and count as zero")]
    pub amount: Option<f64>,
}

/// One month of one client from the express import.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExpressRow {
    pub client_id: String,
    pub name: String,
    pub month: NaiveDate,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ItemRecord {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ContractRecord {
    pub id: i64,
    pub customer_id: Option<i64>,
    pub product_id: Option<i64>,
    pub isf: Option<f64>,
    #[schemars(description = "Monthly subscription fee booked by the contract")]
    pub monthly_value: Option<f64>,
    pub effective_date: Option<NaiveDate>,
    #[serde(default)]
    pub renewal: bool,
    pub live_adjustment: Option<bool>,
    pub debooking: Option<bool>,
}

/// Revenue recognition row from the core system's revenue report.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RevenueRecord {
    pub date: NaiveDate,
    pub product_id: i64,
    pub client_id: i64,
    pub recurring: bool,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PaymentLine {
    pub amount: f64,
    pub client_id: Option<i64>,
    pub date: NaiveDate,
    pub currency_id: i64,
    pub subsidiary_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub enum TransactionType {
    Invoice,
    CreditMemo,
    Other,
}

impl TransactionType {
    pub fn code(&self) -> i8 {
        match self {
            Self::Invoice => 1,
            Self::CreditMemo => 0,
            Self::Other => -1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BillingLine {
    pub amount: f64,
    pub client_id: Option<i64>,
    #[schemars(description = "Start of the accounting period the transaction posted to")]
    pub period_start: NaiveDate,
    pub currency_id: i64,
    pub subsidiary_id: i64,
    pub transaction_type: TransactionType,
    pub billing_frequency_id: Option<i64>,
}

/// Row of the implementation tracker.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImplementationRecord {
    pub customer_id: Option<i64>,
    pub projected_launch: Option<NaiveDate>,
    pub actual_launch: Option<NaiveDate>,
    pub phase_id: Option<i64>,
    #[schemars(description = "Monthly subscription fee expected once the client launches")]
    pub monthly_fee: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExchangeRate {
    pub currency_id: i64,
    pub date: NaiveDate,
    #[schemars(description = "Units of USD per unit of the foreign currency")]
    pub rate: f64,
}

/// Static lookup tables maintained alongside the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ReferenceTables {
    pub verticals: BTreeMap<i64, String>,
    pub country_regions: BTreeMap<String, String>,
    #[schemars(description = "Region forced onto every customer under these top-level ids")]
    pub top_region_overrides: BTreeMap<String, String>,
    #[schemars(description = "Region forced onto individual customers; wins over the top-level table")]
    pub native_region_overrides: BTreeMap<String, String>,
    pub product_families: BTreeMap<i64, String>,
    #[schemars(description = "Manual cohort year by native customer id")]
    pub cohort_overrides: BTreeMap<String, i32>,
    pub billing_frequencies: BTreeMap<i64, String>,
    pub implementation_phases: BTreeMap<i64, String>,
}

/// Everything the extract layer hands to one reconciliation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PipelineInputs {
    pub core_customers: Vec<CoreCustomerRecord>,
    pub legacy_bible: Vec<LegacyBibleRow>,
    pub express: Vec<ExpressRow>,
    pub items: Vec<ItemRecord>,
    pub contracts: Vec<ContractRecord>,
    pub revenue: Vec<RevenueRecord>,
    pub payments: Vec<PaymentLine>,
    pub billing: Vec<BillingLine>,
    pub implementations: Vec<ImplementationRecord>,
    pub exchange_rates: Vec<ExchangeRate>,
    pub identity_mapping: Vec<IdentityMappingRecord>,
    pub reference: ReferenceTables,
    pub entity_overrides: Vec<EntityOverrideRecord>,
    #[schemars(
        description = "Manual active-client workbook. When absent the active-client grid is not computed."
    )]
    pub active_client_overrides: Option<ActiveClientOverrideSheet>,
}

impl PipelineInputs {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(PipelineInputs)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }

    /// Fails when an extract the run cannot do without came back empty.
    pub fn ensure_available(&self) -> Result<()> {
        if self.core_customers.is_empty() {
            return Err(ReconciliationError::MissingInput(
                "core customer extract is empty".to_string(),
            ));
        }
        if self.revenue.is_empty() {
            return Err(ReconciliationError::MissingInput(
                "revenue extract is empty".to_string(),
            ));
        }
        Ok(())
    }
}
