use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconciliationError {
    #[error("No input available: {0}")]
    MissingInput(String),

    #[error("Customer {customer_id} references parent {parent_id}, which is not in the merged customer table")]
    UnresolvedParent {
        customer_id: String,
        parent_id: String,
    },

    #[error("Customer {0} appears in more than one source table")]
    DuplicateCustomer(String),

    #[error("Contract {0} references customer {1}, which is not in the merged customer table")]
    UnknownContractCustomer(String, String),

    #[error("Contract {contract_id} has both the live adjustment and implementation debooking flags set")]
    AmbiguousBookingFlags { contract_id: String },

    #[error("Contract {0} reached aggregation without a contract type")]
    UnclassifiedContract(String),

    #[error("Malformed account family id '{0}'")]
    MalformedFamilyId(String),

    #[error("Account family namespace {0} has no identifiers left")]
    FamilyNamespaceExhausted(String),

    #[error("Client {0} appears more than once in the active client override sheet")]
    DuplicateOverrideClient(String),

    #[error("Date column {0} appears more than once in the active client override sheet")]
    DuplicateOverrideDate(NaiveDate),

    #[error("Override row for {family_id} has {actual} cells, expected {expected}")]
    RaggedOverrideRow {
        family_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("Override for {family_id} on {month} must be 0, 1 or blank, got {value}")]
    InvalidOverrideValue {
        family_id: String,
        month: NaiveDate,
        value: u8,
    },

    #[error("Client {0} appears in the exclusion list more than once")]
    DuplicateExclusion(String),

    #[error("Override family {0} does not belong to any known customer")]
    UnknownOverrideFamily(String),

    #[error("Bookings for client {client_id}, product {product_id} do not reconcile: cumulative {cumulative}, sum of increments {incremental}")]
    BookingsMismatch {
        client_id: String,
        product_id: i64,
        cumulative: f64,
        incremental: f64,
    },

    #[error("Unknown source system tag '{0}'")]
    UnknownSourceSystem(String),

    #[error("Invalid fiscal year start month {0}: must be between 1 and 12")]
    InvalidFiscalYearStartMonth(u32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReconciliationError>;
