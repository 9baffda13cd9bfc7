//! Account family identities.
//!
//! An account family id (AFID) survives renames, resubscriptions and moves
//! between source systems. AFIDs look like `AF-00001234`: the eight digits are a
//! sequence number whose leading digit names the namespace it was minted in
//! (`0` for customers first seen in the core system, `1` for everything that
//! came through the legacy archives). Each namespace has its own counter so a
//! run that discovers new customers in both never hands out the same id twice.

use crate::customers::Customer;
use crate::error::{ReconciliationError, Result};
use crate::schema::SourceSystem;
use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const FAMILY_ID_PREFIX: &str = "AF-";
pub const FAMILY_ID_DIGITS: usize = 8;
pub const PLACEHOLDER_ATTRIBUTE: &str = "TBD";
pub const PLACEHOLDER_FLAG: i8 = -1;
pub const DEFAULT_ORIGINATION: &str = "Organic sale";

const LEGACY_NAMESPACE_BASE: u64 = 10_000_000;
const NAMESPACE_CEILING: u64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FamilyNamespace {
    Core,
    Legacy,
}

impl FamilyNamespace {
    pub fn for_source(source: SourceSystem) -> Self {
        match source {
            SourceSystem::Core => Self::Core,
            SourceSystem::Legacy | SourceSystem::Connections | SourceSystem::Express => {
                Self::Legacy
            }
        }
    }

    fn base(self) -> u64 {
        match self {
            Self::Core => 0,
            Self::Legacy => LEGACY_NAMESPACE_BASE,
        }
    }

    fn ceiling(self) -> u64 {
        match self {
            Self::Core => LEGACY_NAMESPACE_BASE,
            Self::Legacy => NAMESPACE_CEILING,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Legacy => "legacy",
        }
    }
}

pub fn format_family_id(sequence: u64) -> String {
    format!(
        "{}{:0width$}",
        FAMILY_ID_PREFIX,
        sequence,
        width = FAMILY_ID_DIGITS
    )
}

/// Splits an AFID into its namespace and sequence number.
pub fn parse_family_id(family_id: &str) -> Result<(FamilyNamespace, u64)> {
    let malformed = || ReconciliationError::MalformedFamilyId(family_id.to_string());

    let digits = family_id
        .trim()
        .strip_prefix(FAMILY_ID_PREFIX)
        .ok_or_else(malformed)?;

    if digits.len() != FAMILY_ID_DIGITS || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed());
    }

    let namespace = match digits.as_bytes()[0] {
        b'0' => FamilyNamespace::Core,
        b'1' => FamilyNamespace::Legacy,
        _ => return Err(malformed()),
    };
    let sequence = digits.parse::<u64>().map_err(|_| malformed())?;

    Ok((namespace, sequence))
}

/// Hands out new AFIDs, one counter per namespace.
///
/// Counters only advance in memory; writing the grown mapping table back is
/// the caller's job (see [`mapping_records`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyIdAllocator {
    next_core: u64,
    next_legacy: u64,
}

impl Default for FamilyIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FamilyIdAllocator {
    pub fn new() -> Self {
        Self {
            next_core: FamilyNamespace::Core.base(),
            next_legacy: FamilyNamespace::Legacy.base(),
        }
    }

    /// Seeds the counters from the highest sequence already mapped in each
    /// namespace. A maximum at or past the namespace ceiling leaves that
    /// namespace exhausted.
    pub fn from_max_sequences(max_core: Option<u64>, max_legacy: Option<u64>) -> Self {
        Self {
            next_core: max_core.map_or(FamilyNamespace::Core.base(), |max| max.saturating_add(1)),
            next_legacy: max_legacy
                .map_or(FamilyNamespace::Legacy.base(), |max| max.saturating_add(1)),
        }
    }

    pub fn peek_next(&self, namespace: FamilyNamespace) -> u64 {
        match namespace {
            FamilyNamespace::Core => self.next_core,
            FamilyNamespace::Legacy => self.next_legacy,
        }
    }

    pub fn allocate(&mut self, namespace: FamilyNamespace) -> Result<String> {
        let counter = match namespace {
            FamilyNamespace::Core => &mut self.next_core,
            FamilyNamespace::Legacy => &mut self.next_legacy,
        };

        if *counter >= namespace.ceiling() {
            return Err(ReconciliationError::FamilyNamespaceExhausted(
                namespace.label().to_string(),
            ));
        }

        let family_id = format_family_id(*counter);
        *counter += 1;
        Ok(family_id)
    }
}

/// Row of the persisted account family mapping file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct IdentityMappingRecord {
    pub native_id: String,
    pub child_name: String,
    #[schemars(description = "Curated top-of-family display name")]
    pub parent_name: String,
    pub family_id: String,
    pub ciq_id: String,
    pub business_unit: String,
    pub is_fortune500: i8,
    pub is_ir500: i8,
    pub ciq_ultimate_parent: String,
    pub customer_origination: String,
}

/// Classification attributes that travel with a family mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyClassification {
    pub business_unit: String,
    pub ciq_id: String,
    pub is_fortune500: i8,
    pub is_ir500: i8,
    pub ciq_ultimate_parent: String,
    pub customer_origination: String,
}

impl FamilyClassification {
    /// Attributes given to a customer the mapping file has never seen.
    pub fn placeholder() -> Self {
        Self {
            business_unit: PLACEHOLDER_ATTRIBUTE.to_string(),
            ciq_id: PLACEHOLDER_ATTRIBUTE.to_string(),
            is_fortune500: PLACEHOLDER_FLAG,
            is_ir500: PLACEHOLDER_FLAG,
            ciq_ultimate_parent: PLACEHOLDER_ATTRIBUTE.to_string(),
            customer_origination: DEFAULT_ORIGINATION.to_string(),
        }
    }

    fn from_record(record: &IdentityMappingRecord) -> Self {
        Self {
            business_unit: record.business_unit.clone(),
            ciq_id: record.ciq_id.clone(),
            is_fortune500: record.is_fortune500,
            is_ir500: record.is_ir500,
            ciq_ultimate_parent: record.ciq_ultimate_parent.clone(),
            customer_origination: record.customer_origination.clone(),
        }
    }
}

/// The mapping file indexed by native id, with the per-namespace maxima.
#[derive(Debug, Clone, Default)]
pub struct IdentityMappingTable {
    entries: BTreeMap<String, IdentityMappingRecord>,
    max_core: Option<u64>,
    max_legacy: Option<u64>,
}

impl IdentityMappingTable {
    pub fn from_records(records: &[IdentityMappingRecord]) -> Result<Self> {
        let mut table = Self::default();

        for record in records {
            let (namespace, sequence) = parse_family_id(&record.family_id)?;
            let max = match namespace {
                FamilyNamespace::Core => &mut table.max_core,
                FamilyNamespace::Legacy => &mut table.max_legacy,
            };
            *max = Some(max.map_or(sequence, |current| current.max(sequence)));

            if let Some(previous) = table
                .entries
                .insert(record.native_id.clone(), record.clone())
            {
                warn!(
                    "Mapping file lists customer {} twice ({} and {}); keeping the later row",
                    record.native_id, previous.family_id, record.family_id
                );
            }
        }

        debug!(
            "Loaded {} identity mappings (max core sequence {:?}, max legacy sequence {:?})",
            table.entries.len(),
            table.max_core,
            table.max_legacy
        );

        Ok(table)
    }

    pub fn get(&self, native_id: &str) -> Option<&IdentityMappingRecord> {
        self.entries.get(native_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn allocator(&self) -> FamilyIdAllocator {
        FamilyIdAllocator::from_max_sequences(self.max_core, self.max_legacy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyResolution {
    pub family_id: String,
    /// Curated family name from the mapping file, when the customer was mapped.
    pub mapped_parent_name: Option<String>,
    pub classification: FamilyClassification,
    pub newly_allocated: bool,
}

/// Resolves native customer ids to account families, minting new ones on a
/// miss.
pub struct IdentityMapper<'a> {
    table: &'a IdentityMappingTable,
    allocator: FamilyIdAllocator,
}

impl<'a> IdentityMapper<'a> {
    pub fn new(table: &'a IdentityMappingTable, allocator: FamilyIdAllocator) -> Self {
        Self { table, allocator }
    }

    pub fn from_table(table: &'a IdentityMappingTable) -> Self {
        Self::new(table, table.allocator())
    }

    pub fn resolve(&mut self, native_id: &str, source: SourceSystem) -> Result<FamilyResolution> {
        if let Some(record) = self.table.get(native_id) {
            return Ok(FamilyResolution {
                family_id: record.family_id.clone(),
                mapped_parent_name: Some(record.parent_name.clone()),
                classification: FamilyClassification::from_record(record),
                newly_allocated: false,
            });
        }

        let family_id = self.allocator.allocate(FamilyNamespace::for_source(source))?;
        debug!(
            "Customer {} ({}) not in mapping file, allocated {}",
            native_id, source, family_id
        );

        Ok(FamilyResolution {
            family_id,
            mapped_parent_name: None,
            classification: FamilyClassification::placeholder(),
            newly_allocated: true,
        })
    }

    pub fn allocator(&self) -> &FamilyIdAllocator {
        &self.allocator
    }
}

/// Mapping file rows for every merged customer, ready to be persisted for the
/// next run.
pub fn mapping_records(customers: &BTreeMap<String, Customer>) -> Vec<IdentityMappingRecord> {
    customers
        .values()
        .map(|customer| IdentityMappingRecord {
            native_id: customer.native_id.clone(),
            child_name: customer.name.clone(),
            parent_name: customer.top_name.clone(),
            family_id: customer.family_id.clone(),
            ciq_id: customer.classification.ciq_id.clone(),
            business_unit: customer.classification.business_unit.clone(),
            is_fortune500: customer.classification.is_fortune500,
            is_ir500: customer.classification.is_ir500,
            ciq_ultimate_parent: customer.classification.ciq_ultimate_parent.clone(),
            customer_origination: customer.classification.customer_origination.clone(),
        })
        .collect()
}
