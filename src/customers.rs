use crate::error::{ReconciliationError, Result};
use crate::identity::{FamilyClassification, IdentityMapper};
use crate::schema::{ItemRecord, ReferenceTables, SourceSystem};
use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fallback for unknown countries, regions, verticals and product families.
pub const OTHER: &str = "Other";
pub const MULTI_COUNTRY: &str = "Multi";
/// Id used for records that point at no customer or product.
pub const MISSING_ID: &str = "-1";
pub const MISSING_PRODUCT_ID: i64 = -1;
pub const MISSING_NAME: &str = "None";

/// A customer as delivered by one source, before merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCustomer {
    pub native_id: String,
    pub name: String,
    pub country: String,
    pub region: String,
    pub vertical: String,
    pub parent_id: Option<String>,
    pub source: SourceSystem,
}

/// A customer in the unified hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub native_id: String,
    pub name: String,
    pub family_id: String,
    pub country: String,
    pub region: String,
    pub vertical: String,
    pub parent_id: Option<String>,
    pub top_id: String,
    pub top_name: String,
    pub source: SourceSystem,
    pub first_booking: Option<NaiveDate>,
    /// Fiscal year of the family's first booking, or the manual override.
    pub cohort: Option<i32>,
    pub go_live_cohort: Option<i32>,
    pub old_never_live: bool,
    pub classification: FamilyClassification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub family_name: String,
}

impl Product {
    pub fn missing() -> Self {
        Self {
            id: MISSING_PRODUCT_ID,
            name: MISSING_NAME.to_string(),
            family_name: MISSING_NAME.to_string(),
        }
    }
}

/// Product table keyed by id, always containing the placeholder product.
pub fn build_product_index(
    items: &[ItemRecord],
    product_families: &BTreeMap<i64, String>,
) -> BTreeMap<i64, Product> {
    let mut products = BTreeMap::new();
    products.insert(MISSING_PRODUCT_ID, Product::missing());

    for item in items {
        let family_name = product_families
            .get(&item.id)
            .cloned()
            .unwrap_or_else(|| OTHER.to_string());
        products.insert(
            item.id,
            Product {
                id: item.id,
                name: item.name.clone(),
                family_name,
            },
        );
    }

    products
}

/// Parent ids the source systems use to say "no parent".
pub fn is_root_parent(parent_id: Option<&str>) -> bool {
    match parent_id.map(str::trim) {
        None => true,
        Some(id) => id.is_empty() || id == "0",
    }
}

/// Merges per-source customer tables into the unified hierarchy.
///
/// Native ids must be unique across sources. New family ids are minted in
/// ascending native-id order, so the result is independent of the order the
/// sources are passed in.
pub fn merge_customers(
    sources: &[Vec<SourceCustomer>],
    mapper: &mut IdentityMapper<'_>,
    reference: &ReferenceTables,
) -> Result<BTreeMap<String, Customer>> {
    let mut combined: BTreeMap<String, SourceCustomer> = BTreeMap::new();
    for customer in sources.iter().flatten() {
        if combined
            .insert(customer.native_id.clone(), customer.clone())
            .is_some()
        {
            return Err(ReconciliationError::DuplicateCustomer(
                customer.native_id.clone(),
            ));
        }
    }

    info!("Merging {} customers from {} sources", combined.len(), sources.len());

    let mut merged = BTreeMap::new();
    let mut newly_mapped = 0usize;

    for raw in combined.values() {
        let (top_id, mut top_name) = resolve_top(raw, &combined)?;

        let family = mapper.resolve(&raw.native_id, raw.source)?;
        if family.newly_allocated {
            newly_mapped += 1;
        }
        if let Some(parent_name) = family.mapped_parent_name {
            top_name = parent_name;
        }

        let mut customer = Customer {
            native_id: raw.native_id.clone(),
            name: raw.name.clone(),
            family_id: family.family_id,
            country: raw.country.clone(),
            region: raw.region.clone(),
            vertical: raw.vertical.clone(),
            parent_id: raw.parent_id.clone(),
            top_id,
            top_name,
            source: raw.source,
            first_booking: None,
            cohort: None,
            go_live_cohort: None,
            old_never_live: false,
            classification: family.classification,
        };

        apply_region_overrides(&mut customer, reference);
        merged.insert(customer.native_id.clone(), customer);
    }

    debug!(
        "{} customers were missing from the mapping file and received new family ids",
        newly_mapped
    );

    Ok(merged)
}

/// One-level parent dereference: the top of a customer is its parent, or
/// itself when it has none.
fn resolve_top(
    customer: &SourceCustomer,
    combined: &BTreeMap<String, SourceCustomer>,
) -> Result<(String, String)> {
    match customer.parent_id.as_deref() {
        Some(parent_id) if !is_root_parent(Some(parent_id)) => {
            let parent = combined.get(parent_id.trim()).ok_or_else(|| {
                ReconciliationError::UnresolvedParent {
                    customer_id: customer.native_id.clone(),
                    parent_id: parent_id.to_string(),
                }
            })?;
            Ok((parent.native_id.clone(), parent.name.clone()))
        }
        _ => Ok((customer.native_id.clone(), customer.name.clone())),
    }
}

/// Forces multi-country regions: first by top-level id, then by the
/// customer's own id, which wins.
pub fn apply_region_overrides(customer: &mut Customer, reference: &ReferenceTables) {
    if let Some(region) = reference.top_region_overrides.get(&customer.top_id) {
        customer.country = MULTI_COUNTRY.to_string();
        customer.region = region.clone();
    }

    if let Some(region) = reference.native_region_overrides.get(&customer.native_id) {
        customer.country = MULTI_COUNTRY.to_string();
        customer.region = region.clone();
    }
}
