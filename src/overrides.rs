use crate::customers::Customer;
use crate::error::{ReconciliationError, Result};
use crate::ingestion::RevenueEntry;
use crate::schema::SourceSystem;
use crate::utils::month_start;
use chrono::NaiveDate;
use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The manual active-client workbook as read from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ActiveClientOverrideSheet {
    #[schemars(description = "Month columns of the by-client-and-date sheet, left to right")]
    pub date_columns: Vec<NaiveDate>,

    #[serde(default)]
    pub rows: Vec<OverrideSheetRow>,

    #[schemars(
        description = "Native client ids whose revenue never counts towards active-client status"
    )]
    #[serde(default)]
    pub excluded_clients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OverrideSheetRow {
    pub family_id: String,
    pub parent_name: String,
    #[schemars(
        description = "One cell per date column: 1 forces active, 0 forces inactive, null leaves the computed value"
    )]
    pub cells: Vec<Option<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverrideValue {
    /// Blank cell: keep whatever the revenue says.
    NoValue,
    Active,
    Inactive,
}

impl OverrideValue {
    pub fn explicit(&self) -> Option<bool> {
        match self {
            Self::NoValue => None,
            Self::Active => Some(true),
            Self::Inactive => Some(false),
        }
    }
}

/// Month -> active flag for every account family.
pub type ActivityGrid = BTreeMap<String, BTreeMap<NaiveDate, bool>>;

/// Validated manual overrides for the active-client grid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveClientOverrides {
    by_family: BTreeMap<String, BTreeMap<NaiveDate, OverrideValue>>,
    excluded: BTreeSet<String>,
}

impl ActiveClientOverrides {
    /// Validates the workbook. Duplicate families, duplicate date columns and
    /// duplicate exclusions mean the sheet was edited inconsistently and abort
    /// the run.
    pub fn from_sheet(sheet: &ActiveClientOverrideSheet) -> Result<Self> {
        let mut columns = Vec::with_capacity(sheet.date_columns.len());
        let mut seen_dates = BTreeSet::new();
        for date in &sheet.date_columns {
            let month = month_start(*date);
            if !seen_dates.insert(month) {
                return Err(ReconciliationError::DuplicateOverrideDate(*date));
            }
            columns.push(month);
        }

        let mut by_family = BTreeMap::new();
        for row in &sheet.rows {
            let family_id = row.family_id.trim().to_string();
            if by_family.contains_key(&family_id) {
                return Err(ReconciliationError::DuplicateOverrideClient(family_id));
            }
            if row.cells.len() != columns.len() {
                return Err(ReconciliationError::RaggedOverrideRow {
                    family_id,
                    expected: columns.len(),
                    actual: row.cells.len(),
                });
            }

            let values = columns
                .iter()
                .zip(&row.cells)
                .map(|(month, cell)| {
                    let value = match cell {
                        None => OverrideValue::NoValue,
                        Some(0) => OverrideValue::Inactive,
                        Some(1) => OverrideValue::Active,
                        Some(other) => {
                            return Err(ReconciliationError::InvalidOverrideValue {
                                family_id: family_id.clone(),
                                month: *month,
                                value: *other,
                            })
                        }
                    };
                    Ok((*month, value))
                })
                .collect::<Result<BTreeMap<_, _>>>()?;

            by_family.insert(family_id, values);
        }

        let mut excluded = BTreeSet::new();
        for client_id in &sheet.excluded_clients {
            let client_id = client_id.trim().to_string();
            if !excluded.insert(client_id.clone()) {
                return Err(ReconciliationError::DuplicateExclusion(client_id));
            }
        }

        debug!(
            "Loaded active-client overrides for {} families, {} excluded clients",
            by_family.len(),
            excluded.len()
        );

        Ok(Self {
            by_family,
            excluded,
        })
    }

    pub fn is_excluded(&self, client_id: &str) -> bool {
        self.excluded.contains(client_id)
    }

    pub fn value_for(&self, family_id: &str, month: NaiveDate) -> OverrideValue {
        self.by_family
            .get(family_id)
            .and_then(|values| values.get(&month))
            .copied()
            .unwrap_or(OverrideValue::NoValue)
    }

    /// Layers the overrides on a computed grid and returns the result; the
    /// computed grid is left untouched.
    ///
    /// Explicit values replace computed months. Families that only exist in the
    /// overrides are added with their override months, where anything but an
    /// explicit "active" reads as inactive.
    pub fn apply(&self, computed: &ActivityGrid) -> ActivityGrid {
        let mut grid = computed.clone();

        for (family_id, months) in grid.iter_mut() {
            for (month, active) in months.iter_mut() {
                if let Some(value) = self.value_for(family_id, *month).explicit() {
                    *active = value;
                }
            }
        }

        for (family_id, values) in &self.by_family {
            if grid.contains_key(family_id) {
                continue;
            }
            let months = values
                .iter()
                .map(|(month, value)| (*month, *value == OverrideValue::Active))
                .collect();
            grid.insert(family_id.clone(), months);
        }

        grid
    }
}

/// Manual retagging of a client's source system.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EntityOverrideRecord {
    pub client_id: String,
    pub client_name: String,
    pub entity: SourceSystem,
    #[serde(default)]
    pub note: String,
}

/// Source-system fix-ups applied after connections-only detection.
#[derive(Debug, Clone, Default)]
pub struct EntityOverrides {
    by_client: BTreeMap<String, SourceSystem>,
}

impl EntityOverrides {
    pub fn from_records(records: &[EntityOverrideRecord]) -> Self {
        let mut by_client = BTreeMap::new();
        for record in records {
            let client_id = record.client_id.trim().to_string();
            if let Some(previous) = by_client.insert(client_id, record.entity) {
                warn!(
                    "Entity override for {} listed twice ({} then {}); keeping the later row",
                    record.client_id, previous, record.entity
                );
            }
        }
        Self { by_client }
    }

    fn resolve(
        &self,
        client_id: &str,
        current: SourceSystem,
        connections_only: &BTreeSet<String>,
    ) -> SourceSystem {
        let mut source = current;
        if connections_only.contains(client_id) {
            source = SourceSystem::Connections;
        }
        if let Some(entity) = self.by_client.get(client_id) {
            source = *entity;
        }
        source
    }

    pub fn apply_to_customers(
        &self,
        customers: &mut BTreeMap<String, Customer>,
        connections_only: &BTreeSet<String>,
    ) {
        for customer in customers.values_mut() {
            customer.source =
                self.resolve(&customer.native_id, customer.source, connections_only);
        }
    }

    pub fn apply_to_revenue(
        &self,
        entries: &mut [RevenueEntry],
        connections_only: &BTreeSet<String>,
    ) {
        for entry in entries.iter_mut() {
            entry.source = self.resolve(&entry.client_id, entry.source, connections_only);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn row(family_id: &str, cells: Vec<Option<u8>>) -> OverrideSheetRow {
        OverrideSheetRow {
            family_id: family_id.to_string(),
            parent_name: format!("{family_id} parent"),
            cells,
        }
    }

    fn sheet(rows: Vec<OverrideSheetRow>) -> ActiveClientOverrideSheet {
        ActiveClientOverrideSheet {
            date_columns: vec![d(2012, 1), d(2012, 2), d(2012, 3)],
            rows,
            excluded_clients: vec!["900".to_string()],
        }
    }

    #[test]
    fn test_explicit_values_win_and_blank_keeps_computed() {
        let overrides = ActiveClientOverrides::from_sheet(&sheet(vec![row(
            "AF-00000001",
            vec![Some(0), None, Some(1)],
        )]))
        .unwrap();

        let mut computed = ActivityGrid::new();
        computed.insert(
            "AF-00000001".to_string(),
            [(d(2012, 1), true), (d(2012, 2), true), (d(2012, 3), false)]
                .into_iter()
                .collect(),
        );

        let grid = overrides.apply(&computed);
        let months = &grid["AF-00000001"];
        assert!(!months[&d(2012, 1)]);
        assert!(months[&d(2012, 2)]);
        assert!(months[&d(2012, 3)]);
        // The computed grid is not modified.
        assert!(computed["AF-00000001"][&d(2012, 1)]);
    }

    #[test]
    fn test_override_only_families_are_added() {
        let overrides = ActiveClientOverrides::from_sheet(&sheet(vec![row(
            "AF-10000009",
            vec![Some(1), None, Some(0)],
        )]))
        .unwrap();

        let grid = overrides.apply(&ActivityGrid::new());
        let months = &grid["AF-10000009"];
        assert_eq!(months.len(), 3);
        assert!(months[&d(2012, 1)]);
        assert!(!months[&d(2012, 2)]);
        assert!(!months[&d(2012, 3)]);
    }

    #[test]
    fn test_duplicate_family_is_fatal() {
        let result = ActiveClientOverrides::from_sheet(&sheet(vec![
            row("AF-00000001", vec![None, None, None]),
            row("AF-00000001", vec![None, None, None]),
        ]));
        assert!(matches!(
            result,
            Err(ReconciliationError::DuplicateOverrideClient(_))
        ));
    }

    #[test]
    fn test_duplicate_date_column_is_fatal() {
        let mut bad = sheet(vec![]);
        bad.date_columns.push(NaiveDate::from_ymd_opt(2012, 2, 1).unwrap());
        assert!(matches!(
            ActiveClientOverrides::from_sheet(&bad),
            Err(ReconciliationError::DuplicateOverrideDate(_))
        ));
    }

    #[test]
    fn test_ragged_row_and_duplicate_exclusion_are_fatal() {
        let ragged = sheet(vec![row("AF-00000001", vec![None])]);
        assert!(matches!(
            ActiveClientOverrides::from_sheet(&ragged),
            Err(ReconciliationError::RaggedOverrideRow { .. })
        ));

        let mut duplicated = sheet(vec![]);
        duplicated.excluded_clients.push("900".to_string());
        assert!(matches!(
            ActiveClientOverrides::from_sheet(&duplicated),
            Err(ReconciliationError::DuplicateExclusion(_))
        ));
    }

    #[test]
    fn test_cells_other_than_zero_or_one_are_rejected() {
        let bad = sheet(vec![row("AF-00000001", vec![None, Some(2), None])]);
        match ActiveClientOverrides::from_sheet(&bad) {
            Err(ReconciliationError::InvalidOverrideValue { month, value, .. }) => {
                assert_eq!(month, d(2012, 2));
                assert_eq!(value, 2);
            }
            other => panic!("expected invalid override value, got {other:?}"),
        }
    }

    #[test]
    fn test_exclusions() {
        let overrides = ActiveClientOverrides::from_sheet(&sheet(vec![])).unwrap();
        assert!(overrides.is_excluded("900"));
        assert!(!overrides.is_excluded("901"));
    }

    #[test]
    fn test_entity_overrides_follow_connections_retag() {
        let overrides = EntityOverrides::from_records(&[EntityOverrideRecord {
            client_id: "2".to_string(),
            client_name: "Forced Core".to_string(),
            entity: SourceSystem::Core,
            note: String::new(),
        }]);
        let connections_only: BTreeSet<String> =
            ["1".to_string(), "2".to_string()].into_iter().collect();

        let mut entries: Vec<RevenueEntry> = ["1", "2", "3"]
            .iter()
            .map(|id| RevenueEntry {
                month: d(2012, 1),
                client_id: id.to_string(),
                product_id: 1,
                recurring: true,
                amount: 10.0,
                source: SourceSystem::Core,
            })
            .collect();
        overrides.apply_to_revenue(&mut entries, &connections_only);

        assert_eq!(entries[0].source, SourceSystem::Connections);
        assert_eq!(entries[1].source, SourceSystem::Core);
        assert_eq!(entries[2].source, SourceSystem::Core);
    }
}
