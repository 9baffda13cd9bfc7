use crate::active_clients::{resolve_active_clients, ActiveClientReport, ActiveClientRow};
use crate::aggregation::{
    connections_only_clients, cumulative_asf, incremental_asf, CumulativeAsfRow, IncrementalAsfRow,
};
use crate::cohorts::{apply_first_bookings_and_cohorts, compute_go_live_dates};
use crate::contracts::{
    build_contracts, classify_contracts, compute_first_bookings, monthly_deal_counts, Contract,
    DealCountRow,
};
use crate::customers::{build_product_index, merge_customers, Customer, Product};
use crate::error::Result;
use crate::identity::{mapping_records, IdentityMapper, IdentityMappingRecord, IdentityMappingTable};
use crate::ingestion::{
    billing_entries, core_customers, core_revenue_entries, express_customers,
    express_revenue_entries, legacy_billing_entries, legacy_customers, legacy_revenue_entries,
    billing_frequencies, implementation_entries, payment_entries, sort_revenue_entries,
    BillingEntry, ExchangeRateIndex, ImplementationEntry, PaymentEntry, RevenueEntry,
    UndatedImplementation,
};
use crate::overrides::{ActiveClientOverrides, EntityOverrides};
use crate::schema::{PipelineInputs, ReconciliationConfig};
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;

/// Everything a reconciliation run hands to the writers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineOutput {
    pub customers: BTreeMap<String, Customer>,
    pub products: BTreeMap<i64, Product>,
    pub contracts: Vec<Contract>,
    pub cumulative_asf: Vec<CumulativeAsfRow>,
    pub incremental_asf: Vec<IncrementalAsfRow>,
    pub deal_counts: Vec<DealCountRow>,
    /// Core and legacy revenue after source fix-ups. Express revenue only
    /// feeds the active-client grid.
    pub revenue: Vec<RevenueEntry>,
    pub billing: Vec<BillingEntry>,
    pub legacy_billing: Vec<BillingEntry>,
    pub payments: Vec<PaymentEntry>,
    pub billing_frequencies: BTreeMap<i64, String>,
    pub implementations: Vec<ImplementationEntry>,
    pub undated_implementations: Vec<UndatedImplementation>,
    pub identity_mapping: Vec<IdentityMappingRecord>,
    pub active_clients: Option<ActiveClientReport>,
    pub active_client_rows: Vec<ActiveClientRow>,
}

pub struct ReconciliationEngine {
    config: ReconciliationConfig,
}

impl ReconciliationEngine {
    pub fn new(config: ReconciliationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn run(&self, inputs: &PipelineInputs) -> Result<PipelineOutput> {
        let config = &self.config;
        config.validate()?;
        inputs.ensure_available()?;
        let reference = &inputs.reference;

        info!("Resolving account families");
        let mapping = IdentityMappingTable::from_records(&inputs.identity_mapping)?;
        let mut mapper = IdentityMapper::from_table(&mapping);

        let sources = vec![
            core_customers(&inputs.core_customers, reference),
            legacy_customers(&inputs.legacy_bible),
            express_customers(&inputs.express),
        ];
        let mut customers = merge_customers(&sources, &mut mapper, reference)?;
        let products = build_product_index(&inputs.items, &reference.product_families);

        info!("Building contracts");
        let mut contracts = build_contracts(&inputs.contracts, &customers, &products)?;
        let deal_counts = monthly_deal_counts(&contracts);

        let mut revenue = core_revenue_entries(&inputs.revenue);
        revenue.extend(legacy_revenue_entries(&inputs.legacy_bible));
        sort_revenue_entries(&mut revenue);

        info!("Resolving go-live dates and cohorts");
        let first_bookings = compute_first_bookings(&contracts);
        let go_live = compute_go_live_dates(&revenue, &customers, config);
        apply_first_bookings_and_cohorts(
            &mut customers,
            &first_bookings,
            &go_live,
            &reference.cohort_overrides,
            config,
        );

        classify_contracts(&mut contracts, &first_bookings);

        info!("Aggregating bookings through {}", config.as_of);
        let cumulative = cumulative_asf(&contracts, config.as_of);
        let incremental = incremental_asf(&contracts, config.as_of)?;

        let connections_only = connections_only_clients(
            &cumulative.snapshots,
            &config.connections_products,
            config.connections_slop,
        );
        debug!("{} connections-only clients", connections_only.len());
        let entity_overrides = EntityOverrides::from_records(&inputs.entity_overrides);
        entity_overrides.apply_to_customers(&mut customers, &connections_only);
        entity_overrides.apply_to_revenue(&mut revenue, &connections_only);

        let active_clients = match &inputs.active_client_overrides {
            Some(sheet) => {
                info!("Resolving active clients");
                let overrides = ActiveClientOverrides::from_sheet(sheet)?;
                let mut combined = revenue.clone();
                combined.extend(express_revenue_entries(&inputs.express));
                Some(resolve_active_clients(
                    &combined,
                    &customers,
                    &overrides,
                    config.active_revenue_threshold,
                )?)
            }
            None => {
                debug!("No active-client overrides supplied; skipping the active-client grid");
                None
            }
        };
        let active_client_rows = active_clients
            .as_ref()
            .map(ActiveClientReport::rows)
            .unwrap_or_default();

        info!("Converting payments and billing");
        let rates = ExchangeRateIndex::from_rates(&inputs.exchange_rates);
        let payments = payment_entries(&inputs.payments, &rates);
        let billing = billing_entries(&inputs.billing, &rates);
        let legacy_billing = legacy_billing_entries(&inputs.legacy_bible);
        let frequencies = billing_frequencies(&reference.billing_frequencies);
        let implementations =
            implementation_entries(&inputs.implementations, &reference.implementation_phases);

        let identity_mapping = mapping_records(&customers);

        info!(
            "Reconciled {} customers, {} contracts, {} revenue entries",
            customers.len(),
            contracts.len(),
            revenue.len()
        );

        Ok(PipelineOutput {
            customers,
            products,
            contracts,
            cumulative_asf: cumulative.rows,
            incremental_asf: incremental,
            deal_counts,
            revenue,
            billing,
            legacy_billing,
            payments,
            billing_frequencies: frequencies,
            implementations: implementations.entries,
            undated_implementations: implementations.undated,
            identity_mapping,
            active_clients,
            active_client_rows,
        })
    }
}

pub fn process_inputs(
    inputs: &PipelineInputs,
    config: &ReconciliationConfig,
) -> Result<PipelineOutput> {
    ReconciliationEngine::new(config.clone()).run(inputs)
}
