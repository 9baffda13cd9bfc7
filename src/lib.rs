//! # Revenue Reconciler
//!
//! Reconciles customer records from several billing systems into one
//! account-family hierarchy and derives the monthly subscription metrics
//! reporting is built on.
//!
//! ## Core Concepts
//!
//! - **Account family (AFID)**: a durable identity shared by every native
//!   client record that belongs to the same customer, across source systems
//! - **ASF**: annualized subscription fee, twelve times a contract's monthly value
//! - **Cumulative / incremental ASF**: running bookings per client and product,
//!   and the net change per month split by contract type and booking category
//! - **Go-live and cohorts**: the first month a family produced meaningful
//!   revenue, and the fiscal years of first booking and go-live
//! - **Active clients**: a month-by-month flag per family, smoothed and then
//!   corrected by a manual override sheet
//!
//! ## Example
//!
//! ```rust,ignore
//! use revenue_reconciler::*;
//! use chrono::NaiveDate;
//!
//! let inputs: PipelineInputs = serde_json::from_str(&extract_json)?;
//! let config = ReconciliationConfig {
//!     as_of: NaiveDate::from_ymd_opt(2013, 4, 30).unwrap(),
//!     ..ReconciliationConfig::default()
//! };
//!
//! let output = reconcile(&inputs, &config)?;
//! for row in &output.cumulative_asf {
//!     println!("{} {} {} {}", row.month, row.client_id, row.product_id, row.asf);
//! }
//! ```

pub mod active_clients;
pub mod aggregation;
pub mod cohorts;
pub mod contracts;
pub mod customers;
pub mod engine;
pub mod error;
pub mod identity;
pub mod ingestion;
pub mod overrides;
pub mod schema;
pub mod utils;

pub use active_clients::{
    resolve_active_clients, smooth_up_down_up, ActiveClientReport, ActiveClientRow,
    FamilyAssignment,
};
pub use aggregation::*;
pub use cohorts::{apply_first_bookings_and_cohorts, compute_go_live_dates, revenue_by_top_name};
pub use contracts::*;
pub use customers::*;
pub use engine::{process_inputs, PipelineOutput, ReconciliationEngine};
pub use error::{ReconciliationError, Result};
pub use identity::*;
pub use ingestion::*;
pub use overrides::*;
pub use schema::*;
pub use utils::*;

use log::{debug, info};
use std::collections::BTreeMap;

pub struct RevenueReconciler;

impl RevenueReconciler {
    pub fn process(
        inputs: &PipelineInputs,
        config: &ReconciliationConfig,
    ) -> Result<PipelineOutput> {
        config.validate()?;

        info!(
            "Reconciling {} core customers, {} contracts and {} revenue rows as of {}",
            inputs.core_customers.len(),
            inputs.contracts.len(),
            inputs.revenue.len(),
            config.as_of
        );
        debug!(
            "Legacy archive: {} rows, express: {} rows, identity mapping: {} records",
            inputs.legacy_bible.len(),
            inputs.express.len(),
            inputs.identity_mapping.len()
        );

        ReconciliationEngine::new(config.clone()).run(inputs)
    }

    /// Runs the pipeline and checks that every client's increments add up to
    /// its latest cumulative bookings.
    pub fn process_with_verification(
        inputs: &PipelineInputs,
        config: &ReconciliationConfig,
        tolerance: f64,
    ) -> Result<PipelineOutput> {
        let output = Self::process(inputs, config)?;

        verify_bookings(&output, tolerance)?;

        Ok(output)
    }
}

pub fn reconcile(inputs: &PipelineInputs, config: &ReconciliationConfig) -> Result<PipelineOutput> {
    RevenueReconciler::process(inputs, config)
}

pub fn reconcile_with_verification(
    inputs: &PipelineInputs,
    config: &ReconciliationConfig,
    tolerance: f64,
) -> Result<PipelineOutput> {
    RevenueReconciler::process_with_verification(inputs, config, tolerance)
}

/// Cumulative rows re-emit every key each month, so the last value seen per
/// key is its closing balance.
pub fn verify_bookings(output: &PipelineOutput, tolerance: f64) -> Result<()> {
    let mut closing: BTreeMap<CumulativeKey, f64> = BTreeMap::new();
    for row in &output.cumulative_asf {
        closing.insert(
            CumulativeKey {
                product_id: row.product_id,
                client_id: row.client_id.clone(),
            },
            row.asf,
        );
    }

    let mut increments: BTreeMap<CumulativeKey, f64> = BTreeMap::new();
    for row in &output.incremental_asf {
        *increments
            .entry(CumulativeKey {
                product_id: row.product_id,
                client_id: row.client_id.clone(),
            })
            .or_insert(0.0) += row.asf;
    }

    for (key, cumulative) in &closing {
        let incremental = increments.get(key).copied().unwrap_or(0.0);
        if (cumulative - incremental).abs() > tolerance {
            return Err(ReconciliationError::BookingsMismatch {
                client_id: key.client_id.clone(),
                product_id: key.product_id,
                cumulative: *cumulative,
                incremental,
            });
        }
    }

    debug!("Verified closing bookings for {} keys", closing.len());
    Ok(())
}
