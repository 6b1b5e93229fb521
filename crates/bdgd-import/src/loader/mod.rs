//! Fan-out loading
//!
//! One sanitized, identified chunk becomes rows in the lead table, the unit table, and the
//! three series tables. Deduplication and the existing-row filter happen here; the
//! [`Destination`] writes everything that survives in a single transaction.

mod memory;
mod postgres;

pub use memory::MemoryDestination;
pub use postgres::PgDestination;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::error::{ImportError, Result};
use crate::identity::lead_for;
use crate::models::{CoordinateUpdate, IdentifiedUnit, JobKey, Lead};

/// Rows one chunk contributes, ready for the destination
#[derive(Debug, Clone)]
pub struct LoadBatch {
    pub key: JobKey,
    /// Distinct leads referenced by `units`; some may already exist
    pub leads: Vec<Lead>,
    /// Units not yet present when filtered, unique by `unit_id`
    pub units: Vec<IdentifiedUnit>,
}

/// Rows actually written by one destination call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadCounts {
    pub leads: u64,
    pub units: u64,
    pub energy_rows: u64,
    pub demand_rows: u64,
    pub quality_rows: u64,
}

impl LoadCounts {
    pub fn add(&mut self, other: &LoadCounts) {
        self.leads += other.leads;
        self.units += other.units;
        self.energy_rows += other.energy_rows;
        self.demand_rows += other.demand_rows;
        self.quality_rows += other.quality_rows;
    }
}

/// Where loaded rows go.
///
/// `load` must be atomic per call: either every row of the batch is committed or none is.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Subset of `unit_ids` already present
    async fn existing_units(&self, unit_ids: &[String]) -> Result<HashSet<String>>;

    /// Insert the batch. Leads and units whose keys already exist are left untouched, so
    /// two jobs racing on the same units both succeed; the counts cover new rows only.
    async fn load(&self, batch: &LoadBatch) -> Result<LoadCounts>;

    /// Set coordinates on this job's (distributor, year) units that have none yet.
    /// Returns the number of units updated.
    async fn apply_coordinates(&self, key: &JobKey, updates: &[CoordinateUpdate]) -> Result<u64>;
}

/// Outcome of loading one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub received: u64,
    /// Dropped because an earlier record in the same chunk had the same identity
    pub duplicates: u64,
    /// Dropped because the destination already holds them
    pub already_present: u64,
    pub counts: LoadCounts,
}

/// Keep the first occurrence of every unit identity. Returns the survivors and the number
/// of records dropped.
pub fn dedup_units(units: Vec<IdentifiedUnit>) -> (Vec<IdentifiedUnit>, u64) {
    let mut seen = HashSet::with_capacity(units.len());
    let mut dropped = 0u64;
    let kept = units
        .into_iter()
        .filter(|u| {
            if seen.insert(u.unit_id.clone()) {
                true
            } else {
                trace!(
                    error = %ImportError::DuplicateIdentity(u.unit.natural_code.clone()),
                    "Dropping duplicate"
                );
                dropped += 1;
                false
            }
        })
        .collect();
    (kept, dropped)
}

/// Distinct leads of a set of units, in first-seen order
pub fn collect_leads(key: &JobKey, units: &[IdentifiedUnit]) -> Vec<Lead> {
    let mut order = Vec::new();
    let mut leads = BTreeMap::new();
    for unit in units {
        if !leads.contains_key(&unit.lead_id) {
            order.push(unit.lead_id.clone());
            leads.insert(unit.lead_id.clone(), lead_for(key, unit));
        }
    }
    order
        .into_iter()
        .filter_map(|id| leads.remove(&id))
        .collect()
}

/// Dedup, filter, and hand surviving rows to a [`Destination`]
#[derive(Clone)]
pub struct FanOutLoader {
    destination: Arc<dyn Destination>,
}

impl FanOutLoader {
    pub fn new(destination: Arc<dyn Destination>) -> Self {
        Self { destination }
    }

    pub async fn load_chunk(&self, key: &JobKey, units: Vec<IdentifiedUnit>) -> Result<LoadReport> {
        let received = units.len() as u64;
        let (units, duplicates) = dedup_units(units);
        if duplicates > 0 {
            debug!(job = %key, duplicates, "Dropped duplicate identities within chunk");
        }

        let ids: Vec<String> = units.iter().map(|u| u.unit_id.clone()).collect();
        let existing = self.destination.existing_units(&ids).await?;
        let fresh: Vec<IdentifiedUnit> = units
            .into_iter()
            .filter(|u| !existing.contains(&u.unit_id))
            .collect();

        let mut report = LoadReport {
            received,
            duplicates,
            already_present: existing.len() as u64,
            counts: LoadCounts::default(),
        };
        if fresh.is_empty() {
            debug!(job = %key, already_present = report.already_present, "Nothing new in chunk");
            return Ok(report);
        }

        let batch = LoadBatch {
            key: key.clone(),
            leads: collect_leads(key, &fresh),
            units: fresh,
        };
        let sent = batch.units.len() as u64;
        report.counts = self.destination.load(&batch).await?;
        // Units a concurrent job stored after the filter ran
        report.already_present += sent.saturating_sub(report.counts.units);

        info!(
            job = %key,
            units = report.counts.units,
            leads = report.counts.leads,
            energy = report.counts.energy_rows,
            demand = report.counts.demand_rows,
            quality = report.counts.quality_rows,
            "Loaded chunk"
        );
        Ok(report)
    }

    pub async fn apply_coordinates(&self, key: &JobKey, updates: &[CoordinateUpdate]) -> Result<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        let updated = self.destination.apply_coordinates(key, updates).await?;
        debug!(job = %key, received = updates.len(), updated, "Applied coordinates");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::resolve;
    use crate::models::CanonicalUnit;

    fn units(key: &JobKey, codes: &[&str]) -> Vec<IdentifiedUnit> {
        let canonical = codes
            .iter()
            .map(|code| CanonicalUnit {
                natural_code: code.to_string(),
                neighborhood: Some("Centro".into()),
                postal_code: "01310100".into(),
                ..Default::default()
            })
            .collect();
        resolve(key, canonical)
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let key = JobKey::new("CPFL", 2023, "UCBT");
        let mut input = units(&key, &["X1", "X1", "X2"]);
        input[1].unit.description = Some("second".into());

        let (kept, dropped) = dedup_units(input);
        assert_eq!(dropped, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].unit.description, None);
    }

    #[test]
    fn test_collect_leads_is_distinct() {
        let key = JobKey::new("CPFL", 2023, "UCBT");
        let leads = collect_leads(&key, &units(&key, &["X1", "X2", "X3"]));
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].postal_code, "01310100");
    }

    #[tokio::test]
    async fn test_load_chunk_filters_existing_units() {
        let key = JobKey::new("CPFL", 2023, "UCBT");
        let destination = Arc::new(MemoryDestination::new());
        let loader = FanOutLoader::new(destination.clone());

        let first = loader.load_chunk(&key, units(&key, &["X1", "X1", "X2"])).await.unwrap();
        assert_eq!(first.duplicates, 1);
        assert_eq!(first.counts.units, 2);
        assert_eq!(first.counts.leads, 1);

        let second = loader.load_chunk(&key, units(&key, &["X2", "X3"])).await.unwrap();
        assert_eq!(second.already_present, 1);
        assert_eq!(second.counts.units, 1);
        assert_eq!(second.counts.leads, 0);
        assert_eq!(destination.unit_count().await, 3);
    }
}
