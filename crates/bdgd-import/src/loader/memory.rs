//! In-process destination for dry runs and tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

use super::{Destination, LoadBatch, LoadCounts};
use crate::error::{ImportError, Result};
use crate::models::{CanonicalUnit, CoordinateUpdate, JobKey, Lead, MonthlySeries};

/// A unit row as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredUnit {
    pub id: i64,
    pub unit_key: String,
    pub lead_id: String,
    pub layer: String,
    pub year: i32,
    pub distributor: String,
    pub coordinates: Option<(f64, f64)>,
    pub unit: CanonicalUnit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyRow {
    pub unit: i64,
    pub energy: MonthlySeries,
    pub installed_power: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemandRow {
    pub unit: i64,
    pub peak: MonthlySeries,
    pub off_peak: MonthlySeries,
    pub contracted: MonthlySeries,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualityRow {
    pub unit: i64,
    pub dic: MonthlySeries,
    pub fic: MonthlySeries,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    leads: BTreeMap<String, Lead>,
    units: Vec<StoredUnit>,
    unit_index: HashMap<String, usize>,
    energy: Vec<EnergyRow>,
    demand: Vec<DemandRow>,
    quality: Vec<QualityRow>,
    loads: u64,
}

#[derive(Debug, Default)]
struct Faults {
    layers: HashSet<String>,
    nth_load: Option<u64>,
}

/// Destination backed by in-memory tables.
///
/// Honors the same contract as the Postgres destination: unit keys are unique, a key that is
/// already stored is skipped, and each `load` call commits all of its rows or none.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    tables: Mutex<Tables>,
    faults: Mutex<Faults>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every load for the given layer code
    pub async fn fail_layer(&self, layer: &str) {
        self.faults.lock().await.layers.insert(layer.to_string());
    }

    /// Reject the `n`th load call (1-based, counted across all jobs)
    pub async fn fail_nth_load(&self, n: u64) {
        self.faults.lock().await.nth_load = Some(n);
    }

    pub async fn clear_faults(&self) {
        *self.faults.lock().await = Faults::default();
    }

    pub async fn unit_count(&self) -> usize {
        self.tables.lock().await.units.len()
    }

    pub async fn lead_count(&self) -> usize {
        self.tables.lock().await.leads.len()
    }

    pub async fn energy_count(&self) -> usize {
        self.tables.lock().await.energy.len()
    }

    pub async fn demand_count(&self) -> usize {
        self.tables.lock().await.demand.len()
    }

    pub async fn quality_count(&self) -> usize {
        self.tables.lock().await.quality.len()
    }

    pub async fn units(&self) -> Vec<StoredUnit> {
        self.tables.lock().await.units.clone()
    }

    pub async fn units_for_layer(&self, layer: &str) -> Vec<StoredUnit> {
        self.tables
            .lock()
            .await
            .units
            .iter()
            .filter(|u| u.layer == layer)
            .cloned()
            .collect()
    }

    pub async fn leads(&self) -> Vec<Lead> {
        self.tables.lock().await.leads.values().cloned().collect()
    }

    pub async fn energy_rows(&self) -> Vec<EnergyRow> {
        self.tables.lock().await.energy.clone()
    }

    async fn check_faults(&self, key: &JobKey, load_no: u64) -> Result<()> {
        let faults = self.faults.lock().await;
        if faults.layers.contains(&key.layer) || faults.nth_load == Some(load_no) {
            return Err(ImportError::bulk_load(
                "unidade_consumidora",
                format!("injected failure on load {} for {}", load_no, key),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn existing_units(&self, unit_ids: &[String]) -> Result<HashSet<String>> {
        let tables = self.tables.lock().await;
        Ok(unit_ids
            .iter()
            .filter(|id| tables.unit_index.contains_key(id.as_str()))
            .cloned()
            .collect())
    }

    async fn load(&self, batch: &LoadBatch) -> Result<LoadCounts> {
        let mut tables = self.tables.lock().await;
        tables.loads += 1;
        let load_no = tables.loads;
        self.check_faults(&batch.key, load_no).await?;

        // Keys stored by a concurrent load, or repeated in the batch, are skipped
        let mut batch_keys = HashSet::with_capacity(batch.units.len());
        let mut fresh = Vec::with_capacity(batch.units.len());
        for unit in &batch.units {
            if tables.unit_index.contains_key(&unit.unit_id) || !batch_keys.insert(&unit.unit_id) {
                continue;
            }
            let lead_known = tables.leads.contains_key(&unit.lead_id)
                || batch.leads.iter().any(|l| l.id == unit.lead_id);
            if !lead_known {
                return Err(ImportError::bulk_load(
                    "unidade_consumidora",
                    format!("lead {} not present", unit.lead_id),
                ));
            }
            fresh.push(unit);
        }

        let mut counts = LoadCounts::default();
        for lead in &batch.leads {
            if !tables.leads.contains_key(&lead.id) {
                tables.leads.insert(lead.id.clone(), lead.clone());
                counts.leads += 1;
            }
        }

        for unit in fresh {
            tables.next_id += 1;
            let id = tables.next_id;
            let series = &unit.unit.series;

            tables.energy.push(EnergyRow {
                unit: id,
                energy: series.energy,
                installed_power: unit.unit.installed_power,
            });
            counts.energy_rows += 1;
            if series.has_demand() {
                tables.demand.push(DemandRow {
                    unit: id,
                    peak: series.demand_peak,
                    off_peak: series.demand_off_peak,
                    contracted: series.demand_contracted,
                });
                counts.demand_rows += 1;
            }
            if series.has_quality() {
                tables.quality.push(QualityRow {
                    unit: id,
                    dic: series.dic,
                    fic: series.fic,
                });
                counts.quality_rows += 1;
            }

            let index = tables.units.len();
            tables.unit_index.insert(unit.unit_id.clone(), index);
            tables.units.push(StoredUnit {
                id,
                unit_key: unit.unit_id.clone(),
                lead_id: unit.lead_id.clone(),
                layer: batch.key.layer.clone(),
                year: batch.key.year,
                distributor: batch.key.prefix.clone(),
                coordinates: None,
                unit: unit.unit.clone(),
            });
            counts.units += 1;
        }

        Ok(counts)
    }

    async fn apply_coordinates(&self, key: &JobKey, updates: &[CoordinateUpdate]) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        tables.loads += 1;
        let load_no = tables.loads;
        self.check_faults(key, load_no).await?;

        let by_code: HashMap<&str, &CoordinateUpdate> =
            updates.iter().map(|u| (u.natural_code.as_str(), u)).collect();

        let mut updated = 0u64;
        for unit in tables.units.iter_mut() {
            if unit.coordinates.is_some() || unit.year != key.year || unit.distributor != key.prefix {
                continue;
            }
            if let Some(update) = by_code.get(unit.unit.natural_code.as_str()) {
                unit.coordinates = Some((update.lat, update.lng));
                updated += 1;
            }
        }
        Ok(updated)
    }
}
