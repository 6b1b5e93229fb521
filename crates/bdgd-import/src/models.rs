//! Domain models for the import pipeline
//!
//! Jobs and their status records, the canonical unit produced by the sanitizer, and the
//! monthly series carried by each unit.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Number of monthly slots in every series
pub const MONTHS: usize = 12;

// ============================================================================
// Jobs
// ============================================================================

/// Identifies one import job: one layer of one (distributor, year) extract
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    /// Distributor prefix, e.g. "CPFL_PAULISTA"
    pub prefix: String,
    pub year: i32,
    /// Layer code, e.g. "UCBT"
    pub layer: String,
}

impl JobKey {
    pub fn new(prefix: impl Into<String>, year: i32, layer: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            year,
            layer: layer.into(),
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.prefix, self.year, self.layer)
    }
}

/// Job lifecycle: `queued -> running -> {completed, failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether a job currently in `from` (or with no record) may move to `to`.
    ///
    /// Terminal records may be overwritten by a new run. A job has to pass through
    /// `running` before it can end.
    pub fn can_transition(from: Option<JobStatus>, to: JobStatus) -> bool {
        use JobStatus::*;
        match (from, to) {
            (None, Queued | Running) => true,
            (None, Completed | Failed) => false,
            (Some(Queued), Queued | Running) => true,
            (Some(Queued), Completed | Failed) => false,
            (Some(Running), _) => true,
            (Some(Completed | Failed), Queued | Running) => true,
            (Some(Completed | Failed), Completed | Failed) => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(crate::ImportError::Status(format!("Invalid job status: {}", other))),
        }
    }
}

/// Current status record of a job (one per key)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub key: JobKey,
    pub status: JobStatus,
    pub rows_processed: i64,
    /// Free-text progress note, read by the admin surface
    pub note: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable upsert of a job's status. `None` fields keep their stored value,
/// except `error`, which is always overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub key: JobKey,
    pub status: JobStatus,
    pub rows: Option<i64>,
    pub error: Option<String>,
    pub note: Option<String>,
}

impl StatusUpdate {
    pub fn new(key: JobKey, status: JobStatus) -> Self {
        Self {
            key,
            status,
            rows: None,
            error: None,
            note: None,
        }
    }

    pub fn with_rows(mut self, rows: i64) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

// ============================================================================
// Series
// ============================================================================

/// Destination table a series is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeriesFamily {
    Energy,
    Demand,
    Quality,
}

/// One monthly metric carried by a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeriesKind {
    Energy,
    DemandPeak,
    DemandOffPeak,
    DemandContracted,
    Dic,
    Fic,
}

impl SeriesKind {
    pub fn family(&self) -> SeriesFamily {
        match self {
            SeriesKind::Energy => SeriesFamily::Energy,
            SeriesKind::DemandPeak | SeriesKind::DemandOffPeak | SeriesKind::DemandContracted => {
                SeriesFamily::Demand
            },
            SeriesKind::Dic | SeriesKind::Fic => SeriesFamily::Quality,
        }
    }

    /// Energy lands in a dense array column, so gaps become zero. Demand and quality
    /// gaps mean "not measured" and stay null.
    pub fn zero_fills(&self) -> bool {
        self.family() == SeriesFamily::Energy
    }
}

/// Twelve monthly values, January first
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MonthlySeries(pub [Option<f64>; MONTHS]);

impl MonthlySeries {
    pub fn zeros() -> Self {
        Self([Some(0.0); MONTHS])
    }

    pub fn has_values(&self) -> bool {
        self.0.iter().any(Option::is_some)
    }

    /// Sum month by month. A month is present if present on either side.
    pub fn add(&self, other: &MonthlySeries) -> MonthlySeries {
        let mut out = [None; MONTHS];
        for (slot, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *slot = match (a, b) {
                (Some(a), Some(b)) => Some(a + b),
                (Some(v), None) | (None, Some(v)) => Some(*v),
                (None, None) => None,
            };
        }
        MonthlySeries(out)
    }

    pub fn fill_missing_with_zero(&self) -> MonthlySeries {
        MonthlySeries(self.0.map(|v| Some(v.unwrap_or(0.0))))
    }

    /// Postgres array literal, e.g. `{1.5,NULL,0}`
    pub fn to_pg_array(&self) -> String {
        let items: Vec<String> = self
            .0
            .iter()
            .map(|v| match v {
                Some(v) => v.to_string(),
                None => "NULL".to_string(),
            })
            .collect();
        format!("{{{}}}", items.join(","))
    }
}

/// All series a unit may carry. Every slot exists for every unit; a layer without a
/// given metric simply leaves it empty (or zero for energy).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SeriesSet {
    pub energy: MonthlySeries,
    pub demand_peak: MonthlySeries,
    pub demand_off_peak: MonthlySeries,
    pub demand_contracted: MonthlySeries,
    pub dic: MonthlySeries,
    pub fic: MonthlySeries,
}

impl SeriesSet {
    pub fn get(&self, kind: SeriesKind) -> &MonthlySeries {
        match kind {
            SeriesKind::Energy => &self.energy,
            SeriesKind::DemandPeak => &self.demand_peak,
            SeriesKind::DemandOffPeak => &self.demand_off_peak,
            SeriesKind::DemandContracted => &self.demand_contracted,
            SeriesKind::Dic => &self.dic,
            SeriesKind::Fic => &self.fic,
        }
    }

    pub fn set(&mut self, kind: SeriesKind, series: MonthlySeries) {
        match kind {
            SeriesKind::Energy => self.energy = series,
            SeriesKind::DemandPeak => self.demand_peak = series,
            SeriesKind::DemandOffPeak => self.demand_off_peak = series,
            SeriesKind::DemandContracted => self.demand_contracted = series,
            SeriesKind::Dic => self.dic = series,
            SeriesKind::Fic => self.fic = series,
        }
    }

    pub fn has_demand(&self) -> bool {
        self.demand_peak.has_values()
            || self.demand_off_peak.has_values()
            || self.demand_contracted.has_values()
    }

    pub fn has_quality(&self) -> bool {
        self.dic.has_values() || self.fic.has_values()
    }
}

// ============================================================================
// Canonical records
// ============================================================================

/// A sanitized consumption unit. Every column is present; absent source fields are `None`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalUnit {
    /// Natural code from the source (`COD_ID`)
    pub natural_code: String,
    /// Distributor code as published in the record (`DIST`)
    pub distributor_code: Option<String>,
    pub municipality: Option<String>,
    pub neighborhood: Option<String>,
    /// Always 8 digits or empty
    pub postal_code: String,
    pub connection_date: Option<NaiveDate>,
    pub system_type: Option<String>,
    pub voltage_group: Option<String>,
    pub tariff_modality: Option<String>,
    pub status: Option<String>,
    pub class: Option<String>,
    pub segment: Option<String>,
    pub substation: Option<String>,
    pub cnae: Option<String>,
    pub description: Option<String>,
    pub installed_power: Option<f64>,
    pub series: SeriesSet,
}

/// A canonical unit with its derived identities
#[derive(Debug, Clone, PartialEq)]
pub struct IdentifiedUnit {
    pub unit_id: String,
    pub lead_id: String,
    pub unit: CanonicalUnit,
}

/// Address-level aggregate shared by units at the same location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub neighborhood: Option<String>,
    pub postal_code: String,
    pub municipality: Option<String>,
    pub distributor: String,
}

/// A point read from the coordinates layer, matched to units by natural code
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateUpdate {
    pub natural_code: String,
    pub lat: f64,
    pub lng: f64,
}
