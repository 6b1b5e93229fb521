//! Job outcomes and statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::loader::LoadReport;
use crate::models::{JobKey, JobStatus};
use crate::sanitize::SanitizeReport;

/// Statistics collected while importing one layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportStats {
    /// Records read from the source
    pub records_read: u64,
    pub chunks: u64,
    /// Values nulled during sanitization
    pub malformed_fields: u64,
    /// Records dropped for lacking a natural code
    pub skipped_without_code: u64,
    /// Coordinate records without a usable point
    pub skipped_without_point: u64,
    /// Records dropped as duplicates within a chunk
    pub duplicates: u64,
    /// Records already present in the destination
    pub already_present: u64,
    pub units_inserted: u64,
    pub leads_inserted: u64,
    pub series_rows_inserted: u64,
    pub coordinates_applied: u64,
    pub duration_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Mark stats as completed
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
        }
    }

    pub fn add_sanitize(&mut self, report: &SanitizeReport) {
        self.malformed_fields += report.malformed_fields;
        self.skipped_without_code += report.skipped_without_code;
        self.skipped_without_point += report.skipped_without_point;
    }

    pub fn add_load(&mut self, report: &LoadReport) {
        self.duplicates += report.duplicates;
        self.already_present += report.already_present;
        self.units_inserted += report.counts.units;
        self.leads_inserted += report.counts.leads;
        self.series_rows_inserted +=
            report.counts.energy_rows + report.counts.demand_rows + report.counts.quality_rows;
    }

    /// Rows this job wrote: units for unit layers, updated units for the coordinates layer
    pub fn rows_written(&self) -> u64 {
        self.units_inserted + self.coordinates_applied
    }

    /// Records read per second
    pub fn records_per_second(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.records_read as f64 / self.duration_secs
        } else {
            0.0
        }
    }
}

/// How a job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Completed,
    Failed,
    /// Not run: already completed, or still in flight elsewhere
    Skipped,
    /// Run without writing anything
    DryRun,
}

/// Structured result of one job, returned instead of raising
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub key: JobKey,
    pub kind: OutcomeKind,
    /// Rows recorded in the job's status
    pub rows: i64,
    pub error: Option<String>,
    pub stats: ImportStats,
}

impl JobOutcome {
    pub fn skipped(key: JobKey, status: Option<JobStatus>, rows: i64) -> Self {
        Self {
            key,
            kind: OutcomeKind::Skipped,
            rows,
            error: status
                .filter(|s| *s != JobStatus::Completed)
                .map(|s| format!("left alone while {}", s)),
            stats: ImportStats::default(),
        }
    }

    pub fn failed(key: JobKey, error: impl Into<String>, rows: i64, stats: ImportStats) -> Self {
        Self {
            key,
            kind: OutcomeKind::Failed,
            rows,
            error: Some(error.into()),
            stats,
        }
    }
}

/// Outcomes of one orchestrator run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub outcomes: Vec<JobOutcome>,
}

impl RunSummary {
    pub fn push(&mut self, outcome: JobOutcome) {
        self.outcomes.push(outcome);
    }

    fn count(&self, kind: OutcomeKind) -> usize {
        self.outcomes.iter().filter(|o| o.kind == kind).count()
    }

    pub fn completed(&self) -> usize {
        self.count(OutcomeKind::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(OutcomeKind::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(OutcomeKind::Skipped)
    }

    pub fn dry_runs(&self) -> usize {
        self.count(OutcomeKind::DryRun)
    }

    pub fn total_rows(&self) -> i64 {
        self.outcomes
            .iter()
            .filter(|o| o.kind == OutcomeKind::Completed)
            .map(|o| o.rows)
            .sum()
    }

    pub fn outcome(&self, key: &JobKey) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| &o.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadCounts;

    #[test]
    fn test_stats_accumulate_reports() {
        let mut stats = ImportStats::new();
        stats.add_load(&LoadReport {
            received: 5,
            duplicates: 1,
            already_present: 1,
            counts: LoadCounts {
                leads: 1,
                units: 3,
                energy_rows: 3,
                demand_rows: 2,
                quality_rows: 1,
            },
        });
        stats.add_sanitize(&SanitizeReport {
            malformed_fields: 4,
            skipped_without_code: 2,
            ..Default::default()
        });
        stats.complete();

        assert_eq!(stats.units_inserted, 3);
        assert_eq!(stats.series_rows_inserted, 6);
        assert_eq!(stats.rows_written(), 3);
        assert_eq!(stats.malformed_fields, 4);
        assert!(stats.completed_at.is_some());
    }

    #[test]
    fn test_records_per_second() {
        let mut stats = ImportStats::new();
        assert_eq!(stats.records_per_second(), 0.0);

        stats.records_read = 500;
        stats.duration_secs = 2.0;
        assert_eq!(stats.records_per_second(), 250.0);
    }

    #[test]
    fn test_run_summary_counts() {
        let key = |layer: &str| JobKey::new("CPFL", 2023, layer);
        let mut summary = RunSummary::default();
        summary.push(JobOutcome {
            key: key("UCAT"),
            kind: OutcomeKind::Completed,
            rows: 10,
            error: None,
            stats: ImportStats::default(),
        });
        summary.push(JobOutcome::failed(key("UCMT"), "boom", 0, ImportStats::default()));
        summary.push(JobOutcome::skipped(key("UCBT"), Some(JobStatus::Completed), 7));

        assert_eq!(summary.completed(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.total_rows(), 10);
        assert_eq!(summary.outcome(&key("UCBT")).and_then(|o| o.error.clone()), None);
    }
}
