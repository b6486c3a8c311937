//! # Feature: Cost Ledger
//!
//! Records what every generation attempt and validation call cost, per model and
//! per session, and mirrors each record to an append-only log file. The
//! in-memory records are authoritative; a log that cannot be written is logged
//! and skipped.
//!
//! - **Version**: 2.0.0
//! - **Since**: 0.5.0
//! - **Toggleable**: false
//!
//! ## Changelog
//! - 2.0.0: Per-session ledger replaces the process-wide usage tracker
//! - 1.1.0: Log file corruption recovery
//! - 1.0.0: Initial release with cost log file

pub mod file;

use chrono::{DateTime, Local};
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::path::Path;

use crate::core::ImageSize;

pub use file::{format_entry, CostLog, LOG_HEADER};

/// Outcome recorded alongside a cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerStatus {
    /// Image generated and accepted by the gate (or no gate)
    Success,
    /// Image generated but scored below the threshold
    ValidationFailed,
    TransientFailure,
    PermanentFailure,
}

impl std::fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerStatus::Success => write!(f, "success"),
            LedgerStatus::ValidationFailed => write!(f, "validation_failed"),
            LedgerStatus::TransientFailure => write!(f, "transient_failure"),
            LedgerStatus::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

impl std::str::FromStr for LedgerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(LedgerStatus::Success),
            "validation_failed" => Ok(LedgerStatus::ValidationFailed),
            "transient_failure" => Ok(LedgerStatus::TransientFailure),
            "permanent_failure" => Ok(LedgerStatus::PermanentFailure),
            _ => Err(format!("Invalid ledger status: {s}")),
        }
    }
}

/// One immutable ledger entry
#[derive(Debug, Clone, PartialEq)]
pub struct CostRecord {
    pub timestamp: DateTime<Local>,
    pub artifact_id: String,
    pub model: String,
    pub size: ImageSize,
    /// Generation cost in USD
    pub cost: f64,
    /// Validation cost in USD
    pub validation_cost: f64,
    pub status: LedgerStatus,
}

impl CostRecord {
    pub fn total(&self) -> f64 {
        self.cost + self.validation_cost
    }
}

/// Append-only cost ledger for one session
#[derive(Debug, Default)]
pub struct CostLedger {
    records: Vec<CostRecord>,
    log: Option<CostLog>,
}

impl CostLedger {
    /// Ledger mirrored to `log_path`, or memory-only when None
    pub fn new(log_path: Option<&Path>) -> Self {
        let log = log_path.and_then(|path| match CostLog::open(path) {
            Ok(log) => Some(log),
            Err(e) => {
                error!("Cost log {} unavailable, tracking in memory only: {e}", path.display());
                None
            }
        });

        Self {
            records: Vec::new(),
            log,
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Record one cost entry and mirror it to the log
    pub fn track(
        &mut self,
        model: &str,
        cost: f64,
        status: LedgerStatus,
        artifact_id: &str,
        size: ImageSize,
        validation_cost: f64,
    ) -> &CostRecord {
        let record = CostRecord {
            timestamp: Local::now(),
            artifact_id: artifact_id.to_string(),
            model: model.to_string(),
            size,
            cost,
            validation_cost,
            status,
        };

        if let Some(log) = &self.log {
            if let Err(e) = log.append(&record) {
                warn!("Failed to write cost log {}: {e}", log.path().display());
            }
        }

        debug!(
            "Tracked ${:.3} for {} ({}), session total ${:.3}",
            record.total(),
            model,
            status,
            self.session_total() + record.total()
        );

        self.records.push(record);
        &self.records[self.records.len() - 1]
    }

    /// Sum of every recorded generation and validation cost
    pub fn session_total(&self) -> f64 {
        self.records.iter().map(CostRecord::total).sum()
    }

    /// Total cost per model
    pub fn breakdown(&self) -> BTreeMap<String, f64> {
        let mut breakdown = BTreeMap::new();
        for record in &self.records {
            *breakdown.entry(record.model.clone()).or_insert(0.0) += record.total();
        }
        breakdown
    }

    pub fn records(&self) -> &[CostRecord] {
        &self.records
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_ref().map(CostLog::path)
    }

    /// Per-model lines sorted by name, then the total
    pub fn display_summary(&self) -> String {
        let mut lines: Vec<String> = self
            .breakdown()
            .iter()
            .map(|(model, cost)| format!("{model}: ${cost:.3}"))
            .collect();
        lines.push(format!("Total: ${:.3}", self.session_total()));
        lines.join("\n")
    }

    /// Make sure everything written so far is on disk
    pub fn flush(&self) {
        if let Some(log) = &self.log {
            if let Err(e) = log.sync() {
                warn!("Failed to sync cost log {}: {e}", log.path().display());
            }
        }
    }
}
