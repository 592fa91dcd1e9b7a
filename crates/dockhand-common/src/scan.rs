use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{EnvironmentId, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Negligible,
    Unknown,
}

impl Severity {
    /// Case-insensitive parse of the severity strings scanners emit.
    /// Anything unrecognized lands in `Unknown` rather than failing a scan.
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" => Severity::Low,
            "negligible" | "informational" => Severity::Negligible,
            _ => Severity::Unknown,
        }
    }
}

/// Per-severity finding counts for one scanned image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityTally {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub negligible: u32,
    pub unknown: u32,
}

impl SeverityTally {
    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Negligible => self.negligible += 1,
            Severity::Unknown => self.unknown += 1,
        }
    }

    pub fn total(&self) -> u64 {
        u64::from(self.critical)
            + u64::from(self.high)
            + u64::from(self.medium)
            + u64::from(self.low)
            + u64::from(self.negligible)
            + u64::from(self.unknown)
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn merge(&mut self, other: &SeverityTally) {
        self.critical += other.critical;
        self.high += other.high;
        self.medium += other.medium;
        self.low += other.low;
        self.negligible += other.negligible;
        self.unknown += other.unknown;
    }

    /// Orders severity profiles from critical downward; the first severity
    /// class where the counts differ decides the comparison.
    pub fn worse_than(&self, other: &SeverityTally) -> bool {
        let mine = [
            self.critical,
            self.high,
            self.medium,
            self.low,
            self.negligible,
            self.unknown,
        ];
        let theirs = [
            other.critical,
            other.high,
            other.medium,
            other.low,
            other.negligible,
            other.unknown,
        ];
        mine > theirs
    }
}

impl std::fmt::Display for SeverityTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "critical={} high={} medium={} low={} negligible={} unknown={}",
            self.critical, self.high, self.medium, self.low, self.negligible, self.unknown
        )
    }
}

/// What one scanner reported for one image: the severity tally the gate
/// reasons about, plus the raw findings, which the engine carries but does
/// not interpret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanFindings {
    pub scanner: String,
    pub tally: SeverityTally,
    pub findings: serde_json::Value,
}

/// Vulnerability-scanner collaborator. An empty result vector means no
/// scanner is configured for the installation.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(&self, image: &str, environment: EnvironmentId) -> Result<Vec<ScanFindings>>;
}
