use rpl_core::{Finding, ScanResult, Severity};
use serde::{Deserialize, Serialize};

/// Serialized report written next to the run's provenance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanReport {
    pub target: String,
    pub threshold: Severity,
    pub passed: bool,
    pub counts: SeverityCounts,
    pub blocking: Vec<Finding>,
    pub findings: Vec<Finding>,
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeverityCounts {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub unknown: usize,
}

impl SeverityCounts {
    pub fn tally(findings: &[Finding]) -> Self {
        let mut c = Self::default();
        for f in findings {
            match f.severity {
                Severity::Critical => c.critical += 1,
                Severity::High => c.high += 1,
                Severity::Medium => c.medium += 1,
                Severity::Low => c.low += 1,
                Severity::Unknown => c.unknown += 1,
            }
        }
        c
    }
}

impl From<&ScanResult> for ScanReport {
    fn from(r: &ScanResult) -> Self {
        Self {
            target: r.target.describe(),
            threshold: r.severity_threshold,
            passed: r.passed,
            counts: SeverityCounts::tally(&r.findings),
            blocking: r.blocking_findings().cloned().collect(),
            findings: r.findings.clone(),
            errors: r.errors.clone(),
        }
    }
}

pub fn report_json(result: &ScanResult) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec_pretty(&ScanReport::from(result))
}
