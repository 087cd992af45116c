use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rpl_core::{Finding, ScanTarget, Severity};
use rpl_step::{expand_args, run_command, CommandError, CommandOutput};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ScanError, Scanner, TargetKind};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    /// `trivy --format json`
    Trivy,
    /// JSON array of `{id, severity, package?, title?}`.
    Findings,
}

/// Runs an external scanner and parses its JSON report from stdout.
#[derive(Clone, Debug)]
pub struct CommandScanner {
    pub name: String,
    pub kind: TargetKind,
    pub program: String,
    /// `{target}` is replaced by the source path or image reference.
    pub args: Vec<String>,
    pub format: ReportFormat,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Exit code the scanner uses for "ran fine, found something" (`trivy --exit-code N`).
    /// Any other non-zero exit is a failed invocation even if stdout parses.
    pub findings_exit_code: Option<i32>,
}

#[async_trait]
impl Scanner for CommandScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn target_kind(&self) -> TargetKind {
        self.kind
    }

    async fn scan(&self, target: &ScanTarget) -> Result<Vec<Finding>, ScanError> {
        let target_arg = target.describe();
        let args = expand_args(&self.args, &[("target", target_arg.as_str())]);
        let out = run_command(&self.workdir, &self.program, &args, None, self.timeout)
            .await
            .map_err(|e| match e {
                CommandError::TimedOut { .. } => ScanError::Transient(e.to_string()),
                other => ScanError::Invocation(other.to_string()),
            })?;

        if !self.is_verdict_exit(out.exit_code) {
            return Err(self.failure(&out));
        }
        match parse_report(self.format, &self.name, &out.stdout) {
            Ok(findings) => Ok(findings),
            Err(parse_err) => {
                debug!(scanner = %self.name, "unparseable report: {parse_err}");
                Err(self.failure(&out))
            }
        }
    }
}

impl CommandScanner {
    fn is_verdict_exit(&self, exit_code: Option<i32>) -> bool {
        match exit_code {
            Some(0) => true,
            Some(code) => self.findings_exit_code == Some(code),
            None => false,
        }
    }

    fn failure(&self, out: &CommandOutput) -> ScanError {
        let stderr = out.stderr_str();
        if looks_transient(&stderr) {
            ScanError::Transient(stderr)
        } else {
            ScanError::Invocation(format!("{} exited with {:?}: {}", self.program, out.exit_code, stderr))
        }
    }
}

fn looks_transient(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    ["timeout", "temporarily unavailable", "failed to download", "connection reset", "too many requests"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[derive(Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Vec<TrivyResult>,
}

#[derive(Deserialize)]
struct TrivyResult {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    id: String,
    #[serde(rename = "PkgName", default)]
    package: Option<String>,
    #[serde(rename = "Severity", default)]
    severity: String,
    #[serde(rename = "Title", default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct NativeFinding {
    id: String,
    severity: String,
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

pub fn parse_report(format: ReportFormat, scanner: &str, bytes: &[u8]) -> serde_json::Result<Vec<Finding>> {
    let finding = |id: String, severity: &str, package: Option<String>, title: Option<String>| Finding {
        id,
        severity: Severity::parse(severity).unwrap_or(Severity::Unknown),
        package,
        title: title.unwrap_or_default(),
        scanner: scanner.to_string(),
    };

    match format {
        ReportFormat::Trivy => {
            let report: TrivyReport = serde_json::from_slice(bytes)?;
            Ok(report
                .results
                .into_iter()
                .flat_map(|r| r.vulnerabilities.unwrap_or_default())
                .map(|v| finding(v.id, &v.severity, v.package, v.title))
                .collect())
        }
        ReportFormat::Findings => {
            let items: Vec<NativeFinding> = serde_json::from_slice(bytes)?;
            Ok(items
                .into_iter()
                .map(|f| finding(f.id, &f.severity, f.package, f.title))
                .collect())
        }
    }
}
