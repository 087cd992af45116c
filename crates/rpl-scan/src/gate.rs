use std::sync::Arc;

use rpl_core::{ScanResult, ScanTarget, Severity};
use rpl_step::{retry_with_backoff, RetryPolicy};
use tracing::{info, warn};

use crate::{ScanError, Scanner};

#[derive(Clone, Debug)]
pub struct ScanGateConfig {
    pub severity_threshold: Severity,
    /// When false, findings are reported but never fail the gate.
    pub fail_on_threshold: bool,
    pub retry: RetryPolicy,
}

impl Default for ScanGateConfig {
    fn default() -> Self {
        Self {
            severity_threshold: Severity::High,
            fail_on_threshold: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Runs every scanner applicable to a target and aggregates a single verdict.
///
/// The gate fails closed: a scanner that cannot produce a verdict (after bounded
/// retries for transient errors) fails the gate even without findings.
pub struct ScanGate {
    scanners: Vec<Arc<dyn Scanner>>,
    config: ScanGateConfig,
}

impl ScanGate {
    pub fn new(scanners: Vec<Arc<dyn Scanner>>, config: ScanGateConfig) -> Self {
        Self { scanners, config }
    }

    pub fn config(&self) -> &ScanGateConfig {
        &self.config
    }

    pub async fn evaluate(&self, target: &ScanTarget) -> ScanResult {
        let mut findings = Vec::new();
        let mut errors = Vec::new();

        for scanner in self.scanners.iter().filter(|s| s.target_kind().matches(target)) {
            let step = format!("scan.{}", scanner.name());
            let res = retry_with_backoff(&self.config.retry, &step, ScanError::class, move |_| scanner.scan(target)).await;
            match res {
                Ok(mut found) => {
                    info!(scanner = scanner.name(), target = %target.describe(), count = found.len(), "scan finished");
                    findings.append(&mut found);
                }
                Err(e) => {
                    warn!(scanner = scanner.name(), target = %target.describe(), "scan failed closed: {e}");
                    errors.push(format!("{}: {e}", scanner.name()));
                }
            }
        }

        let threshold = self.config.severity_threshold;
        let over_threshold = findings.iter().any(|f| f.severity >= threshold);
        let passed = errors.is_empty() && !(self.config.fail_on_threshold && over_threshold);

        ScanResult {
            target: target.clone(),
            severity_threshold: threshold,
            findings,
            passed,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StaticScanner, TargetKind};
    use rpl_core::{Finding, ImageRef};
    use std::path::PathBuf;
    use std::time::Duration;

    fn finding(id: &str, severity: Severity) -> Finding {
        Finding {
            id: id.into(),
            severity,
            package: Some("openssl".into()),
            title: "t".into(),
            scanner: "trivy".into(),
        }
    }

    fn image_target() -> ScanTarget {
        ScanTarget::Image {
            image: ImageRef {
                repository: "reg/app".into(),
                tag: "1".into(),
            },
        }
    }

    fn config(threshold: Severity) -> ScanGateConfig {
        ScanGateConfig {
            severity_threshold: threshold,
            fail_on_threshold: true,
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
        }
    }

    fn gate(scanner: StaticScanner, threshold: Severity) -> ScanGate {
        ScanGate::new(vec![Arc::new(scanner)], config(threshold))
    }

    #[tokio::test]
    async fn passes_below_threshold() {
        let s = StaticScanner::new("trivy", TargetKind::Image, vec![finding("CVE-1", Severity::Medium)]);
        let res = gate(s, Severity::High).evaluate(&image_target()).await;
        assert!(res.passed);
        assert_eq!(res.findings.len(), 1);
    }

    #[tokio::test]
    async fn finding_at_threshold_fails() {
        let s = StaticScanner::new("trivy", TargetKind::Image, vec![finding("CVE-2", Severity::High)]);
        let res = gate(s, Severity::High).evaluate(&image_target()).await;
        assert!(!res.passed);
    }

    #[tokio::test]
    async fn report_only_mode_never_fails_on_findings() {
        let s = StaticScanner::new("trivy", TargetKind::Image, vec![finding("CVE-3", Severity::Critical)]);
        let mut cfg = config(Severity::Low);
        cfg.fail_on_threshold = false;
        let res = ScanGate::new(vec![Arc::new(s)], cfg).evaluate(&image_target()).await;
        assert!(res.passed);
        assert_eq!(res.findings.len(), 1);
    }

    #[tokio::test]
    async fn invocation_error_fails_closed() {
        let s = StaticScanner::new("trivy", TargetKind::Image, vec![])
            .failing_with(vec![ScanError::Invocation("exit 2".into())]);
        let res = gate(s, Severity::Critical).evaluate(&image_target()).await;
        assert!(!res.passed);
        assert!(res.findings.is_empty());
        assert_eq!(res.errors.len(), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_within_bound() {
        let s = StaticScanner::new("trivy", TargetKind::Image, vec![]).failing_with(vec![
            ScanError::Transient("db download".into()),
            ScanError::Transient("db download".into()),
        ]);
        let res = gate(s, Severity::High).evaluate(&image_target()).await;
        assert!(res.passed);
        assert!(res.errors.is_empty());
    }

    #[tokio::test]
    async fn persistent_transient_errors_fail_closed() {
        let s = StaticScanner::new("trivy", TargetKind::Image, vec![]).failing_with(vec![
            ScanError::Transient("a".into()),
            ScanError::Transient("b".into()),
            ScanError::Transient("c".into()),
        ]);
        let res = gate(s, Severity::High).evaluate(&image_target()).await;
        assert!(!res.passed);
    }

    #[tokio::test]
    async fn scanners_only_run_against_their_target_kind() {
        let source = StaticScanner::new("sonar", TargetKind::Source, vec![finding("S-1", Severity::Critical)]);
        let g = gate(source, Severity::High);
        let res = g.evaluate(&image_target()).await;
        assert!(res.passed);
        assert!(res.findings.is_empty());
        let res = g
            .evaluate(&ScanTarget::Source {
                path: PathBuf::from("."),
            })
            .await;
        assert!(!res.passed);
    }
}
