use std::sync::Mutex;

use async_trait::async_trait;
use rpl_core::{Finding, ScanTarget};
use rpl_step::FailureClass;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Scanner infrastructure problem (vulnerability DB download, network). Retried.
    #[error("transient scanner failure: {0}")]
    Transient(String),
    /// The scanner could not produce a verdict. Treated as a failed scan.
    #[error("scanner invocation failed: {0}")]
    Invocation(String),
}

impl ScanError {
    pub fn class(&self) -> FailureClass {
        match self {
            ScanError::Transient(_) => FailureClass::Transient,
            ScanError::Invocation(_) => FailureClass::Deterministic,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Source,
    Image,
}

impl TargetKind {
    pub fn matches(&self, target: &ScanTarget) -> bool {
        matches!(
            (self, target),
            (TargetKind::Source, ScanTarget::Source { .. }) | (TargetKind::Image, ScanTarget::Image { .. })
        )
    }
}

/// Static analysis / vulnerability scanner capability.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;
    fn target_kind(&self) -> TargetKind;
    async fn scan(&self, target: &ScanTarget) -> Result<Vec<Finding>, ScanError>;
}

/// Scanner returning canned findings; optionally fails a number of times first.
pub struct StaticScanner {
    name: String,
    kind: TargetKind,
    findings: Vec<Finding>,
    failures: Mutex<Vec<ScanError>>,
}

impl StaticScanner {
    pub fn new(name: &str, kind: TargetKind, findings: Vec<Finding>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            findings,
            failures: Mutex::new(vec![]),
        }
    }

    /// Errors returned by the next calls, in order, before findings are reported.
    pub fn failing_with(self, errors: Vec<ScanError>) -> Self {
        let mut errors = errors;
        errors.reverse();
        Self {
            failures: Mutex::new(errors),
            ..self
        }
    }
}

#[async_trait]
impl Scanner for StaticScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn target_kind(&self) -> TargetKind {
        self.kind
    }

    async fn scan(&self, _target: &ScanTarget) -> Result<Vec<Finding>, ScanError> {
        let next = self.failures.lock().unwrap_or_else(|e| e.into_inner()).pop();
        match next {
            Some(err) => Err(err),
            None => Ok(self.findings.clone()),
        }
    }
}
