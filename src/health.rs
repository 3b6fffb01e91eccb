//! Health and data-integrity checks.
//!
//! [`HealthChecker::check`] runs four cheap probes and reduces them to a
//! verdict: all passing is healthy, at least 60% passing is a warning,
//! anything less is an error. [`HealthChecker::data_integrity_check`] is a
//! full read-only walk that reports field coverage and every shape issue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use course_harness_core::models::fields;
use course_harness_core::store::Store;
use course_harness_core::validate::{
    question_issues, validate_collection, validate_question, Severity, ShapeRules,
};

use crate::enrichment::EnrichmentService;

/// Records inspected by each shape probe.
const SAMPLE_SIZE: usize = 5;

/// Share of passing probes at or above which the verdict is only a warning.
const WARNING_RATIO: f64 = 0.6;

const COLLECTION_FIELDS: &[&str] = &[fields::DESCRIPTION, fields::CATEGORY];
const RECORD_FIELDS: &[&str] = &[
    fields::EXPLANATION,
    fields::DIFFICULTY,
    fields::TAGS,
    fields::TOPIC,
    fields::ENRICHED_BY,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthVerdict {
    pub status: HealthStatus,
    pub checks: Vec<CheckResult>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub id: String,
    pub issue: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub total_collections: u64,
    pub total_records: u64,
    /// Field name → number of records carrying it.
    pub field_presence: BTreeMap<String, u64>,
    /// Records with at least one error-severity issue.
    pub invalid_records: u64,
    pub findings: Vec<Finding>,
}

/// Reduce probe outcomes to a verdict.
pub fn reduce(checks: &[CheckResult]) -> HealthStatus {
    if checks.is_empty() {
        return HealthStatus::Error;
    }
    let passed = checks.iter().filter(|c| c.passed).count();
    if passed == checks.len() {
        HealthStatus::Healthy
    } else if passed as f64 / checks.len() as f64 >= WARNING_RATIO {
        HealthStatus::Warning
    } else {
        HealthStatus::Error
    }
}

pub struct HealthChecker {
    store: Arc<dyn Store>,
    service: Arc<dyn EnrichmentService>,
    rules: ShapeRules,
    probe_timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn Store>,
        service: Arc<dyn EnrichmentService>,
        rules: ShapeRules,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            store,
            service,
            rules,
            probe_timeout,
        }
    }

    pub async fn check(&self) -> HealthVerdict {
        let checks = vec![
            timed("store_reachable", self.store_reachable()).await,
            timed("enrichment_reachable", self.enrichment_reachable()).await,
            timed("collection_shape", self.collection_shape()).await,
            timed("record_shape", self.record_shape()).await,
        ];
        let status = reduce(&checks);
        tracing::info!(status = ?status, "health check finished");
        HealthVerdict {
            status,
            checks,
            checked_at: Utc::now(),
        }
    }

    async fn store_reachable(&self) -> Result<String, String> {
        self.store
            .list_collections()
            .await
            .map(|c| format!("{} collections", c.len()))
            .map_err(|e| format!("{:#}", e))
    }

    async fn enrichment_reachable(&self) -> Result<String, String> {
        match tokio::time::timeout(self.probe_timeout, self.service.probe()).await {
            Ok(Ok(())) => Ok(format!("{} reachable", self.service.name())),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no response within {} ms",
                self.probe_timeout.as_millis()
            )),
        }
    }

    async fn collection_shape(&self) -> Result<String, String> {
        let collections = self
            .store
            .list_collections()
            .await
            .map_err(|e| format!("{:#}", e))?;
        let sample: Vec<_> = collections.iter().take(SAMPLE_SIZE).collect();
        for c in &sample {
            if let Err(issue) = validate_collection(&c.to_record()) {
                return Err(format!("{}: {}", c.id, issue));
            }
        }
        Ok(format!("{} sampled", sample.len()))
    }

    /// Samples child records across collections until `SAMPLE_SIZE` is reached.
    async fn record_shape(&self) -> Result<String, String> {
        let collections = self
            .store
            .list_collections()
            .await
            .map_err(|e| format!("{:#}", e))?;
        let mut sampled = 0usize;
        for c in &collections {
            if sampled >= SAMPLE_SIZE {
                break;
            }
            let refs = self
                .store
                .list_records(&c.id)
                .await
                .map_err(|e| format!("{:#}", e))?;
            for reference in refs.iter().take(SAMPLE_SIZE - sampled) {
                let record = match self.store.get_record(reference).await {
                    Ok(Some(r)) => r,
                    Ok(None) => continue,
                    Err(e) => return Err(format!("{:#}", e)),
                };
                if let Err(issue) = validate_question(&record, &self.rules) {
                    return Err(format!("{}: {}", reference, issue));
                }
                sampled += 1;
            }
        }
        Ok(format!("{} sampled", sampled))
    }

    /// Walk every record and report field coverage and shape issues.
    pub async fn data_integrity_check(&self) -> Result<IntegrityReport> {
        let collections = self.store.list_collections().await?;
        let mut presence: BTreeMap<String, u64> = COLLECTION_FIELDS
            .iter()
            .chain(RECORD_FIELDS)
            .map(|f| (f.to_string(), 0))
            .collect();
        let mut findings = Vec::new();
        let mut invalid = 0u64;
        let mut total_records = 0u64;

        for c in &collections {
            let record = c.to_record();
            for f in COLLECTION_FIELDS {
                if record.has(f) {
                    *presence.entry(f.to_string()).or_default() += 1;
                }
            }
            if let Err(issue) = validate_collection(&record) {
                invalid += 1;
                findings.push(Finding {
                    id: c.id.clone(),
                    issue: issue.to_string(),
                    severity: issue.severity(),
                });
            }

            for reference in self.store.list_records(&c.id).await? {
                let Some(record) = self.store.get_record(&reference).await? else {
                    continue;
                };
                total_records += 1;
                for f in RECORD_FIELDS {
                    if record.has(f) {
                        *presence.entry(f.to_string()).or_default() += 1;
                    }
                }
                let issues = question_issues(&record, &self.rules);
                if issues.iter().any(|i| i.severity() == Severity::Error) {
                    invalid += 1;
                }
                findings.extend(issues.into_iter().map(|issue| Finding {
                    id: reference.to_string(),
                    issue: issue.to_string(),
                    severity: issue.severity(),
                }));
            }
        }

        Ok(IntegrityReport {
            total_collections: collections.len() as u64,
            total_records,
            field_presence: presence,
            invalid_records: invalid,
            findings,
        })
    }
}

async fn timed<F>(name: &str, probe: F) -> CheckResult
where
    F: std::future::Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let outcome = probe.await;
    let duration_ms = start.elapsed().as_millis() as u64;
    let (passed, message) = match outcome {
        Ok(m) => (true, m),
        Err(m) => {
            tracing::warn!(check = name, error = %m, "health probe failed");
            (false, m)
        }
    };
    CheckResult {
        name: name.to_string(),
        passed,
        message,
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(passed: bool) -> CheckResult {
        CheckResult {
            name: "x".into(),
            passed,
            message: String::new(),
            duration_ms: 0,
        }
    }

    #[test]
    fn verdict_thresholds() {
        assert_eq!(reduce(&vec![check(true); 4]), HealthStatus::Healthy);
        assert_eq!(
            reduce(&[check(true), check(true), check(true), check(false)]),
            HealthStatus::Warning
        );
        assert_eq!(
            reduce(&[check(true), check(true), check(false), check(false)]),
            HealthStatus::Error
        );
        // 3 of 5 is exactly 60%
        assert_eq!(
            reduce(&[check(true), check(true), check(true), check(false), check(false)]),
            HealthStatus::Warning
        );
        assert_eq!(reduce(&[]), HealthStatus::Error);
    }
}
