//! Process-wide health flags and dependency probes.

use crate::error::{IntakeError, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Most recent pipeline failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageError {
    pub stage: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Flags {
    last_error: Option<StageError>,
    last_success: Option<DateTime<Utc>>,
}

/// Counters and last-event markers for the submission pipeline
#[derive(Debug)]
pub struct ServiceHealth {
    started_at: DateTime<Utc>,
    flags: RwLock<Flags>,
    processed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub last_error: Option<StageError>,
    pub last_success: Option<DateTime<Utc>>,
    pub submissions_processed: u64,
    pub submissions_failed: u64,
    /// The latest pipeline event was a failure
    pub degraded: bool,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHealth {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            flags: RwLock::new(Flags::default()),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.flags.write().last_success = Some(Utc::now());
    }

    pub fn record_failure(&self, error: &IntakeError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.flags.write().last_error = Some(StageError {
            stage: error.stage().to_string(),
            message: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let flags = self.flags.read();
        let degraded = match (&flags.last_error, flags.last_success) {
            (Some(err), Some(ok)) => err.at > ok,
            (Some(_), None) => true,
            _ => false,
        };

        HealthSnapshot {
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            last_error: flags.last_error.clone(),
            last_success: flags.last_success,
            submissions_processed: self.processed.load(Ordering::Relaxed),
            submissions_failed: self.failed.load(Ordering::Relaxed),
            degraded,
        }
    }
}

/// A named dependency probe
pub struct DependencyCheck {
    pub name: &'static str,
    pub probe: BoxFuture<'static, Result<()>>,
}

impl DependencyCheck {
    pub fn new(name: &'static str, probe: BoxFuture<'static, Result<()>>) -> Self {
        Self { name, probe }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

/// Run every probe concurrently, each bounded by `timeout`
pub async fn run_checks(checks: Vec<DependencyCheck>, timeout: Duration) -> Vec<CheckResult> {
    let probes = checks.into_iter().map(|check| async move {
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(timeout, check.probe).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timed out after {}ms", timeout.as_millis())),
        };

        CheckResult {
            name: check.name,
            healthy: error.is_none(),
            error,
            latency_ms,
        }
    });

    futures::future::join_all(probes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_degraded_follows_latest_event() {
        let health = ServiceHealth::new();
        assert!(!health.snapshot().degraded);

        health.record_failure(&IntakeError::Transfer("connection reset".into()));
        let snapshot = health.snapshot();
        assert!(snapshot.degraded);
        assert_eq!(snapshot.submissions_failed, 1);
        assert_eq!(snapshot.last_error.as_ref().unwrap().stage, "transfer");

        std::thread::sleep(Duration::from_millis(2));
        health.record_success();
        let snapshot = health.snapshot();
        assert!(!snapshot.degraded);
        assert_eq!(snapshot.submissions_processed, 1);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn test_run_checks_reports_each_dependency() {
        let checks = vec![
            DependencyCheck::new("ledger", async { Ok::<_, IntakeError>(()) }.boxed()),
            DependencyCheck::new(
                "storage",
                async { Err::<(), _>(IntakeError::Transfer("bucket missing".into())) }.boxed(),
            ),
        ];

        let results = run_checks(checks, Duration::from_secs(1)).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].healthy);
        assert!(!results[1].healthy);
        assert!(results[1].error.as_ref().unwrap().contains("bucket missing"));
    }

    #[tokio::test]
    async fn test_run_checks_times_out_slow_probe() {
        let checks = vec![DependencyCheck::new(
            "session",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, IntakeError>(())
            }
            .boxed(),
        )];

        let results = run_checks(checks, Duration::from_millis(20)).await;
        assert!(!results[0].healthy);
        assert!(results[0].error.as_ref().unwrap().starts_with("timed out"));
    }
}
