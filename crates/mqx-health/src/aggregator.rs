//! Health aggregation across named checkers.

use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{HealthCheckError, HealthCheckFailure, HealthChecker, HealthReport, HealthStatus};

/// Runs a set of checkers in registration order and folds their results.
///
/// Each probe runs on its own task with its own deadline, so a caller that
/// stops waiting does not cancel a probe half way through.
pub struct HealthAggregator {
    checkers: Vec<Arc<dyn HealthChecker>>,
    probe_timeout: Duration,
}

impl HealthAggregator {
    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::with_timeout(Self::DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(probe_timeout: Duration) -> Self {
        Self {
            checkers: Vec::new(),
            probe_timeout,
        }
    }

    /// Register a checker. Checkers run in the order they were registered.
    ///
    /// A checker whose name is already registered is ignored.
    pub fn register(&mut self, checker: Arc<dyn HealthChecker>) -> &mut Self {
        if self.checkers.iter().any(|c| c.name() == checker.name()) {
            warn!(checker = %checker.name(), "Health checker already registered, ignoring duplicate");
            return self;
        }
        self.checkers.push(checker);
        self
    }

    pub fn with_checker(mut self, checker: Arc<dyn HealthChecker>) -> Self {
        self.register(checker);
        self
    }

    pub fn len(&self) -> usize {
        self.checkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkers.is_empty()
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Run every checker and build the overall report.
    ///
    /// The overall status is `Down` if any checker is down.
    pub async fn check(&self) -> HealthReport {
        let mut details = IndexMap::with_capacity(self.checkers.len());
        let mut status = HealthStatus::Up;

        for checker in &self.checkers {
            let report = self.run_checker(checker.clone()).await;
            if report.status == HealthStatus::Down {
                status = HealthStatus::Down;
            }
            details.insert(checker.name().to_string(), report);
        }

        HealthReport {
            status,
            data: None,
            details: if details.is_empty() { None } else { Some(details) },
        }
    }

    async fn run_checker(&self, checker: Arc<dyn HealthChecker>) -> HealthReport {
        let timeout = self.probe_timeout;
        let probe = checker.clone();

        let outcome = tokio::spawn(async move {
            match tokio::time::timeout(timeout, probe.check()).await {
                Ok(result) => result,
                Err(_) => Err(HealthCheckFailure::new(HealthCheckError::Timeout(timeout))),
            }
        })
        .await
        .unwrap_or_else(|e| Err(HealthCheckFailure::new(HealthCheckError::Aborted(e.to_string()))));

        match outcome {
            Ok(data) => {
                debug!(checker = %checker.name(), "Health probe succeeded");
                HealthReport::up().with_data(data)
            }
            Err(HealthCheckFailure { error, data }) => {
                warn!(checker = %checker.name(), error = %error, "Health probe failed");
                let data = checker.build(data, &error);
                HealthReport::down().with_data(data)
            }
        }
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}
