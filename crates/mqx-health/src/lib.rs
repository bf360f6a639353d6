//! Health checks for messaging backends
//!
//! Provides:
//! - `HealthChecker`: a named probe implemented once per backend
//! - `HealthReport`: the `{status, data, details}` report shape
//! - `HealthAggregator`: runs registered probes and folds them into one report

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod aggregator;

pub use aggregator::HealthAggregator;

/// Diagnostic payload attached to a report.
pub type HealthData = serde_json::Map<String, serde_json::Value>;

/// Key under which `HealthChecker::build` stores the failure text by default.
pub const ERROR_KEY: &str = "error";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HealthCheckError {
    #[error("{0}")]
    Failed(String),

    #[error("health probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("health probe aborted: {0}")]
    Aborted(String),
}

impl HealthCheckError {
    pub fn failed(message: impl Into<String>) -> Self {
        HealthCheckError::Failed(message.into())
    }
}

/// A failed probe, with whatever data it gathered before failing.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error}")]
pub struct HealthCheckFailure {
    pub error: HealthCheckError,
    pub data: HealthData,
}

impl HealthCheckFailure {
    pub fn new(error: HealthCheckError) -> Self {
        Self {
            error,
            data: HealthData::new(),
        }
    }

    pub fn with_data(mut self, data: HealthData) -> Self {
        self.data = data;
        self
    }
}

impl From<HealthCheckError> for HealthCheckFailure {
    fn from(error: HealthCheckError) -> Self {
        Self::new(error)
    }
}

/// Up/down status of a checker or of the whole report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    /// Status code used when the report crosses a request/response boundary.
    pub fn http_status_code(&self) -> u16 {
        match self {
            HealthStatus::Up => 200,
            HealthStatus::Down => 503,
        }
    }

    pub fn is_up(&self) -> bool {
        matches!(self, HealthStatus::Up)
    }
}

/// A health report, built fresh for every check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<HealthData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<IndexMap<String, HealthReport>>,
}

impl HealthReport {
    pub fn up() -> Self {
        Self {
            status: HealthStatus::Up,
            data: None,
            details: None,
        }
    }

    pub fn down() -> Self {
        Self {
            status: HealthStatus::Down,
            data: None,
            details: None,
        }
    }

    /// Attach data, leaving `data` unset when the map is empty.
    pub fn with_data(mut self, data: HealthData) -> Self {
        self.data = if data.is_empty() { None } else { Some(data) };
        self
    }

    /// Report for a single checker by name.
    pub fn detail(&self, name: &str) -> Option<&HealthReport> {
        self.details.as_ref().and_then(|d| d.get(name))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A named health probe.
///
/// A failing `check` may carry partial data in its [`HealthCheckFailure`].
/// `build` is only called on failure; it receives that data and the error
/// and returns the payload placed in the report.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<HealthData, HealthCheckFailure>;

    fn build(&self, mut data: HealthData, error: &HealthCheckError) -> HealthData {
        data.insert(ERROR_KEY.to_string(), serde_json::Value::String(error.to_string()));
        data
    }
}
