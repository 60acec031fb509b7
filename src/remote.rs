//! Client for the remote daily-summary store.
//!
//! The remote store exposes an authenticated upsert keyed by (user, date).
//! The client sends the full cumulative aggregate and the server replaces
//! the record by key; the sync scheduler's serialized per-user ordering is
//! what makes that replace idempotent and safe to repeat.

use crate::core::aggregate::DailyAggregate;
use serde::{Deserialize, Serialize};

/// Remote store configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://summaries.example.com`
    pub base_url: String,
    /// Bearer authentication token for the principal.
    pub token: String,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            token: token.into(),
        }
    }

    /// Upsert endpoint URL for one (user, date) key.
    pub fn upsert_url(&self, user_id: &str, date_iso: &str) -> String {
        format!(
            "{}/v1/users/{}/summaries/{}",
            self.base_url, user_id, date_iso
        )
    }

    /// Health check endpoint URL.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }
}

/// How a failed upsert should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network unreachable, timeout, or server error; retried with backoff.
    Transient,
    /// No valid session; surfaced for re-authentication, never auto-retried.
    AuthRequired,
    /// The payload failed the server-side schema check; resending the same
    /// data cannot succeed, so it is surfaced instead of retried.
    ValidationRejected,
}

/// Remote client error types.
#[derive(Debug)]
pub enum RemoteError {
    /// Configuration error
    Config(String),
    /// Network/HTTP error
    Network(String),
    /// Server returned an error response
    Server { status: u16, message: String },
    /// JSON serialization error
    Serialization(String),
    /// Payload rejected before sending (client-side wire-contract check)
    Validation(String),
}

impl RemoteError {
    /// Classify for the scheduler's retry decision.
    pub fn classify(&self) -> FailureKind {
        match self {
            RemoteError::Server { status: 401, .. } => FailureKind::AuthRequired,
            RemoteError::Server {
                status: 400 | 403 | 404 | 409 | 422,
                ..
            } => FailureKind::ValidationRejected,
            RemoteError::Validation(_) => FailureKind::ValidationRejected,
            // Timeouts, connection failures, 408/429/5xx, and anything the
            // client could not even build are worth retrying later.
            _ => FailureKind::Transient,
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Config(msg) => write!(f, "Remote config error: {msg}"),
            RemoteError::Network(msg) => write!(f, "Remote network error: {msg}"),
            RemoteError::Server { status, message } => {
                write!(f, "Remote server error ({status}): {message}")
            }
            RemoteError::Serialization(msg) => write!(f, "Remote serialization error: {msg}"),
            RemoteError::Validation(msg) => write!(f, "Payload validation error: {msg}"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Wire payload for the summary upsert.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryPayload {
    /// ISO date key, `YYYY-MM-DD`
    pub date: String,
    /// Cumulative weighted deviation-angle sum
    pub sum_weighted: f64,
    /// Cumulative observed seconds
    pub weight_seconds: f64,
    /// Cumulative sample count
    pub count: u64,
    /// Producer metadata
    pub meta: SummaryMeta,
}

/// Producer metadata attached to each upsert.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryMeta {
    /// Source identifier
    pub source: String,
    /// Version
    pub version: String,
    /// Device identifier
    pub device_id: String,
}

/// Acknowledgement from the summary upsert endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertResponse {
    /// Date key the server stored
    pub date: String,
    /// Server-side update timestamp (RFC3339)
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// True when `s` is a well-formed `YYYY-MM-DD` calendar date.
pub fn is_valid_date_iso(s: &str) -> bool {
    if s.len() != 10 {
        return false;
    }
    let bytes = s.as_bytes();
    let shape_ok = bytes.iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b'-',
        _ => b.is_ascii_digit(),
    });
    shape_ok && chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

/// Check an aggregate against the wire contract before it is sent.
/// Rejecting locally avoids a guaranteed server-side validation failure.
pub fn validate_for_upsert(aggregate: &DailyAggregate) -> Result<(), RemoteError> {
    let date_iso = aggregate.date_iso();
    if !is_valid_date_iso(&date_iso) {
        return Err(RemoteError::Validation(format!(
            "invalid date key: {date_iso}"
        )));
    }
    if !aggregate.sum_weighted.is_finite() {
        return Err(RemoteError::Validation("sum_weighted is not finite".into()));
    }
    if !aggregate.weight_seconds.is_finite() || aggregate.weight_seconds <= 0.0 {
        return Err(RemoteError::Validation(
            "weight_seconds must be finite and strictly positive".into(),
        ));
    }
    Ok(())
}

/// Async client for the remote summary store.
pub struct RemoteClient {
    config: RemoteConfig,
    client: reqwest::Client,
    device_id: String,
}

impl RemoteClient {
    /// Create a new remote client.
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| RemoteError::Config(format!("Failed to create HTTP client: {e}")))?;

        // Device ID from hostname + short instance suffix
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let device_id = format!(
            "posture-{}-{}",
            hostname,
            &uuid::Uuid::new_v4().to_string()[..8]
        );

        Ok(Self {
            config,
            client,
            device_id,
        })
    }

    /// Test connection to the remote store.
    pub async fn test_connection(&self) -> Result<bool, RemoteError> {
        let response = self
            .client
            .get(self.config.health_url())
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    /// Upsert one cumulative daily aggregate.
    ///
    /// Only the aggregate triple crosses the network; raw samples and frames
    /// never do.
    pub async fn upsert(&self, aggregate: &DailyAggregate) -> Result<UpsertResponse, RemoteError> {
        validate_for_upsert(aggregate)?;

        if self.config.token.trim().is_empty() {
            return Err(RemoteError::Server {
                status: 401,
                message: "no authentication token configured".to_string(),
            });
        }

        let date_iso = aggregate.date_iso();
        let payload = SummaryPayload {
            date: date_iso.clone(),
            sum_weighted: aggregate.sum_weighted,
            weight_seconds: aggregate.weight_seconds,
            count: aggregate.count,
            meta: SummaryMeta {
                source: "posture-agent".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                device_id: self.device_id.clone(),
            },
        };

        let response = self
            .client
            .put(self.config.upsert_url(&aggregate.user_id, &date_iso))
            .header("Authorization", format!("Bearer {}", self.config.token))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RemoteError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let ack: UpsertResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;

        Ok(ack)
    }

    /// Get the device ID.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Blocking remote client for use in the synchronous agent loop.
pub struct BlockingRemoteClient {
    inner: RemoteClient,
    runtime: tokio::runtime::Runtime,
}

impl BlockingRemoteClient {
    /// Create a new blocking remote client.
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| RemoteError::Config(format!("Failed to create runtime: {e}")))?;

        Ok(Self {
            inner: RemoteClient::new(config)?,
            runtime,
        })
    }

    /// Test connection to the remote store.
    pub fn test_connection(&self) -> Result<bool, RemoteError> {
        self.runtime.block_on(self.inner.test_connection())
    }

    /// Upsert one cumulative daily aggregate.
    pub fn upsert(&self, aggregate: &DailyAggregate) -> Result<UpsertResponse, RemoteError> {
        self.runtime.block_on(self.inner.upsert(aggregate))
    }

    /// Get the device ID.
    pub fn device_id(&self) -> &str {
        self.inner.device_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_remote_config_urls() {
        let config = RemoteConfig::new("https://summaries.example.com/", "test-token");
        assert_eq!(
            config.upsert_url("u1", "2024-03-05"),
            "https://summaries.example.com/v1/users/u1/summaries/2024-03-05"
        );
        assert_eq!(config.health_url(), "https://summaries.example.com/health");
    }

    #[test]
    fn test_date_iso_validation() {
        assert!(is_valid_date_iso("2024-03-05"));
        assert!(!is_valid_date_iso("2024-13-40"));
        assert!(!is_valid_date_iso("2024-3-5"));
        assert!(!is_valid_date_iso("20240305"));
        assert!(!is_valid_date_iso("2024-02-30"));
    }

    #[test]
    fn test_validate_rejects_empty_aggregate() {
        let empty = DailyAggregate::new("u1", "2024-03-05".parse().unwrap(), Utc::now());
        assert!(validate_for_upsert(&empty).is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_sum() {
        let mut a = DailyAggregate::new("u1", "2024-03-05".parse().unwrap(), Utc::now());
        a.sum_weighted = f64::NAN;
        a.weight_seconds = 10.0;
        a.count = 1;
        assert!(validate_for_upsert(&a).is_err());
    }

    #[test]
    fn test_validate_accepts_populated_aggregate() {
        let mut a = DailyAggregate::new("u1", "2024-03-05".parse().unwrap(), Utc::now());
        a.sum_weighted = 8.5;
        a.weight_seconds = 35.0;
        a.count = 3;
        assert!(validate_for_upsert(&a).is_ok());
    }

    #[test]
    fn test_error_classification() {
        let auth = RemoteError::Server {
            status: 401,
            message: "unauthorized".into(),
        };
        assert_eq!(auth.classify(), FailureKind::AuthRequired);

        let invalid = RemoteError::Server {
            status: 422,
            message: "bad shape".into(),
        };
        assert_eq!(invalid.classify(), FailureKind::ValidationRejected);

        let flaky = RemoteError::Server {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(flaky.classify(), FailureKind::Transient);

        let offline = RemoteError::Network("connection refused".into());
        assert_eq!(offline.classify(), FailureKind::Transient);
    }
}
