//! Adapters for the engine's external collaborators: the upstream job store, the
//! device/subscription service and the push gateway.

mod fixture;
mod postgres;
mod push;

use std::time::Duration;

use async_trait::async_trait;
use jobalert_core::{Device, JobPosting, KeywordSubscription, PushPayload};
use thiserror::Error;

pub use fixture::{load_fixture_file, FixtureDirectory, FixtureJobSource};
pub use postgres::{PgJobSource, PgSubscriptionDirectory};
pub use push::{
    classify_rejection, classify_reqwest_error, classify_status, HttpPushGateway,
    PushGatewayConfig, RecordingPushGateway, RetryDisposition, SentPush,
};

pub const CRATE_NAME: &str = "jobalert-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Read-only query interface over scraped postings.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Postings with `id > after_id`, ascending by id, at most `limit` of them.
    async fn postings_since(
        &self,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<JobPosting>, SourceError>;
}

/// The external device/subscription service. The engine only ever deactivates tokens.
#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    async fn active_subscriptions(&self) -> Result<Vec<KeywordSubscription>, SourceError>;

    async fn devices(&self, device_ids: &[String]) -> Result<Vec<Device>, SourceError>;

    async fn deactivate_device_token(&self, device_token: &str) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Timeouts, connection failures, 5xx and 429: worth retrying.
    #[error("transient gateway failure: {0}")]
    Transient(String),
    /// The token is unknown, expired or unregistered. Never retried.
    #[error("device token rejected: {0}")]
    InvalidToken(String),
    /// Any other refusal (bad payload, auth, topic). Never retried.
    #[error("gateway rejected push with status {status}: {reason}")]
    Rejected { status: u16, reason: String },
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send(&self, device_token: &str, payload: &PushPayload) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt `attempt_index` (zero-based).
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
