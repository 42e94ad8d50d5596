//! Push gateway clients.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jobalert_core::PushPayload;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

use crate::{GatewayError, PushGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

const INVALID_TOKEN_REASONS: &[&str] = &["BadDeviceToken", "DeviceTokenNotForTopic", "Unregistered"];

/// Maps a non-success gateway response onto the engine's failure classes.
pub fn classify_rejection(status: StatusCode, reason: Option<&str>) -> GatewayError {
    let reason = reason.unwrap_or_default().to_string();
    if status == StatusCode::GONE || INVALID_TOKEN_REASONS.contains(&reason.as_str()) {
        return GatewayError::InvalidToken(if reason.is_empty() {
            status.to_string()
        } else {
            reason
        });
    }
    match classify_status(status) {
        RetryDisposition::Retryable => GatewayError::Transient(format!("http status {status}")),
        RetryDisposition::NonRetryable => GatewayError::Rejected {
            status: status.as_u16(),
            reason,
        },
    }
}

#[derive(Debug, Clone)]
pub struct PushGatewayConfig {
    pub base_url: String,
    pub topic: Option<String>,
    pub auth_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for PushGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.push.apple.com".to_string(),
            topic: None,
            auth_token: None,
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RejectionBody {
    reason: Option<String>,
}

/// Gateway speaking the APNs-style `POST /3/device/{token}` protocol.
#[derive(Debug)]
pub struct HttpPushGateway {
    client: reqwest::Client,
    config: PushGatewayConfig,
}

impl HttpPushGateway {
    pub fn new(config: PushGatewayConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building push gateway client")?;
        Ok(Self { client, config })
    }

    fn device_url(&self, device_token: &str) -> String {
        format!(
            "{}/3/device/{}",
            self.config.base_url.trim_end_matches('/'),
            device_token
        )
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send(&self, device_token: &str, payload: &PushPayload) -> Result<(), GatewayError> {
        let span = info_span!("push_send", match_id = %payload.custom_data.match_id);
        async {
            let mut request = self
                .client
                .post(self.device_url(device_token))
                .header("apns-push-type", "alert")
                .header("apns-priority", "10")
                .json(payload);
            if let Some(topic) = &self.config.topic {
                request = request.header("apns-topic", topic);
            }
            if let Some(token) = &self.config.auth_token {
                request = request.bearer_auth(token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    return Err(match classify_reqwest_error(&err) {
                        RetryDisposition::Retryable => GatewayError::Transient(err.to_string()),
                        RetryDisposition::NonRetryable => GatewayError::Rejected {
                            status: 0,
                            reason: err.to_string(),
                        },
                    })
                }
            };

            let status = response.status();
            if status.is_success() {
                debug!(%status, "push accepted");
                return Ok(());
            }
            let reason = response
                .json::<RejectionBody>()
                .await
                .ok()
                .and_then(|body| body.reason);
            Err(classify_rejection(status, reason.as_deref()))
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPush {
    pub device_token: String,
    pub payload: PushPayload,
}

/// Gateway that records every push instead of sending it. Failures can be scripted
/// per token to rehearse retry and deactivation paths.
#[derive(Debug, Default)]
pub struct RecordingPushGateway {
    sent: Mutex<Vec<SentPush>>,
    scripted: Mutex<HashMap<String, VecDeque<GatewayError>>>,
    attempts: Mutex<usize>,
}

impl RecordingPushGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `failures.len()` sends to `device_token` fail with these errors, in order.
    pub async fn script_failures(&self, device_token: &str, failures: Vec<GatewayError>) {
        self.scripted
            .lock()
            .await
            .entry(device_token.to_string())
            .or_default()
            .extend(failures);
    }

    pub async fn sent(&self) -> Vec<SentPush> {
        self.sent.lock().await.clone()
    }

    /// Every call to `send`, successful or not.
    pub async fn attempts(&self) -> usize {
        *self.attempts.lock().await
    }
}

#[async_trait]
impl PushGateway for RecordingPushGateway {
    async fn send(&self, device_token: &str, payload: &PushPayload) -> Result<(), GatewayError> {
        *self.attempts.lock().await += 1;
        if let Some(err) = self
            .scripted
            .lock()
            .await
            .get_mut(device_token)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        debug!(
            device_token,
            title = %payload.aps.alert.title,
            "recorded push"
        );
        self.sent.lock().await.push(SentPush {
            device_token: device_token.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}
