use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobalert_adapters::{BackoffPolicy, GatewayError, PushGateway, SubscriptionDirectory};
use jobalert_core::{
    Alert, Aps, CustomData, DeliveryStatus, Device, NotificationGroup, PushDeliveryRecord,
    PushPayload,
};
use jobalert_storage::{NotificationStore, StoreError};
use tracing::{info, info_span, warn, Instrument};

use crate::EngineError;

pub const PAYLOAD_KIND: &str = "job_match";

pub fn build_payload(group: &NotificationGroup, badge: u64, deep_link_base: &str) -> PushPayload {
    let lead = group.lead_entry();
    let (title, subtitle, body) = if group.job_count <= 1 {
        (
            "New Job Match!".to_string(),
            lead.map(|e| e.job_company.clone()).unwrap_or_default(),
            lead.map(|e| e.job_title.clone()).unwrap_or_default(),
        )
    } else {
        (
            format!("{} New Jobs Found!", group.job_count),
            format!("Matching: {}", group.matched_keywords.join(", ")),
            lead.map(|e| format!("{} at {} and more", e.job_title, e.job_company))
                .unwrap_or_default(),
        )
    };

    PushPayload {
        aps: Aps {
            alert: Alert {
                title,
                subtitle,
                body,
            },
            badge,
            sound: "default".to_string(),
        },
        custom_data: CustomData {
            kind: PAYLOAD_KIND.to_string(),
            match_id: group.id.to_string(),
            job_id: lead.map(|e| e.job_id).unwrap_or_default(),
            deep_link: format!("{}/{}", deep_link_base.trim_end_matches('/'), group.id),
        },
    }
}

pub struct PushDispatcher {
    gateway: Arc<dyn PushGateway>,
    directory: Arc<dyn SubscriptionDirectory>,
    store: Arc<dyn NotificationStore>,
    backoff: BackoffPolicy,
    send_timeout: Duration,
    deep_link_base: String,
}

impl PushDispatcher {
    pub fn new(
        gateway: Arc<dyn PushGateway>,
        directory: Arc<dyn SubscriptionDirectory>,
        store: Arc<dyn NotificationStore>,
        backoff: BackoffPolicy,
        send_timeout: Duration,
        deep_link_base: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            directory,
            store,
            backoff,
            send_timeout,
            deep_link_base: deep_link_base.into(),
        }
    }

    /// Sends one push for `group` and records the outcome. Gateway failures end up in
    /// the returned record; only storage errors are returned as `Err`.
    pub async fn dispatch(
        &self,
        group: &NotificationGroup,
        device: &Device,
    ) -> Result<PushDeliveryRecord, StoreError> {
        let span = info_span!("dispatch", group_id = %group.id, jobs = group.job_count);
        async {
            let badge = match self.store.unread_count(&group.user_id).await {
                Ok(count) => count,
                Err(err) => {
                    warn!(error = %err, "unread count unavailable, badging with group size");
                    group.job_count as u64
                }
            };
            let payload = build_payload(group, badge, &self.deep_link_base);

            let mut record = PushDeliveryRecord {
                notification_group_id: group.id,
                device_token: device.device_token.clone(),
                status: DeliveryStatus::Pending,
                attempts: 0,
                attempted_at: Utc::now(),
                error: None,
            };
            self.store.save_delivery(&record).await?;

            let (attempts, outcome) = self.send_with_retry(&device.device_token, &payload).await;
            record.attempts = attempts;
            record.attempted_at = Utc::now();
            match outcome {
                Ok(()) => {
                    record.status = DeliveryStatus::Delivered;
                    info!(attempts, "push delivered");
                }
                Err(err) => {
                    record.status = DeliveryStatus::Failed;
                    record.error = Some(err.to_string());
                    warn!(attempts, error = %err, "push failed");
                    if let EngineError::GatewayTerminal(_) = err {
                        self.deactivate(&device.device_token).await;
                    }
                }
            }
            self.store.save_delivery(&record).await?;
            Ok(record)
        }
        .instrument(span)
        .await
    }

    async fn send_with_retry(&self, token: &str, payload: &PushPayload) -> (u32, Result<(), EngineError>) {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempts = 0u32;
        for attempt in 0..max_attempts {
            attempts += 1;
            let result = tokio::time::timeout(self.send_timeout, self.gateway.send(token, payload))
                .await
                .unwrap_or_else(|_| {
                    Err(GatewayError::Transient(format!(
                        "no gateway response within {:?}",
                        self.send_timeout
                    )))
                });
            let err = match result {
                Ok(()) => return (attempts, Ok(())),
                Err(err) => err,
            };
            match err {
                GatewayError::Transient(reason) if attempt + 1 < max_attempts => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt = attempts, ?delay, %reason, "transient gateway failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                GatewayError::Transient(reason) => {
                    return (attempts, Err(EngineError::GatewayTransient { attempts, reason }))
                }
                GatewayError::InvalidToken(reason) => {
                    return (attempts, Err(EngineError::GatewayTerminal(reason)))
                }
                GatewayError::Rejected { status, reason } => {
                    return (attempts, Err(EngineError::GatewayRejected { status, reason }))
                }
            }
        }
        (
            attempts,
            Err(EngineError::GatewayTransient {
                attempts,
                reason: "retries exhausted".to_string(),
            }),
        )
    }

    async fn deactivate(&self, token: &str) {
        match self.directory.deactivate_device_token(token).await {
            Ok(()) => info!("deactivated rejected device token"),
            Err(err) => warn!(error = %err, "could not deactivate rejected device token"),
        }
    }
}
