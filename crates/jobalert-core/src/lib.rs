//! Core domain model for the job alert match-and-notify engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobalert-core";

/// A scraped job posting as exposed by the upstream job store. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: i64,
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub location: Option<String>,
    pub source: String,
    pub posted_at: DateTime<Utc>,
}

impl JobPosting {
    /// Dedup fingerprint of the logical posting, independent of its numeric id.
    pub fn unique_key(&self) -> String {
        job_unique_key(&self.company, &self.title)
    }
}

/// Lowercase and collapse runs of whitespace into single spaces.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 hex of the normalized `company|title` pair.
pub fn job_unique_key(company: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_key_fragment(company).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_key_fragment(title).as_bytes());
    hex::encode(hasher.finalize())
}

/// Start of the UTC hour containing `at`.
pub fn hour_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::hours(1)).unwrap_or(at)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSubscription {
    pub id: i64,
    pub device_id: String,
    pub keyword: String,
    pub is_active: bool,
}

/// Local-time window `[start_hour, end_hour)` during which pushes are held back.
///
/// Windows may wrap midnight (`22-7`). Equal bounds describe an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl QuietHours {
    pub fn new(start_hour: u8, end_hour: u8) -> Option<Self> {
        (start_hour < 24 && end_hour < 24).then_some(Self {
            start_hour,
            end_hour,
        })
    }

    pub fn contains(&self, local_hour: u32) -> bool {
        let start = u32::from(self.start_hour);
        let end = u32::from(self.end_hour);
        if start == end {
            false
        } else if start < end {
            (start..end).contains(&local_hour)
        } else {
            local_hour >= start || local_hour < end
        }
    }
}

impl FromStr for QuietHours {
    type Err = String;

    /// Parses `HH-HH`, e.g. `22-07`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("quiet hours must look like HH-HH, got {s:?}"))?;
        let start: u8 = start
            .trim()
            .parse()
            .map_err(|_| format!("invalid quiet hours start {start:?}"))?;
        let end: u8 = end
            .trim()
            .parse()
            .map_err(|_| format!("invalid quiet hours end {end:?}"))?;
        Self::new(start, end).ok_or_else(|| format!("quiet hours out of range: {s:?}"))
    }
}

/// A registered device. The device id doubles as the user id of the history store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub device_token: String,
    pub is_active: bool,
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
}

/// One posting matched for one device within a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMatch {
    pub device_id: String,
    pub job_id: i64,
    pub job_unique_key: String,
    pub job_title: String,
    pub job_company: String,
    pub job_source: String,
    pub matched_keywords: Vec<String>,
    pub matched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushState {
    /// Accepted, waiting to be grouped (new this run, or deferred by quiet hours).
    Pending,
    /// Folded into a notification group and handed to the dispatcher.
    Pushed,
    /// Recorded but delivery withheld by the rate limiter.
    Suppressed,
}

impl PushState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushState::Pending => "pending",
            PushState::Pushed => "pushed",
            PushState::Suppressed => "suppressed",
        }
    }
}

impl fmt::Display for PushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PushState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PushState::Pending),
            "pushed" => Ok(PushState::Pushed),
            "suppressed" => Ok(PushState::Suppressed),
            other => Err(format!("unknown push state {other:?}")),
        }
    }
}

/// Durable per-user-per-job notification fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationHistoryEntry {
    pub id: Uuid,
    pub user_id: String,
    pub job_unique_key: String,
    pub job_id: i64,
    pub job_title: String,
    pub job_company: String,
    pub job_source: String,
    pub matched_keywords: Vec<String>,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
    pub updated_at: DateTime<Utc>,
    pub push_state: PushState,
    pub group_id: Option<Uuid>,
}

/// Insert payload for the history store; ids and state are assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub user_id: String,
    pub job_unique_key: String,
    pub job_id: i64,
    pub job_title: String,
    pub job_company: String,
    pub job_source: String,
    pub matched_keywords: Vec<String>,
    pub sent_at: DateTime<Utc>,
}

impl NewHistoryEntry {
    pub fn from_match(m: &JobMatch) -> Self {
        Self {
            user_id: m.device_id.clone(),
            job_unique_key: m.job_unique_key.clone(),
            job_id: m.job_id,
            job_title: m.job_title.clone(),
            job_company: m.job_company.clone(),
            job_source: m.job_source.clone(),
            matched_keywords: m.matched_keywords.clone(),
            sent_at: m.matched_at,
        }
    }

    pub fn into_entry(self, id: Uuid) -> NotificationHistoryEntry {
        NotificationHistoryEntry {
            id,
            user_id: self.user_id,
            job_unique_key: self.job_unique_key,
            job_id: self.job_id,
            job_title: self.job_title,
            job_company: self.job_company,
            job_source: self.job_source,
            matched_keywords: self.matched_keywords,
            sent_at: self.sent_at,
            is_read: false,
            updated_at: self.sent_at,
            push_state: PushState::Pending,
            group_id: None,
        }
    }
}

/// Result of the atomic dedup insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted(NotificationHistoryEntry),
    AlreadyNotified,
}

/// All admitted entries of one user within one run, sent as a single push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationGroup {
    pub id: Uuid,
    pub run_id: Uuid,
    pub user_id: String,
    pub hour_bucket: DateTime<Utc>,
    pub matched_keywords: Vec<String>,
    pub job_count: usize,
    pub entries: Vec<NotificationHistoryEntry>,
    pub created_at: DateTime<Utc>,
}

impl NotificationGroup {
    pub fn entry_ids(&self) -> Vec<Uuid> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub fn lead_entry(&self) -> Option<&NotificationHistoryEntry> {
        self.entries.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushDeliveryRecord {
    pub notification_group_id: Uuid,
    pub device_token: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub attempted_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Highest posting id fully handed to the pipeline by a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub reader: String,
    pub last_posting_id: i64,
    pub updated_at: DateTime<Utc>,
}

/// Wire payload submitted to the push gateway for one device token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub aps: Aps,
    pub custom_data: CustomData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aps {
    pub alert: Alert,
    pub badge: u64,
    pub sound: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    pub subtitle: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomData {
    #[serde(rename = "type")]
    pub kind: String,
    pub match_id: String,
    pub job_id: i64,
    pub deep_link: String,
}
