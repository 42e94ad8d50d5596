#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jobalert_adapters::{FixtureDirectory, FixtureJobSource, JobSource, RecordingPushGateway};
use jobalert_core::{
    Device, JobPosting, KeywordSubscription, NewHistoryEntry, NotificationGroup,
    NotificationHistoryEntry, PushDeliveryRecord, RecordOutcome, Watermark,
};
use jobalert_engine::{EngineConfig, Pipeline, PipelineDeps, RateCounterStore};
use jobalert_storage::{InboxPage, MemoryNotificationStore, NotificationStore, StoreError};
use uuid::Uuid;

pub fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
}

pub fn posting(id: i64, title: &str, company: &str) -> JobPosting {
    JobPosting {
        id,
        title: title.to_string(),
        company: company.to_string(),
        location: Some("Remote".to_string()),
        source: "linkedin".to_string(),
        posted_at: at(1, 6, 0),
    }
}

pub fn device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        device_token: format!("tok-{id}"),
        is_active: true,
        utc_offset_minutes: None,
        quiet_hours: None,
    }
}

pub fn sub(id: i64, device_id: &str, keyword: &str) -> KeywordSubscription {
    KeywordSubscription {
        id,
        device_id: device_id.to_string(),
        keyword: keyword.to_string(),
        is_active: true,
    }
}

pub struct Harness {
    pub memory: Arc<MemoryNotificationStore>,
    pub store: Arc<FaultyStore>,
    pub directory: Arc<FixtureDirectory>,
    pub gateway: Arc<RecordingPushGateway>,
    pub counters: Arc<RateCounterStore>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub fn new(
        config: EngineConfig,
        postings: Vec<JobPosting>,
        devices: Vec<Device>,
        subscriptions: Vec<KeywordSubscription>,
    ) -> Self {
        Self::with_source(config, Arc::new(FixtureJobSource::new(postings)), devices, subscriptions)
    }

    pub fn with_source(
        config: EngineConfig,
        source: Arc<dyn JobSource>,
        devices: Vec<Device>,
        subscriptions: Vec<KeywordSubscription>,
    ) -> Self {
        let memory = Arc::new(MemoryNotificationStore::new());
        let store = Arc::new(FaultyStore::new(memory.clone()));
        let directory = Arc::new(FixtureDirectory::new(devices, subscriptions));
        let gateway = Arc::new(RecordingPushGateway::new());
        let counters = Arc::new(RateCounterStore::new());
        let pipeline = Pipeline::new(
            &config,
            PipelineDeps {
                source,
                directory: directory.clone(),
                store: store.clone(),
                gateway: gateway.clone(),
            },
            counters.clone(),
        );
        Self {
            memory,
            store,
            directory,
            gateway,
            counters,
            pipeline,
        }
    }

    pub async fn entries_for(&self, user_id: &str) -> Vec<NotificationHistoryEntry> {
        self.memory
            .entries()
            .await
            .into_iter()
            .filter(|e| e.user_id == user_id)
            .collect()
    }
}

/// Delegates to the in-memory store, with switchable faults.
pub struct FaultyStore {
    inner: Arc<MemoryNotificationStore>,
    fail_records_for: Mutex<Option<String>>,
    forget_watermark: Mutex<bool>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryNotificationStore>) -> Self {
        Self {
            inner,
            fail_records_for: Mutex::new(None),
            forget_watermark: Mutex::new(false),
        }
    }

    /// `record_if_new` fails for this user until cleared.
    pub fn fail_records_for(&self, user_id: Option<&str>) {
        *self.fail_records_for.lock().unwrap() = user_id.map(str::to_string);
    }

    /// Makes the reader start from the beginning, as if the watermark had never moved.
    pub fn forget_watermark(&self, forget: bool) {
        *self.forget_watermark.lock().unwrap() = forget;
    }
}

#[async_trait]
impl NotificationStore for FaultyStore {
    async fn record_if_new(&self, entry: NewHistoryEntry) -> Result<RecordOutcome, StoreError> {
        let failing = self.fail_records_for.lock().unwrap().clone();
        if failing.as_deref() == Some(entry.user_id.as_str()) {
            return Err(StoreError::CorruptRow("injected failure".into()));
        }
        self.inner.record_if_new(entry).await
    }

    async fn pending_entries(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationHistoryEntry>, StoreError> {
        self.inner.pending_entries(user_id).await
    }

    async fn users_with_pending_entries(&self) -> Result<Vec<String>, StoreError> {
        self.inner.users_with_pending_entries().await
    }

    async fn mark_suppressed(
        &self,
        entry_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.mark_suppressed(entry_ids, now).await
    }

    async fn create_group(&self, group: &NotificationGroup) -> Result<(), StoreError> {
        self.inner.create_group(group).await
    }

    async fn pushed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        self.inner.pushed_since(since).await
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, StoreError> {
        self.inner.unread_count(user_id).await
    }

    async fn save_delivery(&self, record: &PushDeliveryRecord) -> Result<(), StoreError> {
        self.inner.save_delivery(record).await
    }

    async fn load_watermark(&self, reader: &str) -> Result<Option<Watermark>, StoreError> {
        if *self.forget_watermark.lock().unwrap() {
            return Ok(None);
        }
        self.inner.load_watermark(reader).await
    }

    async fn advance_watermark(
        &self,
        reader: &str,
        last_posting_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner
            .advance_watermark(reader, last_posting_id, now)
            .await
    }

    async fn list_entries(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<InboxPage, StoreError> {
        self.inner.list_entries(user_id, limit, offset).await
    }

    async fn mark_read(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationHistoryEntry>, StoreError> {
        self.inner.mark_read(entry_id, now).await
    }

    async fn delete_entry(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete_entry(entry_id).await
    }

    async fn group_entries_for(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<Vec<NotificationHistoryEntry>>, StoreError> {
        self.inner.group_entries_for(entry_id).await
    }
}
