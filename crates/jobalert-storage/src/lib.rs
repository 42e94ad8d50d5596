//! Durable notification state: dedup history, groups, delivery log and reader watermarks.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobalert_core::{
    NewHistoryEntry, NotificationGroup, NotificationHistoryEntry, PushDeliveryRecord,
    RecordOutcome, Watermark,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryNotificationStore;
pub use postgres::{connect, run_migrations, PgNotificationStore};

pub const CRATE_NAME: &str = "jobalert-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    /// Some entries of a group were no longer pending when the group was written.
    #[error("group {group_id} lost a race: {claimed} of {expected} entries still pending")]
    GroupConflict {
        group_id: Uuid,
        claimed: u64,
        expected: u64,
    },
}

/// One page of a user's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxPage {
    pub notifications: Vec<NotificationHistoryEntry>,
    pub unread_count: u64,
    pub total_count: u64,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Atomic insert against the `(user_id, job_unique_key)` constraint.
    /// A conflict is reported as [`RecordOutcome::AlreadyNotified`].
    async fn record_if_new(&self, entry: NewHistoryEntry) -> Result<RecordOutcome, StoreError>;

    /// Entries of `user_id` still waiting to be grouped, oldest first.
    async fn pending_entries(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationHistoryEntry>, StoreError>;

    async fn users_with_pending_entries(&self) -> Result<Vec<String>, StoreError>;

    /// Flags pending entries as suppressed. Entries in any other state are left alone.
    async fn mark_suppressed(&self, entry_ids: &[Uuid], now: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Persists the group and moves every member entry from pending to pushed in one
    /// transaction. Fails with [`StoreError::GroupConflict`] without writing anything
    /// if any member is no longer pending.
    async fn create_group(&self, group: &NotificationGroup) -> Result<(), StoreError>;

    /// `(user_id, pushed_at)` for every entry pushed at or after `since`.
    async fn pushed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError>;

    async fn unread_count(&self, user_id: &str) -> Result<u64, StoreError>;

    /// Inserts or replaces the delivery record of `(group, device_token)`.
    async fn save_delivery(&self, record: &PushDeliveryRecord) -> Result<(), StoreError>;

    async fn load_watermark(&self, reader: &str) -> Result<Option<Watermark>, StoreError>;

    /// Moves the watermark forward; never backwards.
    async fn advance_watermark(
        &self,
        reader: &str,
        last_posting_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_entries(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<InboxPage, StoreError>;

    async fn mark_read(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationHistoryEntry>, StoreError>;

    async fn delete_entry(&self, entry_id: Uuid) -> Result<bool, StoreError>;

    /// Entries pushed together with `entry_id`, or the entry alone if it was never grouped.
    async fn group_entries_for(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<Vec<NotificationHistoryEntry>>, StoreError>;
}
