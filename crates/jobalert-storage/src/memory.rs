use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobalert_core::{
    NewHistoryEntry, NotificationGroup, NotificationHistoryEntry, PushDeliveryRecord, PushState,
    RecordOutcome, Watermark,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{InboxPage, NotificationStore, StoreError};

/// Process-local store with the same constraint semantics as the Postgres schema.
///
/// Backs dry runs and tests. Every operation holds one lock, so inserts and group
/// writes are atomic with respect to each other.
#[derive(Debug, Default)]
pub struct MemoryNotificationStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: Vec<NotificationHistoryEntry>,
    groups: HashMap<Uuid, StoredGroup>,
    deliveries: Vec<PushDeliveryRecord>,
    watermarks: HashMap<String, Watermark>,
}

#[derive(Debug, Clone)]
struct StoredGroup {
    created_at: DateTime<Utc>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<NotificationHistoryEntry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn deliveries(&self) -> Vec<PushDeliveryRecord> {
        self.state.lock().await.deliveries.clone()
    }

    pub async fn group_count(&self) -> usize {
        self.state.lock().await.groups.len()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn record_if_new(&self, entry: NewHistoryEntry) -> Result<RecordOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let exists = state
            .entries
            .iter()
            .any(|e| e.user_id == entry.user_id && e.job_unique_key == entry.job_unique_key);
        if exists {
            return Ok(RecordOutcome::AlreadyNotified);
        }
        let stored = entry.into_entry(Uuid::new_v4());
        state.entries.push(stored.clone());
        Ok(RecordOutcome::Accepted(stored))
    }

    async fn pending_entries(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationHistoryEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && e.push_state == PushState::Pending)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|e| (e.sent_at, e.job_id));
        Ok(out)
    }

    async fn users_with_pending_entries(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.push_state == PushState::Pending)
            .map(|e| e.user_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect())
    }

    async fn mark_suppressed(
        &self,
        entry_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for entry in state.entries.iter_mut() {
            if entry.push_state == PushState::Pending && entry_ids.contains(&entry.id) {
                entry.push_state = PushState::Suppressed;
                entry.updated_at = now;
            }
        }
        Ok(())
    }

    async fn create_group(&self, group: &NotificationGroup) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let ids = group.entry_ids();
        let claimed = state
            .entries
            .iter()
            .filter(|e| ids.contains(&e.id) && e.push_state == PushState::Pending)
            .count() as u64;
        if claimed != ids.len() as u64 {
            return Err(StoreError::GroupConflict {
                group_id: group.id,
                claimed,
                expected: ids.len() as u64,
            });
        }

        for entry in state.entries.iter_mut().filter(|e| ids.contains(&e.id)) {
            entry.push_state = PushState::Pushed;
            entry.group_id = Some(group.id);
            entry.updated_at = group.created_at;
        }
        state.groups.insert(
            group.id,
            StoredGroup {
                created_at: group.created_at,
            },
        );
        Ok(())
    }

    async fn pushed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter_map(|e| {
                let group = state.groups.get(&e.group_id?)?;
                (group.created_at >= since).then(|| (e.user_id.clone(), group.created_at))
            })
            .collect())
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && !e.is_read)
            .count() as u64)
    }

    async fn save_delivery(&self, record: &PushDeliveryRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state.deliveries.iter_mut().find(|d| {
            d.notification_group_id == record.notification_group_id
                && d.device_token == record.device_token
        }) {
            Some(existing) => *existing = record.clone(),
            None => state.deliveries.push(record.clone()),
        }
        Ok(())
    }

    async fn load_watermark(&self, reader: &str) -> Result<Option<Watermark>, StoreError> {
        Ok(self.state.lock().await.watermarks.get(reader).cloned())
    }

    async fn advance_watermark(
        &self,
        reader: &str,
        last_posting_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mark = state
            .watermarks
            .entry(reader.to_string())
            .or_insert_with(|| Watermark {
                reader: reader.to_string(),
                last_posting_id,
                updated_at: now,
            });
        mark.last_posting_id = mark.last_posting_id.max(last_posting_id);
        mark.updated_at = now;
        Ok(())
    }

    async fn list_entries(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<InboxPage, StoreError> {
        let state = self.state.lock().await;
        let mut owned = state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        owned.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then(b.job_id.cmp(&a.job_id)));

        let total_count = owned.len() as u64;
        let unread_count = owned.iter().filter(|e| !e.is_read).count() as u64;
        let notifications = owned
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(InboxPage {
            notifications,
            unread_count,
            total_count,
        })
    }

    async fn mark_read(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationHistoryEntry>, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .map(|entry| {
                entry.is_read = true;
                entry.updated_at = now;
                entry.clone()
            }))
    }

    async fn delete_entry(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state.entries.retain(|e| e.id != entry_id);
        Ok(state.entries.len() != before)
    }

    async fn group_entries_for(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<Vec<NotificationHistoryEntry>>, StoreError> {
        let state = self.state.lock().await;
        let Some(entry) = state.entries.iter().find(|e| e.id == entry_id) else {
            return Ok(None);
        };
        let Some(group_id) = entry.group_id else {
            return Ok(Some(vec![entry.clone()]));
        };
        let mut members = state
            .entries
            .iter()
            .filter(|e| e.group_id == Some(group_id))
            .cloned()
            .collect::<Vec<_>>();
        members.sort_by_key(|e| (e.sent_at, e.job_id));
        Ok(Some(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobalert_core::{hour_bucket, job_unique_key, DeliveryStatus};

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap()
    }

    fn new_entry(user: &str, job_id: i64, company: &str, title: &str) -> NewHistoryEntry {
        NewHistoryEntry {
            user_id: user.to_string(),
            job_unique_key: job_unique_key(company, title),
            job_id,
            job_title: title.to_string(),
            job_company: company.to_string(),
            job_source: "linkedin".to_string(),
            matched_keywords: vec!["AI".to_string()],
            sent_at: ts(10, job_id as u32),
        }
    }

    fn accepted(outcome: RecordOutcome) -> NotificationHistoryEntry {
        match outcome {
            RecordOutcome::Accepted(entry) => entry,
            RecordOutcome::AlreadyNotified => panic!("expected accepted"),
        }
    }

    fn group_of(user: &str, entries: Vec<NotificationHistoryEntry>, at: DateTime<Utc>) -> NotificationGroup {
        NotificationGroup {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            user_id: user.to_string(),
            hour_bucket: hour_bucket(at),
            matched_keywords: vec!["AI".to_string()],
            job_count: entries.len(),
            entries,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn record_if_new_accepts_once_per_user_and_key() {
        let store = MemoryNotificationStore::new();
        let first = store
            .record_if_new(new_entry("d1", 1, "TechCorp", "AI Engineer"))
            .await
            .unwrap();
        let again = store
            .record_if_new(new_entry("d1", 2, "techcorp", "ai  engineer"))
            .await
            .unwrap();
        let other_user = store
            .record_if_new(new_entry("d2", 1, "TechCorp", "AI Engineer"))
            .await
            .unwrap();

        assert!(matches!(first, RecordOutcome::Accepted(ref e) if e.push_state == PushState::Pending));
        assert_eq!(again, RecordOutcome::AlreadyNotified);
        assert!(matches!(other_user, RecordOutcome::Accepted(_)));
        assert_eq!(store.entries().await.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_inserts_of_the_same_key_accept_exactly_one() {
        let store = std::sync::Arc::new(MemoryNotificationStore::new());
        let mut handles = Vec::new();
        for job_id in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .record_if_new(new_entry("d1", job_id, "Acme", "Rust Developer"))
                    .await
                    .unwrap()
            }));
        }
        let mut accepted_count = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), RecordOutcome::Accepted(_)) {
                accepted_count += 1;
            }
        }
        assert_eq!(accepted_count, 1);
    }

    #[tokio::test]
    async fn create_group_moves_pending_entries_and_rejects_stale_claims() {
        let store = MemoryNotificationStore::new();
        let a = accepted(store.record_if_new(new_entry("d1", 1, "A", "AI 1")).await.unwrap());
        let b = accepted(store.record_if_new(new_entry("d1", 2, "B", "AI 2")).await.unwrap());

        let group = group_of("d1", vec![a.clone(), b.clone()], ts(11, 0));
        store.create_group(&group).await.unwrap();

        assert!(store.pending_entries("d1").await.unwrap().is_empty());
        assert!(store.users_with_pending_entries().await.unwrap().is_empty());
        let pushed = store.pushed_since(ts(10, 59)).await.unwrap();
        assert_eq!(pushed.len(), 2);
        assert!(store.pushed_since(ts(11, 1)).await.unwrap().is_empty());

        let again = group_of("d1", vec![a], ts(11, 5));
        let err = store.create_group(&again).await.unwrap_err();
        assert!(matches!(err, StoreError::GroupConflict { claimed: 0, expected: 1, .. }));
        assert_eq!(store.group_count().await, 1);
    }

    #[tokio::test]
    async fn suppressed_entries_leave_the_pending_set() {
        let store = MemoryNotificationStore::new();
        let a = accepted(store.record_if_new(new_entry("d1", 1, "A", "AI 1")).await.unwrap());
        store.mark_suppressed(&[a.id], ts(12, 0)).await.unwrap();

        let entries = store.entries().await;
        assert_eq!(entries[0].push_state, PushState::Suppressed);
        assert!(store.pending_entries("d1").await.unwrap().is_empty());
        assert!(store.pushed_since(ts(0, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn watermark_only_moves_forward() {
        let store = MemoryNotificationStore::new();
        assert!(store.load_watermark("jobs").await.unwrap().is_none());
        store.advance_watermark("jobs", 40, ts(1, 0)).await.unwrap();
        store.advance_watermark("jobs", 12, ts(2, 0)).await.unwrap();
        let mark = store.load_watermark("jobs").await.unwrap().unwrap();
        assert_eq!(mark.last_posting_id, 40);
    }

    #[tokio::test]
    async fn inbox_pages_newest_first_and_tracks_reads() {
        let store = MemoryNotificationStore::new();
        let mut ids = Vec::new();
        for job_id in 1..=3 {
            let title = format!("AI role {job_id}");
            ids.push(accepted(store.record_if_new(new_entry("d1", job_id, "A", &title)).await.unwrap()).id);
        }

        let page = store.list_entries("d1", 2, 0).await.unwrap();
        assert_eq!(page.total_count, 3);
        assert_eq!(page.unread_count, 3);
        assert_eq!(
            page.notifications.iter().map(|e| e.job_id).collect::<Vec<_>>(),
            vec![3, 2]
        );

        let read = store.mark_read(ids[0], ts(13, 0)).await.unwrap().unwrap();
        assert!(read.is_read);
        assert_eq!(store.unread_count("d1").await.unwrap(), 2);

        assert!(store.delete_entry(ids[1]).await.unwrap());
        assert!(!store.delete_entry(ids[1]).await.unwrap());
        assert_eq!(store.list_entries("d1", 50, 0).await.unwrap().total_count, 2);
        assert!(store.mark_read(Uuid::new_v4(), ts(13, 0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn group_entries_for_returns_push_siblings() {
        let store = MemoryNotificationStore::new();
        let a = accepted(store.record_if_new(new_entry("d1", 1, "A", "AI 1")).await.unwrap());
        let b = accepted(store.record_if_new(new_entry("d1", 2, "B", "AI 2")).await.unwrap());
        let lone = accepted(store.record_if_new(new_entry("d1", 3, "C", "AI 3")).await.unwrap());
        store
            .create_group(&group_of("d1", vec![a.clone(), b], ts(11, 0)))
            .await
            .unwrap();

        let siblings = store.group_entries_for(a.id).await.unwrap().unwrap();
        assert_eq!(siblings.len(), 2);
        let alone = store.group_entries_for(lone.id).await.unwrap().unwrap();
        assert_eq!(alone.len(), 1);
        assert!(store.group_entries_for(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_delivery_replaces_the_record_for_a_token() {
        let store = MemoryNotificationStore::new();
        let mut record = PushDeliveryRecord {
            notification_group_id: Uuid::new_v4(),
            device_token: "tok".into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            attempted_at: ts(9, 0),
            error: None,
        };
        store.save_delivery(&record).await.unwrap();
        record.status = DeliveryStatus::Delivered;
        record.attempts = 1;
        store.save_delivery(&record).await.unwrap();

        let deliveries = store.deliveries().await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Delivered);
    }
}
