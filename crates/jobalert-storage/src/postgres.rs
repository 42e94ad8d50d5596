use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobalert_core::{
    NewHistoryEntry, NotificationGroup, NotificationHistoryEntry, PushDeliveryRecord, PushState,
    RecordOutcome, Watermark,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::{InboxPage, NotificationStore, StoreError};

const ENTRY_COLUMNS: &str = "id, user_id, job_unique_key, job_id, job_title, job_company, \
     job_source, matched_keywords, sent_at, is_read, updated_at, push_state, group_id";

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn entry_from_row(row: &PgRow) -> Result<NotificationHistoryEntry, StoreError> {
    let push_state: String = row.try_get("push_state")?;
    Ok(NotificationHistoryEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        job_unique_key: row.try_get("job_unique_key")?,
        job_id: row.try_get("job_id")?,
        job_title: row.try_get("job_title")?,
        job_company: row.try_get("job_company")?,
        job_source: row.try_get("job_source")?,
        matched_keywords: row.try_get("matched_keywords")?,
        sent_at: row.try_get("sent_at")?,
        is_read: row.try_get("is_read")?,
        updated_at: row.try_get("updated_at")?,
        push_state: push_state.parse::<PushState>().map_err(StoreError::CorruptRow)?,
        group_id: row.try_get("group_id")?,
    })
}

fn entries_from_rows(rows: &[PgRow]) -> Result<Vec<NotificationHistoryEntry>, StoreError> {
    rows.iter().map(entry_from_row).collect()
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn record_if_new(&self, entry: NewHistoryEntry) -> Result<RecordOutcome, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO notification_history
                (id, user_id, job_unique_key, job_id, job_title, job_company, job_source,
                 matched_keywords, sent_at, is_read, updated_at, push_state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, $9, 'pending')
            ON CONFLICT ON CONSTRAINT notification_history_user_job_key DO NOTHING
            RETURNING {ENTRY_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&entry.user_id)
            .bind(&entry.job_unique_key)
            .bind(entry.job_id)
            .bind(&entry.job_title)
            .bind(&entry.job_company)
            .bind(&entry.job_source)
            .bind(&entry.matched_keywords)
            .bind(entry.sent_at)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(RecordOutcome::Accepted(entry_from_row(&row)?)),
            None => {
                debug!(user_id = %entry.user_id, job_id = entry.job_id, "history conflict, already notified");
                Ok(RecordOutcome::AlreadyNotified)
            }
        }
    }

    async fn pending_entries(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationHistoryEntry>, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM notification_history \
             WHERE user_id = $1 AND push_state = 'pending' \
             ORDER BY sent_at ASC, job_id ASC"
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        entries_from_rows(&rows)
    }

    async fn users_with_pending_entries(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT user_id
              FROM notification_history
             WHERE push_state = 'pending'
             ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("user_id").map_err(StoreError::from))
            .collect()
    }

    async fn mark_suppressed(
        &self,
        entry_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE notification_history
               SET push_state = 'suppressed', updated_at = $2
             WHERE id = ANY($1) AND push_state = 'pending'
            "#,
        )
        .bind(entry_ids)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_group(&self, group: &NotificationGroup) -> Result<(), StoreError> {
        let ids = group.entry_ids();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notification_groups
                (id, run_id, user_id, hour_bucket, matched_keywords, job_count, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(group.id)
        .bind(group.run_id)
        .bind(&group.user_id)
        .bind(group.hour_bucket)
        .bind(&group.matched_keywords)
        .bind(group.job_count as i32)
        .bind(group.created_at)
        .execute(&mut *tx)
        .await?;

        let claimed = sqlx::query(
            r#"
            UPDATE notification_history
               SET push_state = 'pushed', group_id = $1, updated_at = $2
             WHERE id = ANY($3) AND user_id = $4 AND push_state = 'pending'
            "#,
        )
        .bind(group.id)
        .bind(group.created_at)
        .bind(&ids)
        .bind(&group.user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed != ids.len() as u64 {
            tx.rollback().await?;
            return Err(StoreError::GroupConflict {
                group_id: group.id,
                claimed,
                expected: ids.len() as u64,
            });
        }

        tx.commit().await?;
        Ok(())
    }

    async fn pushed_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT h.user_id, g.created_at
              FROM notification_history h
              JOIN notification_groups g ON g.id = h.group_id
             WHERE g.created_at >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(String, DateTime<Utc>), StoreError> {
                Ok((row.try_get("user_id")?, row.try_get("created_at")?))
            })
            .collect()
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notification_history WHERE user_id = $1 AND NOT is_read",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn save_delivery(&self, record: &PushDeliveryRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO push_deliveries
                (notification_group_id, device_token, status, attempts, attempted_at, error)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (notification_group_id, device_token) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                attempted_at = EXCLUDED.attempted_at,
                error = EXCLUDED.error
            "#,
        )
        .bind(record.notification_group_id)
        .bind(&record.device_token)
        .bind(record.status.as_str())
        .bind(record.attempts as i32)
        .bind(record.attempted_at)
        .bind(&record.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_watermark(&self, reader: &str) -> Result<Option<Watermark>, StoreError> {
        let row = sqlx::query(
            "SELECT reader, last_posting_id, updated_at FROM engine_watermarks WHERE reader = $1",
        )
        .bind(reader)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<Watermark, StoreError> {
            Ok(Watermark {
                reader: row.try_get("reader")?,
                last_posting_id: row.try_get("last_posting_id")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn advance_watermark(
        &self,
        reader: &str,
        last_posting_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO engine_watermarks (reader, last_posting_id, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (reader) DO UPDATE SET
                last_posting_id = GREATEST(engine_watermarks.last_posting_id, EXCLUDED.last_posting_id),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(reader)
        .bind(last_posting_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_entries(
        &self,
        user_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<InboxPage, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM notification_history \
             WHERE user_id = $1 \
             ORDER BY sent_at DESC, job_id DESC \
             LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        let counts = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_count,
                   COUNT(*) FILTER (WHERE NOT is_read) AS unread_count
              FROM notification_history
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        let total_count: i64 = counts.try_get("total_count")?;
        let unread_count: i64 = counts.try_get("unread_count")?;

        Ok(InboxPage {
            notifications: entries_from_rows(&rows)?,
            unread_count: unread_count.max(0) as u64,
            total_count: total_count.max(0) as u64,
        })
    }

    async fn mark_read(
        &self,
        entry_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<NotificationHistoryEntry>, StoreError> {
        let sql = format!(
            "UPDATE notification_history SET is_read = TRUE, updated_at = $2 \
             WHERE id = $1 RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(entry_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn delete_entry(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM notification_history WHERE id = $1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn group_entries_for(
        &self,
        entry_id: Uuid,
    ) -> Result<Option<Vec<NotificationHistoryEntry>>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM notification_history WHERE id = $1");
        let Some(row) = sqlx::query(&sql)
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let entry = entry_from_row(&row)?;
        let Some(group_id) = entry.group_id else {
            return Ok(Some(vec![entry]));
        };

        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM notification_history \
             WHERE group_id = $1 ORDER BY sent_at ASC, job_id ASC"
        );
        let rows = sqlx::query(&sql).bind(group_id).fetch_all(&self.pool).await?;
        Ok(Some(entries_from_rows(&rows)?))
    }
}
