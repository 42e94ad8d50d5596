use async_trait::async_trait;
use jobalert_core::{Device, JobPosting, KeywordSubscription, QuietHours};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::info;

use crate::{JobSource, SourceError, SubscriptionDirectory};

/// Reads the scraper's `jobs` table.
#[derive(Debug, Clone)]
pub struct PgJobSource {
    pool: PgPool,
}

impl PgJobSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn posting_from_row(row: &PgRow) -> Result<JobPosting, sqlx::Error> {
    Ok(JobPosting {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        source: row.try_get("source")?,
        posted_at: row.try_get("posted_at")?,
    })
}

#[async_trait]
impl JobSource for PgJobSource {
    async fn postings_since(
        &self,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<JobPosting>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, company, location, source, posted_at
              FROM jobs
             WHERE id > $1
             ORDER BY id ASC
             LIMIT $2
            "#,
        )
        .bind(after_id.unwrap_or(i64::MIN))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(posting_from_row(row)?);
        }
        Ok(out)
    }
}

/// Reads the API service's `devices` and `keywords` tables.
#[derive(Debug, Clone)]
pub struct PgSubscriptionDirectory {
    pool: PgPool,
}

impl PgSubscriptionDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn device_from_row(row: &PgRow) -> Result<Device, sqlx::Error> {
    let quiet_start: Option<i16> = row.try_get("quiet_hours_start")?;
    let quiet_end: Option<i16> = row.try_get("quiet_hours_end")?;
    let quiet_hours = match (quiet_start, quiet_end) {
        (Some(start), Some(end)) => u8::try_from(start)
            .ok()
            .zip(u8::try_from(end).ok())
            .and_then(|(start, end)| QuietHours::new(start, end)),
        _ => None,
    };
    Ok(Device {
        id: row.try_get("id")?,
        device_token: row.try_get("device_token")?,
        is_active: row.try_get("is_active")?,
        utc_offset_minutes: row.try_get("utc_offset_minutes")?,
        quiet_hours,
    })
}

#[async_trait]
impl SubscriptionDirectory for PgSubscriptionDirectory {
    async fn active_subscriptions(&self) -> Result<Vec<KeywordSubscription>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT k.id, k.device_id, k.keyword, k.is_active
              FROM keywords k
              JOIN devices d ON d.id = k.device_id
             WHERE k.is_active AND d.is_active
             ORDER BY k.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(KeywordSubscription {
                id: row.try_get("id")?,
                device_id: row.try_get("device_id")?,
                keyword: row.try_get("keyword")?,
                is_active: row.try_get("is_active")?,
            });
        }
        Ok(out)
    }

    async fn devices(&self, device_ids: &[String]) -> Result<Vec<Device>, SourceError> {
        if device_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, device_token, is_active, utc_offset_minutes,
                   quiet_hours_start, quiet_hours_end
              FROM devices
             WHERE id = ANY($1)
            "#,
        )
        .bind(device_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(device_from_row(row)?);
        }
        Ok(out)
    }

    async fn deactivate_device_token(&self, device_token: &str) -> Result<(), SourceError> {
        let affected = sqlx::query("UPDATE devices SET is_active = FALSE WHERE device_token = $1")
            .bind(device_token)
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(affected, "deactivated device token after gateway rejection");
        Ok(())
    }
}
