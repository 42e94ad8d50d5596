use std::sync::Arc;
use std::time::Duration;

use jobalert_adapters::JobSource;
use jobalert_core::{JobPosting, Watermark};
use tracing::debug;

use crate::EngineError;

/// Name under which the reader's watermark is persisted.
pub const READER_NAME: &str = "job_source";

pub struct JobSourceReader {
    source: Arc<dyn JobSource>,
    batch_size: usize,
    max_postings: usize,
    timeout: Duration,
}

impl JobSourceReader {
    pub fn new(
        source: Arc<dyn JobSource>,
        batch_size: usize,
        max_postings: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
            max_postings,
            timeout,
        }
    }

    pub fn cursor(&self, watermark: Option<&Watermark>) -> PostingCursor<'_> {
        PostingCursor {
            reader: self,
            after_id: watermark.map(|w| w.last_posting_id),
            fetched: 0,
            exhausted: false,
        }
    }

    /// Every posting past the watermark, ascending by id, up to the per-run cap.
    pub async fn fetch_unprocessed_postings(
        &self,
        watermark: Option<&Watermark>,
    ) -> Result<Vec<JobPosting>, EngineError> {
        let mut cursor = self.cursor(watermark);
        let mut postings = Vec::new();
        while let Some(batch) = cursor.next_batch().await? {
            postings.extend(batch);
        }
        Ok(postings)
    }
}

/// Pages through the source lazily. Finite: stops at a short page or at the cap.
pub struct PostingCursor<'a> {
    reader: &'a JobSourceReader,
    after_id: Option<i64>,
    fetched: usize,
    exhausted: bool,
}

impl PostingCursor<'_> {
    pub fn last_id(&self) -> Option<i64> {
        self.after_id
    }

    pub async fn next_batch(&mut self) -> Result<Option<Vec<JobPosting>>, EngineError> {
        let remaining = self.reader.max_postings.saturating_sub(self.fetched);
        if self.exhausted || remaining == 0 {
            return Ok(None);
        }
        let limit = remaining.min(self.reader.batch_size);

        let page = tokio::time::timeout(
            self.reader.timeout,
            self.reader.source.postings_since(self.after_id, limit),
        )
        .await
        .map_err(|_| {
            EngineError::SourceUnavailable(format!(
                "job source timed out after {:?}",
                self.reader.timeout
            ))
        })?
        .map_err(|err| EngineError::SourceUnavailable(err.to_string()))?;

        if page.len() < limit {
            self.exhausted = true;
        }

        let mut page: Vec<JobPosting> = page
            .into_iter()
            .filter(|p| self.after_id.map_or(true, |after| p.id > after))
            .collect();
        page.sort_by_key(|p| p.id);
        page.truncate(limit);

        let Some(last) = page.last() else {
            self.exhausted = true;
            return Ok(None);
        };
        self.after_id = Some(last.id);
        self.fetched += page.len();
        debug!(count = page.len(), last_id = last.id, "read posting page");
        Ok(Some(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use jobalert_adapters::{FixtureJobSource, SourceError};

    fn postings(ids: impl IntoIterator<Item = i64>) -> Vec<JobPosting> {
        ids.into_iter()
            .map(|id| JobPosting {
                id,
                title: format!("Job {id}"),
                company: "Acme".into(),
                location: None,
                source: "indeed".into(),
                posted_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
            })
            .collect()
    }

    fn watermark(id: i64) -> Watermark {
        Watermark {
            reader: READER_NAME.into(),
            last_posting_id: id,
            updated_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn reads_past_the_watermark_page_by_page() {
        let source = Arc::new(FixtureJobSource::new(postings(1..=7)));
        let reader = JobSourceReader::new(source, 2, 100, Duration::from_secs(1));

        let mut cursor = reader.cursor(Some(&watermark(2)));
        let mut pages = Vec::new();
        while let Some(page) = cursor.next_batch().await.unwrap() {
            pages.push(page.iter().map(|p| p.id).collect::<Vec<_>>());
        }
        assert_eq!(pages, vec![vec![3, 4], vec![5, 6], vec![7]]);
        assert_eq!(cursor.last_id(), Some(7));
    }

    #[tokio::test]
    async fn stops_at_the_per_run_cap() {
        let source = Arc::new(FixtureJobSource::new(postings(1..=10)));
        let reader = JobSourceReader::new(source, 3, 4, Duration::from_secs(1));
        let ids: Vec<i64> = reader
            .fetch_unprocessed_postings(None)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    struct StalledSource;

    #[async_trait]
    impl JobSource for StalledSource {
        async fn postings_since(
            &self,
            _after_id: Option<i64>,
            _limit: usize,
        ) -> Result<Vec<JobPosting>, SourceError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl JobSource for BrokenSource {
        async fn postings_since(
            &self,
            _after_id: Option<i64>,
            _limit: usize,
        ) -> Result<Vec<JobPosting>, SourceError> {
            Err(SourceError::Anyhow(anyhow::anyhow!("connection refused")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_surfaces_as_unavailable() {
        let reader = JobSourceReader::new(Arc::new(StalledSource), 10, 10, Duration::from_secs(5));
        let err = reader.fetch_unprocessed_postings(None).await.unwrap_err();
        assert!(matches!(err, EngineError::SourceUnavailable(_)));
    }

    #[tokio::test]
    async fn failing_source_surfaces_as_unavailable() {
        let reader = JobSourceReader::new(Arc::new(BrokenSource), 10, 10, Duration::from_secs(5));
        let err = reader.fetch_unprocessed_postings(None).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
