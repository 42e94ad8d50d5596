use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use jobalert_adapters::{JobSource, PushGateway, SubscriptionDirectory};
use jobalert_core::{DeliveryStatus, Device, JobMatch, NewHistoryEntry, RecordOutcome};
use jobalert_storage::NotificationStore;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dispatcher::PushDispatcher;
use crate::gate::{Admission, NotificationGate, RateCounterStore};
use crate::grouper::build_group;
use crate::matcher::KeywordMatcher;
use crate::reader::{JobSourceReader, READER_NAME};
use crate::EngineError;

/// External collaborators of one pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub source: Arc<dyn JobSource>,
    pub directory: Arc<dyn SubscriptionDirectory>,
    pub store: Arc<dyn NotificationStore>,
    pub gateway: Arc<dyn PushGateway>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub postings_read: usize,
    pub matches: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub deferred: usize,
    pub suppressed: usize,
    pub groups: usize,
    pub delivered: usize,
    pub delivery_failures: usize,
    pub failed_users: usize,
    pub watermark: Option<i64>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            postings_read: 0,
            matches: 0,
            accepted: 0,
            duplicates: 0,
            deferred: 0,
            suppressed: 0,
            groups: 0,
            delivered: 0,
            delivery_failures: 0,
            failed_users: 0,
            watermark: None,
        }
    }

    fn absorb(&mut self, user: &UserOutcome) {
        self.matches += user.matches;
        self.accepted += user.accepted;
        self.duplicates += user.duplicates;
        self.deferred += user.deferred;
        self.suppressed += user.suppressed;
        self.groups += user.groups;
        self.delivered += user.delivered;
        self.delivery_failures += user.delivery_failures;
    }
}

#[derive(Debug, Default)]
struct UserOutcome {
    matches: usize,
    accepted: usize,
    duplicates: usize,
    deferred: usize,
    suppressed: usize,
    groups: usize,
    delivered: usize,
    delivery_failures: usize,
}

pub struct Pipeline {
    store: Arc<dyn NotificationStore>,
    directory: Arc<dyn SubscriptionDirectory>,
    reader: JobSourceReader,
    gate: NotificationGate,
    dispatcher: PushDispatcher,
    source_timeout: Duration,
    max_parallel_users: usize,
    max_watermark_holds: u32,
    /// Consecutive runs that ended with the watermark held back.
    held_runs: AtomicU32,
}

impl Pipeline {
    pub fn new(config: &EngineConfig, deps: PipelineDeps, counters: Arc<RateCounterStore>) -> Self {
        let reader = JobSourceReader::new(
            deps.source,
            config.batch_size,
            config.max_postings_per_run,
            config.source_timeout(),
        );
        let gate = NotificationGate::new(
            config.rate_limits(),
            config.quiet_hours,
            config.default_utc_offset_minutes,
            counters,
        );
        let dispatcher = PushDispatcher::new(
            deps.gateway,
            deps.directory.clone(),
            deps.store.clone(),
            config.backoff(),
            config.push_timeout(),
            config.deep_link_base.clone(),
        );
        Self {
            store: deps.store,
            directory: deps.directory,
            reader,
            gate,
            dispatcher,
            source_timeout: config.source_timeout(),
            max_parallel_users: config.max_parallel_users.max(1),
            max_watermark_holds: config.max_watermark_holds,
            held_runs: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub async fn run_once(&self) -> Result<RunSummary, EngineError> {
        self.run_at(Utc::now()).await
    }

    /// One full pass: read, match, record, gate, group, dispatch, advance the watermark.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunSummary, EngineError> {
        let run_id = Uuid::new_v4();
        self.execute(run_id, now)
            .instrument(info_span!("pipeline_run", %run_id))
            .await
    }

    async fn execute(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<RunSummary, EngineError> {
        let mut summary = RunSummary::new(run_id, now);

        let watermark = self.store.load_watermark(READER_NAME).await?;
        let postings = self
            .reader
            .fetch_unprocessed_postings(watermark.as_ref())
            .await?;
        summary.postings_read = postings.len();

        let subscriptions = self
            .with_source_timeout("subscription directory", self.directory.active_subscriptions())
            .await?;
        let matcher = KeywordMatcher::new(&subscriptions);

        let mut matches_by_user: BTreeMap<String, Vec<JobMatch>> = BTreeMap::new();
        if !matcher.is_empty() {
            for posting in &postings {
                for m in matcher.match_posting(posting, now) {
                    matches_by_user.entry(m.device_id.clone()).or_default().push(m);
                }
            }
        }

        let mut users: BTreeSet<String> = matches_by_user.keys().cloned().collect();
        users.extend(self.store.users_with_pending_entries().await?);
        let user_ids: Vec<String> = users.into_iter().collect();

        let devices: HashMap<String, Device> = if user_ids.is_empty() {
            HashMap::new()
        } else {
            self.with_source_timeout("device lookup", self.directory.devices(&user_ids))
                .await?
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect()
        };

        let work: Vec<(String, Vec<JobMatch>, Option<Device>)> = user_ids
            .into_iter()
            .map(|user_id| {
                let matches = matches_by_user.remove(&user_id).unwrap_or_default();
                let device = devices.get(&user_id).cloned();
                (user_id, matches, device)
            })
            .collect();

        let results: Vec<(String, Result<UserOutcome, EngineError>)> = stream::iter(work)
            .map(|(user_id, matches, device)| async move {
                let outcome = self
                    .process_user(run_id, &user_id, matches, device, now)
                    .instrument(info_span!("user", %user_id))
                    .await;
                (user_id, outcome)
            })
            .buffer_unordered(self.max_parallel_users)
            .collect()
            .await;

        let mut failed: Vec<&str> = Vec::new();
        for (user_id, result) in &results {
            match result {
                Ok(outcome) => summary.absorb(outcome),
                Err(err) => {
                    failed.push(user_id.as_str());
                    warn!(%user_id, error = %err, "user processing failed; will retry next run");
                }
            }
        }
        summary.failed_users = failed.len();

        summary.watermark = watermark.map(|w| w.last_posting_id);
        match postings.last() {
            Some(last) if self.should_advance(&failed, last.id) => {
                self.store.advance_watermark(READER_NAME, last.id, now).await?;
                self.held_runs.store(0, Ordering::SeqCst);
                summary.watermark = Some(last.id);
            }
            Some(_) => {}
            None => self.held_runs.store(0, Ordering::SeqCst),
        }

        summary.finished_at = Utc::now().max(now);
        info!(
            postings = summary.postings_read,
            matches = summary.matches,
            accepted = summary.accepted,
            duplicates = summary.duplicates,
            deferred = summary.deferred,
            suppressed = summary.suppressed,
            groups = summary.groups,
            delivered = summary.delivered,
            delivery_failures = summary.delivery_failures,
            failed_users = summary.failed_users,
            "pipeline run finished"
        );
        Ok(summary)
    }

    /// Failing users hold the watermark back for at most `max_watermark_holds` consecutive
    /// runs; after that the window is passed over with a warning.
    fn should_advance(&self, failed: &[&str], last_posting_id: i64) -> bool {
        if failed.is_empty() {
            return true;
        }
        let held = self.held_runs.load(Ordering::SeqCst);
        if held < self.max_watermark_holds {
            self.held_runs.store(held + 1, Ordering::SeqCst);
            warn!(
                failed_users = failed.len(),
                held_runs = held + 1,
                "watermark held back; postings will be reprocessed"
            );
            return false;
        }
        warn!(
            failed_users = ?failed,
            held_runs = held,
            last_posting_id,
            "watermark advanced past failing users; their matches in this window are dropped"
        );
        true
    }

    async fn process_user(
        &self,
        run_id: Uuid,
        user_id: &str,
        matches: Vec<JobMatch>,
        device: Option<Device>,
        now: DateTime<Utc>,
    ) -> Result<UserOutcome, EngineError> {
        let mut outcome = UserOutcome {
            matches: matches.len(),
            ..Default::default()
        };

        for m in &matches {
            match self.store.record_if_new(NewHistoryEntry::from_match(m)).await? {
                RecordOutcome::Accepted(_) => outcome.accepted += 1,
                RecordOutcome::AlreadyNotified => {
                    outcome.duplicates += 1;
                    debug!(job_id = m.job_id, "already notified");
                }
            }
        }

        let pending = self.store.pending_entries(user_id).await?;
        if pending.is_empty() {
            return Ok(outcome);
        }

        let device = match device {
            Some(device) if device.is_active => device,
            _ => {
                let ids: Vec<Uuid> = pending.iter().map(|e| e.id).collect();
                self.store.mark_suppressed(&ids, now).await?;
                outcome.suppressed += ids.len();
                info!(entries = ids.len(), "no active device; pending entries suppressed");
                return Ok(outcome);
            }
        };

        let mut admitted = Vec::new();
        let mut dropped = Vec::new();
        for entry in pending {
            match self.gate.admit(&device, now) {
                Admission::Admit => admitted.push(entry),
                Admission::Defer => outcome.deferred += 1,
                Admission::Drop => dropped.push(entry.id),
            }
        }
        if outcome.deferred > 0 {
            debug!(deferred = outcome.deferred, "quiet hours; entries stay pending");
        }
        if !dropped.is_empty() {
            self.store.mark_suppressed(&dropped, now).await?;
            outcome.suppressed += dropped.len();
            info!(entries = dropped.len(), "rate limit reached; entries suppressed");
        }

        let Some(group) = build_group(run_id, user_id, admitted, now) else {
            return Ok(outcome);
        };
        self.store.create_group(&group).await?;
        outcome.groups += 1;

        let record = self.dispatcher.dispatch(&group, &device).await?;
        match record.status {
            DeliveryStatus::Delivered => outcome.delivered += 1,
            _ => outcome.delivery_failures += 1,
        }
        Ok(outcome)
    }

    async fn with_source_timeout<T, E: std::fmt::Display>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<T, EngineError> {
        tokio::time::timeout(self.source_timeout, fut)
            .await
            .map_err(|_| {
                EngineError::SourceUnavailable(format!(
                    "{what} timed out after {:?}",
                    self.source_timeout
                ))
            })?
            .map_err(|err| EngineError::SourceUnavailable(format!("{what}: {err}")))
    }
}
