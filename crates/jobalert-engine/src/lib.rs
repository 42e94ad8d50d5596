//! The match-and-notify pipeline and its periodic driver.

pub mod config;
pub mod dispatcher;
mod error;
pub mod gate;
pub mod grouper;
pub mod matcher;
pub mod pipeline;
pub mod reader;
pub mod scheduler;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use jobalert_adapters::{
    FixtureDirectory, FixtureJobSource, HttpPushGateway, PgJobSource, PgSubscriptionDirectory,
    RecordingPushGateway,
};
use jobalert_storage::{
    connect, run_migrations, MemoryNotificationStore, NotificationStore, PgNotificationStore,
};
use tracing::info;

pub use config::{EngineConfig, PushSettings};
pub use dispatcher::{build_payload, PushDispatcher};
pub use error::EngineError;
pub use gate::{Admission, NotificationGate, RateCounterStore, RateLimits};
pub use grouper::build_group;
pub use matcher::{match_posting, KeywordMatcher};
pub use pipeline::{Pipeline, PipelineDeps, RunSummary};
pub use reader::{JobSourceReader, PostingCursor, READER_NAME};
pub use scheduler::{PipelineRunner, Scheduler, SchedulerStats};

pub const CRATE_NAME: &str = "jobalert-engine";

const POOL_SIZE: u32 = 10;

/// A wired pipeline plus the handles callers need around it.
pub struct EngineRuntime {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<dyn NotificationStore>,
    /// Present in dry-run mode so callers can report what would have been pushed.
    pub recorder: Option<Arc<RecordingPushGateway>>,
}

/// Postgres store and collaborators, HTTP gateway. Applies migrations first.
pub async fn build_runtime(config: &EngineConfig) -> Result<EngineRuntime> {
    let pool = connect(&config.database_url, POOL_SIZE)
        .await
        .context("connecting to the notification database")?;
    run_migrations(&pool).await.context("applying migrations")?;

    let jobs_pool = match &config.jobs_database_url {
        Some(url) => connect(url, POOL_SIZE)
            .await
            .context("connecting to the jobs database")?,
        None => pool.clone(),
    };

    let store: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(pool.clone()));
    let gateway = HttpPushGateway::new(config.gateway_config())?;
    let deps = PipelineDeps {
        source: Arc::new(PgJobSource::new(jobs_pool)),
        directory: Arc::new(PgSubscriptionDirectory::new(pool)),
        store: store.clone(),
        gateway: Arc::new(gateway),
    };
    assemble(config, deps, None).await
}

/// Dry run over `jobs.json` and `directory.json` in `dir`, with an in-memory store and a
/// recording gateway.
pub async fn build_fixture_runtime(config: &EngineConfig, dir: &Path) -> Result<EngineRuntime> {
    let source = FixtureJobSource::from_file(dir.join("jobs.json"))?;
    let directory = FixtureDirectory::from_file(dir.join("directory.json"))?;
    let recorder = Arc::new(RecordingPushGateway::new());
    let store: Arc<dyn NotificationStore> = Arc::new(MemoryNotificationStore::new());
    let deps = PipelineDeps {
        source: Arc::new(source),
        directory: Arc::new(directory),
        store,
        gateway: recorder.clone(),
    };
    assemble(config, deps, Some(recorder)).await
}

async fn assemble(
    config: &EngineConfig,
    deps: PipelineDeps,
    recorder: Option<Arc<RecordingPushGateway>>,
) -> Result<EngineRuntime> {
    let store = deps.store.clone();
    let counters = Arc::new(
        RateCounterStore::rebuild(store.as_ref(), Utc::now())
            .await
            .context("rebuilding rate counters")?,
    );
    let pipeline = Arc::new(Pipeline::new(config, deps, counters));
    info!(
        hourly_limit = config.hourly_limit,
        daily_limit = config.daily_limit,
        workers = config.max_parallel_users,
        "engine assembled"
    );
    Ok(EngineRuntime {
        pipeline,
        store,
        recorder,
    })
}
