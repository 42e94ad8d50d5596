use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobalert_engine::{build_fixture_runtime, build_runtime, EngineConfig, EngineRuntime, Scheduler};
use jobalert_storage::{connect, run_migrations};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobalert")]
#[command(about = "Job alert match-and-notify engine")]
struct Cli {
    /// YAML config file; overrides environment values it names.
    #[arg(long, global = true, env = "JOBALERT_CONFIG")]
    config: Option<PathBuf>,

    /// Dry run: read `jobs.json` and `directory.json` from this directory, keep state in
    /// memory and record pushes instead of sending them.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline on its interval until Ctrl-C.
    Run,
    /// Run the pipeline once and print the summary.
    Once,
    /// Apply database migrations.
    Migrate,
    /// Serve the inbox API.
    Serve,
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env();
    if let Some(path) = path {
        config.apply_yaml_file(path)?;
    }
    Ok(config)
}

async fn runtime(config: &EngineConfig, fixtures: Option<&Path>) -> Result<EngineRuntime> {
    match fixtures {
        Some(dir) => build_fixture_runtime(config, dir).await,
        None => build_runtime(config).await,
    }
}

async fn report_recorded_pushes(runtime: &EngineRuntime) {
    if let Some(recorder) = &runtime.recorder {
        for push in recorder.sent().await {
            println!(
                "would push to {}: {} | {} | {}",
                push.device_token,
                push.payload.aps.alert.title,
                push.payload.aps.alert.subtitle,
                push.payload.aps.alert.body
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .context("installing tracing subscriber")?;

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let fixtures = cli.fixtures.as_deref();

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Run => {
            let runtime = runtime(&config, fixtures).await?;
            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("ctrl-c received, finishing current run");
                        signal_token.cancel();
                    }
                    Err(err) => warn!(error = %err, "cannot listen for ctrl-c"),
                }
            });

            let scheduler = Scheduler::new(runtime.pipeline.clone(), config.interval(), shutdown);
            let stats = scheduler.start().await;
            println!(
                "scheduler stopped: runs_started={} ticks_skipped={}",
                stats.runs_started, stats.ticks_skipped
            );
            report_recorded_pushes(&runtime).await;
        }
        Commands::Once => {
            let runtime = runtime(&config, fixtures).await?;
            let summary = runtime.pipeline.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            report_recorded_pushes(&runtime).await;
        }
        Commands::Migrate => {
            let pool = connect(&config.database_url, 1)
                .await
                .context("connecting to the notification database")?;
            run_migrations(&pool).await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => match fixtures {
            Some(dir) => {
                let runtime = build_fixture_runtime(&config, dir).await?;
                let summary = runtime.pipeline.run_once().await?;
                info!(groups = summary.groups, "seeded in-memory inbox from fixtures");
                jobalert_web::serve(Arc::clone(&runtime.store), config.web_port).await?;
            }
            None => jobalert_web::serve_with_config(&config).await?,
        },
    }

    Ok(())
}
