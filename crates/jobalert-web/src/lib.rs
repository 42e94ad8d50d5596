//! Axum inbox API over the notification history.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use jobalert_core::NotificationHistoryEntry;
use jobalert_engine::EngineConfig;
use jobalert_storage::{connect, NotificationStore, PgNotificationStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobalert-web";

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn NotificationStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Deserialize, Default)]
struct InboxQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Serialize)]
struct GroupJobs {
    jobs: Vec<NotificationHistoryEntry>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/notifications/{device_id}", get(inbox_handler))
        .route("/notification/{id}", delete(delete_handler))
        .route("/notification/{id}/read", post(mark_read_handler))
        .route("/notification/{id}/jobs", get(group_jobs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: Arc<dyn NotificationStore>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "inbox api listening");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

/// Serves the Postgres-backed inbox on the configured port.
pub async fn serve_with_config(config: &EngineConfig) -> anyhow::Result<()> {
    let pool = connect(&config.database_url, 5)
        .await
        .context("connecting to the notification database")?;
    serve(Arc::new(PgNotificationStore::new(pool)), config.web_port).await
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn inbox_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Query(query): Query<InboxQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    match state.store.list_entries(&device_id, limit, offset).await {
        Ok(page) => Json(page).into_response(),
        Err(err) => store_error(err),
    }
}

async fn mark_read_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_id(&id) else {
        return not_found();
    };
    match state.store.mark_read(id, Utc::now()).await {
        Ok(Some(entry)) => Json(entry).into_response(),
        Ok(None) => not_found(),
        Err(err) => store_error(err),
    }
}

async fn delete_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_id(&id) else {
        return not_found();
    };
    match state.store.delete_entry(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found(),
        Err(err) => store_error(err),
    }
}

async fn group_jobs_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Some(id) = parse_id(&id) else {
        return not_found();
    };
    match state.store.group_entries_for(id).await {
        Ok(Some(jobs)) => Json(GroupJobs { jobs }).into_response(),
        Ok(None) => not_found(),
        Err(err) => store_error(err),
    }
}

fn parse_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "notification not found" })),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "inbox request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}
