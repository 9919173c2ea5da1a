//! HTTP surface: batch trigger, single-target preview, health.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use jobwatch_sync::{BatchError, DryRunError, Monitor, MonitorConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub monitor: Monitor,
    pub cron_secret: Option<String>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(monitor: Monitor, cron_secret: Option<String>, shutdown: CancellationToken) -> Self {
        Self {
            monitor,
            cron_secret,
            shutdown,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct CronQuery {
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckJobsRequest {
    #[serde(rename = "alertId")]
    alert_id: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/cron/check-all-jobs", post(check_all_jobs_handler))
        .route("/api/scrape/check-jobs", post(check_jobs_handler))
        .route("/api/health", get(health_handler))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` is cancelled. Refuses to start without a batch-trigger secret.
pub async fn serve(
    config: &MonitorConfig,
    monitor: Monitor,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let secret = config
        .cron_secret
        .clone()
        .context("CRON_SECRET must be set to serve the batch trigger")?;
    let state = AppState::new(monitor, Some(secret), shutdown.clone());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = MonitorConfig::from_env();
    let monitor = jobwatch_sync::build_monitor(&config).await?;
    let shutdown = CancellationToken::new();

    let scheduler = jobwatch_sync::maybe_build_scheduler(monitor.clone(), &config, shutdown.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduler started");
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        signal.cancel();
    });

    let served = serve(&config, monitor, shutdown).await;
    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    served
}

async fn check_all_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CronQuery>,
) -> Response {
    let authorized = matches!(
        (&state.cron_secret, &query.secret),
        (Some(expected), Some(given)) if expected == given
    );
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response();
    }

    // Run detached so a dropped request cannot abandon a target mid-update.
    let monitor = state.monitor.clone();
    let cancel = state.shutdown.child_token();
    let joined = tokio::spawn(async move { monitor.try_run_batch(&cancel).await }).await;

    match joined {
        Ok(Ok(report)) => Json(json!({
            "success": true,
            "targetsChecked": report.targets_checked,
            "postingsFound": report.postings_found,
            "notificationsSent": report.notifications_sent,
        }))
        .into_response(),
        Ok(Err(BatchError::AlreadyRunning)) => (
            StatusCode::CONFLICT,
            Json(json!({"success": false, "error": BatchError::AlreadyRunning.to_string()})),
        )
            .into_response(),
        Ok(Err(err)) => {
            error!(error = %err, "batch failed");
            server_error(err.to_string())
        }
        Err(err) => {
            error!(error = %err, "batch task aborted");
            server_error(err.to_string())
        }
    }
}

async fn check_jobs_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CheckJobsRequest>,
) -> Response {
    let Ok(target_id) = Uuid::parse_str(request.alert_id.trim()) else {
        return not_found();
    };
    match state.monitor.dry_run(target_id).await {
        Ok(report) => Json(json!({
            "success": true,
            "company": report.company,
            "jobsFound": report.jobs_found,
            "jobs": report.jobs,
        }))
        .into_response(),
        Err(DryRunError::UnknownTarget(_)) => not_found(),
        Err(err) => {
            warn!(%target_id, error = %err, "preview failed");
            server_error(err.to_string())
        }
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "jobwatch API is working",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": "Alert not found"}))).into_response()
}

fn server_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": message})),
    )
        .into_response()
}
