//! Axum JSON API for itlog: sync trigger, import, ticket list, dashboard summary.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use itlog_core::{classify_tickets, summarize, ReportingWindow, TicketQuery};
use itlog_storage::TicketStore;
use itlog_sync::{
    clear_all, import_tickets, maybe_build_scheduler, ImportReport, SyncConfig, SyncError,
    SyncOrchestrator, SyncResponse, SyncTrigger,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "itlog-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TicketStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(store: Arc<dyn TicketStore>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { store, orchestrator }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WindowParams {
    year: Option<i32>,
    #[serde(default)]
    all: bool,
}

impl WindowParams {
    fn window(&self) -> ReportingWindow {
        match (self.all, self.year) {
            (true, _) => ReportingWindow::AllTime,
            (false, Some(year)) => ReportingWindow::Year(year),
            (false, None) => ReportingWindow::current_year(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    success: bool,
    #[serde(flatten)]
    report: ImportReport,
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    success: bool,
    removed: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    running: bool,
    last_synced_at: Option<DateTime<Utc>>,
    ticket_count: u64,
    sources: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", post(sync_handler))
        .route("/api/import", post(import_handler))
        .route("/api/tickets", get(tickets_handler).delete(clear_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let store = config.open_store().await?;
    let orchestrator = Arc::new(itlog_sync::build_orchestrator(&config, store.clone()).await?);

    let scheduler = maybe_build_scheduler(&config, orchestrator.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "scheduled sync enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving itlog api");
    axum::serve(listener, app(AppState::new(store, orchestrator))).await?;
    Ok(())
}

async fn sync_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.run(SyncTrigger::Manual).await {
        Ok(summary) => Json(SyncResponse::completed(&summary)).into_response(),
        Err(err @ SyncError::AlreadyRunning) => {
            (StatusCode::CONFLICT, Json(SyncResponse::failed(err.to_string()))).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn import_handler(State(state): State<Arc<AppState>>, Json(body): Json<JsonValue>) -> Response {
    let JsonValue::Array(records) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(SyncResponse::failed("import body must be a JSON array")),
        )
            .into_response();
    };
    let report = import_tickets(state.store.as_ref(), records).await;
    Json(ImportResponse {
        success: true,
        report,
    })
    .into_response()
}

async fn clear_handler(State(state): State<Arc<AppState>>) -> Response {
    match clear_all(state.store.as_ref()).await {
        Ok(removed) => Json(ClearResponse {
            success: true,
            removed,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn tickets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TicketQuery>,
) -> Response {
    match state.store.list().await {
        Ok(tickets) => {
            let matching = query.apply(&tickets).into_iter().cloned();
            Json(classify_tickets(matching)).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(window): Query<WindowParams>,
    Query(query): Query<TicketQuery>,
) -> Response {
    // limit applies to listings only
    let query = TicketQuery { limit: None, ..query };
    match state.store.list().await {
        Ok(tickets) => Json(summarize(query.apply(&tickets), window.window())).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.count().await {
        Ok(ticket_count) => Json(StatusResponse {
            running: state.orchestrator.is_running(),
            last_synced_at: state.orchestrator.last_synced_at().await,
            ticket_count,
            sources: state
                .orchestrator
                .source_ids()
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(SyncResponse::failed(format!("Server error: {err}"))),
    )
        .into_response()
}
