use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::agent::{inventory, ExecutionCoordinator, LogChunk, RunRecord, StopAck};
use crate::api::{cors, ApiResult, Envelope, StartRunRequest};
use crate::config::AgentConfig;
use crate::fleet::{AgentDescriptor, PortDescriptor, TestCaseDescriptor};

const DEFAULT_LOG_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct AgentState {
    pub coordinator: Arc<ExecutionCoordinator>,
    pub config: Arc<AgentConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub after: u64,
    pub limit: Option<usize>,
}

pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/info", get(info_handler))
        .route("/api/ports", get(ports_handler))
        .route("/api/cases", get(cases_handler))
        .route("/api/runs", get(list_runs_handler).post(start_run_handler))
        .route("/api/runs/:run_id", get(run_status_handler))
        .route("/api/runs/:run_id/logs", get(run_logs_handler))
        .route("/api/runs/:run_id/stop", post(stop_run_handler))
        .layer(cors())
        .with_state(state)
}

async fn health_handler() -> Json<Envelope<&'static str>> {
    Json(Envelope::ok("ok"))
}

async fn info_handler(State(state): State<AgentState>) -> ApiResult<AgentDescriptor> {
    let runs = state.coordinator.list_runs().await;
    let running = runs.iter().filter(|r| !r.state.is_terminal()).count();
    Ok(Json(Envelope::ok(inventory::host_info(
        state.config.location.as_deref(),
        running,
        runs.len(),
    ))))
}

async fn ports_handler(State(state): State<AgentState>) -> ApiResult<Vec<PortDescriptor>> {
    let ports = inventory::list_ports(&state.config.execution, Path::new("/dev"));
    Ok(Json(Envelope::ok(ports)))
}

async fn cases_handler(State(state): State<AgentState>) -> ApiResult<Vec<TestCaseDescriptor>> {
    Ok(Json(Envelope::ok(state.coordinator.resolver().list())))
}

async fn start_run_handler(
    State(state): State<AgentState>,
    Json(req): Json<StartRunRequest>,
) -> ApiResult<RunRecord> {
    let record = state.coordinator.start(&req.test_case, &req.port).await?;
    Ok(Json(Envelope::ok_with_message(record, "测试已开始执行")))
}

async fn list_runs_handler(State(state): State<AgentState>) -> ApiResult<Vec<RunRecord>> {
    Ok(Json(Envelope::ok(state.coordinator.list_runs().await)))
}

async fn run_status_handler(
    State(state): State<AgentState>,
    UrlPath(run_id): UrlPath<String>,
) -> ApiResult<RunRecord> {
    Ok(Json(Envelope::ok(state.coordinator.status(&run_id).await?)))
}

async fn run_logs_handler(
    State(state): State<AgentState>,
    UrlPath(run_id): UrlPath<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<LogChunk> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Ok(Json(Envelope::ok(
        state.coordinator.logs(&run_id, query.after, limit).await?,
    )))
}

async fn stop_run_handler(
    State(state): State<AgentState>,
    UrlPath(run_id): UrlPath<String>,
) -> ApiResult<StopAck> {
    let ack = state.coordinator.request_stop(&run_id).await?;
    let message = ack.message.clone();
    Ok(Json(Envelope::ok_with_message(ack, message)))
}
