use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::agent::{LogChunk, RunRecord, StopAck};
use crate::api::agent::LogQuery;
use crate::api::{cors, ApiResult, Envelope};
use crate::error::BenchError;
use crate::fleet::{FleetRegistry, MachineRecord};
use crate::lease::{
    AcquireRequest, FleetMachineStatus, Lease, LeaseAck, MachineLeaseManager, MachineLeaseStatus,
};
use crate::orchestrator::{Orchestrator, StartedRun};

#[derive(Clone)]
pub struct CenterState {
    pub leases: Arc<MachineLeaseManager>,
    pub registry: Arc<FleetRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualMachineRequest {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub address: String,
    pub holder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub address: String,
    pub holder_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceReleaseRequest {
    pub address: String,
    pub admin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub holder_id: String,
    #[serde(default)]
    pub holder_name: String,
    pub test_case: String,
    pub port: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub holder_id: String,
}

/// One machine with its lease status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineDetail {
    pub machine: MachineRecord,
    pub lease: MachineLeaseStatus,
}

pub fn router(state: CenterState) -> Router {
    Router::new()
        .route("/api/health", get(|| async { Json(Envelope::ok("ok")) }))
        .route("/api/machines", get(list_machines_handler).post(add_machine_handler))
        .route(
            "/api/machines/:address",
            get(get_machine_handler)
                .put(update_machine_handler)
                .delete(remove_machine_handler),
        )
        .route("/api/machines/:address/refresh", post(refresh_machine_handler))
        .route("/api/machines/:address/runs", post(start_run_handler))
        .route("/api/machines/:address/acquire_and_run", post(acquire_and_run_handler))
        .route("/api/machines/:address/runs/:run_id", get(run_status_handler))
        .route("/api/machines/:address/runs/:run_id/logs", get(run_logs_handler))
        .route("/api/machines/:address/runs/:run_id/stop", post(stop_run_handler))
        .route("/api/leases", get(list_leases_handler))
        .route("/api/leases/acquire", post(acquire_handler))
        .route("/api/leases/release", post(release_handler))
        .route("/api/leases/heartbeat", post(heartbeat_handler))
        .route("/api/leases/force_release", post(force_release_handler))
        .route("/api/leases/:address", get(lease_status_handler))
        .route("/api/holders/:holder_id/sessions", get(sessions_handler))
        .route("/api/holders/:holder_id/release_all", post(release_all_handler))
        .layer(cors())
        .with_state(state)
}

fn ack(ack: LeaseAck) -> Json<Envelope<LeaseAck>> {
    let message = ack.message.clone();
    Json(Envelope::ok_with_message(ack, message))
}

async fn list_machines_handler(State(state): State<CenterState>) -> ApiResult<Vec<FleetMachineStatus>> {
    let machines = state.leases.all_statuses_with_fleet(&state.registry).await;
    Ok(Json(Envelope::ok(machines)))
}

async fn add_machine_handler(
    State(state): State<CenterState>,
    Json(req): Json<ManualMachineRequest>,
) -> ApiResult<MachineRecord> {
    let record = state
        .registry
        .add_manual(&req.address, &req.name, &req.location)
        .await?;
    Ok(Json(Envelope::ok_with_message(
        record,
        format!("成功添加测试机 {}", req.address),
    )))
}

async fn get_machine_handler(
    State(state): State<CenterState>,
    Path(address): Path<String>,
) -> ApiResult<MachineDetail> {
    let machine = state
        .registry
        .get_machine(&address)
        .await
        .ok_or_else(|| BenchError::HostNotFound(address.clone()))?;
    let lease = state.leases.status(&address).await;
    Ok(Json(Envelope::ok(MachineDetail { machine, lease })))
}

async fn update_machine_handler(
    State(state): State<CenterState>,
    Path(address): Path<String>,
    Json(req): Json<ManualMachineRequest>,
) -> ApiResult<MachineRecord> {
    let record = state
        .registry
        .update_manual(&address, &req.name, &req.location)
        .await?;
    Ok(Json(Envelope::ok(record)))
}

async fn remove_machine_handler(
    State(state): State<CenterState>,
    Path(address): Path<String>,
) -> ApiResult<String> {
    state.registry.remove_machine(&address).await?;
    Ok(Json(Envelope::ok_with_message(
        address.clone(),
        format!("成功删除测试机 {}", address),
    )))
}

async fn refresh_machine_handler(
    State(state): State<CenterState>,
    Path(address): Path<String>,
) -> ApiResult<MachineRecord> {
    Ok(Json(Envelope::ok(state.registry.refresh_now(&address).await?)))
}

async fn start_run_handler(
    State(state): State<CenterState>,
    Path(address): Path<String>,
    Json(req): Json<RunRequest>,
) -> ApiResult<RunRecord> {
    let run = state
        .orchestrator
        .start_run(&address, &req.holder_id, &req.test_case, &req.port)
        .await?;
    Ok(Json(Envelope::ok(run)))
}

async fn acquire_and_run_handler(
    State(state): State<CenterState>,
    Path(address): Path<String>,
    Json(req): Json<RunRequest>,
) -> ApiResult<StartedRun> {
    let holder_name = if req.holder_name.is_empty() {
        req.holder_id.clone()
    } else {
        req.holder_name
    };
    let acquire = AcquireRequest::new(address, req.holder_id, holder_name)
        .test_case(req.test_case)
        .port(req.port);
    Ok(Json(Envelope::ok(
        state.orchestrator.acquire_and_start(acquire).await?,
    )))
}

async fn run_status_handler(
    State(state): State<CenterState>,
    Path((address, run_id)): Path<(String, String)>,
) -> ApiResult<RunRecord> {
    Ok(Json(Envelope::ok(
        state.orchestrator.run_status(&address, &run_id).await?,
    )))
}

async fn run_logs_handler(
    State(state): State<CenterState>,
    Path((address, run_id)): Path<(String, String)>,
    Query(query): Query<LogQuery>,
) -> ApiResult<LogChunk> {
    Ok(Json(Envelope::ok(
        state
            .orchestrator
            .run_logs(&address, &run_id, query.after)
            .await?,
    )))
}

async fn stop_run_handler(
    State(state): State<CenterState>,
    Path((address, run_id)): Path<(String, String)>,
    Json(req): Json<StopRequest>,
) -> ApiResult<StopAck> {
    let ack = state
        .orchestrator
        .stop_run(&address, &req.holder_id, &run_id)
        .await?;
    let message = ack.message.clone();
    Ok(Json(Envelope::ok_with_message(ack, message)))
}

async fn list_leases_handler(State(state): State<CenterState>) -> ApiResult<Vec<MachineLeaseStatus>> {
    Ok(Json(Envelope::ok(state.leases.all_statuses().await)))
}

async fn acquire_handler(
    State(state): State<CenterState>,
    Json(req): Json<AcquireRequest>,
) -> ApiResult<LeaseAck> {
    Ok(ack(state.leases.acquire(req).await?))
}

async fn release_handler(
    State(state): State<CenterState>,
    Json(req): Json<ReleaseRequest>,
) -> ApiResult<LeaseAck> {
    Ok(ack(state.leases.release(&req.address, &req.holder_id).await?))
}

async fn heartbeat_handler(
    State(state): State<CenterState>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<LeaseAck> {
    Ok(ack(state
        .leases
        .heartbeat(&req.address, &req.holder_id, req.run_id)
        .await?))
}

async fn force_release_handler(
    State(state): State<CenterState>,
    Json(req): Json<ForceReleaseRequest>,
) -> ApiResult<LeaseAck> {
    Ok(ack(state
        .leases
        .force_release(&req.address, &req.admin)
        .await?))
}

async fn lease_status_handler(
    State(state): State<CenterState>,
    Path(address): Path<String>,
) -> ApiResult<MachineLeaseStatus> {
    Ok(Json(Envelope::ok(state.leases.status(&address).await)))
}

async fn sessions_handler(
    State(state): State<CenterState>,
    Path(holder_id): Path<String>,
) -> ApiResult<Vec<Lease>> {
    Ok(Json(Envelope::ok(state.leases.leases_of(&holder_id).await)))
}

async fn release_all_handler(
    State(state): State<CenterState>,
    Path(holder_id): Path<String>,
) -> ApiResult<BTreeSet<String>> {
    let released: BTreeSet<String> = state.leases.release_all(&holder_id).await.into_iter().collect();
    let message = format!("已释放 {} 台测试机", released.len());
    Ok(Json(Envelope::ok_with_message(released, message)))
}
