//! HTTP API of the controller
//!
//! Two routers share one listener: the admin API driving the controllers,
//! and the host agent API under `/agent` answering [`HttpHostAgent`]
//! calls. Both answer with the `{"ok": ...}` / `{"error": ...}` envelope.
//!
//! [`HttpHostAgent`]: crate::clients::http::HttpHostAgent

use crate::clients::http::{agent, Envelope, ErrorBody};
use crate::clients::HostAgent;
use crate::common::{Cancellation, ProcessIdentity};
use crate::dal::{DtlMode, StorageDriverId, StorageRouterId, VDiskId, VPoolId};
use crate::dtl::{self, DtlOutcome, DtlScope};
use crate::mds::{self, SafetyOutcome};
use crate::ops::{self, InitNodeOptions, InstallNodeOptions};
use crate::vpool::{self, VPoolParameters};
use crate::{Context, Error};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Error answered with its kind and the matching status code
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body: Envelope<()> = Envelope::Error(ErrorBody::from(&self.0));
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<Envelope<T>>, ApiError>;

fn ok<T>(value: T) -> ApiResult<T> {
    Ok(Json(Envelope::Ok(value)))
}

fn parse_id<T: FromStr<Err = Error>>(raw: &str) -> std::result::Result<T, ApiError> {
    T::from_str(raw).map_err(ApiError)
}

// === Admin API ===

#[derive(Clone)]
pub struct AdminState {
    pub ctx: Context,
    /// Cancelled on shutdown; checkups started over HTTP honour it too
    pub shutdown: Cancellation,
}

#[derive(Debug, Default, Deserialize)]
struct EnsureSafetyRequest {
    #[serde(default)]
    excluded: Vec<StorageRouterId>,
}

#[derive(Debug, Default, Deserialize)]
struct CatchUpQuery {
    #[serde(default)]
    background: bool,
}

#[derive(Debug, Deserialize)]
struct ManualDtlRequest {
    #[serde(default)]
    target: Option<StorageRouterId>,
    #[serde(default)]
    mode: Option<DtlMode>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckupRequest {
    #[serde(default)]
    vpool: Option<VPoolId>,
    #[serde(default)]
    vdisk: Option<VDiskId>,
}

#[derive(Debug, Deserialize)]
struct DomainRequest {
    host: String,
    domain: String,
    #[serde(default)]
    backup: bool,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    machine_id: String,
}

async fn health(State(state): State<AdminState>) -> ApiResult<Health> {
    ok(Health {
        status: "ok",
        version: crate::VERSION,
        machine_id: state.ctx.machine_id.clone(),
    })
}

async fn ensure_safety(
    State(state): State<AdminState>,
    Path(vdisk): Path<String>,
    body: Option<Json<EnsureSafetyRequest>>,
) -> ApiResult<Value> {
    let vdisk: VDiskId = parse_id(&vdisk)?;
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let excluded: BTreeSet<StorageRouterId> = request.excluded.into_iter().collect();
    match mds::ensure_safety(&state.ctx, vdisk, &excluded).await? {
        SafetyOutcome::Unchanged => ok(json!({ "reconfigured": false })),
        SafetyOutcome::Reconfigured { config } => {
            ok(json!({ "reconfigured": true, "config": config }))
        }
    }
}

async fn catch_up(
    State(state): State<AdminState>,
    Path(vdisk): Path<String>,
    Query(query): Query<CatchUpQuery>,
) -> ApiResult<Value> {
    let vdisk: VDiskId = parse_id(&vdisk)?;
    let report = mds::mds_catchup(&state.ctx, vdisk, query.background).await?;
    ok(json!({
        "slaves_checked": report.slaves_checked,
        "slaves_behind": report.slaves_behind,
        "caught_up": report.caught_up,
        "busy": report.busy,
        "spawned": report.spawned,
        "errors": report.errors,
    }))
}

fn dtl_outcome(outcome: DtlOutcome) -> Value {
    match outcome {
        DtlOutcome::Unchanged => json!({ "outcome": "unchanged" }),
        DtlOutcome::Manual => json!({ "outcome": "manual" }),
        DtlOutcome::Halted => json!({ "outcome": "halted" }),
        DtlOutcome::Reconfigured { config } => {
            json!({ "outcome": "reconfigured", "config": config })
        }
    }
}

async fn vdisk_dtl_checkup(
    State(state): State<AdminState>,
    Path(vdisk): Path<String>,
) -> ApiResult<Value> {
    let vdisk: VDiskId = parse_id(&vdisk)?;
    ok(dtl_outcome(dtl::ensure_dtl(&state.ctx, vdisk).await?))
}

async fn set_manual_dtl(
    State(state): State<AdminState>,
    Path(vdisk): Path<String>,
    Json(request): Json<ManualDtlRequest>,
) -> ApiResult<Value> {
    let vdisk: VDiskId = parse_id(&vdisk)?;
    let config = dtl::set_manual_dtl(&state.ctx, vdisk, request.target, request.mode).await?;
    ok(json!({ "config": config }))
}

async fn clear_manual_dtl(
    State(state): State<AdminState>,
    Path(vdisk): Path<String>,
) -> ApiResult<Value> {
    let vdisk: VDiskId = parse_id(&vdisk)?;
    ok(dtl_outcome(dtl::clear_manual_dtl(&state.ctx, vdisk).await?))
}

async fn add_vpool(
    State(state): State<AdminState>,
    Json(params): Json<VPoolParameters>,
) -> ApiResult<Value> {
    let report = vpool::add_vpool(&state.ctx, &params).await?;
    ok(json!({
        "vpool": report.vpool,
        "storagedriver": report.storagedriver,
        "created_vpool": report.created_vpool,
        "mds_service": report.mds_service,
    }))
}

async fn remove_storagedriver(
    State(state): State<AdminState>,
    Path(storagedriver): Path<String>,
) -> ApiResult<Value> {
    let storagedriver: StorageDriverId = parse_id(&storagedriver)?;
    let report = vpool::remove_storagedriver(&state.ctx, storagedriver).await?;
    ok(json!({
        "errors_found": report.errors_found,
        "errors": report.errors,
        "vpool_removed": report.vpool_removed,
    }))
}

async fn mds_checkup(
    State(state): State<AdminState>,
    body: Option<Json<CheckupRequest>>,
) -> ApiResult<ops::MdsCheckupReport> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    ok(ops::mds_checkup(&state.ctx, request.vpool, &state.shutdown).await?)
}

async fn catchup_checkup(
    State(state): State<AdminState>,
    body: Option<Json<CheckupRequest>>,
) -> ApiResult<ops::CatchUpCheckupReport> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    ok(ops::catchup_checkup(&state.ctx, request.vpool, &state.shutdown).await?)
}

async fn dtl_checkup(
    State(state): State<AdminState>,
    body: Option<Json<CheckupRequest>>,
) -> ApiResult<Value> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let scope = match (request.vdisk, request.vpool) {
        (Some(vdisk), _) => DtlScope::VDisk(vdisk),
        (None, Some(vpool)) => DtlScope::VPool(vpool),
        (None, None) => DtlScope::All,
    };
    let report = dtl::dtl_checkup(&state.ctx, scope, &state.shutdown).await?;
    let errors: Vec<Value> = report
        .errors
        .iter()
        .map(|(vdisk, e)| json!({ "vdisk": vdisk, "error": e }))
        .collect();
    ok(json!({
        "checked": report.checked,
        "reconfigured": report.reconfigured,
        "manual": report.manual,
        "halted": report.halted,
        "errors": errors,
    }))
}

async fn install_node(
    State(state): State<AdminState>,
    Json(options): Json<InstallNodeOptions>,
) -> ApiResult<()> {
    ok(ops::install_node(&state.ctx, &options).await?)
}

async fn init_node(
    State(state): State<AdminState>,
    Json(options): Json<InitNodeOptions>,
) -> ApiResult<StorageRouterId> {
    ok(ops::init_node(&state.ctx, &options).await?)
}

async fn add_domain(
    State(state): State<AdminState>,
    Json(request): Json<DomainRequest>,
) -> ApiResult<Value> {
    let id = ops::add_domain(&state.ctx, &request.host, &request.domain, request.backup)?;
    ok(json!({ "id": id }))
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/vdisks/:id/ensure-safety", post(ensure_safety))
        .route("/vdisks/:id/catch-up", post(catch_up))
        .route("/vdisks/:id/dtl-checkup", post(vdisk_dtl_checkup))
        .route(
            "/vdisks/:id/manual-dtl",
            post(set_manual_dtl).delete(clear_manual_dtl),
        )
        .route("/vpools", post(add_vpool))
        .route(
            "/storagedrivers/:id",
            axum::routing::delete(remove_storagedriver),
        )
        .route("/checkups/mds", post(mds_checkup))
        .route("/checkups/dtl", post(dtl_checkup))
        .route("/checkups/catch-up", post(catchup_checkup))
        .route("/nodes/install", post(install_node))
        .route("/nodes/init", post(init_node))
        .route("/domains", post(add_domain))
        .with_state(state)
}

// === Host agent API ===

type AgentState = Arc<dyn HostAgent>;

async fn agent_ping(State(agent): State<AgentState>) -> ApiResult<()> {
    ok(agent.ping().await?)
}

async fn agent_create_dirs(
    State(agent): State<AgentState>,
    Json(request): Json<agent::PathsRequest>,
) -> ApiResult<()> {
    ok(agent.create_dirs(&request.paths).await?)
}

async fn agent_remove_dirs(
    State(agent): State<AgentState>,
    Json(request): Json<agent::PathsRequest>,
) -> ApiResult<()> {
    ok(agent.remove_dirs(&request.paths).await?)
}

async fn agent_dir_exists(
    State(agent): State<AgentState>,
    Json(request): Json<agent::PathRequest>,
) -> ApiResult<bool> {
    ok(agent.dir_exists(&request.path).await?)
}

async fn agent_space(
    State(agent): State<AgentState>,
    Json(request): Json<agent::PathRequest>,
) -> ApiResult<u64> {
    ok(agent.available_space(&request.path).await?)
}

async fn agent_add_service(
    State(agent): State<AgentState>,
    Json(request): Json<agent::ServiceRequest>,
) -> ApiResult<()> {
    ok(agent.add_service(&request.name, &request.params).await?)
}

async fn agent_start_service(
    State(agent): State<AgentState>,
    Json(request): Json<agent::ServiceRequest>,
) -> ApiResult<()> {
    ok(agent.start_service(&request.name).await?)
}

async fn agent_stop_service(
    State(agent): State<AgentState>,
    Json(request): Json<agent::ServiceRequest>,
) -> ApiResult<()> {
    ok(agent.stop_service(&request.name).await?)
}

async fn agent_remove_service(
    State(agent): State<AgentState>,
    Json(request): Json<agent::ServiceRequest>,
) -> ApiResult<()> {
    ok(agent.remove_service(&request.name).await?)
}

async fn agent_has_service(
    State(agent): State<AgentState>,
    Json(request): Json<agent::ServiceRequest>,
) -> ApiResult<bool> {
    ok(agent.has_service(&request.name).await?)
}

async fn agent_service_identity(
    State(agent): State<AgentState>,
    Json(request): Json<agent::ServiceRequest>,
) -> ApiResult<Option<ProcessIdentity>> {
    ok(agent.service_identity(&request.name).await?)
}

async fn agent_worker_identity(State(agent): State<AgentState>) -> ApiResult<ProcessIdentity> {
    ok(agent.worker_identity().await?)
}

async fn agent_startup_counter(
    State(agent): State<AgentState>,
    Json(request): Json<agent::ServiceRequest>,
) -> ApiResult<u64> {
    ok(agent.startup_counter(&request.name).await?)
}

pub fn agent_router(agent: AgentState) -> Router {
    Router::new()
        .route("/ping", post(agent_ping))
        .route("/dirs/create", post(agent_create_dirs))
        .route("/dirs/remove", post(agent_remove_dirs))
        .route("/dirs/exists", post(agent_dir_exists))
        .route("/space", post(agent_space))
        .route("/services/add", post(agent_add_service))
        .route("/services/start", post(agent_start_service))
        .route("/services/stop", post(agent_stop_service))
        .route("/services/remove", post(agent_remove_service))
        .route("/services/exists", post(agent_has_service))
        .route("/services/identity", post(agent_service_identity))
        .route("/services/startup-counter", post(agent_startup_counter))
        .route("/worker/identity", post(agent_worker_identity))
        .with_state(agent)
}

/// Full router: the admin API when this controller owns the DAL, and the
/// host agent under `/agent`
pub fn create_router(admin: Option<AdminState>, agent: AgentState) -> Router {
    let mut router = Router::new().nest("/agent", agent_router(agent));
    match admin {
        Some(state) => router = router.merge(admin_router(state)),
        None => {
            router = router.route(
                "/health",
                get(|| async { Json(Envelope::Ok(json!({ "status": "ok", "admin": false }))) }),
            )
        }
    }
    router
        .fallback(|| async { (StatusCode::NOT_FOUND, "no such endpoint") })
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccs::Configuration;
    use crate::clients::sim::SimCluster;
    use crate::clients::ClientPool;
    use crate::dal::Dal;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn router() -> (Router, SimCluster) {
        let sim = SimCluster::new();
        sim.add_host("10.0.0.1");
        let clients = ClientPool::new(sim.factory(), Duration::from_millis(100));
        let ctx = Context::new(
            Arc::new(Dal::in_memory()),
            Configuration::in_memory(),
            Arc::new(clients),
            "m1",
        );
        let host = crate::dal::StorageRouter {
            id: StorageRouterId::new(),
            name: "node1".into(),
            ip: "10.0.0.1".into(),
            machine_id: "m1".into(),
            node_type: crate::dal::NodeType::Master,
        };
        let agent = ctx.clients.agent(&host).unwrap();
        let admin = AdminState {
            ctx,
            shutdown: Cancellation::new(),
        };
        (create_router(Some(admin), agent), sim)
    }

    async fn call(router: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = router();
        let (status, body) = call(&router, "GET", "/health", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"]["status"], "ok");
        assert_eq!(body["ok"]["machine_id"], "m1");
    }

    #[tokio::test]
    async fn test_errors_carry_kind_and_status() {
        let (router, _) = router();
        let uri = format!("/vdisks/{}/ensure-safety", VDiskId::new());
        let (status, body) = call(&router, "POST", &uri, json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");

        let (status, body) = call(&router, "POST", "/vdisks/not-a-uuid/catch-up", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_parameter");
    }

    #[tokio::test]
    async fn test_agent_routes_drive_the_agent() {
        let (router, sim) = router();
        let (status, _) = call(
            &router,
            "POST",
            "/agent/dirs/create",
            json!({ "paths": ["/mnt/ssd1/sco_pool"] }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(sim.dirs("10.0.0.1").contains("/mnt/ssd1/sco_pool"));

        let (_, body) = call(
            &router,
            "POST",
            "/agent/services/startup-counter",
            json!({ "name": "ovs-dtl_pool" }),
        )
        .await;
        assert_eq!(body["error"]["kind"], "not_found");
    }
}
