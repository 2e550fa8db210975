//! Axum route handlers for the husk gateway API.

use std::path::PathBuf;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use husk_core::validation::{
    parse_bandwidth, parse_disk_size_gb, parse_duration, parse_memory_mib, parse_network_policy, parse_vcpu_count,
    validate_domain_pattern, validate_port,
};
use husk_core::{Cidr, CoreError, PolicyRules, SnapshotId, VmId, VmRecord};
use husk_executor::{CreateOptions, IsolationOptions, Orchestrator, StopOutcome};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::GatewayError;

// ── Request / response types ──────────────────────────────────────────────────

/// Filter policy as supplied by a client.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PolicyBody {
    pub network_policy: Option<String>,
    pub allowed_domains: Vec<String>,
    pub allowed_cidrs: Vec<String>,
    pub denied_cidrs: Vec<String>,
}

impl PolicyBody {
    /// Validates every field and builds normalized rules.
    ///
    /// # Errors
    /// The first invalid policy name, domain, CIDR or combination.
    pub fn into_rules(self) -> Result<PolicyRules, CoreError> {
        let cidrs = |list: Vec<String>| list.iter().map(|c| c.trim().parse::<Cidr>()).collect::<Result<Vec<_>, _>>();
        PolicyRules {
            policy: parse_network_policy(self.network_policy.as_deref())?,
            allowed_domains: self
                .allowed_domains
                .iter()
                .map(|d| validate_domain_pattern(d))
                .collect::<Result<_, _>>()?,
            allowed_cidrs: cidrs(self.allowed_cidrs)?,
            denied_cidrs: cidrs(self.denied_cidrs)?,
        }
        .normalized()
    }
}

/// `POST /v1/vms` body. Size-like fields take the same strings as the
/// command-line flags (`"2g"`, `"1h30m"`).
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateVmBody {
    pub vcpus: Option<u32>,
    pub memory_mib: Option<u32>,
    pub disk: Option<String>,
    pub kernel: Option<PathBuf>,
    pub rootfs: Option<PathBuf>,
    pub project: Option<String>,
    pub runtime: Option<String>,
    #[serde(flatten)]
    pub policy: PolicyBody,
    pub publish_ports: Vec<u32>,
    pub bandwidth: Option<String>,
    pub timeout: Option<String>,
    pub snapshot: Option<String>,
    pub no_netns: bool,
    pub no_seccomp: bool,
    pub no_pid_ns: bool,
    pub no_cgroup: bool,
}

impl CreateVmBody {
    /// # Errors
    /// The first field that fails validation.
    pub fn into_options(self) -> Result<CreateOptions, CoreError> {
        let number = |n: Option<u32>| n.map(|v| v.to_string());
        let defaults = CreateOptions::default();
        Ok(CreateOptions {
            vcpus: parse_vcpu_count(number(self.vcpus).as_deref())?,
            mem_mib: parse_memory_mib(number(self.memory_mib).as_deref())?,
            disk_size_gb: self.disk.as_deref().map(|d| parse_disk_size_gb(Some(d))).transpose()?,
            kernel: self.kernel,
            rootfs: self.rootfs,
            project: self.project.unwrap_or_default(),
            runtime: self.runtime.filter(|r| !r.is_empty()).unwrap_or(defaults.runtime),
            rules: self.policy.into_rules()?,
            published_ports: self.publish_ports.into_iter().map(validate_port).collect::<Result<_, _>>()?,
            bandwidth_mbit: parse_bandwidth(self.bandwidth.as_deref())?,
            isolation: IsolationOptions {
                netns: !self.no_netns,
                seccomp: !self.no_seccomp,
                pid_ns: !self.no_pid_ns,
                cgroup: !self.no_cgroup,
            },
            timeout: self.timeout.as_deref().map(parse_duration).transpose()?,
            snapshot: self.snapshot.map(SnapshotId::new).transpose()?,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RemoveQuery {
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub id: VmId,
    pub outcome: StopOutcome,
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router around `orchestrator`.
pub fn create_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/vms", get(list_vms).post(create_vm))
        .route("/v1/vms/{id}", get(get_vm).delete(remove_vm))
        .route("/v1/vms/{id}/start", post(start_vm))
        .route("/v1/vms/{id}/stop", post(stop_vm))
        .route("/v1/vms/{id}/network", put(update_network))
        .route("/v1/vms/{id}/agent/wait", post(wait_for_agent))
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn vm_id(raw: &str) -> Result<VmId, GatewayError> {
    Ok(VmId::new(raw)?)
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `GET /v1/vms`: every VM, newest first.
///
/// # Errors
/// Returns the store failure if records cannot be listed.
pub async fn list_vms(State(orch): State<Orchestrator>) -> Result<Json<Vec<VmRecord>>, GatewayError> {
    Ok(Json(orch.list().await?))
}

/// `POST /v1/vms`: create and boot a VM.
///
/// # Errors
/// Validation failures map to 400, exhausted slots to 503, anything that
/// broke during provisioning to 500.
pub async fn create_vm(
    State(orch): State<Orchestrator>,
    Json(body): Json<CreateVmBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let record = orch.create(body.into_options()?).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// `GET /v1/vms/{id}`
///
/// # Errors
/// 404 if no such VM exists.
pub async fn get_vm(State(orch): State<Orchestrator>, Path(id): Path<String>) -> Result<Json<VmRecord>, GatewayError> {
    Ok(Json(orch.get(&vm_id(&id)?).await?))
}

/// `DELETE /v1/vms/{id}?force=true`
///
/// # Errors
/// 409 for a VM that is not stopped unless `force` is set.
pub async fn remove_vm(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, GatewayError> {
    orch.remove(&vm_id(&id)?, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/vms/{id}/start`
///
/// # Errors
/// 409 unless the VM is stopped and its jail still exists.
pub async fn start_vm(State(orch): State<Orchestrator>, Path(id): Path<String>) -> Result<Json<VmRecord>, GatewayError> {
    Ok(Json(orch.start(&vm_id(&id)?).await?))
}

/// `POST /v1/vms/{id}/stop`: idempotent.
///
/// # Errors
/// 404 if no such VM exists.
pub async fn stop_vm(State(orch): State<Orchestrator>, Path(id): Path<String>) -> Result<Json<StopResponse>, GatewayError> {
    let id = vm_id(&id)?;
    let outcome = orch.stop(&id).await?;
    Ok(Json(StopResponse { id, outcome }))
}

/// `PUT /v1/vms/{id}/network`: replace a running VM's filter policy.
///
/// # Errors
/// 400 for an invalid policy, 409 unless the VM is running.
pub async fn update_network(
    State(orch): State<Orchestrator>,
    Path(id): Path<String>,
    Json(body): Json<PolicyBody>,
) -> Result<impl IntoResponse, GatewayError> {
    let update = orch.update_network_policy(&vm_id(&id)?, body.into_rules()?).await?;
    Ok(Json(update))
}

/// `POST /v1/vms/{id}/agent/wait`: block until the guest agent is healthy.
///
/// # Errors
/// 409 unless running, 504 if the agent never answers.
pub async fn wait_for_agent(State(orch): State<Orchestrator>, Path(id): Path<String>) -> Result<StatusCode, GatewayError> {
    orch.wait_for_agent(&vm_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}
