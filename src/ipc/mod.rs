//! IPC HTTP server - the operator interface.
//!
//! A localhost-only axum router through which the operator (GUI, CLI,
//! curl) drives the daemon: lifecycle commands, console polling, command
//! injection, backups, job edits, property editing and the firewall
//! toggle. Lifecycle and backup errors surface as JSON bodies with the
//! status code mapped in `supervisor::error`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::backup::{BackupEngine, BackupRecord};
use crate::console::ConsoleLine;
use crate::instance::ServerInstance;
use crate::properties;
use crate::scheduler::{parse_trigger, JobKind, ScheduledJob, Scheduler};
use crate::supervisor::error::SupervisorError;
use crate::supervisor::{StatusSnapshot, Supervisor};

// ─── Request / response types ────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StopRequest {
    /// Overrides the configured grace period for this stop
    #[serde(default)]
    pub grace_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleQuery {
    /// Return lines with id strictly greater than this
    pub since: Option<u64>,
    /// Cap for the no-`since` form (most recent lines)
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleResponse {
    pub lines: Vec<ConsoleLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupListResponse {
    pub backups: Vec<BackupRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<ScheduledJob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEditRequest {
    /// "HH:MM", 24-hour local time
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EulaRequest {
    pub accept: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirewallRequest {
    /// "allow" or "remove"
    pub action: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub rule_name: String,
}

// ─── Server ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub backups: Arc<BackupEngine>,
    pub scheduler: Arc<Scheduler>,
    pub instance: Arc<ServerInstance>,
}

pub struct IpcServer {
    state: AppState,
    listen_addr: String,
}

impl IpcServer {
    pub fn new(state: AppState, listen_addr: &str) -> Self {
        Self {
            state,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/api/server/status", get(server_status))
            .route("/api/server/start", post(server_start))
            .route("/api/server/stop", post(server_stop))
            .route("/api/server/acknowledge", post(server_acknowledge))
            .route("/api/server/command", post(server_command))
            .route("/api/server/console", get(server_console))
            .route("/api/backups", get(backup_list).post(backup_create))
            .route("/api/backup/:id/restore", post(backup_restore))
            .route("/api/backup/:id", axum::routing::delete(backup_delete))
            .route("/api/jobs", get(job_list))
            .route("/api/job/:kind", axum::routing::patch(job_edit))
            .route("/api/job/:kind/run", post(job_run))
            .route("/api/properties", get(properties_get).put(properties_put))
            .route("/api/eula", put(eula_put))
            .route("/api/firewall", post(firewall_toggle))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub async fn start(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);
        axum::serve(listener, Self::router(self.state)).await?;
        Ok(())
    }
}

// ─── Lifecycle handlers ──────────────────────────────────────

/// GET /api/server/status
async fn server_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.supervisor.status())
}

/// POST /api/server/start
async fn server_start(State(state): State<AppState>) -> Result<Json<serde_json::Value>, SupervisorError> {
    state.supervisor.start().await?;
    Ok(Json(json!({
        "success": true,
        "state": state.supervisor.current_state(),
    })))
}

/// POST /api/server/stop
async fn server_stop(
    State(state): State<AppState>,
    Json(req): Json<StopRequest>,
) -> Result<Json<serde_json::Value>, SupervisorError> {
    let grace = req.grace_secs.map(Duration::from_secs);
    state.supervisor.stop(grace).await?;
    Ok(Json(json!({
        "success": true,
        "state": state.supervisor.current_state(),
    })))
}

/// POST /api/server/acknowledge - reset a crashed server to stopped
async fn server_acknowledge(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, SupervisorError> {
    state.supervisor.acknowledge().await?;
    Ok(Json(json!({
        "success": true,
        "state": state.supervisor.current_state(),
    })))
}

/// POST /api/server/command - inject a console command
async fn server_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<serde_json::Value>, SupervisorError> {
    state.supervisor.send_command(&req.command).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/server/console?since=<id> (or ?limit=<n> for the tail)
async fn server_console(
    State(state): State<AppState>,
    Query(query): Query<ConsoleQuery>,
) -> Json<ConsoleResponse> {
    let lines = match query.since {
        Some(since) => state.supervisor.console_since(since),
        None => state.supervisor.console_recent(query.limit.unwrap_or(200)),
    };
    Json(ConsoleResponse { lines })
}

// ─── Backup handlers ─────────────────────────────────────────

/// GET /api/backups
async fn backup_list(
    State(state): State<AppState>,
) -> Result<Json<BackupListResponse>, SupervisorError> {
    let backups = state.backups.list()?;
    Ok(Json(BackupListResponse { backups }))
}

/// POST /api/backups - snapshot now (stops/restarts a running server)
async fn backup_create(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, SupervisorError> {
    let record = state.backups.snapshot().await?;
    Ok(Json(json!({ "success": true, "backup": record })))
}

/// POST /api/backup/:id/restore
async fn backup_restore(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, SupervisorError> {
    state.backups.restore(&id).await?;
    Ok(Json(json!({ "success": true, "restored": id })))
}

/// DELETE /api/backup/:id
async fn backup_delete(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, SupervisorError> {
    state.backups.delete(&id)?;
    Ok(Json(json!({ "success": true, "deleted": id })))
}

// ─── Job handlers ────────────────────────────────────────────

/// GET /api/jobs
async fn job_list(State(state): State<AppState>) -> Json<JobListResponse> {
    Json(JobListResponse {
        jobs: state.scheduler.jobs(),
    })
}

/// PATCH /api/job/:kind - edit trigger time and/or enabled flag
async fn job_edit(
    Path(kind): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<JobEditRequest>,
) -> impl IntoResponse {
    let kind: JobKind = match kind.parse() {
        Ok(k) => k,
        Err(e) => {
            return (StatusCode::NOT_FOUND, Json(json!({ "error": e }))).into_response();
        }
    };
    let trigger = match req.trigger.as_deref().map(parse_trigger).transpose() {
        Ok(t) => t,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response();
        }
    };
    state.scheduler.edit(kind, trigger, req.enabled);
    let jobs = state.scheduler.jobs();
    (StatusCode::OK, Json(json!({ "success": true, "jobs": jobs }))).into_response()
}

/// POST /api/job/:kind/run - fire a job immediately
async fn job_run(Path(kind): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    let kind: JobKind = match kind.parse() {
        Ok(k) => k,
        Err(e) => {
            return (StatusCode::NOT_FOUND, Json(json!({ "error": e }))).into_response();
        }
    };
    let result = state.scheduler.trigger_now(kind).await;
    (StatusCode::OK, Json(json!({ "success": true, "result": result }))).into_response()
}

// ─── Collaborator boundary handlers ──────────────────────────

/// GET /api/properties - the flat key/value server.properties
async fn properties_get(
    State(state): State<AppState>,
) -> Result<Json<Vec<PropertyEntry>>, SupervisorError> {
    let props = properties::read_properties(&state.instance.properties_path())?;
    Ok(Json(
        props
            .into_iter()
            .map(|(key, value)| PropertyEntry { key, value })
            .collect(),
    ))
}

/// PUT /api/properties - rewrite server.properties (previous copy kept as .bak)
async fn properties_put(
    State(state): State<AppState>,
    Json(entries): Json<Vec<PropertyEntry>>,
) -> Result<Json<serde_json::Value>, SupervisorError> {
    let props: Vec<(String, String)> =
        entries.into_iter().map(|e| (e.key, e.value)).collect();
    properties::write_properties(&state.instance.properties_path(), &props)?;
    Ok(Json(json!({ "success": true, "count": props.len() })))
}

/// PUT /api/eula
async fn eula_put(
    State(state): State<AppState>,
    Json(req): Json<EulaRequest>,
) -> Result<Json<serde_json::Value>, SupervisorError> {
    state.instance.write_eula(req.accept)?;
    Ok(Json(json!({ "success": true, "accepted": req.accept })))
}

/// POST /api/firewall - fire-and-forget rule toggle, result is a boolean
async fn firewall_toggle(Json(req): Json<FirewallRequest>) -> impl IntoResponse {
    let ok = match req.action.as_str() {
        "allow" => match req.port {
            Some(port) => crate::firewall::allow_port(port, &req.rule_name).await,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "'allow' requires a port" })),
                )
                    .into_response();
            }
        },
        "remove" => crate::firewall::remove_rule(&req.rule_name).await,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("unknown action '{}'", other) })),
            )
                .into_response();
        }
    };
    (StatusCode::OK, Json(json!({ "success": ok }))).into_response()
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::console::ConsoleBus;
    use crate::supervisor::SupervisorOptions;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router(dir: &std::path::Path) -> Router {
        let instance = Arc::new(ServerInstance::new("ipc-test", dir));
        let bus = Arc::new(ConsoleBus::default());
        let supervisor =
            Supervisor::new(instance.clone(), bus, SupervisorOptions::default());
        let backups = Arc::new(BackupEngine::new(instance.clone(), supervisor.clone()));
        let scheduler = Scheduler::new(
            supervisor.clone(),
            backups.clone(),
            &SchedulerConfig::default(),
        )
        .unwrap();
        IpcServer::router(AppState {
            supervisor,
            backups,
            scheduler,
            instance,
        })
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn status_and_console_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path());

        let res = router.clone().oneshot(get("/api/server/status")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = router.oneshot(get("/api/server/console?since=0")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stop_on_stopped_server_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path());
        let res = router
            .oneshot(post_json("/api/server/stop", "{}"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn start_unbootstrapped_is_precondition_failed() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path());
        let res = router
            .oneshot(post_json("/api/server/start", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn unknown_job_kind_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path());
        let res = router
            .oneshot(post_json("/api/job/prune/run", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn job_edit_rejects_bad_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path());
        let req = Request::builder()
            .method("PATCH")
            .uri("/api/job/backup")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"trigger":"4am"}"#))
            .unwrap();
        let res = router.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn restore_of_missing_backup_reports_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path());
        let res = router
            .oneshot(post_json("/api/backup/world_19700101_000000/restore", ""))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
