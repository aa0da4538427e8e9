use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use stratus_balancer::RouteError;
use stratus_common::{Error, RunId, TriggerEvent};
use stratus_service::ManualMetric;

use crate::context::DeploymentContext;

#[derive(Clone)]
pub struct AdminState {
    pub ctx: Arc<DeploymentContext>,
    /// Utilization fed to the autoscaler.
    pub utilization: Arc<ManualMetric>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = ErrorResponse {
        error: ErrorDetail {
            code: code.to_string(),
            message: message.to_string(),
            request_id: format!("req_{}", Uuid::new_v4()),
        },
    };
    (status, Json(body)).into_response()
}

fn from_error(err: &Error) -> Response {
    let (status, code) = match err {
        Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::PipelineBusy { .. } => (StatusCode::CONFLICT, "pipeline_busy"),
        Error::RunNotAwaitingApproval { .. } => (StatusCode::CONFLICT, "not_awaiting_approval"),
        Error::RunNotCancellable { .. } => (StatusCode::CONFLICT, "not_cancellable"),
        Error::InvalidConfig(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        Error::ReplicaBounds { .. } => (StatusCode::BAD_REQUEST, "replica_bounds"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    error_response(status, code, &err.to_string())
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/runs", get(list_runs).post(trigger))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/approve", post(approve))
        .route("/runs/:id/reject", post(reject))
        .route("/runs/:id/cancel", post(cancel))
        .route("/service/utilization", put(set_utilization))
        .route("/service/scale", post(scale))
        .route("/listeners/:port/route", get(route))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics(State(st): State<AdminState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.ctx.render_metrics(),
    )
}

async fn status(State(st): State<AdminState>) -> Response {
    let ctx = &st.ctx;
    let replicas = match ctx.controller.replicas().await {
        Ok(r) => r,
        Err(e) => return from_error(&e),
    };
    let resources = ctx.topology.lock().await.handles().to_vec();
    Json(json!({
        "service": ctx.controller.record(),
        "workloads": ctx.controller.workload_history().await,
        "replicas": replicas,
        "listeners": ctx.balancer.listeners(),
        "active_run": ctx.pipeline.active_run().await,
        "utilization": st.utilization.get(),
        "resources": resources,
    }))
    .into_response()
}

async fn list_runs(State(st): State<AdminState>) -> impl IntoResponse {
    Json(st.ctx.pipeline.runs().await)
}

async fn trigger(State(st): State<AdminState>, Json(event): Json<TriggerEvent>) -> Response {
    match st.ctx.pipeline.trigger(event).await {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
        Err(e) => from_error(&e),
    }
}

async fn get_run(State(st): State<AdminState>, Path(id): Path<RunId>) -> Response {
    match st.ctx.pipeline.run(id).await {
        Some(summary) => Json(summary).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "not_found", &format!("run {id} not found")),
    }
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn approve(
    State(st): State<AdminState>,
    Path(id): Path<RunId>,
    Json(body): Json<DecisionBody>,
) -> Response {
    decided(&st, id, st.ctx.pipeline.approve(id, &body.by).await).await
}

async fn reject(
    State(st): State<AdminState>,
    Path(id): Path<RunId>,
    Json(body): Json<DecisionBody>,
) -> Response {
    let reason = body.reason.as_deref().unwrap_or("rejected");
    decided(&st, id, st.ctx.pipeline.reject(id, &body.by, reason).await).await
}

async fn cancel(
    State(st): State<AdminState>,
    Path(id): Path<RunId>,
    Json(body): Json<DecisionBody>,
) -> Response {
    decided(&st, id, st.ctx.pipeline.cancel(id, &body.by).await).await
}

async fn decided(st: &AdminState, id: RunId, result: stratus_common::Result<()>) -> Response {
    if let Err(e) = result {
        return from_error(&e);
    }
    match st.ctx.pipeline.run(id).await {
        Some(summary) => (StatusCode::ACCEPTED, Json(summary)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct UtilizationBody {
    pub percent: f64,
}

async fn set_utilization(
    State(st): State<AdminState>,
    Json(body): Json<UtilizationBody>,
) -> Response {
    if !body.percent.is_finite() || body.percent < 0.0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "percent must be a non-negative number",
        );
    }
    st.utilization.set(body.percent);
    Json(json!({"percent": body.percent})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ScaleBody {
    pub desired: u32,
}

async fn scale(State(st): State<AdminState>, Json(body): Json<ScaleBody>) -> Response {
    match st.ctx.controller.scale_to(body.desired).await {
        Ok(previous) => Json(json!({"previous": previous, "desired": body.desired})).into_response(),
        Err(e) => from_error(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    pub client: IpAddr,
}

/// Pick a replica for one request from `client`, as the listener would.
async fn route(
    State(st): State<AdminState>,
    Path(port): Path<u16>,
    Query(q): Query<RouteQuery>,
) -> Response {
    match st.ctx.balancer.route(port, q.client) {
        Ok(routed) => {
            st.ctx.balancer.finish(&routed, true);
            Json(routed).into_response()
        }
        Err(e) => {
            let status = match e {
                RouteError::NoListener(_) => StatusCode::NOT_FOUND,
                RouteError::Forbidden { .. } => StatusCode::FORBIDDEN,
                RouteError::NoTarget(_) | RouteError::NoHealthyTarget(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            error_response(status, "route_failed", &e.to_string())
        }
    }
}
