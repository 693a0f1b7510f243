use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use stepwise_core::error::StepwiseError;
use stepwise_core::types::RunId;
use stepwise_engine::{Cancellation, Decision, ResumeSignal, WorkflowGraph};

use crate::state::AppState;
use crate::stream::run_events;

/// A library error on its way out as an HTTP response.
pub struct ApiError(StepwiseError);

impl From<StepwiseError> for ApiError {
    fn from(e: StepwiseError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StepwiseError::Validation { .. } | StepwiseError::Input { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            StepwiseError::RunNotFound(_) => StatusCode::NOT_FOUND,
            StepwiseError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_payload() }))).into_response()
    }
}

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct ValidateBody {
    pub graph: Value,
}

// POST /api/graphs/validate
pub async fn validate_graph(Json(body): Json<ValidateBody>) -> (StatusCode, Json<Value>) {
    let checked = WorkflowGraph::from_value(body.graph).and_then(|graph| graph.validate());
    match checked {
        Ok(()) => (StatusCode::OK, Json(json!({ "valid": true }))),
        Err(StepwiseError::Validation { reason, node_id }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "valid": false, "reason": reason, "nodeId": node_id })),
        ),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "valid": false, "reason": e.to_string(), "nodeId": null })),
        ),
    }
}

#[derive(Deserialize)]
pub struct StartRunBody {
    pub graph: Value,
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

// POST /api/runs -> SSE
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartRunBody>,
) -> Result<Response, ApiError> {
    let graph = WorkflowGraph::from_value(body.graph)?;
    let handle = state.manager.submit(graph, body.inputs)?;
    info!(run_id = %handle.run_id, "Run submitted over HTTP");
    Ok(run_events(handle).into_response())
}

#[derive(Deserialize)]
pub struct ResumeBody {
    pub decision: Decision,
    #[serde(default)]
    pub note: Option<String>,
}

// POST /api/runs/{id}/resume -> SSE
pub async fn resume_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResumeBody>,
) -> Result<Response, ApiError> {
    let signal = ResumeSignal {
        run_id: RunId::from_string(&id),
        decision: body.decision,
        note: body.note,
    };
    let handle = state.manager.resume(signal)?;
    Ok(run_events(handle).into_response())
}

// POST /api/runs/{id}/cancel
// A live run reports its end on its own stream; a suspended one has no stream
// left, so its terminal event comes back in the body.
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let response = match state.manager.cancel(&RunId::from_string(&id))? {
        Cancellation::Signalled => StatusCode::ACCEPTED.into_response(),
        Cancellation::Discarded(event) => (StatusCode::OK, Json(event)).into_response(),
        Cancellation::NotFound => StatusCode::NOT_FOUND.into_response(),
    };
    Ok(response)
}

// GET /api/runs/suspended
pub async fn suspended_runs(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let runs: Vec<Value> = state
        .manager
        .suspended_runs()?
        .into_iter()
        .map(|run| {
            json!({
                "runId": run.run_id,
                "nodeId": run.cursor,
                "prompt": run.prompt,
                "suspendedAt": run.suspended_at,
                "expiresAt": run.expires_at,
            })
        })
        .collect();
    Ok(Json(json!({ "runs": runs })))
}
