use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::error::WeftError;
use weft_core::types::HandlerDefinition;
use weft_engine::Strategy;

use crate::protocol::{ErrorBody, ExecuteRequest, EVENT_UPDATE};
use crate::state::{ExecutionGuard, PeerState};

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

// GET /api/health
pub async fn health(State(state): State<Arc<PeerState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active": state.active(),
    }))
}

// GET /api/node-types
pub async fn node_types(State(state): State<Arc<PeerState>>) -> Json<Vec<HandlerDefinition>> {
    let local = state
        .dispatcher
        .registry()
        .definitions()
        .into_iter()
        .filter(|d| d.route == "local")
        .collect();
    Json(local)
}

// POST /api/executions: streams `update` events until the firing ends
pub async fn execute(
    State(state): State<Arc<PeerState>>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let node_type = request.invocation.node_type.clone();
    if state.dispatcher.strategy(&node_type) != Some(Strategy::Local) {
        return error(
            StatusCode::NOT_FOUND,
            WeftError::NoExecutor(node_type).to_string(),
        );
    }

    let cancel = CancellationToken::new();
    if !state.register(&request.execution_id, cancel.clone()) {
        return error(
            StatusCode::CONFLICT,
            format!("execution '{}' already exists", request.execution_id),
        );
    }

    info!(
        execution_id = %request.execution_id,
        correlation_id = %request.correlation_id.0,
        node_type = %node_type,
        "Remote execution started"
    );
    let ctx = request.execution_context(cancel, state.verbose_errors);
    let guard = ExecutionGuard::new(state.clone(), request.execution_id.clone());
    let updates = state.dispatcher.dispatch(request.invocation, ctx);

    let events = updates.map(move |update| {
        let _registered = &guard;
        let event = Event::default().event(EVENT_UPDATE);
        match event.json_data(&update) {
            Ok(event) => Ok::<_, Infallible>(event),
            Err(e) => {
                warn!(error = %e, "Failed to encode update");
                Ok(Event::default().comment("encode error"))
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

// DELETE /api/executions/{id}
pub async fn cancel(State(state): State<Arc<PeerState>>, Path(id): Path<String>) -> Response {
    if state.cancel(&id) {
        info!(execution_id = %id, "Remote execution cancelled");
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "cancelled": id })),
        )
            .into_response()
    } else {
        error(StatusCode::NOT_FOUND, format!("no running execution '{}'", id))
    }
}
