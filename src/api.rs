use crate::error::ServerError;
use crate::server::NodeHandle;
use crate::types::*;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

pub fn create_router(node: NodeHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/config", get(current_config))
        .route("/history", get(history))
        .route("/nomad/discover", post(handle_discover))
        .route("/nomad/prepare", post(handle_prepare))
        .route("/nomad/commit", post(handle_commit))
        .route("/nomad/rollback", post(handle_rollback))
        .route("/nomad/takeover", post(handle_takeover))
        .with_state(node)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn respond<T: serde::Serialize>(result: Result<T, ServerError>) -> Response {
    match result {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn respond_mutation(result: Result<MutationResult, ServerError>) -> Response {
    respond(result.map(AcceptRejectResponse::from))
}

async fn current_config(State(node): State<NodeHandle>) -> Response {
    respond(node.current_config().await)
}

async fn history(State(node): State<NodeHandle>) -> Response {
    respond(node.history().await)
}

async fn handle_discover(State(node): State<NodeHandle>) -> Response {
    respond(node.discover().await)
}

async fn handle_prepare(State(node): State<NodeHandle>, Json(req): Json<PrepareMessage>) -> Response {
    respond_mutation(node.prepare(req).await)
}

async fn handle_commit(State(node): State<NodeHandle>, Json(req): Json<CommitMessage>) -> Response {
    respond_mutation(node.commit(req).await)
}

async fn handle_rollback(State(node): State<NodeHandle>, Json(req): Json<RollbackMessage>) -> Response {
    respond_mutation(node.rollback(req).await)
}

async fn handle_takeover(State(node): State<NodeHandle>, Json(req): Json<TakeoverMessage>) -> Response {
    respond_mutation(node.takeover(req).await)
}
