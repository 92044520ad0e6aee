//! HTTP handlers for the JSON-RPC endpoint.

use super::dispatch::ServerState;
use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::protocol::{self, Fault, JsonRpcRequest, JsonRpcResponse};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

pub(crate) fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(RpcConfig::HEALTH_PATH, get(handle_health))
        .route(RpcConfig::RPC_PATH, post(handle_rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(State(state): State<Arc<ServerState>>, body: Bytes) -> impl IntoResponse {
    let request: JsonRpcRequest = match serde_json::from_slice::<Value>(&body) {
        Err(e) => {
            return reply(JsonRpcResponse::error(
                None,
                Fault::new(protocol::PARSE_ERROR, format!("Parse error: {}", e)),
            ))
        }
        Ok(value) => match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return reply(JsonRpcResponse::error(
                    None,
                    Fault::new(protocol::INVALID_REQUEST, format!("Invalid request: {}", e)),
                ))
            }
        },
    };

    let id = request.id.clone();
    let method = request.method.as_str();
    let params = match request.params {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(params)) => params,
        Some(_) => {
            let err = RpcError::InvalidParams {
                message: "only positional parameters are supported".to_string(),
            };
            return reply(JsonRpcResponse::error(id, err.to_fault()));
        }
    };

    debug!("RPC call: {}({:?})", method, params);

    match state.handle(method, params).await {
        Ok(value) => reply(JsonRpcResponse::success(id, value)),
        Err(e) => {
            error!("RPC error for {}: {}", method, e);
            reply(JsonRpcResponse::error(id, e.to_fault()))
        }
    }
}

fn reply(response: JsonRpcResponse) -> (StatusCode, Json<JsonRpcResponse>) {
    (StatusCode::OK, Json(response))
}
