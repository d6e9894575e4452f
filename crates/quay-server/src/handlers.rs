//! RPC method handlers.

use std::sync::Arc;

use quay_broker::{ConsumerManager, ProducerManager};
use quay_core::messages::{
    HeartbeatRequest, NotifyClientTerminationRequest, SendMessageRequest, Settings, Status,
};
use quay_core::ProxyError;
use quay_proxy::{
    CallContext, ChannelRegistry, ClientService, Correlator, ProducerService, SettingsCache,
    TelemetryCommandManager,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::rpc::{self, RpcRequest, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub clients: Arc<ClientService>,
    pub producer: Arc<ProducerService>,
    pub settings: Arc<SettingsCache>,
    pub telemetry: Arc<TelemetryCommandManager>,
    pub channels: Arc<ChannelRegistry>,
    pub producers: Arc<ProducerManager>,
    pub consumers: Arc<ConsumerManager>,
    pub correlator: Arc<Correlator>,
}

#[derive(Debug, Deserialize)]
struct TelemetryReport {
    settings: Settings,
}

/// Decode one inbound frame and dispatch it.
pub async fn handle_frame(state: &Arc<HandlerState>, ctx: &CallContext, raw: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(raw) {
        Ok(req) => req,
        Err(e) => {
            tracing::debug!(client_id = %ctx.client_id, error = %e, "unparseable frame");
            return RpcResponse::parse_error();
        }
    };
    let params = request.params.unwrap_or_else(|| serde_json::json!({}));
    dispatch(state, ctx, &request.method, &params, request.id).await
}

/// Dispatch an RPC method to the appropriate handler.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    ctx: &CallContext,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    tracing::trace!(client_id = %ctx.client_id, method, "rpc call");
    match method {
        "Heartbeat" => {
            let request: HeartbeatRequest = match decode(params) {
                Ok(r) => r,
                Err(msg) => return RpcResponse::invalid_params(id, msg),
            };
            respond(id, state.clients.heartbeat(ctx, &request))
        }
        "NotifyClientTermination" => {
            let request: NotifyClientTerminationRequest = match decode(params) {
                Ok(r) => r,
                Err(msg) => return RpcResponse::invalid_params(id, msg),
            };
            respond(id, state.clients.notify_client_termination(ctx, &request))
        }
        "SendMessage" => {
            let request: SendMessageRequest = match decode(params) {
                Ok(r) => r,
                Err(msg) => return RpcResponse::invalid_params(id, msg),
            };
            respond(id, state.producer.send_message(ctx, request).await)
        }
        "Telemetry" => telemetry_report(state, ctx, params, id),
        "TelemetryAck" => telemetry_ack(state, ctx, params, id),
        _ => RpcResponse::method_not_found(id, method),
    }
}

fn decode<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, String> {
    serde_json::from_value(params.clone()).map_err(|e| format!("Invalid params: {e}"))
}

fn respond<T: Serialize>(id: Option<serde_json::Value>, outcome: Result<T, ProxyError>) -> RpcResponse {
    match outcome {
        Ok(value) => match serde_json::to_value(value) {
            Ok(result) => RpcResponse::success(id, result),
            Err(e) => RpcResponse::internal_error(id, format!("failed to encode result: {e}")),
        },
        Err(e) => RpcResponse::from_error(id, &e),
    }
}

fn telemetry_report(
    state: &HandlerState,
    ctx: &CallContext,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let report: TelemetryReport = match decode(params) {
        Ok(r) => r,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    state.settings.update(ctx.client_id.clone(), report.settings);
    state.channels.touch(&ctx.client_id);
    RpcResponse::success(id, serde_json::json!({ "status": Status::ok() }))
}

fn telemetry_ack(
    state: &HandlerState,
    ctx: &CallContext,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let nonce = match rpc::require_str(params, "nonce") {
        Ok(n) => n,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let acknowledged = state.telemetry.acknowledge(&ctx.client_id, nonce).is_some();
    RpcResponse::success(id, serde_json::json!({ "acknowledged": acknowledged }))
}

/// Counts reported by `/health`.
pub fn health(state: &HandlerState) -> serde_json::Value {
    serde_json::json!({
        "status": "healthy",
        "clients": state.channels.count(),
        "producer_groups": state.producers.group_count(),
        "consumer_groups": state.consumers.group_count(),
        "in_flight": state.correlator.in_flight(),
        "pending_commands": state.telemetry.total_pending(),
    })
}
