//! One client's WebSocket stream: a writer draining the per-connection queue and
//! a reader spawning a task per inbound frame.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use quay_proxy::CallContext;
use tokio::sync::mpsc;

use crate::handlers::{self, HandlerState};

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Serve a connection until either side closes it.
///
/// Registrations made over the stream outlive it; the scavenger removes them
/// once the client stops heartbeating.
pub async fn serve_connection(
    socket: WebSocket,
    ctx: CallContext,
    mut rx: mpsc::Receiver<String>,
    state: Arc<HandlerState>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let client_id = ctx.client_id.clone();

    let writer_cid = client_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let state = Arc::clone(&state);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let response = handlers::handle_frame(&state, &ctx, text.as_str()).await;
                        reply(&ctx, &response);
                    });
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    // Whichever side ends first takes the other down with it, so the queue is dropped.
    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
    tracing::info!(client_id = %client_id, "client stream closed");
}

fn reply(ctx: &CallContext, response: &crate::rpc::RpcResponse) {
    let json = match serde_json::to_string(response) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(client_id = %ctx.client_id, error = %e, "failed to encode rpc response");
            return;
        }
    };
    match ctx.stream.try_send(json) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(msg)) => {
            tracing::warn!(
                client_id = %ctx.client_id,
                msg_len = msg.len(),
                "send queue full, dropping rpc response"
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(client_id = %ctx.client_id, "stream gone before rpc response");
        }
    }
}
