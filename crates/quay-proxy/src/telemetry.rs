use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quay_core::ClientId;

use crate::channel::ServerCommand;

/// Per-client telemetry session state the lifecycle service must release on termination.
pub trait TelemetrySessions: Send + Sync {
    /// Drop everything held for `client_id`. Returns how many entries were released.
    fn release(&self, client_id: &ClientId) -> usize;
}

/// A server command waiting for the client's acknowledgement.
#[derive(Clone, Debug)]
pub struct PendingCommand {
    pub command: ServerCommand,
    pub issued_at: DateTime<Utc>,
}

/// Tracks server commands pushed to clients until they are acknowledged by nonce.
#[derive(Default)]
pub struct TelemetryCommandManager {
    pending: DashMap<ClientId, HashMap<String, PendingCommand>>,
}

impl TelemetryCommandManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, client_id: &ClientId, command: ServerCommand) {
        let nonce = command.nonce.clone();
        self.pending.entry(client_id.clone()).or_default().insert(
            nonce,
            PendingCommand {
                command,
                issued_at: Utc::now(),
            },
        );
    }

    /// Match an acknowledgement to its command. Unknown nonces yield `None`.
    pub fn acknowledge(&self, client_id: &ClientId, nonce: &str) -> Option<PendingCommand> {
        let acked = self
            .pending
            .get_mut(client_id)
            .and_then(|mut commands| commands.remove(nonce));
        self.pending.remove_if(client_id, |_, commands| commands.is_empty());

        match &acked {
            Some(pending) => tracing::debug!(
                client_id = %client_id,
                nonce,
                latency_ms = (Utc::now() - pending.issued_at).num_milliseconds(),
                "server command acknowledged"
            ),
            None => tracing::debug!(client_id = %client_id, nonce, "ack for unknown nonce"),
        }
        acked
    }

    pub fn pending_count(&self, client_id: &ClientId) -> usize {
        self.pending.get(client_id).map(|c| c.len()).unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.pending.iter().map(|entry| entry.value().len()).sum()
    }
}

impl TelemetrySessions for TelemetryCommandManager {
    fn release(&self, client_id: &ClientId) -> usize {
        let released = self
            .pending
            .remove(client_id)
            .map(|(_, commands)| commands.len())
            .unwrap_or(0);
        if released > 0 {
            tracing::debug!(client_id = %client_id, released, "released unacknowledged server commands");
        }
        released
    }
}
