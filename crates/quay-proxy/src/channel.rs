//! The virtual channel: an RPC client session presented to the broker's
//! registries as if it were a connection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use quay_core::legacy::{ext, request_code};
use quay_core::{Channel, ChannelId, ChannelKind, ClientId, LegacyCommand, ProxyError};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::correlator::Correlator;
use crate::telemetry::TelemetryCommandManager;

/// JSON-RPC method used for server-initiated commands.
pub const SERVER_COMMAND_METHOD: &str = "telemetry.command";

const CONSUMER_GROUP: &str = "consumerGroup";
const JSTACK_ENABLE: &str = "jstackEnable";

/// Write side of a client's RPC stream. Frames are serialized JSON.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    tx: mpsc::Sender<String>,
}

impl StreamHandle {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    pub fn same_stream(&self, other: &StreamHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn try_send(&self, frame: String) -> Result<(), mpsc::error::TrySendError<String>> {
        self.tx.try_send(frame)
    }
}

/// A server-initiated command pushed down a client's stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCommand {
    /// Correlates the client's `TelemetryAck`.
    pub nonce: String,
    #[serde(flatten)]
    pub body: CommandBody,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandBody {
    RecoverOrphanedTransaction {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    ConsumerIdsChanged {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
    ConsumerRunningInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default)]
        jstack: bool,
    },
    VerifyMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    /// Any command without a typed form.
    Passthrough {
        code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remark: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        ext_fields: BTreeMap<String, String>,
    },
}

impl ServerCommand {
    pub fn from_legacy(command: &LegacyCommand) -> Self {
        let owned = |key: &str| command.ext(key).map(str::to_string);
        let body = match command.code {
            request_code::CHECK_TRANSACTION_STATE => CommandBody::RecoverOrphanedTransaction {
                topic: owned(ext::TOPIC),
                transaction_id: owned(ext::TRANSACTION_ID),
                message_id: owned(ext::MSG_ID),
            },
            request_code::NOTIFY_CONSUMER_IDS_CHANGED => CommandBody::ConsumerIdsChanged {
                group: owned(CONSUMER_GROUP),
            },
            request_code::GET_CONSUMER_RUNNING_INFO => CommandBody::ConsumerRunningInfo {
                group: owned(CONSUMER_GROUP),
                jstack: command.ext(JSTACK_ENABLE) == Some("true"),
            },
            request_code::CONSUME_MESSAGE_DIRECTLY => CommandBody::VerifyMessage {
                group: owned(CONSUMER_GROUP),
                message_id: owned(ext::MSG_ID),
            },
            code => CommandBody::Passthrough {
                code,
                remark: command.remark.clone(),
                ext_fields: command.ext_fields.clone(),
            },
        };
        Self {
            nonce: Uuid::now_v7().to_string(),
            body,
        }
    }

    /// Whether the client is expected to answer with a `TelemetryAck`.
    pub fn expects_ack(&self) -> bool {
        matches!(
            self.body,
            CommandBody::RecoverOrphanedTransaction { .. }
                | CommandBody::ConsumerRunningInfo { .. }
                | CommandBody::VerifyMessage { .. }
        )
    }

    /// The JSON-RPC notification frame carrying this command.
    pub fn to_frame(&self) -> Result<String, ProxyError> {
        serde_json::to_string(&serde_json::json!({
            "method": SERVER_COMMAND_METHOD,
            "params": self,
        }))
        .map_err(|e| ProxyError::Internal(format!("failed to encode server command: {e}")))
    }
}

/// A channel with no socket behind it. Writes become frames on the client's
/// RPC stream, or complete pending invocations when they are replies.
pub struct VirtualChannel {
    id: ChannelId,
    client_id: ClientId,
    remote_addr: String,
    stream: RwLock<StreamHandle>,
    active: AtomicBool,
    correlator: Arc<Correlator>,
    telemetry: Arc<TelemetryCommandManager>,
}

impl VirtualChannel {
    pub fn new(
        client_id: ClientId,
        remote_addr: impl Into<String>,
        stream: StreamHandle,
        correlator: Arc<Correlator>,
        telemetry: Arc<TelemetryCommandManager>,
    ) -> Self {
        Self {
            id: ChannelId::new(),
            client_id,
            remote_addr: remote_addr.into(),
            stream: RwLock::new(stream),
            active: AtomicBool::new(true),
            correlator,
            telemetry,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Point the channel at a new stream. Returns true if the stream changed.
    pub fn rebind(&self, stream: &StreamHandle) -> bool {
        let mut current = self.stream.write();
        if current.same_stream(stream) {
            return false;
        }
        *current = stream.clone();
        tracing::debug!(client_id = %self.client_id, channel_id = %self.id, "channel rebound to new stream");
        true
    }

    /// Tear the channel down. Subsequent writes fail with `ChannelClosed`.
    pub fn invalidate(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            tracing::debug!(client_id = %self.client_id, channel_id = %self.id, "channel invalidated");
        }
    }

    fn push(&self, command: &LegacyCommand) -> Result<(), ProxyError> {
        let server_command = ServerCommand::from_legacy(command);
        let frame = server_command.to_frame()?;
        let stream = self.stream.read().clone();

        match stream.try_send(frame) {
            Ok(()) => {
                if server_command.expects_ack() {
                    self.telemetry.record(&self.client_id, server_command);
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(frame)) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    code = command.code,
                    frame_len = frame.len(),
                    "stream send queue full, dropping server command"
                );
                Err(ProxyError::Busy(self.client_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(ProxyError::ChannelClosed(self.client_id.clone()))
            }
        }
    }
}

impl fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("remote_addr", &self.remote_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Channel for VirtualChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Virtual
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn write(&self, command: LegacyCommand) -> Result<(), ProxyError> {
        if !self.is_active() {
            return Err(ProxyError::ChannelClosed(self.client_id.clone()));
        }

        if command.is_response() {
            let opaque = command.opaque;
            if !self.correlator.resolve(opaque, Some(command)) {
                tracing::debug!(
                    client_id = %self.client_id,
                    opaque,
                    "dropping reply with no pending invocation"
                );
            }
            return Ok(());
        }

        self.push(&command)
    }
}
