use std::sync::atomic::{AtomicBool, Ordering};

use quay_core::{Channel, ChannelId, ChannelKind, ClientId, LegacyCommand, ProxyError};
use tokio::sync::mpsc;

/// Channel backed by a real broker connection.
///
/// The connection's writer task owns the socket and the frame codec; this side
/// only queues decoded commands for it. The broker connection layer builds one
/// per accepted socket, next to the `VirtualChannel`s the proxy hands out.
#[derive(Debug)]
pub struct RemoteChannel {
    id: ChannelId,
    client_id: ClientId,
    remote_addr: String,
    tx: mpsc::Sender<LegacyCommand>,
    active: AtomicBool,
}

impl RemoteChannel {
    pub fn new(
        client_id: ClientId,
        remote_addr: impl Into<String>,
        tx: mpsc::Sender<LegacyCommand>,
    ) -> Self {
        Self {
            id: ChannelId::new(),
            client_id,
            remote_addr: remote_addr.into(),
            tx,
            active: AtomicBool::new(true),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Mark the connection closed; further writes fail.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Channel for RemoteChannel {
    fn id(&self) -> &ChannelId {
        &self.id
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Remote
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    fn write(&self, command: LegacyCommand) -> Result<(), ProxyError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(ProxyError::ChannelClosed(self.client_id.clone()));
        }
        match self.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    remote_addr = %self.remote_addr,
                    "connection write queue full, dropping command"
                );
                Err(ProxyError::Busy(self.client_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Err(ProxyError::ChannelClosed(self.client_id.clone()))
            }
        }
    }
}
