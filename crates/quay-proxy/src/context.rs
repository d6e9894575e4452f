use quay_core::messages::LanguageCode;
use quay_core::ClientId;

use crate::channel::StreamHandle;

/// Per-call facts supplied by the RPC layer: who is calling and how to reach them.
#[derive(Clone, Debug)]
pub struct CallContext {
    pub client_id: ClientId,
    pub remote_addr: String,
    pub language: LanguageCode,
    pub client_version: i32,
    pub stream: StreamHandle,
}

impl CallContext {
    /// Context with a synthetic address; the RPC layer overrides it when the peer is known.
    pub fn new(client_id: ClientId, stream: StreamHandle) -> Self {
        Self {
            remote_addr: format!("virtual://{client_id}"),
            client_id,
            language: LanguageCode::Java,
            client_version: 0,
            stream,
        }
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = addr.into();
        self
    }

    pub fn with_language(mut self, language: LanguageCode) -> Self {
        self.language = language;
        self
    }

    pub fn with_client_version(mut self, version: i32) -> Self {
        self.client_version = version;
        self
    }
}
