use std::sync::Arc;

use chrono::{DateTime, Utc};
use quay_core::messages::LanguageCode;
use quay_core::{Channel, ChannelId, ClientId};

/// A client as the group tables see it: who it is and which channel reaches it.
#[derive(Clone, Debug)]
pub struct ClientChannelInfo {
    pub channel: Arc<dyn Channel>,
    pub client_id: ClientId,
    pub language: LanguageCode,
    pub version: i32,
    pub last_update: DateTime<Utc>,
}

impl ClientChannelInfo {
    pub fn new(
        channel: Arc<dyn Channel>,
        client_id: ClientId,
        language: LanguageCode,
        version: i32,
    ) -> Self {
        Self {
            channel,
            client_id,
            language,
            version,
            last_update: Utc::now(),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        self.channel.id()
    }

    pub fn remote_addr(&self) -> &str {
        self.channel.remote_addr()
    }
}
