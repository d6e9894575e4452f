use dashmap::DashMap;
use quay_core::messages::Settings;
use quay_core::{ClientId, ProxyError};

/// Source of the settings a client declared about itself.
pub trait SettingsProvider: Send + Sync {
    fn client_settings(&self, client_id: &ClientId) -> Result<Settings, ProxyError>;

    /// Drop anything held for a client that has gone away.
    fn forget(&self, _client_id: &ClientId) {}
}

/// In-memory settings, filled by the client's `Telemetry` reports.
#[derive(Default)]
pub struct SettingsCache {
    entries: DashMap<ClientId, Settings>,
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest report, returning the one it replaced.
    pub fn update(&self, client_id: ClientId, settings: Settings) -> Option<Settings> {
        tracing::debug!(
            client_id = %client_id,
            client_type = ?settings.client_type,
            "client settings reported"
        );
        self.entries.insert(client_id, settings)
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Settings> {
        self.entries.get(client_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, client_id: &ClientId) -> Option<Settings> {
        self.entries.remove(client_id).map(|(_, settings)| settings)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SettingsProvider for SettingsCache {
    fn client_settings(&self, client_id: &ClientId) -> Result<Settings, ProxyError> {
        self.get(client_id).ok_or_else(|| {
            ProxyError::InvalidClientSettings(format!("no settings reported by client {client_id}"))
        })
    }

    fn forget(&self, client_id: &ClientId) {
        self.remove(client_id);
    }
}
