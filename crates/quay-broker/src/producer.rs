use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use quay_core::{Channel, ChannelId, ClientId};

use crate::client::ClientChannelInfo;

/// Producer group table: group -> client -> channel info.
///
/// Entries are keyed by client id so a repeated heartbeat overwrites rather
/// than duplicates. Removal checks the channel id so a stale unregistration
/// never evicts a newer channel for the same client.
#[derive(Default)]
pub struct ProducerManager {
    groups: RwLock<HashMap<String, HashMap<ClientId, ClientChannelInfo>>>,
}

impl ProducerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a producer. Returns true if the client was new to the group.
    pub fn register_producer(&self, group: &str, info: ClientChannelInfo) -> bool {
        let mut groups = self.groups.write();
        let clients = groups.entry(group.to_string()).or_default();
        let client_id = info.client_id.clone();
        let is_new = clients.insert(client_id.clone(), info).is_none();
        if is_new {
            tracing::info!(group, client_id = %client_id, "producer registered");
        }
        is_new
    }

    /// Remove a producer from one group if it is still registered through `channel_id`.
    pub fn unregister_producer(&self, group: &str, client_id: &ClientId, channel_id: &ChannelId) -> bool {
        let mut groups = self.groups.write();
        let Some(clients) = groups.get_mut(group) else {
            return false;
        };
        let matches = clients
            .get(client_id)
            .is_some_and(|info| info.channel_id() == channel_id);
        if !matches {
            return false;
        }
        clients.remove(client_id);
        if clients.is_empty() {
            groups.remove(group);
            tracing::info!(group, "producer group removed, no clients left");
        }
        tracing::info!(group, client_id = %client_id, "producer unregistered");
        true
    }

    /// Drop every registration made through `channel_id`. Returns the affected groups.
    pub fn unregister_channel(&self, channel_id: &ChannelId) -> Vec<String> {
        let mut groups = self.groups.write();
        let mut affected = Vec::new();
        groups.retain(|group, clients| {
            let before = clients.len();
            clients.retain(|_, info| info.channel_id() != channel_id);
            if clients.len() != before {
                affected.push(group.clone());
            }
            !clients.is_empty()
        });
        affected.sort();
        affected
    }

    /// Groups in which `channel_id` currently has a registration.
    pub fn groups_for_channel(&self, channel_id: &ChannelId) -> Vec<String> {
        let groups = self.groups.read();
        let mut found: Vec<String> = groups
            .iter()
            .filter(|(_, clients)| clients.values().any(|info| info.channel_id() == channel_id))
            .map(|(group, _)| group.clone())
            .collect();
        found.sort();
        found
    }

    /// Find the channel a client is registered through, in any group.
    pub fn find_channel(&self, client_id: &ClientId) -> Option<Arc<dyn Channel>> {
        let groups = self.groups.read();
        groups
            .values()
            .find_map(|clients| clients.get(client_id))
            .map(|info| Arc::clone(&info.channel))
    }

    pub fn group_clients(&self, group: &str) -> Vec<ClientChannelInfo> {
        self.groups
            .read()
            .get(group)
            .map(|clients| clients.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of producer groups with at least one client.
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}
