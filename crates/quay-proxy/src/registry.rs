use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use quay_core::{Channel, ChannelId, ClientId};

use crate::channel::{StreamHandle, VirtualChannel};
use crate::correlator::Correlator;
use crate::telemetry::TelemetryCommandManager;

struct Entry {
    channel: Arc<VirtualChannel>,
    last_heartbeat: Mutex<Instant>,
}

impl Entry {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_heartbeat.lock())
    }
}

/// One virtual channel per client identity.
pub struct ChannelRegistry {
    entries: DashMap<ClientId, Entry>,
    correlator: Arc<Correlator>,
    telemetry: Arc<TelemetryCommandManager>,
}

impl ChannelRegistry {
    pub fn new(correlator: Arc<Correlator>, telemetry: Arc<TelemetryCommandManager>) -> Self {
        Self {
            entries: DashMap::new(),
            correlator,
            telemetry,
        }
    }

    /// Return the client's channel, creating it on first sight.
    ///
    /// Concurrent callers for the same identity all receive the same `Arc`.
    /// Refreshes the heartbeat time and rebinds the channel if `stream` changed.
    pub fn get_or_create(
        &self,
        client_id: &ClientId,
        stream: &StreamHandle,
        remote_addr: &str,
    ) -> Arc<VirtualChannel> {
        let entry = self.entries.entry(client_id.clone()).or_insert_with(|| {
            tracing::info!(client_id = %client_id, remote_addr, "virtual channel created");
            Entry {
                channel: Arc::new(VirtualChannel::new(
                    client_id.clone(),
                    remote_addr,
                    stream.clone(),
                    Arc::clone(&self.correlator),
                    Arc::clone(&self.telemetry),
                )),
                last_heartbeat: Mutex::new(Instant::now()),
            }
        });
        *entry.last_heartbeat.lock() = Instant::now();
        entry.channel.rebind(stream);
        Arc::clone(&entry.channel)
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<VirtualChannel>> {
        self.entries.get(client_id).map(|e| Arc::clone(&e.channel))
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.entries.contains_key(client_id)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Record liveness without re-registering. Returns false for an unknown client.
    pub fn touch(&self, client_id: &ClientId) -> bool {
        match self.entries.get(client_id) {
            Some(entry) => {
                *entry.last_heartbeat.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove and invalidate the client's channel.
    pub fn remove(&self, client_id: &ClientId) -> bool {
        match self.entries.remove(client_id) {
            Some((_, entry)) => {
                entry.channel.invalidate();
                tracing::info!(client_id = %client_id, "virtual channel removed");
                true
            }
            None => false,
        }
    }

    /// Remove and invalidate the client's channel only if it is still `channel_id`.
    pub fn remove_channel(&self, client_id: &ClientId, channel_id: &ChannelId) -> bool {
        match self
            .entries
            .remove_if(client_id, |_, entry| entry.channel.id() == channel_id)
        {
            Some((_, entry)) => {
                entry.channel.invalidate();
                tracing::info!(client_id = %client_id, channel_id = %channel_id, "virtual channel removed");
                true
            }
            None => false,
        }
    }

    /// Remove every channel idle for at least `idle_timeout` as of `now`.
    ///
    /// Removal re-checks idleness under the entry lock, so a heartbeat that lands
    /// mid-sweep keeps its channel.
    pub fn scavenge(&self, now: Instant, idle_timeout: Duration) -> Vec<Arc<VirtualChannel>> {
        let candidates: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().idle_for(now) >= idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::new();
        for client_id in candidates {
            if let Some((_, entry)) = self
                .entries
                .remove_if(&client_id, |_, entry| entry.idle_for(now) >= idle_timeout)
            {
                entry.channel.invalidate();
                tracing::info!(
                    client_id = %client_id,
                    idle_ms = entry.idle_for(now).as_millis() as u64,
                    "scavenged idle virtual channel"
                );
                removed.push(entry.channel);
            }
        }
        removed
    }
}
