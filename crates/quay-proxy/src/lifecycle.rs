//! Client lifecycle: heartbeats register a client with the broker's group
//! tables through its virtual channel, termination and idle scavenging undo it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quay_broker::{
    ClientChannelInfo, ConsumeType, ConsumerManager, ConsumerRegistration, ProducerManager,
    SubscriptionData,
};
use quay_core::messages::{
    ClientType, HeartbeatRequest, HeartbeatResponse, NotifyClientTerminationRequest,
    NotifyClientTerminationResponse, Settings, Status,
};
use quay_core::{Channel, ClientId, ProxyError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::context::CallContext;
use crate::registry::ChannelRegistry;
use crate::settings::SettingsProvider;
use crate::telemetry::TelemetrySessions;

/// Heartbeats retry this many times when a concurrent termination keeps
/// invalidating the channel they registered through.
const REGISTER_ATTEMPTS: usize = 3;

/// Everything a heartbeat will register, validated before any table is touched.
#[derive(Debug)]
enum Plan {
    /// One producer registration per topic; the topic doubles as the group key.
    Producer { groups: Vec<String> },
    Consumer {
        group: String,
        registration: ConsumerRegistration,
    },
}

fn invalid(message: impl Into<String>) -> ProxyError {
    ProxyError::InvalidClientSettings(message.into())
}

fn plan_registration(settings: &Settings, request: &HeartbeatRequest) -> Result<Plan, ProxyError> {
    match settings.client_type {
        ClientType::Producer => {
            let topics = settings
                .publishing
                .as_ref()
                .map(|p| p.topics.as_slice())
                .unwrap_or_default();
            let mut seen = HashSet::new();
            let mut groups = Vec::with_capacity(topics.len());
            for topic in topics {
                if topic.name.trim().is_empty() {
                    return Err(invalid("producer declares an empty topic name"));
                }
                let name = topic.qualified_name();
                if seen.insert(name.clone()) {
                    groups.push(name);
                }
            }
            Ok(Plan::Producer { groups })
        }
        ClientType::PushConsumer | ClientType::SimpleConsumer => {
            let group = match &request.group {
                Some(group) if !group.name.trim().is_empty() => group.qualified_name(),
                _ => return Err(invalid("consumer heartbeat must name a group")),
            };
            let subscription = settings
                .subscription
                .as_ref()
                .ok_or_else(|| invalid(format!("consumer group {group} declares no subscription")))?;

            let mut seen = HashSet::new();
            let mut subscriptions = Vec::with_capacity(subscription.subscriptions.len());
            for entry in &subscription.subscriptions {
                let topic = entry.topic.qualified_name();
                if !seen.insert(topic.clone()) {
                    return Err(invalid(format!("topic {topic} subscribed twice in group {group}")));
                }
                let data = SubscriptionData::build(
                    &topic,
                    &entry.expression.expression,
                    entry.expression.filter_type,
                )
                .map_err(invalid)?;
                subscriptions.push(data);
            }

            let consume_type = if settings.client_type == ClientType::PushConsumer {
                ConsumeType::ConsumePassively
            } else {
                ConsumeType::ConsumeActively
            };
            Ok(Plan::Consumer {
                group,
                registration: ConsumerRegistration {
                    consume_type,
                    message_model: subscription.message_model.unwrap_or_default(),
                    consume_from_where: subscription.consume_from_where.unwrap_or_default(),
                    subscriptions,
                },
            })
        }
        ClientType::Unspecified => Err(invalid("client type is unspecified")),
    }
}

pub struct ClientService {
    settings: Arc<dyn SettingsProvider>,
    channels: Arc<ChannelRegistry>,
    producers: Arc<ProducerManager>,
    consumers: Arc<ConsumerManager>,
    telemetry: Arc<dyn TelemetrySessions>,
}

impl ClientService {
    pub fn new(
        settings: Arc<dyn SettingsProvider>,
        channels: Arc<ChannelRegistry>,
        producers: Arc<ProducerManager>,
        consumers: Arc<ConsumerManager>,
        telemetry: Arc<dyn TelemetrySessions>,
    ) -> Self {
        Self {
            settings,
            channels,
            producers,
            consumers,
            telemetry,
        }
    }

    /// Register (or refresh) the caller according to its declared settings.
    ///
    /// Nothing is registered unless the whole heartbeat is valid.
    pub fn heartbeat(
        &self,
        ctx: &CallContext,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, ProxyError> {
        let settings = self.settings.client_settings(&ctx.client_id)?;
        let plan = plan_registration(&settings, request).inspect_err(|e| {
            tracing::warn!(client_id = %ctx.client_id, error = %e, "rejected heartbeat");
        })?;

        for attempt in 1..=REGISTER_ATTEMPTS {
            let channel = self
                .channels
                .get_or_create(&ctx.client_id, &ctx.stream, &ctx.remote_addr);
            if self.register(ctx, &plan, channel) {
                return Ok(HeartbeatResponse {
                    status: Status::ok(),
                });
            }
            tracing::debug!(client_id = %ctx.client_id, attempt, "channel terminated during heartbeat, retrying");
        }
        Err(ProxyError::ChannelClosed(ctx.client_id.clone()))
    }

    /// Apply `plan` through `channel`. Returns false, with the registrations rolled
    /// back, if the channel was invalidated meanwhile.
    ///
    /// Termination invalidates the channel before unregistering it, so any
    /// registration it missed is caught by the activity check here.
    fn register(&self, ctx: &CallContext, plan: &Plan, channel: Arc<dyn Channel>) -> bool {
        let channel_id = channel.id().clone();
        let info = ClientChannelInfo::new(
            Arc::clone(&channel),
            ctx.client_id.clone(),
            ctx.language,
            ctx.client_version,
        );

        match plan {
            Plan::Producer { groups } => {
                for group in groups {
                    self.producers.register_producer(group, info.clone());
                }
                tracing::debug!(client_id = %ctx.client_id, topics = groups.len(), "producer heartbeat");
            }
            Plan::Consumer {
                group,
                registration,
            } => {
                self.consumers.register_consumer(group, info, registration.clone());
                tracing::debug!(client_id = %ctx.client_id, group = %group, "consumer heartbeat");
            }
        }

        if channel.is_active() {
            return true;
        }
        self.producers.unregister_channel(&channel_id);
        self.consumers.unregister_channel(&channel_id);
        false
    }

    /// Unregister the caller from one group, or from everything when no group is named.
    pub fn notify_client_termination(
        &self,
        ctx: &CallContext,
        request: &NotifyClientTerminationRequest,
    ) -> Result<NotifyClientTerminationResponse, ProxyError> {
        let ok = NotifyClientTerminationResponse {
            status: Status::ok(),
        };
        let Some(channel) = self.channels.get(&ctx.client_id) else {
            tracing::debug!(client_id = %ctx.client_id, "termination for unknown client");
            return Ok(ok);
        };
        let channel_id = channel.id().clone();

        match &request.group {
            Some(group) => {
                let group = group.qualified_name();
                let producer = self
                    .producers
                    .unregister_producer(&group, &ctx.client_id, &channel_id);
                let consumer = self
                    .consumers
                    .unregister_consumer(&group, &ctx.client_id, &channel_id);
                tracing::info!(
                    client_id = %ctx.client_id,
                    group = %group,
                    producer,
                    consumer,
                    "client left group"
                );

                let remaining = self.producers.groups_for_channel(&channel_id).len()
                    + self.consumers.groups_for_channel(&channel_id).len();
                if remaining == 0 && self.channels.remove_channel(&ctx.client_id, &channel_id) {
                    // Sweep anything a concurrent heartbeat registered before invalidation.
                    self.producers.unregister_channel(&channel_id);
                    self.consumers.unregister_channel(&channel_id);
                    self.telemetry.release(&ctx.client_id);
                }
            }
            None => {
                self.channels.remove_channel(&ctx.client_id, &channel_id);
                let producer_groups = self.producers.unregister_channel(&channel_id);
                let consumer_groups = self.consumers.unregister_channel(&channel_id);
                self.telemetry.release(&ctx.client_id);
                self.settings.forget(&ctx.client_id);
                tracing::info!(
                    client_id = %ctx.client_id,
                    producer_groups = ?producer_groups,
                    consumer_groups = ?consumer_groups,
                    "client terminated"
                );
            }
        }
        Ok(ok)
    }

    /// Drop clients that have not heartbeated for `idle_timeout`. Returns how many were removed.
    pub fn scavenge_idle_clients(&self, now: Instant, idle_timeout: Duration) -> usize {
        let removed = self.channels.scavenge(now, idle_timeout);
        for channel in &removed {
            // Conditional on the channel id: a fresh channel for the same client stays registered.
            let producer_groups = self.producers.unregister_channel(channel.id());
            let consumer_groups = self.consumers.unregister_channel(channel.id());
            if !self.channels.contains(channel.client_id()) {
                self.telemetry.release(channel.client_id());
            }
            tracing::info!(
                client_id = %channel.client_id(),
                producer_groups = producer_groups.len(),
                consumer_groups = consumer_groups.len(),
                "idle client unregistered"
            );
        }
        removed.len()
    }

    /// Run [`Self::scavenge_idle_clients`] every `interval` until `cancel` fires.
    pub fn start_scavenger(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::debug!("client scavenger stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = service.scavenge_idle_clients(Instant::now(), idle_timeout);
                        if removed > 0 {
                            tracing::info!(removed, "idle client scavenge");
                        }
                    }
                }
            }
        })
    }

    pub fn is_registered(&self, client_id: &ClientId) -> bool {
        self.channels.contains(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamHandle;
    use crate::correlator::Correlator;
    use crate::settings::SettingsCache;
    use crate::telemetry::TelemetryCommandManager;
    use quay_broker::consumer::{EXPRESSION_TYPE_TAG, SUB_ALL};
    use quay_core::legacy::request_code;
    use quay_core::messages::{
        ConsumeFromWhere, FilterExpression, MessageModel, Publishing, Resource, Subscription,
        SubscriptionEntry,
    };
    use quay_core::LegacyCommand;
    use tokio::sync::mpsc;

    struct Harness {
        service: Arc<ClientService>,
        settings: Arc<SettingsCache>,
        channels: Arc<ChannelRegistry>,
        producers: Arc<ProducerManager>,
        consumers: Arc<ConsumerManager>,
        telemetry: Arc<TelemetryCommandManager>,
    }

    impl Harness {
        fn new() -> Self {
            let settings = Arc::new(SettingsCache::new());
            let telemetry = Arc::new(TelemetryCommandManager::new());
            let correlator = Arc::new(Correlator::new(Duration::from_secs(5)));
            let channels = Arc::new(ChannelRegistry::new(correlator, Arc::clone(&telemetry)));
            let producers = Arc::new(ProducerManager::new());
            let consumers = Arc::new(ConsumerManager::new());
            let service = Arc::new(ClientService::new(
                settings.clone(),
                Arc::clone(&channels),
                Arc::clone(&producers),
                Arc::clone(&consumers),
                telemetry.clone(),
            ));
            Self {
                service,
                settings,
                channels,
                producers,
                consumers,
                telemetry,
            }
        }

        fn connect(&self, client: &str, settings: Settings) -> (CallContext, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel(16);
            let id = ClientId::from_raw(client);
            self.settings.update(id.clone(), settings);
            (CallContext::new(id, StreamHandle::new(tx)), rx)
        }
    }

    fn producer(topics: &[&str]) -> Settings {
        Settings {
            client_type: ClientType::Producer,
            publishing: Some(Publishing {
                topics: topics.iter().map(|t| Resource::new(*t)).collect(),
            }),
            subscription: None,
        }
    }

    fn push_consumer(topic: &str, expression: FilterExpression) -> Settings {
        Settings {
            client_type: ClientType::PushConsumer,
            publishing: None,
            subscription: Some(Subscription {
                subscriptions: vec![SubscriptionEntry {
                    topic: Resource::new(topic),
                    expression,
                }],
                message_model: None,
                consume_from_where: None,
            }),
        }
    }

    fn group(name: &str) -> Option<Resource> {
        Some(Resource::new(name))
    }

    #[tokio::test]
    async fn producer_heartbeat_then_termination() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("producer-1", producer(&["topic1", "topic2"]));
        assert_eq!(h.producers.group_count(), 0);

        let resp = h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();
        assert!(resp.status.is_ok());
        assert_eq!(h.producers.group_count(), 2);
        assert!(h.channels.contains(&ctx.client_id));

        h.service
            .notify_client_termination(&ctx, &NotifyClientTerminationRequest::default())
            .unwrap();
        assert_eq!(h.producers.group_count(), 0);
        assert!(!h.channels.contains(&ctx.client_id));
        assert!(h.settings.get(&ctx.client_id).is_none());
    }

    #[tokio::test]
    async fn repeated_producer_heartbeat_is_idempotent() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("producer-1", producer(&["topic1", "topic2"]));
        h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();
        h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();

        assert_eq!(h.producers.group_count(), 2);
        assert_eq!(h.producers.group_clients("topic1").len(), 1);
        assert_eq!(h.producers.group_clients("topic2").len(), 1);
        assert_eq!(h.channels.count(), 1);
    }

    #[tokio::test]
    async fn producer_registrations_share_one_channel() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("producer-1", producer(&["topic1", "topic2", "topic1"]));
        h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();

        let a = &h.producers.group_clients("topic1")[0];
        let b = &h.producers.group_clients("topic2")[0];
        assert_eq!(a.channel_id(), b.channel_id());
        assert_eq!(a.remote_addr(), "virtual://producer-1");
    }

    #[tokio::test]
    async fn consumer_heartbeat_registers_group() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("consumer-1", push_consumer("topic", FilterExpression::tag("*")));
        let request = HeartbeatRequest {
            group: group("consumerGroup"),
        };
        h.service.heartbeat(&ctx, &request).unwrap();

        let info = h.consumers.consumer_group_info("consumerGroup").unwrap();
        let sub = info.subscription("topic").unwrap();
        assert_eq!(sub.expression_type, EXPRESSION_TYPE_TAG);
        assert_eq!(sub.sub_string, SUB_ALL);
        assert_eq!(info.message_model, MessageModel::Clustering);
        assert_eq!(info.consume_from_where, ConsumeFromWhere::ConsumeFromLastOffset);
        assert_eq!(info.consume_type, ConsumeType::ConsumePassively);
        assert!(h.consumers.find_channel("consumerGroup", &ctx.client_id).is_some());

        h.service
            .notify_client_termination(
                &ctx,
                &NotifyClientTerminationRequest {
                    group: group("consumerGroup"),
                },
            )
            .unwrap();
        assert!(h.consumers.consumer_group_info("consumerGroup").is_none());
        assert!(h.consumers.find_channel("consumerGroup", &ctx.client_id).is_none());
        assert!(!h.channels.contains(&ctx.client_id));
    }

    #[tokio::test]
    async fn simple_consumer_consumes_actively() {
        let h = Harness::new();
        let mut settings = push_consumer("topic", FilterExpression::sql("a > 1"));
        settings.client_type = ClientType::SimpleConsumer;
        let (ctx, _rx) = h.connect("consumer-1", settings);
        h.service
            .heartbeat(&ctx, &HeartbeatRequest { group: group("g") })
            .unwrap();
        let info = h.consumers.consumer_group_info("g").unwrap();
        assert_eq!(info.consume_type, ConsumeType::ConsumeActively);
        assert_eq!(info.subscription("topic").unwrap().sub_string, "a > 1");
    }

    #[tokio::test]
    async fn group_termination_keeps_channel_with_other_registrations() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("consumer-1", push_consumer("topic", FilterExpression::tag("*")));
        h.service.heartbeat(&ctx, &HeartbeatRequest { group: group("g1") }).unwrap();
        h.service.heartbeat(&ctx, &HeartbeatRequest { group: group("g2") }).unwrap();

        h.service
            .notify_client_termination(&ctx, &NotifyClientTerminationRequest { group: group("g1") })
            .unwrap();
        assert!(h.consumers.find_channel("g1", &ctx.client_id).is_none());
        assert!(h.consumers.find_channel("g2", &ctx.client_id).is_some());
        assert!(h.channels.contains(&ctx.client_id));
    }

    #[tokio::test]
    async fn new_consumer_notifies_group_peers() {
        let h = Harness::new();
        let settings = push_consumer("topic", FilterExpression::tag("*"));
        let (first, mut first_rx) = h.connect("consumer-1", settings.clone());
        let (second, _second_rx) = h.connect("consumer-2", settings);
        let request = HeartbeatRequest { group: group("g") };
        h.service.heartbeat(&first, &request).unwrap();
        h.service.heartbeat(&second, &request).unwrap();

        let frame: serde_json::Value = serde_json::from_str(&first_rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame["params"]["kind"], "consumer_ids_changed");
        assert_eq!(frame["params"]["group"], "g");
    }

    #[tokio::test]
    async fn invalid_settings_register_nothing() {
        let h = Harness::new();

        let (ctx, _rx) = h.connect("c1", Settings::default());
        let err = h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap_err();
        assert_eq!(err.error_kind(), "invalid_client_settings");

        let (ctx, _rx) = h.connect("c2", producer(&["ok", " "]));
        assert!(h.service.heartbeat(&ctx, &HeartbeatRequest::default()).is_err());

        let (ctx, _rx) = h.connect("c3", push_consumer("topic", FilterExpression::tag("*")));
        assert!(h.service.heartbeat(&ctx, &HeartbeatRequest::default()).is_err());

        let (ctx, _rx) = h.connect("c4", push_consumer("topic", FilterExpression::sql("  ")));
        assert!(h.service.heartbeat(&ctx, &HeartbeatRequest { group: group("g") }).is_err());

        let mut twice = push_consumer("topic", FilterExpression::tag("a"));
        if let Some(sub) = twice.subscription.as_mut() {
            let dup = sub.subscriptions[0].clone();
            sub.subscriptions.push(dup);
        }
        let (ctx, _rx) = h.connect("c5", twice);
        assert!(h.service.heartbeat(&ctx, &HeartbeatRequest { group: group("g") }).is_err());

        assert_eq!(h.producers.group_count(), 0);
        assert_eq!(h.consumers.group_count(), 0);
        assert_eq!(h.channels.count(), 0);
    }

    #[tokio::test]
    async fn missing_settings_are_rejected() {
        let h = Harness::new();
        let (tx, _rx) = mpsc::channel(1);
        let ctx = CallContext::new(ClientId::from_raw("never-reported"), StreamHandle::new(tx));
        let err = h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidClientSettings(_)));
    }

    #[tokio::test]
    async fn terminating_unknown_client_is_noop() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("ghost", producer(&["t"]));
        let resp = h
            .service
            .notify_client_termination(&ctx, &NotifyClientTerminationRequest::default())
            .unwrap();
        assert!(resp.status.is_ok());
    }

    #[tokio::test]
    async fn termination_releases_telemetry() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("producer-1", producer(&["t"]));
        h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();
        let channel = h.channels.get(&ctx.client_id).unwrap();
        channel
            .write(LegacyCommand::request(request_code::CHECK_TRANSACTION_STATE))
            .unwrap();
        assert_eq!(h.telemetry.pending_count(&ctx.client_id), 1);

        h.service
            .notify_client_termination(&ctx, &NotifyClientTerminationRequest::default())
            .unwrap();
        assert_eq!(h.telemetry.pending_count(&ctx.client_id), 0);
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn scavenge_unregisters_idle_clients() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("producer-1", producer(&["t1", "t2"]));
        h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();

        let idle = Duration::from_secs(60);
        assert_eq!(h.service.scavenge_idle_clients(Instant::now(), idle), 0);
        assert_eq!(h.service.scavenge_idle_clients(Instant::now() + idle, idle), 1);
        assert_eq!(h.producers.group_count(), 0);
        assert!(!h.service.is_registered(&ctx.client_id));
    }

    #[tokio::test]
    async fn scavenge_spares_fresh_channel_after_reheartbeat() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("producer-1", producer(&["t"]));
        h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();
        let stale = h.channels.get(&ctx.client_id).unwrap();

        // The sweep removes the stale channel from the registry...
        let idle = Duration::from_secs(60);
        let removed = h.channels.scavenge(Instant::now() + idle, idle);
        assert_eq!(removed.len(), 1);

        // ...the client heartbeats again before the group tables are cleaned...
        h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();
        let fresh = h.channels.get(&ctx.client_id).unwrap();
        assert_ne!(stale.id(), fresh.id());

        // ...and the channel-scoped cleanup leaves the new registration alone.
        h.producers.unregister_channel(stale.id());
        let clients = h.producers.group_clients("t");
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].channel_id(), fresh.id());
    }

    #[tokio::test(start_paused = true)]
    async fn scavenger_stops_on_cancel() {
        let h = Harness::new();
        let cancel = CancellationToken::new();
        let handle = h.service.start_scavenger(
            Duration::from_millis(50),
            Duration::from_secs(60),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scavenger did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn registration_through_terminated_channel_is_rolled_back() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("producer-1", producer(&["t1", "t2"]));
        h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();
        let channel = h.channels.get(&ctx.client_id).unwrap();

        h.service
            .notify_client_termination(&ctx, &NotifyClientTerminationRequest::default())
            .unwrap();
        assert!(!channel.is_active());

        // A heartbeat that fetched the channel before termination registers late.
        let plan = plan_registration(&producer(&["t1", "t2"]), &HeartbeatRequest::default()).unwrap();
        assert!(!h.service.register(&ctx, &plan, channel));
        assert_eq!(h.producers.group_count(), 0);
        assert!(!h.channels.contains(&ctx.client_id));
    }

    #[test]
    fn heartbeat_racing_termination_leaves_no_orphaned_registration() {
        let h = Harness::new();
        let (ctx, _rx) = h.connect("producer-1", producer(&["t"]));

        for _ in 0..2_000 {
            h.settings.update(ctx.client_id.clone(), producer(&["t"]));
            h.service.heartbeat(&ctx, &HeartbeatRequest::default()).unwrap();

            let barrier = std::sync::Barrier::new(2);
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    let _ = h.service.heartbeat(&ctx, &HeartbeatRequest::default());
                });
                scope.spawn(|| {
                    barrier.wait();
                    h.service
                        .notify_client_termination(&ctx, &NotifyClientTerminationRequest::default())
                        .unwrap();
                });
            });

            let clients = h.producers.group_clients("t");
            assert!(clients.iter().all(|info| info.channel.is_active()));
            if !h.channels.contains(&ctx.client_id) {
                assert_eq!(h.producers.group_count(), 0);
            }
        }

        let idle = Duration::from_secs(1);
        h.service
            .scavenge_idle_clients(Instant::now() + Duration::from_secs(3600), idle);
        assert_eq!(h.producers.group_count(), 0);
        assert_eq!(h.channels.count(), 0);
    }
}
