use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use quay_core::legacy::request_code;
use quay_core::messages::{ConsumeFromWhere, FilterType, MessageModel};
use quay_core::{Channel, ChannelId, ClientId, LegacyCommand};
use serde::{Deserialize, Serialize};

use crate::client::ClientChannelInfo;

pub const SUB_ALL: &str = "*";
pub const EXPRESSION_TYPE_TAG: &str = "TAG";
pub const EXPRESSION_TYPE_SQL92: &str = "SQL92";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumeType {
    /// Client pulls on its own schedule.
    ConsumeActively,
    /// Broker side pushes to the client.
    ConsumePassively,
}

/// One topic subscription inside a consumer group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub topic: String,
    pub sub_string: String,
    pub expression_type: String,
    pub tags_set: BTreeSet<String>,
    pub code_set: BTreeSet<i32>,
    pub sub_version: i64,
}

impl SubscriptionData {
    /// Parse a filter expression into subscription data.
    pub fn build(topic: &str, expression: &str, filter_type: FilterType) -> Result<Self, String> {
        if topic.trim().is_empty() {
            return Err("subscription topic is empty".into());
        }
        let sub_version = Utc::now().timestamp_millis();
        match filter_type {
            FilterType::Tag => {
                let expression = expression.trim();
                let mut tags_set = BTreeSet::new();
                let mut code_set = BTreeSet::new();
                let sub_string = if expression.is_empty() || expression == SUB_ALL {
                    SUB_ALL.to_string()
                } else {
                    for tag in expression.split("||").map(str::trim).filter(|t| !t.is_empty()) {
                        code_set.insert(tag_hash_code(tag));
                        tags_set.insert(tag.to_string());
                    }
                    if tags_set.is_empty() {
                        return Err(format!("tag expression '{expression}' contains no tags"));
                    }
                    expression.to_string()
                };
                Ok(Self {
                    topic: topic.to_string(),
                    sub_string,
                    expression_type: EXPRESSION_TYPE_TAG.into(),
                    tags_set,
                    code_set,
                    sub_version,
                })
            }
            FilterType::Sql => {
                let expression = expression.trim();
                if expression.is_empty() {
                    return Err(format!("empty SQL filter for topic '{topic}'"));
                }
                Ok(Self {
                    topic: topic.to_string(),
                    sub_string: expression.to_string(),
                    expression_type: EXPRESSION_TYPE_SQL92.into(),
                    tags_set: BTreeSet::new(),
                    code_set: BTreeSet::new(),
                    sub_version,
                })
            }
        }
    }
}

/// Tag hash compatible with the broker's consume-queue tag codes.
fn tag_hash_code(tag: &str) -> i32 {
    tag.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
}

/// State for one consumer group.
#[derive(Clone, Debug)]
pub struct ConsumerGroupInfo {
    pub group_name: String,
    pub channels: HashMap<ClientId, ClientChannelInfo>,
    pub subscription_table: HashMap<String, SubscriptionData>,
    pub consume_type: ConsumeType,
    pub message_model: MessageModel,
    pub consume_from_where: ConsumeFromWhere,
    pub last_update: DateTime<Utc>,
}

impl ConsumerGroupInfo {
    fn new(
        group_name: &str,
        consume_type: ConsumeType,
        message_model: MessageModel,
        consume_from_where: ConsumeFromWhere,
    ) -> Self {
        Self {
            group_name: group_name.to_string(),
            channels: HashMap::new(),
            subscription_table: HashMap::new(),
            consume_type,
            message_model,
            consume_from_where,
            last_update: Utc::now(),
        }
    }

    pub fn subscription(&self, topic: &str) -> Option<&SubscriptionData> {
        self.subscription_table.get(topic)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Registration parameters declared by a consumer heartbeat.
#[derive(Clone, Debug)]
pub struct ConsumerRegistration {
    pub consume_type: ConsumeType,
    pub message_model: MessageModel,
    pub consume_from_where: ConsumeFromWhere,
    pub subscriptions: Vec<SubscriptionData>,
}

/// Consumer group table.
///
/// Membership changes are announced to the other members of the group with a
/// `NOTIFY_CONSUMER_IDS_CHANGED` command written on their channels.
#[derive(Default)]
pub struct ConsumerManager {
    groups: RwLock<HashMap<String, ConsumerGroupInfo>>,
}

impl ConsumerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a consumer. Returns true if the client was new to the group.
    pub fn register_consumer(
        &self,
        group: &str,
        info: ClientChannelInfo,
        registration: ConsumerRegistration,
    ) -> bool {
        let client_id = info.client_id.clone();
        let (is_new, peers) = {
            let mut groups = self.groups.write();
            let entry = groups.entry(group.to_string()).or_insert_with(|| {
                ConsumerGroupInfo::new(
                    group,
                    registration.consume_type,
                    registration.message_model,
                    registration.consume_from_where,
                )
            });
            entry.consume_type = registration.consume_type;
            entry.message_model = registration.message_model;
            entry.consume_from_where = registration.consume_from_where;
            entry.subscription_table = registration
                .subscriptions
                .into_iter()
                .map(|sub| (sub.topic.clone(), sub))
                .collect();
            entry.last_update = Utc::now();

            let is_new = entry.channels.insert(client_id.clone(), info).is_none();
            let peers = if is_new { peer_channels(entry, &client_id) } else { Vec::new() };
            (is_new, peers)
        };

        if is_new {
            tracing::info!(group, client_id = %client_id, "consumer registered");
            notify_ids_changed(group, &peers);
        }
        is_new
    }

    /// Remove a consumer from a group if it is still registered through `channel_id`.
    /// The group is dropped once its last client leaves.
    pub fn unregister_consumer(&self, group: &str, client_id: &ClientId, channel_id: &ChannelId) -> bool {
        let peers = {
            let mut groups = self.groups.write();
            let Some(info) = groups.get_mut(group) else {
                return false;
            };
            let matches = info
                .channels
                .get(client_id)
                .is_some_and(|c| c.channel_id() == channel_id);
            if !matches {
                return false;
            }
            info.channels.remove(client_id);
            if info.channels.is_empty() {
                groups.remove(group);
                tracing::info!(group, "consumer group removed, no clients left");
                Vec::new()
            } else {
                peer_channels(info, client_id)
            }
        };

        tracing::info!(group, client_id = %client_id, "consumer unregistered");
        notify_ids_changed(group, &peers);
        true
    }

    /// Drop every registration made through `channel_id`. Returns the affected groups.
    pub fn unregister_channel(&self, channel_id: &ChannelId) -> Vec<String> {
        let mut notifications = Vec::new();
        let mut affected = Vec::new();
        {
            let mut groups = self.groups.write();
            groups.retain(|group, info| {
                let before = info.channels.len();
                info.channels.retain(|_, c| c.channel_id() != channel_id);
                if info.channels.len() != before {
                    affected.push(group.clone());
                    if !info.channels.is_empty() {
                        let peers: Vec<_> = info.channels.values().map(|c| Arc::clone(&c.channel)).collect();
                        notifications.push((group.clone(), peers));
                    }
                }
                !info.channels.is_empty()
            });
        }
        for (group, peers) in &notifications {
            notify_ids_changed(group, peers);
        }
        affected.sort();
        affected
    }

    pub fn groups_for_channel(&self, channel_id: &ChannelId) -> Vec<String> {
        let groups = self.groups.read();
        let mut found: Vec<String> = groups
            .iter()
            .filter(|(_, info)| info.channels.values().any(|c| c.channel_id() == channel_id))
            .map(|(group, _)| group.clone())
            .collect();
        found.sort();
        found
    }

    pub fn find_channel(&self, group: &str, client_id: &ClientId) -> Option<ClientChannelInfo> {
        self.groups
            .read()
            .get(group)
            .and_then(|info| info.channels.get(client_id).cloned())
    }

    /// Snapshot of a group's state.
    pub fn consumer_group_info(&self, group: &str) -> Option<ConsumerGroupInfo> {
        self.groups.read().get(group).cloned()
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }
}

fn peer_channels(info: &ConsumerGroupInfo, except: &ClientId) -> Vec<Arc<dyn Channel>> {
    info.channels
        .iter()
        .filter(|(id, _)| *id != except)
        .map(|(_, c)| Arc::clone(&c.channel))
        .collect()
}

fn notify_ids_changed(group: &str, peers: &[Arc<dyn Channel>]) {
    for channel in peers {
        let command = LegacyCommand::request(request_code::NOTIFY_CONSUMER_IDS_CHANGED)
            .with_ext("consumerGroup", group);
        if let Err(e) = channel.write(command) {
            tracing::debug!(
                group,
                remote_addr = channel.remote_addr(),
                error = %e,
                "failed to notify consumer of membership change"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteChannel;
    use quay_core::messages::LanguageCode;
    use tokio::sync::mpsc;

    fn info(client: &str) -> (ClientChannelInfo, mpsc::Receiver<LegacyCommand>) {
        let (tx, rx) = mpsc::channel(8);
        let client_id = ClientId::from_raw(client);
        let channel: Arc<dyn Channel> = Arc::new(RemoteChannel::new(client_id.clone(), "127.0.0.1:1", tx));
        (ClientChannelInfo::new(channel, client_id, LanguageCode::Java, 1), rx)
    }

    fn registration(topic: &str) -> ConsumerRegistration {
        ConsumerRegistration {
            consume_type: ConsumeType::ConsumePassively,
            message_model: MessageModel::Clustering,
            consume_from_where: ConsumeFromWhere::ConsumeFromLastOffset,
            subscriptions: vec![SubscriptionData::build(topic, "*", FilterType::Tag).unwrap()],
        }
    }

    #[test]
    fn tag_expression_parsing() {
        let all = SubscriptionData::build("t", "*", FilterType::Tag).unwrap();
        assert_eq!(all.sub_string, "*");
        assert_eq!(all.expression_type, "TAG");
        assert!(all.tags_set.is_empty());

        let tags = SubscriptionData::build("t", "a || b ||c", FilterType::Tag).unwrap();
        assert_eq!(tags.tags_set.len(), 3);
        assert!(tags.tags_set.contains("c"));
        assert!(tags.code_set.contains(&tag_hash_code("a")));

        assert!(SubscriptionData::build("t", "||", FilterType::Tag).is_err());
        assert!(SubscriptionData::build("", "*", FilterType::Tag).is_err());
    }

    #[test]
    fn sql_expression_parsing() {
        let sql = SubscriptionData::build("t", "a > 5", FilterType::Sql).unwrap();
        assert_eq!(sql.expression_type, "SQL92");
        assert_eq!(sql.sub_string, "a > 5");
        assert!(SubscriptionData::build("t", "  ", FilterType::Sql).is_err());
    }

    #[test]
    fn tag_hash_matches_java_string_hash() {
        assert_eq!(tag_hash_code("TagA"), 2_598_919);
        assert_eq!(tag_hash_code(""), 0);
    }

    #[test]
    fn register_and_find() {
        let manager = ConsumerManager::new();
        let (c1, _rx) = info("c1");
        assert!(manager.register_consumer("group", c1.clone(), registration("topic")));
        assert!(!manager.register_consumer("group", c1.clone(), registration("topic")));

        let found = manager.find_channel("group", &c1.client_id).unwrap();
        assert_eq!(found.channel_id(), c1.channel_id());
        let group = manager.consumer_group_info("group").unwrap();
        assert_eq!(group.channels.len(), 1);
        assert_eq!(group.subscription("topic").unwrap().sub_string, "*");
    }

    #[test]
    fn refresh_replaces_subscriptions() {
        let manager = ConsumerManager::new();
        let (c1, _rx) = info("c1");
        manager.register_consumer("group", c1.clone(), registration("old"));
        manager.register_consumer("group", c1, registration("new"));
        let group = manager.consumer_group_info("group").unwrap();
        assert!(group.subscription("old").is_none());
        assert!(group.subscription("new").is_some());
    }

    #[test]
    fn membership_changes_notify_peers() {
        let manager = ConsumerManager::new();
        let (c1, mut rx1) = info("c1");
        let (c2, _rx2) = info("c2");
        manager.register_consumer("group", c1.clone(), registration("topic"));
        manager.register_consumer("group", c2.clone(), registration("topic"));

        let notice = rx1.try_recv().unwrap();
        assert_eq!(notice.code, request_code::NOTIFY_CONSUMER_IDS_CHANGED);
        assert_eq!(notice.ext("consumerGroup"), Some("group"));

        assert!(manager.unregister_consumer("group", &c2.client_id, c2.channel_id()));
        assert!(rx1.try_recv().is_ok());
    }

    #[test]
    fn last_member_leaving_removes_group() {
        let manager = ConsumerManager::new();
        let (c1, _rx) = info("c1");
        manager.register_consumer("group", c1.clone(), registration("topic"));
        assert_eq!(manager.groups_for_channel(c1.channel_id()), vec!["group"]);
        assert_eq!(manager.unregister_channel(c1.channel_id()), vec!["group"]);
        assert!(manager.consumer_group_info("group").is_none());
        assert_eq!(manager.group_count(), 0);
    }

    #[test]
    fn unregister_with_stale_channel_is_ignored() {
        let manager = ConsumerManager::new();
        let (old, _rx1) = info("c1");
        let (new, _rx2) = info("c1");
        manager.register_consumer("group", old.clone(), registration("topic"));
        manager.register_consumer("group", new.clone(), registration("topic"));
        assert!(!manager.unregister_consumer("group", &old.client_id, old.channel_id()));
        assert!(manager.find_channel("group", &new.client_id).is_some());
    }
}
