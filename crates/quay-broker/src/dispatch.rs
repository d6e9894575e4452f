use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use quay_core::legacy::{ext, request_code, response_code, MessageQueue, SelectableQueue};
use quay_core::{LegacyCommand, ProxyError};

/// The legacy send path.
///
/// `Ok(None)` means the broker already wrote its reply to the requesting
/// client's channel, so no response travels back through this future.
#[async_trait]
pub trait MessageDispatcher: Send + Sync {
    async fn send_async(
        &self,
        queue: &SelectableQueue,
        command: LegacyCommand,
        timeout: Duration,
    ) -> Result<Option<LegacyCommand>, ProxyError>;
}

const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
const DEFAULT_RETAINED_PER_QUEUE: usize = 1024;

/// A message accepted by [`InMemoryBroker`].
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub msg_id: String,
    pub client_msg_id: Option<String>,
    pub offset: i64,
    pub tags: Option<String>,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueLog {
    next_offset: i64,
    recent: VecDeque<StoredMessage>,
}

/// Dispatcher that appends to in-process queues. Used when no broker is attached
/// and in tests.
pub struct InMemoryBroker {
    broker_name: String,
    queues: DashMap<MessageQueue, QueueLog>,
    max_message_size: usize,
    retained_per_queue: usize,
}

impl InMemoryBroker {
    pub fn new(broker_name: impl Into<String>) -> Self {
        Self {
            broker_name: broker_name.into(),
            queues: DashMap::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            retained_per_queue: DEFAULT_RETAINED_PER_QUEUE,
        }
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_retained_per_queue(mut self, count: usize) -> Self {
        self.retained_per_queue = count.max(1);
        self
    }

    pub fn broker_name(&self) -> &str {
        &self.broker_name
    }

    /// Next offset to be assigned on `queue` (0 for an unknown queue).
    pub fn max_offset(&self, queue: &MessageQueue) -> i64 {
        self.queues.get(queue).map(|log| log.next_offset).unwrap_or(0)
    }

    /// Most recently retained messages on `queue`, oldest first.
    pub fn recent_messages(&self, queue: &MessageQueue) -> Vec<StoredMessage> {
        self.queues
            .get(queue)
            .map(|log| log.recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn reject(command: &LegacyCommand, code: i32, remark: String) -> LegacyCommand {
        tracing::debug!(code, remark = %remark, "rejecting send");
        LegacyCommand::response(code, Some(remark)).with_opaque(command.opaque)
    }

    fn append(&self, queue: &MessageQueue, command: LegacyCommand) -> LegacyCommand {
        let mut log = self.queues.entry(queue.clone()).or_default();
        let offset = log.next_offset;
        log.next_offset += 1;

        let msg_id = format!("{}-{}-{:016X}", self.broker_name, queue.queue_id, offset);
        log.recent.push_back(StoredMessage {
            msg_id: msg_id.clone(),
            client_msg_id: command.ext(ext::MSG_ID).map(str::to_string),
            offset,
            tags: command.ext(ext::TAGS).map(str::to_string),
            body: command.body.clone(),
            stored_at: Utc::now(),
        });
        while log.recent.len() > self.retained_per_queue {
            log.recent.pop_front();
        }

        LegacyCommand::response(response_code::SUCCESS, None)
            .with_opaque(command.opaque)
            .with_ext(ext::MSG_ID, msg_id)
            .with_ext(ext::QUEUE_ID, queue.queue_id.to_string())
            .with_ext(ext::QUEUE_OFFSET, offset.to_string())
    }
}

#[async_trait]
impl MessageDispatcher for InMemoryBroker {
    async fn send_async(
        &self,
        queue: &SelectableQueue,
        command: LegacyCommand,
        _timeout: Duration,
    ) -> Result<Option<LegacyCommand>, ProxyError> {
        if command.code != request_code::SEND_MESSAGE {
            let remark = format!("request code {} not supported", command.code);
            return Ok(Some(Self::reject(&command, response_code::REQUEST_CODE_NOT_SUPPORTED, remark)));
        }
        if queue.queue.broker_name != self.broker_name {
            return Err(ProxyError::upstream(
                response_code::SERVICE_NOT_AVAILABLE,
                format!("broker {} is not served here", queue.queue.broker_name),
            ));
        }
        if command.ext(ext::TOPIC) != Some(queue.queue.topic.as_str()) {
            let remark = format!("message topic does not match queue {}", queue.queue);
            return Ok(Some(Self::reject(&command, response_code::MESSAGE_ILLEGAL, remark)));
        }
        if command.body.len() > self.max_message_size {
            let remark = format!(
                "message body {} bytes exceeds limit {}",
                command.body.len(),
                self.max_message_size
            );
            return Ok(Some(Self::reject(&command, response_code::MESSAGE_ILLEGAL, remark)));
        }

        Ok(Some(self.append(&queue.queue, command)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(topic: &str, id: i32) -> SelectableQueue {
        SelectableQueue::new(
            MessageQueue {
                topic: topic.into(),
                broker_name: "broker-a".into(),
                queue_id: id,
            },
            "127.0.0.1:10911",
        )
    }

    fn send(topic: &str, body: &[u8]) -> LegacyCommand {
        LegacyCommand::request(request_code::SEND_MESSAGE)
            .with_opaque(9)
            .with_ext(ext::TOPIC, topic)
            .with_ext(ext::MSG_ID, "client-id")
            .with_body(body.to_vec())
    }

    #[tokio::test]
    async fn assigns_sequential_offsets() {
        let broker = InMemoryBroker::new("broker-a");
        let q = queue("topic", 1);

        let first = broker
            .send_async(&q, send("topic", b"a"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let second = broker
            .send_async(&q, send("topic", b"b"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        assert!(first.is_response());
        assert_eq!(first.opaque, 9);
        assert_eq!(first.code, response_code::SUCCESS);
        assert_eq!(first.ext(ext::QUEUE_OFFSET), Some("0"));
        assert_eq!(second.ext(ext::QUEUE_OFFSET), Some("1"));
        assert_ne!(first.ext(ext::MSG_ID), Some("client-id"));
        assert_eq!(broker.max_offset(&q.queue), 2);

        let stored = broker.recent_messages(&q.queue);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].client_msg_id.as_deref(), Some("client-id"));
    }

    #[tokio::test]
    async fn rejects_topic_mismatch() {
        let broker = InMemoryBroker::new("broker-a");
        let resp = broker
            .send_async(&queue("topic", 0), send("other", b"x"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.code, response_code::MESSAGE_ILLEGAL);
        assert!(resp.remark.is_some());
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let broker = InMemoryBroker::new("broker-a").with_max_message_size(2);
        let resp = broker
            .send_async(&queue("topic", 0), send("topic", b"xyz"), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.code, response_code::MESSAGE_ILLEGAL);
    }

    #[tokio::test]
    async fn foreign_broker_is_upstream_failure() {
        let broker = InMemoryBroker::new("broker-b");
        let err = broker
            .send_async(&queue("topic", 0), send("topic", b"x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "upstream_failure");
    }

    #[tokio::test]
    async fn retention_is_bounded() {
        let broker = InMemoryBroker::new("broker-a").with_retained_per_queue(2);
        let q = queue("topic", 0);
        for _ in 0..5 {
            broker
                .send_async(&q, send("topic", b"x"), Duration::from_secs(1))
                .await
                .unwrap();
        }
        let stored = broker.recent_messages(&q.queue);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].offset, 4);
    }
}
