//! The send-message pipeline: route every message, dispatch each one through
//! the legacy send path, translate the replies, and report the outcome to the
//! post-send hook exactly once.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::try_join_all;
use quay_broker::MessageDispatcher;
use quay_core::legacy::{ext, request_code, response_code, MessageQueue, SelectableQueue};
use quay_core::messages::{Message, SendMessageRequest, SendMessageResponse, Status};
use quay_core::{LegacyCommand, MessageId, ProxyError};

use crate::context::CallContext;
use crate::correlator::{CallMetadata, Correlator};
use crate::translate::SendMessageResponseHandler;

/// Chooses the destination queue for a single-message request. `None` forbids the send.
pub type WriteQueueSelector = Arc<
    dyn Fn(&CallContext, &SendMessageRequest) -> Result<Option<SelectableQueue>, ProxyError>
        + Send
        + Sync,
>;

/// Observes every send outcome: exactly one of response or error is present.
pub type SendMessageHook = Arc<
    dyn Fn(&CallContext, &SendMessageRequest, Option<&SendMessageResponse>, Option<&ProxyError>)
        + Send
        + Sync,
>;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(3);
const KEY_SEPARATOR: &str = " ";
const NAME_VALUE_SEPARATOR: char = '\u{1}';
const PROPERTY_SEPARATOR: char = '\u{2}';

fn route_nothing(
    _ctx: &CallContext,
    _request: &SendMessageRequest,
) -> Result<Option<SelectableQueue>, ProxyError> {
    Ok(None)
}

fn ignore_outcome(
    _ctx: &CallContext,
    _request: &SendMessageRequest,
    _response: Option<&SendMessageResponse>,
    _error: Option<&ProxyError>,
) {
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct ProducerService {
    dispatcher: Arc<dyn MessageDispatcher>,
    correlator: Arc<Correlator>,
    selector: WriteQueueSelector,
    hook: SendMessageHook,
    send_timeout: Duration,
    call_deadline: Option<Duration>,
}

impl ProducerService {
    /// A service that forbids every send until a selector is installed.
    pub fn new(dispatcher: Arc<dyn MessageDispatcher>, correlator: Arc<Correlator>) -> Self {
        Self {
            dispatcher,
            correlator,
            selector: Arc::new(route_nothing),
            hook: Arc::new(ignore_outcome),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            call_deadline: None,
        }
    }

    pub fn with_write_queue_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&CallContext, &SendMessageRequest) -> Result<Option<SelectableQueue>, ProxyError>
            + Send
            + Sync
            + 'static,
    {
        self.selector = Arc::new(selector);
        self
    }

    pub fn with_send_message_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallContext, &SendMessageRequest, Option<&SendMessageResponse>, Option<&ProxyError>)
            + Send
            + Sync
            + 'static,
    {
        self.hook = Arc::new(hook);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Bound the whole call, routing and every dispatch included. Expiry is a
    /// `Timeout` failure reported to the hook like any other.
    pub fn with_call_deadline(mut self, deadline: Duration) -> Self {
        self.call_deadline = Some(deadline);
        self
    }

    /// Publish a batch. Either every message is routed and dispatched, or the
    /// call fails before anything is sent.
    pub async fn send_message(
        &self,
        ctx: &CallContext,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, ProxyError> {
        let outcome = match self.call_deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.route_and_dispatch(ctx, &request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProxyError::Timeout(deadline)),
                }
            }
            None => self.route_and_dispatch(ctx, &request).await,
        };
        if let Err(e) = &outcome {
            tracing::info!(
                client_id = %ctx.client_id,
                messages = request.messages.len(),
                error_kind = e.error_kind(),
                error = %e,
                "send failed"
            );
        }
        self.observe(ctx, &request, outcome)
    }

    async fn route_and_dispatch(
        &self,
        ctx: &CallContext,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ProxyError> {
        if request.messages.is_empty() {
            return Err(ProxyError::InvalidArgument("send request carries no messages".into()));
        }

        let mut routed = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            let single = SendMessageRequest {
                messages: vec![message.clone()],
            };
            let queue = self.select(ctx, &single)?.ok_or_else(|| {
                ProxyError::Forbidden(format!(
                    "no writable queue for topic {}",
                    message.topic.qualified_name()
                ))
            })?;
            routed.push((message.clone(), queue));
        }

        let sends = routed
            .into_iter()
            .map(|(message, queue)| self.dispatch_one(ctx, message, queue));
        let responses = try_join_all(sends).await?;
        Ok(merge_responses(responses))
    }

    fn select(
        &self,
        ctx: &CallContext,
        request: &SendMessageRequest,
    ) -> Result<Option<SelectableQueue>, ProxyError> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.selector)(ctx, request))) {
            Ok(selected) => selected,
            Err(payload) => {
                let message = panic_message(payload);
                tracing::error!(client_id = %ctx.client_id, panic = %message, "write queue selector panicked");
                Err(ProxyError::Internal(format!("write queue selector panicked: {message}")))
            }
        }
    }

    async fn dispatch_one(
        &self,
        ctx: &CallContext,
        message: Message,
        queue: SelectableQueue,
    ) -> Result<SendMessageResponse, ProxyError> {
        let message_id = message
            .system_properties
            .message_id
            .clone()
            .unwrap_or_else(MessageId::new);
        let command = build_send_command(&message, &message_id, &queue);
        let metadata = CallMetadata {
            client_id: Some(ctx.client_id.clone()),
            message_id: Some(message_id),
        };
        let (invocation, mut pending) = self.correlator.create_context(
            SendMessageRequest {
                messages: vec![message],
            },
            metadata,
            SendMessageResponseHandler,
            Some(self.send_timeout),
        );
        let opaque = invocation.opaque();
        let command = command.with_opaque(opaque);

        let dispatch = async {
            match self.dispatcher.send_async(&queue, command, self.send_timeout).await {
                Ok(reply) => {
                    self.correlator.resolve(opaque, reply);
                }
                Err(e) => {
                    tracing::warn!(
                        invocation_id = %invocation.id(),
                        queue = %queue.queue,
                        error = %e,
                        "legacy dispatch failed"
                    );
                    self.correlator.fail(opaque, into_upstream(e));
                }
            }
        };

        // The watchdog or an out-of-band reply may settle the call before dispatch returns.
        tokio::select! {
            outcome = &mut pending => outcome,
            () = dispatch => pending.await,
        }
    }

    fn observe(
        &self,
        ctx: &CallContext,
        request: &SendMessageRequest,
        outcome: Result<SendMessageResponse, ProxyError>,
    ) -> Result<SendMessageResponse, ProxyError> {
        let fired = panic::catch_unwind(AssertUnwindSafe(|| {
            (self.hook)(ctx, request, outcome.as_ref().ok(), outcome.as_ref().err())
        }));
        match fired {
            Ok(()) => outcome,
            Err(payload) => {
                let message = panic_message(payload);
                tracing::error!(client_id = %ctx.client_id, panic = %message, "send hook panicked");
                Err(ProxyError::Internal(format!("send hook panicked: {message}")))
            }
        }
    }
}

fn into_upstream(error: ProxyError) -> ProxyError {
    match error {
        e @ ProxyError::UpstreamFailure { .. } => e,
        other => ProxyError::upstream(response_code::SYSTEM_ERROR, other.to_string()),
    }
}

fn build_send_command(message: &Message, message_id: &MessageId, queue: &SelectableQueue) -> LegacyCommand {
    let topic = message.topic.qualified_name();
    let born = message.system_properties.born_timestamp.unwrap_or_else(Utc::now);
    let mut command = LegacyCommand::request(request_code::SEND_MESSAGE)
        .with_ext(ext::PRODUCER_GROUP, topic.clone())
        .with_ext(ext::TOPIC, topic)
        .with_ext(ext::QUEUE_ID, queue.queue.queue_id.to_string())
        .with_ext(ext::MSG_ID, message_id.as_str())
        .with_ext(ext::BORN_TIMESTAMP, born.timestamp_millis().to_string())
        .with_body(message.body.clone());

    if let Some(tag) = &message.system_properties.tag {
        command = command.with_ext(ext::TAGS, tag.clone());
    }
    if !message.system_properties.keys.is_empty() {
        command = command.with_ext(ext::KEYS, message.system_properties.keys.join(KEY_SEPARATOR));
    }
    if !message.user_properties.is_empty() {
        let encoded: String = message
            .user_properties
            .iter()
            .map(|(name, value)| format!("{name}{NAME_VALUE_SEPARATOR}{value}{PROPERTY_SEPARATOR}"))
            .collect();
        command = command.with_ext(ext::PROPERTIES, encoded);
    }
    command
}

/// Receipts in request order; the status is the first failure, if any.
fn merge_responses(responses: Vec<SendMessageResponse>) -> SendMessageResponse {
    let status = responses
        .iter()
        .map(|r| &r.status)
        .find(|s| !s.is_ok())
        .cloned()
        .unwrap_or_else(Status::ok);
    let receipts = responses.into_iter().flat_map(|r| r.receipts).collect();
    SendMessageResponse { status, receipts }
}

/// Spreads sends across `queue_nums` queues of one broker, optionally only for
/// an allow-list of topics.
pub struct RoundRobinSelector {
    broker_name: String,
    broker_addr: String,
    queue_nums: i32,
    allowed_topics: Option<HashSet<String>>,
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(broker_name: impl Into<String>, broker_addr: impl Into<String>, queue_nums: i32) -> Self {
        Self {
            broker_name: broker_name.into(),
            broker_addr: broker_addr.into(),
            queue_nums,
            allowed_topics: None,
            counter: AtomicUsize::new(0),
        }
    }

    /// Only route these topics (qualified names). Anything else is forbidden.
    pub fn with_allowed_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn select(
        &self,
        _ctx: &CallContext,
        request: &SendMessageRequest,
    ) -> Result<Option<SelectableQueue>, ProxyError> {
        let Some(message) = request.messages.first() else {
            return Ok(None);
        };
        let topic = message.topic.qualified_name();
        if let Some(allowed) = &self.allowed_topics {
            if !allowed.contains(&topic) {
                return Ok(None);
            }
        }
        if self.queue_nums <= 0 {
            return Ok(None);
        }

        let turn = self.counter.fetch_add(1, Ordering::Relaxed);
        let queue_id = (turn % self.queue_nums as usize) as i32;
        Ok(Some(SelectableQueue::new(
            MessageQueue {
                topic,
                broker_name: self.broker_name.clone(),
                queue_id,
            },
            self.broker_addr.clone(),
        )))
    }
}
