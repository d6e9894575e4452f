//! Structured form of the broker's legacy request/response frames.
//!
//! Binary encoding lives with the broker connection; the proxy only works with
//! the decoded command.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod request_code {
    pub const SEND_MESSAGE: i32 = 10;
    pub const HEART_BEAT: i32 = 34;
    pub const UNREGISTER_CLIENT: i32 = 35;
    pub const CHECK_TRANSACTION_STATE: i32 = 39;
    pub const NOTIFY_CONSUMER_IDS_CHANGED: i32 = 40;
    pub const GET_CONSUMER_RUNNING_INFO: i32 = 307;
    pub const CONSUME_MESSAGE_DIRECTLY: i32 = 309;
}

pub mod response_code {
    pub const SUCCESS: i32 = 0;
    pub const SYSTEM_ERROR: i32 = 1;
    pub const SYSTEM_BUSY: i32 = 2;
    pub const REQUEST_CODE_NOT_SUPPORTED: i32 = 3;
    pub const FLUSH_DISK_TIMEOUT: i32 = 10;
    pub const SLAVE_NOT_AVAILABLE: i32 = 11;
    pub const FLUSH_SLAVE_TIMEOUT: i32 = 12;
    pub const MESSAGE_ILLEGAL: i32 = 13;
    pub const SERVICE_NOT_AVAILABLE: i32 = 14;
    pub const NO_PERMISSION: i32 = 16;
    pub const TOPIC_NOT_EXIST: i32 = 17;
}

/// Ext-field keys used on send requests and responses.
pub mod ext {
    pub const TOPIC: &str = "topic";
    pub const QUEUE_ID: &str = "queueId";
    pub const QUEUE_OFFSET: &str = "queueOffset";
    pub const MSG_ID: &str = "msgId";
    pub const TRANSACTION_ID: &str = "transactionId";
    pub const TAGS: &str = "tags";
    pub const KEYS: &str = "keys";
    pub const PRODUCER_GROUP: &str = "producerGroup";
    pub const BORN_TIMESTAMP: &str = "bornTimestamp";
    /// User properties, `name\u{1}value\u{2}` pairs.
    pub const PROPERTIES: &str = "properties";
}

const RESPONSE_TYPE_BIT: i32 = 0x1;

/// A decoded legacy command. `flag` bit 0 distinguishes responses from requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyCommand {
    pub code: i32,
    pub opaque: i32,
    pub flag: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ext_fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
}

impl LegacyCommand {
    pub fn request(code: i32) -> Self {
        Self {
            code,
            ..Default::default()
        }
    }

    pub fn response(code: i32, remark: Option<String>) -> Self {
        Self {
            code,
            flag: RESPONSE_TYPE_BIT,
            remark,
            ..Default::default()
        }
    }

    pub fn with_opaque(mut self, opaque: i32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_ext(mut self, key: &str, value: impl Into<String>) -> Self {
        self.ext_fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn is_response(&self) -> bool {
        self.flag & RESPONSE_TYPE_BIT == RESPONSE_TYPE_BIT
    }

    pub fn ext(&self, key: &str) -> Option<&str> {
        self.ext_fields.get(key).map(String::as_str)
    }
}

/// A partition of a topic on one broker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageQueue {
    pub topic: String,
    pub broker_name: String,
    pub queue_id: i32,
}

impl fmt::Display for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.topic, self.broker_name, self.queue_id)
    }
}

/// Routing decision produced by a write-queue selector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectableQueue {
    pub queue: MessageQueue,
    pub broker_addr: String,
}

impl SelectableQueue {
    pub fn new(queue: MessageQueue, broker_addr: impl Into<String>) -> Self {
        Self {
            queue,
            broker_addr: broker_addr.into(),
        }
    }
}
