//! Typed RPC records exchanged with clients.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Code;
use crate::ids::MessageId;

/// A namespaced resource name (topic or group).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_namespace: String,
    pub name: String,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            resource_namespace: String::new(),
            name: name.into(),
        }
    }

    pub fn with_namespace(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Broker-side name: `namespace%name`, or just `name` without a namespace.
    pub fn qualified_name(&self) -> String {
        if self.resource_namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}%{}", self.resource_namespace, self.name)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientType {
    #[default]
    Unspecified,
    Producer,
    PushConsumer,
    SimpleConsumer,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterType {
    #[default]
    Tag,
    Sql,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterExpression {
    #[serde(rename = "type", default)]
    pub filter_type: FilterType,
    pub expression: String,
}

impl FilterExpression {
    pub fn tag(expression: impl Into<String>) -> Self {
        Self {
            filter_type: FilterType::Tag,
            expression: expression.into(),
        }
    }

    pub fn sql(expression: impl Into<String>) -> Self {
        Self {
            filter_type: FilterType::Sql,
            expression: expression.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub topic: Resource,
    pub expression: FilterExpression,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageModel {
    #[default]
    Clustering,
    Broadcasting,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumeFromWhere {
    #[default]
    ConsumeFromLastOffset,
    ConsumeFromFirstOffset,
    ConsumeFromTimestamp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publishing {
    #[serde(default)]
    pub topics: Vec<Resource>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_model: Option<MessageModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consume_from_where: Option<ConsumeFromWhere>,
}

/// Settings a client declares about itself; looked up by client id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub client_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publishing: Option<Publishing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LanguageCode {
    #[default]
    Java,
    Cpp,
    Dotnet,
    Golang,
    Rust,
    Python,
    Nodejs,
    Other,
}

impl fmt::Display for LanguageCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Java => "JAVA",
            Self::Cpp => "CPP",
            Self::Dotnet => "DOTNET",
            Self::Golang => "GOLANG",
            Self::Rust => "RUST",
            Self::Python => "PYTHON",
            Self::Nodejs => "NODEJS",
            Self::Other => "OTHER",
        };
        f.write_str(s)
    }
}

impl FromStr for LanguageCode {
    type Err = std::convert::Infallible;

    /// Unknown languages map to `Other` rather than failing the connection.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "JAVA" => Self::Java,
            "CPP" => Self::Cpp,
            "DOTNET" => Self::Dotnet,
            "GOLANG" | "GO" => Self::Golang,
            "RUST" => Self::Rust,
            "PYTHON" => Self::Python,
            "NODEJS" => Self::Nodejs,
            _ => Self::Other,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: "OK".into(),
        }
    }

    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

// --- Client lifecycle ---

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Resource>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: Status,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyClientTerminationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Resource>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyClientTerminationResponse {
    pub status: Status,
}

// --- Publishing ---

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub born_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: Resource,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub system_properties: SystemProperties,
    #[serde(default)]
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Per-message outcome of a send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transaction_id: String,
    pub queue_id: i32,
    pub offset: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub status: Status,
    #[serde(default)]
    pub receipts: Vec<SendReceipt>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_from_client_json() {
        let json = r#"{
            "client_type": "PUSH_CONSUMER",
            "subscription": {
                "subscriptions": [
                    {"topic": {"name": "topic"}, "expression": {"type": "TAG", "expression": "*"}}
                ]
            }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.client_type, ClientType::PushConsumer);
        let sub = settings.subscription.unwrap();
        assert_eq!(sub.subscriptions[0].expression, FilterExpression::tag("*"));
        assert!(sub.message_model.is_none());
    }

    #[test]
    fn missing_client_type_defaults_to_unspecified() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.client_type, ClientType::Unspecified);
    }

    #[test]
    fn language_code_parsing() {
        assert_eq!("java".parse::<LanguageCode>().unwrap(), LanguageCode::Java);
        assert_eq!("GO".parse::<LanguageCode>().unwrap(), LanguageCode::Golang);
        assert_eq!("cobol".parse::<LanguageCode>().unwrap(), LanguageCode::Other);
        assert_eq!(LanguageCode::Rust.to_string(), "RUST");
    }

    #[test]
    fn send_request_defaults() {
        let req: SendMessageRequest =
            serde_json::from_str(r#"{"messages":[{"topic":{"name":"t"}}]}"#).unwrap();
        assert_eq!(req.messages.len(), 1);
        assert!(req.messages[0].system_properties.message_id.is_none());
        assert!(req.messages[0].body.is_empty());
    }

    #[test]
    fn qualified_resource_names() {
        assert_eq!(Resource::new("topic").qualified_name(), "topic");
        assert_eq!(Resource::with_namespace("ns", "topic").qualified_name(), "ns%topic");
    }

    #[test]
    fn status_ok() {
        assert!(Status::ok().is_ok());
        assert!(!Status::new(Code::Forbidden, "no").is_ok());
    }
}
