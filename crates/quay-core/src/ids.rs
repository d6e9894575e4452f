use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Client ids are normally supplied by the client (`from_raw`); `new()` exists for tests and tooling.
branded_id!(ClientId, "client");
branded_id!(ChannelId, "chan");
branded_id!(MessageId, "msg");
branded_id!(InvocationId, "inv");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_have_prefix() {
        assert!(ClientId::new().as_str().starts_with("client_"));
        assert!(ChannelId::new().as_str().starts_with("chan_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(InvocationId::new().as_str().starts_with("inv_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = ChannelId::new();
        let b = ChannelId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_preserves_client_supplied_value() {
        let id = ClientId::from_raw("10.0.0.7@4242#1");
        assert_eq!(id.as_str(), "10.0.0.7@4242#1");
        assert_eq!(id.to_string(), "10.0.0.7@4242#1");
    }

    #[test]
    fn serde_is_transparent() {
        let id = MessageId::from_raw("msgId");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"msgId\"");
        let parsed: MessageId = serde_json::from_str("\"msgId\"").unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<MessageId> = (0..50).map(|_| MessageId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
