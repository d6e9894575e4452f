pub mod channel;
pub mod errors;
pub mod ids;
pub mod legacy;
pub mod messages;

pub use channel::{Channel, ChannelKind};
pub use errors::{Code, ProxyError};
pub use ids::{ChannelId, ClientId, InvocationId, MessageId};
pub use legacy::LegacyCommand;
