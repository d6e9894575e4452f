//! Broker-side collaborators the proxy registers clients into and dispatches through.

pub mod client;
pub mod consumer;
pub mod dispatch;
pub mod producer;
pub mod remote;

pub use client::ClientChannelInfo;
pub use consumer::{ConsumeType, ConsumerGroupInfo, ConsumerManager, ConsumerRegistration, SubscriptionData};
pub use dispatch::{InMemoryBroker, MessageDispatcher, StoredMessage};
pub use producer::ProducerManager;
pub use remote::RemoteChannel;
