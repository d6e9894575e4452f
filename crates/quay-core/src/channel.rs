use std::fmt;

use crate::errors::ProxyError;
use crate::ids::ChannelId;
use crate::legacy::LegacyCommand;

/// Which transport backs a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// A real broker connection.
    Remote,
    /// An RPC session standing in for a connection.
    Virtual,
}

/// The capability set the broker's client registries need from a connection.
///
/// Registries hold `Arc<dyn Channel>` and never care which variant they got.
pub trait Channel: Send + Sync + fmt::Debug {
    /// Stable identity of this channel instance.
    fn id(&self) -> &ChannelId;

    /// Peer address. May be synthetic when there is no socket.
    fn remote_addr(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    /// False once the channel has been torn down.
    fn is_active(&self) -> bool;

    /// Hand a command to the peer without blocking.
    fn write(&self, command: LegacyCommand) -> Result<(), ProxyError>;
}
