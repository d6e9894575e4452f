//! Adapts RPC client sessions onto the broker's connection-oriented client registries.

pub mod channel;
pub mod context;
pub mod correlator;
pub mod lifecycle;
pub mod publish;
pub mod registry;
pub mod settings;
pub mod telemetry;
pub mod translate;

pub use channel::{ServerCommand, StreamHandle, VirtualChannel};
pub use context::CallContext;
pub use correlator::{CallMetadata, Correlator, InvocationContext, Pending};
pub use lifecycle::ClientService;
pub use publish::{ProducerService, RoundRobinSelector, SendMessageHook, WriteQueueSelector};
pub use registry::ChannelRegistry;
pub use settings::{SettingsCache, SettingsProvider};
pub use telemetry::{TelemetryCommandManager, TelemetrySessions};
pub use translate::{ResponseHandler, SendMessageResponseHandler};
