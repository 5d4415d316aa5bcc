pub mod broadcast;
pub mod config;
pub mod context;
pub mod error;
pub mod execution;
pub mod logging;

pub use broadcast::{BroadcastHub, BroadcastMessage, MessageType, Subscription};
pub use config::{LoginMode, NimbusConfig};
pub use context::{
    ContextMapping, ContextState, ContextStatus, Identity, LogicalEnv, ProviderKind,
};
pub use error::{ErrorCategory, NimbusError};
pub use execution::{
    CommandExecution, CommandResult, ComponentStatus, ExecutionRecorder, HealthStatus,
    OutputChunk, OutputStream, StatusReport, TIMEOUT_EXIT_STATUS,
};
