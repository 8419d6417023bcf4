//! Shared types, collaborator contracts and error hierarchy for Parley.

pub mod context;
pub mod error;
pub mod message;
pub mod metrics;
pub mod provider;

pub use context::CallContext;
pub use error::{ApiError, ConfigError, GatewayError, SinkError};
pub use message::*;
pub use metrics::{RequestMetrics, ResponseMetrics};
pub use provider::{AnalyticsSink, BoxFuture, EventReceiver, PersistenceSink, Provider};
