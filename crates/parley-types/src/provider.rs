//! Contracts for the collaborators the gateway core depends on.

use crate::{
    ApiError, CallContext, ChatRequest, ChatResponse, Message, ModelInfo, RequestMetrics,
    ResponseMetrics, SinkError, StreamEvent,
};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receiving half of a stream channel.
pub type EventReceiver = mpsc::Receiver<StreamEvent>;

/// A chat-completion backend.
///
/// Backends translate the canonical request into their own wire format.
/// Dyn-compatible so the client works with `Arc<dyn Provider>`.
pub trait Provider: Send + Sync {
    /// Single-shot chat completion.
    fn chat<'a>(
        &'a self,
        ctx: &'a CallContext,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<ChatResponse, ApiError>>;

    /// Open a stream. Connect-time failures resolve to `Err`; failures after
    /// the stream is open arrive as a terminal `StreamEvent::Error`.
    fn chat_stream<'a>(
        &'a self,
        ctx: &'a CallContext,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<EventReceiver, ApiError>>;

    fn list_models<'a>(&'a self, ctx: &'a CallContext)
    -> BoxFuture<'a, Result<Vec<ModelInfo>, ApiError>>;

    fn validate_credentials<'a>(&'a self, ctx: &'a CallContext) -> BoxFuture<'a, Result<(), ApiError>>;

    /// Provider name for logging/display (e.g., "openai").
    fn name(&self) -> &str;
}

/// Receives request/response metrics. Calls are best-effort: callers log
/// failures and carry on.
pub trait AnalyticsSink: Send + Sync {
    fn log_request(&self, request: &RequestMetrics) -> Result<(), SinkError>;

    fn log_response(
        &self,
        request: &RequestMetrics,
        response: &ResponseMetrics,
    ) -> Result<(), SinkError>;
}

/// Stores finalized conversation messages.
pub trait PersistenceSink: Send + Sync {
    fn append_message<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), SinkError>>;
}
