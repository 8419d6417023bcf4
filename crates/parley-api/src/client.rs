//! Provider-agnostic chat client with retry orchestration and metrics.

use std::sync::Arc;

use parley_types::{
    AnalyticsSink, ApiError, CallContext, ChatRequest, ChatResponse, EventReceiver, GatewayError,
    ModelInfo, Provider, RequestMetrics, ResponseMetrics, StreamEvent,
};
use tokio::sync::mpsc;

use crate::http::{HttpConfig, build_http_client};
use crate::metrics::Exchange;
use crate::retry::{RetryConfig, RetryPolicy, sleep_with_context};

/// Capacity of the channel returned by [`Client::chat_stream`].
pub const STREAM_CHANNEL_CAPACITY: usize = 100;

/// Wraps one [`Provider`] and runs every call through a bounded retry loop.
///
/// Cheap to clone: clones share the provider, sinks, transport and policy.
#[derive(Clone)]
pub struct Client {
    provider: Arc<dyn Provider>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    http: reqwest::Client,
    retry: Arc<RetryPolicy>,
}

/// Builder for [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    provider: Option<Arc<dyn Provider>>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
    http: Option<reqwest::Client>,
    http_config: HttpConfig,
    retry_config: RetryConfig,
}

impl ClientBuilder {
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    /// Reuse an existing transport (and its connection pool).
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn http_config(mut self, config: HttpConfig) -> Self {
        self.http_config = config;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn build(self) -> Result<Client, GatewayError> {
        let provider = self.provider.ok_or(GatewayError::MissingProvider)?;
        let http = match self.http {
            Some(http) => http,
            None => build_http_client(&self.http_config)
                .map_err(|e| GatewayError::Construction(e.to_string()))?,
        };

        Ok(Client {
            provider,
            analytics: self.analytics,
            http,
            retry: Arc::new(RetryPolicy::new(self.retry_config)),
        })
    }
}

/// How one streaming attempt ended.
enum AttemptEnd {
    Completed,
    Failed(ApiError),
    Abandoned,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Create a client with the default transport and retry policy.
    pub fn new(
        provider: Arc<dyn Provider>,
        analytics: Option<Arc<dyn AnalyticsSink>>,
    ) -> Result<Self, GatewayError> {
        let builder = Self::builder().provider(provider);
        match analytics {
            Some(sink) => builder.analytics(sink).build(),
            None => builder.build(),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = Arc::new(RetryPolicy::new(config));
        self
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// The shared transport; clone it into backends to share the pool.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Single-shot chat with retries.
    ///
    /// Returns the last attempt's error unchanged when every attempt fails.
    /// Cancelling `ctx` interrupts both the in-flight attempt and any pending
    /// backoff sleep.
    pub async fn chat(
        &self,
        ctx: &CallContext,
        request: &ChatRequest,
    ) -> Result<ChatResponse, ApiError> {
        let mut exchange = Exchange::start(request, self.provider.name(), false);
        self.log_request(exchange.request());

        let max_attempts = self.retry.max_retries() + 1;
        let mut attempt = 0;
        let result = loop {
            tracing::debug!(
                "{} chat (attempt {}/{max_attempts})",
                self.provider.name(),
                attempt + 1
            );

            let outcome = tokio::select! {
                biased;
                err = ctx.done() => Err(err),
                outcome = self.provider.chat(ctx, request) => outcome,
            };

            let err = match outcome {
                Ok(response) => break Ok(response),
                Err(err) => err,
            };

            if !self.retry.should_retry(&err, attempt) {
                break Err(err);
            }

            let delay = self.retry.compute_backoff(attempt);
            tracing::warn!(
                "Retryable error from {} (attempt {}/{max_attempts}): {err}. Retrying in {}ms...",
                self.provider.name(),
                attempt + 1,
                delay.as_millis(),
            );
            if let Err(cancelled) = sleep_with_context(ctx, delay).await {
                break Err(cancelled);
            }
            attempt += 1;
            exchange.retry_count = attempt;
        };

        match result {
            Ok(mut response) => {
                response.latency_ms = Some(exchange.elapsed_ms());
                response.retry_count = attempt;
                exchange.record_content(&response.content);
                let metrics = exchange.succeeded(response.usage);
                self.log_response(exchange.request(), &metrics);
                Ok(response)
            }
            Err(err) => {
                let metrics = exchange.failed(&err);
                self.log_response(exchange.request(), &metrics);
                Err(err)
            }
        }
    }

    /// Streaming chat with retries. Returns immediately; the work runs in a
    /// background task.
    ///
    /// The channel carries content chunks in provider order and ends with
    /// exactly one terminal event: `Done` or `Error`. When a retryable failure
    /// happens after some chunks were relayed, the next attempt starts a fresh
    /// provider stream and its chunks follow the ones already delivered; those
    /// are not retracted.
    pub fn chat_stream(&self, ctx: CallContext, mut request: ChatRequest) -> EventReceiver {
        request.stream = true;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let client = self.clone();
        tokio::spawn(async move { client.run_stream(ctx, request, tx).await });
        rx
    }

    pub async fn list_models(&self, ctx: &CallContext) -> Result<Vec<ModelInfo>, ApiError> {
        self.provider.list_models(ctx).await
    }

    pub async fn validate_credentials(&self, ctx: &CallContext) -> Result<(), ApiError> {
        self.provider.validate_credentials(ctx).await
    }

    async fn run_stream(
        self,
        ctx: CallContext,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let mut exchange = Exchange::start(&request, self.provider.name(), true);
        self.log_request(exchange.request());

        let max_attempts = self.retry.max_retries() + 1;
        let mut attempt = 0;
        let end = loop {
            tracing::debug!(
                "{} stream (attempt {}/{max_attempts})",
                self.provider.name(),
                attempt + 1
            );

            let err = match self.stream_attempt(&ctx, &request, &tx, &mut exchange).await {
                AttemptEnd::Failed(err) => err,
                other => break other,
            };

            if !self.retry.should_retry(&err, attempt) {
                break AttemptEnd::Failed(err);
            }

            let delay = self.retry.compute_backoff(attempt);
            tracing::warn!(
                "Retryable stream error from {} (attempt {}/{max_attempts}): {err}. Retrying in {}ms...",
                self.provider.name(),
                attempt + 1,
                delay.as_millis(),
            );
            if let Err(cancelled) = sleep_with_context(&ctx, delay).await {
                break AttemptEnd::Failed(cancelled);
            }
            attempt += 1;
            exchange.retry_count = attempt;
        };

        // Metrics are recorded before the terminal event is published.
        match end {
            AttemptEnd::Completed => {
                let metrics = exchange.succeeded(None);
                self.log_response(exchange.request(), &metrics);
                let _ = tx.send(StreamEvent::Done).await;
            }
            AttemptEnd::Failed(err) => {
                let metrics = exchange.failed(&err);
                self.log_response(exchange.request(), &metrics);
                let _ = tx.send(StreamEvent::Error(err)).await;
            }
            AttemptEnd::Abandoned => {
                tracing::debug!("Stream receiver dropped; stopping");
                let metrics = exchange.abandoned();
                self.log_response(exchange.request(), &metrics);
            }
        }
    }

    /// Relay one provider stream into `tx`.
    async fn stream_attempt(
        &self,
        ctx: &CallContext,
        request: &ChatRequest,
        tx: &mpsc::Sender<StreamEvent>,
        exchange: &mut Exchange,
    ) -> AttemptEnd {
        let opened = tokio::select! {
            biased;
            err = ctx.done() => return AttemptEnd::Failed(err),
            opened = self.provider.chat_stream(ctx, request) => opened,
        };
        let mut events = match opened {
            Ok(events) => events,
            Err(err) => return AttemptEnd::Failed(err),
        };

        loop {
            let event = tokio::select! {
                biased;
                err = ctx.done() => return AttemptEnd::Failed(err),
                event = events.recv() => event,
            };

            match event {
                Some(StreamEvent::Chunk(content)) => {
                    exchange.record_chunk(&content);
                    tokio::select! {
                        biased;
                        err = ctx.done() => return AttemptEnd::Failed(err),
                        sent = tx.send(StreamEvent::Chunk(content)) => {
                            if sent.is_err() {
                                return AttemptEnd::Abandoned;
                            }
                        }
                    }
                }
                // A provider channel that closes without an error is a clean finish.
                Some(StreamEvent::Done) | None => return AttemptEnd::Completed,
                Some(StreamEvent::Error(err)) => return AttemptEnd::Failed(err),
            }
        }
    }

    fn log_request(&self, metrics: &RequestMetrics) {
        if let Some(sink) = &self.analytics {
            if let Err(e) = sink.log_request(metrics) {
                tracing::warn!("Failed to log request metrics: {e}");
            }
        }
    }

    fn log_response(&self, request: &RequestMetrics, response: &ResponseMetrics) {
        if let Some(sink) = &self.analytics {
            if let Err(e) = sink.log_response(request, response) {
                tracing::warn!("Failed to log response metrics: {e}");
            }
        }
    }
}
