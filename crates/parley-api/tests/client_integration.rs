//! Integration tests for `Client` retry orchestration, streaming and metrics.
//!
//! A scripted provider replays one pre-configured outcome per attempt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use parley_api::{ChatEventStream, Client, RetryConfig};
use parley_types::{
    AnalyticsSink, ApiError, BoxFuture, CallContext, ChatRequest, ChatResponse, EventReceiver,
    Message, ModelInfo, Provider, RequestMetrics, ResponseMetrics, SinkError, StreamEvent, Usage,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

enum Attempt {
    /// Fail before any stream is opened.
    Fail(ApiError),
    /// Single-shot success.
    Reply(&'static str),
    /// Open a stream that emits these events, then closes.
    Stream(Vec<StreamEvent>),
    /// Open a stream that emits these events, then stays open until cancelled.
    StreamThenHang(Vec<StreamEvent>),
}

struct ScriptedProvider {
    attempts: Mutex<VecDeque<Attempt>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(attempts: Vec<Attempt>) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(attempts.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn next(&self) -> Attempt {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.attempts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Fail(ApiError::Other("script exhausted".into())))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Provider for ScriptedProvider {
    fn chat<'a>(
        &'a self,
        _ctx: &'a CallContext,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<ChatResponse, ApiError>> {
        let attempt = self.next();
        Box::pin(async move {
            match attempt {
                Attempt::Reply(text) => Ok(ChatResponse {
                    content: text.to_string(),
                    model: request.model.clone(),
                    usage: Some(Usage {
                        input_tokens: 11,
                        output_tokens: 3,
                    }),
                    ..ChatResponse::default()
                }),
                Attempt::Fail(err) => Err(err),
                _ => Err(ApiError::Other("unexpected stream attempt".into())),
            }
        })
    }

    fn chat_stream<'a>(
        &'a self,
        ctx: &'a CallContext,
        _request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<EventReceiver, ApiError>> {
        let attempt = self.next();
        let ctx = ctx.clone();
        Box::pin(async move {
            let (events, hang) = match attempt {
                Attempt::Fail(err) => return Err(err),
                Attempt::Stream(events) => (events, false),
                Attempt::StreamThenHang(events) => (events, true),
                Attempt::Reply(_) => return Err(ApiError::Other("unexpected chat attempt".into())),
            };
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                if hang {
                    ctx.done().await;
                }
            });
            Ok(rx)
        })
    }

    fn list_models<'a>(
        &'a self,
        _ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<Vec<ModelInfo>, ApiError>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn validate_credentials<'a>(
        &'a self,
        _ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<(), ApiError>> {
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// RecordingAnalytics
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingAnalytics {
    requests: Mutex<Vec<RequestMetrics>>,
    responses: Mutex<Vec<ResponseMetrics>>,
    fail: bool,
}

impl RecordingAnalytics {
    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    fn last_response(&self) -> ResponseMetrics {
        self.responses
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a response should have been logged")
    }
}

impl AnalyticsSink for RecordingAnalytics {
    fn log_request(&self, request: &RequestMetrics) -> Result<(), SinkError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(SinkError::Rejected("analytics down".into()));
        }
        Ok(())
    }

    fn log_response(
        &self,
        _request: &RequestMetrics,
        response: &ResponseMetrics,
    ) -> Result<(), SinkError> {
        self.responses.lock().unwrap().push(response.clone());
        if self.fail {
            return Err(SinkError::Rejected("analytics down".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
        jitter_max: Duration::from_millis(2),
        ..RetryConfig::default()
    }
}

fn make_client(provider: Arc<ScriptedProvider>, analytics: Arc<RecordingAnalytics>) -> Client {
    Client::builder()
        .provider(provider)
        .analytics(analytics)
        .retry_config(fast_retry())
        .build()
        .unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new(
        "test-model",
        vec![Message::system("be brief"), Message::user("hello")],
    )
}

fn unavailable() -> ApiError {
    ApiError::status(503, "unavailable", "scripted", false)
}

fn unauthorized() -> ApiError {
    ApiError::status(401, "invalid key", "scripted", false)
}

fn chunk(text: &str) -> StreamEvent {
    StreamEvent::Chunk(text.to_string())
}

async fn collect(rx: EventReceiver) -> Vec<StreamEvent> {
    ChatEventStream::new(rx).collect().await
}

fn chunks_of(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk(c) => Some(c.clone()),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chat_succeeds_first_try() {
    let provider = ScriptedProvider::new(vec![Attempt::Reply("hi there")]);
    let analytics = Arc::new(RecordingAnalytics::default());
    let client = make_client(provider.clone(), analytics.clone());

    let response = client.chat(&CallContext::new(), &request()).await.unwrap();
    assert_eq!(response.content, "hi there");
    assert_eq!(response.retry_count, 0);
    assert!(response.latency_ms.is_some());
    assert_eq!(provider.calls(), 1);

    let requests = analytics.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].stream);
    assert!(requests[0].has_system_message);
    assert_eq!(requests[0].last_user_message_len, 5);

    let metrics = analytics.last_response();
    assert!(metrics.success);
    assert_eq!(metrics.request_id, requests[0].request_id);
    assert_eq!(metrics.content_length, "hi there".len());
    assert_eq!(metrics.input_tokens, Some(11));
    assert_eq!(metrics.output_tokens, Some(3));
}

#[tokio::test]
async fn chat_retries_transient_failures() {
    let provider = ScriptedProvider::new(vec![
        Attempt::Fail(unavailable()),
        Attempt::Fail(ApiError::Network("connection reset".into())),
        Attempt::Reply("third time lucky"),
    ]);
    let analytics = Arc::new(RecordingAnalytics::default());
    let client = make_client(provider.clone(), analytics.clone());

    let response = client.chat(&CallContext::new(), &request()).await.unwrap();
    assert_eq!(response.content, "third time lucky");
    assert_eq!(response.retry_count, 2);
    assert_eq!(provider.calls(), 3);

    let metrics = analytics.last_response();
    assert!(metrics.success);
    assert_eq!(metrics.retry_count, 2);
}

#[tokio::test]
async fn chat_does_not_retry_unauthorized() {
    let provider = ScriptedProvider::new(vec![Attempt::Fail(unauthorized()), Attempt::Reply("never")]);
    let analytics = Arc::new(RecordingAnalytics::default());
    let client = make_client(provider.clone(), analytics.clone());

    let err = client.chat(&CallContext::new(), &request()).await.unwrap_err();
    assert_eq!(err.status_code(), Some(401));
    assert_eq!(provider.calls(), 1, "401 must not be retried");

    let metrics = analytics.last_response();
    assert!(!metrics.success);
    assert_eq!(metrics.status_code, Some(401));
    assert_eq!(metrics.error_type.as_deref(), Some("api_status"));
    assert_eq!(metrics.retry_count, 0);
}

#[tokio::test]
async fn chat_returns_last_error_when_exhausted() {
    let provider = ScriptedProvider::new(vec![
        Attempt::Fail(unavailable()),
        Attempt::Fail(unavailable()),
        Attempt::Fail(unavailable()),
        Attempt::Fail(ApiError::status(502, "bad gateway", "scripted", false)),
        Attempt::Reply("never"),
    ]);
    let client = make_client(provider.clone(), Arc::new(RecordingAnalytics::default()));

    let err = client.chat(&CallContext::new(), &request()).await.unwrap_err();
    assert_eq!(err.status_code(), Some(502));
    assert_eq!(provider.calls(), 4, "max_retries + 1 attempts");
}

#[tokio::test]
async fn chat_cancellation_preempts_backoff() {
    let provider = ScriptedProvider::new(vec![Attempt::Fail(unavailable()), Attempt::Reply("late")]);
    let client = Client::builder()
        .provider(provider.clone())
        .retry_config(RetryConfig {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            ..RetryConfig::default()
        })
        .build()
        .unwrap();

    let ctx = CallContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = client.chat(&ctx, &request()).await.unwrap_err();
    assert!(matches!(err, ApiError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn chat_analytics_failure_is_not_fatal() {
    let provider = ScriptedProvider::new(vec![Attempt::Reply("fine")]);
    let analytics = RecordingAnalytics::failing();
    let client = make_client(provider, analytics.clone());

    let response = client.chat(&CallContext::new(), &request()).await.unwrap();
    assert_eq!(response.content, "fine");
    assert_eq!(analytics.responses.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// ChatStream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stream_relays_chunks_then_done() {
    let provider = ScriptedProvider::new(vec![Attempt::Stream(vec![
        chunk("Hel"),
        chunk("lo"),
        StreamEvent::Done,
    ])]);
    let analytics = Arc::new(RecordingAnalytics::default());
    let client = make_client(provider, analytics.clone());

    let events = collect(client.chat_stream(CallContext::new(), request())).await;
    assert_eq!(chunks_of(&events), vec!["Hel", "lo"]);
    assert_eq!(events.len(), 3);
    assert!(matches!(events[2], StreamEvent::Done));

    let metrics = analytics.last_response();
    assert!(metrics.success);
    assert_eq!(metrics.chunk_count, 2);
    assert_eq!(metrics.content_length, 5);
    assert!(analytics.requests.lock().unwrap()[0].stream);
}

#[tokio::test]
async fn stream_retries_connect_failures() {
    let provider = ScriptedProvider::new(vec![
        Attempt::Fail(unavailable()),
        Attempt::Fail(unavailable()),
        Attempt::Stream(vec![chunk("third"), chunk(" attempt")]),
    ]);
    let analytics = Arc::new(RecordingAnalytics::default());
    let client = make_client(provider.clone(), analytics.clone());

    let events = collect(client.chat_stream(CallContext::new(), request())).await;

    // Only the third attempt's chunks, then a synthetic done.
    assert_eq!(chunks_of(&events), vec!["third", " attempt"]);
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert_eq!(provider.calls(), 3);

    let metrics = analytics.last_response();
    assert_eq!(metrics.retry_count, 2);
    assert!(metrics.success);
    assert!(!metrics.interrupted);
}

#[tokio::test]
async fn stream_mid_flight_failure_restarts_and_appends() {
    let provider = ScriptedProvider::new(vec![
        Attempt::Stream(vec![chunk("par"), StreamEvent::Error(unavailable())]),
        Attempt::Stream(vec![chunk("full answer"), StreamEvent::Done]),
    ]);
    let client = make_client(provider.clone(), Arc::new(RecordingAnalytics::default()));

    let events = collect(client.chat_stream(CallContext::new(), request())).await;

    // Chunks relayed before the failure are not retracted.
    assert_eq!(chunks_of(&events), vec!["par", "full answer"]);
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn stream_forwards_non_retryable_error() {
    let provider = ScriptedProvider::new(vec![
        Attempt::Stream(vec![chunk("x"), StreamEvent::Error(ApiError::StreamParse("bad".into()))]),
        Attempt::Stream(vec![chunk("never")]),
    ]);
    let analytics = Arc::new(RecordingAnalytics::default());
    let client = make_client(provider.clone(), analytics.clone());

    let mut rx = client.chat_stream(CallContext::new(), request());
    assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk(c)) if c == "x"));
    assert!(matches!(
        rx.recv().await,
        Some(StreamEvent::Error(ApiError::StreamParse(_)))
    ));
    assert!(rx.recv().await.is_none(), "channel closes after the error");
    assert_eq!(provider.calls(), 1);

    let metrics = analytics.last_response();
    assert!(!metrics.success);
    assert_eq!(metrics.error_type.as_deref(), Some("stream_parse"));
}

#[tokio::test]
async fn stream_exhausted_retries_deliver_last_error() {
    let provider = ScriptedProvider::new(vec![
        Attempt::Fail(unavailable()),
        Attempt::Fail(unavailable()),
        Attempt::Fail(unavailable()),
        Attempt::Fail(ApiError::status(429, "slow down", "scripted", false)),
    ]);
    let client = make_client(provider.clone(), Arc::new(RecordingAnalytics::default()));

    let events = collect(client.chat_stream(CallContext::new(), request())).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error(err) => assert_eq!(err.status_code(), Some(429)),
        other => panic!("Expected Error, got {other:?}"),
    }
    assert_eq!(provider.calls(), 4);
}

#[tokio::test]
async fn stream_cancellation_is_interrupt() {
    let provider = ScriptedProvider::new(vec![Attempt::StreamThenHang(vec![chunk("partial")])]);
    let analytics = Arc::new(RecordingAnalytics::default());
    let client = make_client(provider, analytics.clone());

    let ctx = CallContext::new();
    let mut rx = client.chat_stream(ctx.clone(), request());
    assert!(matches!(rx.recv().await, Some(StreamEvent::Chunk(c)) if c == "partial"));

    ctx.cancel();
    assert!(matches!(
        rx.recv().await,
        Some(StreamEvent::Error(ApiError::Cancelled))
    ));
    assert!(rx.recv().await.is_none());

    let metrics = analytics.last_response();
    assert!(metrics.interrupted);
    assert!(!metrics.success);
    assert_eq!(metrics.chunk_count, 1);
}

#[tokio::test]
async fn stream_returns_before_provider_is_called() {
    let provider = ScriptedProvider::new(vec![Attempt::Stream(vec![chunk("a")])]);
    let client = make_client(provider, Arc::new(RecordingAnalytics::default()));

    let ctx = CallContext::new();
    ctx.cancel();
    let events = collect(client.chat_stream(ctx, request())).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], StreamEvent::Error(ApiError::Cancelled)));
}
