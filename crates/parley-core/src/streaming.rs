//! Bridges a retrying chat stream into one mutable session state.
//!
//! A [`StreamingManager`] owns at most one in-flight stream. Each stream gets
//! a fresh [`StreamingState`], a context derived from the manager's parent,
//! a watcher task that maps an interrupt signal onto that context, and a
//! drain task that accumulates chunks until the stream completes, fails or is
//! interrupted.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_api::Client;
use parley_types::{
    ApiError, CallContext, ChatRequest, EventReceiver, GatewayError, Message, PersistenceSink,
    StreamEvent,
};
use tokio::sync::{mpsc, oneshot, watch};

/// How long finalize waits for room in a full update channel before dropping
/// the terminal update.
pub const TERMINAL_UPDATE_TIMEOUT: Duration = Duration::from_secs(1);

/// Where a stream is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    /// No stream has started.
    #[default]
    Idle,
    Active,
    Complete,
    Error,
    Interrupted,
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Interrupted)
    }
}

/// Accumulated state of the current (or most recent) stream.
#[derive(Debug, Clone, Default)]
pub struct StreamingState {
    pub phase: StreamPhase,
    /// Cleared as soon as an interrupt is requested, before the drain task
    /// finalizes.
    pub active: bool,
    pub buffer: String,
    pub chunk_count: usize,
    pub total_bytes: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_chunk_at: Option<DateTime<Utc>>,
    pub error: Option<ApiError>,
    pub interrupted: bool,
    /// The assistant message materialized on completion.
    pub message: Option<Message>,
}

impl StreamingState {
    fn started() -> Self {
        Self {
            phase: StreamPhase::Active,
            active: true,
            started_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    fn record_chunk(&mut self, content: &str) {
        self.buffer.push_str(content);
        self.chunk_count += 1;
        self.total_bytes += content.len();
        self.last_chunk_at = Some(Utc::now());
    }
}

/// Notifications published while a stream runs.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Chunk(String),
    /// Best-effort; dropped when the consumer lags.
    Progress { chunk_count: usize, total_bytes: usize },
    Completed(Message),
    Failed(ApiError),
    /// The partial buffer is kept for inspection only.
    Interrupted { partial: String },
}

impl StreamUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed(_) | Self::Failed(_) | Self::Interrupted { .. }
        )
    }
}

struct ActiveStream {
    ctx: CallContext,
    interrupt: Option<oneshot::Sender<()>>,
    /// Turns terminal once the drain task has delivered its last update.
    phase: watch::Receiver<StreamPhase>,
}

impl ActiveStream {
    fn finished(&self) -> bool {
        // A closed channel means the drain task is gone.
        self.phase.borrow().is_terminal() || self.phase.has_changed().is_err()
    }
}

/// Runs one stream at a time on behalf of a session.
pub struct StreamingManager {
    parent: CallContext,
    client: Option<Client>,
    persistence: Option<Arc<dyn PersistenceSink>>,
    updates: Option<mpsc::Sender<StreamUpdate>>,
    state: Arc<Mutex<StreamingState>>,
    active: Mutex<Option<ActiveStream>>,
}

impl StreamingManager {
    pub fn new(parent: CallContext) -> Self {
        Self {
            parent,
            client: None,
            persistence: None,
            updates: None,
            state: Arc::new(Mutex::new(StreamingState::default())),
            active: Mutex::new(None),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Completed assistant messages are appended here.
    pub fn with_persistence(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.persistence = Some(sink);
        self
    }

    pub fn with_updates(mut self, updates: mpsc::Sender<StreamUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn bind_client(&mut self, client: Client) {
        self.client = Some(client);
    }

    /// Start streaming `request` in the background.
    ///
    /// Fails with [`GatewayError::NoClient`] when no client is bound and with
    /// [`GatewayError::StreamInProgress`] until the previous stream's drain
    /// task has finished, including delivery of its terminal update.
    pub fn start_streaming(&self, request: ChatRequest) -> Result<(), GatewayError> {
        let client = self.client.clone().ok_or(GatewayError::NoClient)?;

        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|stream| !stream.finished()) {
            return Err(GatewayError::StreamInProgress);
        }
        *lock(&self.state) = StreamingState::started();

        let ctx = self.parent.child();
        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        tokio::spawn(watch_interrupt(ctx.clone(), interrupt_rx));

        let (phase_tx, phase_rx) = watch::channel(StreamPhase::Active);
        let events = client.chat_stream(ctx.clone(), request);
        let drain = Drain {
            ctx: ctx.clone(),
            state: Arc::clone(&self.state),
            persistence: self.persistence.clone(),
            updates: self.updates.clone(),
            phase: phase_tx,
        };
        tokio::spawn(drain.run(events));

        tracing::debug!("Stream started");
        *active = Some(ActiveStream {
            ctx,
            interrupt: Some(interrupt_tx),
            phase: phase_rx,
        });
        Ok(())
    }

    /// Interrupt the active stream. A no-op when nothing is streaming.
    ///
    /// The state is marked interrupted immediately; the watcher task cancels
    /// the stream's context.
    pub fn interrupt_streaming(&self) {
        let mut active = lock(&self.active);
        let Some(stream) = active.as_mut() else {
            return;
        };

        {
            let mut state = lock(&self.state);
            if state.phase != StreamPhase::Active {
                return;
            }
            state.interrupted = true;
            state.active = false;
        }

        if let Some(signal) = stream.interrupt.take() {
            let _ = signal.send(());
        }
        tracing::debug!("Stream interrupt requested");
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.state).active
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> StreamingState {
        lock(&self.state).clone()
    }

    /// The derived context of the most recent stream.
    pub fn stream_context(&self) -> Option<CallContext> {
        lock(&self.active).as_ref().map(|s| s.ctx.clone())
    }

    /// Wait for the most recent stream to finalize and return its phase.
    ///
    /// Resolves once the terminal update has been delivered or dropped, so a
    /// new stream can be started right after. Cancel-safe: dropping the future leaves the stream running.
    pub async fn wait(&self) -> StreamPhase {
        let phase = lock(&self.active).as_ref().map(|s| s.phase.clone());
        let Some(mut phase) = phase else {
            return lock(&self.state).phase;
        };

        match phase.wait_for(|p| p.is_terminal()).await {
            Ok(terminal) => *terminal,
            Err(_) => {
                tracing::error!("Stream task ended without finalizing");
                let mut state = lock(&self.state);
                state.phase = StreamPhase::Error;
                state.active = false;
                StreamPhase::Error
            }
        }
    }
}

impl Drop for StreamingManager {
    fn drop(&mut self) {
        if let Some(stream) = lock(&self.active).as_ref() {
            stream.ctx.cancel();
        }
    }
}

/// Map the one-shot interrupt signal onto context cancellation.
async fn watch_interrupt(ctx: CallContext, signal: oneshot::Receiver<()>) {
    tokio::select! {
        biased;
        _ = ctx.done() => {}
        received = signal => {
            if received.is_ok() {
                ctx.cancel();
            }
        }
    }
}

/// How the drain loop ended, before the finalize gate.
enum Outcome {
    Complete,
    Failed(ApiError),
    Interrupted,
}

struct Drain {
    ctx: CallContext,
    state: Arc<Mutex<StreamingState>>,
    persistence: Option<Arc<dyn PersistenceSink>>,
    updates: Option<mpsc::Sender<StreamUpdate>>,
    phase: watch::Sender<StreamPhase>,
}

impl Drain {
    async fn run(self, mut events: EventReceiver) -> StreamPhase {
        let outcome = loop {
            let event = tokio::select! {
                biased;
                err = self.ctx.done() => break context_outcome(err),
                event = events.recv() => event,
            };

            match event {
                Some(StreamEvent::Chunk(content)) => {
                    let (chunk_count, total_bytes) = {
                        let mut state = lock(&self.state);
                        state.record_chunk(&content);
                        (state.chunk_count, state.total_bytes)
                    };
                    if let Some(err) = self.publish_chunk(content).await {
                        break context_outcome(err);
                    }
                    self.publish_progress(chunk_count, total_bytes);
                }
                Some(StreamEvent::Done) => break Outcome::Complete,
                Some(StreamEvent::Error(err)) if err.is_context() => {
                    break context_outcome(err);
                }
                Some(StreamEvent::Error(err)) => break Outcome::Failed(err),
                None => match self.ctx.error() {
                    Some(err) => break context_outcome(err),
                    None => {
                        break Outcome::Failed(ApiError::Other(
                            "Stream closed without a terminal event".into(),
                        ));
                    }
                },
            }
        };

        let phase = self.finalize(outcome).await;
        self.ctx.cancel();
        self.phase.send_replace(phase);
        phase
    }

    /// The single finalize gate: only the first transition out of `Active`
    /// takes effect.
    async fn finalize(&self, outcome: Outcome) -> StreamPhase {
        let update = {
            let mut state = lock(&self.state);
            if state.phase != StreamPhase::Active {
                return state.phase;
            }
            state.active = false;

            // An interrupt request wins over a completion that raced it.
            let outcome = match outcome {
                Outcome::Complete if state.interrupted => Outcome::Interrupted,
                other => other,
            };

            match outcome {
                Outcome::Complete => {
                    let message = Message::assistant(state.buffer.clone());
                    state.phase = StreamPhase::Complete;
                    state.message = Some(message.clone());
                    StreamUpdate::Completed(message)
                }
                Outcome::Failed(err) => {
                    state.phase = StreamPhase::Error;
                    state.error = Some(err.clone());
                    StreamUpdate::Failed(err)
                }
                Outcome::Interrupted => {
                    state.phase = StreamPhase::Interrupted;
                    state.interrupted = true;
                    StreamUpdate::Interrupted {
                        partial: state.buffer.clone(),
                    }
                }
            }
        };

        let phase = match &update {
            StreamUpdate::Completed(message) => {
                tracing::debug!("Stream complete ({} bytes)", message.content.len());
                self.persist(message).await;
                StreamPhase::Complete
            }
            StreamUpdate::Failed(err) => {
                tracing::warn!("Stream failed: {err}");
                StreamPhase::Error
            }
            _ => {
                tracing::debug!("Stream interrupted");
                StreamPhase::Interrupted
            }
        };

        self.deliver_terminal(update).await;
        phase
    }

    /// Bounded: a consumer that stops reading cannot hold the stream open.
    async fn deliver_terminal(&self, update: StreamUpdate) {
        let Some(updates) = &self.updates else {
            return;
        };
        match tokio::time::timeout(TERMINAL_UPDATE_TIMEOUT, updates.send(update)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::debug!("Update receiver dropped before terminal update"),
            Err(_) => tracing::warn!(
                "Update channel full for {:?}; dropping terminal update",
                TERMINAL_UPDATE_TIMEOUT
            ),
        }
    }

    async fn persist(&self, message: &Message) {
        if let Some(sink) = &self.persistence {
            if let Err(e) = sink.append_message(message).await {
                tracing::warn!("Failed to persist assistant message: {e}");
            }
        }
    }

    /// Lossless; yields to cancellation while the consumer applies backpressure.
    async fn publish_chunk(&self, content: String) -> Option<ApiError> {
        let updates = self.updates.as_ref()?;
        tokio::select! {
            biased;
            err = self.ctx.done() => Some(err),
            _ = updates.send(StreamUpdate::Chunk(content)) => None,
        }
    }

    fn publish_progress(&self, chunk_count: usize, total_bytes: usize) {
        if let Some(updates) = &self.updates {
            let _ = updates.try_send(StreamUpdate::Progress {
                chunk_count,
                total_bytes,
            });
        }
    }
}

/// A cancelled context is an interrupt; an expired deadline is a failure.
fn context_outcome(err: ApiError) -> Outcome {
    match err {
        ApiError::Cancelled => Outcome::Interrupted,
        other => Outcome::Failed(other),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
