//! Server-Sent Events (SSE) decoding.
//!
//! Scans an HTTP response body line by line and turns `data: ` frames into
//! [`StreamEvent`]s using a backend-specific frame parser.

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use parley_types::{ApiError, CallContext, EventReceiver, StreamEvent};
use std::fmt::Display;
use tokio::sync::mpsc;

/// Capacity of the decoder's output channel.
pub const SSE_CHANNEL_CAPACITY: usize = 100;

/// Longest line the decoder buffers while waiting for a newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const DATA_PREFIX: &str = "data: ";
const DONE_LINE: &str = "data: [DONE]";

/// What a frame parser extracted from one `data: ` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFrame {
    pub content: String,
    pub done: bool,
}

impl ParsedFrame {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
        }
    }

    pub fn done(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: true,
        }
    }
}

/// A meaningful line of an SSE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// A `data: ` payload with the prefix stripped.
    Data(String),
    /// The `data: [DONE]` sentinel.
    Done,
}

/// Incremental line splitter that processes bytes into SSE lines.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters split
/// across network reads are decoded intact. A pending line longer than
/// [`MAX_LINE_BYTES`] or a line that is not valid UTF-8 is a parse error.
#[derive(Debug, Default)]
pub struct SseLineParser {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to contain no newline.
    scanned: usize,
}

impl SseLineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return any complete lines.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseLine>, ApiError> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + offset;
            if let Some(line) = Self::parse_line(&self.buffer[start..end])? {
                lines.push(line);
            }
            start = end + 1;
            self.scanned = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        if self.buffer.len() > MAX_LINE_BYTES {
            return Err(ApiError::StreamParse(format!(
                "SSE line exceeds {MAX_LINE_BYTES} bytes without a newline"
            )));
        }
        Ok(lines)
    }

    /// Flush a trailing line that had no terminating newline.
    pub fn finish(&mut self) -> Result<Option<SseLine>, ApiError> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        Self::parse_line(&rest)
    }

    fn parse_line(raw: &[u8]) -> Result<Option<SseLine>, ApiError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| ApiError::StreamParse(format!("invalid UTF-8 in SSE line: {e}")))?;
        let line = text.trim_end_matches('\r');

        // Blank lines separate events; other fields (event:, id:, comments) are ignored.
        if line.is_empty() {
            return Ok(None);
        }
        if line == DONE_LINE {
            return Ok(Some(SseLine::Done));
        }
        Ok(line
            .strip_prefix(DATA_PREFIX)
            .map(|payload| SseLine::Data(payload.to_string())))
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Decode an SSE body in a background task.
///
/// The returned channel yields content chunks in order and ends with at most
/// one terminal event: `Done` on the `[DONE]` sentinel or a parser-reported
/// done frame, `Error` on a body read failure, parse failure or cancellation.
/// A body that simply ends closes the channel without a terminal event.
///
/// The body is owned by the task and dropped on every exit path.
pub fn decode_sse<S, E, F>(body: S, ctx: CallContext, parse: F) -> EventReceiver
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
    F: Fn(&str) -> Result<ParsedFrame, ApiError> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(SSE_CHANNEL_CAPACITY);
    tokio::spawn(run_decoder(Box::pin(body), ctx, parse, tx));
    rx
}

async fn run_decoder<S, E, F>(
    mut body: std::pin::Pin<Box<S>>,
    ctx: CallContext,
    parse: F,
    tx: mpsc::Sender<StreamEvent>,
) where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
    F: Fn(&str) -> Result<ParsedFrame, ApiError> + Send + Sync + 'static,
{
    let mut parser = SseLineParser::new();

    loop {
        if let Some(err) = ctx.error() {
            let _ = tx.send(StreamEvent::Error(err)).await;
            return;
        }

        let next = tokio::select! {
            biased;
            err = ctx.done() => {
                let _ = tx.send(StreamEvent::Error(err)).await;
                return;
            }
            next = body.next() => next,
        };

        let (parsed, eof) = match next {
            Some(Ok(bytes)) => (parser.feed(&bytes), false),
            Some(Err(e)) => {
                let _ = tx
                    .send(StreamEvent::Error(ApiError::Network(e.to_string())))
                    .await;
                return;
            }
            None => (parser.finish().map(|line| line.into_iter().collect()), true),
        };
        let lines: Vec<SseLine> = match parsed {
            Ok(lines) => lines,
            Err(e) => {
                tracing::debug!("SSE body rejected: {e}");
                let _ = tx.send(StreamEvent::Error(e)).await;
                return;
            }
        };

        for line in lines {
            if let Flow::Stop = emit_line(line, &parse, &tx).await {
                return;
            }
        }

        if eof {
            return;
        }
    }
}

async fn emit_line<F>(line: SseLine, parse: &F, tx: &mpsc::Sender<StreamEvent>) -> Flow
where
    F: Fn(&str) -> Result<ParsedFrame, ApiError>,
{
    match line {
        SseLine::Done => {
            let _ = tx.send(StreamEvent::Done).await;
            Flow::Stop
        }
        SseLine::Data(payload) => match parse(&payload) {
            Ok(frame) => {
                if !frame.content.is_empty()
                    && tx.send(StreamEvent::Chunk(frame.content)).await.is_err()
                {
                    // Receiver dropped.
                    return Flow::Stop;
                }
                if frame.done {
                    let _ = tx.send(StreamEvent::Done).await;
                    return Flow::Stop;
                }
                Flow::Continue
            }
            Err(e) => {
                tracing::debug!("SSE frame rejected by parser: {e}");
                let _ = tx.send(StreamEvent::Error(e)).await;
                Flow::Stop
            }
        },
    }
}
