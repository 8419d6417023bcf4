//! Per-exchange metrics bookkeeping shared by `chat` and `chat_stream`.

use std::time::Instant;

use parley_types::{ApiError, ChatRequest, RequestMetrics, ResponseMetrics, Usage};

/// Tracks one logical exchange from the first attempt to its terminal outcome.
#[derive(Debug)]
pub(crate) struct Exchange {
    request: RequestMetrics,
    started: Instant,
    pub(crate) retry_count: u32,
    content_length: usize,
    chunk_count: usize,
}

impl Exchange {
    pub(crate) fn start(request: &ChatRequest, provider: &str, stream: bool) -> Self {
        Self {
            request: RequestMetrics::from_request(request, provider, stream),
            started: Instant::now(),
            retry_count: 0,
            content_length: 0,
            chunk_count: 0,
        }
    }

    pub(crate) fn request(&self) -> &RequestMetrics {
        &self.request
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub(crate) fn record_chunk(&mut self, content: &str) {
        self.chunk_count += 1;
        self.content_length += content.len();
    }

    pub(crate) fn record_content(&mut self, content: &str) {
        self.content_length = content.len();
    }

    pub(crate) fn succeeded(&self, usage: Option<Usage>) -> ResponseMetrics {
        ResponseMetrics {
            success: true,
            input_tokens: usage.map(|u| u.input_tokens),
            output_tokens: usage.map(|u| u.output_tokens),
            ..self.base()
        }
    }

    pub(crate) fn failed(&self, error: &ApiError) -> ResponseMetrics {
        ResponseMetrics {
            interrupted: error.is_context(),
            error_type: Some(error.kind().to_string()),
            status_code: error.status_code(),
            ..self.base()
        }
    }

    /// The consumer went away before a terminal event could be delivered.
    pub(crate) fn abandoned(&self) -> ResponseMetrics {
        ResponseMetrics {
            error_type: Some("receiver_dropped".to_string()),
            ..self.base()
        }
    }

    fn base(&self) -> ResponseMetrics {
        ResponseMetrics {
            request_id: self.request.request_id,
            latency_ms: self.elapsed_ms(),
            retry_count: self.retry_count,
            content_length: self.content_length,
            chunk_count: self.chunk_count,
            ..ResponseMetrics::default()
        }
    }
}
