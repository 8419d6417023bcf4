//! Analytics sink that records exchange metrics as structured log events.

use parley_types::{AnalyticsSink, RequestMetrics, ResponseMetrics, SinkError};

pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn log_request(&self, request: &RequestMetrics) -> Result<(), SinkError> {
        tracing::info!(
            target: "parley::analytics",
            request_id = %request.request_id,
            provider = %request.provider,
            model = %request.model,
            stream = request.stream,
            web_search = request.web_search,
            max_tokens = request.max_tokens,
            temperature = request.temperature,
            message_count = request.message_count,
            last_user_message_len = request.last_user_message_len,
            has_system_message = request.has_system_message,
            "chat request"
        );
        Ok(())
    }

    fn log_response(
        &self,
        request: &RequestMetrics,
        response: &ResponseMetrics,
    ) -> Result<(), SinkError> {
        tracing::info!(
            target: "parley::analytics",
            request_id = %response.request_id,
            provider = %request.provider,
            model = %request.model,
            latency_ms = response.latency_ms,
            success = response.success,
            interrupted = response.interrupted,
            retry_count = response.retry_count,
            content_length = response.content_length,
            chunk_count = response.chunk_count,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            error_type = response.error_type.as_deref(),
            status_code = response.status_code,
            "chat response"
        );
        Ok(())
    }
}
