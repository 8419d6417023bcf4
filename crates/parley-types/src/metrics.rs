//! Write-once records describing one logical chat exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ChatRequest;

/// What was asked, captured before the first attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetrics {
    pub request_id: Uuid,
    pub provider: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stream: bool,
    pub web_search: bool,
    pub message_count: usize,
    /// Length in characters of the most recent user message.
    pub last_user_message_len: usize,
    pub has_system_message: bool,
    pub started_at: DateTime<Utc>,
}

impl RequestMetrics {
    /// Build request metrics from a request. Pure apart from the id and timestamp.
    pub fn from_request(request: &ChatRequest, provider: &str, stream: bool) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            provider: provider.to_string(),
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
            web_search: request.web_search,
            message_count: request.messages.len(),
            last_user_message_len: request
                .last_user_message()
                .map(|m| m.content.chars().count())
                .unwrap_or(0),
            has_system_message: request.has_system_message(),
            started_at: Utc::now(),
        }
    }
}

/// How the exchange ended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub request_id: Uuid,
    pub latency_ms: u64,
    pub success: bool,
    pub interrupted: bool,
    pub retry_count: u32,
    pub content_length: usize,
    pub chunk_count: usize,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub status_code: Option<u16>,
}
