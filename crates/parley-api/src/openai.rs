//! OpenAI-compatible chat-completions backend.

use parley_types::{
    ApiError, BoxFuture, CallContext, ChatRequest, ChatResponse, EventReceiver, ModelInfo,
    Provider, Usage,
};
use serde::{Deserialize, Serialize};

use crate::sse::{ParsedFrame, decode_sse};

/// The default OpenAI API base URL.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Backend for any server speaking the OpenAI `/chat/completions` protocol.
#[derive(Clone)]
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    /// Create a provider on top of a shared transport.
    pub fn new(
        http: reqwest::Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Send a request, racing it against the context, and classify non-2xx
    /// responses.
    async fn send(
        &self,
        ctx: &CallContext,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ApiError> {
        let result = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            result = builder.bearer_auth(&self.api_key).send() => result,
        };
        let response = result.map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status.as_u16(), &body, self.name()))
    }

    async fn fetch_models(&self, ctx: &CallContext) -> Result<Vec<ModelInfo>, ApiError> {
        #[derive(Deserialize)]
        struct ModelList {
            #[serde(default)]
            data: Vec<ModelInfo>,
        }

        let response = self.send(ctx, self.http.get(self.url("models"))).await?;
        let body = response.text().await.map_err(transport_error)?;
        let list: ModelList = serde_json::from_str(&body)
            .map_err(|e| ApiError::Other(format!("Invalid model list: {e}")))?;
        Ok(list.data)
    }
}

impl Provider for OpenAiProvider {
    fn chat<'a>(
        &'a self,
        ctx: &'a CallContext,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<ChatResponse, ApiError>> {
        Box::pin(async move {
            let body = WireRequest::from_request(request, false);
            let builder = self.http.post(self.url("chat/completions")).json(&body);
            let response = self.send(ctx, builder).await?;

            let text = response.text().await.map_err(transport_error)?;
            let wire: WireResponse = serde_json::from_str(&text)
                .map_err(|e| ApiError::Other(format!("Invalid completion response: {e}")))?;
            Ok(wire.into_response(&request.model))
        })
    }

    fn chat_stream<'a>(
        &'a self,
        ctx: &'a CallContext,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<EventReceiver, ApiError>> {
        Box::pin(async move {
            let body = WireRequest::from_request(request, true);
            let builder = self
                .http
                .post(self.url("chat/completions"))
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&body);
            let response = self.send(ctx, builder).await?;
            Ok(decode_sse(
                response.bytes_stream(),
                ctx.clone(),
                parse_stream_frame,
            ))
        })
    }

    fn list_models<'a>(
        &'a self,
        ctx: &'a CallContext,
    ) -> BoxFuture<'a, Result<Vec<ModelInfo>, ApiError>> {
        Box::pin(self.fetch_models(ctx))
    }

    fn validate_credentials<'a>(&'a self, ctx: &'a CallContext) -> BoxFuture<'a, Result<(), ApiError>> {
        Box::pin(async move { self.fetch_models(ctx).await.map(|_| ()) })
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    web_search_options: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> WireRequest<'a> {
    fn from_request(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
            web_search_options: request
                .web_search
                .then(|| serde_json::Value::Object(serde_json::Map::new())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireContent>,
    #[serde(default)]
    delta: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    error: Option<WireErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

impl WireResponse {
    fn into_response(self, requested_model: &str) -> ChatResponse {
        let (content, finish_reason) = match self.choices.into_iter().next() {
            Some(choice) => (
                choice.message.and_then(|m| m.content).unwrap_or_default(),
                choice.finish_reason,
            ),
            None => (String::new(), None),
        };

        ChatResponse {
            content,
            model: self.model.unwrap_or_else(|| requested_model.to_string()),
            finish_reason,
            usage: self.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            latency_ms: None,
            retry_count: 0,
        }
    }
}

/// Frame parser for streamed chat-completion chunks: extracts
/// `choices[0].delta.content` and treats a `finish_reason` as done.
pub fn parse_stream_frame(data: &str) -> Result<ParsedFrame, ApiError> {
    let chunk: WireChunk =
        serde_json::from_str(data).map_err(|e| ApiError::StreamParse(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(ApiError::Other(format!(
            "Stream error: {}",
            error.message.unwrap_or_else(|| "unknown".to_string())
        )));
    }

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(ParsedFrame::default());
    };

    Ok(ParsedFrame {
        content: choice.delta.and_then(|d| d.content).unwrap_or_default(),
        done: choice.finish_reason.is_some(),
    })
}

fn transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(e.to_string())
    }
}

/// Classify an HTTP error response into a structured ApiError.
fn classify_error(status: u16, body: &str, provider: &str) -> ApiError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<ErrorDetail>,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: Option<String>,
    }

    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.to_string());

    // Transient statuses outside the policy's default set.
    let retryable = matches!(status, 408 | 529);
    ApiError::status(status, message, provider, retryable)
}
