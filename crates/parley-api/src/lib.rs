//! Retrying chat client, SSE decoding and backends for Parley.

mod catalog;
mod client;
mod http;
mod metrics;
mod openai;
mod retry;
pub mod sse;
mod stream;

pub use catalog::{DEFAULT_MODEL_TTL, ModelCatalog};
pub use client::{Client, ClientBuilder, STREAM_CHANNEL_CAPACITY};
pub use http::{HttpConfig, build_http_client};
pub use openai::{DEFAULT_OPENAI_BASE_URL, OpenAiProvider, parse_stream_frame};
pub use retry::{RetryConfig, RetryPolicy, sleep_with_context};
pub use sse::{ParsedFrame, decode_sse};
pub use stream::ChatEventStream;
