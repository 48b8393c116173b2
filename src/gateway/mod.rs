mod openai;

pub use openai::OpenAiGateway;

use async_trait::async_trait;
use axum::http::StatusCode;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// One incremental unit of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamChunk {
    pub delta_text: String,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta_text: delta.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageInput {
    pub url: String,
    pub detail: &'static str,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub prompt: String,
    pub image: Option<ImageInput>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct AudioUpload {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub model: String,
    pub language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    Network,
    Http,
    Decode,
    Upstream,
}

impl GatewayErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayErrorKind::Network => "network",
            GatewayErrorKind::Http => "http",
            GatewayErrorKind::Decode => "decode",
            GatewayErrorKind::Upstream => "upstream",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl GatewayError {
    pub fn new(
        kind: GatewayErrorKind,
        status: Option<StatusCode>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

/// Lazy, finite, forward-only sequence of chunks. Dropping it aborts the read.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send>>;

#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, GatewayError>;
    async fn transcribe(&self, upload: AudioUpload) -> Result<String, GatewayError>;
}
