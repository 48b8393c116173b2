use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("required setting {0} is not configured")]
    Missing(&'static str),
    #[error("setting {name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Connection settings for the upstream completion service.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub auth: GatewayAuthConfig,
    #[serde(default)]
    pub models: ModelTiers,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_transcription_language")]
    pub transcription_language: String,
    #[serde(default = "default_text_max_tokens")]
    pub text_max_tokens: u32,
    #[serde(default = "default_vision_max_tokens")]
    pub vision_max_tokens: u32,
    #[serde(default)]
    pub image_detail: ImageDetail,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl GatewayConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            auth: GatewayAuthConfig {
                auth_type: GatewayAuthType::Bearer,
                value: api_key.into(),
                header_name: None,
            },
            models: ModelTiers::default(),
            transcription_model: default_transcription_model(),
            transcription_language: default_transcription_language(),
            text_max_tokens: default_text_max_tokens(),
            vision_max_tokens: default_vision_max_tokens(),
            image_detail: ImageDetail::default(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayAuthConfig {
    #[serde(rename = "type", default = "default_auth_type")]
    pub auth_type: GatewayAuthType,
    pub value: String,
    #[serde(default)]
    pub header_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayAuthType {
    Bearer,
    Header,
}

/// The two model tiers the router picks between.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ModelTiers {
    #[serde(default = "default_fast_model")]
    pub fast: String,
    #[serde(default = "default_capable_model")]
    pub capable: String,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            fast: default_fast_model(),
            capable: default_capable_model(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageDetail {
    #[default]
    Auto,
    Low,
    High,
}

impl ImageDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageDetail::Auto => "auto",
            ImageDetail::Low => "low",
            ImageDetail::High => "high",
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_auth_type() -> GatewayAuthType {
    GatewayAuthType::Bearer
}

fn default_fast_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_capable_model() -> String {
    "gpt-4o".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_transcription_language() -> String {
    "en".to_string()
}

fn default_text_max_tokens() -> u32 {
    400
}

fn default_vision_max_tokens() -> u32 {
    500
}

fn default_request_timeout_ms() -> u64 {
    60_000
}
