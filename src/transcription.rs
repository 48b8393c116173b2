use crate::config::GatewayConfig;
use crate::gateway::{AudioUpload, ModelGateway};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const AUDIO_FILE_NAME: &str = "audio.wav";

#[derive(Debug, Clone, thiserror::Error)]
#[error("audio transcription failed: {cause}")]
pub struct TranscriptionError {
    pub cause: String,
}

impl TranscriptionError {
    fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

/// Drops a `data:<mime>;base64,` prefix, leaving the raw base64 text.
pub fn strip_data_url_prefix(payload: &str) -> &str {
    if payload.starts_with("data:") {
        match payload.find(',') {
            Some(idx) => &payload[idx + 1..],
            None => "",
        }
    } else {
        payload
    }
}

pub fn decode_audio(payload: &str) -> Result<Vec<u8>, TranscriptionError> {
    let raw = strip_data_url_prefix(payload.trim());
    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|err| TranscriptionError::new(format!("invalid base64 audio: {err}")))?;
    if bytes.is_empty() {
        return Err(TranscriptionError::new("audio payload is empty"));
    }
    Ok(bytes)
}

/// Converts an inbound audio payload into prompt text.
pub async fn transcribe(
    gateway: &dyn ModelGateway,
    config: &GatewayConfig,
    audio_payload: &str,
) -> Result<String, TranscriptionError> {
    let bytes = decode_audio(audio_payload)?;
    let size = bytes.len();
    let upload = AudioUpload {
        bytes,
        file_name: AUDIO_FILE_NAME.to_string(),
        model: config.transcription_model.clone(),
        language: config.transcription_language.clone(),
    };
    let text = gateway.transcribe(upload).await.map_err(|err| {
        tracing::warn!(error = %err, status = ?err.status, "transcription call failed");
        TranscriptionError::new(err.message)
    })?;
    if text.trim().is_empty() {
        return Err(TranscriptionError::new("transcript is empty"));
    }
    tracing::debug!(
        audio_bytes = size,
        transcript_chars = text.chars().count(),
        "audio transcribed"
    );
    Ok(text)
}
