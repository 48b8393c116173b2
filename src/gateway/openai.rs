use super::{
    AudioUpload, ChatRequest, ChunkStream, FinishReason, GatewayError, GatewayErrorKind,
    ModelGateway, StreamChunk, Usage,
};
use crate::config::{GatewayAuthConfig, GatewayAuthType, GatewayConfig};
use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Gateway speaking the OpenAI chat-completions and transcription protocol.
#[derive(Clone)]
pub struct OpenAiGateway {
    client: reqwest::Client,
    config: Arc<GatewayConfig>,
}

impl OpenAiGateway {
    pub fn new(client: reqwest::Client, config: GatewayConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let url = join_url(&self.config.base_url, path);
        apply_auth(self.client.post(url), &self.config.auth)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms.max(1))
    }
}

#[async_trait]
impl ModelGateway for OpenAiGateway {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ChunkStream, GatewayError> {
        let body = build_chat_body(&request);
        // Only the connection open is bounded here; reading the body is bounded by the relay.
        let send = self.post("/v1/chat/completions").json(&body).send();
        let resp = tokio::time::timeout(self.request_timeout(), send)
            .await
            .map_err(|_| {
                GatewayError::new(
                    GatewayErrorKind::Network,
                    None,
                    "timed out opening upstream stream",
                )
            })?
            .map_err(|err| GatewayError::new(GatewayErrorKind::Network, None, err.to_string()))?;
        let resp = ensure_success(resp).await?;
        tracing::debug!(model = %request.model, "upstream stream opened");
        Ok(chunk_stream(resp))
    }

    async fn transcribe(&self, upload: AudioUpload) -> Result<String, GatewayError> {
        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str("audio/wav")
            .map_err(|err| GatewayError::new(GatewayErrorKind::Http, None, err.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", upload.model)
            .text("response_format", "text")
            .text("language", upload.language);
        let resp = self
            .post("/v1/audio/transcriptions")
            .timeout(self.request_timeout())
            .multipart(form)
            .send()
            .await
            .map_err(|err| GatewayError::new(GatewayErrorKind::Network, None, err.to_string()))?;
        let resp = ensure_success(resp).await?;
        let status = resp.status();
        let text = resp.text().await.map_err(|err| {
            GatewayError::new(GatewayErrorKind::Network, Some(status), err.to_string())
        })?;
        Ok(transcript_from_body(&text))
    }
}

fn build_chat_body(request: &ChatRequest) -> Value {
    let content = match &request.image {
        Some(image) => json!([
            { "type": "text", "text": request.prompt },
            {
                "type": "image_url",
                "image_url": { "url": image.url, "detail": image.detail }
            }
        ]),
        None => Value::String(request.prompt.clone()),
    };
    json!({
        "model": request.model,
        "messages": [{ "role": "user", "content": content }],
        "max_tokens": request.max_tokens,
        "stream": true,
        "stream_options": { "include_usage": true }
    })
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let code = extract_error_code(&text);
    let message = match extract_error_message(&text) {
        Some(detail) => format!("upstream status {status}: {detail}"),
        None => format!("upstream status {status}"),
    };
    Err(GatewayError::new(GatewayErrorKind::Http, Some(status), message).with_code(code))
}

type EventResult = Result<Event, String>;

/// Turns the upstream SSE body into chunks. The usage frame that OpenAI sends
/// after the finishing chunk is folded into that chunk so consumers that stop
/// at the finish reason still see token counts.
struct ChunkReader {
    events: Pin<Box<dyn Stream<Item = EventResult> + Send>>,
    held: Option<StreamChunk>,
    done: bool,
}

fn chunk_stream(resp: reqwest::Response) -> ChunkStream {
    chunks_from_sse(resp.bytes_stream())
}

fn chunks_from_sse<S, B, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = body
        .eventsource()
        .map(|event| event.map_err(|err: EventStreamError<E>| err.to_string()));
    let reader = ChunkReader {
        events: Box::pin(events),
        held: None,
        done: false,
    };
    Box::pin(futures_util::stream::unfold(reader, |mut reader| async move {
        let item = reader.next_chunk().await?;
        Some((item, reader))
    }))
}

impl ChunkReader {
    async fn next_chunk(&mut self) -> Option<Result<StreamChunk, GatewayError>> {
        if self.done {
            return None;
        }
        loop {
            let Some(event) = self.events.next().await else {
                self.done = true;
                return self.held.take().map(Ok);
            };
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    return self.fail(GatewayError::new(GatewayErrorKind::Network, None, err));
                }
            };
            let data = event.data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                self.done = true;
                return self.held.take().map(Ok);
            }
            let value: Value = match serde_json::from_str(data) {
                Ok(value) => value,
                Err(err) => {
                    return self.fail(GatewayError::new(
                        GatewayErrorKind::Decode,
                        None,
                        format!("malformed upstream chunk: {err}"),
                    ));
                }
            };
            if let Some(err) = upstream_stream_error(&value) {
                return self.fail(err);
            }
            let chunk = parse_chunk(&value);
            match self.held.take() {
                Some(mut held) => {
                    if chunk.usage.is_some() {
                        held.usage = chunk.usage;
                    }
                    if held.usage.is_some() {
                        self.done = true;
                        return Some(Ok(held));
                    }
                    self.held = Some(held);
                }
                None if chunk.finish_reason.is_some() && chunk.usage.is_none() => {
                    self.held = Some(chunk);
                }
                None => return Some(Ok(chunk)),
            }
        }
    }

    /// Ends the stream. A completion that already finished is delivered
    /// without usage instead of being turned into an error.
    fn fail(&mut self, err: GatewayError) -> Option<Result<StreamChunk, GatewayError>> {
        self.done = true;
        match self.held.take() {
            Some(held) => {
                tracing::debug!(error = %err, "ignoring upstream failure after finish reason");
                Some(Ok(held))
            }
            None => Some(Err(err)),
        }
    }
}

fn parse_chunk(value: &Value) -> StreamChunk {
    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first());
    let delta_text = choice
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .filter(|v| !v.is_null())
        .map(|v| serde_json::from_value(v.clone()).unwrap_or(FinishReason::Other));
    StreamChunk {
        delta_text,
        finish_reason,
        usage: parse_usage(value),
    }
}

fn parse_usage(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?.as_object()?;
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()?,
        completion_tokens: usage.get("completion_tokens")?.as_u64()?,
    })
}

fn upstream_stream_error(value: &Value) -> Option<GatewayError> {
    let err = value.get("error")?;
    let message = err
        .get("message")
        .and_then(|v| v.as_str())
        .or_else(|| err.as_str())
        .unwrap_or("upstream reported an error");
    let code = err
        .get("code")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(GatewayError::new(GatewayErrorKind::Upstream, None, message).with_code(code))
}

fn transcript_from_body(body: &str) -> String {
    // `response_format=text` returns the bare transcript; some compatible servers still send JSON.
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        if let Some(text) = obj.get("text").and_then(|v| v.as_str()) {
            return text.trim().to_string();
        }
    }
    body.trim().to_string()
}

fn apply_auth(req: reqwest::RequestBuilder, auth: &GatewayAuthConfig) -> reqwest::RequestBuilder {
    match auth.auth_type {
        GatewayAuthType::Bearer => req.bearer_auth(&auth.value),
        GatewayAuthType::Header => {
            let header_name = auth.header_name.as_deref().unwrap_or("api-key");
            req.header(header_name, &auth.value)
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    format!("{}/{}", base, path)
}

fn extract_error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ImageInput;

    #[test]
    fn join_url_avoids_double_version_segment() {
        assert_eq!(
            join_url("https://api.example.com/v1/", "/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("http://127.0.0.1:9000", "/v1/audio/transcriptions"),
            "http://127.0.0.1:9000/v1/audio/transcriptions"
        );
    }

    #[test]
    fn chat_body_embeds_image_reference() {
        let body = build_chat_body(&ChatRequest {
            model: "m".to_string(),
            prompt: "what is this".to_string(),
            image: Some(ImageInput {
                url: "data:image/png;base64,AAA=".to_string(),
                detail: "auto",
            }),
            max_tokens: 500,
        });
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["text"], "what is this");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,AAA=");
        assert_eq!(content[1]["image_url"]["detail"], "auto");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 500);
    }

    #[test]
    fn chat_body_uses_plain_text_without_image() {
        let body = build_chat_body(&ChatRequest {
            model: "m".to_string(),
            prompt: "hello".to_string(),
            image: None,
            max_tokens: 400,
        });
        assert_eq!(body["messages"][0]["content"], "hello");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn parse_chunk_reads_delta_finish_and_usage() {
        let chunk = parse_chunk(&json!({
            "choices": [{ "index": 0, "delta": { "content": "Hi" }, "finish_reason": null }]
        }));
        assert_eq!(chunk, StreamChunk::text("Hi"));

        let chunk = parse_chunk(&json!({
            "choices": [{ "index": 0, "delta": {}, "finish_reason": "length" }]
        }));
        assert_eq!(chunk.finish_reason, Some(FinishReason::Length));

        let chunk = parse_chunk(&json!({
            "choices": [],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 }
        }));
        assert_eq!(
            chunk.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 3
            })
        );
    }

    #[test]
    fn unknown_finish_reason_maps_to_other() {
        let chunk = parse_chunk(&json!({
            "choices": [{ "delta": {}, "finish_reason": "function_call" }]
        }));
        assert_eq!(chunk.finish_reason, Some(FinishReason::Other));
    }

    #[test]
    fn stream_error_frame_is_detected() {
        let err = upstream_stream_error(&json!({
            "error": { "message": "quota exceeded", "code": "insufficient_quota" }
        }))
        .unwrap();
        assert_eq!(err.message, "quota exceeded");
        assert_eq!(err.code.as_deref(), Some("insufficient_quota"));
        assert!(upstream_stream_error(&json!({ "choices": [] })).is_none());
    }

    #[test]
    fn transcript_accepts_text_and_json_bodies() {
        assert_eq!(transcript_from_body("hello there\n"), "hello there");
        assert_eq!(transcript_from_body(r#"{"text":" hi "}"#), "hi");
    }
    fn sse_body(frames: &[Value]) -> ChunkStream {
        let body: Vec<Result<String, std::convert::Infallible>> = frames
            .iter()
            .map(|frame| Ok(format!("data: {frame}\n\n")))
            .collect();
        chunks_from_sse(futures_util::stream::iter(body))
    }

    async fn collect(stream: ChunkStream) -> Vec<Result<StreamChunk, GatewayError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn usage_frame_is_folded_into_finishing_chunk() {
        let items = collect(sse_body(&[
            json!({ "choices": [{ "delta": { "content": "Hi" }, "finish_reason": null }] }),
            json!({ "choices": [{ "delta": { "content": "!" }, "finish_reason": "stop" }] }),
            json!({ "choices": [], "usage": { "prompt_tokens": 4, "completion_tokens": 2 } }),
        ]))
        .await;
        assert_eq!(items.len(), 2);
        let last = items[1].as_ref().unwrap();
        assert_eq!(last.delta_text, "!");
        assert_eq!(last.finish_reason, Some(FinishReason::Stop));
        assert_eq!(last.usage.map(|u| u.prompt_tokens), Some(4));
    }

    #[tokio::test]
    async fn failure_after_finish_keeps_the_finished_chunk() {
        let items = collect(sse_body(&[
            json!({ "choices": [{ "delta": { "content": "Hello" }, "finish_reason": null }] }),
            json!({ "choices": [{ "delta": { "content": " world." }, "finish_reason": "stop" }] }),
            json!({ "error": { "message": "late failure" } }),
        ]))
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().delta_text, "Hello");
        let last = items[1].as_ref().unwrap();
        assert_eq!(last.delta_text, " world.");
        assert_eq!(last.finish_reason, Some(FinishReason::Stop));
        assert!(last.usage.is_none());
    }

    #[tokio::test]
    async fn malformed_frame_after_finish_keeps_the_finished_chunk() {
        let finished =
            json!({ "choices": [{ "delta": { "content": "done" }, "finish_reason": "length" }] });
        let body: Vec<Result<String, std::convert::Infallible>> = vec![
            Ok(format!("data: {finished}\n\n")),
            Ok("data: {not json\n\n".to_string()),
        ];
        let items = collect(chunks_from_sse(futures_util::stream::iter(body))).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().delta_text, "done");
    }

    #[tokio::test]
    async fn error_frame_before_finish_is_an_error() {
        let items = collect(sse_body(&[
            json!({ "choices": [{ "delta": { "content": "partial" }, "finish_reason": null }] }),
            json!({ "error": { "message": "upstream exploded" } }),
        ]))
        .await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().kind, GatewayErrorKind::Upstream);
    }

    #[test]
    fn error_message_is_taken_from_json_body() {
        assert_eq!(
            extract_error_message(r#"{"error":{"message":"model overloaded","code":"x"}}"#)
                .as_deref(),
            Some("model overloaded")
        );
        assert!(extract_error_message("<html><body>Bad Gateway</body></html>").is_none());
    }
}
