//! `POST /api/ask`: authenticate, validate, optionally transcribe, pick a
//! model, then relay the upstream completion as server-sent events.
//!
//! Everything up to the model selection can still fail with a JSON error and a
//! status code. Once the SSE response is returned the status is committed, so
//! later failures travel in-band as `{"event":"error"}` followed by
//! `{"finished":true}`.

use crate::app::AppState;
use crate::auth::{Identity, bearer_token};
use crate::error::AppResult;
use crate::gateway::{ChatRequest, ChunkStream, FinishReason, GatewayError, ImageInput, Usage};
use crate::model_router::{ModelSelection, select_model};
use crate::transcription;
use crate::usage_log::UsageLogEntry;
use crate::validate::{AskRequest, validate_ask_payload};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 64;

/// Frames sent to the caller, in order: `Content*`, then an optional `Error`,
/// then exactly one `Finished`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    Content(String),
    Error(String),
    Finished,
}

impl OutboundEvent {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            OutboundEvent::Content(text) => json!({ "content": text }),
            OutboundEvent::Error(message) => json!({ "event": "error", "message": message }),
            OutboundEvent::Finished => json!({ "finished": true }),
        }
    }

    fn into_sse(self) -> Event {
        Event::default().data(self.to_json().to_string())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("{0}")]
    Gateway(#[from] GatewayError),
    #[error("stream exceeded the maximum duration of {}s", .0.as_secs())]
    Timeout(Duration),
}

/// What one pass over the upstream stream produced.
#[derive(Debug, Default)]
pub struct StreamSummary {
    pub text: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
    pub content_events: usize,
    pub error: Option<StreamError>,
    pub cancelled: bool,
}

pub async fn ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let identity = state.auth.verify(bearer_token(&headers)).map_err(|err| {
        tracing::info!(error = %err, "ask rejected by token verifier");
        metrics::counter!("askrelay_ask_requests_total", "outcome" => "unauthorized").increment(1);
        err
    })?;

    let mut request = validate_ask_payload(&body).map_err(|err| {
        tracing::info!(user_id = %identity.id, issues = err.details.len(), "ask payload rejected");
        metrics::counter!("askrelay_ask_requests_total", "outcome" => "invalid").increment(1);
        err
    })?;

    if let Some(audio) = request.audio.take() {
        let transcript = transcription::transcribe(
            state.gateway.as_ref(),
            &state.runtime.gateway,
            &audio,
        )
        .await
        .map_err(|err| {
            tracing::warn!(user_id = %identity.id, cause = %err.cause, "ask transcription failed");
            metrics::counter!("askrelay_ask_requests_total", "outcome" => "transcription_failed")
                .increment(1);
            err
        })?;
        request.prompt = transcript;
    }

    let selection = select_model(&request, &state.runtime.gateway.models);
    let started_at = Instant::now();
    tracing::info!(
        user_id = %identity.id,
        request_id = ?request_id,
        model = %selection.model,
        tier = ?selection.tier,
        has_image = request.img.is_some(),
        prompt_chars = request.prompt.chars().count(),
        "ask accepted"
    );

    let (tx, rx) = mpsc::channel::<OutboundEvent>(EVENT_BUFFER);
    tokio::spawn(run_relay(
        state,
        identity,
        request,
        selection,
        started_at,
        request_id,
        tx,
    ));

    let stream = tokio_stream::wrappers::ReceiverStream::new(rx)
        .map(|event| Ok::<_, Infallible>(event.into_sse()));
    let mut response = Sse::new(stream).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(response)
}

fn build_chat_request(
    state: &AppState,
    request: AskRequest,
    selection: &ModelSelection,
) -> ChatRequest {
    let gateway = &state.runtime.gateway;
    let max_tokens = if request.img.is_some() {
        gateway.vision_max_tokens
    } else {
        gateway.text_max_tokens
    };
    ChatRequest {
        model: selection.model.clone(),
        prompt: request.prompt,
        image: request.img.map(|url| ImageInput {
            url,
            detail: gateway.image_detail.as_str(),
        }),
        max_tokens,
    }
}

/// Runs after the SSE headers are committed. Always ends with `Finished`
/// unless the caller has already gone away.
async fn run_relay(
    state: AppState,
    identity: Identity,
    request: AskRequest,
    selection: ModelSelection,
    started_at: Instant,
    request_id: Option<String>,
    tx: mpsc::Sender<OutboundEvent>,
) {
    let chat = build_chat_request(&state, request, &selection);
    let max_duration = state.runtime.max_stream_duration;

    let opened = tokio::select! {
        biased;
        _ = tx.closed() => None,
        opened = state.gateway.stream_chat(chat) => Some(opened),
    };
    let summary = match opened {
        Some(Ok(chunks)) => forward_chunks(chunks, &tx, max_duration).await,
        Some(Err(err)) => StreamSummary {
            error: Some(err.into()),
            ..StreamSummary::default()
        },
        None => StreamSummary {
            cancelled: true,
            ..StreamSummary::default()
        },
    };

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let entry = UsageLogEntry {
        timestamp: chrono::Utc::now(),
        user_id: identity.id.clone(),
        model: selection.model.clone(),
        tokens_in: summary.usage.map(|u| u.prompt_tokens),
        tokens_out: summary.usage.map(|u| u.completion_tokens),
        latency_ms: Some(latency_ms),
    };
    state.usage_log.append(&entry).await;
    record_metrics(&summary, latency_ms);

    match &summary.error {
        Some(err) => tracing::warn!(
            user_id = %identity.id,
            request_id = ?request_id,
            model = %selection.model,
            content_events = summary.content_events,
            error = %err,
            "ask stream failed"
        ),
        None => tracing::info!(
            user_id = %identity.id,
            request_id = ?request_id,
            model = %selection.model,
            finish_reason = ?summary.finish_reason,
            response_chars = summary.text.chars().count(),
            tokens_in = ?entry.tokens_in,
            tokens_out = ?entry.tokens_out,
            latency_ms,
            cancelled = summary.cancelled,
            "ask stream finished"
        ),
    }

    if summary.cancelled {
        return;
    }
    if let Some(err) = summary.error {
        if tx.send(OutboundEvent::Error(err.to_string())).await.is_err() {
            return;
        }
    }
    let _ = tx.send(OutboundEvent::Finished).await;
}

/// Forwards chunk text as `Content` events until the stream ends, a finish
/// reason arrives, an error occurs, the deadline passes, or the caller
/// disconnects. Never sends a terminal event itself.
pub async fn forward_chunks(
    mut chunks: ChunkStream,
    tx: &mpsc::Sender<OutboundEvent>,
    max_duration: Option<Duration>,
) -> StreamSummary {
    let mut summary = StreamSummary::default();
    let deadline = async {
        match max_duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                summary.cancelled = true;
                break;
            }
            _ = &mut deadline => {
                if let Some(limit) = max_duration {
                    summary.error = Some(StreamError::Timeout(limit));
                }
                break;
            }
            next = chunks.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                summary.error = Some(err.into());
                break;
            }
        };
        if let Some(usage) = chunk.usage {
            summary.usage = Some(usage);
        }
        if !chunk.delta_text.is_empty() {
            summary.text.push_str(&chunk.delta_text);
            if tx.send(OutboundEvent::Content(chunk.delta_text)).await.is_err() {
                summary.cancelled = true;
                break;
            }
            summary.content_events += 1;
        }
        if let Some(reason) = chunk.finish_reason {
            summary.finish_reason = Some(reason);
            break;
        }
    }
    summary
}

fn record_metrics(summary: &StreamSummary, latency_ms: u64) {
    let outcome = if summary.cancelled {
        "cancelled"
    } else if summary.error.is_some() {
        "stream_error"
    } else {
        "ok"
    };
    metrics::counter!("askrelay_ask_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!("askrelay_ask_latency_ms").record(latency_ms as f64);
    if let Some(err) = &summary.error {
        let kind = match err {
            StreamError::Gateway(err) => err.kind.as_str(),
            StreamError::Timeout(_) => "timeout",
        };
        metrics::counter!("askrelay_stream_errors_total", "kind" => kind).increment(1);
    }
    if let Some(usage) = summary.usage {
        metrics::counter!("askrelay_tokens_total", "direction" => "in")
            .increment(usage.prompt_tokens);
        metrics::counter!("askrelay_tokens_total", "direction" => "out")
            .increment(usage.completion_tokens);
    }
}
