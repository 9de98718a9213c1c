// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP handlers for the broker API.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dispatch::{StreamFrame, Submission, SubmissionOptions, SubmitOutcome};
use crate::error::ErrorCode;
use crate::session::{clamp_ttl, ContextMessage, Role, MAX_TTL, MIN_TTL};
use crate::state::CorralState;
use crate::transport::auth::{bearer_token, require_credential};

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub instances: usize,
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitBody {
    pub prompt: String,
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
    /// Parsed leniently here, strictly in the handler, so malformed
    /// options produce the broker's 400 envelope instead of a bare 422.
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    #[serde(default)]
    pub client: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub status: String,
    pub request_id: String,
    pub poll_url: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub request_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct InitialMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionCreateBody {
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub initial_context: Option<Vec<InitialMessage>>,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionUpdateBody {
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub extend_ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SessionDeleteResponse {
    pub session_id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct QuotaResponse {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: u64,
    pub window_seconds: u64,
}

// -- Helpers ------------------------------------------------------------------

/// Remote address as reported by the proxy in front of us.
fn remote_addr(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn ttl_in_bounds(seconds: u64) -> bool {
    (MIN_TTL.as_secs()..=MAX_TTL.as_secs()).contains(&seconds)
}

/// Turn the dispatcher's frame channel into an SSE response. The stream ends
/// after a terminal frame or when the consumer has waited `idle_timeout`
/// with nothing arriving.
fn sse_response(frames: mpsc::Receiver<StreamFrame>, idle_timeout: Duration) -> Response {
    let stream = futures_util::stream::unfold(Some(frames), move |state| async move {
        let mut rx = state?;
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(frame)) => {
                let terminal =
                    matches!(frame, StreamFrame::Done { .. } | StreamFrame::Error { .. });
                let next = if terminal { None } else { Some(rx) };
                Some((frame, next))
            }
            Ok(None) => None,
            Err(_) => Some((
                StreamFrame::Error {
                    kind: ErrorCode::Internal.as_str().to_owned(),
                    message: "stream idle timeout".to_owned(),
                },
                None,
            )),
        }
    })
    .map(|frame| {
        let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_owned());
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::new()).into_response()
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/v1/health`
pub async fn health(State(s): State<Arc<CorralState>>) -> impl IntoResponse {
    let stats = s.pool.stats().await;
    Json(HealthResponse {
        status: "running".to_owned(),
        instances: stats.total,
        queue_depth: s.dispatcher.queue_depth().await,
    })
}

/// `POST /api/v1/submissions` — run a prompt, stream or poll for the result.
pub async fn submit(
    State(s): State<Arc<CorralState>>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> Response {
    let Some(bearer) = bearer_token(&headers) else {
        return ErrorCode::Unauthorized
            .to_http_response("missing bearer credential")
            .into_response();
    };

    let options = match body.options {
        Some(value) => match serde_json::from_value::<SubmissionOptions>(value) {
            Ok(options) => Some(options),
            Err(e) => {
                return ErrorCode::BadRequest
                    .to_http_response(format!("invalid options: {e}"))
                    .into_response();
            }
        },
        None => None,
    };

    let submission = Submission {
        bearer,
        prompt: body.prompt,
        tool_id: body.tool_id,
        session_id: body.session_id,
        stream: body.stream,
        options,
        remote_addr: remote_addr(&headers),
        client: body.client,
    };

    if submission.stream {
        let frames = s.dispatcher.submit_stream(submission);
        return sse_response(frames, Duration::from_secs(s.config.stream_idle_timeout_secs));
    }

    match s.dispatcher.submit(submission).await {
        Ok(SubmitOutcome::Completed(response)) => Json(*response).into_response(),
        Ok(SubmitOutcome::Queued { request_id }) => {
            let body = QueuedResponse {
                status: "queued".to_owned(),
                poll_url: format!("/api/v1/requests/{request_id}"),
                request_id,
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(rejection) => rejection.to_http_response().into_response(),
    }
}

/// `GET /api/v1/requests/{id}` — poll a request record.
pub async fn poll_request(
    State(s): State<Arc<CorralState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let credential = match require_credential(&s, &headers).await {
        Ok(credential) => credential,
        Err(response) => return response,
    };
    match s.dispatcher.poll(&id, &credential.id).await {
        Some(record) => Json(record).into_response(),
        None => ErrorCode::NoSuchRequest
            .to_http_response("request not found or expired")
            .into_response(),
    }
}

/// `DELETE /api/v1/requests/{id}` — cancel a queued request.
pub async fn cancel_request(
    State(s): State<Arc<CorralState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let credential = match require_credential(&s, &headers).await {
        Ok(credential) => credential,
        Err(response) => return response,
    };
    match s.dispatcher.cancel(&id, &credential).await {
        Ok(()) => Json(CancelResponse { request_id: id, cancelled: true }).into_response(),
        Err(rejection) => rejection.to_http_response().into_response(),
    }
}

/// `POST /api/v1/sessions` — create a session.
pub async fn create_session(
    State(s): State<Arc<CorralState>>,
    headers: HeaderMap,
    Json(body): Json<SessionCreateBody>,
) -> Response {
    let credential = match require_credential(&s, &headers).await {
        Ok(credential) => credential,
        Err(response) => return response,
    };

    if let Some(ttl) = body.ttl_seconds {
        if !ttl_in_bounds(ttl) {
            return ErrorCode::BadRequest
                .to_http_response("ttl_seconds must be in 300..=86400")
                .into_response();
        }
    }

    let tool_id = body.tool_id.unwrap_or_else(|| "claude".to_owned());
    let initial_context = body
        .initial_context
        .unwrap_or_default()
        .into_iter()
        .map(|m| ContextMessage::now(m.role, m.content))
        .collect();
    let ttl = body.ttl_seconds.map(|secs| clamp_ttl(Duration::from_secs(secs)));

    match s
        .sessions
        .create(
            &credential.id,
            &tool_id,
            initial_context,
            body.metadata.unwrap_or_default(),
            ttl,
        )
        .await
    {
        Ok(session) => Json(session).into_response(),
        Err(e) => {
            tracing::error!(err = %e, "session create failed");
            ErrorCode::Internal.to_http_response("failed to create session").into_response()
        }
    }
}

/// `GET /api/v1/sessions/{id}` — fetch an owned session.
pub async fn get_session(
    State(s): State<Arc<CorralState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let credential = match require_credential(&s, &headers).await {
        Ok(credential) => credential,
        Err(response) => return response,
    };
    match s.sessions.get(&id, &credential.id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => ErrorCode::NoSuchSession
            .to_http_response("session not found, expired, or not yours")
            .into_response(),
        Err(e) => {
            tracing::error!(err = %e, "session fetch failed");
            ErrorCode::Internal.to_http_response("failed to load session").into_response()
        }
    }
}

/// `PATCH /api/v1/sessions/{id}` — merge metadata / extend TTL.
pub async fn update_session(
    State(s): State<Arc<CorralState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SessionUpdateBody>,
) -> Response {
    let credential = match require_credential(&s, &headers).await {
        Ok(credential) => credential,
        Err(response) => return response,
    };

    if let Some(ttl) = body.extend_ttl_seconds {
        if !ttl_in_bounds(ttl) {
            return ErrorCode::BadRequest
                .to_http_response("extend_ttl_seconds must be in 300..=86400")
                .into_response();
        }
    }

    let extend = body.extend_ttl_seconds.map(Duration::from_secs);
    match s.sessions.update(&id, &credential.id, body.metadata, extend).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => ErrorCode::NoSuchSession
            .to_http_response("session not found, expired, or not yours")
            .into_response(),
        Err(e) => {
            tracing::error!(err = %e, "session update failed");
            ErrorCode::Internal.to_http_response("failed to update session").into_response()
        }
    }
}

/// `DELETE /api/v1/sessions/{id}` — soft-delete an owned session.
pub async fn delete_session(
    State(s): State<Arc<CorralState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let credential = match require_credential(&s, &headers).await {
        Ok(credential) => credential,
        Err(response) => return response,
    };
    match s.sessions.delete(&id, &credential.id).await {
        Ok(true) => {
            Json(SessionDeleteResponse { session_id: id, deleted: true }).into_response()
        }
        Ok(false) => ErrorCode::NoSuchSession
            .to_http_response("session not found, expired, or not yours")
            .into_response(),
        Err(e) => {
            tracing::error!(err = %e, "session delete failed");
            ErrorCode::Internal.to_http_response("failed to delete session").into_response()
        }
    }
}

/// `GET /api/v1/quota` — sliding-window remaining for the caller.
pub async fn quota(State(s): State<Arc<CorralState>>, headers: HeaderMap) -> Response {
    let credential = match require_credential(&s, &headers).await {
        Ok(credential) => credential,
        Err(response) => return response,
    };
    let decision = s.dispatcher.quota(&credential);
    Json(QuotaResponse {
        limit: decision.limit,
        remaining: decision.remaining,
        reset_at_ms: decision.reset_at_ms,
        window_seconds: s.config.rate_limit_window_secs,
    })
    .into_response()
}

/// `GET /api/v1/pool` — pool stats snapshot.
pub async fn pool_stats(State(s): State<Arc<CorralState>>, headers: HeaderMap) -> Response {
    if let Err(response) = require_credential(&s, &headers).await {
        return response;
    }
    Json(s.pool.stats().await).into_response()
}
