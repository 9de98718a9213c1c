// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::credential::Credential;
use crate::error::ErrorCode;
use crate::state::CorralState;

/// Pull the bearer token out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
}

/// Resolve the caller's credential or produce the 401/500 response.
pub async fn require_credential(
    state: &CorralState,
    headers: &HeaderMap,
) -> Result<Credential, Response> {
    let Some(bearer) = bearer_token(headers) else {
        return Err(ErrorCode::Unauthorized
            .to_http_response("missing bearer credential")
            .into_response());
    };
    match state.credentials.validate(&bearer).await {
        Ok(Some(credential)) => Ok(credential),
        Ok(None) => Err(ErrorCode::Unauthorized
            .to_http_response("invalid, inactive, or expired credential")
            .into_response()),
        Err(e) => {
            tracing::error!(err = %e, "credential lookup failed");
            Err(ErrorCode::Internal.to_http_response("credential lookup failed").into_response())
        }
    }
}

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;
