//! `POST /`: a host asks what it should mount.
//!
//! The body is a signed request envelope. On success the response is the host's
//! plan, signed with the server key. Failures carry no body and never say which
//! check failed.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use common::envelope::{Envelope, EnvelopeError};

use crate::auth::{AuthError, HOSTNAME_FIELD};
use crate::ServiceState;

pub async fn handler(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ProvisionError> {
    let declared = declared_length(&headers, state.max_payload_bytes())?;

    // never read past the declared length
    let body = axum::body::to_bytes(body, declared)
        .await
        .map_err(|e| ProvisionError::BadRequest(format!("reading body: {}", e)))?;
    if body.len() != declared {
        return Err(ProvisionError::BadRequest(format!(
            "body is {} bytes, declared {}",
            body.len(),
            declared
        )));
    }

    let request = state.authenticator().authenticate(&body).await?;
    let plan = state
        .resolver()
        .resolve(&request.instance, &request.public_key, &request.hostname)
        .await;

    let payload = serde_json::to_vec(&plan).map_err(EnvelopeError::from)?;
    let envelope = Envelope::seal(
        state.signatures(),
        state.server_key(),
        &payload,
        [(HOSTNAME_FIELD.to_string(), Value::from(request.hostname))],
    )?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        envelope.to_json()?,
    ))
}

fn declared_length(headers: &HeaderMap, max: usize) -> Result<usize, ProvisionError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .ok_or_else(|| ProvisionError::BadRequest("missing content-length".to_string()))?
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .ok_or_else(|| ProvisionError::BadRequest("invalid content-length".to_string()))?;

    if declared > max {
        return Err(ProvisionError::BadRequest(format!(
            "content-length {} exceeds {}",
            declared, max
        )));
    }
    Ok(declared)
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] AuthError),
    #[error("failed to sign response: {0}")]
    Sign(#[from] EnvelopeError),
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        match self {
            ProvisionError::BadRequest(reason) => {
                tracing::warn!(reason = %reason, "rejecting provision request");
                StatusCode::BAD_REQUEST.into_response()
            }
            // reason already logged by the authenticator
            ProvisionError::Unauthenticated(_) => StatusCode::UNAUTHORIZED.into_response(),
            ProvisionError::Sign(e) => {
                tracing::error!(error = %e, "failed to sign provision response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
