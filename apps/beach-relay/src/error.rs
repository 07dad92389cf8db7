use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use relay_proto::{close_codes, RequestType};
use serde::Serialize;
use thiserror::Error;

/// Reasons a peer connection is refused before a Client exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("connection is missing `id` or `token`")]
    MissingIdentity,
    #[error("token does not match the relay secret")]
    InvalidSecret,
    #[error("client id {0} is already connected")]
    DuplicateClient(String),
}

impl AdmissionError {
    pub fn close_code(&self) -> u16 {
        match self {
            AdmissionError::MissingIdentity => close_codes::MISSING_IDENTITY,
            AdmissionError::InvalidSecret => close_codes::INVALID_SECRET,
            AdmissionError::DuplicateClient(_) => close_codes::DUPLICATE_CLIENT,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::MissingIdentity => "missing_identity",
            AdmissionError::InvalidSecret => "invalid_secret",
            AdmissionError::DuplicateClient(_) => "duplicate_client",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
}

/// Failures surfaced to whoever originated a call against a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("client {0} is not connected")]
    UnknownClient(String),
    #[error("failed to send {request_type} request to client {client_id}")]
    SendFailed {
        request_type: RequestType,
        client_id: String,
    },
    #[error("{request_type} request {request_id} timed out after {}ms", .elapsed.as_millis())]
    TimedOut {
        request_type: RequestType,
        request_id: String,
        elapsed: Duration,
    },
    #[error("client {client_id} disconnected before answering {request_id}")]
    ClientDisconnected {
        client_id: String,
        request_id: String,
    },
    #[error("{0}")]
    Remote(String),
    #[error("request {0} was abandoned before completion")]
    Abandoned(String),
}

impl CallError {
    /// Metric label for the way a call ended.
    pub fn outcome(&self) -> &'static str {
        match self {
            CallError::UnknownClient(_) => "unknown_client",
            CallError::SendFailed { .. } => "send_failed",
            CallError::TimedOut { .. } => "timed_out",
            CallError::ClientDisconnected { .. } => "client_disconnected",
            CallError::Remote(_) => "remote_error",
            CallError::Abandoned(_) => "abandoned",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CallError::UnknownClient(_) => StatusCode::NOT_FOUND,
            CallError::SendFailed { .. } | CallError::Remote(_) => StatusCode::BAD_GATEWAY,
            CallError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            CallError::ClientDisconnected { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CallError::Abandoned(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct CallErrorBody {
    success: bool,
    reason: &'static str,
    error: String,
}

impl IntoResponse for CallError {
    fn into_response(self) -> Response {
        let body = CallErrorBody {
            success: false,
            reason: self.outcome(),
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
