// Error taxonomy and the JSON response envelope shared by every endpoint.
//
// Verification outcomes (invalid_otp, otp_expired, ...) are NOT errors: they
// come back as `200 {valid:false, reason}` from the verifier itself. What
// lives here is the transport-visible failure surface.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::crypto::CryptoError;

tokio::task_local! {
    /// Request id for the in-flight request, set by the request-meta
    /// middleware so both success and error envelopes can echo it.
    pub static REQUEST_ID: String;
}

pub fn current_request_id() -> String {
    REQUEST_ID
        .try_with(|id| id.clone())
        .unwrap_or_else(|_| "untracked".to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("delivery id is malformed")]
    InvalidDeliveryId,
    #[error("photo exceeds the 5 MiB limit")]
    PhotoTooLarge,
    #[error("authentication required")]
    Unauthorized,
    #[error("bearer token is invalid or expired")]
    InvalidToken,
    #[error("insufficient permissions")]
    Forbidden,
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("ciphertext is not in nonce:tag:body form")]
    EncryptionFormat,
    #[error("ciphertext failed authentication")]
    EncryptionAuth,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::InvalidDeliveryId => "INVALID_DELIVERY_ID",
            ApiError::PhotoTooLarge => "PHOTO_TOO_LARGE",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::InvalidToken => "INVALID_TOKEN",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::RateLimited => "RATE_LIMITED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::EncryptionFormat => "INVALID_ENCRYPTION_FORMAT",
            ApiError::EncryptionAuth => "ENCRYPTION_AUTH_FAILED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidDeliveryId => StatusCode::BAD_REQUEST,
            ApiError::PhotoTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unauthorized | ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::EncryptionFormat | ApiError::EncryptionAuth | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        // Integrity failures are never swallowed silently.
        error!(error = %e, "ciphertext_integrity_failure");
        match e {
            CryptoError::InvalidFormat => ApiError::EncryptionFormat,
            CryptoError::AuthFailed => ApiError::EncryptionAuth,
            CryptoError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

#[derive(Serialize)]
pub struct Meta {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

#[derive(Serialize)]
pub struct Pagination {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub meta: Meta,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

fn meta_now() -> Meta {
    Meta {
        request_id: current_request_id(),
        timestamp: Utc::now(),
        pagination: None,
    }
}

/// Success envelope around any serialisable payload.
pub fn ok<T: Serialize>(data: T) -> Response {
    let envelope = Envelope {
        success: true,
        data: serde_json::to_value(data).ok(),
        error: None,
        meta: meta_now(),
    };
    with_request_header(Json(envelope).into_response())
}

pub fn ok_paginated<T: Serialize>(data: T, pagination: Pagination) -> Response {
    let mut meta = meta_now();
    meta.pagination = Some(pagination);
    let envelope = Envelope {
        success: true,
        data: serde_json::to_value(data).ok(),
        error: None,
        meta,
    };
    with_request_header(Json(envelope).into_response())
}

fn with_request_header(mut response: Response) -> Response {
    if let Ok(value) = HeaderValue::from_str(&current_request_id()) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            // Operators correlate via the request id; callers get no internals.
            ApiError::Internal(detail) => {
                error!(detail = %detail, request_id = %current_request_id(), "internal_error");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let envelope = Envelope {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: self.code(),
                message,
            }),
            meta: meta_now(),
        };
        let mut response = (self.status(), Json(envelope)).into_response();
        if let Ok(value) = HeaderValue::from_str(&current_request_id()) {
            response.headers_mut().insert("X-Request-ID", value);
        }
        response
    }
}
