//! Translation between HTTP payloads and engine calls.

use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use review_engine::{OutgoingAttachment, OutgoingMessage, ReviewError};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::SendMessageRequest,
};
use tracing::{error, warn};

pub(crate) type HttpError = (StatusCode, Json<ApiError>);
pub(crate) type HttpResult<T> = Result<T, HttpError>;

/// Full-size attachments one `/messages` request has room for.
pub(crate) const MESSAGE_ATTACHMENT_ALLOWANCE: usize = 4;
const JSON_ENVELOPE_BYTES: usize = 64 * 1024;

/// Body limit of the `/messages` route: base64 grows each attachment by 4/3, plus the
/// message fields around them.
pub(crate) fn message_body_limit(max_attachment_bytes: usize) -> usize {
    max_attachment_bytes
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_mul(MESSAGE_ATTACHMENT_ALLOWANCE)
        .saturating_add(JSON_ENVELOPE_BYTES)
}

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Precondition | ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Storage => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_response(err: ReviewError) -> HttpError {
    let api: ApiError = err.into();
    let status = status_for(api.code);
    if status.is_server_error() {
        error!(code = ?api.code, message = %api.message, "request failed");
    } else {
        warn!(code = ?api.code, message = %api.message, "request rejected");
    }
    (status, Json(api))
}

pub(crate) fn validation(message: impl Into<String>) -> HttpError {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

/// Oversized or unreadable request bodies, reported in the same shape as engine errors.
pub(crate) fn rejected_body(status: StatusCode, reason: String) -> HttpError {
    warn!(%status, %reason, "request body rejected");
    (status, Json(ApiError::new(ErrorCode::Validation, reason)))
}

/// Decodes inline base64 attachments. Size and filename rules are enforced by the engine.
pub(crate) fn outgoing_message(req: SendMessageRequest) -> HttpResult<OutgoingMessage> {
    let mut attachments = Vec::with_capacity(req.attachments.len());
    for (index, upload) in req.attachments.into_iter().enumerate() {
        let bytes = STANDARD.decode(upload.content_b64.as_bytes()).map_err(|_| {
            validation(format!("attachment #{index} '{}' is not valid base64", upload.filename))
        })?;
        attachments.push(OutgoingAttachment {
            filename: upload.filename,
            mime_type: upload.mime_type.filter(|mime| !mime.trim().is_empty()),
            bytes,
        });
    }
    Ok(OutgoingMessage {
        sender: req.sender,
        receiver: req.receiver,
        subject: req.subject,
        body: req.body,
        program_id: req.program_id,
        attachments,
    })
}

pub(crate) fn binary_response(
    bytes: Vec<u8>,
    mime_type: Option<&str>,
    filename: &str,
) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    let content_type = mime_type.unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    (StatusCode::OK, headers, bytes)
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
