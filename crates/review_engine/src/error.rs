use serde_json::json;
use shared::{
    domain::{EnrollmentId, EnrollmentStatus},
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Precondition(String),
    #[error("enrollment {enrollment_id} has unverified documents: {}", .unchecked.join(", "))]
    IncompleteDocuments {
        enrollment_id: EnrollmentId,
        unchecked: Vec<String>,
    },
    #[error("enrollment {enrollment_id} is already {status} and can no longer change")]
    TerminalState {
        enrollment_id: EnrollmentId,
        status: EnrollmentStatus,
    },
    #[error("{0}")]
    Forbidden(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("enrollment {enrollment_id} kept changing concurrently; gave up after {attempts} attempts")]
    Conflict {
        enrollment_id: EnrollmentId,
        attempts: usize,
    },
    #[error("attachment #{index} '{filename}' failed to upload: {reason}")]
    AttachmentUpload {
        index: usize,
        filename: String,
        reason: String,
        /// Attachments that had been uploaded before the failure.
        uploaded: Vec<String>,
        /// Uploaded attachments whose rollback also failed and are left in the blob store.
        orphaned: Vec<String>,
    },
    #[error("message was not recorded after uploading {} attachment(s): {reason}", .uploaded.len())]
    MessageWrite {
        reason: String,
        uploaded: Vec<String>,
        orphaned: Vec<String>,
    },
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ReviewError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ReviewError::Validation(_) => ErrorCode::Validation,
            ReviewError::Precondition(_)
            | ReviewError::IncompleteDocuments { .. }
            | ReviewError::TerminalState { .. } => ErrorCode::Precondition,
            ReviewError::Forbidden(_) => ErrorCode::Forbidden,
            ReviewError::NotFound { .. } => ErrorCode::NotFound,
            ReviewError::Conflict { .. } => ErrorCode::Conflict,
            ReviewError::AttachmentUpload { .. }
            | ReviewError::MessageWrite { .. }
            | ReviewError::Storage(_) => ErrorCode::Storage,
        }
    }
}

impl From<ReviewError> for ApiError {
    fn from(value: ReviewError) -> Self {
        let error = ApiError::new(value.code(), value.to_string());
        match value {
            ReviewError::IncompleteDocuments { unchecked, .. } => {
                error.with_details(json!({ "unchecked": unchecked }))
            }
            ReviewError::AttachmentUpload {
                index,
                filename,
                uploaded,
                orphaned,
                ..
            } => error.with_details(json!({
                "failed_step": "attachment_upload",
                "attachment_index": index,
                "filename": filename,
                "uploaded": uploaded,
                "orphaned": orphaned,
            })),
            ReviewError::MessageWrite {
                uploaded, orphaned, ..
            } => error.with_details(json!({
                "failed_step": "message_write",
                "uploaded": uploaded,
                "orphaned": orphaned,
            })),
            _ => error,
        }
    }
}
