use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Eligibility, EnrollmentId, EnrollmentStatus, Identity, MessageId, MessageSubject,
        ProgramId, ProgramType, StudentId,
    },
    error::ApiError,
};

/// Fields an organization supplies when posting or editing a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDraft {
    pub name: String,
    pub program_type: ProgramType,
    pub total_slots: i64,
    pub min_gwa: f64,
    #[serde(default)]
    pub eligibility: Eligibility,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub benefits: Vec<String>,
    pub posted_by: Identity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSummary {
    pub program_id: ProgramId,
    pub name: String,
    pub program_type: ProgramType,
    pub total_slots: u32,
    pub min_gwa: f64,
    pub eligibility: Eligibility,
    pub requirements: Vec<String>,
    pub benefits: Vec<String>,
    pub posted_by: Identity,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentSummary {
    pub student_id: StudentId,
    pub first_name: String,
    pub last_name: String,
    pub school: String,
    pub course: String,
    pub email: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
}

impl StudentSummary {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentSummary {
    pub enrollment_id: EnrollmentId,
    pub student_id: StudentId,
    pub program_id: ProgramId,
    pub status: EnrollmentStatus,
    pub date_applied: DateTime<Utc>,
    pub remarks: String,
    pub checklist: BTreeMap<String, bool>,
}

/// One uploaded document as seen by a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEntry {
    pub document_id: String,
    pub blob_path: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub checked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistView {
    pub enrollment_id: EnrollmentId,
    pub status: EnrollmentStatus,
    pub documents: Vec<DocumentEntry>,
    pub all_checked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentDetail {
    pub enrollment: EnrollmentSummary,
    pub student: StudentSummary,
    pub program: ProgramSummary,
    pub checklist: ChecklistView,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub program_id: ProgramId,
    pub total_slots: u32,
    pub enrolled: u32,
    pub available_slots: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub blob_path: String,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender: Identity,
    pub receiver: Identity,
    pub subject: MessageSubject,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_id: Option<ProgramId>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenedMessage {
    pub message: MessagePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_name: Option<String>,
    /// True only for the open that flipped the read flag.
    pub newly_read: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub program_id: ProgramId,
    pub student_id: StudentId,
}

/// Attachment carried inline in a JSON send request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentUpload {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub content_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub sender: Identity,
    pub receiver: Identity,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub program_id: Option<ProgramId>,
    #[serde(default)]
    pub attachments: Vec<AttachmentUpload>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemarksRequest {
    pub remarks: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetChecklistItemRequest {
    pub checked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRequest {
    pub student_id: StudentId,
}

/// Events pushed to reviewer sessions over the program WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    CapacityUpdated {
        capacity: CapacitySnapshot,
    },
    EnrollmentsUpdated {
        program_id: ProgramId,
        enrollments: Vec<EnrollmentSummary>,
    },
    ProgramRemoved {
        program_id: ProgramId,
    },
    Error(ApiError),
}
