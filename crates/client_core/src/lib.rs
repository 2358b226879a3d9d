//! HTTP and WebSocket client for reviewer sessions.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    domain::{EnrollmentId, MessageId, MessageSubject, ProgramId, StudentId},
    error::{ApiError, ErrorCode},
    protocol::{
        ApplicationRequest, AttachmentUpload, CapacitySnapshot, ChecklistView, DocumentEntry,
        EnrollmentDetail, EnrollmentSummary, MessagePayload, OpenedMessage, ProgramDraft,
        ProgramSummary, RejectRequest, RemarksRequest, ReplyTarget, SendMessageRequest,
        SetChecklistItemRequest,
    },
};
use tracing::info;
use url::Url;

mod error;
mod feed;

pub use error::ClientError;
pub use feed::ProgramFeed;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// A file attached to an outgoing notice.
#[derive(Debug, Clone)]
pub struct AttachmentFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender: String,
    pub receiver: String,
    pub subject: MessageSubject,
    pub body: String,
    pub program_id: Option<ProgramId>,
    pub attachments: Vec<AttachmentFile>,
}

impl MessageDraft {
    fn into_request(self) -> SendMessageRequest {
        SendMessageRequest {
            sender: self.sender,
            receiver: self.receiver,
            subject: self.subject.as_str().to_string(),
            body: self.body,
            program_id: self.program_id,
            attachments: self
                .attachments
                .into_iter()
                .map(|file| AttachmentUpload {
                    filename: file.filename,
                    mime_type: file.mime_type,
                    content_b64: STANDARD.encode(file.bytes),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UnreadResponse {
    unread: u32,
}

pub struct ReviewClient {
    http: Client,
    base: Url,
}

impl ReviewClient {
    pub fn new(server_url: &str) -> Result<Self> {
        let base =
            Url::parse(server_url).map_err(|_| ClientError::InvalidUrl(server_url.to_string()))?;
        if !matches!(base.scheme(), "http" | "https") || base.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(server_url.to_string()));
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    pub fn server_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// WebSocket address of a program's live feed.
    pub fn feed_url(&self, program_id: ProgramId) -> Result<Url> {
        let mut url = self.endpoint(&["ws", "programs", &program_id.to_string()])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidUrl(self.base.to_string()))?;
        Ok(url)
    }

    async fn execute(request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<ApiError>(&body)
            .unwrap_or_else(|_| ApiError::new(ErrorCode::Internal, body));
        Err(ClientError::Api {
            status: status.as_u16(),
            error,
        })
    }

    async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
        Ok(Self::execute(request).await?.json().await?)
    }

    async fn bytes(request: RequestBuilder) -> Result<Vec<u8>> {
        Ok(Self::execute(request).await?.bytes().await?.to_vec())
    }

    pub async fn health(&self) -> Result<()> {
        Self::execute(self.http.get(self.endpoint(&["healthz"])?)).await?;
        Ok(())
    }

    pub async fn list_programs(&self, posted_by: Option<&str>) -> Result<Vec<ProgramSummary>> {
        let mut request = self.http.get(self.endpoint(&["programs"])?);
        if let Some(posted_by) = posted_by {
            request = request.query(&[("posted_by", posted_by)]);
        }
        Self::json(request).await
    }

    pub async fn get_program(&self, program_id: ProgramId) -> Result<ProgramSummary> {
        let url = self.endpoint(&["programs", &program_id.to_string()])?;
        Self::json(self.http.get(url)).await
    }

    pub async fn create_program(&self, draft: &ProgramDraft) -> Result<ProgramSummary> {
        let program: ProgramSummary =
            Self::json(self.http.post(self.endpoint(&["programs"])?).json(draft)).await?;
        info!(program_id = program.program_id.0, "program created");
        Ok(program)
    }

    pub async fn update_program(
        &self,
        program_id: ProgramId,
        draft: &ProgramDraft,
    ) -> Result<ProgramSummary> {
        let url = self.endpoint(&["programs", &program_id.to_string()])?;
        Self::json(self.http.put(url).json(draft)).await
    }

    pub async fn delete_program(&self, program_id: ProgramId) -> Result<()> {
        let url = self.endpoint(&["programs", &program_id.to_string()])?;
        Self::execute(self.http.delete(url)).await?;
        Ok(())
    }

    pub async fn capacity(&self, program_id: ProgramId) -> Result<CapacitySnapshot> {
        let url = self.endpoint(&["programs", &program_id.to_string(), "capacity"])?;
        Self::json(self.http.get(url)).await
    }

    pub async fn list_enrollments(&self, program_id: ProgramId) -> Result<Vec<EnrollmentSummary>> {
        let url = self.endpoint(&["programs", &program_id.to_string(), "enrollments"])?;
        Self::json(self.http.get(url)).await
    }

    pub async fn submit_application(
        &self,
        program_id: ProgramId,
        student_id: StudentId,
    ) -> Result<EnrollmentSummary> {
        let url = self.endpoint(&["programs", &program_id.to_string(), "applications"])?;
        Self::json(self.http.post(url).json(&ApplicationRequest { student_id })).await
    }

    pub async fn upload_document(
        &self,
        program_id: ProgramId,
        student_id: StudentId,
        file: AttachmentFile,
    ) -> Result<DocumentEntry> {
        let url = self.endpoint(&["programs", &program_id.to_string(), "documents"])?;
        let student = student_id.to_string();
        let mut query = vec![("student_id", student.as_str()), ("filename", file.filename.as_str())];
        if let Some(mime) = file.mime_type.as_deref() {
            query.push(("mime_type", mime));
        }
        let request = self.http.post(url).query(&query).body(file.bytes);
        Self::json(request).await
    }

    pub async fn enrollment_detail(&self, enrollment_id: EnrollmentId) -> Result<EnrollmentDetail> {
        let url = self.endpoint(&["enrollments", &enrollment_id.to_string()])?;
        Self::json(self.http.get(url)).await
    }

    pub async fn toggle_checklist_item(
        &self,
        enrollment_id: EnrollmentId,
        document_id: &str,
    ) -> Result<ChecklistView> {
        let url = self.endpoint(&[
            "enrollments",
            &enrollment_id.to_string(),
            "checklist",
            document_id,
            "toggle",
        ])?;
        Self::json(self.http.post(url)).await
    }

    pub async fn set_checklist_item(
        &self,
        enrollment_id: EnrollmentId,
        document_id: &str,
        checked: bool,
    ) -> Result<ChecklistView> {
        let url = self.endpoint(&[
            "enrollments",
            &enrollment_id.to_string(),
            "checklist",
            document_id,
        ])?;
        Self::json(self.http.put(url).json(&SetChecklistItemRequest { checked })).await
    }

    pub async fn document_content(
        &self,
        enrollment_id: EnrollmentId,
        document_id: &str,
    ) -> Result<Vec<u8>> {
        let url = self.endpoint(&[
            "enrollments",
            &enrollment_id.to_string(),
            "documents",
            document_id,
        ])?;
        Self::bytes(self.http.get(url)).await
    }

    pub async fn approve(&self, enrollment_id: EnrollmentId) -> Result<EnrollmentSummary> {
        let url = self.endpoint(&["enrollments", &enrollment_id.to_string(), "approve"])?;
        Self::json(self.http.post(url)).await
    }

    pub async fn reject(
        &self,
        enrollment_id: EnrollmentId,
        remarks: Option<&str>,
    ) -> Result<EnrollmentSummary> {
        let url = self.endpoint(&["enrollments", &enrollment_id.to_string(), "reject"])?;
        let body = RejectRequest {
            remarks: remarks.map(str::to_string),
        };
        Self::json(self.http.post(url).json(&body)).await
    }

    pub async fn save_remarks(
        &self,
        enrollment_id: EnrollmentId,
        remarks: &str,
    ) -> Result<EnrollmentSummary> {
        let url = self.endpoint(&["enrollments", &enrollment_id.to_string(), "remarks"])?;
        let body = RemarksRequest {
            remarks: remarks.to_string(),
        };
        Self::json(self.http.put(url).json(&body)).await
    }

    pub async fn send_message(&self, draft: MessageDraft) -> Result<MessagePayload> {
        let request = draft.into_request();
        let message: MessagePayload =
            Self::json(self.http.post(self.endpoint(&["messages"])?).json(&request)).await?;
        info!(
            message_id = message.message_id.0,
            attachments = message.attachments.len(),
            "message sent"
        );
        Ok(message)
    }

    pub async fn inbox(&self, identity: &str) -> Result<Vec<MessagePayload>> {
        let url = self.endpoint(&["messages", "inbox"])?;
        Self::json(self.http.get(url).query(&[("identity", identity)])).await
    }

    pub async fn sent_messages(&self, identity: &str) -> Result<Vec<MessagePayload>> {
        let url = self.endpoint(&["messages", "sent"])?;
        Self::json(self.http.get(url).query(&[("identity", identity)])).await
    }

    pub async fn unread_count(&self, identity: &str) -> Result<u32> {
        let url = self.endpoint(&["messages", "unread"])?;
        let body: UnreadResponse =
            Self::json(self.http.get(url).query(&[("identity", identity)])).await?;
        Ok(body.unread)
    }

    pub async fn open_message(&self, message_id: MessageId, viewer: &str) -> Result<OpenedMessage> {
        let url = self.endpoint(&["messages", &message_id.to_string(), "open"])?;
        Self::json(self.http.post(url).query(&[("viewer", viewer)])).await
    }

    pub async fn reply_target(&self, message_id: MessageId) -> Result<ReplyTarget> {
        let url = self.endpoint(&["messages", &message_id.to_string(), "reply_target"])?;
        Self::json(self.http.get(url)).await
    }

    pub async fn attachment_content(
        &self,
        message_id: MessageId,
        viewer: &str,
        blob_path: &str,
    ) -> Result<Vec<u8>> {
        let url = self.endpoint(&["messages", &message_id.to_string(), "attachments"])?;
        Self::bytes(
            self.http
                .get(url)
                .query(&[("viewer", viewer), ("path", blob_path)]),
        )
        .await
    }

    /// Opens the live capacity and enrollment feed of one program.
    pub async fn program_feed(&self, program_id: ProgramId) -> Result<ProgramFeed> {
        ProgramFeed::connect(self.feed_url(program_id)?, program_id).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
