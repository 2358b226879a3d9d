use shared::{
    domain::{MessageId, MessageSubject, ProgramId},
    protocol::{AttachmentPayload, MessagePayload, OpenedMessage, ReplyTarget},
};
use storage::{NewMessage, StoredAttachment, StoredMessage};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{catalog::get_program, upload::validate_upload, ReviewContext, ReviewError};

#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub sender: String,
    pub receiver: String,
    /// Category name, either the wire form or the display label.
    pub subject: String,
    pub body: String,
    pub program_id: Option<ProgramId>,
    pub attachments: Vec<OutgoingAttachment>,
}

fn attachment_payload(attachment: StoredAttachment) -> AttachmentPayload {
    AttachmentPayload {
        blob_path: attachment.blob_path,
        filename: attachment.filename,
        size_bytes: attachment.size_bytes,
        mime_type: attachment.mime_type,
    }
}

fn message_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        sender: message.sender,
        receiver: message.receiver,
        subject: message.subject,
        body: message.body,
        program_id: message.program_id,
        attachments: message
            .attachments
            .into_iter()
            .map(attachment_payload)
            .collect(),
        sent_at: message.sent_at,
        read: message.read,
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, ReviewError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ReviewError::Validation(format!("{field} is required")));
    }
    Ok(value)
}

fn path_segment(identity: &str) -> String {
    identity.replace(['/', '\\'], "_")
}

/// Best-effort removal of blobs written for a send that did not complete.
/// Returns the paths that could not be removed.
async fn roll_back(ctx: &ReviewContext, uploaded: &[String]) -> Vec<String> {
    let mut orphaned = Vec::new();
    for path in uploaded {
        if let Err(err) = ctx.blobs.delete(path).await {
            error!(blob = %path, error = %format!("{err:#}"), "attachment rollback failed");
            orphaned.push(path.clone());
        }
    }
    orphaned
}

/// Uploads the attachments, then records the message. Any failure aborts the whole
/// send and removes what was already uploaded.
pub async fn send_message(
    ctx: &ReviewContext,
    message: OutgoingMessage,
) -> Result<MessagePayload, ReviewError> {
    let sender = required(&message.sender, "sender")?;
    let receiver = required(&message.receiver, "receiver")?;
    let subject: MessageSubject = required(&message.subject, "subject")?
        .parse()
        .map_err(|err: shared::domain::UnknownVariant| ReviewError::Validation(err.to_string()))?;
    let body = required(&message.body, "body")?;

    let mut filenames = Vec::with_capacity(message.attachments.len());
    for attachment in &message.attachments {
        filenames.push(validate_upload(
            &attachment.filename,
            &attachment.bytes,
            ctx.policy.max_attachment_bytes,
        )?);
    }
    if let Some(program_id) = message.program_id {
        get_program(ctx, program_id).await?;
    }

    let folder = message
        .program_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "general".to_string());
    let mut stored = Vec::with_capacity(message.attachments.len());
    let mut uploaded = Vec::with_capacity(message.attachments.len());
    for (index, (attachment, filename)) in message.attachments.iter().zip(&filenames).enumerate() {
        let path = format!(
            "attachments/{}/{folder}/{}-{filename}",
            path_segment(receiver),
            Uuid::new_v4()
        );
        match ctx
            .blobs
            .put(&path, &attachment.bytes, attachment.mime_type.as_deref())
            .await
        {
            Ok(blob) => {
                uploaded.push(blob.path.clone());
                stored.push(StoredAttachment {
                    blob_path: blob.path,
                    filename: filename.to_string(),
                    size_bytes: blob.size_bytes,
                    mime_type: blob.mime_type,
                });
            }
            Err(err) => {
                warn!(index, filename = %filename, error = %format!("{err:#}"), "attachment upload failed; aborting send");
                let orphaned = roll_back(ctx, &uploaded).await;
                return Err(ReviewError::AttachmentUpload {
                    index,
                    filename: filename.to_string(),
                    reason: format!("{err:#}"),
                    uploaded,
                    orphaned,
                });
            }
        }
    }

    let record = NewMessage {
        sender,
        receiver,
        subject,
        body,
        program_id: message.program_id,
        attachments: &stored,
    };
    let message_id = match ctx.storage.insert_message(&record).await {
        Ok(message_id) => message_id,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "message record write failed; rolling back attachments");
            let orphaned = roll_back(ctx, &uploaded).await;
            return Err(ReviewError::MessageWrite {
                reason: format!("{err:#}"),
                uploaded,
                orphaned,
            });
        }
    };

    info!(
        message_id = message_id.0,
        subject = subject.as_str(),
        attachments = stored.len(),
        "message sent"
    );
    let sent = ctx
        .storage
        .load_message(message_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("message", message_id))?;
    Ok(message_payload(sent))
}

async fn load_message(
    ctx: &ReviewContext,
    message_id: MessageId,
) -> Result<StoredMessage, ReviewError> {
    ctx.storage
        .load_message(message_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("message", message_id))
}

fn ensure_participant(message: &StoredMessage, viewer: &str) -> Result<(), ReviewError> {
    if message.sender != viewer && message.receiver != viewer {
        return Err(ReviewError::Forbidden(format!(
            "{viewer} is not a participant of message {}",
            message.message_id
        )));
    }
    Ok(())
}

/// Shows a message to one of its participants. The receiver's first open marks it read.
pub async fn open_message(
    ctx: &ReviewContext,
    message_id: MessageId,
    viewer: &str,
) -> Result<OpenedMessage, ReviewError> {
    let mut message = load_message(ctx, message_id).await?;
    ensure_participant(&message, viewer)?;

    let newly_read = if message.receiver == viewer && !message.read {
        ctx.storage.mark_message_read(message_id, viewer).await?
    } else {
        false
    };
    if newly_read {
        message.read = true;
        info!(message_id = message_id.0, "message read");
    } else if message.receiver == viewer {
        // A concurrent open may have flipped it first.
        message.read = true;
    }

    let program_name = match message.program_id {
        Some(program_id) => ctx
            .storage
            .load_program(program_id)
            .await?
            .map(|program| program.name),
        None => None,
    };
    Ok(OpenedMessage {
        message: message_payload(message),
        program_name,
        newly_read,
    })
}

/// Messages addressed to `receiver`, most recent first.
pub async fn inbox(ctx: &ReviewContext, receiver: &str) -> Result<Vec<MessagePayload>, ReviewError> {
    let messages = ctx.storage.list_messages_for_receiver(receiver).await?;
    Ok(messages.into_iter().map(message_payload).collect())
}

/// Messages sent by `sender`, most recent first.
pub async fn sent_messages(
    ctx: &ReviewContext,
    sender: &str,
) -> Result<Vec<MessagePayload>, ReviewError> {
    let messages = ctx.storage.list_messages_for_sender(sender).await?;
    Ok(messages.into_iter().map(message_payload).collect())
}

pub async fn unread_count(ctx: &ReviewContext, receiver: &str) -> Result<u32, ReviewError> {
    Ok(ctx.storage.unread_count(receiver).await?)
}

/// Bytes of one attachment, by its blob path. Only the sender and receiver may fetch it.
pub async fn attachment_content(
    ctx: &ReviewContext,
    message_id: MessageId,
    viewer: &str,
    blob_path: &str,
) -> Result<(AttachmentPayload, Vec<u8>), ReviewError> {
    let message = load_message(ctx, message_id).await?;
    ensure_participant(&message, viewer)?;
    let attachment = message
        .attachments
        .into_iter()
        .find(|attachment| attachment.blob_path == blob_path)
        .ok_or_else(|| ReviewError::not_found("attachment", blob_path))?;
    let bytes = ctx
        .blobs
        .get(&attachment.blob_path)
        .await?
        .ok_or_else(|| ReviewError::not_found("attachment", blob_path))?;
    Ok((attachment_payload(attachment), bytes))
}

/// Where a reviewer lands when replying to an applicant: the applicant's enrollment
/// profile for the program the message was about.
pub async fn reply_target(
    ctx: &ReviewContext,
    message_id: MessageId,
) -> Result<ReplyTarget, ReviewError> {
    let message = load_message(ctx, message_id).await?;
    let program_id = message.program_id.ok_or_else(|| {
        ReviewError::Precondition(format!("message {message_id} is not linked to a program"))
    })?;
    let student = ctx
        .storage
        .find_student_by_email(&message.sender)
        .await?
        .ok_or_else(|| ReviewError::not_found("student", &message.sender))?;
    Ok(ReplyTarget {
        program_id,
        student_id: student.student_id,
    })
}

#[cfg(test)]
#[path = "tests/messaging_tests.rs"]
mod tests;
