use std::collections::BTreeMap;

use shared::{
    domain::{EnrollmentId, ProgramId, StudentId},
    protocol::{ChecklistView, DocumentEntry},
};
use storage::{BlobRef, StoredEnrollment};
use tracing::info;

use crate::{
    enrollment::{load_enrollment, status_after_checklist, write_enrollment},
    upload::validate_upload,
    ReviewContext, ReviewError,
};

/// Blob prefix under which an applicant's documents for one program live.
pub fn document_prefix(student_id: StudentId, program_id: ProgramId) -> String {
    format!("documents/{}/{}/", student_id.0, program_id.0)
}

/// Verification flags keyed by document id, reconciled against what is actually uploaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checklist {
    items: BTreeMap<String, bool>,
}

impl Checklist {
    /// Known documents keep their flag, new ones start unchecked and documents
    /// that disappeared from the blob store are dropped.
    pub fn reconcile(persisted: &BTreeMap<String, bool>, discovered: &[BlobRef]) -> Self {
        let items = discovered
            .iter()
            .map(|blob| {
                let id = blob.file_name().to_string();
                let checked = persisted.get(&id).copied().unwrap_or(false);
                (id, checked)
            })
            .collect();
        Self { items }
    }

    /// False for an empty checklist: nothing uploaded means nothing verified.
    pub fn all_checked(&self) -> bool {
        !self.items.is_empty() && self.items.values().all(|checked| *checked)
    }

    pub fn any_checked(&self) -> bool {
        self.items.values().any(|checked| *checked)
    }

    pub fn is_checked(&self, document_id: &str) -> Option<bool> {
        self.items.get(document_id).copied()
    }

    /// Flips one flag and returns the new value, or `None` for an unknown document.
    pub fn toggle(&mut self, document_id: &str) -> Option<bool> {
        let flag = self.items.get_mut(document_id)?;
        *flag = !*flag;
        Some(*flag)
    }

    /// Sets one flag and returns the previous value, or `None` for an unknown document.
    pub fn set(&mut self, document_id: &str, checked: bool) -> Option<bool> {
        let flag = self.items.get_mut(document_id)?;
        Some(std::mem::replace(flag, checked))
    }

    pub fn unchecked(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|(_, checked)| !**checked)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, bool> {
        &self.items
    }

    pub fn into_map(self) -> BTreeMap<String, bool> {
        self.items
    }
}

pub(crate) fn checklist_view(
    record: &StoredEnrollment,
    checklist: &Checklist,
    documents: &[BlobRef],
) -> ChecklistView {
    let documents = documents
        .iter()
        .map(|blob| {
            let document_id = blob.file_name().to_string();
            DocumentEntry {
                checked: checklist.is_checked(&document_id).unwrap_or(false),
                document_id,
                blob_path: blob.path.clone(),
                size_bytes: blob.size_bytes,
                mime_type: blob.mime_type.clone(),
            }
        })
        .collect();
    ChecklistView {
        enrollment_id: record.enrollment_id,
        status: record.status,
        documents,
        all_checked: checklist.all_checked(),
    }
}

pub(crate) async fn discover_documents(
    ctx: &ReviewContext,
    record: &StoredEnrollment,
) -> Result<Vec<BlobRef>, ReviewError> {
    let prefix = document_prefix(record.student_id, record.program_id);
    Ok(ctx.blobs.list_by_prefix(&prefix).await?)
}

/// Current checklist for a reviewer. Read-only: reconciliation is persisted with the next write.
pub async fn checklist(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
) -> Result<ChecklistView, ReviewError> {
    let record = load_enrollment(ctx, enrollment_id).await?;
    let documents = discover_documents(ctx, &record).await?;
    let reconciled = Checklist::reconcile(&record.checklist, &documents);
    Ok(checklist_view(&record, &reconciled, &documents))
}

pub async fn toggle_checklist_item(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
    document_id: &str,
) -> Result<ChecklistView, ReviewError> {
    update_item(ctx, enrollment_id, document_id, |checklist| {
        checklist.toggle(document_id).is_some()
    })
    .await
}

pub async fn set_checklist_item(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
    document_id: &str,
    checked: bool,
) -> Result<ChecklistView, ReviewError> {
    update_item(ctx, enrollment_id, document_id, |checklist| {
        checklist.set(document_id, checked).is_some()
    })
    .await
}

async fn update_item<F>(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
    document_id: &str,
    mut apply: F,
) -> Result<ChecklistView, ReviewError>
where
    F: FnMut(&mut Checklist) -> bool,
{
    let written = write_enrollment(ctx, enrollment_id, |draft| {
        if draft.record.status.is_terminal() {
            return Err(ReviewError::TerminalState {
                enrollment_id,
                status: draft.record.status,
            });
        }
        if !apply(&mut draft.checklist) {
            return Err(ReviewError::not_found("document", document_id));
        }
        let from = draft.record.status;
        draft.record.status = status_after_checklist(from, &draft.checklist);
        if from != draft.record.status {
            info!(
                enrollment_id = enrollment_id.0,
                from = %from,
                to = %draft.record.status,
                "checklist moved enrollment"
            );
        }
        Ok(true)
    })
    .await?;
    Ok(checklist_view(
        &written.record,
        &written.checklist,
        &written.documents,
    ))
}

/// Raw bytes of one uploaded document.
pub async fn document_content(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
    document_id: &str,
) -> Result<Vec<u8>, ReviewError> {
    if document_id.is_empty() || document_id.contains('/') || document_id.contains('\\') {
        return Err(ReviewError::not_found("document", document_id));
    }
    let record = load_enrollment(ctx, enrollment_id).await?;
    let path = format!("{}{document_id}", document_prefix(record.student_id, record.program_id));
    ctx.blobs
        .get(&path)
        .await?
        .ok_or_else(|| ReviewError::not_found("document", document_id))
}

/// Stores a document for an applicant's open enrollment. A re-uploaded document
/// replaces the old content and must be verified again.
pub async fn upload_document(
    ctx: &ReviewContext,
    student_id: StudentId,
    program_id: ProgramId,
    filename: &str,
    bytes: &[u8],
    mime_type: Option<&str>,
) -> Result<DocumentEntry, ReviewError> {
    let filename = validate_upload(filename, bytes, ctx.policy.max_attachment_bytes)?;
    let record = ctx
        .storage
        .find_enrollment(student_id, program_id)
        .await?
        .ok_or_else(|| {
            ReviewError::not_found("enrollment", format!("{student_id}/{program_id}"))
        })?;
    if record.status.is_terminal() {
        return Err(ReviewError::TerminalState {
            enrollment_id: record.enrollment_id,
            status: record.status,
        });
    }

    let path = format!("{}{filename}", document_prefix(student_id, program_id));
    let blob = ctx.blobs.put(&path, bytes, mime_type).await?;
    info!(
        enrollment_id = record.enrollment_id.0,
        document = filename,
        size_bytes = blob.size_bytes,
        "document uploaded"
    );

    if record.checklist.get(filename).copied().unwrap_or(false) {
        write_enrollment(ctx, record.enrollment_id, |draft| {
            if draft.record.status.is_terminal() {
                return Ok(false);
            }
            if draft.checklist.set(filename, false) != Some(true) {
                return Ok(false);
            }
            draft.record.status = status_after_checklist(draft.record.status, &draft.checklist);
            Ok(true)
        })
        .await?;
    }

    Ok(DocumentEntry {
        document_id: filename.to_string(),
        blob_path: blob.path,
        size_bytes: blob.size_bytes,
        mime_type: blob.mime_type,
        checked: false,
    })
}

#[cfg(test)]
#[path = "tests/checklist_tests.rs"]
mod tests;
