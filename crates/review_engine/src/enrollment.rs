use shared::{
    domain::{EnrollmentId, EnrollmentStatus, ProgramId, StudentId},
    protocol::{EnrollmentDetail, EnrollmentSummary},
};
use storage::{BlobRef, StoredEnrollment};
use tracing::{info, warn};

use crate::{
    capacity::capacity,
    catalog::get_program,
    checklist::{checklist_view, discover_documents, Checklist},
    ReviewContext, ReviewError,
};

/// Attempts at a compare-and-set write before reporting a conflict.
pub(crate) const MAX_WRITE_ATTEMPTS: usize = 5;

/// Snapshot an enrollment write is computed from.
pub(crate) struct EnrollmentDraft {
    pub record: StoredEnrollment,
    pub checklist: Checklist,
    pub documents: Vec<BlobRef>,
}

/// Status implied by the checklist after an item changed. Terminal states never move.
pub(crate) fn status_after_checklist(
    current: EnrollmentStatus,
    checklist: &Checklist,
) -> EnrollmentStatus {
    match current {
        EnrollmentStatus::Pending if checklist.any_checked() => EnrollmentStatus::Processing,
        EnrollmentStatus::Processing if !checklist.any_checked() => EnrollmentStatus::Pending,
        other => other,
    }
}

pub(crate) async fn load_enrollment(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
) -> Result<StoredEnrollment, ReviewError> {
    ctx.storage
        .load_enrollment(enrollment_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("enrollment", enrollment_id))
}

/// Read-modify-write of one enrollment. `apply` sees a fresh record with its checklist
/// reconciled against the uploaded documents and returns whether anything must be
/// written. Lost races are retried from a new read.
pub(crate) async fn write_enrollment<F>(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
    mut apply: F,
) -> Result<EnrollmentDraft, ReviewError>
where
    F: FnMut(&mut EnrollmentDraft) -> Result<bool, ReviewError>,
{
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        let record = load_enrollment(ctx, enrollment_id).await?;
        let documents = discover_documents(ctx, &record).await?;
        let checklist = Checklist::reconcile(&record.checklist, &documents);
        let mut draft = EnrollmentDraft {
            record,
            checklist,
            documents,
        };

        if !apply(&mut draft)? {
            return Ok(draft);
        }
        draft.record.checklist = draft.checklist.as_map().clone();
        if ctx.storage.compare_and_swap_enrollment(&draft.record).await? {
            draft.record.revision += 1;
            return Ok(draft);
        }
        warn!(
            enrollment_id = enrollment_id.0,
            attempt, "enrollment changed concurrently; retrying"
        );
    }
    Err(ReviewError::Conflict {
        enrollment_id,
        attempts: MAX_WRITE_ATTEMPTS,
    })
}

pub(crate) fn summary(record: &StoredEnrollment) -> EnrollmentSummary {
    EnrollmentSummary {
        enrollment_id: record.enrollment_id,
        student_id: record.student_id,
        program_id: record.program_id,
        status: record.status,
        date_applied: record.date_applied,
        remarks: record.remarks.clone(),
        checklist: record.checklist.clone(),
    }
}

/// Approves once every uploaded document is verified. Approving twice is a no-op.
pub async fn approve(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
) -> Result<EnrollmentSummary, ReviewError> {
    let mut from = None;
    let written = write_enrollment(ctx, enrollment_id, |draft| {
        match draft.record.status {
            EnrollmentStatus::Approved => return Ok(false),
            EnrollmentStatus::Rejected => {
                return Err(ReviewError::TerminalState {
                    enrollment_id,
                    status: EnrollmentStatus::Rejected,
                })
            }
            EnrollmentStatus::Pending | EnrollmentStatus::Processing => {}
        }
        if draft.checklist.is_empty() {
            return Err(ReviewError::Precondition(format!(
                "enrollment {enrollment_id} has no uploaded documents to verify"
            )));
        }
        if !draft.checklist.all_checked() {
            return Err(ReviewError::IncompleteDocuments {
                enrollment_id,
                unchecked: draft.checklist.unchecked(),
            });
        }
        from = Some(draft.record.status);
        draft.record.status = EnrollmentStatus::Approved;
        Ok(true)
    })
    .await?;

    if let Some(from) = from {
        info!(
            enrollment_id = enrollment_id.0,
            program_id = written.record.program_id.0,
            from = %from,
            to = %EnrollmentStatus::Approved,
            "enrollment approved"
        );
    }
    Ok(summary(&written.record))
}

/// Rejects without any checklist precondition. Rejecting twice is a no-op.
pub async fn reject(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
    remarks: Option<&str>,
) -> Result<EnrollmentSummary, ReviewError> {
    let mut from = None;
    let written = write_enrollment(ctx, enrollment_id, |draft| {
        match draft.record.status {
            EnrollmentStatus::Rejected => return Ok(false),
            EnrollmentStatus::Approved => {
                return Err(ReviewError::TerminalState {
                    enrollment_id,
                    status: EnrollmentStatus::Approved,
                })
            }
            EnrollmentStatus::Pending | EnrollmentStatus::Processing => {}
        }
        if let Some(remarks) = remarks {
            draft.record.remarks = remarks.trim().to_string();
        }
        from = Some(draft.record.status);
        draft.record.status = EnrollmentStatus::Rejected;
        Ok(true)
    })
    .await?;

    if let Some(from) = from {
        info!(
            enrollment_id = enrollment_id.0,
            program_id = written.record.program_id.0,
            from = %from,
            to = %EnrollmentStatus::Rejected,
            "enrollment rejected"
        );
    }
    Ok(summary(&written.record))
}

/// Replaces the reviewer remarks. Allowed in every state.
pub async fn save_remarks(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
    remarks: &str,
) -> Result<EnrollmentSummary, ReviewError> {
    let remarks = remarks.trim();
    let written = write_enrollment(ctx, enrollment_id, |draft| {
        if draft.record.remarks == remarks {
            return Ok(false);
        }
        draft.record.remarks = remarks.to_string();
        Ok(true)
    })
    .await?;
    Ok(summary(&written.record))
}

/// Opens a pending enrollment for a student. Full programs turn applicants away.
pub async fn submit_application(
    ctx: &ReviewContext,
    student_id: StudentId,
    program_id: ProgramId,
) -> Result<EnrollmentSummary, ReviewError> {
    ctx.storage
        .load_student(student_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("student", student_id))?;
    get_program(ctx, program_id).await?;

    if ctx
        .storage
        .find_enrollment(student_id, program_id)
        .await?
        .is_some()
    {
        return Err(ReviewError::Validation(format!(
            "student {student_id} has already applied to program {program_id}"
        )));
    }
    let snapshot = capacity(ctx, program_id).await?;
    if snapshot.available_slots == 0 {
        return Err(ReviewError::Precondition(format!(
            "program {program_id} has no available slots"
        )));
    }

    let enrollment_id = ctx.storage.create_enrollment(student_id, program_id).await?;
    info!(
        enrollment_id = enrollment_id.0,
        program_id = program_id.0,
        student_id = student_id.0,
        "application submitted"
    );
    Ok(summary(&load_enrollment(ctx, enrollment_id).await?))
}

/// Enrollments of a program in application order.
pub async fn list_enrollments(
    ctx: &ReviewContext,
    program_id: ProgramId,
) -> Result<Vec<EnrollmentSummary>, ReviewError> {
    get_program(ctx, program_id).await?;
    let records = ctx.storage.list_enrollments_for_program(program_id).await?;
    Ok(records.iter().map(summary).collect())
}

pub async fn enrollment_detail(
    ctx: &ReviewContext,
    enrollment_id: EnrollmentId,
) -> Result<EnrollmentDetail, ReviewError> {
    let record = load_enrollment(ctx, enrollment_id).await?;
    let student = ctx
        .storage
        .load_student(record.student_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("student", record.student_id))?;
    let program = get_program(ctx, record.program_id).await?;
    let documents = discover_documents(ctx, &record).await?;
    let reconciled = Checklist::reconcile(&record.checklist, &documents);
    let mut enrollment = summary(&record);
    enrollment.checklist = reconciled.as_map().clone();
    Ok(EnrollmentDetail {
        enrollment,
        student,
        program,
        checklist: checklist_view(&record, &reconciled, &documents),
    })
}

#[cfg(test)]
#[path = "tests/enrollment_tests.rs"]
mod tests;
