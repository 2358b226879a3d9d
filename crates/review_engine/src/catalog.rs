use shared::{
    domain::ProgramId,
    protocol::{ProgramDraft, ProgramSummary},
};
use storage::ProgramRemoval;
use tracing::info;

use crate::{ReviewContext, ReviewError};

/// Form-level checks applied before any program write.
pub fn validate_program(draft: &ProgramDraft) -> Result<(), ReviewError> {
    if draft.name.trim().is_empty() {
        return Err(ReviewError::Validation(
            "Scholarship Program Name is required!".into(),
        ));
    }
    if draft.eligibility.courses.iter().any(|c| c.trim().is_empty()) {
        return Err(ReviewError::Validation(
            "All course information must be filled out.".into(),
        ));
    }
    if draft.requirements.iter().any(|r| r.trim().is_empty()) {
        return Err(ReviewError::Validation(
            "All requirement information must be filled out.".into(),
        ));
    }
    if draft.benefits.iter().any(|b| b.trim().is_empty()) {
        return Err(ReviewError::Validation(
            "All benefit information must be filled out.".into(),
        ));
    }
    if draft.total_slots <= 0 || u32::try_from(draft.total_slots).is_err() {
        return Err(ReviewError::Validation(
            "Please enter a valid number of slots.".into(),
        ));
    }
    if !draft.min_gwa.is_finite() || draft.min_gwa <= 0.0 {
        return Err(ReviewError::Validation(
            "Please enter a valid minimum GWA.".into(),
        ));
    }
    if draft.posted_by.trim().is_empty() {
        return Err(ReviewError::Validation("posting organization is required".into()));
    }
    Ok(())
}

pub async fn get_program(
    ctx: &ReviewContext,
    program_id: ProgramId,
) -> Result<ProgramSummary, ReviewError> {
    ctx.storage
        .load_program(program_id)
        .await?
        .ok_or_else(|| ReviewError::not_found("program", program_id))
}

pub async fn list_programs(
    ctx: &ReviewContext,
    posted_by: Option<&str>,
) -> Result<Vec<ProgramSummary>, ReviewError> {
    Ok(ctx.storage.list_programs(posted_by).await?)
}

pub async fn create_program(
    ctx: &ReviewContext,
    draft: &ProgramDraft,
) -> Result<ProgramSummary, ReviewError> {
    validate_program(draft)?;
    let program_id = ctx.storage.create_program(draft).await?;
    info!(program_id = program_id.0, name = %draft.name.trim(), "program posted");
    get_program(ctx, program_id).await
}

/// Replaces the editable fields; capacity observers pick up the new ceiling.
pub async fn update_program(
    ctx: &ReviewContext,
    program_id: ProgramId,
    draft: &ProgramDraft,
) -> Result<ProgramSummary, ReviewError> {
    validate_program(draft)?;
    if !ctx.storage.update_program(program_id, draft).await? {
        return Err(ReviewError::not_found("program", program_id));
    }
    info!(program_id = program_id.0, "program updated");
    get_program(ctx, program_id).await
}

/// Removes a program nobody has applied to. Messages that referenced it are kept without
/// the correlation. Enrollments are never deleted, so a program with applicants stays.
pub async fn delete_program(ctx: &ReviewContext, program_id: ProgramId) -> Result<(), ReviewError> {
    match ctx.storage.delete_program(program_id).await? {
        ProgramRemoval::Deleted => {
            info!(program_id = program_id.0, "program deleted");
            Ok(())
        }
        ProgramRemoval::NotFound => Err(ReviewError::not_found("program", program_id)),
        ProgramRemoval::HasEnrollments(enrolled) => Err(ReviewError::Precondition(format!(
            "program {program_id} has {enrolled} enrollment(s) and cannot be deleted"
        ))),
    }
}

#[cfg(test)]
#[path = "tests/catalog_tests.rs"]
mod tests;
