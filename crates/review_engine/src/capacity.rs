use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use shared::{
    domain::ProgramId,
    protocol::{CapacitySnapshot, EnrollmentSummary},
};
use storage::{LiveQuery, Storage};
use tracing::info;

use crate::{catalog::get_program, enrollment::summary, ReviewContext, ReviewError};

pub type CapacitySubscription = LiveQuery<CapacitySnapshot>;
pub type EnrollmentListSubscription = LiveQuery<Vec<EnrollmentSummary>>;

/// Which enrollments occupy a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Every enrollment holds a slot, whatever its status.
    #[default]
    CountAll,
    /// Rejected applicants give their slot back.
    ExcludeRejected,
}

impl CapacityPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            CapacityPolicy::CountAll => "count_all",
            CapacityPolicy::ExcludeRejected => "exclude_rejected",
        }
    }
}

impl fmt::Display for CapacityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapacityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "count_all" => Ok(CapacityPolicy::CountAll),
            "exclude_rejected" => Ok(CapacityPolicy::ExcludeRejected),
            other => Err(format!("unknown capacity policy '{other}'")),
        }
    }
}

/// Never negative, even when a program is over-subscribed.
pub fn available_slots(total_slots: u32, enrolled: u32) -> u32 {
    total_slots.saturating_sub(enrolled)
}

async fn load_snapshot(
    storage: &Storage,
    program_id: ProgramId,
    policy: CapacityPolicy,
) -> anyhow::Result<Option<CapacitySnapshot>> {
    let Some(program) = storage.load_program(program_id).await? else {
        return Ok(None);
    };
    let enrolled = storage
        .count_enrollments(program_id, policy == CapacityPolicy::ExcludeRejected)
        .await?;
    Ok(Some(CapacitySnapshot {
        program_id,
        total_slots: program.total_slots,
        enrolled,
        available_slots: available_slots(program.total_slots, enrolled),
    }))
}

async fn load_enrollment_list(
    storage: &Storage,
    program_id: ProgramId,
) -> anyhow::Result<Option<Vec<EnrollmentSummary>>> {
    if storage.load_program(program_id).await?.is_none() {
        return Ok(None);
    }
    let records = storage.list_enrollments_for_program(program_id).await?;
    Ok(Some(records.iter().map(summary).collect()))
}

pub async fn capacity(
    ctx: &ReviewContext,
    program_id: ProgramId,
) -> Result<CapacitySnapshot, ReviewError> {
    load_snapshot(&ctx.storage, program_id, ctx.policy.capacity)
        .await?
        .ok_or_else(|| ReviewError::not_found("program", program_id))
}

/// Live capacity of one program. Every enrollment or program write touching it yields
/// a fresh snapshot; deleting the program ends the subscription.
pub async fn subscribe_capacity(
    ctx: &ReviewContext,
    program_id: ProgramId,
) -> Result<CapacitySubscription, ReviewError> {
    get_program(ctx, program_id).await?;
    let policy = ctx.policy.capacity;
    let query = ctx
        .storage
        .subscribe(
            move |change| change.touches_program(program_id),
            move |storage| async move { load_snapshot(&storage, program_id, policy).await },
        )
        .await?;
    info!(program_id = program_id.0, %policy, "capacity subscription started");
    Ok(query)
}

/// Live enrollment list of one program, in application order.
pub async fn subscribe_enrollments(
    ctx: &ReviewContext,
    program_id: ProgramId,
) -> Result<EnrollmentListSubscription, ReviewError> {
    get_program(ctx, program_id).await?;
    let query = ctx
        .storage
        .subscribe(
            move |change| change.touches_program(program_id),
            move |storage| async move { load_enrollment_list(&storage, program_id).await },
        )
        .await?;
    info!(program_id = program_id.0, "enrollment subscription started");
    Ok(query)
}

#[cfg(test)]
#[path = "tests/capacity_tests.rs"]
mod tests;
