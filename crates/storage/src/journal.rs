use std::{sync::Weak, time::Duration};

use anyhow::{Context, Result};
use sqlx::{sqlite::SqliteRow, Pool, Row, Sqlite};
use tokio::{
    sync::{broadcast, Notify},
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

use shared::domain::{EnrollmentId, MessageId, ProgramId};

use crate::RecordChange;

/// Writes from other processes are noticed within this interval. Local writes wake the
/// follower immediately.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(200);
const BATCH_SIZE: i64 = 256;
const RETENTION: &str = "-10 minutes";
const PRUNE_EVERY_POLLS: u32 = 300;

pub(crate) async fn latest_change_id(pool: &Pool<Sqlite>) -> Result<i64> {
    let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM record_changes")
        .fetch_one(pool)
        .await
        .context("failed to read change journal position")?;
    Ok(id.unwrap_or(0))
}

/// Republishes every journal row after `cursor` on `changes`. Stops once all storage
/// handles holding `wake` are dropped.
pub(crate) fn spawn_follower(
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<RecordChange>,
    wake: Weak<Notify>,
    mut cursor: i64,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut polls: u32 = 0;

        loop {
            {
                let Some(wake) = wake.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = ticker.tick() => {}
                }
            }

            match drain(&pool, &changes, cursor).await {
                Ok(next) => cursor = next,
                Err(error) => warn!(%error, "failed to read change journal"),
            }

            polls = polls.wrapping_add(1);
            if polls % PRUNE_EVERY_POLLS == 0 {
                match prune(&pool).await {
                    Ok(0) => {}
                    Ok(pruned) => debug!(pruned, "pruned change journal"),
                    Err(error) => warn!(%error, "failed to prune change journal"),
                }
            }
        }
        debug!("storage handles dropped; change journal follower stopped");
    });
}

async fn drain(
    pool: &Pool<Sqlite>,
    changes: &broadcast::Sender<RecordChange>,
    mut cursor: i64,
) -> Result<i64> {
    loop {
        let rows = sqlx::query(
            "SELECT id, kind, program_id, enrollment_id, message_id, status, receiver
             FROM record_changes WHERE id > ?
             ORDER BY id ASC LIMIT ?",
        )
        .bind(cursor)
        .bind(BATCH_SIZE)
        .fetch_all(pool)
        .await?;

        for row in &rows {
            cursor = row.get::<i64, _>(0);
            match change_from_row(row) {
                // No listeners is the common case, not an error.
                Some(change) => {
                    let _ = changes.send(change);
                }
                None => warn!(id = cursor, "skipping unreadable change journal row"),
            }
        }

        if (rows.len() as i64) < BATCH_SIZE {
            return Ok(cursor);
        }
    }
}

async fn prune(pool: &Pool<Sqlite>) -> Result<u64> {
    let pruned = sqlx::query("DELETE FROM record_changes WHERE recorded_at < datetime('now', ?)")
        .bind(RETENTION)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(pruned)
}

fn change_from_row(r: &SqliteRow) -> Option<RecordChange> {
    let program_id = r.get::<Option<i64>, _>(2).map(ProgramId);
    let enrollment_id = r.get::<Option<i64>, _>(3).map(EnrollmentId);
    let message_id = r.get::<Option<i64>, _>(4).map(MessageId);

    let change = match r.get::<String, _>(1).as_str() {
        "program_upserted" => RecordChange::ProgramUpserted {
            program_id: program_id?,
        },
        "program_deleted" => RecordChange::ProgramDeleted {
            program_id: program_id?,
        },
        "enrollment_created" => RecordChange::EnrollmentCreated {
            enrollment_id: enrollment_id?,
            program_id: program_id?,
        },
        "enrollment_updated" => RecordChange::EnrollmentUpdated {
            enrollment_id: enrollment_id?,
            program_id: program_id?,
            status: r.get::<Option<String>, _>(5)?.parse().ok()?,
        },
        "message_created" => RecordChange::MessageCreated {
            message_id: message_id?,
            receiver: r.get::<Option<String>, _>(6)?,
        },
        "message_read" => RecordChange::MessageRead {
            message_id: message_id?,
        },
        _ => return None,
    };
    Some(change)
}
