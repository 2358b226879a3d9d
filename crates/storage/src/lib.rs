use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use tokio::sync::{broadcast, Notify};

use shared::{
    domain::{
        EnrollmentId, EnrollmentStatus, Identity, MessageId, MessageSubject, ProgramId,
        StudentId,
    },
    protocol::{ProgramDraft, ProgramSummary, StudentSummary},
};

mod blob;
mod journal;
mod live;

pub use blob::{BlobRef, BlobStore};
pub use live::{LiveQuery, RecordChange};

const CHANGE_FEED_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<RecordChange>,
    journal: Arc<Notify>,
}

/// Outcome of [`Storage::delete_program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramRemoval {
    Deleted,
    NotFound,
    /// Enrollments still reference the program; nothing was removed.
    HasEnrollments(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEnrollment {
    pub enrollment_id: EnrollmentId,
    pub student_id: StudentId,
    pub program_id: ProgramId,
    pub status: EnrollmentStatus,
    pub remarks: String,
    pub checklist: BTreeMap<String, bool>,
    /// Bumped on every successful write; used for compare-and-set.
    pub revision: i64,
    pub date_applied: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    pub blob_path: String,
    pub filename: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub sender: Identity,
    pub receiver: Identity,
    pub subject: MessageSubject,
    pub body: String,
    pub program_id: Option<ProgramId>,
    pub attachments: Vec<StoredAttachment>,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub sender: &'a str,
    pub receiver: &'a str,
    pub subject: MessageSubject,
    pub body: &'a str,
    pub program_id: Option<ProgramId>,
    pub attachments: &'a [StoredAttachment],
}

#[derive(Debug, Clone)]
pub struct NewStudent<'a> {
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub school: &'a str,
    pub course: &'a str,
    pub email: &'a str,
    pub profile_picture: Option<&'a str>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens a private database, so an in-memory
        // store is pinned to a single connection that is never recycled.
        let pool_options = if is_in_memory(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let wake = Arc::new(Notify::new());
        let cursor = journal::latest_change_id(&pool).await?;
        journal::spawn_follower(pool.clone(), changes.clone(), Arc::downgrade(&wake), cursor);
        Ok(Self {
            pool,
            changes,
            journal: wake,
        })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Raw change feed: every write committed to the database, by this process or any
    /// other. Most callers want [`Storage::subscribe`] instead.
    pub fn watch_changes(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }

    /// Schema triggers journal every write; this only wakes the follower early for local ones.
    fn wake_journal(&self) {
        self.journal.notify_one();
    }

    pub async fn create_program(&self, draft: &ProgramDraft) -> Result<ProgramId> {
        let now = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO programs (name, program_type, total_slots, min_gwa, eligibility, requirements, benefits, posted_by, created_at, last_updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(draft.name.trim())
        .bind(draft.program_type.as_str())
        .bind(draft.total_slots)
        .bind(draft.min_gwa)
        .bind(serde_json::to_string(&draft.eligibility)?)
        .bind(serde_json::to_string(&draft.requirements)?)
        .bind(serde_json::to_string(&draft.benefits)?)
        .bind(&draft.posted_by)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert program")?;
        let program_id = ProgramId(rec.get::<i64, _>(0));
        self.wake_journal();
        Ok(program_id)
    }

    /// Returns `false` when the program does not exist.
    pub async fn update_program(&self, program_id: ProgramId, draft: &ProgramDraft) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE programs
             SET name = ?, program_type = ?, total_slots = ?, min_gwa = ?, eligibility = ?, requirements = ?, benefits = ?, last_updated = ?
             WHERE id = ?",
        )
        .bind(draft.name.trim())
        .bind(draft.program_type.as_str())
        .bind(draft.total_slots)
        .bind(draft.min_gwa)
        .bind(serde_json::to_string(&draft.eligibility)?)
        .bind(serde_json::to_string(&draft.requirements)?)
        .bind(serde_json::to_string(&draft.benefits)?)
        .bind(Utc::now())
        .bind(program_id.0)
        .execute(&self.pool)
        .await
        .context("failed to update program")?
        .rows_affected();

        if affected == 0 {
            return Ok(false);
        }
        self.wake_journal();
        Ok(true)
    }

    /// Deletes a program nobody has applied to. Messages keep their rows with the program
    /// correlation cleared.
    pub async fn delete_program(&self, program_id: ProgramId) -> Result<ProgramRemoval> {
        let affected = sqlx::query(
            "DELETE FROM programs
             WHERE id = ? AND NOT EXISTS (SELECT 1 FROM enrollments WHERE program_id = ?)",
        )
        .bind(program_id.0)
        .bind(program_id.0)
        .execute(&self.pool)
        .await
        .context("failed to delete program")?
        .rows_affected();
        if affected > 0 {
            self.wake_journal();
            return Ok(ProgramRemoval::Deleted);
        }
        if self.load_program(program_id).await?.is_none() {
            return Ok(ProgramRemoval::NotFound);
        }
        let enrolled = self.count_enrollments(program_id, false).await?;
        Ok(ProgramRemoval::HasEnrollments(enrolled))
    }

    pub async fn load_program(&self, program_id: ProgramId) -> Result<Option<ProgramSummary>> {
        let row = sqlx::query(
            "SELECT id, name, program_type, total_slots, min_gwa, eligibility, requirements, benefits, posted_by, created_at, last_updated
             FROM programs WHERE id = ?",
        )
        .bind(program_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| program_from_row(&r)).transpose()
    }

    pub async fn list_programs(&self, posted_by: Option<&str>) -> Result<Vec<ProgramSummary>> {
        let rows = match posted_by {
            Some(posted_by) => {
                sqlx::query(
                    "SELECT id, name, program_type, total_slots, min_gwa, eligibility, requirements, benefits, posted_by, created_at, last_updated
                     FROM programs WHERE posted_by = ? ORDER BY id ASC",
                )
                .bind(posted_by)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, name, program_type, total_slots, min_gwa, eligibility, requirements, benefits, posted_by, created_at, last_updated
                     FROM programs ORDER BY id ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(program_from_row).collect()
    }

    pub async fn create_student(&self, student: &NewStudent<'_>) -> Result<StudentId> {
        let rec = sqlx::query(
            "INSERT INTO students (first_name, last_name, school, course, email, profile_picture)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(student.first_name)
        .bind(student.last_name)
        .bind(student.school)
        .bind(student.course)
        .bind(student.email)
        .bind(student.profile_picture)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert student '{}'", student.email))?;
        Ok(StudentId(rec.get::<i64, _>(0)))
    }

    pub async fn load_student(&self, student_id: StudentId) -> Result<Option<StudentSummary>> {
        let row = sqlx::query(
            "SELECT id, first_name, last_name, school, course, email, profile_picture
             FROM students WHERE id = ?",
        )
        .bind(student_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| student_from_row(&r)))
    }

    pub async fn find_student_by_email(&self, email: &str) -> Result<Option<StudentSummary>> {
        let row = sqlx::query(
            "SELECT id, first_name, last_name, school, course, email, profile_picture
             FROM students WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| student_from_row(&r)))
    }

    pub async fn create_enrollment(
        &self,
        student_id: StudentId,
        program_id: ProgramId,
    ) -> Result<EnrollmentId> {
        let now = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO enrollments (student_id, program_id, status, remarks, checklist, revision, date_applied, last_updated)
             VALUES (?, ?, 'pending', '', '{}', 0, ?, ?)
             RETURNING id",
        )
        .bind(student_id.0)
        .bind(program_id.0)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to insert enrollment for student {} in program {}",
                student_id.0, program_id.0
            )
        })?;
        let enrollment_id = EnrollmentId(rec.get::<i64, _>(0));
        self.wake_journal();
        Ok(enrollment_id)
    }

    pub async fn load_enrollment(
        &self,
        enrollment_id: EnrollmentId,
    ) -> Result<Option<StoredEnrollment>> {
        let row = sqlx::query(
            "SELECT id, student_id, program_id, status, remarks, checklist, revision, date_applied, last_updated
             FROM enrollments WHERE id = ?",
        )
        .bind(enrollment_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| enrollment_from_row(&r)).transpose()
    }

    pub async fn find_enrollment(
        &self,
        student_id: StudentId,
        program_id: ProgramId,
    ) -> Result<Option<StoredEnrollment>> {
        let row = sqlx::query(
            "SELECT id, student_id, program_id, status, remarks, checklist, revision, date_applied, last_updated
             FROM enrollments WHERE student_id = ? AND program_id = ?",
        )
        .bind(student_id.0)
        .bind(program_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| enrollment_from_row(&r)).transpose()
    }

    pub async fn list_enrollments_for_program(
        &self,
        program_id: ProgramId,
    ) -> Result<Vec<StoredEnrollment>> {
        let rows = sqlx::query(
            "SELECT id, student_id, program_id, status, remarks, checklist, revision, date_applied, last_updated
             FROM enrollments WHERE program_id = ?
             ORDER BY date_applied ASC, id ASC",
        )
        .bind(program_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(enrollment_from_row).collect()
    }

    /// Counts enrollments referencing the program, optionally leaving rejected ones out.
    pub async fn count_enrollments(
        &self,
        program_id: ProgramId,
        exclude_rejected: bool,
    ) -> Result<u32> {
        let count: i64 = if exclude_rejected {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM enrollments WHERE program_id = ? AND status != 'rejected'",
            )
            .bind(program_id.0)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_scalar("SELECT COUNT(*) FROM enrollments WHERE program_id = ?")
                .bind(program_id.0)
                .fetch_one(&self.pool)
                .await?
        };
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Writes status, remarks and checklist only if the stored revision still equals
    /// `enrollment.revision`. Returns `false` on a lost race.
    pub async fn compare_and_swap_enrollment(&self, enrollment: &StoredEnrollment) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE enrollments
             SET status = ?, remarks = ?, checklist = ?, revision = revision + 1, last_updated = ?
             WHERE id = ? AND revision = ?",
        )
        .bind(enrollment.status.as_str())
        .bind(&enrollment.remarks)
        .bind(serde_json::to_string(&enrollment.checklist)?)
        .bind(Utc::now())
        .bind(enrollment.enrollment_id.0)
        .bind(enrollment.revision)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write enrollment {}", enrollment.enrollment_id.0))?
        .rows_affected();

        if affected == 0 {
            return Ok(false);
        }
        self.wake_journal();
        Ok(true)
    }

    pub async fn insert_message(&self, message: &NewMessage<'_>) -> Result<MessageId> {
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (sender, receiver, subject, body, program_id, sent_at, is_read)
             VALUES (?, ?, ?, ?, ?, ?, 0)
             RETURNING id",
        )
        .bind(message.sender)
        .bind(message.receiver)
        .bind(message.subject.as_str())
        .bind(message.body)
        .bind(message.program_id.map(|id| id.0))
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert message")?;
        let message_id = MessageId(rec.get::<i64, _>(0));

        for (position, attachment) in message.attachments.iter().enumerate() {
            sqlx::query(
                "INSERT INTO message_attachments (message_id, position, blob_path, filename, size_bytes, mime_type)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.0)
            .bind(i64::try_from(position).unwrap_or(i64::MAX))
            .bind(&attachment.blob_path)
            .bind(&attachment.filename)
            .bind(i64::try_from(attachment.size_bytes).unwrap_or(i64::MAX))
            .bind(attachment.mime_type.as_deref())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to record attachment '{}'", attachment.filename))?;
        }

        tx.commit().await?;
        self.wake_journal();
        Ok(message_id)
    }

    pub async fn load_message(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, sender, receiver, subject, body, program_id, sent_at, is_read
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut message = message_from_row(&row)?;
        message.attachments = self.load_attachments(message.message_id).await?;
        Ok(Some(message))
    }

    /// Messages addressed to `receiver`, most recent first.
    pub async fn list_messages_for_receiver(&self, receiver: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, sender, receiver, subject, body, program_id, sent_at, is_read
             FROM messages WHERE receiver = ?
             ORDER BY sent_at DESC, id DESC",
        )
        .bind(receiver)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_messages(rows).await
    }

    /// Messages sent by `sender`, most recent first.
    pub async fn list_messages_for_sender(&self, sender: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, sender, receiver, subject, body, program_id, sent_at, is_read
             FROM messages WHERE sender = ?
             ORDER BY sent_at DESC, id DESC",
        )
        .bind(sender)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_messages(rows).await
    }

    pub async fn unread_count(&self, receiver: &str) -> Result<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE receiver = ? AND is_read = 0")
                .bind(receiver)
                .fetch_one(&self.pool)
                .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Flips the read flag if `viewer` is the receiver and the message is still unread.
    /// Returns `true` only for the call that performed the flip.
    pub async fn mark_message_read(&self, message_id: MessageId, viewer: &str) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE messages SET is_read = 1 WHERE id = ? AND receiver = ? AND is_read = 0",
        )
        .bind(message_id.0)
        .bind(viewer)
        .execute(&self.pool)
        .await
        .context("failed to mark message read")?
        .rows_affected();
        if affected == 0 {
            return Ok(false);
        }
        self.wake_journal();
        Ok(true)
    }

    async fn load_attachments(&self, message_id: MessageId) -> Result<Vec<StoredAttachment>> {
        let rows = sqlx::query(
            "SELECT blob_path, filename, size_bytes, mime_type
             FROM message_attachments WHERE message_id = ?
             ORDER BY position ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredAttachment {
                blob_path: r.get::<String, _>(0),
                filename: r.get::<String, _>(1),
                size_bytes: r.get::<i64, _>(2).max(0) as u64,
                mime_type: r.get::<Option<String>, _>(3),
            })
            .collect())
    }

    async fn hydrate_messages(&self, rows: Vec<SqliteRow>) -> Result<Vec<StoredMessage>> {
        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let mut message = message_from_row(&row)?;
            message.attachments = self.load_attachments(message.message_id).await?;
            messages.push(message);
        }
        Ok(messages)
    }
}

fn program_from_row(r: &SqliteRow) -> Result<ProgramSummary> {
    let program_id = ProgramId(r.get::<i64, _>(0));
    let program_type = r
        .get::<String, _>(2)
        .parse()
        .with_context(|| format!("program {} has an invalid type", program_id.0))?;
    Ok(ProgramSummary {
        program_id,
        name: r.get::<String, _>(1),
        program_type,
        total_slots: u32::try_from(r.get::<i64, _>(3)).unwrap_or(0),
        min_gwa: r.get::<f64, _>(4),
        eligibility: serde_json::from_str(&r.get::<String, _>(5))
            .with_context(|| format!("program {} has corrupt eligibility", program_id.0))?,
        requirements: serde_json::from_str(&r.get::<String, _>(6))
            .with_context(|| format!("program {} has corrupt requirements", program_id.0))?,
        benefits: serde_json::from_str(&r.get::<String, _>(7))
            .with_context(|| format!("program {} has corrupt benefits", program_id.0))?,
        posted_by: r.get::<String, _>(8),
        created_at: r.get::<DateTime<Utc>, _>(9),
        last_updated: r.get::<DateTime<Utc>, _>(10),
    })
}

fn student_from_row(r: &SqliteRow) -> StudentSummary {
    StudentSummary {
        student_id: StudentId(r.get::<i64, _>(0)),
        first_name: r.get::<String, _>(1),
        last_name: r.get::<String, _>(2),
        school: r.get::<String, _>(3),
        course: r.get::<String, _>(4),
        email: r.get::<String, _>(5),
        profile_picture: r.get::<Option<String>, _>(6),
    }
}

fn enrollment_from_row(r: &SqliteRow) -> Result<StoredEnrollment> {
    let enrollment_id = EnrollmentId(r.get::<i64, _>(0));
    let status = r
        .get::<String, _>(3)
        .parse()
        .with_context(|| format!("enrollment {} has an invalid status", enrollment_id.0))?;
    let checklist = serde_json::from_str(&r.get::<String, _>(5))
        .with_context(|| format!("enrollment {} has a corrupt checklist", enrollment_id.0))?;
    Ok(StoredEnrollment {
        enrollment_id,
        student_id: StudentId(r.get::<i64, _>(1)),
        program_id: ProgramId(r.get::<i64, _>(2)),
        status,
        remarks: r.get::<String, _>(4),
        checklist,
        revision: r.get::<i64, _>(6),
        date_applied: r.get::<DateTime<Utc>, _>(7),
        last_updated: r.get::<DateTime<Utc>, _>(8),
    })
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    let message_id = MessageId(r.get::<i64, _>(0));
    let subject = r
        .get::<String, _>(3)
        .parse()
        .with_context(|| format!("message {} has an invalid subject", message_id.0))?;
    Ok(StoredMessage {
        message_id,
        sender: r.get::<String, _>(1),
        receiver: r.get::<String, _>(2),
        subject,
        body: r.get::<String, _>(4),
        program_id: r.get::<Option<i64>, _>(5).map(ProgramId),
        attachments: Vec::new(),
        sent_at: r.get::<DateTime<Utc>, _>(6),
        read: r.get::<bool, _>(7),
    })
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_in_memory(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
