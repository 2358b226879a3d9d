use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use shared::{
    domain::{EnrollmentId, ProgramId, ProgramType, StudentId},
    protocol::ProgramDraft,
};
use storage::{BlobRef, BlobStore, NewStudent, Storage};

use crate::{checklist::document_prefix, ReviewContext};

pub(crate) const REGISTRAR: &str = "registrar@tip.edu.ph";

pub(crate) async fn context() -> ReviewContext {
    ReviewContext::new(Storage::new("sqlite::memory:").await.expect("db"))
}

pub(crate) fn draft(name: &str, slots: i64) -> ProgramDraft {
    ProgramDraft {
        name: name.to_string(),
        program_type: ProgramType::Internal,
        total_slots: slots,
        min_gwa: 1.75,
        eligibility: Default::default(),
        requirements: vec!["Transcript of Records".into()],
        benefits: vec!["Full tuition".into()],
        posted_by: REGISTRAR.into(),
    }
}

pub(crate) async fn seed_program(ctx: &ReviewContext, slots: i64) -> ProgramId {
    ctx.storage
        .create_program(&draft("Academic Excellence", slots))
        .await
        .expect("program")
}

pub(crate) async fn seed_student(ctx: &ReviewContext, email: &str) -> StudentId {
    ctx.storage
        .create_student(&NewStudent {
            first_name: "Juan",
            last_name: "Dela Cruz",
            school: "TIP Manila",
            course: "BSCS",
            email,
            profile_picture: None,
        })
        .await
        .expect("student")
}

pub(crate) async fn seed_enrollment(
    ctx: &ReviewContext,
    program_id: ProgramId,
    email: &str,
) -> (StudentId, EnrollmentId) {
    let student_id = seed_student(ctx, email).await;
    let enrollment_id = ctx
        .storage
        .create_enrollment(student_id, program_id)
        .await
        .expect("enrollment");
    (student_id, enrollment_id)
}

/// Writes a document blob directly, bypassing intake checks.
pub(crate) async fn put_document(
    ctx: &ReviewContext,
    student_id: StudentId,
    program_id: ProgramId,
    filename: &str,
) {
    let path = format!("{}{filename}", document_prefix(student_id, program_id));
    ctx.blobs
        .put(&path, filename.as_bytes(), Some("application/pdf"))
        .await
        .expect("document");
}

/// Blob store whose `fail_on_put`-th put (1-based) fails. Deletes fail when `fail_deletes` is set.
pub(crate) struct FlakyBlobStore {
    pub inner: Storage,
    pub fail_on_put: usize,
    pub fail_deletes: bool,
    pub puts: AtomicUsize,
}

impl FlakyBlobStore {
    pub(crate) fn new(inner: Storage, fail_on_put: usize, fail_deletes: bool) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_on_put,
            fail_deletes,
            puts: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn put(&self, path: &str, bytes: &[u8], mime_type: Option<&str>) -> Result<BlobRef> {
        let attempt = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_on_put {
            bail!("blob backend unavailable");
        }
        self.inner.put(path, bytes, mime_type).await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(path).await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<BlobRef>> {
        self.inner.list_by_prefix(prefix).await
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        if self.fail_deletes {
            bail!("blob backend refused delete");
        }
        self.inner.delete(path).await
    }
}
