use super::*;
use shared::{domain::ProgramType, protocol::ProgramDraft};

fn draft(name: &str, slots: i64) -> ProgramDraft {
    ProgramDraft {
        name: name.to_string(),
        program_type: ProgramType::Internal,
        total_slots: slots,
        min_gwa: 1.75,
        eligibility: Default::default(),
        requirements: vec!["Transcript of Records".into()],
        benefits: vec!["Full tuition".into()],
        posted_by: "registrar@tip.edu.ph".into(),
    }
}

async fn seed_student(storage: &Storage, email: &str) -> StudentId {
    storage
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

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("funded_futures_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn stores_and_lists_programs_by_poster() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let first = storage
        .create_program(&draft("Academic Excellence", 5))
        .await
        .expect("program");
    let mut other = draft("Athletic Grant", 2);
    other.posted_by = "sports@tip.edu.ph".into();
    storage.create_program(&other).await.expect("program");

    let registrar = storage
        .list_programs(Some("registrar@tip.edu.ph"))
        .await
        .expect("list");
    assert_eq!(registrar.len(), 1);
    assert_eq!(registrar[0].program_id, first);
    assert_eq!(registrar[0].total_slots, 5);
    assert_eq!(registrar[0].requirements, vec!["Transcript of Records"]);

    let all = storage.list_programs(None).await.expect("list");
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn schema_rejects_non_positive_slots() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage.create_program(&draft("Broken", 0)).await.is_err());
}

#[tokio::test]
async fn one_enrollment_per_student_and_program() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let program = storage
        .create_program(&draft("Academic Excellence", 5))
        .await
        .expect("program");
    let student = seed_student(&storage, "juan@student.tip.edu.ph").await;

    storage
        .create_enrollment(student, program)
        .await
        .expect("first enrollment");
    assert!(storage.create_enrollment(student, program).await.is_err());
}

#[tokio::test]
async fn compare_and_swap_rejects_stale_revision() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let program = storage
        .create_program(&draft("Academic Excellence", 5))
        .await
        .expect("program");
    let student = seed_student(&storage, "juan@student.tip.edu.ph").await;
    let enrollment_id = storage
        .create_enrollment(student, program)
        .await
        .expect("enrollment");

    let loaded = storage
        .load_enrollment(enrollment_id)
        .await
        .expect("load")
        .expect("exists");
    let mut first = loaded.clone();
    first.remarks = "first writer".into();
    let mut second = loaded;
    second.remarks = "second writer".into();

    assert!(storage.compare_and_swap_enrollment(&first).await.expect("cas"));
    assert!(!storage.compare_and_swap_enrollment(&second).await.expect("cas"));

    let stored = storage
        .load_enrollment(enrollment_id)
        .await
        .expect("load")
        .expect("exists");
    assert_eq!(stored.remarks, "first writer");
    assert_eq!(stored.revision, 1);
}

#[tokio::test]
async fn counts_enrollments_with_and_without_rejected() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let program = storage
        .create_program(&draft("Academic Excellence", 5))
        .await
        .expect("program");
    let a = seed_student(&storage, "a@student.tip.edu.ph").await;
    let b = seed_student(&storage, "b@student.tip.edu.ph").await;
    storage.create_enrollment(a, program).await.expect("a");
    let rejected = storage.create_enrollment(b, program).await.expect("b");

    let mut record = storage
        .load_enrollment(rejected)
        .await
        .expect("load")
        .expect("exists");
    record.status = EnrollmentStatus::Rejected;
    assert!(storage.compare_and_swap_enrollment(&record).await.expect("cas"));

    assert_eq!(storage.count_enrollments(program, false).await.expect("count"), 2);
    assert_eq!(storage.count_enrollments(program, true).await.expect("count"), 1);
}

#[tokio::test]
async fn program_with_enrollments_is_not_deleted() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let program = storage
        .create_program(&draft("Academic Excellence", 5))
        .await
        .expect("program");
    let student = seed_student(&storage, "juan@student.tip.edu.ph").await;
    let enrollment = storage
        .create_enrollment(student, program)
        .await
        .expect("enrollment");

    assert_eq!(
        storage.delete_program(program).await.expect("delete"),
        ProgramRemoval::HasEnrollments(1)
    );
    assert!(storage.load_program(program).await.expect("load").is_some());
    assert!(storage
        .load_enrollment(enrollment)
        .await
        .expect("load")
        .is_some());
}

#[tokio::test]
async fn deleting_empty_program_orphans_messages() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let program = storage
        .create_program(&draft("Academic Excellence", 5))
        .await
        .expect("program");
    let message = storage
        .insert_message(&NewMessage {
            sender: "registrar@tip.edu.ph",
            receiver: "juan@student.tip.edu.ph",
            subject: MessageSubject::General,
            body: "Welcome",
            program_id: Some(program),
            attachments: &[],
        })
        .await
        .expect("message");

    assert_eq!(
        storage.delete_program(program).await.expect("delete"),
        ProgramRemoval::Deleted
    );
    let orphan = storage
        .load_message(message)
        .await
        .expect("load")
        .expect("message survives");
    assert_eq!(orphan.program_id, None);
    assert_eq!(
        storage.delete_program(program).await.expect("second delete"),
        ProgramRemoval::NotFound
    );
}

#[tokio::test]
async fn change_feed_reports_writes_in_commit_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let mut changes = storage.watch_changes();

    let program = storage
        .create_program(&draft("Academic Excellence", 5))
        .await
        .expect("program");
    let student = seed_student(&storage, "juan@student.tip.edu.ph").await;
    let enrollment = storage
        .create_enrollment(student, program)
        .await
        .expect("enrollment");
    let mut stored = storage
        .load_enrollment(enrollment)
        .await
        .expect("load")
        .expect("stored");
    stored.status = EnrollmentStatus::Processing;
    assert!(storage
        .compare_and_swap_enrollment(&stored)
        .await
        .expect("cas"));

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let change = tokio::time::timeout(std::time::Duration::from_secs(5), changes.recv())
            .await
            .expect("change within deadline")
            .expect("feed open");
        seen.push(change);
    }
    assert_eq!(
        seen,
        vec![
            RecordChange::ProgramUpserted { program_id: program },
            RecordChange::EnrollmentCreated {
                enrollment_id: enrollment,
                program_id: program,
            },
            RecordChange::EnrollmentUpdated {
                enrollment_id: enrollment,
                program_id: program,
                status: EnrollmentStatus::Processing,
            },
        ]
    );
}

#[tokio::test]
async fn inbox_is_most_recent_first_with_attachments() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let attachment = StoredAttachment {
        blob_path: "attachments/juan@student.tip.edu.ph/general/1-guide.pdf".into(),
        filename: "guide.pdf".into(),
        size_bytes: 42,
        mime_type: Some("application/pdf".into()),
    };
    let older = storage
        .insert_message(&NewMessage {
            sender: "registrar@tip.edu.ph",
            receiver: "juan@student.tip.edu.ph",
            subject: MessageSubject::DocumentRequest,
            body: "Please upload your TOR",
            program_id: None,
            attachments: std::slice::from_ref(&attachment),
        })
        .await
        .expect("older");
    let newer = storage
        .insert_message(&NewMessage {
            sender: "registrar@tip.edu.ph",
            receiver: "juan@student.tip.edu.ph",
            subject: MessageSubject::InterviewSchedule,
            body: "Interview on Monday",
            program_id: None,
            attachments: &[],
        })
        .await
        .expect("newer");

    let inbox = storage
        .list_messages_for_receiver("juan@student.tip.edu.ph")
        .await
        .expect("inbox");
    assert_eq!(
        inbox.iter().map(|m| m.message_id).collect::<Vec<_>>(),
        vec![newer, older]
    );
    assert_eq!(inbox[1].attachments, vec![attachment]);
    assert_eq!(
        storage
            .unread_count("juan@student.tip.edu.ph")
            .await
            .expect("unread"),
        2
    );
}

#[tokio::test]
async fn only_receiver_flips_read_flag_and_only_once() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let message = storage
        .insert_message(&NewMessage {
            sender: "registrar@tip.edu.ph",
            receiver: "juan@student.tip.edu.ph",
            subject: MessageSubject::General,
            body: "Hello",
            program_id: None,
            attachments: &[],
        })
        .await
        .expect("message");

    assert!(!storage
        .mark_message_read(message, "registrar@tip.edu.ph")
        .await
        .expect("sender open"));
    assert!(storage
        .mark_message_read(message, "juan@student.tip.edu.ph")
        .await
        .expect("first open"));
    assert!(!storage
        .mark_message_read(message, "juan@student.tip.edu.ph")
        .await
        .expect("second open"));
}

#[tokio::test]
async fn blobs_list_by_prefix_in_path_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .put("documents/1/7/TOR.pdf", b"tor", Some("application/pdf"))
        .await
        .expect("put");
    storage
        .put("documents/1/7/BIR.pdf", b"bir", None)
        .await
        .expect("put");
    storage
        .put("documents/1/70/Other.pdf", b"other", None)
        .await
        .expect("put");

    let listed = storage
        .list_by_prefix("documents/1/7/")
        .await
        .expect("list");
    assert_eq!(
        listed.iter().map(BlobRef::file_name).collect::<Vec<_>>(),
        vec!["BIR.pdf", "TOR.pdf"]
    );
    assert_eq!(
        storage.get("documents/1/7/TOR.pdf").await.expect("get"),
        Some(b"tor".to_vec())
    );
    assert!(storage.delete("documents/1/7/TOR.pdf").await.expect("delete"));
    assert_eq!(storage.get("documents/1/7/TOR.pdf").await.expect("get"), None);
}

#[test]
fn in_memory_urls_have_no_file_path() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/server.db?mode=rwc"),
        Some(PathBuf::from("./data/server.db"))
    );
}
