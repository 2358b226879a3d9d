use std::time::Duration;

use shared::{
    domain::{ProgramId, ProgramType},
    protocol::ProgramDraft,
};
use storage::{NewStudent, RecordChange, Storage};
use tokio::time::timeout;

async fn seed_program(storage: &Storage, slots: i64) -> ProgramId {
    storage
        .create_program(&ProgramDraft {
            name: "Live Query Grant".into(),
            program_type: ProgramType::External,
            total_slots: slots,
            min_gwa: 2.0,
            eligibility: Default::default(),
            requirements: vec!["Good Moral".into()],
            benefits: vec!["Allowance".into()],
            posted_by: "org@example.org".into(),
        })
        .await
        .expect("program")
}

async fn seed_student(storage: &Storage, email: &str) -> shared::domain::StudentId {
    storage
        .create_student(&NewStudent {
            first_name: "Maria",
            last_name: "Santos",
            school: "TIP QC",
            course: "BSIT",
            email,
            profile_picture: None,
        })
        .await
        .expect("student")
}

#[tokio::test]
async fn live_count_follows_writes_from_a_cloned_handle() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let program = seed_program(&storage, 5).await;

    let mut live = storage
        .subscribe(
            move |change: &RecordChange| change.touches_program(program),
            move |store: Storage| async move {
                store.count_enrollments(program, false).await.map(Some)
            },
        )
        .await
        .expect("subscribe");
    assert_eq!(live.current(), 0);

    let other_actor = storage.clone();
    let student = seed_student(&other_actor, "maria@student.tip.edu.ph").await;
    other_actor
        .create_enrollment(student, program)
        .await
        .expect("enrollment");

    let next = timeout(Duration::from_secs(5), live.changed())
        .await
        .expect("push within deadline");
    assert_eq!(next, Some(1));
    assert!(live.is_active());
    live.unsubscribe();
}

#[tokio::test]
async fn live_count_follows_writes_from_a_separately_opened_store() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("funded_futures_live_query_{suffix}"));
    let db_path = temp_root.join("review.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    // Two independent pools on one file, as the server and the admin CLI would have.
    let server = Storage::new(&database_url).await.expect("server db");
    let cli = Storage::new(&database_url).await.expect("cli db");
    let program = seed_program(&server, 5).await;

    let mut live = server
        .subscribe(
            move |change: &RecordChange| change.touches_program(program),
            move |store: Storage| async move {
                store.count_enrollments(program, false).await.map(Some)
            },
        )
        .await
        .expect("subscribe");
    assert_eq!(live.current(), 0);

    let student = seed_student(&cli, "maria@student.tip.edu.ph").await;
    cli.create_enrollment(student, program)
        .await
        .expect("enrollment");
    assert_eq!(
        cli.count_enrollments(program, false).await.expect("count"),
        1
    );

    let next = timeout(Duration::from_secs(5), live.changed())
        .await
        .expect("push within deadline");
    assert_eq!(next, Some(1));
    assert_eq!(live.current(), 1);

    live.unsubscribe();
    drop(cli);
    drop(server);
    let _ = std::fs::remove_dir_all(temp_root);
}

#[tokio::test]
async fn live_query_ends_when_target_disappears() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let program = seed_program(&storage, 3).await;

    let mut live = storage
        .subscribe(
            move |change: &RecordChange| change.touches_program(program),
            move |store: Storage| async move {
                Ok::<_, anyhow::Error>(store.load_program(program).await?.map(|p| p.total_slots))
            },
        )
        .await
        .expect("subscribe");
    assert_eq!(live.current(), 3);

    storage.delete_program(program).await.expect("delete");
    let ended = timeout(Duration::from_secs(5), live.changed())
        .await
        .expect("ends within deadline");
    assert_eq!(ended, None);
}

#[tokio::test]
async fn subscribing_to_missing_target_fails() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let missing = ProgramId(404);
    let result = storage
        .subscribe(
            move |change: &RecordChange| change.touches_program(missing),
            move |store: Storage| async move {
                Ok::<_, anyhow::Error>(store.load_program(missing).await?.map(|p| p.total_slots))
            },
        )
        .await;
    assert!(result.is_err());
}
