use super::*;
use crate::{
    test_support::{context, seed_program, seed_student, FlakyBlobStore, REGISTRAR},
    ReviewPolicy,
};

const JUAN: &str = "juan@student.tip.edu.ph";

fn outgoing(subject: &str, attachments: Vec<OutgoingAttachment>) -> OutgoingMessage {
    OutgoingMessage {
        sender: REGISTRAR.into(),
        receiver: JUAN.into(),
        subject: subject.into(),
        body: "Please see the attached requirements.".into(),
        program_id: None,
        attachments,
    }
}

fn attachment(filename: &str, bytes: &[u8]) -> OutgoingAttachment {
    OutgoingAttachment {
        filename: filename.into(),
        mime_type: Some("application/pdf".into()),
        bytes: bytes.to_vec(),
    }
}

async fn attachment_blobs(ctx: &ReviewContext) -> usize {
    ctx.blobs
        .list_by_prefix("attachments/")
        .await
        .expect("list")
        .len()
}

#[tokio::test]
async fn send_validates_before_writing() {
    let ctx = context().await;

    let err = send_message(&ctx, outgoing("Congratulations", vec![attachment("a.pdf", b"a")]))
        .await
        .expect_err("unknown subject");
    assert!(matches!(err, ReviewError::Validation(_)));

    let mut blank_body = outgoing("General", Vec::new());
    blank_body.body = "   ".into();
    assert!(matches!(
        send_message(&ctx, blank_body).await,
        Err(ReviewError::Validation(_))
    ));

    let oversized = vec![attachment("a.pdf", b"a"), attachment("b.pdf", &[0u8; 32])];
    let small = ctx.clone().with_policy(ReviewPolicy {
        max_attachment_bytes: 16,
        ..ReviewPolicy::default()
    });
    assert!(matches!(
        send_message(&small, outgoing("General", oversized)).await,
        Err(ReviewError::Validation(_))
    ));

    let mut missing_program = outgoing("General", vec![attachment("a.pdf", b"a")]);
    missing_program.program_id = Some(ProgramId(404));
    assert!(matches!(
        send_message(&ctx, missing_program).await,
        Err(ReviewError::NotFound { .. })
    ));

    assert_eq!(attachment_blobs(&ctx).await, 0);
    assert!(inbox(&ctx, JUAN).await.expect("inbox").is_empty());
}

#[tokio::test]
async fn send_stores_attachments_and_lists_newest_first() {
    let ctx = context().await;
    let program_id = seed_program(&ctx, 5).await;

    let mut first = outgoing(
        "Document Request",
        vec![attachment("checklist.pdf", b"checklist")],
    );
    first.program_id = Some(program_id);
    let first = send_message(&ctx, first).await.expect("first");
    assert_eq!(first.subject, MessageSubject::DocumentRequest);
    assert_eq!(first.attachments.len(), 1);
    assert!(first.attachments[0]
        .blob_path
        .starts_with(&format!("attachments/{JUAN}/{program_id}/")));
    assert!(first.attachments[0].blob_path.ends_with("-checklist.pdf"));
    assert_eq!(first.attachments[0].size_bytes, 9);
    assert!(!first.read);

    let second = send_message(&ctx, outgoing("interview_schedule", Vec::new()))
        .await
        .expect("second");

    let listed = inbox(&ctx, JUAN).await.expect("inbox");
    assert_eq!(
        listed.iter().map(|m| m.message_id).collect::<Vec<_>>(),
        vec![second.message_id, first.message_id]
    );
    assert_eq!(sent_messages(&ctx, REGISTRAR).await.expect("sent").len(), 2);
    assert_eq!(unread_count(&ctx, JUAN).await.expect("unread"), 2);
}

#[tokio::test]
async fn opening_flips_read_flag_exactly_once() {
    let ctx = context().await;
    let program_id = seed_program(&ctx, 5).await;
    let mut message = outgoing("Approval Notice", Vec::new());
    message.program_id = Some(program_id);
    let sent = send_message(&ctx, message).await.expect("send");

    let by_sender = open_message(&ctx, sent.message_id, REGISTRAR)
        .await
        .expect("sender open");
    assert!(!by_sender.newly_read);
    assert!(!by_sender.message.read);

    let first = open_message(&ctx, sent.message_id, JUAN)
        .await
        .expect("first open");
    assert!(first.newly_read);
    assert!(first.message.read);
    assert_eq!(first.program_name.as_deref(), Some("Academic Excellence"));

    let second = open_message(&ctx, sent.message_id, JUAN)
        .await
        .expect("second open");
    assert!(!second.newly_read);
    assert!(second.message.read);
    assert_eq!(unread_count(&ctx, JUAN).await.expect("unread"), 0);

    assert!(matches!(
        open_message(&ctx, sent.message_id, "stranger@tip.edu.ph").await,
        Err(ReviewError::Forbidden(_))
    ));
    assert!(matches!(
        open_message(&ctx, MessageId(404), JUAN).await,
        Err(ReviewError::NotFound { .. })
    ));
}

#[tokio::test]
async fn attachments_are_only_served_to_participants() {
    let ctx = context().await;
    let sent = send_message(
        &ctx,
        outgoing("General", vec![attachment("guide.pdf", b"guide")]),
    )
    .await
    .expect("send");
    let blob_path = sent.attachments[0].blob_path.clone();

    for viewer in [REGISTRAR, JUAN] {
        let (meta, bytes) = attachment_content(&ctx, sent.message_id, viewer, &blob_path)
            .await
            .expect("content");
        assert_eq!(meta.filename, "guide.pdf");
        assert_eq!(bytes, b"guide".to_vec());
    }
    assert!(matches!(
        attachment_content(&ctx, sent.message_id, "stranger@tip.edu.ph", &blob_path).await,
        Err(ReviewError::Forbidden(_))
    ));
    assert!(matches!(
        attachment_content(&ctx, sent.message_id, JUAN, "attachments/other.pdf").await,
        Err(ReviewError::NotFound { .. })
    ));
}

#[tokio::test]
async fn failed_upload_aborts_send_and_rolls_back() {
    let ctx = context().await;
    let flaky = FlakyBlobStore::new(ctx.storage.clone(), 2, false);
    let ctx = ctx.with_blob_store(flaky);

    let err = send_message(
        &ctx,
        outgoing(
            "Document Request",
            vec![attachment("first.pdf", b"one"), attachment("second.pdf", b"two")],
        ),
    )
    .await
    .expect_err("second upload fails");

    match &err {
        ReviewError::AttachmentUpload {
            index,
            filename,
            uploaded,
            orphaned,
            ..
        } => {
            assert_eq!(*index, 1);
            assert_eq!(filename, "second.pdf");
            assert_eq!(uploaded.len(), 1);
            assert!(orphaned.is_empty());
        }
        other => panic!("expected attachment upload error, got {other:?}"),
    }
    let api: shared::error::ApiError = err.into();
    let details = api.details.expect("details");
    assert_eq!(details["attachment_index"], 1);
    assert_eq!(details["filename"], "second.pdf");

    assert!(inbox(&ctx, JUAN).await.expect("inbox").is_empty());
    assert_eq!(attachment_blobs(&ctx).await, 0);
}

#[tokio::test]
async fn failed_rollback_reports_orphans() {
    let ctx = context().await;
    let flaky = FlakyBlobStore::new(ctx.storage.clone(), 2, true);
    let ctx = ctx.with_blob_store(flaky);

    let err = send_message(
        &ctx,
        outgoing(
            "General",
            vec![attachment("first.pdf", b"one"), attachment("second.pdf", b"two")],
        ),
    )
    .await
    .expect_err("second upload fails");

    let ReviewError::AttachmentUpload {
        uploaded, orphaned, ..
    } = err
    else {
        panic!("expected attachment upload error");
    };
    assert_eq!(orphaned, uploaded);
    assert_eq!(attachment_blobs(&ctx).await, 1);
}

#[tokio::test]
async fn failed_record_write_removes_uploaded_attachments() {
    let ctx = context().await;
    // Uploads still succeed; only the message record can no longer be written.
    for table in ["message_attachments", "messages"] {
        sqlx::query(&format!("DROP TABLE {table}"))
            .execute(ctx.storage.pool())
            .await
            .expect("drop table");
    }

    let err = send_message(
        &ctx,
        outgoing(
            "General",
            vec![attachment("first.pdf", b"one"), attachment("second.pdf", b"two")],
        ),
    )
    .await
    .expect_err("record write fails");

    match &err {
        ReviewError::MessageWrite {
            uploaded, orphaned, ..
        } => {
            assert_eq!(uploaded.len(), 2);
            assert!(orphaned.is_empty());
        }
        other => panic!("expected message write error, got {other:?}"),
    }
    assert_eq!(err.code(), shared::error::ErrorCode::Storage);
    let api: shared::error::ApiError = err.into();
    let details = api.details.expect("details");
    assert_eq!(details["failed_step"], "message_write");
    assert_eq!(details["uploaded"].as_array().map(Vec::len), Some(2));
    assert_eq!(attachment_blobs(&ctx).await, 0);
}

#[tokio::test]
async fn reply_target_resolves_applicant_profile() {
    let ctx = context().await;
    let program_id = seed_program(&ctx, 5).await;
    let student_id = seed_student(&ctx, JUAN).await;

    let reply = send_message(
        &ctx,
        OutgoingMessage {
            sender: JUAN.into(),
            receiver: REGISTRAR.into(),
            subject: "Application Update".into(),
            body: "I have uploaded my TOR.".into(),
            program_id: Some(program_id),
            attachments: Vec::new(),
        },
    )
    .await
    .expect("send");
    assert_eq!(
        reply_target(&ctx, reply.message_id).await.expect("target"),
        ReplyTarget {
            program_id,
            student_id,
        }
    );

    let unlinked = send_message(&ctx, outgoing("General", Vec::new()))
        .await
        .expect("send");
    assert!(matches!(
        reply_target(&ctx, unlinked.message_id).await,
        Err(ReviewError::Precondition(_))
    ));

    let mut from_registrar = outgoing("General", Vec::new());
    from_registrar.program_id = Some(program_id);
    let from_registrar = send_message(&ctx, from_registrar).await.expect("send");
    assert!(matches!(
        reply_target(&ctx, from_registrar.message_id).await,
        Err(ReviewError::NotFound {
            entity: "student",
            ..
        })
    ));
}
