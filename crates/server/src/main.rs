use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, JsonRejection},
        ws::{Message, WebSocket},
        DefaultBodyLimit, Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use review_engine::{ReviewContext, ReviewPolicy};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{EnrollmentId, MessageId, ProgramId, StudentId},
    error::{ApiError, ErrorCode},
    protocol::{
        ApplicationRequest, CapacitySnapshot, ChecklistView, DocumentEntry, EnrollmentDetail,
        EnrollmentSummary, MessagePayload, OpenedMessage, ProgramDraft, ProgramSummary,
        RejectRequest, RemarksRequest, ReplyTarget, SendMessageRequest, ServerEvent,
        SetChecklistItemRequest,
    },
};
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;

use api::{
    binary_response, error_response, message_body_limit, outgoing_message, rejected_body,
    HttpResult,
};
use app_state::AppState;
use config::{load_settings, prepare_database_url};

#[derive(Debug, Deserialize)]
struct ProgramListQuery {
    posted_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DocumentUploadQuery {
    student_id: i64,
    filename: String,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityQuery {
    identity: String,
}

#[derive(Debug, Deserialize)]
struct ViewerQuery {
    viewer: String,
}

#[derive(Debug, Deserialize)]
struct AttachmentQuery {
    viewer: String,
    path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnreadResponse {
    unread: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let review = ReviewContext::new(storage).with_policy(ReviewPolicy {
        capacity: settings.capacity_policy,
        max_attachment_bytes: settings.max_attachment_bytes,
    });

    let app = build_router(Arc::new(AppState { review }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, capacity_policy = %settings.capacity_policy, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let max_attachment_bytes = state.review.policy.max_attachment_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/programs", get(http_list_programs).post(http_create_program))
        .route(
            "/programs/:program_id",
            get(http_get_program)
                .put(http_update_program)
                .delete(http_delete_program),
        )
        .route("/programs/:program_id/capacity", get(http_capacity))
        .route("/programs/:program_id/enrollments", get(http_list_enrollments))
        .route("/programs/:program_id/applications", post(http_submit_application))
        .route(
            "/programs/:program_id/documents",
            post(http_upload_document).layer(DefaultBodyLimit::max(max_attachment_bytes)),
        )
        .route("/enrollments/:enrollment_id", get(http_enrollment_detail))
        .route(
            "/enrollments/:enrollment_id/checklist/:document_id/toggle",
            post(http_toggle_item),
        )
        .route(
            "/enrollments/:enrollment_id/checklist/:document_id",
            put(http_set_item),
        )
        .route(
            "/enrollments/:enrollment_id/documents/:document_id",
            get(http_document_content),
        )
        .route("/enrollments/:enrollment_id/approve", post(http_approve))
        .route("/enrollments/:enrollment_id/reject", post(http_reject))
        .route("/enrollments/:enrollment_id/remarks", put(http_save_remarks))
        .route(
            "/messages",
            post(http_send_message)
                .layer(DefaultBodyLimit::max(message_body_limit(max_attachment_bytes))),
        )
        .route("/messages/inbox", get(http_inbox))
        .route("/messages/sent", get(http_sent))
        .route("/messages/unread", get(http_unread))
        .route("/messages/:message_id/open", post(http_open_message))
        .route("/messages/:message_id/reply_target", get(http_reply_target))
        .route("/messages/:message_id/attachments", get(http_attachment))
        .route("/ws/programs/:program_id", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> HttpResult<&'static str> {
    state.review.storage.health_check().await.map_err(|e| {
        error!(error = %e, "health check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Storage, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_list_programs(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ProgramListQuery>,
) -> HttpResult<Json<Vec<ProgramSummary>>> {
    let programs = review_engine::list_programs(&state.review, q.posted_by.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(programs))
}

async fn http_create_program(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ProgramDraft>,
) -> HttpResult<(StatusCode, Json<ProgramSummary>)> {
    let program = review_engine::create_program(&state.review, &draft)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(program)))
}

async fn http_get_program(
    State(state): State<Arc<AppState>>,
    Path(program_id): Path<i64>,
) -> HttpResult<Json<ProgramSummary>> {
    let program = review_engine::get_program(&state.review, ProgramId(program_id))
        .await
        .map_err(error_response)?;
    Ok(Json(program))
}

async fn http_update_program(
    State(state): State<Arc<AppState>>,
    Path(program_id): Path<i64>,
    Json(draft): Json<ProgramDraft>,
) -> HttpResult<Json<ProgramSummary>> {
    let program = review_engine::update_program(&state.review, ProgramId(program_id), &draft)
        .await
        .map_err(error_response)?;
    Ok(Json(program))
}

async fn http_delete_program(
    State(state): State<Arc<AppState>>,
    Path(program_id): Path<i64>,
) -> HttpResult<StatusCode> {
    review_engine::delete_program(&state.review, ProgramId(program_id))
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_capacity(
    State(state): State<Arc<AppState>>,
    Path(program_id): Path<i64>,
) -> HttpResult<Json<CapacitySnapshot>> {
    let snapshot = review_engine::capacity(&state.review, ProgramId(program_id))
        .await
        .map_err(error_response)?;
    Ok(Json(snapshot))
}

async fn http_list_enrollments(
    State(state): State<Arc<AppState>>,
    Path(program_id): Path<i64>,
) -> HttpResult<Json<Vec<EnrollmentSummary>>> {
    let enrollments = review_engine::list_enrollments(&state.review, ProgramId(program_id))
        .await
        .map_err(error_response)?;
    Ok(Json(enrollments))
}

async fn http_submit_application(
    State(state): State<Arc<AppState>>,
    Path(program_id): Path<i64>,
    Json(req): Json<ApplicationRequest>,
) -> HttpResult<(StatusCode, Json<EnrollmentSummary>)> {
    let enrollment =
        review_engine::submit_application(&state.review, req.student_id, ProgramId(program_id))
            .await
            .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

async fn http_upload_document(
    State(state): State<Arc<AppState>>,
    Path(program_id): Path<i64>,
    Query(q): Query<DocumentUploadQuery>,
    body: Result<Bytes, BytesRejection>,
) -> HttpResult<Json<DocumentEntry>> {
    let body = body.map_err(|rejection| rejected_body(rejection.status(), rejection.body_text()))?;
    let entry = review_engine::upload_document(
        &state.review,
        StudentId(q.student_id),
        ProgramId(program_id),
        &q.filename,
        &body,
        q.mime_type
            .as_deref()
            .filter(|mime| !mime.trim().is_empty()),
    )
    .await
    .map_err(error_response)?;
    Ok(Json(entry))
}

async fn http_enrollment_detail(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<i64>,
) -> HttpResult<Json<EnrollmentDetail>> {
    let detail = review_engine::enrollment_detail(&state.review, EnrollmentId(enrollment_id))
        .await
        .map_err(error_response)?;
    Ok(Json(detail))
}

async fn http_toggle_item(
    State(state): State<Arc<AppState>>,
    Path((enrollment_id, document_id)): Path<(i64, String)>,
) -> HttpResult<Json<ChecklistView>> {
    let view = review_engine::toggle_checklist_item(
        &state.review,
        EnrollmentId(enrollment_id),
        &document_id,
    )
    .await
    .map_err(error_response)?;
    Ok(Json(view))
}

async fn http_set_item(
    State(state): State<Arc<AppState>>,
    Path((enrollment_id, document_id)): Path<(i64, String)>,
    Json(req): Json<SetChecklistItemRequest>,
) -> HttpResult<Json<ChecklistView>> {
    let view = review_engine::set_checklist_item(
        &state.review,
        EnrollmentId(enrollment_id),
        &document_id,
        req.checked,
    )
    .await
    .map_err(error_response)?;
    Ok(Json(view))
}

async fn http_document_content(
    State(state): State<Arc<AppState>>,
    Path((enrollment_id, document_id)): Path<(i64, String)>,
) -> HttpResult<impl IntoResponse> {
    let bytes = review_engine::document_content(
        &state.review,
        EnrollmentId(enrollment_id),
        &document_id,
    )
    .await
    .map_err(error_response)?;
    Ok(binary_response(bytes, None, &document_id))
}

async fn http_approve(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<i64>,
) -> HttpResult<Json<EnrollmentSummary>> {
    let enrollment = review_engine::approve(&state.review, EnrollmentId(enrollment_id))
        .await
        .map_err(error_response)?;
    Ok(Json(enrollment))
}

async fn http_reject(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<i64>,
    req: Option<Json<RejectRequest>>,
) -> HttpResult<Json<EnrollmentSummary>> {
    let remarks = req.and_then(|Json(req)| req.remarks);
    let enrollment = review_engine::reject(
        &state.review,
        EnrollmentId(enrollment_id),
        remarks.as_deref(),
    )
    .await
    .map_err(error_response)?;
    Ok(Json(enrollment))
}

async fn http_save_remarks(
    State(state): State<Arc<AppState>>,
    Path(enrollment_id): Path<i64>,
    Json(req): Json<RemarksRequest>,
) -> HttpResult<Json<EnrollmentSummary>> {
    let enrollment =
        review_engine::save_remarks(&state.review, EnrollmentId(enrollment_id), &req.remarks)
            .await
            .map_err(error_response)?;
    Ok(Json(enrollment))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    req: Result<Json<SendMessageRequest>, JsonRejection>,
) -> HttpResult<(StatusCode, Json<MessagePayload>)> {
    let Json(req) =
        req.map_err(|rejection| rejected_body(rejection.status(), rejection.body_text()))?;
    let message = outgoing_message(req)?;
    let sent = review_engine::send_message(&state.review, message)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(sent)))
}

async fn http_inbox(
    State(state): State<Arc<AppState>>,
    Query(q): Query<IdentityQuery>,
) -> HttpResult<Json<Vec<MessagePayload>>> {
    let messages = review_engine::inbox(&state.review, &q.identity)
        .await
        .map_err(error_response)?;
    Ok(Json(messages))
}

async fn http_sent(
    State(state): State<Arc<AppState>>,
    Query(q): Query<IdentityQuery>,
) -> HttpResult<Json<Vec<MessagePayload>>> {
    let messages = review_engine::sent_messages(&state.review, &q.identity)
        .await
        .map_err(error_response)?;
    Ok(Json(messages))
}

async fn http_unread(
    State(state): State<Arc<AppState>>,
    Query(q): Query<IdentityQuery>,
) -> HttpResult<Json<UnreadResponse>> {
    let unread = review_engine::unread_count(&state.review, &q.identity)
        .await
        .map_err(error_response)?;
    Ok(Json(UnreadResponse { unread }))
}

async fn http_open_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<ViewerQuery>,
) -> HttpResult<Json<OpenedMessage>> {
    let opened = review_engine::open_message(&state.review, MessageId(message_id), &q.viewer)
        .await
        .map_err(error_response)?;
    Ok(Json(opened))
}

async fn http_reply_target(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
) -> HttpResult<Json<ReplyTarget>> {
    let target = review_engine::reply_target(&state.review, MessageId(message_id))
        .await
        .map_err(error_response)?;
    Ok(Json(target))
}

async fn http_attachment(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<AttachmentQuery>,
) -> HttpResult<impl IntoResponse> {
    let (attachment, bytes) = review_engine::attachment_content(
        &state.review,
        MessageId(message_id),
        &q.viewer,
        &q.path,
    )
    .await
    .map_err(error_response)?;
    Ok(binary_response(
        bytes,
        attachment.mime_type.as_deref(),
        &attachment.filename,
    ))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(program_id): Path<i64>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| program_feed(state, socket, ProgramId(program_id)))
}

async fn push(sender: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(v) => v,
        Err(error) => {
            warn!(%error, "failed to encode server event");
            return true;
        }
    };
    sender.send(Message::Text(text)).await.is_ok()
}

/// Streams capacity and enrollment-list changes of one program until the client
/// disconnects or the program is deleted.
async fn program_feed(state: Arc<AppState>, socket: WebSocket, program_id: ProgramId) {
    let (mut sender, mut receiver) = socket.split();

    let subscriptions = async {
        let capacity = review_engine::subscribe_capacity(&state.review, program_id).await?;
        let enrollments = review_engine::subscribe_enrollments(&state.review, program_id).await?;
        Ok::<_, review_engine::ReviewError>((capacity, enrollments))
    };
    let (mut capacity, mut enrollments) = match subscriptions.await {
        Ok(subscriptions) => subscriptions,
        Err(err) => {
            let api: ApiError = err.into();
            let _ = push(&mut sender, &ServerEvent::Error(api)).await;
            let _ = sender.close().await;
            return;
        }
    };
    info!(program_id = program_id.0, "reviewer session attached");

    let send_task = tokio::spawn(async move {
        let initial = [
            ServerEvent::CapacityUpdated {
                capacity: capacity.current(),
            },
            ServerEvent::EnrollmentsUpdated {
                program_id,
                enrollments: enrollments.current(),
            },
        ];
        for event in &initial {
            if !push(&mut sender, event).await {
                return;
            }
        }

        loop {
            let event = tokio::select! {
                next = capacity.changed() => next.map(|capacity| ServerEvent::CapacityUpdated { capacity }),
                next = enrollments.changed() => next.map(|enrollments| ServerEvent::EnrollmentsUpdated { program_id, enrollments }),
            };
            let Some(event) = event else {
                let _ = push(&mut sender, &ServerEvent::ProgramRemoved { program_id }).await;
                let _ = sender.close().await;
                break;
            };
            if !push(&mut sender, &event).await {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    send_task.abort();
    info!(program_id = program_id.0, "reviewer session detached");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
