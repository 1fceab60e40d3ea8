use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;
use uuid::Uuid;

use creel_engine::EngineError;
use creel_types::api::{
    ConversationQuery, SendMessageRequest, SetArchivedRequest, UnreadCountResponse,
};
use creel_types::models::Namespace;

use crate::AppState;
use crate::middleware::Identity;

fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound => StatusCode::NOT_FOUND,
        EngineError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        // Loads substitute placeholders; this surfacing is a bug, not user error.
        EngineError::DecryptionFailed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_namespace(raw: &str) -> Result<Namespace, StatusCode> {
    raw.parse().map_err(|_| StatusCode::NOT_FOUND)
}

/// One decrypted summary row per visible thread, newest first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Query(query): Query<ConversationQuery>,
    Extension(Identity(account)): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    let namespace = parse_namespace(&namespace)?;
    let conversations = state
        .engine
        .list_conversations(account, namespace, query.include_archived)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(Json(conversations))
}

/// Full decrypted thread history. Opening a thread marks everything
/// addressed to the caller as read — batched and best-effort, so a
/// marking failure never fails the load.
pub async fn get_thread(
    State(state): State<AppState>,
    Path((namespace, thread_root)): Path<(String, Uuid)>,
    Extension(Identity(account)): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    let namespace = parse_namespace(&namespace)?;

    let thread = state
        .engine
        .load_thread(account, thread_root)
        .await
        .map_err(|e| status_for(&e))?;

    if thread.iter().any(|m| m.namespace != namespace) {
        return Err(StatusCode::NOT_FOUND);
    }

    if let Err(e) = state.engine.mark_thread_read(account, thread_root).await {
        warn!("read-marking failed for thread {thread_root}: {e}");
    }

    Ok(Json(thread))
}

/// Send a message. Without `thread_root` this starts a new conversation;
/// with one it appends a reply whose recipient is resolved from the
/// thread.
pub async fn send_message(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Extension(Identity(account)): Extension<Identity>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let namespace = parse_namespace(&namespace)?;
    let sent = state
        .engine
        .send(account, req.recipient, namespace, req.thread_root, &req.content)
        .await
        .map_err(|e| status_for(&e))?;
    Ok((StatusCode::CREATED, Json(sent)))
}

/// Idempotent read receipt; a repeat call or a call by the sender is a
/// no-op, not an error.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(Identity(account)): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .engine
        .mark_read(message_id, account)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Archive or unarchive the caller's side of the thread containing the
/// message. Reversible; the other participant's view is untouched.
pub async fn set_archived(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(Identity(account)): Extension<Identity>,
    Json(req): Json<SetArchivedRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .engine
        .set_archived(message_id, account, req.archived)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Soft-delete the caller's side of a whole thread. Messages discarded by
/// both participants are physically purged and unrecoverable.
pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_root): Path<Uuid>,
    Extension(Identity(account)): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    state
        .engine
        .delete_thread(thread_root, account)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unread_count(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    Extension(Identity(account)): Extension<Identity>,
) -> Result<impl IntoResponse, StatusCode> {
    let namespace = parse_namespace(&namespace)?;
    let count = state
        .engine
        .count_unread(account, namespace)
        .await
        .map_err(|e| status_for(&e))?;
    Ok(Json(UnreadCountResponse { count }))
}
