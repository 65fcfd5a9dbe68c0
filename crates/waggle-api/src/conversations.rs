use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use waggle_db::Database;
use waggle_gateway::ChatState;
use waggle_gateway::delivery::deliver_new_message;
use waggle_types::api::{Claims, MarkReadResponse, SendMessageRequest, SendMessageResponse};
use waggle_types::events::GatewayEvent;
use waggle_types::models::MessagePage;
use waggle_types::{ChatError, ChatResult};

use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Cursor: id of the oldest message from the previous page.
    pub before: Option<Uuid>,
}

fn default_limit() -> u32 {
    20
}

/// `GET /conversations/{thread_id}/messages?before=&limit=`
///
/// Participants only; unknown thread and non-participant both answer
/// 404.
pub async fn get_messages(
    State(state): State<ChatState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MessagePage>, ApiError> {
    let user_id = claims.sub;
    let page = run_blocking(state.db.clone(), move |db| {
        db.require_participant(thread_id, user_id)?;
        db.paginate(thread_id, query.before, query.limit)
    })
    .await?;
    Ok(Json(page))
}

/// `POST /conversations/{thread_id}/messages`
///
/// Appends through the same store path as the gateway and reuses its
/// broadcast/fanout delivery.
pub async fn send_message(
    State(state): State<ChatState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub;
    let (message, participants) = run_blocking(state.db.clone(), move |db| {
        let message =
            db.append_message(thread_id, user_id, &req.content, &req.attachments, req.reply_to)?;
        let participants = db.thread_participants(thread_id)?;
        Ok((message, participants))
    })
    .await?;

    deliver_new_message(&state, message.clone(), participants).await;

    Ok((StatusCode::CREATED, Json(SendMessageResponse { message })))
}

/// `POST /conversations/{thread_id}/read`
pub async fn mark_read(
    State(state): State<ChatState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let user_id = claims.sub;
    let changed = run_blocking(state.db.clone(), move |db| {
        db.mark_read(thread_id, user_id)
    })
    .await?;

    if changed {
        state.dispatcher.broadcast(GatewayEvent::MessagesRead {
            thread_id,
            user_id,
            read_at: Utc::now(),
        });
    }

    Ok(Json(MarkReadResponse { changed }))
}

/// Runs a storage closure off the async runtime. This is the only
/// suspension point on the REST paths.
async fn run_blocking<T, F>(db: Arc<Database>, f: F) -> ChatResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> ChatResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(ChatError::store)?
}
