use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the WebSocket
/// `identify` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub reply_to: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: Message,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub changed: bool,
}
