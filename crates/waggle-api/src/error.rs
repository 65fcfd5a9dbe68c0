use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use waggle_types::ChatError;

/// REST-side wrapper mapping the shared taxonomy onto HTTP statuses.
/// `NotFound` covers both unknown threads and non-participants, so
/// existence is never revealed.
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) | ChatError::Expired(_) => StatusCode::FORBIDDEN,
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict | ChatError::Store(_) => {
                error!("request failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": self.0.code(),
        }));
        (status, body).into_response()
    }
}
