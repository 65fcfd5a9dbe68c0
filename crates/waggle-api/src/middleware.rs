use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};

use waggle_gateway::ChatState;
use waggle_types::ChatError;
use waggle_types::api::Claims;

use crate::error::ApiError;

/// Extracts and validates the bearer JWT against the state-injected
/// secret, the same one the WebSocket handshake verifies with. Valid
/// claims are inserted as a request extension.
pub async fn require_auth(
    State(state): State<ChatState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ChatError::Unauthenticated)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(ChatError::Unauthenticated)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ChatError::Unauthenticated)?;

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}
