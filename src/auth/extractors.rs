use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::auth::session::{extract_session_token, SessionManager};
use crate::auth::wall::AuthContext;
use crate::error::AppError;
use crate::state::AppState;

/// Resolves the calling user's id. Prefers the identity the auth wall
/// already attached; routes under the public `/api/auth/` prefix (me,
/// logout, change-password) resolve the token themselves in a single joined
/// read.
pub struct AuthUser(pub i64);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(ctx) = parts.extensions.get::<AuthContext>() {
            return Ok(AuthUser(ctx.user_id));
        }

        let token = extract_session_token(&parts.headers).ok_or(AppError::Unauthenticated)?;
        let session = SessionManager::validate(&state.db, &token)
            .await
            .map_err(AppError::Internal)?
            .ok_or(AppError::Unauthenticated)?;
        Ok(AuthUser(session.user_id))
    }
}
