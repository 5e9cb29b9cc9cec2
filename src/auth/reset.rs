use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument};

use crate::auth::dto::{
    ForgotPasswordRequest, MessageResponse, ResetPasswordRequest, TokenQuery, TokenValidity,
};
use crate::auth::password::{hash_password, is_valid_email, normalize_email, MIN_PASSWORD_LENGTH};
use crate::auth::repo::{PasswordReset, User};
use crate::auth::session::{generate_token, SessionManager};
use crate::error::AppError;
use crate::state::AppState;

const RESET_TTL: Duration = Duration::hours(1);

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/forgot-password", post(forgot_password))
        .route("/api/auth/verify-reset-token", get(verify_token))
        .route("/api/auth/reset-password", post(reset_password))
}

/// Starts a password reset. Always success-shaped so the endpoint cannot be
/// used to enumerate registered emails.
#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(mut payload): Json<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    payload.email = normalize_email(&payload.email);

    if !is_valid_email(&payload.email) {
        return Err(AppError::Validation("Invalid email format".into()));
    }

    if let Err(e) = issue_reset(&state, &payload.email).await {
        error!(error = %e, "password reset issuance failed");
    }

    Ok(Json(MessageResponse::ok(
        "If the email exists, a reset link has been sent.",
    )))
}

async fn issue_reset(state: &AppState, email: &str) -> anyhow::Result<()> {
    let user = match User::find_by_email(&state.db, email).await? {
        Some(user) => user,
        None => return Ok(()),
    };

    let token = generate_token();
    let expires_at = OffsetDateTime::now_utc() + RESET_TTL;

    // One live reset per user; a new request invalidates earlier links.
    PasswordReset::replace_for_user(&state.db, user.id, &token, expires_at).await?;

    let url = format!("{}/reset-password?token={token}", state.config.base_url);
    let message = crate::email::password_reset_email(email, &url);
    crate::email::send_best_effort(state.email.as_ref(), message).await;

    info!(user_id = user.id, "password reset issued");
    Ok(())
}

/// Read-only pre-check used by the reset form before the user types a new
/// password. Does not mark the token used.
#[instrument(skip(state, query))]
pub async fn verify_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<TokenValidity>, AppError> {
    let token = match query.token.filter(|t| !t.is_empty()) {
        Some(token) => token,
        None => return Ok(Json(TokenValidity::invalid("Missing token"))),
    };

    let validity = match PasswordReset::find_by_token(&state.db, &token).await? {
        None => TokenValidity::invalid("Invalid token"),
        Some(reset) if reset.used => TokenValidity::invalid("Token already used"),
        Some(reset) if reset.expires_at <= OffsetDateTime::now_utc() => {
            TokenValidity::invalid("Token expired")
        }
        Some(_) => TokenValidity::valid(),
    };

    Ok(Json(validity))
}

/// Redeems a reset token and sets the new password. Every session of the
/// account is revoked and none is issued here: the token arrived over
/// email, so the redeemer must log in with the new password.
#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    if payload.password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    // Single-use is enforced by the conditional mark-used write.
    let user_id = PasswordReset::consume(&state.db, &payload.token)
        .await?
        .ok_or_else(|| AppError::Validation("Invalid or expired reset token".into()))?;

    let password_hash = hash_password(&payload.password)?;
    User::update_password(&state.db, user_id, &password_hash).await?;

    // The old credential may be compromised; nothing signed in with it
    // survives the reset.
    SessionManager::revoke_all_for_user(&state.db, user_id).await?;

    info!(user_id, "password reset completed");
    Ok(Json(MessageResponse::ok(
        "Password reset successfully. Please log in.",
    )))
}
