use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::Html,
    routing::{get, post},
    Json, Router,
};
use time::Duration;
use tracing::{info, instrument, warn};

use crate::auth::dto::{
    AuthResponse, ChangePasswordRequest, LoginRequest, MessageResponse, PublicUser,
    RegisterRequest,
};
use crate::auth::extractors::AuthUser;
use crate::auth::password::{
    hash_password, is_valid_email, normalize_email, verify_password, MIN_PASSWORD_LENGTH,
};
use crate::auth::repo::User;
use crate::auth::session::{
    clear_session_cookie, extract_session_token, session_cookie, SessionManager,
};
use crate::auth::client_ip;
use crate::error::AppError;
use crate::state::AppState;
use crate::turnstile::is_loopback;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/auth/change-password", post(change_password))
        .route("/api/profile", get(profile))
        .route("/dashboard", get(dashboard))
}

/// Bot-challenge pre-check for abuse-prone endpoints. Loopback callers skip
/// it; failure short-circuits with 403.
pub(crate) async fn ensure_human(
    state: &AppState,
    challenge_token: Option<&str>,
    headers: &HeaderMap,
) -> Result<(), AppError> {
    if state.config.turnstile_secret.is_none() {
        return Ok(());
    }
    let ip = client_ip(headers);
    if ip.as_deref().map(is_loopback).unwrap_or(false) {
        return Ok(());
    }
    let Some(token) = challenge_token else {
        return Err(AppError::BotCheckFailed);
    };
    if !state.bot_verifier.verify(token, ip.as_deref()).await {
        return Err(AppError::BotCheckFailed);
    }
    Ok(())
}

fn session_headers(token: &str, ttl: Duration, secure: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        session_cookie(token, ttl.whole_seconds(), secure),
    );
    headers
}

#[instrument(skip(state, headers, payload))]
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut payload): Json<RegisterRequest>,
) -> Result<(StatusCode, HeaderMap, Json<AuthResponse>), AppError> {
    payload.email = normalize_email(&payload.email);

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(AppError::Validation("Invalid email format".into()));
    }
    if payload.password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::Validation(
            "Password must be at least 8 characters".into(),
        ));
    }

    ensure_human(&state, payload.turnstile_token.as_deref(), &headers).await?;

    let hash = hash_password(&payload.password)?;

    let user = User::create(&state.db, &payload.email, Some(&hash), payload.name.as_deref())
        .await?
        .ok_or_else(|| AppError::Conflict("Email already registered".into()))?;

    let ttl = Duration::days(state.config.session.ttl_days);
    let token = SessionManager::issue(&state.db, user.id, ttl).await?;

    info!(user_id = user.id, email = %user.email, "user registered");
    Ok((
        StatusCode::CREATED,
        session_headers(&token, ttl, state.config.session.cookie_secure),
        Json(AuthResponse {
            success: true,
            token,
            user: PublicUser::from(&user),
        }),
    ))
}

#[instrument(skip(state, headers, payload))]
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut payload): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<AuthResponse>), AppError> {
    payload.email = normalize_email(&payload.email);

    if !is_valid_email(&payload.email) {
        return Err(AppError::Validation("Invalid email format".into()));
    }

    ensure_human(&state, payload.turnstile_token.as_deref(), &headers).await?;

    // Missing account and OAuth-only account collapse into the same error as
    // a wrong password, so responses never reveal which emails exist.
    let user = User::find_by_email(&state.db, &payload.email).await?;
    let Some(user) = user else {
        warn!(email = %payload.email, "login for unknown email");
        return Err(AppError::InvalidCredentials);
    };
    let Some(password_hash) = user.password_hash.as_deref() else {
        warn!(user_id = user.id, "login attempt against passwordless account");
        return Err(AppError::InvalidCredentials);
    };

    if !verify_password(&payload.password, password_hash)? {
        warn!(user_id = user.id, "login with wrong password");
        return Err(AppError::InvalidCredentials);
    }

    let ttl = Duration::days(state.config.session.ttl_days);
    let token = SessionManager::issue(&state.db, user.id, ttl).await?;

    info!(user_id = user.id, email = %user.email, "user logged in");
    Ok((
        session_headers(&token, ttl, state.config.session.cookie_secure),
        Json(AuthResponse {
            success: true,
            token,
            user: PublicUser::from(&user),
        }),
    ))
}

/// Revokes the presented session if any; the cookie is cleared either way.
#[instrument(skip(state, headers))]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(HeaderMap, Json<MessageResponse>), AppError> {
    if let Some(token) = extract_session_token(&headers) {
        SessionManager::revoke(&state.db, &token).await?;
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        SET_COOKIE,
        clear_session_cookie(state.config.session.cookie_secure),
    );
    Ok((response_headers, Json(MessageResponse::ok("Logged out"))))
}

#[instrument(skip(state))]
pub async fn me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, AppError> {
    let user = User::find_by_id(&state.db, user_id)
        .await?
        .ok_or(AppError::Unauthenticated)?;
    Ok(Json(PublicUser::from(&user)))
}

/// Authenticated password rotation. Re-verifies the current password, then
/// revokes every other session and hands the caller a fresh one.
#[instrument(skip(state, payload))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<(HeaderMap, Json<MessageResponse>), AppError> {
    if payload.new_password.len() < MIN_PASSWORD_LENGTH {
        return Err(AppError::Validation(
            "New password must be at least 8 characters".into(),
        ));
    }

    let user = User::find_by_id(&state.db, user_id)
        .await?
        .ok_or(AppError::Unauthenticated)?;
    let Some(current_hash) = user.password_hash.as_deref() else {
        return Err(AppError::Validation(
            "Cannot change password for OAuth-only accounts".into(),
        ));
    };

    if !verify_password(&payload.current_password, current_hash)? {
        return Err(AppError::Validation("Current password is incorrect".into()));
    }

    let new_hash = hash_password(&payload.new_password)?;
    User::update_password(&state.db, user_id, &new_hash).await?;

    // A rotated password invalidates every existing session; the caller gets
    // a fresh one so they stay logged in here only.
    SessionManager::revoke_all_for_user(&state.db, user_id).await?;
    let ttl = Duration::days(state.config.session.ttl_days);
    let token = SessionManager::issue(&state.db, user_id, ttl).await?;

    info!(user_id, "password changed");
    Ok((
        session_headers(&token, ttl, state.config.session.cookie_secure),
        Json(MessageResponse::ok("Password changed successfully")),
    ))
}

/// Representative protected API route; everything it needs arrives through
/// the wall-resolved identity.
#[instrument(skip(state))]
pub async fn profile(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, AppError> {
    let user = User::find_by_id(&state.db, user_id)
        .await?
        .ok_or(AppError::Unauthenticated)?;
    Ok(Json(PublicUser::from(&user)))
}

/// Representative admin-only route, gated by `require_admin` in app wiring.
#[instrument(skip(state))]
pub async fn admin_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (users,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
        .fetch_one(&state.db)
        .await?;
    let (sessions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
        .fetch_one(&state.db)
        .await?;
    Ok(Json(serde_json::json!({
        "users": users,
        "active_sessions": sessions,
    })))
}

/// Representative protected page behind the page gate.
pub async fn dashboard() -> Html<&'static str> {
    Html("<h1>Dashboard</h1>")
}
