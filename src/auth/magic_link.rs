use axum::{
    extract::{Query, State},
    http::{header::SET_COOKIE, HeaderMap},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument};

use crate::auth::client_ip;
use crate::auth::dto::{MagicLinkRequest, MessageResponse, TokenQuery};
use crate::auth::handlers::ensure_human;
use crate::auth::password::{is_valid_email, normalize_email};
use crate::auth::repo::{MagicLink, User};
use crate::auth::session::{generate_token, session_cookie, SessionManager};
use crate::error::AppError;
use crate::state::AppState;

const MAGIC_LINK_TTL: Duration = Duration::minutes(15);

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/magic-link/request", post(request_link))
        .route("/api/auth/magic-link/verify", get(verify))
}

/// Issues a passwordless login link. Success-shaped regardless of whether
/// the email exists or delivery worked; only the rate limit (abuse
/// protection, not identity protection) and the bot check are visible
/// failures.
#[instrument(skip(state, headers, payload))]
pub async fn request_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut payload): Json<MagicLinkRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    payload.email = normalize_email(&payload.email);

    if !is_valid_email(&payload.email) {
        return Err(AppError::Validation("Invalid email format".into()));
    }

    if !state.rate_limiter.check(&payload.email).await {
        return Err(AppError::RateLimited);
    }

    ensure_human(&state, payload.turnstile_token.as_deref(), &headers).await?;

    if let Err(e) = issue_link(&state, &payload.email, &headers).await {
        error!(error = %e, "magic link issuance failed");
    }

    Ok(Json(MessageResponse::ok(
        "If the email exists, a magic link has been sent.",
    )))
}

async fn issue_link(state: &AppState, email: &str, headers: &HeaderMap) -> anyhow::Result<()> {
    // Magic-link-only accounts exist without a password hash.
    let user = match User::find_by_email(&state.db, email).await? {
        Some(user) => user,
        None => match User::create(&state.db, email, None, None).await? {
            Some(user) => user,
            // Lost a creation race; the row exists now.
            None => User::find_by_email(&state.db, email)
                .await?
                .ok_or_else(|| anyhow::anyhow!("user vanished after create"))?,
        },
    };

    let token = generate_token();
    let expires_at = OffsetDateTime::now_utc() + MAGIC_LINK_TTL;
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok());

    MagicLink::create(
        &state.db,
        user.id,
        email,
        &token,
        expires_at,
        client_ip(headers).as_deref(),
        user_agent,
    )
    .await?;

    let url = format!(
        "{}/api/auth/magic-link/verify?token={token}",
        state.config.base_url
    );
    let message = crate::email::magic_link_email(email, &url);
    crate::email::send_best_effort(state.email.as_ref(), message).await;

    info!(user_id = user.id, "magic link issued");
    Ok(())
}

/// Exchanges an unused, unexpired token for a session. Missing, unknown,
/// used, and expired tokens all render the same failure.
#[instrument(skip(state, query))]
pub async fn verify(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<(HeaderMap, Json<serde_json::Value>), AppError> {
    let invalid = || AppError::Validation("Invalid or expired magic link".into());

    let token = query.token.filter(|t| !t.is_empty()).ok_or_else(invalid)?;

    // The conditional mark-used write is the single-use enforcement point; a
    // concurrent verify losing the race lands in the same error.
    let user_id = MagicLink::consume(&state.db, &token)
        .await?
        .ok_or_else(invalid)?;

    let ttl = Duration::days(state.config.session.oauth_ttl_days);
    let session_token = SessionManager::issue(&state.db, user_id, ttl).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        session_cookie(
            &session_token,
            ttl.whole_seconds(),
            state.config.session.cookie_secure,
        ),
    );

    info!(user_id, "magic link redeemed");
    Ok((
        headers,
        Json(json!({
            "success": true,
            "message": "Login successful",
            "redirect": "/",
        })),
    ))
}
