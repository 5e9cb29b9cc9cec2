use std::fmt::Write as _;

use axum::http::{
    header::{AUTHORIZATION, COOKIE},
    HeaderMap, HeaderValue,
};
use rand::RngCore;
use sqlx::{FromRow, PgPool};
use time::{Duration, OffsetDateTime};
use tracing::warn;

pub const SESSION_COOKIE_NAME: &str = "session";
pub const OAUTH_STATE_COOKIE_NAME: &str = "oauth_state";

/// Short-lived cookie holding the OAuth CSRF nonce between the authorization
/// request and the callback.
pub const OAUTH_STATE_MAX_AGE_SECS: i64 = 600;

/// Session joined with the owning account in one round-trip, so the auth
/// wall never needs a second read to check the account is still active.
#[derive(Debug, Clone, FromRow)]
pub struct SessionUser {
    pub token: String,
    pub user_id: i64,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub email: String,
    pub role: String,
    pub is_active: bool,
}

/// Generates an opaque 256-bit hex token. Collisions are left to the entropy
/// space; no explicit check.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

pub struct SessionManager;

impl SessionManager {
    /// Persists a fresh token with `now + ttl` expiry and returns it.
    pub async fn issue(db: &PgPool, user_id: i64, ttl: Duration) -> anyhow::Result<String> {
        let token = generate_token();
        let expires_at = OffsetDateTime::now_utc() + ttl;
        sqlx::query("INSERT INTO sessions (token, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(&token)
            .bind(user_id)
            .bind(expires_at)
            .execute(db)
            .await?;
        Ok(token)
    }

    /// Resolves a token to its session and owner. Expired rows are deleted
    /// lazily on first access (no background sweep). The last-seen touch is
    /// advisory; its failure is swallowed.
    pub async fn validate(db: &PgPool, token: &str) -> anyhow::Result<Option<SessionUser>> {
        let row = sqlx::query_as::<_, SessionUser>(
            "SELECT s.token, s.user_id, s.expires_at, s.created_at,
                    u.email, u.role, u.is_active
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = $1",
        )
        .bind(token)
        .fetch_optional(db)
        .await?;

        let Some(session) = row else {
            return Ok(None);
        };

        if session.expires_at < OffsetDateTime::now_utc() {
            Self::revoke(db, token).await?;
            return Ok(None);
        }

        if !session.is_active {
            return Ok(None);
        }

        if let Err(e) = sqlx::query("UPDATE sessions SET last_seen_at = now() WHERE token = $1")
            .bind(token)
            .execute(db)
            .await
        {
            warn!(error = %e, "failed to touch session last_seen_at");
        }

        Ok(Some(session))
    }

    /// Idempotent delete.
    pub async fn revoke(db: &PgPool, token: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Used after password change/reset: every session for the user dies.
    pub async fn revoke_all_for_user(db: &PgPool, user_id: i64) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(())
    }
}

/// Builds the `Set-Cookie` value for a session token.
pub fn session_cookie(token: &str, max_age_secs: i64, secure: bool) -> HeaderValue {
    build_cookie(SESSION_COOKIE_NAME, token, max_age_secs, secure)
}

pub fn clear_session_cookie(secure: bool) -> HeaderValue {
    build_cookie(SESSION_COOKIE_NAME, "", 0, secure)
}

pub fn oauth_state_cookie(state: &str, secure: bool) -> HeaderValue {
    build_cookie(OAUTH_STATE_COOKIE_NAME, state, OAUTH_STATE_MAX_AGE_SECS, secure)
}

pub fn clear_oauth_state_cookie(secure: bool) -> HeaderValue {
    build_cookie(OAUTH_STATE_COOKIE_NAME, "", 0, secure)
}

fn build_cookie(name: &str, value: &str, max_age_secs: i64, secure: bool) -> HeaderValue {
    let mut cookie =
        format!("{name}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).expect("cookie value is ascii")
}

/// Extracts the session token, bearer header taking precedence over the
/// cookie.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = extract_bearer_token(headers) {
        return Some(token);
    }
    cookie_value(headers, SESSION_COOKIE_NAME)
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == name && !val.is_empty() {
            return Some(val.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo::User;

    #[test]
    fn generated_tokens_are_64_hex_chars_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn session_cookie_attributes() {
        let cookie = session_cookie("tok123", 7 * 24 * 3600, true);
        let s = cookie.to_str().unwrap();
        assert!(s.starts_with("session=tok123"));
        assert!(s.contains("HttpOnly"));
        assert!(s.contains("SameSite=Lax"));
        assert!(s.contains("Path=/"));
        assert!(s.contains("Max-Age=604800"));
        assert!(s.contains("Secure"));
    }

    #[test]
    fn insecure_cookie_omits_secure_flag() {
        let cookie = session_cookie("tok", 60, false);
        assert!(!cookie.to_str().unwrap().contains("Secure"));
    }

    #[test]
    fn clear_cookie_zeroes_max_age() {
        let cookie = clear_session_cookie(true);
        let s = cookie.to_str().unwrap();
        assert!(s.starts_with("session=;"));
        assert!(s.contains("Max-Age=0"));
    }

    #[test]
    fn bearer_header_takes_precedence_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        headers.insert(COOKIE, HeaderValue::from_static("session=from-cookie"));
        assert_eq!(
            extract_session_token(&headers).as_deref(),
            Some("from-header")
        );
    }

    #[test]
    fn cookie_is_used_when_no_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; session=tok42; lang=en"),
        );
        assert_eq!(extract_session_token(&headers).as_deref(), Some("tok42"));
    }

    #[test]
    fn missing_token_yields_none() {
        let headers = HeaderMap::new();
        assert!(extract_session_token(&headers).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(extract_session_token(&headers).is_none());
    }

    #[test]
    fn oauth_state_cookie_is_short_lived() {
        let cookie = oauth_state_cookie("nonce", true);
        assert!(cookie.to_str().unwrap().contains("Max-Age=600"));
    }

    #[sqlx::test]
    async fn issued_session_validates_to_its_owner(pool: PgPool) {
        let user = User::create(&pool, "owner@x.com", Some("hash"), None)
            .await
            .unwrap()
            .unwrap();
        let token = SessionManager::issue(&pool, user.id, Duration::days(7))
            .await
            .unwrap();

        let session = SessionManager::validate(&pool, &token)
            .await
            .unwrap()
            .expect("live session resolves");
        assert_eq!(session.user_id, user.id);
        assert_eq!(session.email, "owner@x.com");
    }

    #[sqlx::test]
    async fn expired_session_is_deleted_on_first_access(pool: PgPool) {
        let user = User::create(&pool, "late@x.com", Some("hash"), None)
            .await
            .unwrap()
            .unwrap();
        let token = SessionManager::issue(&pool, user.id, Duration::seconds(-10))
            .await
            .unwrap();

        assert!(SessionManager::validate(&pool, &token)
            .await
            .unwrap()
            .is_none());

        let (remaining,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE token = $1")
                .bind(&token)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(remaining, 0);
    }

    #[sqlx::test]
    async fn revoke_all_kills_every_session_of_the_user(pool: PgPool) {
        let user = User::create(&pool, "multi@x.com", Some("hash"), None)
            .await
            .unwrap()
            .unwrap();
        let first = SessionManager::issue(&pool, user.id, Duration::days(7))
            .await
            .unwrap();
        let second = SessionManager::issue(&pool, user.id, Duration::days(7))
            .await
            .unwrap();

        SessionManager::revoke_all_for_user(&pool, user.id)
            .await
            .unwrap();

        assert!(SessionManager::validate(&pool, &first)
            .await
            .unwrap()
            .is_none());
        assert!(SessionManager::validate(&pool, &second)
            .await
            .unwrap()
            .is_none());
    }

    #[sqlx::test]
    async fn deactivated_account_fails_validation(pool: PgPool) {
        let user = User::create(&pool, "gone@x.com", Some("hash"), None)
            .await
            .unwrap()
            .unwrap();
        let token = SessionManager::issue(&pool, user.id, Duration::days(7))
            .await
            .unwrap();

        sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
            .bind(user.id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(SessionManager::validate(&pool, &token)
            .await
            .unwrap()
            .is_none());
    }
}
