use axum::{
    extract::{Path, Query, State},
    http::{header::SET_COOKIE, HeaderMap},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use sqlx::PgPool;
use time::Duration;
use tracing::{error, info, instrument, warn};

use crate::auth::repo::{OAuthAccount, User};
use crate::auth::session::{
    clear_oauth_state_cookie, cookie_value, generate_token, oauth_state_cookie, session_cookie,
    SessionManager, OAUTH_STATE_COOKIE_NAME,
};
use crate::auth::urlencode;
use crate::config::OAuthProviderConfig;
use crate::error::AppError;
use crate::state::AppState;

const GITHUB_USER_AGENT: &str = "moodtrack";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/:provider", get(authorize))
        .route("/api/auth/:provider/callback", get(callback))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Google,
    Github,
}

impl Provider {
    fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "google" => Some(Provider::Google),
            "github" => Some(Provider::Github),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Github => "github",
        }
    }

    fn config(self, state: &AppState) -> Option<&OAuthProviderConfig> {
        match self {
            Provider::Google => state.config.google.as_ref(),
            Provider::Github => state.config.github.as_ref(),
        }
    }

    /// Provider authorization URL carrying the CSRF nonce as `state`.
    fn authorize_url(self, config: &OAuthProviderConfig, state_nonce: &str) -> String {
        match self {
            Provider::Google => format!(
                "https://accounts.google.com/o/oauth2/v2/auth\
                 ?client_id={}&redirect_uri={}&response_type=code\
                 &scope={}&state={}&access_type=offline&prompt=consent",
                urlencode(&config.client_id),
                urlencode(&config.redirect_url),
                urlencode("openid email profile"),
                urlencode(state_nonce),
            ),
            Provider::Github => format!(
                "https://github.com/login/oauth/authorize\
                 ?client_id={}&redirect_uri={}&scope={}&state={}",
                urlencode(&config.client_id),
                urlencode(&config.redirect_url),
                urlencode("read:user user:email"),
                urlencode(state_nonce),
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    error: Option<String>,
}

/// Identity attributes resolved from a provider's profile endpoint.
#[derive(Debug)]
pub struct ProviderProfile {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    id: String,
    email: String,
    name: Option<String>,
    picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: i64,
    login: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

/// Redirects the browser to the provider's consent screen and plants the
/// state nonce cookie the callback will check against.
#[instrument(skip(state))]
pub async fn authorize(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Response, AppError> {
    let provider = Provider::from_path(&provider)
        .ok_or_else(|| AppError::Validation("Unknown OAuth provider".into()))?;
    let config = provider
        .config(&state)
        .ok_or(AppError::NotConfigured("oauth provider"))?;

    let nonce = generate_token();
    let url = provider.authorize_url(config, &nonce);

    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        oauth_state_cookie(&nonce, state.config.session.cookie_secure),
    );
    Ok((headers, Redirect::to(&url)).into_response())
}

/// Provider redirect target. Every failure lands back on the login page
/// with a machine-readable `error` code; no session is issued on any
/// failure path.
#[instrument(skip(state, headers, query), fields(provider = %provider))]
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let provider = match Provider::from_path(&provider) {
        Some(provider) => provider,
        None => return login_error("oauth_failed"),
    };

    if let Some(provider_error) = query.error.as_deref() {
        warn!(error = provider_error, "provider returned an error");
        return login_error(provider_error);
    }

    let code = match query.code.as_deref().filter(|c| !c.is_empty()) {
        Some(code) => code,
        None => return login_error("no_code"),
    };

    // CSRF check: the state must round-trip through the nonce cookie set
    // by the authorize step. A valid code with the wrong state is rejected
    // before anything touches the network or the database.
    let stored_nonce = cookie_value(&headers, OAUTH_STATE_COOKIE_NAME);
    match (query.state.as_deref(), stored_nonce.as_deref()) {
        (Some(received), Some(stored)) if received == stored && !received.is_empty() => {}
        _ => return login_error("invalid_state"),
    }

    let config = match provider.config(&state) {
        Some(config) => config,
        None => return login_error("oauth_not_configured"),
    };

    let tokens = match exchange_code(provider, config, code).await {
        Ok(tokens) => tokens,
        Err(redirect_code) => return login_error(redirect_code),
    };
    let access_token = match tokens.access_token.as_deref() {
        Some(token) => token,
        None => return login_error("token_exchange_failed"),
    };

    let profile = match fetch_profile(provider, access_token).await {
        Ok(profile) => profile,
        Err(redirect_code) => return login_error(redirect_code),
    };

    let user = match find_or_create_oauth_user(
        &state.db,
        provider,
        &profile,
        access_token,
        tokens.refresh_token.as_deref(),
    )
    .await
    {
        Ok(Some(user)) => user,
        Ok(None) => return login_error("user_creation_failed"),
        Err(e) => {
            error!(error = %e, "oauth user resolution failed");
            return login_error("oauth_failed");
        }
    };

    let ttl = Duration::days(state.config.session.oauth_ttl_days);
    let session_token = match SessionManager::issue(&state.db, user.id, ttl).await {
        Ok(token) => token,
        Err(e) => {
            error!(error = %e, "session issuance failed after oauth login");
            return login_error("oauth_failed");
        }
    };

    info!(user_id = user.id, "oauth login");
    let secure = state.config.session.cookie_secure;
    let mut response_headers = HeaderMap::new();
    response_headers.append(
        SET_COOKIE,
        session_cookie(&session_token, ttl.whole_seconds(), secure),
    );
    response_headers.append(SET_COOKIE, clear_oauth_state_cookie(secure));
    (response_headers, Redirect::to("/dashboard")).into_response()
}

fn login_error(code: &str) -> Response {
    Redirect::to(&format!("/login?error={}", urlencode(code))).into_response()
}

async fn exchange_code(
    provider: Provider,
    config: &OAuthProviderConfig,
    code: &str,
) -> Result<TokenResponse, &'static str> {
    let client = http_client().map_err(|_| "token_exchange_failed")?;

    let response = match provider {
        Provider::Google => {
            client
                .post("https://oauth2.googleapis.com/token")
                .form(&[
                    ("code", code),
                    ("client_id", config.client_id.as_str()),
                    ("client_secret", config.client_secret.as_str()),
                    ("redirect_uri", config.redirect_url.as_str()),
                    ("grant_type", "authorization_code"),
                ])
                .send()
                .await
        }
        Provider::Github => {
            client
                .post("https://github.com/login/oauth/access_token")
                .header(axum::http::header::ACCEPT, "application/json")
                .json(&serde_json::json!({
                    "client_id": config.client_id,
                    "client_secret": config.client_secret,
                    "code": code,
                    "redirect_uri": config.redirect_url,
                }))
                .send()
                .await
        }
    };

    let response = match response {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            warn!(provider = provider.as_str(), status = %response.status(), "token exchange rejected");
            return Err("token_exchange_failed");
        }
        Err(e) => {
            warn!(provider = provider.as_str(), error = %e, "token exchange unreachable");
            return Err("token_exchange_failed");
        }
    };

    let tokens: TokenResponse = response
        .json()
        .await
        .map_err(|_| "token_exchange_failed")?;
    if tokens.error.is_some() {
        return Err("token_exchange_failed");
    }
    Ok(tokens)
}

async fn fetch_profile(provider: Provider, access_token: &str) -> Result<ProviderProfile, &'static str> {
    let client = http_client().map_err(|_| "user_info_failed")?;

    match provider {
        Provider::Google => {
            let response = client
                .get("https://www.googleapis.com/oauth2/v2/userinfo")
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(|_| "user_info_failed")?;
            if !response.status().is_success() {
                return Err("user_info_failed");
            }
            let info: GoogleUserInfo = response.json().await.map_err(|_| "user_info_failed")?;
            Ok(ProviderProfile {
                id: info.id,
                email: info.email,
                name: info.name,
                avatar_url: info.picture,
            })
        }
        Provider::Github => {
            let response = client
                .get("https://api.github.com/user")
                .bearer_auth(access_token)
                .header(axum::http::header::USER_AGENT, GITHUB_USER_AGENT)
                .send()
                .await
                .map_err(|_| "user_info_failed")?;
            if !response.status().is_success() {
                return Err("user_info_failed");
            }
            let info: GithubUser = response.json().await.map_err(|_| "user_info_failed")?;

            // GitHub profiles may hide the email; fall back to the email
            // list and prefer the verified primary address.
            let email = match info.email {
                Some(email) => email,
                None => github_fallback_email(&client, access_token)
                    .await
                    .ok_or("email_required")?,
            };

            Ok(ProviderProfile {
                id: info.id.to_string(),
                email,
                name: info.name.or(Some(info.login)),
                avatar_url: info.avatar_url,
            })
        }
    }
}

async fn github_fallback_email(client: &reqwest::Client, access_token: &str) -> Option<String> {
    let response = client
        .get("https://api.github.com/user/emails")
        .bearer_auth(access_token)
        .header(axum::http::header::USER_AGENT, GITHUB_USER_AGENT)
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let emails: Vec<GithubEmail> = response.json().await.ok()?;
    emails
        .iter()
        .find(|e| e.primary && e.verified)
        .or_else(|| emails.first())
        .map(|e| e.email.clone())
}

fn http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
}

/// Resolves the provider identity to a local user: an existing link wins,
/// then an email match (the provider account gets attached), then a fresh
/// account. OAuth emails count as verified.
pub async fn find_or_create_oauth_user(
    db: &PgPool,
    provider: Provider,
    profile: &ProviderProfile,
    access_token: &str,
    refresh_token: Option<&str>,
) -> anyhow::Result<Option<User>> {
    let email = profile.email.trim().to_lowercase();

    if let Some(account) =
        OAuthAccount::find_by_provider_account(db, provider.as_str(), &profile.id).await?
    {
        OAuthAccount::update_tokens(
            db,
            provider.as_str(),
            &profile.id,
            access_token,
            refresh_token,
        )
        .await?;
        return User::find_by_id(db, account.user_id).await;
    }

    let user = match User::find_by_email(db, &email).await? {
        Some(user) => user,
        None => {
            match User::create_from_oauth(
                db,
                &email,
                profile.name.as_deref(),
                profile.avatar_url.as_deref(),
                provider.as_str(),
            )
            .await?
            {
                Some(user) => user,
                // Concurrent signup with the same email; link to that row.
                None => match User::find_by_email(db, &email).await? {
                    Some(user) => user,
                    None => return Ok(None),
                },
            }
        }
    };

    OAuthAccount::create(
        db,
        user.id,
        provider.as_str(),
        &profile.id,
        &email,
        profile.name.as_deref(),
        profile.avatar_url.as_deref(),
        access_token,
        refresh_token,
    )
    .await?;

    if user.avatar_url.is_none() {
        if let Some(avatar_url) = profile.avatar_url.as_deref() {
            User::update_avatar(db, user.id, avatar_url).await?;
        }
    }

    User::find_by_id(db, user.id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_known_path_segments() {
        assert_eq!(Provider::from_path("google"), Some(Provider::Google));
        assert_eq!(Provider::from_path("github"), Some(Provider::Github));
        assert_eq!(Provider::from_path("gitlab"), None);
        assert_eq!(Provider::from_path(""), None);
    }

    #[test]
    fn google_authorize_url_carries_state_and_scopes() {
        let config = OAuthProviderConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_url: "http://localhost:8080/api/auth/google/callback".into(),
        };
        let url = Provider::Google.authorize_url(&config, "nonce123");
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("state=nonce123"));
        assert!(url.contains("scope=openid%20email%20profile"));
        assert!(url.contains("access_type=offline"));
        assert!(!url.contains("secret"));
    }

    #[test]
    fn github_authorize_url_requests_email_scope() {
        let config = OAuthProviderConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            redirect_url: "http://localhost:8080/api/auth/github/callback".into(),
        };
        let url = Provider::Github.authorize_url(&config, "n");
        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("scope=read%3Auser%20user%3Aemail"));
        assert!(url.contains("state=n"));
    }

    #[test]
    fn token_response_tolerates_provider_error_field() {
        let tokens: TokenResponse =
            serde_json::from_str(r#"{"error":"bad_verification_code"}"#).unwrap();
        assert!(tokens.access_token.is_none());
        assert_eq!(tokens.error.as_deref(), Some("bad_verification_code"));

        let tokens: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc","refresh_token":"def"}"#).unwrap();
        assert_eq!(tokens.access_token.as_deref(), Some("abc"));
        assert_eq!(tokens.refresh_token.as_deref(), Some("def"));
    }

    #[test]
    fn github_user_email_may_be_null() {
        let user: GithubUser = serde_json::from_str(
            r#"{"id":42,"login":"octocat","name":null,"email":null,"avatar_url":"https://example.com/a.png"}"#,
        )
        .unwrap();
        assert_eq!(user.id, 42);
        assert!(user.email.is_none());
    }
}
