use serde::Deserialize;

/// Session TTLs and cookie behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub ttl_days: i64,
    pub oauth_ttl_days: i64,
    pub cookie_secure: bool,
}

/// Credentials for one OAuth provider. Absent credentials disable the
/// provider's routes instead of failing startup.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
}

/// Outbound email (Resend) credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub api_key: String,
    pub from_email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub base_url: String,
    pub session: SessionConfig,
    pub google: Option<OAuthProviderConfig>,
    pub github: Option<OAuthProviderConfig>,
    pub email: Option<EmailConfig>,
    pub turnstile_secret: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let base_url = std::env::var("BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080".into())
            .trim_end_matches('/')
            .to_string();

        let session = SessionConfig {
            ttl_days: std::env::var("SESSION_TTL_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(7),
            oauth_ttl_days: std::env::var("SESSION_OAUTH_TTL_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(30),
            cookie_secure: std::env::var("SESSION_COOKIE_SECURE")
                .map(|v| v != "false")
                .unwrap_or(true),
        };

        let google = oauth_provider_from_env("GOOGLE", &base_url, "/api/auth/google/callback");
        let github = oauth_provider_from_env("GITHUB", &base_url, "/api/auth/github/callback");

        let email = match (std::env::var("RESEND_API_KEY"), std::env::var("FROM_EMAIL")) {
            (Ok(api_key), Ok(from_email)) => Some(EmailConfig { api_key, from_email }),
            _ => None,
        };

        let turnstile_secret = std::env::var("TURNSTILE_SECRET_KEY").ok();

        Ok(Self {
            database_url,
            base_url,
            session,
            google,
            github,
            email,
            turnstile_secret,
        })
    }
}

fn oauth_provider_from_env(
    prefix: &str,
    base_url: &str,
    default_callback: &str,
) -> Option<OAuthProviderConfig> {
    let client_id = std::env::var(format!("{prefix}_CLIENT_ID")).ok()?;
    let client_secret = std::env::var(format!("{prefix}_CLIENT_SECRET")).ok()?;
    let redirect_url = std::env::var(format!("{prefix}_REDIRECT_URL"))
        .unwrap_or_else(|_| format!("{base_url}{default_callback}"));
    Some(OAuthProviderConfig {
        client_id,
        client_secret,
        redirect_url,
    })
}
