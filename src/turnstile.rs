use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

const SITEVERIFY_URL: &str = "https://challenges.cloudflare.com/turnstile/v0/siteverify";
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Human-verification (bot challenge) check performed before
/// enumeration-sensitive or abuse-prone operations.
#[async_trait]
pub trait BotVerifier: Send + Sync {
    /// Returns whether the challenge token is valid for the given client IP.
    /// Provider outages map to `false`, never to an error surfaced upstream.
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> bool;
}

#[derive(Debug, Deserialize)]
struct SiteverifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Cloudflare Turnstile implementation.
pub struct TurnstileVerifier {
    client: reqwest::Client,
    secret: String,
}

impl TurnstileVerifier {
    pub fn new(secret: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(VERIFY_TIMEOUT).build()?;
        Ok(Self { client, secret })
    }
}

#[async_trait]
impl BotVerifier for TurnstileVerifier {
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> bool {
        let mut form = vec![
            ("secret", self.secret.as_str()),
            ("response", token),
        ];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip));
        }

        let response = match self.client.post(SITEVERIFY_URL).form(&form).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "turnstile verification request failed");
                return false;
            }
        };

        match response.json::<SiteverifyResponse>().await {
            Ok(result) => {
                if !result.success {
                    warn!(error_codes = ?result.error_codes, "turnstile rejected token");
                }
                result.success
            }
            Err(e) => {
                warn!(error = %e, "turnstile response parse failed");
                false
            }
        }
    }
}

/// Accepts everything. Used when no Turnstile secret is configured and in
/// tests.
pub struct AllowAllVerifier;

#[async_trait]
impl BotVerifier for AllowAllVerifier {
    async fn verify(&self, _token: &str, _remote_ip: Option<&str>) -> bool {
        true
    }
}

/// Loopback callers skip the bot challenge entirely. Input is a
/// header-sourced address, so only literal loopback IPs qualify.
pub fn is_loopback(ip: &str) -> bool {
    ip == "127.0.0.1" || ip == "::1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_accepts_any_token() {
        assert!(AllowAllVerifier.verify("anything", None).await);
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("::1"));
        assert!(!is_loopback("203.0.113.9"));
        assert!(!is_loopback("localhost"));
    }
}
