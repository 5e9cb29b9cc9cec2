use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info};

use crate::config::EmailConfig;

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// Sends through the Resend HTTP API.
pub struct ResendSender {
    client: reqwest::Client,
    config: EmailConfig,
}

impl ResendSender {
    pub fn new(config: EmailConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(SEND_TIMEOUT).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl EmailSender for ResendSender {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        let response = self
            .client
            .post(RESEND_API_URL)
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "from": self.config.from_email,
                "to": message.to,
                "subject": message.subject,
                "html": message.html,
                "text": message.text,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("resend returned {status}: {body}");
        }
        Ok(())
    }
}

/// Dev fallback when no email credentials are configured: logs the link
/// instead of sending anything.
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        info!(to = %message.to, subject = %message.subject, "email send stub");
        Ok(())
    }
}

pub fn magic_link_email(to: &str, magic_link_url: &str) -> EmailMessage {
    let html = format!(
        r#"<div style="font-family: sans-serif; max-width: 600px; margin: 0 auto;">
  <h1>Your login link</h1>
  <p>Click the button below to sign in. This link expires in 15 minutes and can only be used once.</p>
  <p><a href="{magic_link_url}" style="display:inline-block;background:#4f46e5;color:#fff;padding:12px 24px;border-radius:8px;text-decoration:none;">Sign in</a></p>
  <p>If you didn't request this, you can safely ignore this email.</p>
</div>"#
    );
    EmailMessage {
        to: to.to_string(),
        subject: "Your login link".to_string(),
        text: format!(
            "Sign in with this link (expires in 15 minutes): {magic_link_url}\n\nIf you didn't request this, ignore this email."
        ),
        html,
    }
}

pub fn password_reset_email(to: &str, reset_url: &str) -> EmailMessage {
    let html = format!(
        r#"<div style="font-family: sans-serif; max-width: 600px; margin: 0 auto;">
  <h1>Reset your password</h1>
  <p>Someone requested a password reset for your account. The link below expires in 1 hour.</p>
  <p><a href="{reset_url}" style="display:inline-block;background:#4f46e5;color:#fff;padding:12px 24px;border-radius:8px;text-decoration:none;">Reset password</a></p>
  <p>If you didn't request this, you can safely ignore this email and your password will stay unchanged.</p>
</div>"#
    );
    EmailMessage {
        to: to.to_string(),
        subject: "Reset your password".to_string(),
        text: format!(
            "Reset your password with this link (expires in 1 hour): {reset_url}\n\nIf you didn't request this, ignore this email."
        ),
        html,
    }
}

/// Send without surfacing errors to the caller. Enumeration-sensitive flows
/// must stay success-shaped even when the provider is down.
pub async fn send_best_effort(sender: &dyn EmailSender, message: EmailMessage) {
    if let Err(e) = sender.send(&message).await {
        error!(error = %e, to = %message.to, "failed to send email");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_link_email_embeds_url() {
        let msg = magic_link_email("a@x.com", "https://app.test/verify?token=abc");
        assert_eq!(msg.to, "a@x.com");
        assert!(msg.html.contains("https://app.test/verify?token=abc"));
        assert!(msg.text.contains("https://app.test/verify?token=abc"));
        assert!(msg.text.contains("15 minutes"));
    }

    #[test]
    fn reset_email_embeds_url() {
        let msg = password_reset_email("a@x.com", "https://app.test/reset-password?token=xyz");
        assert!(msg.html.contains("token=xyz"));
        assert!(msg.subject.contains("Reset"));
    }

    #[tokio::test]
    async fn log_sender_always_succeeds() {
        let sender = LogEmailSender;
        let msg = magic_link_email("a@x.com", "https://app.test/verify?token=abc");
        assert!(sender.send(&msg).await.is_ok());
    }
}
