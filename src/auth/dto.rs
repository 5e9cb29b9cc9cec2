use serde::{Deserialize, Serialize};

use crate::auth::repo::User;

/// Request body for user registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: Option<String>,
    pub turnstile_token: Option<String>,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub turnstile_token: Option<String>,
}

/// Request body for a magic-link request.
#[derive(Debug, Deserialize)]
pub struct MagicLinkRequest {
    pub email: String,
    pub turnstile_token: Option<String>,
}

/// Request body for a password reset request.
#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

/// Request body for redeeming a reset token.
#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

/// Request body for the authenticated password change.
#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// `?token=` query for magic-link verify and reset-token verify.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub is_verified: bool,
    pub avatar_url: Option<String>,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            name: user.name.clone(),
            is_verified: user.is_verified,
            avatar_url: user.avatar_url.clone(),
        }
    }
}

/// Response returned after register and login. The token is also set as a
/// cookie; API clients may use it as a bearer credential.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub token: String,
    pub user: PublicUser,
}

/// Success-shaped response used by enumeration-sensitive flows.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Response of the read-only reset-token pre-check.
#[derive(Debug, Serialize)]
pub struct TokenValidity {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl TokenValidity {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(reason: &'static str) -> Self {
        Self {
            valid: false,
            error: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_validity_serialization() {
        let ok = serde_json::to_string(&TokenValidity::valid()).unwrap();
        assert_eq!(ok, r#"{"valid":true}"#);

        let bad = serde_json::to_string(&TokenValidity::invalid("Token expired")).unwrap();
        assert!(bad.contains(r#""valid":false"#));
        assert!(bad.contains("Token expired"));
    }

    #[test]
    fn message_response_is_success_shaped() {
        let json = serde_json::to_string(&MessageResponse::ok("sent")).unwrap();
        assert!(json.contains(r#""success":true"#));
    }
}
