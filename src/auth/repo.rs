use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;

/// User record. `password_hash` is nullable: OAuth-only and magic-link-only
/// accounts have none.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub is_verified: bool,
    pub is_active: bool,
    pub role: String,
    pub avatar_url: Option<String>,
    pub oauth_provider: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

const USER_COLUMNS: &str = "id, email, name, password_hash, is_verified, is_active, role, \
     avatar_url, oauth_provider, created_at, updated_at";

impl User {
    pub async fn find_by_email(db: &PgPool, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email.to_lowercase())
        .fetch_optional(db)
        .await?;
        Ok(user)
    }

    pub async fn find_by_id(db: &PgPool, id: i64) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?;
        Ok(user)
    }

    /// Returns `None` on email uniqueness violation; callers surface that as
    /// "already registered".
    pub async fn create(
        db: &PgPool,
        email: &str,
        password_hash: Option<&str>,
        name: Option<&str>,
    ) -> anyhow::Result<Option<User>> {
        let result = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (email, name, password_hash)
             VALUES ($1, $2, $3)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(email.to_lowercase())
        .bind(name)
        .bind(password_hash)
        .fetch_one(db)
        .await;

        match result {
            Ok(user) => Ok(Some(user)),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates a verified user from a trusted OAuth identity.
    pub async fn create_from_oauth(
        db: &PgPool,
        email: &str,
        name: Option<&str>,
        avatar_url: Option<&str>,
        provider: &str,
    ) -> anyhow::Result<Option<User>> {
        let result = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (email, name, is_verified, avatar_url, oauth_provider)
             VALUES ($1, $2, TRUE, $3, $4)
             RETURNING {USER_COLUMNS}"
        ))
        .bind(email.to_lowercase())
        .bind(name)
        .bind(avatar_url)
        .bind(provider)
        .fetch_one(db)
        .await;

        match result {
            Ok(user) => Ok(Some(user)),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_password(db: &PgPool, user_id: i64, password_hash: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = now() WHERE id = $2")
            .bind(password_hash)
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn update_avatar(db: &PgPool, user_id: i64, avatar_url: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE users SET avatar_url = $1, updated_at = now() WHERE id = $2")
            .bind(avatar_url)
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(())
    }
}

/// Link between a local user and an external identity. `(provider,
/// provider_account_id)` is the durable correlation key.
#[derive(Debug, Clone, FromRow)]
pub struct OAuthAccount {
    pub id: i64,
    pub user_id: i64,
    pub provider: String,
    pub provider_account_id: String,
}

impl OAuthAccount {
    pub async fn find_by_provider_account(
        db: &PgPool,
        provider: &str,
        provider_account_id: &str,
    ) -> anyhow::Result<Option<OAuthAccount>> {
        let account = sqlx::query_as::<_, OAuthAccount>(
            "SELECT id, user_id, provider, provider_account_id
             FROM oauth_accounts
             WHERE provider = $1 AND provider_account_id = $2",
        )
        .bind(provider)
        .bind(provider_account_id)
        .fetch_optional(db)
        .await?;
        Ok(account)
    }

    /// Provider tokens are refreshed on every re-login.
    pub async fn update_tokens(
        db: &PgPool,
        provider: &str,
        provider_account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE oauth_accounts
             SET access_token = $1, refresh_token = $2, updated_at = now()
             WHERE provider = $3 AND provider_account_id = $4",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(provider)
        .bind(provider_account_id)
        .execute(db)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        db: &PgPool,
        user_id: i64,
        provider: &str,
        provider_account_id: &str,
        email: &str,
        name: Option<&str>,
        avatar_url: Option<&str>,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO oauth_accounts
                 (user_id, provider, provider_account_id, email, name, avatar_url,
                  access_token, refresh_token)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(user_id)
        .bind(provider)
        .bind(provider_account_id)
        .bind(email)
        .bind(name)
        .bind(avatar_url)
        .bind(access_token)
        .bind(refresh_token)
        .execute(db)
        .await?;
        Ok(())
    }
}

/// Single-use passwordless credential. Rows are write-only from this side:
/// issuance inserts, redemption is a conditional update, so no read model is
/// needed.
pub struct MagicLink;

impl MagicLink {
    pub async fn create(
        db: &PgPool,
        user_id: i64,
        email: &str,
        token: &str,
        expires_at: OffsetDateTime,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO magic_links (user_id, email, token, expires_at, ip_address, user_agent)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(user_id)
        .bind(email.to_lowercase())
        .bind(token)
        .bind(expires_at)
        .bind(ip_address)
        .bind(user_agent)
        .execute(db)
        .await?;
        Ok(())
    }

    /// Atomically marks the token used and returns the owning user id. The
    /// conditional update is the single-use enforcement point: a concurrent
    /// redeemer that loses the race gets `None`.
    pub async fn consume(db: &PgPool, token: &str) -> anyhow::Result<Option<i64>> {
        let user_id: Option<(i64,)> = sqlx::query_as(
            "UPDATE magic_links
             SET used_at = now()
             WHERE token = $1 AND used_at IS NULL AND expires_at > now()
             RETURNING user_id",
        )
        .bind(token)
        .fetch_optional(db)
        .await?;
        Ok(user_id.map(|(id,)| id))
    }
}

/// Single-use password rotation credential.
#[derive(Debug, Clone, FromRow)]
pub struct PasswordReset {
    pub id: i64,
    pub user_id: i64,
    pub expires_at: OffsetDateTime,
    pub used: bool,
}

impl PasswordReset {
    /// At most one live reset token per user: issuing a new one deletes all
    /// prior tokens first.
    pub async fn replace_for_user(
        db: &PgPool,
        user_id: i64,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM password_resets WHERE user_id = $1")
            .bind(user_id)
            .execute(db)
            .await?;
        sqlx::query(
            "INSERT INTO password_resets (user_id, token, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn find_by_token(db: &PgPool, token: &str) -> anyhow::Result<Option<PasswordReset>> {
        let reset = sqlx::query_as::<_, PasswordReset>(
            "SELECT id, user_id, expires_at, used FROM password_resets WHERE token = $1",
        )
        .bind(token)
        .fetch_optional(db)
        .await?;
        Ok(reset)
    }

    /// Conditional mark-used; `None` means the token was already consumed or
    /// expired, including a lost race against a concurrent redeemer.
    pub async fn consume(db: &PgPool, token: &str) -> anyhow::Result<Option<i64>> {
        let user_id: Option<(i64,)> = sqlx::query_as(
            "UPDATE password_resets
             SET used = TRUE
             WHERE token = $1 AND used = FALSE AND expires_at > now()
             RETURNING user_id",
        )
        .bind(token)
        .fetch_optional(db)
        .await?;
        Ok(user_id.map(|(id,)| id))
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn user_serialization_skips_password_hash() {
        let user = User {
            id: 1,
            email: "a@x.com".into(),
            name: Some("A".into()),
            password_hash: Some("secret-hash".into()),
            is_verified: false,
            is_active: true,
            role: "user".into(),
            avatar_url: None,
            oauth_provider: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(json.contains("a@x.com"));
        assert!(!json.contains("secret-hash"));
        assert!(!json.contains("password_hash"));
    }

    #[test]
    fn unique_violation_detects_only_23505() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[sqlx::test]
    async fn duplicate_registration_is_rejected_case_insensitively(pool: PgPool) {
        let first = User::create(&pool, "Dup@Example.com", Some("hash-a"), Some("Dup"))
            .await
            .unwrap()
            .expect("first registration succeeds");
        assert_eq!(first.email, "dup@example.com");

        let second = User::create(&pool, "dup@example.COM", Some("hash-b"), None)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[sqlx::test]
    async fn magic_link_token_redeems_exactly_once(pool: PgPool) {
        let user = User::create(&pool, "ml@x.com", None, None)
            .await
            .unwrap()
            .unwrap();
        let expires_at = OffsetDateTime::now_utc() + Duration::minutes(15);
        MagicLink::create(&pool, user.id, "ml@x.com", "ml-token", expires_at, None, None)
            .await
            .unwrap();

        assert_eq!(
            MagicLink::consume(&pool, "ml-token").await.unwrap(),
            Some(user.id)
        );
        // the conditional mark-used write already fired; the rerun loses
        assert_eq!(MagicLink::consume(&pool, "ml-token").await.unwrap(), None);
    }

    #[sqlx::test]
    async fn expired_magic_link_is_not_redeemable(pool: PgPool) {
        let user = User::create(&pool, "late@x.com", None, None)
            .await
            .unwrap()
            .unwrap();
        let expires_at = OffsetDateTime::now_utc() - Duration::minutes(1);
        MagicLink::create(&pool, user.id, "late@x.com", "stale", expires_at, None, None)
            .await
            .unwrap();

        assert_eq!(MagicLink::consume(&pool, "stale").await.unwrap(), None);
    }

    #[sqlx::test]
    async fn reset_token_redeems_exactly_once(pool: PgPool) {
        let user = User::create(&pool, "once@x.com", Some("hash"), None)
            .await
            .unwrap()
            .unwrap();
        let expires_at = OffsetDateTime::now_utc() + Duration::hours(1);
        PasswordReset::replace_for_user(&pool, user.id, "reset-token", expires_at)
            .await
            .unwrap();

        assert_eq!(
            PasswordReset::consume(&pool, "reset-token").await.unwrap(),
            Some(user.id)
        );
        assert_eq!(
            PasswordReset::consume(&pool, "reset-token").await.unwrap(),
            None
        );
    }

    #[sqlx::test]
    async fn new_reset_token_invalidates_the_prior_one(pool: PgPool) {
        let user = User::create(&pool, "twice@x.com", Some("hash"), None)
            .await
            .unwrap()
            .unwrap();
        let expires_at = OffsetDateTime::now_utc() + Duration::hours(1);
        PasswordReset::replace_for_user(&pool, user.id, "first", expires_at)
            .await
            .unwrap();
        PasswordReset::replace_for_user(&pool, user.id, "second", expires_at)
            .await
            .unwrap();

        assert!(PasswordReset::find_by_token(&pool, "first")
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            PasswordReset::consume(&pool, "second").await.unwrap(),
            Some(user.id)
        );
    }
}
