use std::collections::HashSet;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use lazy_static::lazy_static;

use crate::auth::session::{extract_session_token, SessionManager, SessionUser};
use crate::auth::urlencode;
use crate::error::AppError;
use crate::state::AppState;

/// Identity attached to the request once the wall has resolved a valid
/// session. Downstream handlers read it instead of re-resolving.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: i64,
    pub session: SessionUser,
}

/// Route classification built once at startup: an exact-match set plus a
/// prefix list, instead of ad hoc string checks per request.
pub struct RouteClassifier {
    exact: HashSet<&'static str>,
    prefixes: Vec<&'static str>,
}

impl RouteClassifier {
    pub fn new(exact: &[&'static str], prefixes: &[&'static str]) -> Self {
        Self {
            exact: exact.iter().copied().collect(),
            prefixes: prefixes.to_vec(),
        }
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.exact.contains(path) || self.prefixes.iter().any(|p| path.starts_with(p))
    }
}

lazy_static! {
    /// Public pages. `/api/` paths bypass the page wall entirely and are
    /// gated by the API wall instead.
    static ref PAGE_PUBLIC: RouteClassifier = RouteClassifier::new(
        &[
            "/",
            "/login",
            "/register",
            "/forgot-password",
            "/reset-password",
            "/privacy-policy",
            "/terms-of-service",
            "/about",
        ],
        &["/static/", "/auth/", "/api/"],
    );

    /// Public API surface: health plus the nested auth endpoints.
    static ref API_PUBLIC: RouteClassifier =
        RouteClassifier::new(&["/api/health"], &["/api/auth/"]);
}

/// Page gate: unauthenticated requests are redirected to the login page with
/// the originally requested path+query as a return URL.
pub async fn page_auth_wall(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if PAGE_PUBLIC.is_public(&path) {
        return next.run(request).await;
    }

    let intended = match request.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let login_redirect = || Redirect::to(&format!("/login?redirect={}", urlencode(&intended)));

    let Some(token) = extract_session_token(request.headers()) else {
        return login_redirect().into_response();
    };

    match SessionManager::validate(&state.db, &token).await {
        Ok(Some(session)) => {
            request.extensions_mut().insert(AuthContext {
                user_id: session.user_id,
                session,
            });
            next.run(request).await
        }
        Ok(None) => login_redirect().into_response(),
        Err(e) => AppError::Internal(e).into_response(),
    }
}

/// API gate: unauthenticated requests get a structured 401, never a
/// redirect. Validation joins the account's active flag in one round-trip.
pub async fn api_auth_wall(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if !path.starts_with("/api/") || API_PUBLIC.is_public(path) {
        return next.run(request).await;
    }

    let Some(token) = extract_session_token(request.headers()) else {
        return AppError::Unauthenticated.into_response();
    };

    match SessionManager::validate(&state.db, &token).await {
        Ok(Some(session)) => {
            request.extensions_mut().insert(AuthContext {
                user_id: session.user_id,
                session,
            });
            next.run(request).await
        }
        Ok(None) => AppError::Unauthenticated.into_response(),
        Err(e) => AppError::Internal(e).into_response(),
    }
}

/// Authorization layered on authentication: applied per route, after the
/// gate, rejecting with 403 when the account's role does not match.
pub async fn require_admin(state: State<AppState>, request: Request, next: Next) -> Response {
    require_role(state, "admin", request, next).await
}

async fn require_role(
    State(state): State<AppState>,
    role: &'static str,
    request: Request,
    next: Next,
) -> Response {
    let session = match request.extensions().get::<AuthContext>() {
        Some(ctx) => ctx.session.clone(),
        None => {
            // Route was wired without a wall in front; resolve directly.
            let Some(token) = extract_session_token(request.headers()) else {
                return AppError::Unauthenticated.into_response();
            };
            match SessionManager::validate(&state.db, &token).await {
                Ok(Some(session)) => session,
                Ok(None) => return AppError::Unauthenticated.into_response(),
                Err(e) => return AppError::Internal(e).into_response(),
            }
        }
    };

    if session.role != role {
        return AppError::Forbidden.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_matches_are_public() {
        assert!(PAGE_PUBLIC.is_public("/"));
        assert!(PAGE_PUBLIC.is_public("/login"));
        assert!(PAGE_PUBLIC.is_public("/register"));
        assert!(!PAGE_PUBLIC.is_public("/dashboard"));
        assert!(!PAGE_PUBLIC.is_public("/settings"));
    }

    #[test]
    fn prefix_matches_are_public() {
        assert!(PAGE_PUBLIC.is_public("/static/app.css"));
        assert!(PAGE_PUBLIC.is_public("/api/moods"));
        assert!(PAGE_PUBLIC.is_public("/auth/magic-link/verify"));
    }

    #[test]
    fn api_classifier_allows_auth_and_health_only() {
        assert!(API_PUBLIC.is_public("/api/health"));
        assert!(API_PUBLIC.is_public("/api/auth/login"));
        assert!(API_PUBLIC.is_public("/api/auth/magic-link/request"));
        assert!(!API_PUBLIC.is_public("/api/profile"));
        assert!(!API_PUBLIC.is_public("/api/moods"));
        assert!(!API_PUBLIC.is_public("/api/admin/stats"));
    }

    #[test]
    fn exact_match_does_not_leak_into_subpaths() {
        let classifier = RouteClassifier::new(&["/login"], &[]);
        assert!(classifier.is_public("/login"));
        assert!(!classifier.is_public("/login/extra"));
    }
}
