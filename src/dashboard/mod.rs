//! HTTP + WebSocket control plane: accounts, bot configs and per-user bots.

pub mod manager;
pub mod routes;
pub mod ws;

use crate::auth::AuthService;
use crate::db::{Database, User};
use crate::error::BotError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use log::error;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use manager::{BotManager, Credentials, ManagedStatus, ManagerSettings, DEFAULT_STOP_TIMEOUT};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub auth: AuthService,
    pub manager: Arc<BotManager>,
    pub revoked: RevokedTokens,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: Database, auth: AuthService, manager: BotManager) -> Self {
        Self {
            db,
            auth,
            manager: Arc::new(manager),
            revoked: RevokedTokens::default(),
            started_at: Utc::now(),
        }
    }
}

/// Logged-out tokens, kept only until they would have expired anyway.
#[derive(Clone, Default)]
pub struct RevokedTokens(Arc<RwLock<HashMap<String, i64>>>);

impl RevokedTokens {
    pub async fn revoke(&self, token: String, expires_at: i64) {
        self.revoke_at(token, expires_at, Utc::now().timestamp()).await;
    }

    async fn revoke_at(&self, token: String, expires_at: i64, now: i64) {
        let mut tokens = self.0.write().await;
        tokens.retain(|_, exp| *exp > now);
        if expires_at > now {
            tokens.insert(token, expires_at);
        }
    }

    pub async fn contains(&self, token: &str) -> bool {
        self.0.read().await.contains_key(token)
    }

    pub async fn count(&self) -> usize {
        self.0.read().await.len()
    }
}

/// `BotError` rendered as `{ "detail": ... }` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub BotError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            BotError::Validation(_) => StatusCode::BAD_REQUEST,
            BotError::Auth(_) => StatusCode::UNAUTHORIZED,
            BotError::NotFound(_) => StatusCode::NOT_FOUND,
            BotError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl<E: Into<BotError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        let body = match &self.0 {
            BotError::Validation(errors) => json!({ "detail": self.0.to_string(), "errors": errors }),
            other => json!({ "detail": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The user behind a valid `Authorization: Bearer` token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub token: String,
    pub expires_at: i64,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
            .ok_or_else(|| BotError::Auth("Not authenticated".into()))?;
        state.authenticate(&token).await.map_err(ApiError)
    }
}

impl AppState {
    pub async fn authenticate(&self, token: &str) -> Result<AuthUser, BotError> {
        if self.revoked.contains(token).await {
            return Err(BotError::Auth("Token revoked".into()));
        }
        let claims = self.auth.verify_token(token)?;
        let user = self
            .db
            .user_by_id(claims.sub)
            .await
            .map_err(|_| BotError::Auth("User no longer exists".into()))?;
        if !user.is_active {
            return Err(BotError::Auth("Account disabled".into()));
        }
        Ok(AuthUser {
            user,
            token: token.to_string(),
            expires_at: claims.exp,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/stats", get(routes::stats))
        .route("/api/auth/signup", post(routes::signup))
        .route("/api/auth/login", post(routes::login))
        .route("/api/auth/logout", post(routes::logout))
        .route("/api/auth/me", get(routes::me))
        .route(
            "/api/auth/api-keys",
            put(routes::set_api_keys).delete(routes::delete_api_keys),
        )
        .route("/api/auth/api-keys/status", get(routes::api_keys_status))
        .route("/api/configs/templates", get(routes::list_templates))
        .route("/api/configs/templates/{name}", get(routes::get_template))
        .route("/api/configs/my-configs", get(routes::my_configs))
        .route("/api/configs/validate", post(routes::validate_config))
        .route("/api/configs/create", post(routes::create_config))
        .route("/api/configs/active/current", get(routes::active_config))
        .route(
            "/api/configs/{id}",
            get(routes::get_config)
                .put(routes::update_config)
                .delete(routes::delete_config),
        )
        .route("/api/configs/{id}/activate", post(routes::activate_config))
        .route("/api/bot/start", post(routes::start_bot))
        .route("/api/bot/stop", post(routes::stop_bot))
        .route("/api/bot/restart", post(routes::restart_bot))
        .route("/api/bot/status", get(routes::bot_status))
        .route("/api/bot/logs", get(routes::bot_logs))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (BotError::Validation(vec![ValidationError::new("name", "too short")]), StatusCode::BAD_REQUEST),
            (BotError::Auth("nope".into()), StatusCode::UNAUTHORIZED),
            (BotError::NotFound("Configuration".into()), StatusCode::NOT_FOUND),
            (BotError::Conflict("running".into()), StatusCode::CONFLICT),
            (BotError::Exchange("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn revoked_and_forged_tokens_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::test_state(dir.path()).await;
        let user = state.db.create_user("carol", "carol@example.com", "x$y").await.unwrap();
        let token = state.auth.issue_token(user.id, &user.username).unwrap();

        assert_eq!(state.authenticate(&token).await.unwrap().user.id, user.id);
        let claims = state.auth.verify_token(&token).unwrap();
        state.revoked.revoke(token.clone(), claims.exp).await;
        assert!(matches!(state.authenticate(&token).await, Err(BotError::Auth(_))));

        let ghost = state.auth.issue_token(999, "ghost").unwrap();
        assert!(state.authenticate(&ghost).await.is_err());
    }

    #[tokio::test]
    async fn revoked_tokens_are_forgotten_after_expiry() {
        let revoked = RevokedTokens::default();
        revoked.revoke_at("first".into(), 100, 50).await;
        revoked.revoke_at("stale".into(), 40, 50).await;
        assert!(revoked.contains("first").await);
        assert!(!revoked.contains("stale").await);

        revoked.revoke_at("second".into(), 300, 200).await;
        assert!(!revoked.contains("first").await);
        assert!(revoked.contains("second").await);
        assert_eq!(revoked.count().await, 1);
    }
}
