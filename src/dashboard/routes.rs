use super::{ApiResult, AppState, AuthUser, Credentials, ManagedStatus};
use crate::auth::{hash_password, mask_key, verify_password};
use crate::bot::BotCommand;
use crate::bot_config::{self, parse_and_validate, BotConfig, TemplateInfo};
use crate::db::{StoredConfig, User};
use crate::error::{BotError, ValidationError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

fn invalid(field: &str, message: impl Into<String>) -> BotError {
    BotError::Validation(vec![ValidationError::new(field, message)])
}

#[derive(Debug, Serialize)]
pub struct Message {
    pub success: bool,
    pub message: String,
}

impl Message {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

// ---- system ----

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
    }))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({
        "total_users": state.db.count_users().await?,
        "total_configs": state.db.count_configs().await?,
        "total_trades": state.db.count_trades().await?,
        "running_bots": state.manager.running_count().await,
    })))
}

// ---- auth ----

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub user_id: i64,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub has_api_keys: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            is_active: user.is_active,
            has_api_keys: user.has_api_keys(),
            created_at: user.created_at,
            last_login: user.last_login,
        }
    }
}

fn token_response(state: &AppState, user: &User) -> ApiResult<Json<TokenResponse>> {
    Ok(Json(TokenResponse {
        access_token: state.auth.issue_token(user.id, &user.username)?,
        token_type: "bearer",
        expires_in: state.auth.token_ttl().num_seconds(),
        user_id: user.id,
        username: user.username.clone(),
        email: user.email.clone(),
    }))
}

fn validate_signup(req: &SignupRequest) -> Result<(String, String), BotError> {
    let mut errors = Vec::new();
    let username = req.username.trim().to_lowercase();
    if !(3..=50).contains(&username.len()) {
        errors.push(ValidationError::new("username", "must be 3 to 50 characters"));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        errors.push(ValidationError::new("username", "only letters, digits and underscores"));
    }
    let email = req.email.trim().to_lowercase();
    let valid_email = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !domain.starts_with('.'));
    if !valid_email {
        errors.push(ValidationError::new("email", "not a valid email address"));
    }
    if !(6..=100).contains(&req.password.len()) {
        errors.push(ValidationError::new("password", "must be 6 to 100 characters"));
    }
    if errors.is_empty() {
        Ok((username, email))
    } else {
        Err(BotError::Validation(errors))
    }
}

pub async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> ApiResult<(StatusCode, Json<TokenResponse>)> {
    let (username, email) = validate_signup(&req)?;
    if state.db.user_by_username(&username).await?.is_some() {
        return Err(BotError::Conflict("Username already taken".into()).into());
    }
    if state.db.user_by_email(&email).await?.is_some() {
        return Err(BotError::Conflict("Email already registered".into()).into());
    }
    let user = state
        .db
        .create_user(&username, &email, &hash_password(&req.password)?)
        .await?;
    info!("New user {} ({})", user.username, user.id);
    Ok((StatusCode::CREATED, token_response(&state, &user)?))
}

pub async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> ApiResult<Json<TokenResponse>> {
    let user = state.db.user_by_email(&req.email.trim().to_lowercase()).await?;
    let user = match user {
        Some(u) if verify_password(&req.password, &u.hashed_password) => u,
        _ => return Err(BotError::Auth("Incorrect email or password".into()).into()),
    };
    if !user.is_active {
        return Err(BotError::Auth("Account disabled".into()).into());
    }
    state.db.touch_login(user.id).await?;
    token_response(&state, &user)
}

pub async fn logout(State(state): State<AppState>, auth: AuthUser) -> Json<Message> {
    state.revoked.revoke(auth.token, auth.expires_at).await;
    Message::ok("Logged out")
}

pub async fn me(auth: AuthUser) -> Json<UserProfile> {
    Json(UserProfile::from(&auth.user))
}

#[derive(Debug, Deserialize)]
pub struct ApiKeysRequest {
    pub api_key: String,
    pub api_secret: String,
}

pub async fn set_api_keys(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<ApiKeysRequest>,
) -> ApiResult<Json<Message>> {
    let key = req.api_key.trim();
    let secret = req.api_secret.trim();
    if key.len() < 10 || secret.len() < 10 {
        return Err(invalid("api_key", "API key and secret must be at least 10 characters").into());
    }
    let key = state.auth.encrypt(key)?;
    let secret = state.auth.encrypt(secret)?;
    state.db.set_api_keys(auth.user.id, &key, &secret).await?;
    Ok(Message::ok("API keys saved"))
}

pub async fn api_keys_status(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<Value>> {
    let preview = match &auth.user.api_key_encrypted {
        Some(encrypted) => Some(mask_key(&state.auth.decrypt(encrypted)?)),
        None => None,
    };
    Ok(Json(json!({
        "has_api_keys": auth.user.has_api_keys(),
        "api_key_preview": preview,
    })))
}

pub async fn delete_api_keys(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<Message>> {
    state.db.clear_api_keys(auth.user.id).await?;
    Ok(Message::ok("API keys removed"))
}

// ---- configs ----

#[derive(Debug, Serialize)]
pub struct ConfigSummary {
    pub id: i64,
    pub name: String,
    pub config_version: String,
    pub strategy_name: String,
    pub bot_type: String,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<StoredConfig> for ConfigSummary {
    fn from(c: StoredConfig) -> Self {
        Self {
            id: c.id,
            name: c.name,
            config_version: c.config_version,
            strategy_name: c.strategy_name,
            bot_type: c.bot_type,
            version: c.version,
            is_active: c.is_active,
            created_at: c.created_at,
            updated_at: c.updated_at,
            last_used_at: c.last_used_at,
        }
    }
}

pub async fn list_templates() -> Json<Vec<TemplateInfo>> {
    Json(bot_config::list_templates())
}

pub async fn get_template(Path(name): Path<String>) -> ApiResult<Json<Value>> {
    let config = bot_config::template(&name).ok_or_else(|| BotError::NotFound(format!("Template '{name}'")))?;
    let config_toml = config.to_toml().map_err(|e| BotError::Config(e.to_string()))?;
    Ok(Json(json!({
        "name": name,
        "config": config,
        "config_toml": config_toml,
    })))
}

pub async fn my_configs(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<Vec<ConfigSummary>>> {
    let configs = state.db.list_configs(auth.user.id).await?;
    Ok(Json(configs.into_iter().map(ConfigSummary::from).collect()))
}

pub async fn get_config(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<StoredConfig>> {
    Ok(Json(state.db.get_config(auth.user.id, id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub config_toml: String,
}

pub async fn validate_config(Json(req): Json<ValidateRequest>) -> Json<Value> {
    match parse_and_validate(&req.config_toml) {
        Ok(config) => Json(json!({
            "valid": true,
            "message": "Config is valid",
            "config": config,
        })),
        Err(errors) => Json(json!({
            "valid": false,
            "message": "Config validation failed",
            "errors": errors,
        })),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateConfigRequest {
    pub name: String,
    pub config_toml: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateConfigRequest {
    pub name: Option<String>,
    pub config_toml: Option<String>,
}

fn check_name(name: &str) -> Result<(), BotError> {
    if (3..=100).contains(&name.trim().len()) {
        Ok(())
    } else {
        Err(invalid("name", "must be 3 to 100 characters"))
    }
}

pub async fn create_config(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateConfigRequest>,
) -> ApiResult<(StatusCode, Json<StoredConfig>)> {
    check_name(&req.name)?;
    let config = parse_and_validate(&req.config_toml).map_err(BotError::Validation)?;
    let name = req.name.trim();
    let existing = state.db.list_configs(auth.user.id).await?;
    if existing.iter().any(|c| c.name == name) {
        return Err(BotError::Conflict(format!("Config with name '{name}' already exists")).into());
    }
    let stored = state.db.create_config(auth.user.id, name, &config).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn update_config(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateConfigRequest>,
) -> ApiResult<Json<StoredConfig>> {
    let existing = state.db.get_config(auth.user.id, id).await?;
    if let Some(name) = &req.name {
        check_name(name)?;
    }
    let text = req.config_toml.as_deref().unwrap_or(&existing.config_toml);
    let config = parse_and_validate(text).map_err(BotError::Validation)?;
    let name = req.name.as_deref().map(str::trim);
    Ok(Json(state.db.update_config(auth.user.id, id, name, &config).await?))
}

pub async fn delete_config(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Message>> {
    let config = state.db.get_config(auth.user.id, id).await?;
    if config.is_active && state.manager.is_running(auth.user.id).await {
        return Err(BotError::Conflict("Stop the bot before deleting its active config".into()).into());
    }
    state.db.delete_config(auth.user.id, id).await?;
    Ok(Message::ok(format!("Config '{}' deleted", config.name)))
}

pub async fn activate_config(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Message>> {
    let config = state.db.activate_config(auth.user.id, id).await?;
    Ok(Message::ok(format!("Config '{}' activated", config.name)))
}

pub async fn active_config(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<StoredConfig>> {
    let config = state
        .db
        .active_config(auth.user.id)
        .await?
        .ok_or_else(|| BotError::NotFound("Active config".into()))?;
    Ok(Json(config))
}

// ---- bot control ----

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub config_id: Option<i64>,
    #[serde(default = "default_demo")]
    pub demo_mode: bool,
}

fn default_demo() -> bool {
    true
}

async fn resolve_config(
    state: &AppState,
    user: &User,
    config_id: Option<i64>,
) -> Result<(String, BotConfig), BotError> {
    let stored = match config_id {
        Some(id) => state.db.get_config(user.id, id).await?,
        None => state
            .db
            .active_config(user.id)
            .await?
            .ok_or_else(|| invalid("config", "No active configuration found. Please activate a config first."))?,
    };
    let config = parse_and_validate(&stored.config_toml).map_err(BotError::Validation)?;
    Ok((stored.name, config))
}

fn credentials(state: &AppState, user: &User, demo_mode: bool) -> Result<Option<Credentials>, BotError> {
    if demo_mode {
        return Ok(None);
    }
    match (&user.api_key_encrypted, &user.api_secret_encrypted) {
        (Some(key), Some(secret)) => Ok(Some(Credentials {
            api_key: state.auth.decrypt(key)?,
            secret_key: state.auth.decrypt(secret)?,
        })),
        _ => Err(invalid("api_keys", "Live trading requires saved API keys")),
    }
}

pub async fn start_bot(
    State(state): State<AppState>,
    auth: AuthUser,
    body: Option<Json<StartRequest>>,
) -> ApiResult<Json<ManagedStatus>> {
    let req = body.map(|Json(r)| r).unwrap_or(StartRequest {
        config_id: None,
        demo_mode: true,
    });
    let (name, config) = resolve_config(&state, &auth.user, req.config_id).await?;
    let creds = credentials(&state, &auth.user, req.demo_mode)?;
    Ok(Json(state.manager.start(auth.user.id, &name, config, creds).await?))
}

pub async fn stop_bot(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<Message>> {
    state.manager.stop(auth.user.id).await?;
    Ok(Message::ok("Bot stopped"))
}

pub async fn restart_bot(
    State(state): State<AppState>,
    auth: AuthUser,
    body: Option<Json<StartRequest>>,
) -> ApiResult<Json<ManagedStatus>> {
    let req = body.map(|Json(r)| r).unwrap_or(StartRequest {
        config_id: None,
        demo_mode: true,
    });
    let (name, config) = resolve_config(&state, &auth.user, req.config_id).await?;
    let creds = credentials(&state, &auth.user, req.demo_mode)?;
    Ok(Json(state.manager.restart(auth.user.id, &name, config, creds).await?))
}

pub async fn bot_status(State(state): State<AppState>, auth: AuthUser) -> ApiResult<Json<ManagedStatus>> {
    if state.manager.is_running(auth.user.id).await {
        // Ask the bot to publish a fresh snapshot
        state.manager.send(auth.user.id, BotCommand::Status).await?;
    }
    Ok(Json(state.manager.status(auth.user.id).await))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

pub async fn bot_logs(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<LogsQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(100).min(500);
    let logs = state.manager.logs(auth.user.id, limit).await;
    Json(json!({ "logs": logs, "count": logs.len() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::test_support::test_state;
    use crate::dashboard::ApiError;

    async fn signed_up(state: &AppState, name: &str) -> AuthUser {
        let (status, Json(token)) = signup(
            State(state.clone()),
            Json(SignupRequest {
                username: name.to_string(),
                email: format!("{name}@example.com"),
                password: "secret123".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        state.authenticate(&token.access_token).await.unwrap()
    }

    fn template_toml(name: &str) -> String {
        bot_config::template(name).unwrap().to_toml().unwrap()
    }

    #[tokio::test]
    async fn signup_login_and_logout() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let user = signed_up(&state, "alice").await;
        assert_eq!(me(user.clone()).await.0.username, "alice");

        let duplicate = signup(
            State(state.clone()),
            Json(SignupRequest {
                username: "Alice".into(),
                email: "other@example.com".into(),
                password: "secret123".into(),
            }),
        )
        .await;
        assert!(matches!(duplicate, Err(ApiError(BotError::Conflict(_)))));

        let bad = login(
            State(state.clone()),
            Json(LoginRequest {
                email: "alice@example.com".into(),
                password: "wrong".into(),
            }),
        )
        .await;
        assert!(matches!(bad, Err(ApiError(BotError::Auth(_)))));

        let Json(token) = login(
            State(state.clone()),
            Json(LoginRequest {
                email: " ALICE@example.com".into(),
                password: "secret123".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(token.token_type, "bearer");

        logout(State(state.clone()), user.clone()).await;
        assert!(state.authenticate(&user.token).await.is_err());
    }

    #[tokio::test]
    async fn signup_rejects_bad_fields() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let result = signup(
            State(state),
            Json(SignupRequest {
                username: "a!".into(),
                email: "nope".into(),
                password: "123".into(),
            }),
        )
        .await;
        match result {
            Err(ApiError(BotError::Validation(errors))) => assert!(errors.len() >= 3),
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn api_keys_are_stored_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let user = signed_up(&state, "bob").await;

        let short = set_api_keys(
            State(state.clone()),
            user.clone(),
            Json(ApiKeysRequest {
                api_key: "abc".into(),
                api_secret: "def".into(),
            }),
        )
        .await;
        assert!(short.is_err());

        set_api_keys(
            State(state.clone()),
            user.clone(),
            Json(ApiKeysRequest {
                api_key: "ABCDEFGHIJKLMNOP".into(),
                api_secret: "0123456789abcdef".into(),
            }),
        )
        .await
        .unwrap();

        let user = state.authenticate(&user.token).await.unwrap();
        let stored = user.user.api_key_encrypted.clone().unwrap();
        assert!(!stored.contains("ABCDEFGH"));
        let Json(status) = api_keys_status(State(state.clone()), user.clone()).await.unwrap();
        assert_eq!(status["has_api_keys"], true);
        assert_eq!(status["api_key_preview"], "ABCD****MNOP");

        delete_api_keys(State(state.clone()), user.clone()).await.unwrap();
        let user = state.authenticate(&user.token).await.unwrap();
        assert!(!user.user.has_api_keys());
    }

    #[tokio::test]
    async fn config_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let user = signed_up(&state, "carol").await;

        let Json(checked) = validate_config(Json(ValidateRequest {
            config_toml: "not = [valid".into(),
        }))
        .await;
        assert_eq!(checked["valid"], false);

        let (status, Json(created)) = create_config(
            State(state.clone()),
            user.clone(),
            Json(CreateConfigRequest {
                name: "My Safe".into(),
                config_toml: template_toml("safe"),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.version, 1);
        assert!(!created.is_active);

        let duplicate = create_config(
            State(state.clone()),
            user.clone(),
            Json(CreateConfigRequest {
                name: "My Safe".into(),
                config_toml: template_toml("safe"),
            }),
        )
        .await;
        assert!(matches!(duplicate, Err(ApiError(BotError::Conflict(_)))));

        let Json(updated) = update_config(
            State(state.clone()),
            user.clone(),
            Path(created.id),
            Json(UpdateConfigRequest {
                name: Some("Safer".into()),
                config_toml: Some(template_toml("balanced")),
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.name, "Safer");

        assert!(active_config(State(state.clone()), user.clone()).await.is_err());
        activate_config(State(state.clone()), user.clone(), Path(created.id))
            .await
            .unwrap();
        let Json(active) = active_config(State(state.clone()), user.clone()).await.unwrap();
        assert_eq!(active.id, created.id);

        let Json(list) = my_configs(State(state.clone()), user.clone()).await.unwrap();
        assert_eq!(list.len(), 1);

        // Other users cannot see it
        let dave = signed_up(&state, "dave").await;
        let hidden = get_config(State(state.clone()), dave, Path(created.id)).await;
        assert!(matches!(hidden, Err(ApiError(BotError::NotFound(_)))));

        delete_config(State(state.clone()), user.clone(), Path(created.id))
            .await
            .unwrap();
        let Json(list) = my_configs(State(state), user).await.unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn bot_start_status_stop() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let user = signed_up(&state, "erin").await;

        let no_config = start_bot(State(state.clone()), user.clone(), None).await;
        assert!(matches!(no_config, Err(ApiError(BotError::Validation(_)))));

        let (_, Json(created)) = create_config(
            State(state.clone()),
            user.clone(),
            Json(CreateConfigRequest {
                name: "Balanced".into(),
                config_toml: template_toml("balanced"),
            }),
        )
        .await
        .unwrap();
        activate_config(State(state.clone()), user.clone(), Path(created.id))
            .await
            .unwrap();

        let live_without_keys = start_bot(
            State(state.clone()),
            user.clone(),
            Some(Json(StartRequest {
                config_id: None,
                demo_mode: false,
            })),
        )
        .await;
        assert!(matches!(live_without_keys, Err(ApiError(BotError::Validation(_)))));

        let Json(started) = start_bot(State(state.clone()), user.clone(), None).await.unwrap();
        assert!(started.running);
        assert_eq!(started.config_name.as_deref(), Some("Balanced"));

        let again = start_bot(State(state.clone()), user.clone(), None).await;
        assert!(matches!(again, Err(ApiError(BotError::Conflict(_)))));

        let busy = delete_config(State(state.clone()), user.clone(), Path(created.id)).await;
        assert!(matches!(busy, Err(ApiError(BotError::Conflict(_)))));

        let Json(status) = bot_status(State(state.clone()), user.clone()).await.unwrap();
        assert!(status.running);

        stop_bot(State(state.clone()), user.clone()).await.unwrap();
        let Json(status) = bot_status(State(state.clone()), user.clone()).await.unwrap();
        assert!(!status.running);

        let not_running = stop_bot(State(state), user).await;
        assert!(matches!(not_running, Err(ApiError(BotError::NotFound(_)))));
    }
}
