//! Dashboard HTTP integration tests
//!
//! Serves the real router on a loopback port and walks a user through
//! signup, config management and a paper bot run over HTTP.

use anyhow::Result;
use async_trait::async_trait;
use binance_confluence_bot::auth::AuthService;
use binance_confluence_bot::bot::{BotSettings, MarketFeed};
use binance_confluence_bot::dashboard::{self, AppState, BotManager, ManagerSettings};
use binance_confluence_bot::db::Database;
use binance_confluence_bot::market_data::Candle;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

struct QuietFeed;

#[async_trait]
impl MarketFeed for QuietFeed {
    async fn candles(&self, _symbol: &str, _interval: &str, _limit: u16) -> Result<Vec<Candle>> {
        Ok(Vec::new())
    }
}

struct TestServer {
    base: String,
    client: Client,
    _state_dir: tempfile::TempDir,
}

impl TestServer {
    async fn start() -> Self {
        let state_dir = tempfile::tempdir().unwrap();
        let db = Database::in_memory().await.unwrap();
        let auth = AuthService::new("integration-secret", "integration-key", chrono::Duration::hours(1));
        let settings = ManagerSettings {
            base_url: "http://127.0.0.1:9".to_string(),
            starting_balance: Decimal::from(100),
            state_dir: state_dir.path().to_path_buf(),
            stop_timeout: Duration::from_secs(2),
            bot: BotSettings {
                interval: "5m".to_string(),
                candles_limit: 100,
                state_file: state_dir.path().join("unused.json"),
                retry_attempts: 1,
                retry_delay: Duration::ZERO,
                request_delay: Duration::ZERO,
                demo_mode: true,
            },
        };
        let manager = BotManager::new(settings, db.clone()).with_feed(Arc::new(QuietFeed));
        let app = dashboard::router(AppState::new(db, auth, manager));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: Client::new(),
            _state_dir: state_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn signup(&self, username: &str) -> String {
        let response = self
            .client
            .post(self.url("/api/auth/signup"))
            .json(&json!({
                "username": username,
                "email": format!("{username}@example.com"),
                "password": "secret123",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: Value = response.json().await.unwrap();
        body["access_token"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn health_and_auth_guard() {
    let server = TestServer::start().await;

    let health: Value = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let anonymous = server.client.get(server.url("/api/auth/me")).send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    let body: Value = anonymous.json().await.unwrap();
    assert!(body["detail"].is_string());

    let token = server.signup("frank").await;
    let me: Value = server
        .client
        .get(server.url("/api/auth/me"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(me["username"], "frank");
    assert_eq!(me["has_api_keys"], false);

    let logout = server
        .client
        .post(server.url("/api/auth/logout"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(logout.status(), StatusCode::OK);

    let after = server
        .client
        .get(server.url("/api/auth/me"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn config_to_running_bot() {
    let server = TestServer::start().await;
    let token = server.signup("grace").await;

    let templates: Value = server
        .client
        .get(server.url("/api/configs/templates"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(templates.as_array().unwrap().len(), 3);

    let missing = server
        .client
        .get(server.url("/api/configs/templates/yolo"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let template: Value = server
        .client
        .get(server.url("/api/configs/templates/aggressive"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let config_toml = template["config_toml"].as_str().unwrap().to_string();

    let invalid = server
        .client
        .post(server.url("/api/configs/create"))
        .bearer_auth(&token)
        .json(&json!({ "name": "Broken", "config_toml": "min_signal_strength = 99" }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    let body: Value = invalid.json().await.unwrap();
    assert!(!body["errors"].as_array().unwrap().is_empty());

    let created = server
        .client
        .post(server.url("/api/configs/create"))
        .bearer_auth(&token)
        .json(&json!({ "name": "Recovery", "config_toml": config_toml }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let created: Value = created.json().await.unwrap();
    let id = created["id"].as_i64().unwrap();

    let activated = server
        .client
        .post(server.url(&format!("/api/configs/{id}/activate")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(activated.status(), StatusCode::OK);

    let started = server
        .client
        .post(server.url("/api/bot/start"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(started.status(), StatusCode::OK);
    let started: Value = started.json().await.unwrap();
    assert_eq!(started["running"], true);
    assert_eq!(started["config_name"], "Recovery");

    let status: Value = server
        .client
        .get(server.url("/api/bot/status"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["running"], true);

    let logs: Value = server
        .client
        .get(server.url("/api/bot/logs?limit=5"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(logs["count"].as_u64().unwrap() <= 5);

    let stats: Value = server
        .client
        .get(server.url("/api/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_users"], 1);
    assert_eq!(stats["running_bots"], 1);

    let stopped = server
        .client
        .post(server.url("/api/bot/stop"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(stopped.status(), StatusCode::OK);

    let status: Value = server
        .client
        .get(server.url("/api/bot/status"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["running"], false);
}
