use anyhow::{Context, Result};
use binance_confluence_bot::auth::AuthService;
use binance_confluence_bot::bot::BotSettings;
use binance_confluence_bot::config::Config;
use binance_confluence_bot::dashboard::{self, AppState, BotManager, ManagerSettings, DEFAULT_STOP_TIMEOUT};
use binance_confluence_bot::db::Database;
use clap::{Arg, Command};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let matches = Command::new("Binance Confluence Bot Dashboard")
        .version("1.0")
        .about("Multi-user web dashboard for running trading bots")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to config.toml")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .help("Address to listen on (overrides config)"),
        )
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .help("Directory for per-user bot state files")
                .default_value("."),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.toml");
    let config = Config::load_from(config_path)?;
    if config.dashboard.token_secret == "change-me" {
        warn!("Using the default token secret, set SECRET_KEY in production");
    }

    let db = Database::connect(&config.dashboard.database_url)
        .await
        .with_context(|| format!("Failed to open {}", config.dashboard.database_url))?;
    let auth = AuthService::from_config(&config.dashboard);
    let state_dir = matches
        .get_one::<String>("state-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let manager = BotManager::new(
        ManagerSettings {
            base_url: config.binance.base_url.clone(),
            starting_balance: config.trading.starting_balance,
            state_dir,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            bot: BotSettings::from_config(&config),
        },
        db.clone(),
    );
    let state = AppState::new(db, auth, manager);
    let manager: Arc<BotManager> = state.manager.clone();

    let bind = matches
        .get_one::<String>("bind")
        .cloned()
        .unwrap_or_else(|| config.dashboard.bind_address.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Dashboard listening on {}", bind);

    axum::serve(listener, dashboard::router(state))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Failed to listen for Ctrl+C");
            }
            info!("Shutting down dashboard...");
        })
        .await?;

    manager.stop_all().await;
    info!("All bots stopped");
    Ok(())
}
