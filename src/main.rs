use anyhow::{Context, Result};
use binance_confluence_bot::binance::BinanceClient;
use binance_confluence_bot::bot::{BotCommand, BotSettings, BotStatusSnapshot, MarketFeed, TradingBot};
use binance_confluence_bot::config::Config;
use binance_confluence_bot::execution::{LiveExecutor, OrderExecutor, PaperExecutor};
use binance_confluence_bot::state::BotState;
use binance_confluence_bot::strategy::StrategyProfile;
use binance_confluence_bot::telegram::TelegramNotifier;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Initializing Binance Confluence Bot");

    let config = Config::load().context("Failed to load configuration")?;
    let settings = BotSettings::from_config(&config);

    let client = BinanceClient::new(
        config.binance.api_key.clone(),
        config.binance.secret_key.clone(),
        config.binance.base_url.clone(),
    );

    // Paper balance continues from the saved state
    let (state, executor): (BotState, Arc<dyn OrderExecutor>) = if config.trading.demo_mode {
        let state = BotState::load_or_default(&settings.state_file, config.trading.starting_balance);
        info!("Paper trading with {} USDT", state.current_balance);
        let paper = PaperExecutor::new(state.current_balance);
        (state, Arc::new(paper))
    } else {
        if !client.has_credentials() {
            anyhow::bail!("Live trading needs BINANCE_API_KEY and BINANCE_SECRET_KEY");
        }
        warn!("LIVE trading against {}", config.binance.base_url);
        let live = LiveExecutor::new(client.clone());
        let balance = live.balance().await.context("Failed to read account balance")?;
        (BotState::load_or_default(&settings.state_file, balance), Arc::new(live))
    };

    let notifier = TelegramNotifier::new(&config.telegram);
    let (command_tx, command_rx) = mpsc::channel::<BotCommand>(16);
    let (status_tx, _status_rx) = watch::channel(BotStatusSnapshot::default());

    if notifier.is_enabled() {
        tokio::spawn(notifier.clone().poll_commands(command_tx.clone()));
    }

    // Handle Ctrl+C gracefully
    let ctrlc_tx = command_tx.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down gracefully...");
        if ctrlc_tx.blocking_send(BotCommand::Stop).is_err() {
            warn!("Bot already stopped");
        }
    })?;

    let feed: Arc<dyn MarketFeed> = Arc::new(client);
    let bot = TradingBot::new(
        StrategyProfile::new(config.strategy.clone()),
        settings,
        state,
        feed,
        executor,
        notifier,
        status_tx,
    );

    bot.run(command_rx).await?;
    info!("Trading bot stopped successfully.");
    // Give in-flight notifications a moment to go out
    time::sleep(Duration::from_secs(1)).await;

    Ok(())
}
