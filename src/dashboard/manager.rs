//! One trading bot task per dashboard user.

use crate::binance::BinanceClient;
use crate::bot::{BotCommand, BotSettings, BotStatusSnapshot, MarketFeed, TradingBot};
use crate::bot_config::BotConfig;
use crate::db::Database;
use crate::error::{BotError, BotResult};
use crate::execution::{LiveExecutor, OrderExecutor, PaperExecutor};
use crate::history::ClosedTrade;
use crate::state::BotState;
use crate::strategy::StrategyProfile;
use crate::telegram::TelegramNotifier;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_BUFFER: usize = 16;

/// Exchange credentials for a live bot. `None` means paper trading.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub base_url: String,
    pub starting_balance: Decimal,
    pub state_dir: PathBuf,
    /// How long a stopping bot may take to finish its cycle before it is aborted.
    pub stop_timeout: Duration,
    pub bot: BotSettings,
}

struct BotHandle {
    config_name: String,
    started_at: DateTime<Utc>,
    commands: mpsc::Sender<BotCommand>,
    status: watch::Receiver<BotStatusSnapshot>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagedStatus {
    pub running: bool,
    pub config_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<i64>,
    pub status: BotStatusSnapshot,
}

impl ManagedStatus {
    fn stopped() -> Self {
        Self {
            running: false,
            config_name: None,
            started_at: None,
            uptime_seconds: None,
            status: BotStatusSnapshot::default(),
        }
    }
}

pub struct BotManager {
    settings: ManagerSettings,
    db: Database,
    feed_override: Option<Arc<dyn MarketFeed>>,
    bots: Mutex<HashMap<i64, BotHandle>>,
}

impl BotManager {
    pub fn new(settings: ManagerSettings, db: Database) -> Self {
        Self {
            settings,
            db,
            feed_override: None,
            bots: Mutex::new(HashMap::new()),
        }
    }

    /// Use a fixed market feed instead of the exchange.
    pub fn with_feed(mut self, feed: Arc<dyn MarketFeed>) -> Self {
        self.feed_override = Some(feed);
        self
    }

    pub async fn running_count(&self) -> usize {
        let bots = self.bots.lock().await;
        bots.values().filter(|h| !h.task.is_finished()).count()
    }

    pub async fn is_running(&self, user_id: i64) -> bool {
        let bots = self.bots.lock().await;
        bots.get(&user_id).is_some_and(|h| !h.task.is_finished())
    }

    pub async fn start(
        &self,
        user_id: i64,
        config_name: &str,
        config: BotConfig,
        credentials: Option<Credentials>,
    ) -> BotResult<ManagedStatus> {
        self.ensure_not_running(user_id).await?;

        // Built without the lock held: the live balance is a network call
        let client = match &credentials {
            Some(c) => BinanceClient::new(c.api_key.clone(), c.secret_key.clone(), self.settings.base_url.clone()),
            None => BinanceClient::new(String::new(), String::new(), self.settings.base_url.clone()),
        };
        let feed: Arc<dyn MarketFeed> = match &self.feed_override {
            Some(feed) => feed.clone(),
            None => Arc::new(client.clone()),
        };
        let demo_mode = credentials.is_none();

        let mut bot_settings = self.settings.bot.clone();
        bot_settings.demo_mode = demo_mode;
        bot_settings.state_file = self.state_file(user_id);
        let (state, executor): (BotState, Arc<dyn OrderExecutor>) = if demo_mode {
            let state = BotState::load_or_default(&bot_settings.state_file, self.settings.starting_balance);
            let paper = PaperExecutor::new(state.current_balance);
            (state, Arc::new(paper))
        } else {
            let live = LiveExecutor::new(client);
            let balance = live
                .balance()
                .await
                .map_err(|e| BotError::Exchange(format!("{e:#}")))?;
            (BotState::load_or_default(&bot_settings.state_file, balance), Arc::new(live))
        };

        let mut bots = self.bots.lock().await;
        if bots.get(&user_id).is_some_and(|h| !h.task.is_finished()) {
            return Err(BotError::Conflict("Bot is already running".into()));
        }

        let bot_type = config.bot_type.as_str();
        let (status_tx, status_rx) = watch::channel(BotStatusSnapshot::default());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (trade_tx, trade_rx) = mpsc::unbounded_channel();

        let bot = TradingBot::new(
            StrategyProfile::new(config),
            bot_settings,
            state,
            feed,
            executor,
            TelegramNotifier::disabled(),
            status_tx,
        )
        .with_trade_sink(trade_tx);

        tokio::spawn(persist_trades(self.db.clone(), user_id, bot_type.to_string(), trade_rx));
        let task = tokio::spawn(async move {
            if let Err(e) = bot.run(command_rx).await {
                error!("Bot for user {} exited with error: {:#}", user_id, e);
            }
        });

        info!("Started {} bot for user {} ({})", bot_type, user_id, if demo_mode { "paper" } else { "live" });
        let handle = BotHandle {
            config_name: config_name.to_string(),
            started_at: Utc::now(),
            commands: command_tx,
            status: status_rx,
            task,
        };
        let status = status_of(&handle);
        bots.insert(user_id, handle);
        Ok(status)
    }

    async fn ensure_not_running(&self, user_id: i64) -> BotResult<()> {
        let mut bots = self.bots.lock().await;
        if bots.get(&user_id).is_some_and(|h| !h.task.is_finished()) {
            return Err(BotError::Conflict("Bot is already running".into()));
        }
        bots.remove(&user_id);
        Ok(())
    }

    pub fn state_file(&self, user_id: i64) -> PathBuf {
        self.settings.state_dir.join(format!("bot_state_user_{user_id}.json"))
    }

    pub async fn stop(&self, user_id: i64) -> BotResult<()> {
        let handle = self
            .bots
            .lock()
            .await
            .remove(&user_id)
            .ok_or_else(|| BotError::NotFound("Running bot".into()))?;

        // Closing the queue also ends the loop once it is drained
        match handle.commands.try_send(BotCommand::Stop) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => warn!("Bot for user {} already gone", user_id),
        }
        drop(handle.commands);
        let abort = handle.task.abort_handle();
        if tokio::time::timeout(self.settings.stop_timeout, handle.task).await.is_err() {
            warn!("Bot for user {} did not stop in time, aborting", user_id);
            abort.abort();
        }
        info!("Stopped bot for user {}", user_id);
        Ok(())
    }

    pub async fn restart(
        &self,
        user_id: i64,
        config_name: &str,
        config: BotConfig,
        credentials: Option<Credentials>,
    ) -> BotResult<ManagedStatus> {
        match self.stop(user_id).await {
            Ok(()) | Err(BotError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.start(user_id, config_name, config, credentials).await
    }

    pub async fn status(&self, user_id: i64) -> ManagedStatus {
        let bots = self.bots.lock().await;
        bots.get(&user_id).map(status_of).unwrap_or_else(ManagedStatus::stopped)
    }

    pub async fn subscribe(&self, user_id: i64) -> Option<watch::Receiver<BotStatusSnapshot>> {
        let bots = self.bots.lock().await;
        bots.get(&user_id).map(|h| h.status.clone())
    }

    pub async fn logs(&self, user_id: i64, limit: usize) -> Vec<String> {
        let bots = self.bots.lock().await;
        let Some(handle) = bots.get(&user_id) else { return Vec::new() };
        let snapshot = handle.status.borrow();
        let events = &snapshot.recent_events;
        events[events.len().saturating_sub(limit)..].to_vec()
    }

    /// Queue a command for the user's bot. A full queue drops `Status`
    /// requests and rejects everything else.
    pub async fn send(&self, user_id: i64, command: BotCommand) -> BotResult<()> {
        let commands = {
            let bots = self.bots.lock().await;
            bots.get(&user_id)
                .map(|h| h.commands.clone())
                .ok_or_else(|| BotError::NotFound("Running bot".into()))?
        };
        match commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(BotCommand::Status)) => {
                debug!("Command queue for user {} is full, status request dropped", user_id);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(BotError::Conflict("Bot is busy, try again".into())),
            Err(TrySendError::Closed(_)) => Err(BotError::Conflict("Bot is not accepting commands".into())),
        }
    }

    pub async fn stop_all(&self) {
        let users: Vec<i64> = self.bots.lock().await.keys().copied().collect();
        for user_id in users {
            if let Err(e) = self.stop(user_id).await {
                warn!("Failed to stop bot for user {}: {}", user_id, e);
            }
        }
    }
}

fn status_of(handle: &BotHandle) -> ManagedStatus {
    let running = !handle.task.is_finished();
    ManagedStatus {
        running,
        config_name: Some(handle.config_name.clone()),
        started_at: Some(handle.started_at),
        uptime_seconds: running.then(|| (Utc::now() - handle.started_at).num_seconds()),
        status: handle.status.borrow().clone(),
    }
}

/// Store closed trades and rebuild that day's performance row from the
/// trades table, so rows survive bot restarts.
async fn persist_trades(db: Database, user_id: i64, strategy: String, mut trades: mpsc::UnboundedReceiver<ClosedTrade>) {
    while let Some(trade) = trades.recv().await {
        if let Err(e) = db.record_trade(user_id, &trade, &strategy).await {
            error!("Failed to store trade for user {}: {}", user_id, e);
            continue;
        }
        if let Err(e) = db.refresh_daily_performance(user_id, trade.exit_time.date_naive()).await {
            error!("Failed to update daily performance for user {}: {}", user_id, e);
        }
    }
}
