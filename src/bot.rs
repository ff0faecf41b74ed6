//! The live/paper trading loop.
//!
//! `TradingBot` owns every piece of mutable trading state. It is driven by a
//! timer and a command channel, and publishes a status snapshot on a watch
//! channel after every cycle and command.

use crate::alerts::{Alert, AlertCategory, AlertManager, Severity};
use crate::binance::BinanceClient;
use crate::bot_config::BotType;
use crate::config::Config;
use crate::constants::*;
use crate::execution::OrderExecutor;
use crate::history::{ClosedTrade, TradeHistory};
use crate::market_data::Candle;
use crate::positions::{evaluate_exit, EntryPlan, ExitReason, PartialFill, Position, PositionManager};
use crate::regime::{self, AdaptiveEngine, MarketRegime, RegimeParameters};
use crate::risk::RiskManager;
use crate::signals::{self, higher_timeframe_trend, to_f64, MarketSnapshot, SignalDecision, Side, Trend};
use crate::state::BotState;
use crate::strategy::{
    adaptive_limits, check_daily_status, check_entry_filters, position_quantity,
    progressive_recovery_multiplier, streak_multiplier, AdaptiveLimits, DailyEvent, DailyFlags, EntryContext,
    RecoveryTracker, StrategyProfile,
};
use crate::symbols::SymbolManager;
use crate::telegram::TelegramNotifier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info, warn};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};

const MAX_EVENTS: usize = 100;
const SNAPSHOT_EVENTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Status,
    Positions,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BotStatusSnapshot {
    pub running: bool,
    pub paused: bool,
    pub mode: String,
    pub bot_type: String,
    pub demo_mode: bool,
    pub balance: Decimal,
    pub daily_pnl_percent: f64,
    pub open_positions: usize,
    pub trades_today: usize,
    pub total_trades: usize,
    pub win_rate: f64,
    pub active_symbols: Vec<String>,
    pub regime: String,
    pub positions: Vec<Position>,
    pub recent_events: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
}

pub fn status_text(status: &BotStatusSnapshot) -> String {
    format!(
        "<b>Status</b>: {}{}\nMode: {} ({})\nBalance: {} USDT\nDaily PnL: {:+.2}%\nOpen positions: {}\nTrades today: {}\nWin rate: {:.1}%",
        if status.running { "running" } else { "stopped" },
        if status.paused { " (paused)" } else { "" },
        status.mode,
        if status.demo_mode { "paper" } else { "live" },
        status.balance.round_dp(2),
        status.daily_pnl_percent,
        status.open_positions,
        status.trades_today,
        status.win_rate
    )
}

pub fn positions_text(positions: &[Position]) -> String {
    if positions.is_empty() {
        return "No open positions".to_string();
    }
    let mut text = String::from("<b>Open positions</b>");
    for p in positions {
        text.push_str(&format!(
            "\n{} {} {} @ {} (SL {} / TP {})",
            p.side,
            p.remaining_quantity,
            p.symbol,
            p.entry_price.round_dp(6),
            p.stop_loss.round_dp(6),
            p.take_profit.round_dp(6)
        ));
    }
    text
}

/// Source of candles for the loop.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn candles(&self, symbol: &str, interval: &str, limit: u16) -> Result<Vec<Candle>>;
}

#[async_trait]
impl MarketFeed for BinanceClient {
    async fn candles(&self, symbol: &str, interval: &str, limit: u16) -> Result<Vec<Candle>> {
        self.get_klines(symbol, interval, limit).await
    }
}

#[derive(Debug, Clone)]
pub struct BotSettings {
    pub interval: String,
    pub candles_limit: u16,
    pub state_file: PathBuf,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub request_delay: Duration,
    pub demo_mode: bool,
}

impl BotSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.trading.interval.clone(),
            candles_limit: config.trading.candles_limit,
            state_file: PathBuf::from(&config.trading.state_file),
            retry_attempts: API_RETRY_ATTEMPTS,
            retry_delay: Duration::from_secs(API_RETRY_DELAY_SECS),
            request_delay: Duration::from_millis(API_REQUEST_DELAY_MS),
            demo_mode: config.trading.demo_mode,
        }
    }
}

pub struct TradingBot {
    profile: StrategyProfile,
    settings: BotSettings,
    feed: Arc<dyn MarketFeed>,
    executor: Arc<dyn OrderExecutor>,
    notifier: TelegramNotifier,
    positions: PositionManager,
    history: TradeHistory,
    risk: RiskManager,
    recovery: RecoveryTracker,
    adaptive: AdaptiveEngine,
    entry_regimes: HashMap<String, MarketRegime>,
    alerts: AlertManager,
    flags: DailyFlags,
    symbols: SymbolManager,
    market_cache: HashMap<String, Vec<Candle>>,
    current_day: NaiveDate,
    paused: bool,
    running: bool,
    events: VecDeque<String>,
    status_tx: watch::Sender<BotStatusSnapshot>,
    trade_sink: Option<mpsc::UnboundedSender<ClosedTrade>>,
}

impl TradingBot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: StrategyProfile,
        settings: BotSettings,
        state: BotState,
        feed: Arc<dyn MarketFeed>,
        executor: Arc<dyn OrderExecutor>,
        notifier: TelegramNotifier,
        status_tx: watch::Sender<BotStatusSnapshot>,
    ) -> Self {
        let now = Utc::now();
        let mut history = TradeHistory::new(state.current_balance);
        let mut flags = DailyFlags::default();
        if !state.is_stale(now) {
            history.daily_start_balance = state.daily_start_balance;
            history.daily_peak_balance = state.daily_start_balance.max(state.current_balance);
            flags.recovery_mode = state.recovery_mode;
            flags.profit_locked = state.profit_locked;
        }

        let config = &profile.config;
        let positions = PositionManager::new(
            profile.max_positions() + AGGRESSIVE_EXTRA_RECOVERY_POSITIONS,
            MAX_POSITIONS_PER_SYMBOL,
        );
        let symbols = SymbolManager::new(config.symbols.clone(), config.max_active_symbols as usize);
        let risk = RiskManager::new(state.current_balance, now);

        Self {
            profile,
            settings,
            feed,
            executor,
            notifier,
            positions,
            history,
            risk,
            recovery: RecoveryTracker::default(),
            adaptive: AdaptiveEngine::new(),
            entry_regimes: HashMap::new(),
            alerts: AlertManager::new(),
            flags,
            symbols,
            market_cache: HashMap::new(),
            current_day: now.date_naive(),
            paused: false,
            running: false,
            events: VecDeque::new(),
            status_tx,
            trade_sink: None,
        }
    }

    /// Every closed trade is also sent here (the dashboard persists them).
    pub fn with_trade_sink(mut self, sink: mpsc::UnboundedSender<ClosedTrade>) -> Self {
        self.trade_sink = Some(sink);
        self
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn history(&self) -> &TradeHistory {
        &self.history
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<BotCommand>) -> Result<()> {
        self.running = true;
        self.record(format!(
            "Bot started: {} ({}, {})",
            self.profile.config.strategy_name,
            self.profile.bot_type().as_str(),
            if self.settings.demo_mode { "paper" } else { "LIVE" }
        ));
        self.notifier
            .notify(&format!(
                "🤖 <b>{}</b> started ({})",
                self.profile.config.strategy_name,
                if self.settings.demo_mode { "paper" } else { "live" }
            ))
            .await;

        let mut ticker = time::interval(Duration::from_secs(self.profile.config.check_interval.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle(Utc::now()).await {
                        error!("Error in trading cycle: {:#}", e);
                        let alert =
                            Alert::new(Severity::High, AlertCategory::System, "Trading cycle error", format!("{e:#}"));
                        self.alert(alert, false).await;
                    }
                }
                command = commands.recv() => match command {
                    Some(BotCommand::Stop) | None => {
                        info!("Stop requested");
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.roll_day(now).await;
        self.refresh_market(now).await;
        self.apply_daily_status(now).await;
        self.manage_positions(now).await;
        self.scan(now).await;
        self.publish(now).await
    }

    pub async fn handle_command(&mut self, command: BotCommand) {
        match command {
            BotCommand::Status => {}
            BotCommand::Positions => {
                let positions: Vec<Position> = self.positions.all().into_iter().cloned().collect();
                self.notifier.notify(&positions_text(&positions)).await;
            }
            BotCommand::Pause => {
                self.paused = true;
                self.record("Trading paused".to_string());
            }
            BotCommand::Resume => {
                self.paused = false;
                self.record("Trading resumed".to_string());
            }
            BotCommand::Stop => self.running = false,
        }

        if let Err(e) = self.publish(Utc::now()).await {
            warn!("Failed to publish status: {:#}", e);
        }
        if matches!(command, BotCommand::Status | BotCommand::Pause | BotCommand::Resume) {
            let text = status_text(&self.status_tx.borrow());
            self.notifier.notify(&text).await;
        }
    }

    async fn shutdown(&mut self) {
        self.running = false;
        self.save_state();
        if let Err(e) = self.publish(Utc::now()).await {
            warn!("Failed to publish final status: {:#}", e);
        }
        let open = self.positions.count();
        self.record(format!("Bot stopped with {} open positions", open));
        self.notifier
            .notify(&format!("🛑 Bot stopped ({} open positions)", open))
            .await;
    }

    fn record(&mut self, message: String) {
        info!("{}", message);
        self.events
            .push_back(format!("{} {}", Utc::now().format("%H:%M:%S"), message));
        while self.events.len() > MAX_EVENTS {
            self.events.pop_front();
        }
    }

    fn save_state(&self) {
        let mut state = BotState::new(self.history.current_balance);
        state.daily_start_balance = self.history.daily_start_balance;
        state.recovery_mode = self.flags.recovery_mode;
        state.profit_locked = self.flags.profit_locked;
        if let Err(e) = state.save(&self.settings.state_file) {
            warn!("Failed to save state: {:#}", e);
        }
    }

    async fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today == self.current_day {
            return;
        }
        let previous = self
            .current_day
            .and_hms_opt(23, 59, 59)
            .map(|d| d.and_utc())
            .unwrap_or(now);
        let stats = self.history.daily_stats(previous);
        self.notifier.notify_daily_summary(&stats).await;
        if self.profile.config.enable_adaptive_strategy {
            info!("\n{}", self.adaptive.report(now));
        }

        self.history.reset_daily();
        self.risk.roll_periods(now);
        self.flags = DailyFlags::default();
        self.current_day = today;
        self.record(format!(
            "New trading day {}, balance {}",
            today,
            self.history.current_balance.round_dp(2)
        ));
        self.save_state();
    }

    async fn fetch_candles(&mut self, symbol: &str) -> Option<Vec<Candle>> {
        let attempts = self.settings.retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .feed
                .candles(symbol, &self.settings.interval, self.settings.candles_limit)
                .await
            {
                Ok(candles) if !candles.is_empty() => {
                    self.market_cache.insert(symbol.to_string(), candles.clone());
                    return Some(candles);
                }
                Ok(_) => warn!("{}: empty kline response (attempt {}/{})", symbol, attempt, attempts),
                Err(e) => warn!("{}: kline fetch failed (attempt {}/{}): {:#}", symbol, attempt, attempts, e),
            }
            if attempt < attempts {
                time::sleep(self.settings.retry_delay).await;
            }
        }

        match self.market_cache.get(symbol) {
            Some(cached) => {
                warn!("{}: using cached market data", symbol);
                Some(cached.clone())
            }
            None => {
                error!("{}: no market data available", symbol);
                None
            }
        }
    }

    async fn higher_trends(&self, symbol: &str) -> Vec<Trend> {
        let mut trends = Vec::new();
        for tf in CONFIRM_TIMEFRAMES {
            match self.feed.candles(symbol, tf, self.settings.candles_limit).await {
                Ok(candles) => trends.extend(higher_timeframe_trend(&candles)),
                Err(e) => debug!("{} {} trend unavailable: {:#}", symbol, tf, e),
            }
        }
        trends
    }

    /// Refresh candles for held and active symbols, rotating the active set when due.
    async fn refresh_market(&mut self, now: DateTime<Utc>) {
        let held = self.positions.symbols();
        let rotating = self.symbols.rotation_due(now);

        let mut wanted: Vec<String> = if rotating {
            self.symbols.pool().to_vec()
        } else {
            self.symbols.active().to_vec()
        };
        for symbol in &held {
            if !wanted.contains(symbol) {
                wanted.push(symbol.clone());
            }
        }

        for symbol in wanted {
            if let Some(candles) = self.fetch_candles(&symbol).await {
                self.symbols.update_score(&symbol, &candles);
                if let Some(last) = candles.last() {
                    self.risk.update_price(&symbol, last.close);
                    self.risk.update_position(&symbol, last.close);
                }
            }
            if !self.settings.request_delay.is_zero() {
                time::sleep(self.settings.request_delay).await;
            }
        }

        if rotating && self.symbols.rotate(now, &held) {
            self.record(format!("Active symbols: {}", self.symbols.active().join(", ")));
        }
    }

    fn last_price(&self, symbol: &str) -> Option<Decimal> {
        self.market_cache
            .get(symbol)
            .and_then(|c| c.last())
            .map(|c| c.close)
    }

    async fn apply_daily_status(&mut self, now: DateTime<Utc>) {
        let events = check_daily_status(&self.profile, &self.history, &mut self.flags);
        for event in events {
            let message = match &event {
                DailyEvent::ProfitLocked(pnl) => format!("Profit locked at {:+.2}%", pnl),
                DailyEvent::RecoveryEntered(pnl) => format!("Recovery mode ON at {:+.2}%", pnl),
                DailyEvent::RecoveryExited(pnl) => format!("Recovery mode OFF at {:+.2}%", pnl),
                DailyEvent::TradingStopped(reason) => format!("Trading stopped for today: {}", reason),
            };
            warn!("{}", message);
            self.record(message.clone());
            let (severity, category, title) = match &event {
                DailyEvent::TradingStopped(_) => (Severity::Critical, AlertCategory::Risk, "Trading stopped"),
                DailyEvent::RecoveryEntered(_) => (Severity::High, AlertCategory::Risk, "Recovery mode"),
                DailyEvent::RecoveryExited(_) => (Severity::Medium, AlertCategory::Risk, "Recovery mode"),
                DailyEvent::ProfitLocked(_) => (Severity::Medium, AlertCategory::Performance, "Profit locked"),
            };
            let alert = Alert::new(severity, category, title, message)
                .field("Balance", self.history.current_balance.round_dp(2))
                .field("Open positions", self.positions.count());
            self.alert(alert, true).await;

            if matches!(event, DailyEvent::TradingStopped(_)) {
                for id in self.positions.ids() {
                    let price = self
                        .positions
                        .get(&id)
                        .and_then(|p| self.last_price(&p.symbol));
                    if let Some(price) = price {
                        self.close_position(&id, price, now, ExitReason::DailyStop).await;
                    }
                }
            }
        }
        if self.flags.trading_stopped || self.flags.profit_locked {
            self.save_state();
        }
    }

    async fn manage_positions(&mut self, now: DateTime<Utc>) {
        let rules = self.profile.exit_rules();
        for id in self.positions.ids() {
            let Some(price) = self.positions.get(&id).and_then(|p| self.last_price(&p.symbol)) else {
                continue;
            };
            let Some(position) = self.positions.get_mut(&id) else {
                continue;
            };
            let check = evaluate_exit(position, price, now, &rules);
            if check.trailing_moved {
                debug!("{} trailing stop -> {}", position.symbol, position.stop_loss.round_dp(6));
            }

            if let Some(partial) = check.partial {
                self.take_partial(&id, partial, price).await;
            }
            if let Some(reason) = check.close {
                self.close_position(&id, price, now, reason).await;
            }
        }
    }

    async fn take_partial(&mut self, id: &str, partial: PartialFill, price: Decimal) {
        let Some(position) = self.positions.get(id) else { return };
        let symbol = position.symbol.clone();
        let side = position.side;
        let quantity = partial.quantity.min(position.remaining_quantity);

        let fill = match side {
            Side::Buy => self.executor.market_sell(&symbol, quantity, price).await,
            Side::Sell => self.executor.market_buy(&symbol, quantity, price).await,
        };
        match fill {
            Ok(fill) => {
                if let Some(position) = self.positions.get_mut(id) {
                    position.apply_partial(&partial, fill.price);
                    position.add_fee(fill.fee);
                }
                self.record(format!(
                    "{} partial TP{} {} @ {} ({:+.2}%)",
                    symbol,
                    partial.stage,
                    quantity,
                    fill.price.round_dp(6),
                    partial.profit_percent.round_dp(2)
                ));
            }
            Err(e) => error!("{} partial close failed: {:#}", symbol, e),
        }
    }

    async fn close_position(
        &mut self,
        id: &str,
        price: Decimal,
        now: DateTime<Utc>,
        reason: ExitReason,
    ) -> Option<ClosedTrade> {
        let position = self.positions.get(id)?;
        let symbol = position.symbol.clone();
        let quantity = position.remaining_quantity;

        let fill = match position.side {
            Side::Buy => self.executor.market_sell(&symbol, quantity, price).await,
            Side::Sell => self.executor.market_buy(&symbol, quantity, price).await,
        };
        let fill = match fill {
            Ok(fill) => fill,
            Err(e) => {
                error!("{} close ({}) failed: {:#}", symbol, reason.as_str(), e);
                let alert = Alert::new(
                    Severity::High,
                    AlertCategory::Trade,
                    format!("Close {symbol} failed"),
                    format!("{e:#}"),
                )
                .field("Reason", reason.as_str());
                self.alert(alert, false).await;
                return None;
            }
        };

        let mut position = self.positions.remove(id)?;
        position.add_fee(fill.fee);
        let trade = position.close(fill.price, now, reason);
        self.history.add_trade(trade.clone());
        let regime = self.entry_regimes.remove(id).unwrap_or(MarketRegime::Unknown);
        self.adaptive
            .record_trade(regime, to_f64(trade.pnl_amount), trade.entry_time);
        if let Some(sink) = &self.trade_sink {
            if sink.send(trade.clone()).is_err() {
                debug!("Trade sink closed");
            }
        }
        self.risk.remove_position(&symbol, trade.pnl_amount, trade.is_win());
        self.sync_risk_symbol(&symbol);
        self.recovery
            .record_result(&self.profile.config, &symbol, trade.is_win());

        self.record(format!(
            "Closed {} {} ({}) PnL {} ({:+.2}%)",
            trade.side,
            symbol,
            trade.exit_reason,
            trade.pnl_amount.round_dp(4),
            trade.pnl_percent.round_dp(2)
        ));
        self.notifier.notify_exit(&trade).await;
        self.save_state();
        Some(trade)
    }

    /// The risk manager tracks one aggregate position per symbol.
    fn sync_risk_symbol(&mut self, symbol: &str) {
        let open = self.positions.for_symbol(symbol);
        let quantity: Decimal = open.iter().map(|p| p.remaining_quantity).sum();
        if quantity <= Decimal::ZERO {
            return;
        }
        let cost: Decimal = open.iter().map(|p| p.entry_price * p.remaining_quantity).sum();
        self.risk.add_position(symbol, quantity, cost / quantity);
    }

    async fn alert(&mut self, alert: Alert, force: bool) {
        self.alerts.send(&self.notifier, alert, force).await;
    }

    fn observe_regime(&mut self, symbol: &str, candles: &[Candle], atr: Decimal) -> MarketRegime {
        if !self.profile.config.enable_adaptive_strategy {
            return MarketRegime::Unknown;
        }
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<Decimal> = candles.iter().map(|c| c.volume).collect();
        let reading = regime::detect_regime(&closes, &volumes, atr);
        self.adaptive.observe(symbol, reading);
        reading.regime
    }

    /// Regime-specific overrides, only once a regime has been recognised.
    fn regime_parameters(&self, regime: MarketRegime, now: DateTime<Utc>) -> Option<RegimeParameters> {
        (self.profile.config.enable_adaptive_strategy && regime != MarketRegime::Unknown)
            .then(|| self.adaptive.parameters(regime, now))
    }

    pub fn adaptive(&self) -> &AdaptiveEngine {
        &self.adaptive
    }

    fn current_limits(&self, now: DateTime<Utc>) -> AdaptiveLimits {
        let defaults = AdaptiveLimits {
            max_positions: self.profile.max_positions(),
            min_strength: self.profile.min_signal_strength(),
        };
        if !self.profile.config.enable_adaptive_strategy {
            return defaults;
        }
        adaptive_limits(
            &self.history.daily_stats(now),
            defaults.max_positions,
            defaults.min_strength,
        )
    }

    async fn scan(&mut self, now: DateTime<Utc>) {
        if self.paused || self.flags.trading_stopped {
            return;
        }
        if self.profile.config.enable_advanced_risk {
            if let Some(reason) = self.risk.should_pause_trading() {
                debug!("Risk pause: {}", reason);
                return;
            }
        }

        let limits = self.current_limits(now);
        let symbols = self.symbols.active().to_vec();
        for symbol in symbols {
            let Some(candles) = self.market_cache.get(&symbol).cloned() else {
                continue;
            };
            let trends = self.higher_trends(&symbol).await;
            let Some(snapshot) = MarketSnapshot::from_candles(&symbol, &candles, trends) else {
                continue;
            };
            self.risk.update_atr(&symbol, snapshot.atr);
            let regime = self.observe_regime(&symbol, &candles, snapshot.atr);

            let score = signals::score(&snapshot, self.profile.bot_type());
            let Some(decision) = score.decide(limits.min_strength) else {
                continue;
            };
            debug!(
                "{} {} signal {:.2} ({} conditions): {}",
                symbol,
                decision.side,
                decision.strength,
                decision.confluence,
                decision.details.join(", ")
            );

            match decision.side {
                // Spot account: sell signals only close longs
                Side::Sell => self.close_on_sell_signal(&symbol, snapshot.price, now).await,
                Side::Buy => {
                    self.try_enter(now, &snapshot, &decision, limits.max_positions, regime)
                        .await
                }
            }
        }
    }

    async fn close_on_sell_signal(&mut self, symbol: &str, price: Decimal, now: DateTime<Utc>) {
        let ids: Vec<String> = self
            .positions
            .for_symbol(symbol)
            .into_iter()
            .filter(|p| p.side == Side::Buy)
            .map(|p| p.id.clone())
            .collect();
        for id in ids {
            self.close_position(&id, price, now, ExitReason::Signal).await;
        }
    }

    async fn try_enter(
        &mut self,
        now: DateTime<Utc>,
        snapshot: &MarketSnapshot,
        decision: &SignalDecision,
        max_positions: usize,
        regime: MarketRegime,
    ) {
        let symbol = snapshot.symbol.as_str();
        let config = self.profile.config.clone();
        let scalping = self.profile.bot_type() == BotType::Scalping;
        let consecutive_losses = self.history.consecutive_losses();
        let is_recovery_entry = self
            .recovery
            .is_recovery_entry(&config, symbol, consecutive_losses);

        let stops = self.profile.stops(
            Side::Buy,
            snapshot.price,
            snapshot.atr,
            decision.strength,
            self.flags.recovery_mode,
        );
        let ctx = EntryContext {
            now,
            snapshot,
            decision,
            stops: &stops,
            recovery_mode: self.flags.recovery_mode,
            profit_locked: self.flags.profit_locked,
            is_recovery_entry,
            symbol_positions: self.positions.symbol_count(symbol),
            total_positions: self.positions.count(),
            max_positions,
        };
        let risk = config.enable_advanced_risk.then_some(&self.risk);
        if let Err(reason) = check_entry_filters(&self.profile, &ctx, risk) {
            debug!("{} entry skipped: {}", symbol, reason);
            return;
        }
        let regime_params = self.regime_parameters(regime, now);
        if let Some(params) = &regime_params {
            if decision.strength < params.min_signal_strength {
                debug!(
                    "{} entry skipped: strength {:.2} below {:.2} for {} market",
                    symbol, decision.strength, params.min_signal_strength, regime
                );
                return;
            }
        }

        let mut multiplier = streak_multiplier(
            &config,
            self.history.consecutive_wins(),
            consecutive_losses,
            is_recovery_entry,
        );
        if is_recovery_entry {
            multiplier *= self.recovery.size_multiplier(&config, symbol);
        }
        if scalping && config.progressive_recovery {
            multiplier *= progressive_recovery_multiplier(consecutive_losses);
        }
        if let Some(params) = &regime_params {
            multiplier *= Decimal::from_f64(params.size_multiplier).unwrap_or(Decimal::ONE);
        }
        if config.enable_advanced_risk {
            let win_rate = if self.history.trades.is_empty() {
                0.5
            } else {
                self.history.win_rate() / 100.0
            };
            let confidence = (decision.strength / 5.0).clamp(0.5, 1.0);
            let sizing = self.risk.calculate_position_size(
                symbol,
                snapshot.price,
                stops.sl_percent,
                win_rate,
                confidence,
            );
            let risk_multiplier = sizing.exposure_multiplier
                * sizing.correlation_multiplier
                * sizing.volatility_multiplier
                * sizing.drawdown_multiplier
                * sizing.loss_multiplier;
            multiplier *= Decimal::from_f64(risk_multiplier).unwrap_or(Decimal::ONE);
        }

        let balance = match self.executor.balance().await {
            Ok(b) => b,
            Err(e) => {
                error!("Balance check failed: {:#}", e);
                return;
            }
        };
        let quantity = position_quantity(
            balance,
            config.risk_management.max_loss_per_trade,
            multiplier,
            snapshot.price,
            stops.sl_percent,
        );
        if quantity <= Decimal::ZERO || quantity * snapshot.price > balance {
            warn!(
                "{}: balance {} too small for {} @ {}",
                symbol,
                balance.round_dp(2),
                quantity,
                snapshot.price
            );
            return;
        }

        let fill = match self.executor.market_buy(symbol, quantity, snapshot.price).await {
            Ok(fill) => fill,
            Err(e) => {
                error!("{} entry failed: {:#}", symbol, e);
                let alert = Alert::new(
                    Severity::High,
                    AlertCategory::Trade,
                    format!("Entry {symbol} failed"),
                    format!("{e:#}"),
                );
                self.alert(alert, false).await;
                return;
            }
        };

        // Anchor the stops at the actual fill
        let stops = self.profile.stops(
            Side::Buy,
            fill.price,
            snapshot.atr,
            decision.strength,
            self.flags.recovery_mode,
        );
        let mut position = Position::open(
            EntryPlan {
                symbol: symbol.to_string(),
                side: Side::Buy,
                entry_price: fill.price,
                quantity: fill.quantity,
                stop_loss: stops.stop_loss,
                take_profit: stops.take_profit,
                signal_strength: decision.strength,
                confluence: decision.confluence,
                is_recovery: is_recovery_entry,
                time_stop_secs: self.profile.time_stop(decision.confluence, is_recovery_entry),
            },
            now,
        );
        position.add_fee(fill.fee);

        self.record(format!(
            "Opened BUY {} {} @ {} SL {} TP {} (strength {:.2}, {} conditions{})",
            position.quantity,
            symbol,
            position.entry_price.round_dp(6),
            position.stop_loss.round_dp(6),
            position.take_profit.round_dp(6),
            decision.strength,
            decision.confluence,
            if is_recovery_entry { ", recovery" } else { "" }
        ));
        self.notifier.notify_entry(&position).await;
        let id = position.id.clone();
        if self.positions.add(position) {
            self.entry_regimes.insert(id, regime);
        } else {
            error!("{}: position manager rejected a filled entry", symbol);
        }
        self.sync_risk_symbol(symbol);
    }

    fn mode(&self) -> &'static str {
        if self.flags.trading_stopped {
            "STOPPED_TODAY"
        } else if self.flags.recovery_mode {
            "RECOVERY"
        } else if self.flags.profit_locked {
            "PROFIT_LOCKED"
        } else {
            "NORMAL"
        }
    }

    async fn publish(&mut self, now: DateTime<Utc>) -> Result<()> {
        let balance = self
            .executor
            .balance()
            .await
            .context("Failed to read balance")?;
        let stats = self.history.daily_stats(now);
        let recent_events = self
            .events
            .iter()
            .rev()
            .take(SNAPSHOT_EVENTS)
            .rev()
            .cloned()
            .collect();

        let snapshot = BotStatusSnapshot {
            running: self.running,
            paused: self.paused,
            mode: self.mode().to_string(),
            bot_type: self.profile.bot_type().as_str().to_string(),
            demo_mode: self.executor.is_paper(),
            balance,
            daily_pnl_percent: stats.daily_pnl_percent,
            open_positions: self.positions.count(),
            trades_today: stats.total_trades,
            total_trades: self.history.trades.len(),
            win_rate: stats.win_rate,
            active_symbols: self.symbols.active().to_vec(),
            regime: self.adaptive.current().to_string(),
            positions: self.positions.all().into_iter().cloned().collect(),
            recent_events,
            last_update: Some(now),
        };
        self.status_tx.send_replace(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot_config::template;
    use crate::execution::PaperExecutor;
    use crate::market_data::test_support::{candles_from_closes, linear_closes};
    use crate::positions::test_position;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct ScriptedFeed {
        candles: Mutex<HashMap<String, Vec<Candle>>>,
        failing: AtomicBool,
    }

    impl ScriptedFeed {
        fn new() -> Self {
            Self {
                candles: Mutex::new(HashMap::new()),
                failing: AtomicBool::new(false),
            }
        }

        fn set(&self, symbol: &str, closes: Vec<Decimal>) {
            self.candles
                .lock()
                .unwrap()
                .insert(symbol.to_string(), candles_from_closes(&closes));
        }
    }

    #[async_trait]
    impl MarketFeed for ScriptedFeed {
        async fn candles(&self, symbol: &str, _interval: &str, _limit: u16) -> Result<Vec<Candle>> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("feed down");
            }
            Ok(self.candles.lock().unwrap().get(symbol).cloned().unwrap_or_default())
        }
    }

    fn test_bot(
        feed: Arc<ScriptedFeed>,
        dir: &tempfile::TempDir,
    ) -> (TradingBot, watch::Receiver<BotStatusSnapshot>) {
        let mut config = template("balanced").unwrap();
        config.symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let settings = BotSettings {
            interval: "1m".into(),
            candles_limit: 100,
            state_file: dir.path().join("bot_state.json"),
            retry_attempts: 2,
            retry_delay: Duration::ZERO,
            request_delay: Duration::ZERO,
            demo_mode: true,
        };
        let (tx, rx) = watch::channel(BotStatusSnapshot::default());
        let bot = TradingBot::new(
            StrategyProfile::new(config),
            settings,
            BotState::new(dec!(1000)),
            feed,
            Arc::new(PaperExecutor::new(dec!(1000))),
            TelegramNotifier::disabled(),
            tx,
        );
        (bot, rx)
    }

    #[tokio::test]
    async fn take_profit_closes_position() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(ScriptedFeed::new());
        feed.set("BTCUSDT", linear_closes(103, 0, 60));
        let (mut bot, status) = test_bot(feed, &dir);
        bot.paused = true;
        bot.positions
            .add(test_position(Side::Buy, dec!(100), dec!(99), dec!(102)));

        bot.run_cycle(Utc::now()).await.unwrap();

        assert!(bot.positions().is_empty());
        let trade = &bot.history().trades[0];
        assert_eq!(trade.exit_reason, "TP");
        assert!(trade.pnl_amount > dec!(2.8));
        assert!(trade.fees > Decimal::ZERO);
        assert!(bot.history().current_balance > dec!(1002));
        assert_eq!(status.borrow().total_trades, 1);
        assert!(dir.path().join("bot_state.json").exists());
    }

    #[tokio::test]
    async fn history_tracks_paper_balance_after_fees() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(ScriptedFeed::new());
        feed.set("BTCUSDT", linear_closes(103, 0, 60));
        let (mut bot, _status) = test_bot(feed, &dir);
        bot.paused = true;

        let fill = bot.executor.market_buy("BTCUSDT", Decimal::ONE, dec!(100)).await.unwrap();
        let mut position = test_position(Side::Buy, fill.price, dec!(99), dec!(102));
        position.add_fee(fill.fee);
        bot.positions.add(position);

        bot.run_cycle(Utc::now()).await.unwrap();

        let paper = bot.executor.balance().await.unwrap();
        let drift = (bot.history().current_balance - paper).abs();
        assert!(drift < dec!(0.000001), "history {} vs paper {}", bot.history().current_balance, paper);
    }

    #[tokio::test]
    async fn closed_trade_is_attributed_to_entry_regime() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(ScriptedFeed::new());
        feed.set("BTCUSDT", vec![dec!(103); 60]);
        let (mut bot, status) = test_bot(feed, &dir);

        bot.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(bot.adaptive().regime_of("BTCUSDT"), MarketRegime::Ranging);
        assert_eq!(status.borrow().regime, "RANGING");

        bot.paused = true;
        let position = test_position(Side::Buy, dec!(100), dec!(99), dec!(102));
        bot.entry_regimes.insert(position.id.clone(), MarketRegime::Ranging);
        bot.positions.add(position);
        bot.run_cycle(Utc::now()).await.unwrap();

        let ranging = &bot.adaptive().regime_performance()[&MarketRegime::Ranging];
        assert_eq!(ranging.trades(), 1);
        assert!(ranging.total_pnl > 0.0);
        assert!(bot.entry_regimes.is_empty());
    }

    #[tokio::test]
    async fn repeated_cycle_errors_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let (mut bot, _status) = test_bot(Arc::new(ScriptedFeed::new()), &dir);
        for _ in 0..3 {
            let alert = Alert::new(Severity::High, AlertCategory::System, "Trading cycle error", "feed down");
            bot.alert(alert, false).await;
        }
        let stats = bot.alerts.stats(Utc::now());
        assert_eq!(stats.total, 1);
        assert_eq!(stats.throttled, 2);
    }

    #[tokio::test]
    async fn first_partial_moves_stop_up() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(ScriptedFeed::new());
        feed.set("BTCUSDT", vec![dec!(100.5); 60]);
        let (mut bot, _status) = test_bot(feed, &dir);
        bot.paused = true;
        let position = test_position(Side::Buy, dec!(100), dec!(99), dec!(102));
        let id = position.id.clone();
        bot.positions.add(position);

        bot.run_cycle(Utc::now()).await.unwrap();

        let position = bot.positions().get(&id).unwrap();
        assert_eq!(position.partial_stages_hit, 1);
        assert_eq!(position.remaining_quantity, dec!(0.6));
        assert!(position.stop_loss >= dec!(100));
        assert!(position.realized_pnl > Decimal::ZERO);
        assert!(bot.history().trades.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_cached_candles() {
        let dir = tempfile::tempdir().unwrap();
        let feed = Arc::new(ScriptedFeed::new());
        feed.set("BTCUSDT", linear_closes(100, 1, 30));
        let (mut bot, _status) = test_bot(feed.clone(), &dir);

        assert_eq!(bot.fetch_candles("BTCUSDT").await.unwrap().len(), 30);
        feed.failing.store(true, Ordering::SeqCst);
        let cached = bot.fetch_candles("BTCUSDT").await.unwrap();
        assert_eq!(cached.last().unwrap().close, dec!(129));
        assert!(bot.fetch_candles("ETHUSDT").await.is_none());
    }

    #[tokio::test]
    async fn rollover_resets_daily_flags() {
        let dir = tempfile::tempdir().unwrap();
        let (mut bot, _status) = test_bot(Arc::new(ScriptedFeed::new()), &dir);
        bot.flags.recovery_mode = true;
        bot.flags.trading_stopped = true;
        bot.current_day = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap().date_naive();

        bot.roll_day(Utc.with_ymd_and_hms(2024, 3, 5, 0, 1, 0).unwrap()).await;

        assert_eq!(bot.flags, DailyFlags::default());
        assert_eq!(bot.mode(), "NORMAL");
        assert_eq!(bot.current_day.to_string(), "2024-03-05");
    }

    #[tokio::test]
    async fn pause_and_resume_publish_status() {
        let dir = tempfile::tempdir().unwrap();
        let (mut bot, status) = test_bot(Arc::new(ScriptedFeed::new()), &dir);

        bot.handle_command(BotCommand::Pause).await;
        assert!(status.borrow().paused);
        assert_eq!(status.borrow().balance, dec!(1000));

        bot.handle_command(BotCommand::Resume).await;
        assert!(!status.borrow().paused);
        assert!(status
            .borrow()
            .recent_events
            .iter()
            .any(|e| e.ends_with("Trading resumed")));
    }

    #[test]
    fn status_text_mentions_mode() {
        let status = BotStatusSnapshot {
            running: true,
            mode: "RECOVERY".into(),
            demo_mode: true,
            balance: dec!(99.5),
            ..Default::default()
        };
        let text = status_text(&status);
        assert!(text.contains("RECOVERY (paper)"));
        assert!(text.contains("Balance: 99.5 USDT"));
        assert_eq!(positions_text(&[]), "No open positions");
    }
}
