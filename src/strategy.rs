use crate::bot_config::{BotConfig, BotType};
use crate::constants::*;
use crate::history::{DailyStats, TradeHistory};
use crate::positions::ExitRules;
use crate::risk::RiskManager;
use crate::signals::{to_f64, MarketSnapshot, SignalDecision, Side};
use crate::trailing_stop::TrailingStop;
use chrono::{DateTime, Timelike, Utc};
use log::{info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct StopLevels {
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub sl_percent: Decimal,
    pub tp_percent: Decimal,
}

impl StopLevels {
    pub fn from_percents(side: Side, price: Decimal, sl_percent: Decimal, tp_percent: Decimal) -> Self {
        let hundred = Decimal::from(100);
        let (stop_loss, take_profit) = match side {
            Side::Buy => (
                price * (Decimal::ONE - sl_percent / hundred),
                price * (Decimal::ONE + tp_percent / hundred),
            ),
            Side::Sell => (
                price * (Decimal::ONE + sl_percent / hundred),
                price * (Decimal::ONE - tp_percent / hundred),
            ),
        };
        Self {
            stop_loss,
            take_profit,
            sl_percent,
            tp_percent,
        }
    }

    pub fn risk_reward(&self) -> Decimal {
        if self.sl_percent > Decimal::ZERO {
            self.tp_percent / self.sl_percent
        } else {
            Decimal::ZERO
        }
    }
}

/// Stop-loss and take-profit distances at ATR multiples, in percent of
/// price and clamped to the allowed range. `None` without a usable ATR.
pub fn atr_stop_percents(
    price: Decimal,
    atr: Decimal,
    sl_multiplier: Decimal,
    tp_multiplier: Decimal,
) -> Option<(Decimal, Decimal)> {
    if atr <= Decimal::ZERO || price <= Decimal::ZERO {
        return None;
    }
    let hundred = Decimal::from(100);
    let sl = (atr * sl_multiplier / price * hundred).clamp(ATR_SL_MIN_PERCENT, ATR_SL_MAX_PERCENT);
    let tp = (atr * tp_multiplier / price * hundred).clamp(ATR_TP_MIN_PERCENT, ATR_TP_MAX_PERCENT);
    Some((sl, tp))
}

/// Entry price after expected slippage against the order side.
pub fn slipped_entry_price(side: Side, price: Decimal) -> Decimal {
    let slip = EXPECTED_SLIPPAGE_PERCENT / Decimal::from(100);
    match side {
        Side::Buy => price * (Decimal::ONE + slip),
        Side::Sell => price * (Decimal::ONE - slip),
    }
}

/// Take-profit left after a round trip of taker fees and slippage, in percent.
pub fn expected_net_profit_percent(tp_percent: Decimal) -> Decimal {
    let fee_percent = TAKER_FEE * Decimal::from(100);
    tp_percent - Decimal::from(2) * (fee_percent + EXPECTED_SLIPPAGE_PERCENT)
}

/// Trading rules derived from a bot configuration.
#[derive(Debug, Clone)]
pub struct StrategyProfile {
    pub config: BotConfig,
}

impl StrategyProfile {
    pub fn new(config: BotConfig) -> Self {
        Self { config }
    }

    pub fn bot_type(&self) -> BotType {
        self.config.bot_type
    }

    pub fn min_signal_strength(&self) -> f64 {
        match self.bot_type() {
            BotType::Scalping => self.config.min_signal_strength,
            BotType::AggressiveRecovery => AGGRESSIVE_MIN_SIGNAL_STRENGTH,
        }
    }

    pub fn max_positions(&self) -> usize {
        self.config.max_positions as usize
    }

    pub fn stops(&self, side: Side, price: Decimal, atr: Decimal, strength: f64, recovery_mode: bool) -> StopLevels {
        match self.bot_type() {
            BotType::Scalping => {
                let rm = &self.config.risk_management;
                let (sl_percent, mut tp_percent) = atr_stop_percents(price, atr, rm.atr_sl_multiplier, rm.atr_tp_multiplier)
                    .unwrap_or_else(|| {
                        warn!("ATR unavailable, using fixed stops");
                        (FALLBACK_SL_PERCENT, FALLBACK_TP_PERCENT)
                    });
                if recovery_mode {
                    tp_percent *= RECOVERY_TP_MULTIPLIER;
                }
                StopLevels::from_percents(side, price, sl_percent.round_dp(4), tp_percent.round_dp(4))
            }
            BotType::AggressiveRecovery => {
                let tp_percent = if strength >= 5.0 {
                    AGGRESSIVE_STRONG_TP
                } else if strength >= 3.5 {
                    AGGRESSIVE_MEDIUM_TP
                } else {
                    AGGRESSIVE_QUICK_TP
                };
                StopLevels::from_percents(side, price, AGGRESSIVE_TIGHT_SL, tp_percent)
            }
        }
    }

    pub fn time_stop(&self, confluence: u32, is_recovery: bool) -> i64 {
        match self.bot_type() {
            BotType::Scalping => {
                if confluence >= RECOVERY_CONFLUENCE_REQUIRED {
                    TIME_STOP_STRONG_SIGNAL
                } else {
                    self.config.time_stop_base
                }
            }
            BotType::AggressiveRecovery => {
                if is_recovery {
                    AGGRESSIVE_TIME_STOP_RECOVERY
                } else {
                    AGGRESSIVE_TIME_STOP_FAST
                }
            }
        }
    }

    pub fn trailing(&self) -> Option<TrailingStop> {
        if !self.config.trailing_stop_enabled {
            return None;
        }
        Some(match self.bot_type() {
            BotType::Scalping => TrailingStop::new(DAILY_TRAILING_PERCENT, DAILY_TRAILING_ACTIVATION),
            BotType::AggressiveRecovery => {
                TrailingStop::new(AGGRESSIVE_TRAILING_PERCENT, AGGRESSIVE_TRAILING_ACTIVATION)
            }
        })
    }

    pub fn exit_rules(&self) -> ExitRules {
        ExitRules {
            partial_take_profit: self.config.partial_take_profit && self.bot_type() == BotType::Scalping,
            trailing: self.trailing(),
            max_loss_percent: MAX_LOSS_PER_POSITION,
        }
    }

    pub fn respects_trading_hours(&self, is_recovery_entry: bool) -> bool {
        match self.bot_type() {
            BotType::Scalping => true,
            BotType::AggressiveRecovery => !is_recovery_entry,
        }
    }
}

/// Bounded martingale: per-symbol loss levels and the symbol of the last loss.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryTracker {
    pub levels: HashMap<String, u32>,
    pub last_loss_symbol: Option<String>,
}

impl RecoveryTracker {
    pub fn level(&self, symbol: &str) -> u32 {
        self.levels.get(symbol).copied().unwrap_or(0)
    }

    /// Recovery entries are only taken on the symbol that last lost.
    pub fn is_recovery_entry(&self, config: &BotConfig, symbol: &str, consecutive_losses: u32) -> bool {
        config.enable_martingale
            && self.last_loss_symbol.as_deref() == Some(symbol)
            && consecutive_losses > 0
            && self.level(symbol) < config.martingale_max_levels
    }

    pub fn size_multiplier(&self, config: &BotConfig, symbol: &str) -> Decimal {
        let mut multiplier = Decimal::ONE;
        for _ in 0..self.level(symbol) {
            multiplier *= config.martingale_multiplier;
        }
        multiplier
    }

    pub fn record_result(&mut self, config: &BotConfig, symbol: &str, is_win: bool) {
        if is_win {
            if self.levels.remove(symbol).is_some() {
                info!("{} won, martingale level reset", symbol);
            }
            return;
        }
        self.last_loss_symbol = Some(symbol.to_string());
        let level = self.levels.entry(symbol.to_string()).or_insert(0);
        if *level < config.martingale_max_levels {
            *level += 1;
            warn!("{} lost, martingale level {}", symbol, level);
        }
    }
}

/// Win streak bonus and loss streak reduction.
pub fn streak_multiplier(config: &BotConfig, wins: u32, losses: u32, is_recovery: bool) -> Decimal {
    if wins >= 3 {
        config.win_streak_multiplier
    } else if losses >= 2 && !is_recovery {
        config.loss_streak_multiplier
    } else {
        Decimal::ONE
    }
}

pub fn progressive_recovery_multiplier(consecutive_losses: u32) -> Decimal {
    match consecutive_losses {
        0 => Decimal::ONE,
        1 => RECOVERY_SIZE_LOSS_1,
        2 => RECOVERY_SIZE_LOSS_2,
        _ => RECOVERY_SIZE_LOSS_3,
    }
}

/// Risk-based quantity: the stop distance loses `max_loss_percent` of the
/// balance (times `multiplier`). Floored at the minimum order size and capped
/// by what the balance can pay for.
pub fn position_quantity(
    balance: Decimal,
    max_loss_percent: Decimal,
    multiplier: Decimal,
    price: Decimal,
    sl_percent: Decimal,
) -> Decimal {
    if price <= Decimal::ZERO || sl_percent <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let hundred = Decimal::from(100);
    let risk_amount = balance * max_loss_percent / hundred * multiplier;
    let stop_distance = price * sl_percent / hundred;
    let quantity = (risk_amount / stop_distance).max(MIN_ORDER_QUANTITY);

    let affordable = balance / price;
    if quantity > affordable && affordable >= MIN_ORDER_QUANTITY {
        affordable.round_dp_with_strategy(6, rust_decimal::RoundingStrategy::ToZero)
    } else {
        quantity.round_dp(6)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveLimits {
    pub max_positions: usize,
    pub min_strength: f64,
}

/// Trade more when the day is going well, less when it is not.
pub fn adaptive_limits(stats: &DailyStats, default_positions: usize, default_strength: f64) -> AdaptiveLimits {
    let defaults = AdaptiveLimits {
        max_positions: default_positions,
        min_strength: default_strength,
    };
    if stats.total_trades < 5 {
        return defaults;
    }

    if stats.win_rate >= ADAPTIVE_GOOD_PERFORMANCE_WR && stats.daily_pnl_percent >= ADAPTIVE_GOOD_PERFORMANCE_PNL {
        AdaptiveLimits {
            max_positions: default_positions.max(ADAPTIVE_MAX_POSITIONS_GOOD).min(default_positions + 3),
            min_strength: default_strength.min(ADAPTIVE_MIN_STRENGTH_GOOD),
        }
    } else if stats.win_rate <= ADAPTIVE_BAD_PERFORMANCE_WR || stats.daily_pnl_percent <= ADAPTIVE_BAD_PERFORMANCE_PNL {
        AdaptiveLimits {
            max_positions: ADAPTIVE_MAX_POSITIONS_BAD
                .max(default_positions.saturating_sub(3))
                .min(default_positions),
            min_strength: ADAPTIVE_MIN_STRENGTH_BAD.max(default_strength),
        }
    } else {
        defaults
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EntryRejection {
    #[error("Out of trading hours ({TRADING_START_HOUR}-{TRADING_END_HOUR} UTC)")]
    OutsideTradingHours,
    #[error("Sideways market")]
    Sideways,
    #[error("Low volume quality")]
    LowVolume,
    #[error("Sector limit: {0}")]
    Sector(String),
    #[error("Correlation: {0}")]
    Correlation(String),
    #[error("Symbol position limit reached")]
    SymbolLimit,
    #[error("Position limit reached")]
    PositionLimit,
    #[error("Recovery mode: insufficient signals")]
    RecoveryConfluence,
    #[error("Profit locked - trading paused")]
    ProfitLocked,
    #[error("Expected net profit {0}% below minimum")]
    CostsTooHigh(Decimal),
}

/// Everything the entry filters look at for one candidate trade.
#[derive(Debug)]
pub struct EntryContext<'a> {
    pub now: DateTime<Utc>,
    pub snapshot: &'a MarketSnapshot,
    pub decision: &'a SignalDecision,
    pub stops: &'a StopLevels,
    pub recovery_mode: bool,
    pub profit_locked: bool,
    pub is_recovery_entry: bool,
    pub symbol_positions: usize,
    pub total_positions: usize,
    pub max_positions: usize,
}

pub fn check_entry_filters(
    profile: &StrategyProfile,
    ctx: &EntryContext<'_>,
    risk: Option<&RiskManager>,
) -> Result<(), EntryRejection> {
    let scalping = profile.bot_type() == BotType::Scalping;

    if profile.respects_trading_hours(ctx.is_recovery_entry) {
        let hour = ctx.now.hour();
        if !(TRADING_START_HOUR..TRADING_END_HOUR).contains(&hour) {
            return Err(EntryRejection::OutsideTradingHours);
        }
    }

    if scalping {
        if ctx.snapshot.bb_width_percent() < SIDEWAYS_THRESHOLD {
            return Err(EntryRejection::Sideways);
        }
        if ctx.snapshot.volume_ratio < MIN_VOLUME_RATIO {
            return Err(EntryRejection::LowVolume);
        }
    }

    if profile.config.enable_advanced_risk {
        if let Some(risk) = risk {
            risk.check_sector_limits(&ctx.snapshot.symbol)
                .map_err(EntryRejection::Sector)?;
            risk.check_correlation_risk(&ctx.snapshot.symbol)
                .map_err(EntryRejection::Correlation)?;
        }
    }

    if ctx.symbol_positions >= MAX_POSITIONS_PER_SYMBOL {
        return Err(EntryRejection::SymbolLimit);
    }

    let mut max_positions = ctx.max_positions;
    if !scalping && ctx.is_recovery_entry {
        max_positions += AGGRESSIVE_EXTRA_RECOVERY_POSITIONS;
    }
    if ctx.total_positions >= max_positions {
        return Err(EntryRejection::PositionLimit);
    }

    if scalping && ctx.recovery_mode && ctx.decision.confluence < RECOVERY_CONFLUENCE_REQUIRED {
        return Err(EntryRejection::RecoveryConfluence);
    }

    if scalping && ctx.profit_locked {
        return Err(EntryRejection::ProfitLocked);
    }

    let net = expected_net_profit_percent(ctx.stops.tp_percent);
    if net < MIN_NET_PROFIT_REQUIRED_PERCENT {
        return Err(EntryRejection::CostsTooHigh(net.round_dp(2)));
    }

    Ok(())
}

/// Daily trading state carried across cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyFlags {
    pub recovery_mode: bool,
    pub profit_locked: bool,
    pub trading_stopped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DailyEvent {
    ProfitLocked(f64),
    RecoveryEntered(f64),
    RecoveryExited(f64),
    TradingStopped(String),
}

/// Update the daily flags from today's PnL and report what changed.
pub fn check_daily_status(profile: &StrategyProfile, history: &TradeHistory, flags: &mut DailyFlags) -> Vec<DailyEvent> {
    let mut events = Vec::new();
    if flags.trading_stopped {
        return events;
    }
    let pnl = history.daily_pnl_percent();

    match profile.bot_type() {
        BotType::Scalping => {
            if pnl >= PROFIT_LOCK_THRESHOLD && !flags.profit_locked {
                flags.profit_locked = true;
                events.push(DailyEvent::ProfitLocked(pnl));
            }
            if pnl <= RECOVERY_MODE_TRIGGER && !flags.recovery_mode {
                flags.recovery_mode = true;
                events.push(DailyEvent::RecoveryEntered(pnl));
            } else if flags.recovery_mode && pnl >= 0.0 {
                flags.recovery_mode = false;
                events.push(DailyEvent::RecoveryExited(pnl));
            }
            let limit = to_f64(profile.config.risk_management.max_daily_loss);
            if history.should_stop_trading_today(limit) {
                flags.trading_stopped = true;
                events.push(DailyEvent::TradingStopped(format!("Daily loss limit {:.2}%", pnl)));
            }
        }
        BotType::AggressiveRecovery => {
            if pnl >= AGGRESSIVE_DAILY_MAX {
                flags.trading_stopped = true;
                events.push(DailyEvent::TradingStopped(format!("Daily target reached {:+.2}%", pnl)));
            } else if pnl >= AGGRESSIVE_PROFIT_LOCK && !flags.profit_locked {
                flags.profit_locked = true;
                events.push(DailyEvent::ProfitLocked(pnl));
            }
            let drawdown = history.intraday_drawdown_percent();
            if !flags.trading_stopped && drawdown <= AGGRESSIVE_MAX_INTRADAY_DRAWDOWN {
                flags.trading_stopped = true;
                events.push(DailyEvent::TradingStopped(format!("Intraday drawdown {:.2}%", drawdown)));
            }
            if !flags.trading_stopped && pnl <= AGGRESSIVE_MAX_DAILY_LOSS {
                flags.trading_stopped = true;
                events.push(DailyEvent::TradingStopped(format!("Daily loss limit {:.2}%", pnl)));
            }
        }
    }
    events
}
