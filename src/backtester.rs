use crate::bot_config::{BotConfig, BotType};
use crate::constants::*;
use crate::indicators::{self, Macd};
use crate::market_data::Candle;
use crate::signals::Side;
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Candles needed before the first entry.
pub const MIN_HISTORY: usize = 50;
/// Trailing window the indicators are computed over.
const SIGNAL_WINDOW: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggressiveParams {
    pub take_profit_percent: Decimal,
    pub stop_loss_percent: Decimal,
    pub time_stop_secs: i64,
}

impl Default for AggressiveParams {
    fn default() -> Self {
        Self {
            take_profit_percent: AGGRESSIVE_QUICK_TP,
            stop_loss_percent: AGGRESSIVE_TIGHT_SL,
            time_stop_secs: AGGRESSIVE_TIME_STOP_FAST,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub start_date: String, // "2024-01-01"
    pub end_date: String,   // "2024-01-31"
    pub initial_balance: Decimal,
    pub commission_rate: Decimal, // 0.001 = 0.1%
    pub slippage: Decimal,        // 0.0005 = 0.05%
    pub data_interval: String,
    pub max_positions: usize,
    pub position_size_percent: Decimal, // of the free balance per entry
    pub min_confluence: u32,
    pub max_hold_secs: i64,
    pub sl_atr_multiplier: Decimal,
    pub tp_atr_multiplier: Decimal,
    pub aggressive: Option<AggressiveParams>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            start_date: "2024-01-01".to_string(),
            end_date: "2024-01-31".to_string(),
            initial_balance: Decimal::from(1000),
            commission_rate: dec!(0.001),
            slippage: dec!(0.0005),
            data_interval: PRIMARY_TIMEFRAME.to_string(),
            max_positions: 3,
            position_size_percent: dec!(33),
            min_confluence: MIN_CONFLUENCE_SIGNALS,
            max_hold_secs: 3600,
            sl_atr_multiplier: dec!(2),
            tp_atr_multiplier: dec!(3),
            aggressive: None,
        }
    }
}

impl BacktestConfig {
    /// Backtest settings that mirror a user bot configuration.
    pub fn from_bot_config(bot: &BotConfig) -> Self {
        let mut config = Self {
            max_positions: bot.max_positions as usize,
            position_size_percent: bot.position_size_percent,
            ..Self::default()
        };
        if bot.bot_type == BotType::AggressiveRecovery {
            config.min_confluence = bot.min_signal_strength.ceil().max(1.0) as u32;
            config.aggressive = Some(AggressiveParams::default());
        }
        config
    }

    pub fn parse_dates(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = parse_date(&self.start_date)?;
        let end = parse_date(&self.end_date)?;
        if end <= start {
            return Err(anyhow!("end date {} must be after start date {}", self.end_date, self.start_date));
        }
        Ok((start, end))
    }
}

pub fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .map_err(|e| anyhow!("invalid date {:?}: {}", date_str, e))?;
    date.and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .ok_or_else(|| anyhow!("invalid date {:?}", date_str))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub id: u64,
    pub symbol: String,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub commission: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
    pub exit_reason: String,
}

impl BacktestTrade {
    pub fn duration_secs(&self) -> i64 {
        (self.exit_time - self.entry_time).num_seconds()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub balance: Decimal,
    pub equity: Decimal,
    pub open_positions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResults {
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub total_commission: Decimal,
    pub total_slippage: Decimal,
    pub trades: Vec<BacktestTrade>,
    pub equity_curve: Vec<EquityPoint>,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    id: u64,
    entry_time: DateTime<Utc>,
    entry_price: Decimal,
    quantity: Decimal,
    cost: Decimal,
    entry_commission: Decimal,
    stop_loss: Decimal,
    take_profit: Decimal,
}

/// Indicator readings the replay decides on.
#[derive(Debug, Clone, Copy)]
pub struct CandleSignals {
    pub price: Decimal,
    pub rsi: Decimal,
    pub bb_position: Decimal,
    pub macd: Macd,
    pub atr: Decimal,
    pub ema_fast: Decimal,
    pub ema_slow: Decimal,
    pub volume_ratio: Decimal,
}

impl CandleSignals {
    pub fn compute(candles: &[Candle]) -> Option<Self> {
        let window = &candles[candles.len().saturating_sub(SIGNAL_WINDOW)..];
        let price = window.last()?.close;
        let closes: Vec<Decimal> = window.iter().map(|c| c.close).collect();
        let volumes: Vec<Decimal> = window.iter().map(|c| c.volume).collect();
        let bb = indicators::bollinger_bands(&closes, BB_PERIOD, BB_STD_DEV);

        Some(Self {
            price,
            rsi: indicators::rsi(&closes, RSI_PERIOD),
            bb_position: bb.position(price),
            macd: indicators::macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL),
            atr: indicators::atr(window, ATR_PERIOD),
            ema_fast: indicators::ema(&closes, EMA_FAST),
            ema_slow: indicators::ema(&closes, EMA_SLOW),
            volume_ratio: indicators::volume_ratio(&volumes, VOLUME_PERIOD),
        })
    }

    /// Number of bullish conditions that agree.
    pub fn long_confluence(&self) -> u32 {
        [
            self.rsi < RSI_OVERSOLD,
            self.bb_position < dec!(0.2),
            self.macd.is_bullish() && self.macd.histogram > Decimal::ZERO,
            self.ema_fast > self.ema_slow,
            self.volume_ratio > VOLUME_MULTIPLIER,
        ]
        .iter()
        .filter(|c| **c)
        .count() as u32
    }

    pub fn should_exit_long(&self) -> bool {
        self.rsi > RSI_OVERBOUGHT || self.bb_position > dec!(0.9) || self.macd.is_bearish()
    }
}

/// Replays candles for one or more symbols. Spot only: entries are long.
#[derive(Debug)]
pub struct Backtester {
    config: BacktestConfig,
    balance: Decimal,
    positions: BTreeMap<String, OpenPosition>,
    trades: Vec<BacktestTrade>,
    equity_curve: Vec<EquityPoint>,
    next_trade_id: u64,
    total_commission: Decimal,
    total_slippage: Decimal,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        let balance = config.initial_balance;
        Self {
            config,
            balance,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            next_trade_id: 1,
            total_commission: Decimal::ZERO,
            total_slippage: Decimal::ZERO,
        }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn run(&mut self, data: &BTreeMap<String, Vec<Candle>>) -> Result<BacktestResults> {
        let timestamps: BTreeSet<i64> = data
            .values()
            .flat_map(|candles| candles.iter().map(|c| c.open_time))
            .collect();
        if timestamps.is_empty() {
            return Err(anyhow!("No historical data available for the specified period"));
        }
        info!(
            "Starting backtest: {} symbols, {} candles, balance {}",
            data.len(),
            timestamps.len(),
            self.config.initial_balance
        );

        let index: HashMap<&str, HashMap<i64, usize>> = data
            .iter()
            .map(|(symbol, candles)| {
                let by_time = candles
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (c.open_time, i))
                    .collect();
                (symbol.as_str(), by_time)
            })
            .collect();

        let mut last_prices: HashMap<String, Decimal> = HashMap::new();
        let mut last_time = None;

        for (i, ts) in timestamps.iter().enumerate() {
            let mut current: Vec<(&str, &[Candle])> = Vec::new();
            for (symbol, candles) in data {
                if let Some(&idx) = index.get(symbol.as_str()).and_then(|m| m.get(ts)) {
                    current.push((symbol.as_str(), &candles[..=idx]));
                    last_prices.insert(symbol.clone(), candles[idx].close);
                }
            }
            let time = current
                .first()
                .and_then(|(_, history)| history.last())
                .map(|c| c.open_datetime())
                .unwrap_or_default();

            self.check_exits(time, &current);
            if self.positions.len() < self.config.max_positions {
                self.check_entries(time, &current);
            }
            self.record_equity(time, &last_prices);
            last_time = Some(time);

            if (i + 1) % 10_000 == 0 {
                info!("Processed {} / {} candles", i + 1, timestamps.len());
            }
        }

        if let Some(time) = last_time {
            let open: Vec<String> = self.positions.keys().cloned().collect();
            for symbol in open {
                if let Some(price) = last_prices.get(&symbol).copied() {
                    self.close_position(&symbol, time, price, "BACKTEST_END");
                }
            }
        }

        info!(
            "Backtest completed: {} trades, final balance {:.2}",
            self.trades.len(),
            self.balance
        );

        Ok(BacktestResults {
            initial_balance: self.config.initial_balance,
            final_balance: self.balance,
            total_commission: self.total_commission,
            total_slippage: self.total_slippage,
            trades: self.trades.clone(),
            equity_curve: self.equity_curve.clone(),
        })
    }

    fn max_hold_secs(&self) -> i64 {
        self.config
            .aggressive
            .as_ref()
            .map(|a| a.time_stop_secs)
            .unwrap_or(self.config.max_hold_secs)
    }

    fn check_exits(&mut self, time: DateTime<Utc>, current: &[(&str, &[Candle])]) {
        let max_hold = self.max_hold_secs();
        let mut to_close = Vec::new();

        for (symbol, history) in current {
            let Some(position) = self.positions.get(*symbol) else { continue };
            let Some(candle) = history.last() else { continue };
            let price = candle.close;

            let reason = if price <= position.stop_loss {
                Some("STOP_LOSS")
            } else if price >= position.take_profit {
                Some("TAKE_PROFIT")
            } else if (time - position.entry_time).num_seconds() > max_hold {
                Some("TIME_EXIT")
            } else if CandleSignals::compute(history).is_some_and(|s| s.should_exit_long()) {
                Some("SIGNAL_EXIT")
            } else {
                None
            };

            if let Some(reason) = reason {
                to_close.push((symbol.to_string(), price, reason));
            }
        }

        for (symbol, price, reason) in to_close {
            self.close_position(&symbol, time, price, reason);
        }
    }

    fn check_entries(&mut self, time: DateTime<Utc>, current: &[(&str, &[Candle])]) {
        for (symbol, history) in current {
            if self.positions.len() >= self.config.max_positions {
                break;
            }
            if self.positions.contains_key(*symbol) || history.len() < MIN_HISTORY {
                continue;
            }
            let Some(signals) = CandleSignals::compute(history) else { continue };
            if signals.long_confluence() >= self.config.min_confluence {
                self.open_position(symbol, time, &signals);
            }
        }
    }

    fn open_position(&mut self, symbol: &str, time: DateTime<Utc>, signals: &CandleSignals) {
        let entry_price = signals.price * (Decimal::ONE + self.config.slippage);
        let budget = self.balance * self.config.position_size_percent / Decimal::from(100);
        if budget <= Decimal::ZERO || entry_price <= Decimal::ZERO {
            return;
        }
        let quantity = (budget / entry_price).round_dp(8);
        let cost = quantity * entry_price;
        let commission = cost * self.config.commission_rate;
        if quantity <= Decimal::ZERO || cost + commission > self.balance {
            debug!("{}: insufficient balance for entry", symbol);
            return;
        }

        let (stop_loss, take_profit) = match &self.config.aggressive {
            Some(a) => {
                let hundred = Decimal::from(100);
                (
                    entry_price * (Decimal::ONE - a.stop_loss_percent / hundred),
                    entry_price * (Decimal::ONE + a.take_profit_percent / hundred),
                )
            }
            None => {
                let atr = if signals.atr > Decimal::ZERO {
                    signals.atr
                } else {
                    signals.price * dec!(0.01)
                };
                (
                    entry_price - atr * self.config.sl_atr_multiplier,
                    entry_price + atr * self.config.tp_atr_multiplier,
                )
            }
        };

        self.balance -= cost + commission;
        self.total_commission += commission;
        self.total_slippage += (entry_price - signals.price) * quantity;

        let id = self.next_trade_id;
        self.next_trade_id += 1;
        debug!(
            "Opened #{} {} {} @ {} (SL {}, TP {})",
            id,
            symbol,
            quantity,
            entry_price.round_dp(6),
            stop_loss.round_dp(6),
            take_profit.round_dp(6)
        );

        self.positions.insert(
            symbol.to_string(),
            OpenPosition {
                id,
                entry_time: time,
                entry_price,
                quantity,
                cost,
                entry_commission: commission,
                stop_loss,
                take_profit,
            },
        );
    }

    fn close_position(&mut self, symbol: &str, time: DateTime<Utc>, price: Decimal, reason: &str) {
        let Some(position) = self.positions.remove(symbol) else { return };

        let exit_price = price * (Decimal::ONE - self.config.slippage);
        let proceeds = position.quantity * exit_price;
        let commission = proceeds * self.config.commission_rate;

        self.balance += proceeds - commission;
        self.total_commission += commission;
        self.total_slippage += (price - exit_price) * position.quantity;

        let pnl = proceeds - commission - position.cost - position.entry_commission;
        let pnl_percent = if position.cost > Decimal::ZERO {
            pnl / position.cost * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        debug!(
            "Closed #{} {} @ {} PnL {} ({})",
            position.id,
            symbol,
            exit_price.round_dp(6),
            pnl.round_dp(4),
            reason
        );

        self.trades.push(BacktestTrade {
            id: position.id,
            symbol: symbol.to_string(),
            side: Side::Buy,
            entry_time: position.entry_time,
            exit_time: time,
            entry_price: position.entry_price,
            exit_price,
            quantity: position.quantity,
            commission: position.entry_commission + commission,
            pnl,
            pnl_percent,
            exit_reason: reason.to_string(),
        });
    }

    fn record_equity(&mut self, time: DateTime<Utc>, last_prices: &HashMap<String, Decimal>) {
        let market_value: Decimal = self
            .positions
            .iter()
            .map(|(symbol, p)| {
                let price = last_prices.get(symbol).copied().unwrap_or(p.entry_price);
                p.quantity * price
            })
            .sum();
        self.equity_curve.push(EquityPoint {
            timestamp: time,
            balance: self.balance,
            equity: self.balance + market_value,
            open_positions: self.positions.len(),
        });
    }
}
