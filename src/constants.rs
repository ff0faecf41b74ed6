//! Strategy tunables shared by the live bot and the backtester.
//!
//! These are internal knobs. User-facing parameters live in `bot_config`.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Indicators
pub const RSI_PERIOD: usize = 14;
pub const RSI_OVERSOLD: Decimal = dec!(30);
pub const RSI_OVERBOUGHT: Decimal = dec!(70);
pub const RSI_EXTREME_THRESHOLD: Decimal = dec!(25);
pub const BB_PERIOD: usize = 20;
pub const BB_STD_DEV: Decimal = dec!(2);
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const VOLUME_PERIOD: usize = 20;
pub const VOLUME_MULTIPLIER: Decimal = dec!(1.5);
pub const ATR_PERIOD: usize = 14;
pub const EMA_FAST: usize = 20;
pub const EMA_SLOW: usize = 50;

// Timeframes
pub const PRIMARY_TIMEFRAME: &str = "1m";
pub const CONFIRM_TIMEFRAMES: [&str; 2] = ["3m", "5m"];
pub const MIN_TF_ALIGNMENT_SCORE: f64 = 1.0;

// Signal quality
pub const MIN_CONFLUENCE_SIGNALS: u32 = 3;
pub const MIN_SIGNAL_STRENGTH: f64 = 3.5;

// Stops
pub const ATR_SL_MULTIPLIER: Decimal = dec!(1.2);
pub const ATR_TP_MULTIPLIER: Decimal = dec!(4.5);
// ATR stop distance bounds, in percent of price
pub const ATR_SL_MIN_PERCENT: Decimal = dec!(0.2);
pub const ATR_SL_MAX_PERCENT: Decimal = dec!(1.5);
pub const ATR_TP_MIN_PERCENT: Decimal = dec!(0.4);
pub const ATR_TP_MAX_PERCENT: Decimal = dec!(3.0);
pub const FALLBACK_SL_PERCENT: Decimal = dec!(0.6);
pub const FALLBACK_TP_PERCENT: Decimal = dec!(1.2);

// Partial take profit ladder (percent, fraction of the original size)
pub const PARTIAL_TP_1_PERCENT: Decimal = dec!(0.35);
pub const PARTIAL_TP_1_SIZE: Decimal = dec!(0.40);
pub const PARTIAL_TP_2_PERCENT: Decimal = dec!(0.75);
pub const PARTIAL_TP_2_SIZE: Decimal = dec!(0.30);
pub const PARTIAL_TP_3_PERCENT: Decimal = dec!(2.0);
pub const MOVE_SL_TO_BREAKEVEN_AFTER_PARTIAL: bool = true;

// Time stops (seconds)
pub const TIME_STOP_BASE: i64 = 150;
pub const TIME_STOP_STRONG_SIGNAL: i64 = 240;

pub const MAX_POSITIONS_PER_SYMBOL: usize = 2;

// Adaptive frequency
pub const ADAPTIVE_GOOD_PERFORMANCE_WR: f64 = 58.0;
pub const ADAPTIVE_GOOD_PERFORMANCE_PNL: f64 = 1.0;
pub const ADAPTIVE_BAD_PERFORMANCE_WR: f64 = 50.0;
pub const ADAPTIVE_BAD_PERFORMANCE_PNL: f64 = -1.0;
pub const ADAPTIVE_MAX_POSITIONS_GOOD: usize = 6;
pub const ADAPTIVE_MAX_POSITIONS_BAD: usize = 3;
pub const ADAPTIVE_MIN_STRENGTH_GOOD: f64 = 3.8;
pub const ADAPTIVE_MIN_STRENGTH_BAD: f64 = 4.5;

// Profit lock / recovery
pub const PROFIT_LOCK_THRESHOLD: f64 = 7.0;
pub const RECOVERY_MODE_TRIGGER: f64 = -2.5;
pub const RECOVERY_CONFLUENCE_REQUIRED: u32 = 4;
pub const RECOVERY_SIZE_LOSS_1: Decimal = dec!(0.8);
pub const RECOVERY_SIZE_LOSS_2: Decimal = dec!(0.7);
pub const RECOVERY_SIZE_LOSS_3: Decimal = dec!(0.6);
pub const RECOVERY_TP_MULTIPLIER: Decimal = dec!(1.0);
pub const MAX_RECOVERY_TRADES: u32 = 2;

// Hard stops (percent)
pub const MAX_DAILY_LOSS: f64 = -2.5;
pub const MAX_WEEKLY_LOSS: f64 = -10.0;
pub const MAX_MONTHLY_LOSS: f64 = -25.0;
pub const MAX_LOSS_PER_POSITION: Decimal = dec!(5.0);
pub const MAX_CONSECUTIVE_LOSSES: u32 = 5;

// Costs
pub const MAKER_FEE: Decimal = dec!(0.001);
pub const TAKER_FEE: Decimal = dec!(0.001);
pub const EXPECTED_SLIPPAGE_PERCENT: Decimal = dec!(0.03);
pub const MIN_NET_PROFIT_REQUIRED_PERCENT: Decimal = dec!(0.4);

// Market filters
pub const TRADING_START_HOUR: u32 = 8;
pub const TRADING_END_HOUR: u32 = 15;
pub const SIDEWAYS_THRESHOLD: Decimal = dec!(0.4);
pub const MIN_VOLUME_RATIO: Decimal = dec!(0.8);

// Exchange access
pub const CANDLES_LIMIT: u16 = 100;
pub const API_REQUEST_DELAY_MS: u64 = 100;
pub const API_RETRY_ATTEMPTS: u32 = 3;
pub const API_RETRY_DELAY_SECS: u64 = 5;
pub const API_TIMEOUT_SECS: u64 = 10;

pub const STATE_FILE: &str = "bot_state.json";

// Trailing stops (percent)
pub const DAILY_TRAILING_PERCENT: Decimal = dec!(0.2);
pub const DAILY_TRAILING_ACTIVATION: Decimal = dec!(0.5);
pub const AGGRESSIVE_TRAILING_PERCENT: Decimal = dec!(0.3);
pub const AGGRESSIVE_TRAILING_ACTIVATION: Decimal = dec!(0.5);

// Aggressive recovery profile
pub const AGGRESSIVE_QUICK_TP: Decimal = dec!(1.2);
pub const AGGRESSIVE_MEDIUM_TP: Decimal = dec!(1.8);
pub const AGGRESSIVE_STRONG_TP: Decimal = dec!(2.5);
pub const AGGRESSIVE_TIGHT_SL: Decimal = dec!(0.6);
pub const AGGRESSIVE_MIN_SIGNAL_STRENGTH: f64 = 4.0;
pub const AGGRESSIVE_DAILY_MAX: f64 = 5.0;
pub const AGGRESSIVE_PROFIT_LOCK: f64 = 3.0;
pub const AGGRESSIVE_MAX_DAILY_LOSS: f64 = -5.0;
pub const AGGRESSIVE_MAX_INTRADAY_DRAWDOWN: f64 = -15.0;
pub const AGGRESSIVE_TIME_STOP_FAST: i64 = 600;
pub const AGGRESSIVE_TIME_STOP_RECOVERY: i64 = 900;
pub const AGGRESSIVE_WIN_STREAK_BONUS: Decimal = dec!(1.3);
pub const AGGRESSIVE_LOSS_REDUCTION: Decimal = dec!(0.7);
pub const AGGRESSIVE_EXTRA_RECOVERY_POSITIONS: usize = 3;

pub const SYMBOL_ROTATION_INTERVAL_SECS: i64 = 900;
pub const MIN_ORDER_QUANTITY: Decimal = dec!(0.001);
