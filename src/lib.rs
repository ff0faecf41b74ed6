//! Binance Confluence Bot Library
//!
//! Multi-indicator confluence trading bot for Binance spot, with paper
//! trading, backtesting and a multi-user dashboard.

pub mod alerts;
pub mod auth;
pub mod backtester;
pub mod binance;
pub mod bot;
pub mod bot_config;
pub mod comparison;
pub mod config;
pub mod constants;
pub mod dashboard;
pub mod data_loader;
pub mod db;
pub mod error;
pub mod execution;
pub mod history;
pub mod indicators;
pub mod market_data;
pub mod metrics;
pub mod positions;
pub mod regime;
pub mod risk;
pub mod signals;
pub mod state;
pub mod strategy;
pub mod symbols;
pub mod telegram;
pub mod trailing_stop;
pub mod walkforward;

// Re-export commonly used types
pub use backtester::{BacktestConfig, BacktestResults, Backtester};
pub use binance::BinanceClient;
pub use bot::{BotCommand, BotSettings, TradingBot};
pub use bot_config::{BotConfig, BotType};
pub use config::Config;
pub use error::{BotError, BotResult};
pub use market_data::Candle;
pub use metrics::PerformanceMetrics;
pub use strategy::StrategyProfile;
