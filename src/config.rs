use crate::bot_config::BotConfig;
use crate::constants;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub binance: BinanceConfig,
    pub trading: TradingConfig,
    pub telegram: TelegramConfig,
    pub dashboard: DashboardConfig,
    pub strategy: BotConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BinanceConfig {
    pub api_key: String,
    pub secret_key: String,
    pub testnet: bool,
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradingConfig {
    pub demo_mode: bool,          // Route orders to the paper executor
    pub interval: String,
    pub candles_limit: u16,
    pub starting_balance: Decimal, // Paper balance in USDT
    pub state_file: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DashboardConfig {
    pub bind_address: String,
    pub database_url: String,
    pub token_secret: String,
    pub encryption_key: String,
    pub token_ttl_minutes: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binance: BinanceConfig {
                api_key: String::new(),
                secret_key: String::new(),
                testnet: true,
                base_url: "https://testnet.binance.vision".to_string(),
            },
            trading: TradingConfig {
                demo_mode: true,
                interval: constants::PRIMARY_TIMEFRAME.to_string(),
                candles_limit: constants::CANDLES_LIMIT,
                starting_balance: Decimal::from(100), // $100 paper account
                state_file: constants::STATE_FILE.to_string(),
            },
            telegram: TelegramConfig::default(),
            dashboard: DashboardConfig {
                bind_address: "0.0.0.0:8000".to_string(),
                database_url: "sqlite://trading_bot.db?mode=rwc".to_string(),
                token_secret: "change-me".to_string(),
                encryption_key: "change-me-too".to_string(),
                token_ttl_minutes: 60 * 24,
            },
            strategy: BotConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("config.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path).unwrap_or_else(|_| {
            log::warn!("Config file not found, using default configuration");
            String::new()
        });

        let mut config = if config_str.is_empty() {
            let default_config = Self::default();
            let toml_str = toml::to_string_pretty(&default_config)?;
            std::fs::write(path, toml_str)?;
            default_config
        } else {
            toml::from_str(&config_str)?
        };

        config.apply_env_overrides();
        if let Err(errors) = config.strategy.validate() {
            return Err(crate::error::BotError::Validation(errors).into());
        }
        Ok(config)
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BINANCE_API_KEY") {
            self.binance.api_key = v;
        }
        if let Some(v) = lookup("BINANCE_SECRET_KEY") {
            self.binance.secret_key = v;
        }
        if let Some(v) = lookup("BINANCE_BASE_URL") {
            self.binance.base_url = v;
        }
        if let Some(v) = lookup("DEMO_MODE") {
            self.trading.demo_mode = parse_flag(&v);
        }
        if let Some(v) = lookup("STARTING_BALANCE").and_then(|v| Decimal::from_str(&v).ok()) {
            self.trading.starting_balance = v;
        }
        if let Some(v) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = v;
            self.telegram.enabled = !self.telegram.bot_token.is_empty();
        }
        if let Some(v) = lookup("TELEGRAM_CHAT_ID") {
            self.telegram.chat_id = v;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.dashboard.database_url = v;
        }
        if let Some(v) = lookup("SECRET_KEY") {
            self.dashboard.token_secret = v;
        }
        if let Some(v) = lookup("ENCRYPTION_KEY") {
            self.dashboard.encryption_key = v;
        }
        if let Some(port) = lookup("PORT") {
            self.dashboard.bind_address = format!("0.0.0.0:{port}");
        }
    }

    pub fn telegram_ready(&self) -> bool {
        self.telegram.enabled && !self.telegram.bot_token.is_empty() && !self.telegram.chat_id.is_empty()
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn writes_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert!(config.trading.demo_mode);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.strategy, config.strategy);
        assert_eq!(reloaded.trading.starting_balance, Decimal::from(100));
    }

    #[test]
    fn env_overrides_win() {
        let vars: HashMap<&str, &str> = [
            ("BINANCE_API_KEY", "key"),
            ("DEMO_MODE", "false"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "42"),
            ("PORT", "9000"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.binance.api_key, "key");
        assert!(!config.trading.demo_mode);
        assert!(config.telegram_ready());
        assert_eq!(config.dashboard.bind_address, "0.0.0.0:9000");
    }

    #[test]
    fn trading_parameters_live_under_strategy() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let value: toml::Value = toml::from_str(&text).unwrap();

        for section in ["binance", "trading", "telegram", "dashboard", "strategy"] {
            assert!(value.get(section).is_some_and(toml::Value::is_table), "{section}");
        }
        let strategy = &value["strategy"];
        for key in ["symbols", "bot_type", "check_interval"] {
            assert!(strategy.get(key).is_some(), "strategy.{key}");
        }
        assert!(strategy["risk_management"].get("max_daily_loss").is_some());
        assert!(value["trading"].get("symbols").is_none());
        assert!(value.get("risk_management").is_none());
    }

    #[test]
    fn rejects_invalid_strategy_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.strategy.max_positions = 50;
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
