//! Versioned user bot configuration.
//!
//! A `BotConfig` is what a user edits in the dashboard and what a bot instance
//! trades with. Documents are stored as TOML text; older layouts (1.0, 1.5) are
//! upgraded on load before validation.

use crate::error::ValidationError;
use log::{info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const CURRENT_VERSION: &str = "2.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotType {
    Scalping,
    AggressiveRecovery,
}

impl BotType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotType::Scalping => "SCALPING",
            BotType::AggressiveRecovery => "AGGRESSIVE_RECOVERY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskManagement {
    pub atr_sl_multiplier: Decimal,
    pub atr_tp_multiplier: Decimal,
    /// Percent of balance risked per trade
    pub max_loss_per_trade: Decimal,
    pub daily_profit_target: Decimal,
    pub max_daily_loss: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_version")]
    pub config_version: String,
    pub strategy_name: String,
    pub bot_type: BotType,
    pub min_signal_strength: f64,
    pub max_positions: u32,
    pub max_active_symbols: u32,
    pub position_size_percent: Decimal,
    #[serde(default)]
    pub enable_martingale: bool,
    #[serde(default = "default_martingale_multiplier")]
    pub martingale_multiplier: Decimal,
    #[serde(default = "default_martingale_levels")]
    pub martingale_max_levels: u32,
    #[serde(default = "default_true")]
    pub trailing_stop_enabled: bool,
    #[serde(default = "default_true")]
    pub partial_take_profit: bool,
    #[serde(default)]
    pub progressive_recovery: bool,
    #[serde(default = "default_true")]
    pub enable_advanced_risk: bool,
    #[serde(default = "default_true")]
    pub enable_adaptive_strategy: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_time_stop_base")]
    pub time_stop_base: i64,
    #[serde(default = "default_one")]
    pub win_streak_multiplier: Decimal,
    #[serde(default = "default_one")]
    pub loss_streak_multiplier: Decimal,
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_percent: f64,
    pub symbols: Vec<String>,
    // Tables must follow plain values in TOML output
    pub risk_management: RiskManagement,
}

fn default_version() -> String {
    CURRENT_VERSION.to_string()
}
fn default_true() -> bool {
    true
}
fn default_martingale_multiplier() -> Decimal {
    dec!(1.3)
}
fn default_martingale_levels() -> u32 {
    2
}
fn default_check_interval() -> u64 {
    20
}
fn default_time_stop_base() -> i64 {
    150
}
fn default_one() -> Decimal {
    Decimal::ONE
}
fn default_max_drawdown() -> f64 {
    15.0
}

impl Default for BotConfig {
    fn default() -> Self {
        balanced_template()
    }
}

impl BotConfig {
    /// Check every field range and collect all violations.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let name = self.strategy_name.trim();
        if name.chars().count() < 3 {
            errors.push(ValidationError::new(
                "strategy_name",
                "Strategy name must be at least 3 characters",
            ));
        }
        if name.chars().count() > 100 {
            errors.push(ValidationError::new(
                "strategy_name",
                "Strategy name must be at most 100 characters",
            ));
        }

        check_f64(&mut errors, "min_signal_strength", self.min_signal_strength, 0.0, 5.0);
        check_u32(&mut errors, "max_positions", self.max_positions, 1, 20);
        check_u32(&mut errors, "max_active_symbols", self.max_active_symbols, 1, 12);
        check_dec(
            &mut errors,
            "position_size_percent",
            self.position_size_percent,
            dec!(0.1),
            dec!(5),
        );

        let risk = &self.risk_management;
        check_dec(
            &mut errors,
            "risk_management.atr_sl_multiplier",
            risk.atr_sl_multiplier,
            dec!(0.5),
            dec!(3),
        );
        check_dec(
            &mut errors,
            "risk_management.atr_tp_multiplier",
            risk.atr_tp_multiplier,
            dec!(1),
            dec!(10),
        );
        check_dec(
            &mut errors,
            "risk_management.max_loss_per_trade",
            risk.max_loss_per_trade,
            dec!(0.05),
            dec!(1),
        );
        check_dec(
            &mut errors,
            "risk_management.daily_profit_target",
            risk.daily_profit_target,
            dec!(0.5),
            dec!(20),
        );
        check_dec(
            &mut errors,
            "risk_management.max_daily_loss",
            risk.max_daily_loss,
            dec!(1),
            dec!(20),
        );

        check_dec(
            &mut errors,
            "martingale_multiplier",
            self.martingale_multiplier,
            dec!(1),
            dec!(3),
        );
        check_u32(&mut errors, "martingale_max_levels", self.martingale_max_levels, 1, 5);
        if !(5..=120).contains(&self.check_interval) {
            errors.push(ValidationError::new(
                "check_interval",
                "must be between 5 and 120",
            ));
        }
        if !(60..=600).contains(&self.time_stop_base) {
            errors.push(ValidationError::new(
                "time_stop_base",
                "must be between 60 and 600",
            ));
        }
        check_dec(
            &mut errors,
            "win_streak_multiplier",
            self.win_streak_multiplier,
            dec!(1),
            dec!(2),
        );
        check_dec(
            &mut errors,
            "loss_streak_multiplier",
            self.loss_streak_multiplier,
            dec!(0.3),
            dec!(1),
        );
        check_f64(
            &mut errors,
            "max_drawdown_percent",
            self.max_drawdown_percent,
            5.0,
            30.0,
        );

        if self.symbols.is_empty() || self.symbols.len() > 12 {
            errors.push(ValidationError::new(
                "symbols",
                "must contain between 1 and 12 symbols",
            ));
        }
        for symbol in &self.symbols {
            if !symbol.ends_with("USDT") {
                errors.push(ValidationError::new(
                    "symbols",
                    format!("Symbol {symbol} must end with USDT"),
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn check_f64(errors: &mut Vec<ValidationError>, field: &str, value: f64, min: f64, max: f64) {
    if !(min..=max).contains(&value) {
        errors.push(ValidationError::new(
            field,
            format!("must be between {min} and {max}"),
        ));
    }
}

fn check_u32(errors: &mut Vec<ValidationError>, field: &str, value: u32, min: u32, max: u32) {
    if !(min..=max).contains(&value) {
        errors.push(ValidationError::new(
            field,
            format!("must be between {min} and {max}"),
        ));
    }
}

fn check_dec(
    errors: &mut Vec<ValidationError>,
    field: &str,
    value: Decimal,
    min: Decimal,
    max: Decimal,
) {
    if value < min || value > max {
        errors.push(ValidationError::new(
            field,
            format!("must be between {min} and {max}"),
        ));
    }
}

/// Parse a TOML document, upgrade it to the current layout and validate it.
pub fn parse_and_validate(text: &str) -> Result<BotConfig, Vec<ValidationError>> {
    let raw: toml::Value = toml::from_str(text)
        .map_err(|e| vec![ValidationError::new("document", format!("Invalid TOML: {e}"))])?;
    let doc = serde_json::to_value(raw)
        .map_err(|e| vec![ValidationError::new("document", e.to_string())])?;
    if !doc.is_object() {
        return Err(vec![ValidationError::new(
            "document",
            "Config must be a table",
        )]);
    }

    let migrated = migrate(doc);
    let mut config: BotConfig = serde_json::from_value(migrated)
        .map_err(|e| vec![ValidationError::new("document", e.to_string())])?;
    config.strategy_name = config.strategy_name.trim().to_string();
    config.validate()?;
    Ok(config)
}

// Migrations work on untyped documents so that old layouts which do not fit
// the current struct can still be read.

pub fn document_version(doc: &Value) -> String {
    doc.get("config_version")
        .and_then(Value::as_str)
        .unwrap_or("1.0")
        .to_string()
}

pub fn is_current_version(doc: &Value) -> bool {
    document_version(doc) == CURRENT_VERSION
}

/// Upgrade a document through 1.0 -> 1.5 -> 2.0.
pub fn migrate(mut doc: Value) -> Value {
    let original = document_version(&doc);
    let mut version = original.clone();

    if version == "1.0" {
        doc = migrate_1_0_to_1_5(doc);
        version = "1.5".to_string();
    }
    if version == "1.5" {
        doc = migrate_1_5_to_2_0(doc);
        version = "2.0".to_string();
    }

    if version == CURRENT_VERSION {
        if original != version {
            info!("Config migrated: v{original} -> v{version}");
        }
    } else {
        warn!("Unknown config version: {version}");
    }
    doc
}

fn migrate_1_0_to_1_5(mut doc: Value) -> Value {
    let Some(map) = doc.as_object_mut() else {
        return doc;
    };

    map.entry("trailing_stop_enabled").or_insert(json!(true));
    map.entry("partial_take_profit").or_insert(json!(true));

    rename_key(map, "stop_loss_pct", "stop_loss_percent");
    rename_key(map, "take_profit_pct", "take_profit_percent");

    map.entry("symbols")
        .or_insert(json!(["BTCUSDT", "ETHUSDT", "BNBUSDT", "ADAUSDT"]));
    map.entry("check_interval").or_insert(json!(20));

    map.insert("config_version".into(), json!("1.5"));
    doc
}

fn migrate_1_5_to_2_0(mut doc: Value) -> Value {
    let Some(map) = doc.as_object_mut() else {
        return doc;
    };

    let mut risk = Map::new();
    for (key, default) in [
        ("atr_sl_multiplier", json!(1.5)),
        ("atr_tp_multiplier", json!(4.0)),
        ("max_loss_per_trade", json!(0.15)),
        ("daily_profit_target", json!(2.0)),
        ("max_daily_loss", json!(3.0)),
    ] {
        let value = map.remove(key).unwrap_or(default);
        risk.insert(key.to_string(), value);
    }
    map.insert("risk_management".into(), Value::Object(risk));

    if let Some(old) = map.get("bot_type").and_then(Value::as_str) {
        let mapped = match old.to_lowercase().as_str() {
            "aggressive" | "aggressive_recovery" => "AGGRESSIVE_RECOVERY",
            _ => "SCALPING",
        };
        map.insert("bot_type".into(), json!(mapped));
    }

    map.entry("enable_advanced_risk").or_insert(json!(true));
    map.entry("enable_adaptive_strategy").or_insert(json!(true));
    map.entry("position_size_percent").or_insert(json!(1.0));
    if !map.contains_key("max_active_symbols") {
        let max_positions = map.get("max_positions").cloned().unwrap_or(json!(5));
        map.insert("max_active_symbols".into(), max_positions);
    }
    map.entry("time_stop_base").or_insert(json!(150));
    map.entry("progressive_recovery").or_insert(json!(false));

    for deprecated in ["stop_loss_percent", "take_profit_percent"] {
        if let Some(value) = map.remove(deprecated) {
            warn!(
                "'{deprecated}' is deprecated in v2.0 (was {value}); \
                 use risk_management.atr_sl_multiplier/atr_tp_multiplier instead"
            );
        }
    }

    map.insert("config_version".into(), json!("2.0"));
    doc
}

fn rename_key(map: &mut Map<String, Value>, from: &str, to: &str) {
    if let Some(value) = map.remove(from) {
        map.insert(to.to_string(), value);
    }
}

pub fn migration_summary(from: &str, to: &str) -> Vec<&'static str> {
    match (from, to) {
        ("1.0", "1.5") => vec![
            "Added trailing_stop_enabled parameter",
            "Renamed stop_loss_pct -> stop_loss_percent",
            "Added default symbols list",
            "Added check_interval parameter",
        ],
        ("1.5", "2.0") => vec![
            "Restructured risk parameters into nested object",
            "Converted bot_type to uppercase enum",
            "Added advanced feature flags",
            "Added position sizing adjustments",
            "Deprecated old stop_loss_percent/take_profit_percent",
        ],
        ("1.0", "2.0") => vec![
            "Complete upgrade from v1.0 to v2.0",
            "All v1.5 and v2.0 changes applied",
        ],
        _ => Vec::new(),
    }
}

// Templates

#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
    pub name: &'static str,
    pub strategy_name: String,
    pub bot_type: BotType,
    pub min_signal_strength: f64,
    pub description: &'static str,
}

pub const TEMPLATE_NAMES: [&str; 3] = ["safe", "balanced", "aggressive"];

pub fn template(name: &str) -> Option<BotConfig> {
    match name {
        "safe" => Some(safe_template()),
        "balanced" => Some(balanced_template()),
        "aggressive" => Some(aggressive_template()),
        _ => None,
    }
}

pub fn list_templates() -> Vec<TemplateInfo> {
    TEMPLATE_NAMES
        .iter()
        .filter_map(|name| {
            let config = template(name)?;
            Some(TemplateInfo {
                name: *name,
                strategy_name: config.strategy_name,
                bot_type: config.bot_type,
                min_signal_strength: config.min_signal_strength,
                description: template_description(name),
            })
        })
        .collect()
}

fn template_description(name: &str) -> &'static str {
    match name {
        "safe" => "Low risk strategy with high signal requirements (4.5). Best for beginners.",
        "aggressive" => "High risk/reward with martingale recovery. For experienced traders.",
        "balanced" => "Medium risk balanced approach (3.5). Good for most traders.",
        _ => "",
    }
}

fn base_symbols() -> Vec<String> {
    ["BTCUSDT", "BNBUSDT", "ADAUSDT", "SOLUSDT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn balanced_template() -> BotConfig {
    BotConfig {
        config_version: CURRENT_VERSION.to_string(),
        strategy_name: "Balanced Scalping".to_string(),
        bot_type: BotType::Scalping,
        min_signal_strength: 3.5,
        max_positions: 4,
        max_active_symbols: 4,
        position_size_percent: dec!(1.0),
        enable_martingale: false,
        martingale_multiplier: dec!(1.3),
        martingale_max_levels: 2,
        trailing_stop_enabled: true,
        partial_take_profit: true,
        progressive_recovery: false,
        enable_advanced_risk: true,
        enable_adaptive_strategy: true,
        check_interval: 30,
        time_stop_base: 150,
        win_streak_multiplier: Decimal::ONE,
        loss_streak_multiplier: Decimal::ONE,
        max_drawdown_percent: 15.0,
        symbols: base_symbols(),
        risk_management: RiskManagement {
            atr_sl_multiplier: dec!(1.2),
            atr_tp_multiplier: dec!(4.5),
            max_loss_per_trade: dec!(0.15),
            daily_profit_target: dec!(2.0),
            max_daily_loss: dec!(2.5),
        },
    }
}

fn safe_template() -> BotConfig {
    BotConfig {
        strategy_name: "Safe Scalping".to_string(),
        min_signal_strength: 4.5,
        max_positions: 3,
        max_active_symbols: 3,
        position_size_percent: dec!(0.5),
        risk_management: RiskManagement {
            atr_sl_multiplier: dec!(1.0),
            atr_tp_multiplier: dec!(3.0),
            max_loss_per_trade: dec!(0.1),
            daily_profit_target: dec!(1.5),
            max_daily_loss: dec!(2.0),
        },
        ..balanced_template()
    }
}

fn aggressive_template() -> BotConfig {
    BotConfig {
        strategy_name: "Aggressive Recovery".to_string(),
        bot_type: BotType::AggressiveRecovery,
        min_signal_strength: 4.0,
        max_positions: 5,
        max_active_symbols: 4,
        position_size_percent: dec!(2.0),
        enable_martingale: true,
        check_interval: 20,
        time_stop_base: 600,
        win_streak_multiplier: dec!(1.3),
        loss_streak_multiplier: dec!(0.7),
        risk_management: RiskManagement {
            atr_sl_multiplier: dec!(1.5),
            atr_tp_multiplier: dec!(4.0),
            max_loss_per_trade: dec!(0.15),
            daily_profit_target: dec!(5.0),
            max_daily_loss: dec!(5.0),
        },
        ..balanced_template()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_are_valid() {
        for name in TEMPLATE_NAMES {
            let config = template(name).unwrap();
            assert!(config.validate().is_ok(), "template {name} failed validation");
        }
        assert!(template("yolo").is_none());
        assert_eq!(list_templates().len(), 3);
    }

    #[test]
    fn validation_collects_all_errors() {
        let mut config = BotConfig::default();
        config.strategy_name = "  ab ".into();
        config.max_positions = 0;
        config.symbols = vec!["ETHBTC".into()];
        config.risk_management.atr_tp_multiplier = dec!(12);

        let errors = config.validate().unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"strategy_name"));
        assert!(fields.contains(&"max_positions"));
        assert!(fields.contains(&"symbols"));
        assert!(fields.contains(&"risk_management.atr_tp_multiplier"));
    }

    #[test]
    fn toml_roundtrip_through_parser() {
        let config = template("aggressive").unwrap();
        let text = config.to_toml().unwrap();
        let parsed = parse_and_validate(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn migrates_v1_0_document() {
        let text = r#"
strategy_name = "Legacy"
bot_type = "aggressive"
min_signal_strength = 4.0
max_positions = 3
stop_loss_pct = 0.6
take_profit_pct = 1.2
"#;
        let config = parse_and_validate(text).unwrap();
        assert_eq!(config.config_version, "2.0");
        assert_eq!(config.bot_type, BotType::AggressiveRecovery);
        assert_eq!(config.max_active_symbols, 3);
        assert_eq!(config.check_interval, 20);
        assert_eq!(config.symbols.len(), 4);
        assert_eq!(config.risk_management.atr_sl_multiplier, dec!(1.5));
        assert!(config.trailing_stop_enabled);
    }

    #[test]
    fn migrates_v1_5_flat_risk() {
        let doc = json!({
            "config_version": "1.5",
            "strategy_name": "Flat",
            "bot_type": "scalping",
            "min_signal_strength": 3.0,
            "max_positions": 4,
            "atr_sl_multiplier": 1.1,
            "max_daily_loss": 4.0,
            "stop_loss_percent": 0.5,
        });
        let migrated = migrate(doc);
        assert!(is_current_version(&migrated));
        assert_eq!(migrated["bot_type"], "SCALPING");
        assert_eq!(migrated["risk_management"]["atr_sl_multiplier"], 1.1);
        assert_eq!(migrated["risk_management"]["atr_tp_multiplier"], 4.0);
        assert_eq!(migrated["risk_management"]["max_daily_loss"], 4.0);
        assert!(migrated.get("stop_loss_percent").is_none());
        assert!(migrated.get("atr_sl_multiplier").is_none());
    }

    #[test]
    fn unknown_bot_type_maps_to_scalping() {
        let doc = json!({"config_version": "1.5", "bot_type": "grid"});
        assert_eq!(migrate(doc)["bot_type"], "SCALPING");
    }

    #[test]
    fn rejects_invalid_toml() {
        let errors = parse_and_validate("strategy_name = ").unwrap_err();
        assert_eq!(errors[0].field, "document");
    }

    #[test]
    fn summary_lists_changes() {
        assert_eq!(migration_summary("1.0", "1.5").len(), 4);
        assert!(migration_summary("2.0", "3.0").is_empty());
    }
}
