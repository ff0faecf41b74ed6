//! Portfolio-level risk: Kelly sizing with exposure, correlation, volatility,
//! drawdown and loss-streak adjustments, plus the pause rules.

use crate::signals::to_f64;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use log::{debug, info};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

pub const SECTOR_GROUPS: [(&str, &[&str]); 5] = [
    ("blue_chip", &["BTCUSDT", "ETHUSDT"]),
    ("exchange_tokens", &["BNBUSDT"]),
    (
        "layer1",
        &["SOLUSDT", "ADAUSDT", "DOTUSDT", "AVAXUSDT", "ATOMUSDT", "APTUSDT"],
    ),
    ("defi", &["LINKUSDT", "FILUSDT", "ICPUSDT"]),
    (
        "altcoins",
        &["XRPUSDT", "DOGEUSDT", "TRXUSDT", "LTCUSDT", "ETCUSDT", "XLMUSDT"],
    ),
];

pub const MAX_POSITIONS_PER_SECTOR: usize = 2;

const BASE_RISK_PER_TRADE: f64 = 0.006;
const ASSUMED_AVG_WIN: f64 = 0.006;
const MAX_AVG_CORRELATION: f64 = 0.7;
const MAX_PAIR_CORRELATION: f64 = 0.8;
const PAUSE_DAILY_LOSS: f64 = 0.025;
const PAUSE_MONTHLY_LOSS: f64 = 0.10;
const PAUSE_CONSECUTIVE_LOSSES: u32 = 5;
const PAUSE_DRAWDOWN: f64 = 0.20;
const MIN_CORRELATION_POINTS: usize = 20;
const HISTORY_LEN: usize = 100;

pub fn sector_of(symbol: &str) -> Option<&'static str> {
    SECTOR_GROUPS
        .iter()
        .find(|(_, members)| members.contains(&symbol))
        .map(|(sector, _)| *sector)
}

/// Pearson correlation of two equally long series.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n < 2 {
        return None;
    }
    let (a, b) = (&a[a.len() - n..], &b[b.len() - n..]);
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

fn returns(prices: &VecDeque<f64>) -> Vec<f64> {
    prices
        .iter()
        .zip(prices.iter().skip(1))
        .map(|(prev, next)| if *prev != 0.0 { (next - prev) / prev } else { 0.0 })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[derive(Debug, Clone)]
struct TrackedPosition {
    size: Decimal,
    entry_price: Decimal,
    value: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioMetrics {
    pub total_exposure: f64, // fraction of capital
    pub position_count: usize,
    pub largest_position: f64,
    pub correlation_score: f64,
    pub volatility_regime: String,
    pub current_drawdown: f64,
    pub daily_var: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizingDetails {
    pub base_risk: Decimal,
    pub kelly_fraction: f64,
    pub kelly_size: Decimal,
    pub confidence: f64,
    pub exposure_multiplier: f64,
    pub correlation_multiplier: f64,
    pub volatility_multiplier: f64,
    pub drawdown_multiplier: f64,
    pub loss_multiplier: f64,
    pub final_value: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone)]
pub struct RiskManager {
    pub current_capital: Decimal,
    pub peak_capital: Decimal,
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    daily_start_capital: Decimal,
    monthly_start_capital: Decimal,
    last_reset_day: NaiveDate,
    last_reset_month: (i32, u32),
    positions: BTreeMap<String, TrackedPosition>,
    price_history: HashMap<String, VecDeque<f64>>,
    current_atr: HashMap<String, f64>,
    atr_history: HashMap<String, VecDeque<f64>>,
}

impl RiskManager {
    pub fn new(initial_capital: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            current_capital: initial_capital,
            peak_capital: initial_capital,
            consecutive_losses: 0,
            consecutive_wins: 0,
            daily_start_capital: initial_capital,
            monthly_start_capital: initial_capital,
            last_reset_day: now.date_naive(),
            last_reset_month: (now.year(), now.month()),
            positions: BTreeMap::new(),
            price_history: HashMap::new(),
            current_atr: HashMap::new(),
            atr_history: HashMap::new(),
        }
    }

    /// Kelly-based position size in base units for an entry at `entry_price`.
    pub fn calculate_position_size(
        &self,
        symbol: &str,
        entry_price: Decimal,
        stop_loss_percent: Decimal,
        win_rate: f64,
        confidence: f64,
    ) -> SizingDetails {
        let capital = to_f64(self.current_capital);
        let sl = to_f64(stop_loss_percent) / 100.0;
        let base_risk = capital * BASE_RISK_PER_TRADE;

        let b = if sl > 0.0 { ASSUMED_AVG_WIN / sl } else { 1.7 };
        let kelly_fraction = ((win_rate * b - (1.0 - win_rate)) / b).clamp(0.0, 0.25);
        let kelly_size = capital * kelly_fraction * 0.25;

        let mut value = if kelly_size > base_risk {
            base_risk * (1.0 + kelly_fraction.min(0.5))
        } else {
            base_risk
        };
        value *= confidence;

        let metrics = self.portfolio_metrics();
        let exposure_multiplier = if metrics.total_exposure > 0.12 {
            0.6
        } else if metrics.total_exposure > 0.08 {
            0.8
        } else {
            1.0
        };
        let correlation_multiplier = if metrics.correlation_score > 0.6 {
            0.4
        } else if metrics.correlation_score > 0.5 {
            0.7
        } else {
            1.0
        };
        let volatility_multiplier = self.volatility_multiplier(symbol);
        let drawdown_multiplier = self.drawdown_multiplier();
        let loss_multiplier = self.consecutive_loss_multiplier();

        value *= exposure_multiplier
            * correlation_multiplier
            * volatility_multiplier
            * drawdown_multiplier
            * loss_multiplier;

        let final_value = Decimal::from_f64(value).unwrap_or(Decimal::ZERO).round_dp(8);
        let quantity = if entry_price > Decimal::ZERO {
            (final_value / entry_price).round_dp(8)
        } else {
            Decimal::ZERO
        };

        debug!(
            "Risk size for {}: {} (${}, kelly {:.3})",
            symbol, quantity, final_value, kelly_fraction
        );

        SizingDetails {
            base_risk: Decimal::from_f64(base_risk).unwrap_or(Decimal::ZERO).round_dp(8),
            kelly_fraction,
            kelly_size: Decimal::from_f64(kelly_size).unwrap_or(Decimal::ZERO).round_dp(8),
            confidence,
            exposure_multiplier,
            correlation_multiplier,
            volatility_multiplier,
            drawdown_multiplier,
            loss_multiplier,
            final_value,
            quantity,
        }
    }

    pub fn volatility_multiplier(&self, symbol: &str) -> f64 {
        match self.atr_ratio(symbol) {
            None => 1.0,
            Some(r) if r < 0.7 => 1.3,
            Some(r) if r < 1.3 => 1.0,
            Some(r) if r < 2.0 => 0.7,
            Some(_) => 0.4,
        }
    }

    pub fn drawdown_multiplier(&self) -> f64 {
        let dd = self.drawdown();
        if dd < 0.05 {
            1.0
        } else if dd < 0.10 {
            0.9
        } else if dd < 0.15 {
            0.7
        } else if dd < 0.20 {
            0.5
        } else {
            0.3
        }
    }

    pub fn consecutive_loss_multiplier(&self) -> f64 {
        match self.consecutive_losses {
            0 | 1 => 1.0,
            2 => 0.9,
            3 => 0.8,
            4 => 0.6,
            _ => 0.4,
        }
    }

    fn atr_ratio(&self, symbol: &str) -> Option<f64> {
        let current = self.current_atr.get(symbol)?;
        let history = self.atr_history.get(symbol)?;
        if history.len() < 20 {
            return None;
        }
        let avg = history.iter().sum::<f64>() / history.len() as f64;
        if avg > 0.0 {
            Some(current / avg)
        } else {
            None
        }
    }

    /// Fraction below the capital peak.
    pub fn drawdown(&self) -> f64 {
        if self.peak_capital <= Decimal::ZERO {
            return 0.0;
        }
        to_f64((self.peak_capital - self.current_capital) / self.peak_capital)
    }

    pub fn update_price(&mut self, symbol: &str, price: Decimal) {
        let history = self
            .price_history
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(HISTORY_LEN));
        history.push_back(to_f64(price));
        while history.len() > HISTORY_LEN {
            history.pop_front();
        }
    }

    pub fn update_atr(&mut self, symbol: &str, atr: Decimal) {
        let value = to_f64(atr);
        self.current_atr.insert(symbol.to_string(), value);
        let history = self.atr_history.entry(symbol.to_string()).or_default();
        history.push_back(value);
        while history.len() > HISTORY_LEN {
            history.pop_front();
        }
    }

    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return Some(1.0);
        }
        let pa = self.price_history.get(a)?;
        let pb = self.price_history.get(b)?;
        if pa.len() < MIN_CORRELATION_POINTS || pb.len() < MIN_CORRELATION_POINTS {
            return None;
        }
        pearson(&returns(pa), &returns(pb))
    }

    fn pairwise_correlations(&self, symbols: &[&str]) -> Vec<f64> {
        let mut out = Vec::new();
        for (i, a) in symbols.iter().enumerate() {
            for b in &symbols[i + 1..] {
                if let Some(c) = self.correlation(a, b) {
                    out.push(c.abs());
                }
            }
        }
        out
    }

    /// Mean absolute correlation between open positions.
    pub fn portfolio_correlation_score(&self) -> f64 {
        if self.positions.len() < 2 {
            return 0.0;
        }
        let symbols: Vec<&str> = self.positions.keys().map(String::as_str).collect();
        mean(&self.pairwise_correlations(&symbols))
    }

    pub fn check_correlation_risk(&self, new_symbol: &str) -> Result<(), String> {
        if self.positions.is_empty() {
            return Ok(());
        }

        let high: Vec<String> = self
            .positions
            .keys()
            .filter_map(|s| {
                self.correlation(new_symbol, s)
                    .filter(|c| c.abs() > MAX_PAIR_CORRELATION)
                    .map(|c| format!("{}({:.2})", s, c.abs()))
            })
            .collect();
        if !high.is_empty() {
            return Err(format!("High correlation with: {}", high.join(", ")));
        }

        let mut symbols: Vec<&str> = self.positions.keys().map(String::as_str).collect();
        if !symbols.contains(&new_symbol) {
            symbols.push(new_symbol);
        }
        let correlations = self.pairwise_correlations(&symbols);
        if !correlations.is_empty() {
            let avg = mean(&correlations);
            if avg > MAX_AVG_CORRELATION {
                return Err(format!("Portfolio correlation too high: {:.2}", avg));
            }
        }
        Ok(())
    }

    pub fn check_sector_limits(&self, new_symbol: &str) -> Result<(), String> {
        let Some(sector) = sector_of(new_symbol) else {
            return Ok(());
        };
        let members: Vec<&str> = self
            .positions
            .keys()
            .filter(|s| sector_of(s) == Some(sector))
            .map(String::as_str)
            .collect();
        if members.len() >= MAX_POSITIONS_PER_SECTOR {
            return Err(format!("Sector {} full: {}", sector, members.join(", ")));
        }
        Ok(())
    }

    pub fn add_position(&mut self, symbol: &str, size: Decimal, entry_price: Decimal) {
        let value = size * entry_price;
        self.positions.insert(
            symbol.to_string(),
            TrackedPosition {
                size,
                entry_price,
                value,
            },
        );
        info!("Risk tracking {} ${}", symbol, value.round_dp(2));
    }

    pub fn update_position(&mut self, symbol: &str, price: Decimal) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            pos.value = pos.size * price;
        }
    }

    pub fn unrealized_pnl(&self, symbol: &str, price: Decimal) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| (price - p.entry_price) * p.size)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn remove_position(&mut self, symbol: &str, realized_pnl: Decimal, is_win: bool) {
        self.positions.remove(symbol);
        self.current_capital += realized_pnl;
        self.peak_capital = self.peak_capital.max(self.current_capital);

        if is_win {
            self.consecutive_wins += 1;
            self.consecutive_losses = 0;
        } else {
            self.consecutive_losses += 1;
            self.consecutive_wins = 0;
        }
    }

    /// Roll the daily and monthly baselines when the calendar moves on.
    pub fn roll_periods(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.last_reset_day {
            self.daily_start_capital = self.current_capital;
            self.last_reset_day = now.date_naive();
            info!("Daily risk reset: capital ${}", self.current_capital.round_dp(2));
        }
        let month = (now.year(), now.month());
        if month != self.last_reset_month {
            self.monthly_start_capital = self.current_capital;
            self.last_reset_month = month;
        }
    }

    fn change_since(&self, start: Decimal) -> f64 {
        if start <= Decimal::ZERO {
            return 0.0;
        }
        to_f64((self.current_capital - start) / start)
    }

    pub fn check_daily_limit(&self) -> Result<String, String> {
        let pnl = self.change_since(self.daily_start_capital);
        if pnl <= -PAUSE_DAILY_LOSS {
            Err(format!("Daily loss limit hit: {:.2}%", pnl * 100.0))
        } else {
            Ok(format!("Daily P&L: {:+.2}%", pnl * 100.0))
        }
    }

    pub fn check_monthly_limit(&self) -> Result<String, String> {
        let pnl = self.change_since(self.monthly_start_capital);
        if pnl <= -PAUSE_MONTHLY_LOSS {
            Err(format!("Monthly loss limit hit: {:.2}%", pnl * 100.0))
        } else {
            Ok(format!("Monthly P&L: {:+.2}%", pnl * 100.0))
        }
    }

    /// `Some(reason)` when new entries should stop.
    pub fn should_pause_trading(&self) -> Option<String> {
        if let Err(reason) = self.check_daily_limit() {
            return Some(format!("PAUSE: {reason}"));
        }
        if let Err(reason) = self.check_monthly_limit() {
            return Some(format!("PAUSE: {reason}"));
        }
        if self.consecutive_losses >= PAUSE_CONSECUTIVE_LOSSES {
            return Some(format!("PAUSE: {} consecutive losses", self.consecutive_losses));
        }
        let dd = self.drawdown();
        if dd > PAUSE_DRAWDOWN {
            return Some(format!("PAUSE: Extreme drawdown {:.1}%", dd * 100.0));
        }
        None
    }

    pub fn portfolio_metrics(&self) -> PortfolioMetrics {
        let capital = to_f64(self.current_capital);
        if self.positions.is_empty() || capital <= 0.0 {
            return PortfolioMetrics {
                total_exposure: 0.0,
                position_count: 0,
                largest_position: 0.0,
                correlation_score: 0.0,
                volatility_regime: "low".to_string(),
                current_drawdown: self.drawdown(),
                daily_var: 0.0,
            };
        }

        let values: Vec<f64> = self.positions.values().map(|p| to_f64(p.value)).collect();
        let total_exposure = values.iter().sum::<f64>() / capital;
        let largest_position = values.iter().cloned().fold(0.0, f64::max) / capital;

        PortfolioMetrics {
            total_exposure,
            position_count: self.positions.len(),
            largest_position,
            correlation_score: self.portfolio_correlation_score(),
            volatility_regime: self.volatility_regime().to_string(),
            current_drawdown: self.drawdown(),
            daily_var: total_exposure * 0.02,
        }
    }

    fn volatility_regime(&self) -> &'static str {
        let ratios: Vec<f64> = self
            .current_atr
            .keys()
            .filter_map(|s| self.atr_ratio(s))
            .collect();
        if ratios.is_empty() {
            return "unknown";
        }
        let avg = mean(&ratios);
        if avg < 0.7 {
            "low"
        } else if avg < 1.3 {
            "medium"
        } else if avg < 2.0 {
            "high"
        } else {
            "extreme"
        }
    }

    pub fn risk_report(&self) -> String {
        let m = self.portfolio_metrics();
        let daily = self.check_daily_limit().unwrap_or_else(|e| e);
        let monthly = self.check_monthly_limit().unwrap_or_else(|e| e);
        let status = match self.should_pause_trading() {
            Some(reason) => format!("TRADING PAUSED: {reason}"),
            None => "Trading Active".to_string(),
        };

        let mut lines = vec!["=".repeat(50), "RISK MANAGER STATUS".to_string(), "=".repeat(50)];
        lines.push(format!(
            "Capital: ${} (Peak: ${})",
            self.current_capital.round_dp(2),
            self.peak_capital.round_dp(2)
        ));
        lines.push(format!("Drawdown: {:.2}%", m.current_drawdown * 100.0));
        lines.push(daily);
        lines.push(monthly);
        lines.push(format!("Open Positions: {}", m.position_count));
        lines.push(format!("Total Exposure: {:.1}%", m.total_exposure * 100.0));
        lines.push(format!("Largest Position: {:.1}%", m.largest_position * 100.0));
        lines.push(format!("Correlation: {:.2}", m.correlation_score));
        lines.push(format!("Volatility Regime: {}", m.volatility_regime.to_uppercase()));
        lines.push(format!("Daily VaR (95%): {:.2}%", m.daily_var * 100.0));
        lines.push(format!("Consecutive Wins: {}", self.consecutive_wins));
        lines.push(format!("Consecutive Losses: {}", self.consecutive_losses));
        lines.push(status);
        lines.push("=".repeat(50));
        lines.join("\n")
    }
}
