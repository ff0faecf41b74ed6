//! Market regime detection and the adaptive engine that learns from it.
//!
//! Each scan classifies a symbol's recent candles into a [`MarketRegime`].
//! The regime picks a parameter set, which is then nudged by the recent win
//! rate and the hour of day. Closed trades are attributed to the regime they
//! were opened in, so performance can be compared per regime and per hour.

use crate::signals::to_f64;
use chrono::{DateTime, Timelike, Utc};
use log::{debug, info};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::{self, Write as _};

/// Candles needed before a regime is called.
pub const MIN_REGIME_CANDLES: usize = 50;
const TREND_LOOKBACK: usize = 30;
const VOLATILITY_WINDOW: usize = 20;
const RECENT_VOLUME_WINDOW: usize = 10;
const RECENT_TRADES: usize = 50;
const DEFAULT_WIN_RATE: f64 = 0.55;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    Bull,
    Bear,
    Ranging,
    Volatile,
    Breakout,
    Unknown,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Bull => "BULL",
            MarketRegime::Bear => "BEAR",
            MarketRegime::Ranging => "RANGING",
            MarketRegime::Volatile => "VOLATILE",
            MarketRegime::Breakout => "BREAKOUT",
            MarketRegime::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyMode {
    Aggressive,
    Defensive,
    Scalping,
    Momentum,
    Safe,
}

impl StrategyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyMode::Aggressive => "AGGRESSIVE",
            StrategyMode::Defensive => "DEFENSIVE",
            StrategyMode::Scalping => "SCALPING",
            StrategyMode::Momentum => "MOMENTUM",
            StrategyMode::Safe => "SAFE",
        }
    }
}

/// What the detector measured, alongside its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegimeReading {
    pub regime: MarketRegime,
    /// Fractional change over the trend lookback.
    pub trend_return: f64,
    /// Standard deviation of the latest candle returns.
    pub volatility: f64,
    pub atr_ratio: f64,
    /// Recent volume against the whole window.
    pub volume_ratio: f64,
}

impl RegimeReading {
    fn unknown() -> Self {
        Self {
            regime: MarketRegime::Unknown,
            trend_return: 0.0,
            volatility: 0.0,
            atr_ratio: 0.0,
            volume_ratio: 1.0,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Classify the market from closes, volumes and the current ATR.
pub fn detect_regime(closes: &[Decimal], volumes: &[Decimal], atr: Decimal) -> RegimeReading {
    if closes.len() < MIN_REGIME_CANDLES {
        return RegimeReading::unknown();
    }
    let prices: Vec<f64> = closes.iter().map(|c| to_f64(*c)).collect();
    if prices.iter().any(|p| *p <= 0.0) {
        return RegimeReading::unknown();
    }

    let returns: Vec<f64> = prices.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect();
    let last = prices[prices.len() - 1];
    let base = prices[prices.len() - TREND_LOOKBACK];
    let trend_return = (last - base) / base;
    let volatility = std_dev(&returns[returns.len().saturating_sub(VOLATILITY_WINDOW)..]);
    let atr_ratio = to_f64(atr) / last;

    let volumes: Vec<f64> = volumes.iter().map(|v| to_f64(*v)).collect();
    let average = mean(&volumes);
    let recent = mean(&volumes[volumes.len().saturating_sub(RECENT_VOLUME_WINDOW)..]);
    let volume_ratio = if average > 0.0 { recent / average } else { 1.0 };

    let regime = classify(trend_return, volatility, atr_ratio, volume_ratio);
    debug!(
        "Regime {}: return {:+.2}%, volatility {:.4}, ATR {:.4}, volume x{:.2}",
        regime,
        trend_return * 100.0,
        volatility,
        atr_ratio,
        volume_ratio
    );
    RegimeReading {
        regime,
        trend_return,
        volatility,
        atr_ratio,
        volume_ratio,
    }
}

// Volatility wins over trend; a breakout needs volume behind a moderate move.
fn classify(trend_return: f64, volatility: f64, atr_ratio: f64, volume_ratio: f64) -> MarketRegime {
    let moved = trend_return.abs();
    if atr_ratio > 0.008 || volatility > 0.03 {
        MarketRegime::Volatile
    } else if trend_return > 0.30 {
        MarketRegime::Bull
    } else if trend_return < -0.30 {
        MarketRegime::Bear
    } else if moved < 0.10 && volatility < 0.015 {
        MarketRegime::Ranging
    } else if volume_ratio > 1.5 && moved > 0.10 && moved < 0.30 {
        MarketRegime::Breakout
    } else {
        MarketRegime::Unknown
    }
}

/// Entry thresholds and sizing for one regime. Percent fields are in percent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimeParameters {
    pub mode: StrategyMode,
    pub min_signal_strength: f64,
    pub min_confluence: u32,
    pub take_profit_percent: f64,
    pub stop_loss_percent: f64,
    pub size_multiplier: f64,
    pub max_hold_secs: i64,
    pub min_volume_ratio: f64,
    pub max_bb_width_percent: f64,
}

impl RegimeParameters {
    pub fn for_regime(regime: MarketRegime) -> Self {
        let (mode, min_signal_strength, min_confluence, take_profit_percent, stop_loss_percent) = match regime {
            MarketRegime::Bull => (StrategyMode::Aggressive, 3.5, 3, 0.8, 0.3),
            MarketRegime::Bear => (StrategyMode::Defensive, 4.2, 4, 0.3, 0.15),
            MarketRegime::Ranging => (StrategyMode::Scalping, 3.8, 3, 0.5, 0.2),
            MarketRegime::Volatile => (StrategyMode::Safe, 4.5, 4, 0.4, 0.15),
            MarketRegime::Breakout => (StrategyMode::Momentum, 4.0, 3, 0.7, 0.25),
            MarketRegime::Unknown => (StrategyMode::Scalping, 3.8, 3, 0.6, 0.35),
        };
        let (size_multiplier, max_hold_secs, min_volume_ratio, max_bb_width_percent) = match regime {
            MarketRegime::Bull => (1.3, 300, 0.7, 0.6),
            MarketRegime::Bear => (0.5, 120, 0.9, 0.3),
            MarketRegime::Ranging => (1.0, 240, 0.8, 0.4),
            MarketRegime::Volatile => (0.4, 90, 1.0, 0.3),
            MarketRegime::Breakout => (1.2, 300, 1.2, 0.5),
            MarketRegime::Unknown => (1.0, 240, 0.8, 0.4),
        };
        Self {
            mode,
            min_signal_strength,
            min_confluence,
            take_profit_percent,
            stop_loss_percent,
            size_multiplier,
            max_hold_secs,
            min_volume_ratio,
            max_bb_width_percent,
        }
    }

    /// Lean in after a winning streak, pull back after a losing one, and
    /// size by liquidity: thin 02-06 UTC, deep 13-17 UTC.
    pub fn adjusted(mut self, win_rate: f64, hour: u32) -> Self {
        if win_rate > 0.65 {
            self.min_signal_strength *= 0.95;
            self.take_profit_percent *= 1.1;
            self.size_multiplier *= 1.1;
        } else if win_rate < 0.50 {
            self.min_signal_strength *= 1.1;
            self.stop_loss_percent *= 0.8;
            self.take_profit_percent *= 0.9;
            self.size_multiplier *= 0.7;
        }

        if (2..6).contains(&hour) {
            self.size_multiplier *= 0.5;
            self.min_volume_ratio = self.min_volume_ratio.max(1.0);
        } else if (13..17).contains(&hour) {
            self.size_multiplier *= 1.2;
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegimeStats {
    pub wins: u32,
    pub losses: u32,
    pub total_pnl: f64,
}

impl RegimeStats {
    pub fn trades(&self) -> u32 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> f64 {
        match self.trades() {
            0 => 0.0,
            n => self.wins as f64 / n as f64 * 100.0,
        }
    }

    pub fn avg_pnl(&self) -> f64 {
        match self.trades() {
            0 => 0.0,
            n => self.total_pnl / n as f64,
        }
    }

    fn add(&mut self, pnl: f64) {
        if pnl > 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.total_pnl += pnl;
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveEngine {
    current: MarketRegime,
    readings: HashMap<String, RegimeReading>,
    recent_wins: VecDeque<bool>,
    recent_pnl: f64,
    by_regime: BTreeMap<MarketRegime, RegimeStats>,
    by_hour: BTreeMap<u32, RegimeStats>,
}

impl Default for AdaptiveEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveEngine {
    pub fn new() -> Self {
        Self {
            current: MarketRegime::Unknown,
            readings: HashMap::new(),
            recent_wins: VecDeque::with_capacity(RECENT_TRADES),
            recent_pnl: 0.0,
            by_regime: BTreeMap::new(),
            by_hour: BTreeMap::new(),
        }
    }

    pub fn observe(&mut self, symbol: &str, reading: RegimeReading) {
        let previous = self
            .readings
            .insert(symbol.to_string(), reading)
            .map(|r| r.regime)
            .unwrap_or(MarketRegime::Unknown);
        if previous != reading.regime {
            info!("{} regime {} -> {}", symbol, previous, reading.regime);
        }
        self.current = reading.regime;
    }

    /// Regime of the most recently scanned symbol.
    pub fn current(&self) -> MarketRegime {
        self.current
    }

    pub fn regime_of(&self, symbol: &str) -> MarketRegime {
        self.readings
            .get(symbol)
            .map(|r| r.regime)
            .unwrap_or(MarketRegime::Unknown)
    }

    /// Win rate over the last 50 trades as a fraction.
    pub fn win_rate(&self) -> f64 {
        if self.recent_wins.is_empty() {
            return DEFAULT_WIN_RATE;
        }
        self.recent_wins.iter().filter(|w| **w).count() as f64 / self.recent_wins.len() as f64
    }

    pub fn parameters(&self, regime: MarketRegime, now: DateTime<Utc>) -> RegimeParameters {
        RegimeParameters::for_regime(regime).adjusted(self.win_rate(), now.hour())
    }

    /// Attribute a closed trade to the regime and UTC hour it was opened in.
    pub fn record_trade(&mut self, regime: MarketRegime, pnl: f64, entry_time: DateTime<Utc>) {
        if self.recent_wins.len() == RECENT_TRADES {
            self.recent_wins.pop_front();
        }
        self.recent_wins.push_back(pnl > 0.0);
        self.recent_pnl += pnl;
        self.by_regime.entry(regime).or_default().add(pnl);
        self.by_hour.entry(entry_time.hour()).or_default().add(pnl);
    }

    pub fn regime_performance(&self) -> &BTreeMap<MarketRegime, RegimeStats> {
        &self.by_regime
    }

    /// Hours with the best average PnL, best first.
    pub fn best_hours(&self, n: usize) -> Vec<(u32, f64)> {
        let mut hours: Vec<(u32, f64)> = self
            .by_hour
            .iter()
            .map(|(hour, stats)| (*hour, stats.avg_pnl()))
            .collect();
        hours.sort_by(|a, b| b.1.total_cmp(&a.1));
        hours.truncate(n);
        hours
    }

    pub fn report(&self, now: DateTime<Utc>) -> String {
        let params = self.parameters(self.current, now);
        let mut out = String::new();
        let _ = writeln!(out, "{}", "=".repeat(50));
        let _ = writeln!(out, "ADAPTIVE STRATEGY STATUS");
        let _ = writeln!(out, "{}", "=".repeat(50));
        let _ = writeln!(out, "Market regime:   {}", self.current);
        let _ = writeln!(out, "Strategy mode:   {}", params.mode.as_str());
        let _ = writeln!(
            out,
            "Signal >= {:.1}, TP {:.2}%, SL {:.2}%, size x{:.2}",
            params.min_signal_strength, params.take_profit_percent, params.stop_loss_percent, params.size_multiplier
        );
        let _ = writeln!(out, "Win rate (last {}): {:.1}%", RECENT_TRADES, self.win_rate() * 100.0);
        let _ = writeln!(out, "Recorded PnL:    {:+.2}", self.recent_pnl);

        if !self.by_regime.is_empty() {
            let _ = writeln!(out, "\nBy regime:");
            for (regime, stats) in &self.by_regime {
                let _ = writeln!(
                    out,
                    "  {:<9} {:>4} trades, {:>5.1}% WR, {:+.2} avg",
                    regime.as_str(),
                    stats.trades(),
                    stats.win_rate(),
                    stats.avg_pnl()
                );
            }
        }
        let best = self.best_hours(3);
        if !best.is_empty() {
            let _ = writeln!(out, "\nBest hours (UTC):");
            for (hour, avg) in best {
                let _ = writeln!(out, "  {:02}:00  {:+.2} avg", hour, avg);
            }
        }
        let _ = write!(out, "{}", "=".repeat(50));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn series(count: usize, f: impl Fn(usize) -> f64) -> Vec<Decimal> {
        (0..count)
            .map(|i| Decimal::from_f64_retain(f(i)).unwrap().round_dp(6))
            .collect()
    }

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, hour, 10, 0).unwrap()
    }

    #[test]
    fn short_history_is_unknown() {
        let closes = series(49, |_| 100.0);
        let reading = detect_regime(&closes, &closes, dec!(0.1));
        assert_eq!(reading.regime, MarketRegime::Unknown);
    }

    #[test]
    fn flat_quiet_market_is_ranging() {
        let closes = series(100, |i| 100.0 + if i % 2 == 0 { 0.05 } else { -0.05 });
        let volumes = vec![dec!(10); 100];
        let reading = detect_regime(&closes, &volumes, dec!(0.1));
        assert_eq!(reading.regime, MarketRegime::Ranging);
        assert!((reading.volume_ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn wide_atr_is_volatile() {
        let closes = series(100, |_| 100.0);
        let reading = detect_regime(&closes, &[], dec!(1));
        assert_eq!(reading.regime, MarketRegime::Volatile);
    }

    #[test]
    fn steady_climb_is_bull_and_slide_is_bear() {
        // ~1% per candle keeps volatility low while the 30 candle move tops 30%
        let up = series(100, |i| 100.0 * 1.01_f64.powi(i as i32));
        assert_eq!(detect_regime(&up, &[], dec!(0.1)).regime, MarketRegime::Bull);

        let down = series(100, |i| 100.0 * 0.985_f64.powi(i as i32));
        assert_eq!(detect_regime(&down, &[], Decimal::ZERO).regime, MarketRegime::Bear);
    }

    #[test]
    fn volume_surge_on_moderate_move_is_breakout() {
        let closes = series(100, |i| 100.0 * 1.006_f64.powi(i as i32));
        let volumes = series(100, |i| if i >= 90 { 400.0 } else { 100.0 });
        let reading = detect_regime(&closes, &volumes, dec!(0.1));
        assert!(reading.trend_return > 0.10 && reading.trend_return < 0.30);
        assert_eq!(reading.regime, MarketRegime::Breakout);
    }

    #[test]
    fn parameters_follow_performance_and_hour() {
        let base = RegimeParameters::for_regime(MarketRegime::Bear);
        assert_eq!(base.mode, StrategyMode::Defensive);

        let losing = base.clone().adjusted(0.4, 10);
        assert!((losing.min_signal_strength - 4.62).abs() < 1e-9);
        assert!((losing.size_multiplier - 0.35).abs() < 1e-9);

        let night = base.clone().adjusted(0.55, 3);
        assert!((night.size_multiplier - 0.25).abs() < 1e-9);
        assert_eq!(night.min_volume_ratio, 1.0);

        let overlap = base.adjusted(0.7, 14);
        assert!((overlap.size_multiplier - 0.66).abs() < 1e-9);
    }

    #[test]
    fn engine_tracks_regimes_and_hours() {
        let mut engine = AdaptiveEngine::new();
        assert_eq!(engine.win_rate(), DEFAULT_WIN_RATE);

        let mut reading = RegimeReading::unknown();
        reading.regime = MarketRegime::Ranging;
        engine.observe("BTCUSDT", reading);
        assert_eq!(engine.current(), MarketRegime::Ranging);
        assert_eq!(engine.regime_of("BTCUSDT"), MarketRegime::Ranging);
        assert_eq!(engine.regime_of("ETHUSDT"), MarketRegime::Unknown);

        engine.record_trade(MarketRegime::Ranging, 2.0, at_hour(14));
        engine.record_trade(MarketRegime::Ranging, -1.0, at_hour(14));
        engine.record_trade(MarketRegime::Bull, 3.0, at_hour(9));
        engine.record_trade(MarketRegime::Bull, -0.5, at_hour(3));

        let ranging = &engine.regime_performance()[&MarketRegime::Ranging];
        assert_eq!(ranging.trades(), 2);
        assert_eq!(ranging.win_rate(), 50.0);
        assert_eq!(engine.win_rate(), 0.5);

        let best = engine.best_hours(2);
        assert_eq!(best, vec![(9, 3.0), (14, 0.5)]);

        let report = engine.report(at_hour(10));
        assert!(report.contains("RANGING"));
        assert!(report.contains("09:00"));
    }

    #[test]
    fn win_rate_window_is_bounded() {
        let mut engine = AdaptiveEngine::new();
        for _ in 0..RECENT_TRADES {
            engine.record_trade(MarketRegime::Unknown, -1.0, at_hour(1));
        }
        for _ in 0..RECENT_TRADES {
            engine.record_trade(MarketRegime::Unknown, 1.0, at_hour(1));
        }
        assert_eq!(engine.win_rate(), 1.0);
        assert_eq!(engine.regime_performance()[&MarketRegime::Unknown].trades(), 100);
    }
}
