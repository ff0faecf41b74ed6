//! Walk-forward testing: the same strategy backtested on consecutive
//! fixed-length windows, then summarised for consistency.

use crate::backtester::{BacktestConfig, Backtester};
use crate::market_data::Candle;
use crate::metrics::PerformanceMetrics;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// `count` back-to-back windows of `period_days`, newest first, the first
/// one ending at `end`.
pub fn windows(end: DateTime<Utc>, period_days: i64, count: usize) -> Vec<Window> {
    (0..count)
        .map(|i| {
            let window_end = end - Duration::days(i as i64 * period_days);
            Window {
                start: window_end - Duration::days(period_days),
                end: window_end,
            }
        })
        .collect()
}

fn slice(data: &BTreeMap<String, Vec<Candle>>, window: &Window) -> BTreeMap<String, Vec<Candle>> {
    let (from, to) = (window.start.timestamp_millis(), window.end.timestamp_millis());
    data.iter()
        .map(|(symbol, candles)| {
            let inside: Vec<Candle> = candles
                .iter()
                .filter(|c| c.open_time >= from && c.open_time < to)
                .cloned()
                .collect();
            (symbol.clone(), inside)
        })
        .filter(|(_, candles)| !candles.is_empty())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodResult {
    pub period: usize,
    pub window: Window,
    pub metrics: PerformanceMetrics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Spread {
    pub mean: f64,
    pub best: f64,
    pub worst: f64,
}

impl Spread {
    /// Finite values only; `higher_is_better` picks which end is "best".
    fn of(values: impl Iterator<Item = f64>, higher_is_better: bool) -> Self {
        let values: Vec<f64> = values.filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return Self::default();
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let max = values.iter().copied().fold(f64::MIN, f64::max);
        let min = values.iter().copied().fold(f64::MAX, f64::min);
        let (best, worst) = if higher_is_better { (max, min) } else { (min, max) };
        Self { mean, best, worst }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WalkForwardSummary {
    pub periods: usize,
    pub profitable_periods: usize,
    pub consistency_percent: f64,
    pub return_percent: Spread,
    pub return_std_dev: f64,
    pub win_rate: Spread,
    pub profit_factor: Spread,
    pub max_drawdown_percent: Spread,
}

impl WalkForwardSummary {
    pub fn from_periods(periods: &[PeriodResult]) -> Self {
        if periods.is_empty() {
            return Self::default();
        }
        let returns: Vec<f64> = periods.iter().map(|p| p.metrics.total_return_percent).collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let profitable = returns.iter().filter(|r| **r > 0.0).count();

        Self {
            periods: periods.len(),
            profitable_periods: profitable,
            consistency_percent: profitable as f64 / periods.len() as f64 * 100.0,
            return_percent: Spread::of(returns.iter().copied(), true),
            return_std_dev: variance.sqrt(),
            win_rate: Spread::of(periods.iter().map(|p| p.metrics.win_rate), true),
            profit_factor: Spread::of(periods.iter().map(|p| p.metrics.profit_factor), true),
            max_drawdown_percent: Spread::of(periods.iter().map(|p| p.metrics.max_drawdown_percent), false),
        }
    }

    pub fn verdict(&self) -> &'static str {
        match self.consistency_percent {
            c if c >= 75.0 => "Excellent consistency",
            c if c >= 60.0 => "Good consistency",
            c if c >= 50.0 => "Moderate consistency",
            _ => "Poor consistency, strategy may not be robust",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardReport {
    pub test_date: DateTime<Utc>,
    pub symbols: Vec<String>,
    pub period_days: i64,
    pub initial_balance: f64,
    pub results: Vec<PeriodResult>,
    pub summary: WalkForwardSummary,
}

impl WalkForwardReport {
    pub fn text(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(80);
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "{:^80}", "WALK-FORWARD ANALYSIS");
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Symbols: {}  Period: {} days", self.symbols.join(", "), self.period_days);

        for result in &self.results {
            let m = &result.metrics;
            let _ = writeln!(
                out,
                "Period {} ({} to {}): return {:+.2}%, {} trades, WR {:.1}%, PF {:.2}, DD {:.2}%",
                result.period,
                result.window.start.format("%Y-%m-%d"),
                result.window.end.format("%Y-%m-%d"),
                m.total_return_percent,
                m.total_trades,
                m.win_rate,
                m.profit_factor,
                m.max_drawdown_percent
            );
        }

        let s = &self.summary;
        let _ = writeln!(
            out,
            "\nReturn %:      avg {:+.2}, best {:+.2}, worst {:+.2}, std {:.2}",
            s.return_percent.mean, s.return_percent.best, s.return_percent.worst, s.return_std_dev
        );
        let _ = writeln!(
            out,
            "Win rate %:    avg {:.1}, best {:.1}, worst {:.1}",
            s.win_rate.mean, s.win_rate.best, s.win_rate.worst
        );
        let _ = writeln!(
            out,
            "Profit factor: avg {:.2}, best {:.2}, worst {:.2}",
            s.profit_factor.mean, s.profit_factor.best, s.profit_factor.worst
        );
        let _ = writeln!(
            out,
            "Max DD %:      avg {:.2}, best {:.2}, worst {:.2}",
            s.max_drawdown_percent.mean, s.max_drawdown_percent.best, s.max_drawdown_percent.worst
        );
        let _ = writeln!(
            out,
            "\nProfitable periods: {}/{} ({:.1}%) - {}",
            s.profitable_periods, s.periods, s.consistency_percent, s.verdict()
        );
        let _ = write!(out, "{rule}");
        out
    }
}

/// Backtest every window with a fresh engine and the same config.
/// Windows without candles are skipped.
pub fn run(
    base: &BacktestConfig,
    data: &BTreeMap<String, Vec<Candle>>,
    windows: &[Window],
) -> Result<WalkForwardReport> {
    let mut results = Vec::new();
    for (i, window) in windows.iter().enumerate() {
        let period = i + 1;
        let sliced = slice(data, window);
        if sliced.is_empty() {
            warn!(
                "Period {}/{} ({} to {}) has no data, skipping",
                period,
                windows.len(),
                window.start.date_naive(),
                window.end.date_naive()
            );
            continue;
        }
        info!("Period {}/{}: {} to {}", period, windows.len(), window.start.date_naive(), window.end.date_naive());

        let config = BacktestConfig {
            start_date: window.start.format("%Y-%m-%d").to_string(),
            end_date: window.end.format("%Y-%m-%d").to_string(),
            ..base.clone()
        };
        let backtest = Backtester::new(config).run(&sliced)?;
        results.push(PeriodResult {
            period,
            window: *window,
            metrics: PerformanceMetrics::calculate(&backtest),
        });
    }
    if results.is_empty() {
        return Err(anyhow!("No walk-forward period had historical data"));
    }

    let summary = WalkForwardSummary::from_periods(&results);
    Ok(WalkForwardReport {
        test_date: Utc::now(),
        symbols: data.keys().cloned().collect(),
        period_days: windows
            .first()
            .map(|w| (w.end - w.start).num_days())
            .unwrap_or_default(),
        initial_balance: crate::signals::to_f64(base.initial_balance),
        results,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metrics(ret: f64, win_rate: f64, profit_factor: f64, drawdown: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            total_return_percent: ret,
            win_rate,
            profit_factor,
            max_drawdown_percent: drawdown,
            ..Default::default()
        }
    }

    fn period(n: usize, m: PerformanceMetrics) -> PeriodResult {
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        PeriodResult {
            period: n,
            window: windows(end, 7, n)[n - 1],
            metrics: m,
        }
    }

    #[test]
    fn windows_run_backwards_from_end() {
        let end = Utc.with_ymd_and_hms(2024, 1, 29, 0, 0, 0).unwrap();
        let w = windows(end, 7, 4);
        assert_eq!(w.len(), 4);
        assert_eq!(w[0].end, end);
        assert_eq!(w[0].start, Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap());
        assert_eq!(w[3].start, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(w.windows(2).all(|pair| pair[1].end == pair[0].start));
    }

    #[test]
    fn summary_ignores_infinite_profit_factor() {
        let periods = vec![
            period(1, metrics(4.0, 60.0, f64::INFINITY, 1.0)),
            period(2, metrics(-2.0, 40.0, 0.5, 3.0)),
            period(3, metrics(1.0, 55.0, 1.5, 2.0)),
            period(4, metrics(3.0, 65.0, 2.5, 0.5)),
        ];
        let summary = WalkForwardSummary::from_periods(&periods);

        assert_eq!(summary.profitable_periods, 3);
        assert_eq!(summary.consistency_percent, 75.0);
        assert_eq!(summary.verdict(), "Excellent consistency");
        assert!((summary.return_percent.mean - 1.5).abs() < 1e-9);
        assert_eq!(summary.return_percent.worst, -2.0);
        assert!((summary.profit_factor.mean - 1.5).abs() < 1e-9);
        assert_eq!(summary.profit_factor.best, 2.5);
        // Smaller drawdown is better
        assert_eq!(summary.max_drawdown_percent.best, 0.5);
        assert_eq!(summary.max_drawdown_percent.worst, 3.0);
        assert!(summary.return_std_dev > 0.0);
    }

    #[test]
    fn verdict_thresholds() {
        let mut summary = WalkForwardSummary {
            consistency_percent: 60.0,
            ..Default::default()
        };
        assert_eq!(summary.verdict(), "Good consistency");
        summary.consistency_percent = 50.0;
        assert_eq!(summary.verdict(), "Moderate consistency");
        summary.consistency_percent = 25.0;
        assert!(summary.verdict().starts_with("Poor"));
    }
}
