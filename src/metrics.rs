//! Performance statistics over a finished backtest.

use crate::backtester::{BacktestResults, BacktestTrade, EquityPoint};
use crate::signals::to_f64;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Timelike};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

fn float_or_label<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else {
        serializer.serialize_str("inf")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStats {
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
}

impl GroupStats {
    fn add(&mut self, pnl: f64) {
        self.trades += 1;
        if pnl > 0.0 {
            self.wins += 1;
        }
        self.total_pnl += pnl;
    }

    fn finish(&mut self) {
        if self.trades > 0 {
            self.win_rate = self.wins as f64 / self.trades as f64 * 100.0;
            self.avg_pnl = self.total_pnl / self.trades as f64;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub breakeven_trades: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net_profit: f64,
    #[serde(serialize_with = "float_or_label")]
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub expectancy: f64,
    #[serde(serialize_with = "float_or_label")]
    pub risk_reward_ratio: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub largest_win_percent: f64,
    pub largest_loss_percent: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub sharpe_ratio: f64,
    pub avg_trade_duration_secs: f64,
    pub total_return_percent: f64,
    pub total_fees: f64,
    pub initial_balance: f64,
    pub final_balance: f64,
    pub by_symbol: BTreeMap<String, GroupStats>,
    pub by_hour: BTreeMap<u32, GroupStats>,
    pub by_weekday: BTreeMap<String, GroupStats>,
}

impl PerformanceMetrics {
    pub fn calculate(results: &BacktestResults) -> Self {
        let initial = to_f64(results.initial_balance);
        let final_balance = to_f64(results.final_balance);
        let mut m = Self {
            initial_balance: initial,
            final_balance,
            total_return_percent: if initial > 0.0 {
                (final_balance - initial) / initial * 100.0
            } else {
                0.0
            },
            ..Self::default()
        };

        let (drawdown, drawdown_percent) = max_drawdown(&results.equity_curve);
        m.max_drawdown = drawdown;
        m.max_drawdown_percent = drawdown_percent;
        m.sharpe_ratio = sharpe_ratio(&daily_returns(&results.equity_curve));

        let trades = &results.trades;
        if trades.is_empty() {
            return m;
        }

        let pnls: Vec<f64> = trades.iter().map(|t| to_f64(t.pnl)).collect();
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();

        m.total_trades = trades.len();
        m.winning_trades = wins.len();
        m.losing_trades = losses.len();
        m.breakeven_trades = m.total_trades - m.winning_trades - m.losing_trades;
        m.win_rate = m.winning_trades as f64 / m.total_trades as f64 * 100.0;

        m.gross_profit = wins.iter().sum();
        m.gross_loss = losses.iter().sum::<f64>().abs();
        m.net_profit = pnls.iter().sum();
        m.profit_factor = if m.gross_loss > 0.0 {
            m.gross_profit / m.gross_loss
        } else if m.gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        m.avg_win = mean(&wins);
        m.avg_loss = mean(&losses).abs();
        let win_fraction = m.win_rate / 100.0;
        m.expectancy = win_fraction * m.avg_win - (1.0 - win_fraction) * m.avg_loss;
        m.risk_reward_ratio = if m.avg_loss > 0.0 {
            m.avg_win / m.avg_loss
        } else if m.avg_win > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        m.largest_win = wins.iter().copied().fold(0.0, f64::max);
        m.largest_loss = losses.iter().copied().fold(0.0, f64::min);
        let percents: Vec<f64> = trades.iter().map(|t| to_f64(t.pnl_percent)).collect();
        m.largest_win_percent = percents.iter().copied().fold(0.0, f64::max);
        m.largest_loss_percent = percents.iter().copied().fold(0.0, f64::min);

        let durations: Vec<f64> = trades.iter().map(|t| t.duration_secs() as f64).collect();
        m.avg_trade_duration_secs = mean(&durations);
        m.total_fees = to_f64(trades.iter().map(|t| t.commission).sum::<Decimal>());

        for (trade, pnl) in trades.iter().zip(&pnls) {
            m.by_symbol.entry(trade.symbol.clone()).or_default().add(*pnl);
            m.by_hour.entry(trade.entry_time.hour()).or_default().add(*pnl);
            m.by_weekday
                .entry(trade.entry_time.format("%A").to_string())
                .or_default()
                .add(*pnl);
        }
        m.by_symbol.values_mut().for_each(GroupStats::finish);
        m.by_hour.values_mut().for_each(GroupStats::finish);
        m.by_weekday.values_mut().for_each(GroupStats::finish);

        m
    }

    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== PERFORMANCE REPORT ===");
        let _ = writeln!(out, "Initial balance:   {:.2} USDT", self.initial_balance);
        let _ = writeln!(out, "Final balance:     {:.2} USDT", self.final_balance);
        let _ = writeln!(out, "Total return:      {:+.2}%", self.total_return_percent);
        let _ = writeln!(out, "Net profit:        {:+.4} USDT", self.net_profit);
        let _ = writeln!(out, "Fees paid:         {:.4} USDT", self.total_fees);
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Trades: {} (W {} / L {} / BE {})",
            self.total_trades, self.winning_trades, self.losing_trades, self.breakeven_trades
        );
        let _ = writeln!(out, "Win rate:          {:.2}%", self.win_rate);
        let _ = writeln!(out, "Profit factor:     {}", format_ratio(self.profit_factor));
        let _ = writeln!(out, "Risk:reward:       {}", format_ratio(self.risk_reward_ratio));
        let _ = writeln!(out, "Avg win / loss:    {:.4} / {:.4}", self.avg_win, self.avg_loss);
        let _ = writeln!(out, "Expectancy:        {:.4}", self.expectancy);
        let _ = writeln!(
            out,
            "Largest win:       {:.4} ({:+.2}%)",
            self.largest_win, self.largest_win_percent
        );
        let _ = writeln!(
            out,
            "Largest loss:      {:.4} ({:+.2}%)",
            self.largest_loss, self.largest_loss_percent
        );
        let _ = writeln!(
            out,
            "Max drawdown:      {:.4} ({:.2}%)",
            self.max_drawdown, self.max_drawdown_percent
        );
        let _ = writeln!(out, "Sharpe ratio:      {:.3}", self.sharpe_ratio);
        let _ = writeln!(out, "Avg duration:      {:.0}s", self.avg_trade_duration_secs);

        if !self.by_symbol.is_empty() {
            let _ = writeln!(out, "\n--- By symbol ---");
            for (symbol, s) in &self.by_symbol {
                let _ = writeln!(
                    out,
                    "{:<10} {:>4} trades  {:>6.1}% win  {:+.4} USDT",
                    symbol, s.trades, s.win_rate, s.total_pnl
                );
            }
        }
        if !self.by_hour.is_empty() {
            let _ = writeln!(out, "\n--- By hour (UTC) ---");
            for (hour, s) in &self.by_hour {
                let _ = writeln!(
                    out,
                    "{:02}:00 {:>4} trades  {:>6.1}% win  {:+.4} USDT",
                    hour, s.trades, s.win_rate, s.total_pnl
                );
            }
        }
        if !self.by_weekday.is_empty() {
            let _ = writeln!(out, "\n--- By weekday ---");
            for (day, s) in &self.by_weekday {
                let _ = writeln!(
                    out,
                    "{:<10} {:>4} trades  {:>6.1}% win  {:+.4} USDT",
                    day, s.trades, s.win_rate, s.total_pnl
                );
            }
        }
        out
    }
}

fn format_ratio(value: f64) -> String {
    if value.is_finite() {
        format!("{:.2}", value)
    } else {
        "∞".to_string()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Largest peak-to-trough fall of equity, absolute and as percent of the peak.
pub fn max_drawdown(curve: &[EquityPoint]) -> (f64, f64) {
    let mut peak = f64::MIN;
    let mut worst = 0.0;
    let mut worst_percent = 0.0;
    for point in curve {
        let equity = to_f64(point.equity);
        peak = peak.max(equity);
        let drawdown = peak - equity;
        if drawdown > worst {
            worst = drawdown;
        }
        if peak > 0.0 {
            worst_percent = f64::max(worst_percent, drawdown / peak * 100.0);
        }
    }
    (worst, worst_percent)
}

/// Returns between end-of-day equity values.
pub fn daily_returns(curve: &[EquityPoint]) -> Vec<f64> {
    let mut closes: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for point in curve {
        closes.insert(point.timestamp.date_naive(), to_f64(point.equity));
    }
    let values: Vec<f64> = closes.into_values().collect();
    values
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Annualised over 365 days; zero when returns have no spread.
pub fn sharpe_ratio(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let avg = mean(returns);
    let variance = returns.iter().map(|r| (r - avg).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    let std = variance.sqrt();
    if std == 0.0 {
        0.0
    } else {
        avg / std * 365f64.sqrt()
    }
}

#[derive(Debug, Serialize)]
struct TradeRow<'a> {
    id: u64,
    symbol: &'a str,
    side: &'a str,
    entry_time: String,
    exit_time: String,
    entry_price: Decimal,
    exit_price: Decimal,
    quantity: Decimal,
    commission: Decimal,
    pnl: Decimal,
    pnl_percent: Decimal,
    exit_reason: &'a str,
    duration_secs: i64,
}

impl<'a> From<&'a BacktestTrade> for TradeRow<'a> {
    fn from(t: &'a BacktestTrade) -> Self {
        Self {
            id: t.id,
            symbol: &t.symbol,
            side: t.side.as_str(),
            entry_time: t.entry_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            exit_time: t.exit_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry_price: t.entry_price.round_dp(8),
            exit_price: t.exit_price.round_dp(8),
            quantity: t.quantity,
            commission: t.commission.round_dp(8),
            pnl: t.pnl.round_dp(8),
            pnl_percent: t.pnl_percent.round_dp(4),
            exit_reason: &t.exit_reason,
            duration_secs: t.duration_secs(),
        }
    }
}

pub fn export_trades_csv(trades: &[BacktestTrade], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for trade in trades {
        writer.serialize(TradeRow::from(trade))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::Side;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn trade(id: u64, symbol: &str, pnl: Decimal, hour: u32) -> BacktestTrade {
        let entry_time = Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap();
        BacktestTrade {
            id,
            symbol: symbol.to_string(),
            side: Side::Buy,
            entry_time,
            exit_time: entry_time + Duration::minutes(10),
            entry_price: dec!(100),
            exit_price: dec!(100) + pnl,
            quantity: dec!(1),
            commission: dec!(0.2),
            pnl,
            pnl_percent: pnl,
            exit_reason: "TAKE_PROFIT".to_string(),
        }
    }

    fn point(day: u32, equity: Decimal) -> EquityPoint {
        EquityPoint {
            timestamp: Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap(),
            balance: equity,
            equity,
            open_positions: 0,
        }
    }

    fn results(trades: Vec<BacktestTrade>, equity: Vec<EquityPoint>) -> BacktestResults {
        let net: Decimal = trades.iter().map(|t| t.pnl).sum();
        BacktestResults {
            initial_balance: dec!(1000),
            final_balance: dec!(1000) + net,
            total_commission: Decimal::ZERO,
            total_slippage: Decimal::ZERO,
            trades,
            equity_curve: equity,
        }
    }

    #[test]
    fn counts_and_ratios() {
        let m = PerformanceMetrics::calculate(&results(
            vec![
                trade(1, "BTCUSDT", dec!(4), 9),
                trade(2, "BTCUSDT", dec!(-2), 9),
                trade(3, "ETHUSDT", dec!(2), 14),
                trade(4, "ETHUSDT", dec!(0), 14),
            ],
            vec![],
        ));
        assert_eq!(m.total_trades, 4);
        assert_eq!((m.winning_trades, m.losing_trades, m.breakeven_trades), (2, 1, 1));
        assert_eq!(m.win_rate, 50.0);
        assert_eq!(m.profit_factor, 3.0);
        assert_eq!(m.avg_win, 3.0);
        assert_eq!(m.avg_loss, 2.0);
        assert_eq!(m.expectancy, 0.5);
        assert_eq!(m.largest_loss, -2.0);
        assert_eq!(m.avg_trade_duration_secs, 600.0);
        assert!((m.total_fees - 0.8).abs() < 1e-9);
        assert!((m.total_return_percent - 0.4).abs() < 1e-9);
        assert_eq!(m.by_symbol["BTCUSDT"].trades, 2);
        assert_eq!(m.by_hour[&14].wins, 1);
        assert_eq!(m.by_weekday["Monday"].trades, 4);
    }

    #[test]
    fn no_losses_means_infinite_profit_factor() {
        let m = PerformanceMetrics::calculate(&results(vec![trade(1, "BTCUSDT", dec!(1), 10)], vec![]));
        assert!(m.profit_factor.is_infinite());
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["profit_factor"], "inf");
        assert!(m.report().contains("Profit factor:     ∞"));
    }

    #[test]
    fn drawdown_and_sharpe_from_equity() {
        let curve = vec![
            point(1, dec!(1000)),
            point(2, dec!(1100)),
            point(3, dec!(990)),
            point(4, dec!(1050)),
        ];
        let (abs, pct) = max_drawdown(&curve);
        assert!((abs - 110.0).abs() < 1e-9);
        assert!((pct - 10.0).abs() < 1e-9);

        let returns = daily_returns(&curve);
        assert_eq!(returns.len(), 3);
        assert!(sharpe_ratio(&returns).is_finite());
        assert_eq!(sharpe_ratio(&[0.01, 0.01]), 0.0);
    }

    #[test]
    fn exports_trades_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.csv");
        export_trades_csv(&[trade(1, "BTCUSDT", dec!(1.5), 10)], &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("id,symbol,side,entry_time"));
        let row = lines.next().unwrap();
        assert!(row.contains("BTCUSDT,BUY,2024-01-01 10:00:00"));
        assert!(row.ends_with("TAKE_PROFIT,600"));
    }
}
