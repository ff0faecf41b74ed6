//! Side-by-side comparison of saved backtest results.

use crate::backtester::BacktestResults;
use crate::metrics::PerformanceMetrics;
use anyhow::{anyhow, bail, Context, Result};
use log::info;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const METRIC_NAMES: [&str; 6] = [
    "total_return_percent",
    "win_rate",
    "sharpe_ratio",
    "profit_factor",
    "max_drawdown_percent",
    "total_trades",
];

#[derive(Debug, Clone)]
pub struct NamedResult {
    pub name: String,
    pub metrics: PerformanceMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Spread {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl Spread {
    fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        Some(Self {
            mean: values.iter().sum::<f64>() / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonSummary {
    pub count: usize,
    pub total_return: Spread,
    pub win_rate: Spread,
    pub sharpe_ratio: Spread,
}

fn metric_value(metrics: &PerformanceMetrics, metric: &str) -> Option<f64> {
    let value = match metric {
        "total_return_percent" => metrics.total_return_percent,
        "win_rate" => metrics.win_rate,
        "sharpe_ratio" => metrics.sharpe_ratio,
        "profit_factor" => metrics.profit_factor,
        "max_drawdown_percent" => metrics.max_drawdown_percent,
        "total_trades" => metrics.total_trades as f64,
        "net_profit" => metrics.net_profit,
        "expectancy" => metrics.expectancy,
        _ => return None,
    };
    Some(value)
}

/// Lower is better for drawdown, higher for everything else.
fn lower_is_better(metric: &str) -> bool {
    metric == "max_drawdown_percent"
}

#[derive(Debug, Default)]
pub struct BacktestComparison {
    results: Vec<NamedResult>,
}

impl BacktestComparison {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, results: &BacktestResults) {
        self.results.push(NamedResult {
            name: name.into(),
            metrics: PerformanceMetrics::calculate(results),
        });
    }

    /// Load a results JSON file, named after its file stem.
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let results: BacktestResults = serde_json::from_str(&text)
            .with_context(|| format!("{} is not a backtest result file", path.display()))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        info!("Loaded {} ({} trades)", name, results.trades.len());
        self.add(name, &results);
        Ok(())
    }

    pub fn load_files(paths: &[PathBuf]) -> Result<Self> {
        let mut comparison = Self::new();
        for path in paths {
            comparison.add_file(path)?;
        }
        Ok(comparison)
    }

    pub fn results(&self) -> &[NamedResult] {
        &self.results
    }

    pub fn best_by(&self, metric: &str) -> Result<&NamedResult> {
        if metric_value(&PerformanceMetrics::default(), metric).is_none() {
            bail!("Unknown metric {:?}", metric);
        }
        let value = |r: &NamedResult| metric_value(&r.metrics, metric).unwrap_or(f64::NAN);
        let best = if lower_is_better(metric) {
            self.results.iter().min_by(|a, b| value(a).total_cmp(&value(b)))
        } else {
            self.results.iter().max_by(|a, b| value(a).total_cmp(&value(b)))
        };
        best.ok_or_else(|| anyhow!("No results to compare"))
    }

    pub fn summary(&self) -> Option<ComparisonSummary> {
        let collect = |f: fn(&PerformanceMetrics) -> f64| -> Vec<f64> {
            self.results.iter().map(|r| f(&r.metrics)).collect()
        };
        Some(ComparisonSummary {
            count: self.results.len(),
            total_return: Spread::of(&collect(|m| m.total_return_percent))?,
            win_rate: Spread::of(&collect(|m| m.win_rate))?,
            sharpe_ratio: Spread::of(&collect(|m| m.sharpe_ratio))?,
        })
    }

    pub fn table(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{:<24}", "name");
        for metric in METRIC_NAMES {
            let _ = write!(out, " {:>20}", metric);
        }
        let _ = writeln!(out);
        for result in &self.results {
            let _ = write!(out, "{:<24}", result.name);
            for metric in METRIC_NAMES {
                let value = metric_value(&result.metrics, metric).unwrap_or(0.0);
                let _ = write!(out, " {:>20}", format_value(value));
            }
            let _ = writeln!(out);
        }
        out
    }

    pub fn export_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut header = vec!["name"];
        header.extend(METRIC_NAMES);
        writer.write_record(&header)?;
        for result in &self.results {
            let mut record = vec![result.name.clone()];
            for metric in METRIC_NAMES {
                record.push(format_value(metric_value(&result.metrics, metric).unwrap_or(0.0)));
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn format_value(value: f64) -> String {
    if value.is_finite() {
        format!("{:.2}", value)
    } else {
        "inf".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtester::{BacktestTrade, EquityPoint};
    use crate::signals::Side;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn results(pnls: &[Decimal]) -> BacktestResults {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        let trades = pnls
            .iter()
            .enumerate()
            .map(|(i, pnl)| BacktestTrade {
                id: i as u64 + 1,
                symbol: "BTCUSDT".into(),
                side: Side::Buy,
                entry_time: t,
                exit_time: t,
                entry_price: dec!(100),
                exit_price: dec!(100),
                quantity: dec!(1),
                commission: Decimal::ZERO,
                pnl: *pnl,
                pnl_percent: *pnl,
                exit_reason: "SIGNAL_EXIT".into(),
            })
            .collect::<Vec<_>>();
        let net: Decimal = pnls.iter().sum();
        BacktestResults {
            initial_balance: dec!(1000),
            final_balance: dec!(1000) + net,
            total_commission: Decimal::ZERO,
            total_slippage: Decimal::ZERO,
            trades,
            equity_curve: vec![EquityPoint {
                timestamp: t,
                balance: dec!(1000),
                equity: dec!(1000),
                open_positions: 0,
            }],
        }
    }

    #[test]
    fn picks_best_and_summarises() {
        let mut comparison = BacktestComparison::new();
        comparison.add("conservative", &results(&[dec!(10), dec!(-5)]));
        comparison.add("aggressive", &results(&[dec!(50), dec!(-20), dec!(-10)]));

        assert_eq!(comparison.best_by("total_return_percent").unwrap().name, "aggressive");
        assert_eq!(comparison.best_by("win_rate").unwrap().name, "conservative");
        assert!(comparison.best_by("vibes").is_err());

        let summary = comparison.summary().unwrap();
        assert_eq!(summary.count, 2);
        assert!((summary.total_return.mean - 1.25).abs() < 1e-9);
        assert!((summary.total_return.min - 0.5).abs() < 1e-9);
        assert!((summary.total_return.max - 2.0).abs() < 1e-9);

        let table = comparison.table();
        assert!(table.lines().count() == 3);
        assert!(table.contains("conservative"));
    }

    #[test]
    fn loads_json_files_and_exports_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_a.json");
        std::fs::write(&path, serde_json::to_string(&results(&[dec!(3)])).unwrap()).unwrap();

        let comparison = BacktestComparison::load_files(&[path]).unwrap();
        assert_eq!(comparison.results()[0].name, "run_a");

        let csv_path = dir.path().join("comparison.csv");
        comparison.export_csv(&csv_path).unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        assert!(text.starts_with("name,total_return_percent,win_rate"));
        assert!(text.contains("run_a,0.30,100.00,0.00,inf,0.00,1.00"));

        assert!(BacktestComparison::new().summary().is_none());
    }
}
