//! Backtest pipeline integration tests
//!
//! Exercises the offline path end to end:
//! 1. DataLoader downloads once and serves the CSV cache afterwards
//! 2. Backtester runs over the loaded candles for each template
//! 3. Metrics, saved JSON results and the comparison table agree
//! 4. Walk-forward windows each get their own backtest
//!
//! No network access; klines come from an in-memory source.

use anyhow::Result;
use async_trait::async_trait;
use binance_confluence_bot::backtester::{BacktestConfig, BacktestResults, Backtester};
use binance_confluence_bot::bot_config;
use binance_confluence_bot::comparison::BacktestComparison;
use binance_confluence_bot::data_loader::{DataLoader, KlineSource};
use binance_confluence_bot::market_data::Candle;
use binance_confluence_bot::metrics::{export_trades_csv, PerformanceMetrics};
use binance_confluence_bot::walkforward;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const START_MS: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z
const FIVE_MINUTES: i64 = 300_000;

// ============================================================================
// Fixtures
// ============================================================================

/// Triangle wave between 100 and 120 with a 6.7 hour period.
fn wave_candles(count: usize) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let phase = (i % 80) as i64;
            let cents = if phase < 40 { 10_000 + phase * 50 } else { 14_000 - phase * 50 };
            let close = Decimal::new(cents, 2);
            let open_time = START_MS + i as i64 * FIVE_MINUTES;
            Candle {
                open_time,
                open: close - Decimal::new(10, 2),
                high: close + Decimal::new(30, 2),
                low: close - Decimal::new(30, 2),
                close,
                volume: Decimal::from(500 + (i % 7) as i64 * 100),
                close_time: open_time + FIVE_MINUTES - 1,
            }
        })
        .collect()
}

struct OfflineSource {
    candles: Vec<Candle>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl KlineSource for OfflineSource {
    async fn klines_between(&self, _symbol: &str, _interval: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .candles
            .iter()
            .filter(|c| c.open_time >= start_ms && c.open_time <= end_ms)
            .take(1000)
            .cloned()
            .collect())
    }
}

fn run_template(name: &str, data: &BTreeMap<String, Vec<Candle>>) -> BacktestResults {
    let bot = bot_config::template(name).unwrap();
    let config = BacktestConfig {
        start_date: "2024-01-01".into(),
        end_date: "2024-01-03".into(),
        data_interval: "5m".into(),
        ..BacktestConfig::from_bot_config(&bot)
    };
    Backtester::new(config).run(data).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn loader_caches_downloaded_history() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let source = OfflineSource {
        candles: wave_candles(2 * 288 + 50),
        calls: calls.clone(),
    };
    let loader = DataLoader::new(source, dir.path()).with_request_delay(Duration::ZERO);

    let symbols = vec!["BTCUSDT".to_string()];
    let first = loader.load_many(&symbols, "5m", "2024-01-01", "2024-01-03").await.unwrap();
    assert_eq!(first["BTCUSDT"].len(), 2 * 288);
    let downloads = calls.load(Ordering::SeqCst);
    assert!(downloads >= 1);
    assert!(loader.cache_path("BTCUSDT", "5m", "2024-01-01", "2024-01-03").exists());

    let second = loader.load_many(&symbols, "5m", "2024-01-01", "2024-01-03").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), downloads);
    assert_eq!(first["BTCUSDT"], second["BTCUSDT"]);
}

#[test]
fn backtest_accounting_is_consistent() {
    let data = BTreeMap::from([
        ("BTCUSDT".to_string(), wave_candles(576)),
        ("ETHUSDT".to_string(), wave_candles(576)),
    ]);

    for template in bot_config::TEMPLATE_NAMES {
        let results = run_template(template, &data);
        assert_eq!(results.equity_curve.len(), 576, "{template}");

        let total_pnl: Decimal = results.trades.iter().map(|t| t.pnl).sum();
        let drift = (results.final_balance - results.initial_balance - total_pnl).abs();
        assert!(drift < Decimal::new(1, 6), "{template}: drift {drift}");

        for trade in &results.trades {
            assert!(trade.exit_time >= trade.entry_time);
            assert!(trade.quantity > Decimal::ZERO);
        }

        let metrics = PerformanceMetrics::calculate(&results);
        assert_eq!(metrics.total_trades, results.trades.len());
        assert_eq!(
            metrics.winning_trades + metrics.losing_trades + metrics.breakeven_trades,
            metrics.total_trades
        );
        assert!(metrics.max_drawdown_percent >= 0.0);
        assert!(metrics.report().contains("PERFORMANCE REPORT"));
    }
}

#[test]
fn saved_results_compare_and_export() {
    let dir = tempfile::tempdir().unwrap();
    let data = BTreeMap::from([("BTCUSDT".to_string(), wave_candles(576))]);

    let mut files: Vec<PathBuf> = Vec::new();
    for template in ["safe", "aggressive"] {
        let results = run_template(template, &data);
        let path = dir.path().join(format!("{template}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(&results).unwrap()).unwrap();
        files.push(path);

        let csv_path = dir.path().join(format!("{template}_trades.csv"));
        export_trades_csv(&results.trades, &csv_path).unwrap();
        let rows = std::fs::read_to_string(&csv_path).unwrap().lines().count();
        // Header is written with the first row
        let expected = if results.trades.is_empty() { 0 } else { results.trades.len() + 1 };
        assert_eq!(rows, expected);
    }

    let comparison = BacktestComparison::load_files(&files).unwrap();
    assert_eq!(comparison.results().len(), 2);
    let best = comparison.best_by("total_return_percent").unwrap();
    assert!(best.name == "safe" || best.name == "aggressive");
    assert!(comparison.best_by("not_a_metric").is_err());

    let table_path = dir.path().join("comparison.csv");
    comparison.export_csv(&table_path).unwrap();
    let table = std::fs::read_to_string(&table_path).unwrap();
    assert_eq!(table.lines().count(), 3);
    assert!(table.starts_with("name,"));
}

#[test]
fn walk_forward_tests_each_window_separately() {
    let data = BTreeMap::from([("BTCUSDT".to_string(), wave_candles(4 * 288))]);
    let bot = bot_config::template("balanced").unwrap();
    let config = BacktestConfig {
        data_interval: "5m".into(),
        ..BacktestConfig::from_bot_config(&bot)
    };
    let end = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
    // The fifth window falls before the data and is skipped
    let windows = walkforward::windows(end, 1, 5);

    let report = walkforward::run(&config, &data, &windows).unwrap();

    assert_eq!(report.results.len(), 4);
    assert_eq!(report.summary.periods, 4);
    assert_eq!(report.period_days, 1);
    assert_eq!(report.results[0].period, 1);
    assert_eq!(report.results[0].window.end, end);
    for result in &report.results {
        let trades = result.metrics.total_trades;
        assert_eq!(
            result.metrics.winning_trades + result.metrics.losing_trades + result.metrics.breakeven_trades,
            trades
        );
    }
    assert!(report.summary.consistency_percent <= 100.0);
    assert!(report.text().contains("WALK-FORWARD ANALYSIS"));
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["results"].as_array().unwrap().len(), 4);

    let empty = walkforward::windows(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap(), 7, 2);
    assert!(walkforward::run(&config, &data, &empty).is_err());
}
