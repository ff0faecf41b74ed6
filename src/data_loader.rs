//! Historical klines for backtests, cached as CSV under a data directory.

use crate::backtester::parse_date;
use crate::binance::BinanceClient;
use crate::constants::API_REQUEST_DELAY_MS;
use crate::market_data::Candle;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Anything that can page through historical klines.
#[async_trait]
pub trait KlineSource: Send + Sync {
    async fn klines_between(&self, symbol: &str, interval: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>>;
}

#[async_trait]
impl KlineSource for BinanceClient {
    async fn klines_between(&self, symbol: &str, interval: &str, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>> {
        self.get_klines_range(symbol, interval, start_ms, end_ms).await
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CandleRow {
    open_time: i64,
    #[serde(with = "rust_decimal::serde::str")]
    open: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    high: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    low: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    close: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    volume: Decimal,
    close_time: i64,
}

impl From<&Candle> for CandleRow {
    fn from(c: &Candle) -> Self {
        Self {
            open_time: c.open_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            close_time: c.close_time,
        }
    }
}

impl From<CandleRow> for Candle {
    fn from(r: CandleRow) -> Self {
        Self {
            open_time: r.open_time,
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
            close_time: r.close_time,
        }
    }
}

pub fn write_candles_csv(candles: &[Candle], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for candle in candles {
        writer.serialize(CandleRow::from(candle))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_candles_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut candles = Vec::new();
    for row in reader.deserialize::<CandleRow>() {
        candles.push(row.with_context(|| format!("Bad candle row in {}", path.display()))?.into());
    }
    Ok(candles)
}

pub struct DataLoader<S> {
    source: S,
    data_dir: PathBuf,
    request_delay: Duration,
}

impl<S: KlineSource> DataLoader<S> {
    pub fn new(source: S, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            data_dir: data_dir.into(),
            request_delay: Duration::from_millis(API_REQUEST_DELAY_MS),
        }
    }

    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    pub fn cache_path(&self, symbol: &str, interval: &str, start: &str, end: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}_{}_{}.csv", symbol, interval, start, end))
    }

    /// Candles for `[start, end)` from the cache, downloading and caching on a miss.
    pub async fn load(&self, symbol: &str, interval: &str, start: &str, end: &str) -> Result<Vec<Candle>> {
        let path = self.cache_path(symbol, interval, start, end);
        if path.exists() {
            match read_candles_csv(&path) {
                Ok(candles) if !candles.is_empty() => {
                    info!("Loaded {} cached candles from {}", candles.len(), path.display());
                    return Ok(candles);
                }
                Ok(_) => warn!("Cache file {} is empty, downloading again", path.display()),
                Err(e) => warn!("Ignoring unreadable cache {}: {}", path.display(), e),
            }
        }

        let candles = self.download(symbol, interval, start, end).await?;
        if !candles.is_empty() {
            write_candles_csv(&candles, &path)?;
            info!("Cached {} candles to {}", candles.len(), path.display());
        }
        Ok(candles)
    }

    pub async fn load_many(
        &self,
        symbols: &[String],
        interval: &str,
        start: &str,
        end: &str,
    ) -> Result<BTreeMap<String, Vec<Candle>>> {
        let mut data = BTreeMap::new();
        for symbol in symbols {
            let candles = self
                .load(symbol, interval, start, end)
                .await
                .with_context(|| format!("Failed to load history for {}", symbol))?;
            if candles.is_empty() {
                warn!("No candles for {} between {} and {}", symbol, start, end);
                continue;
            }
            data.insert(symbol.clone(), candles);
        }
        Ok(data)
    }

    async fn download(&self, symbol: &str, interval: &str, start: &str, end: &str) -> Result<Vec<Candle>> {
        let start_ms = parse_date(start)?.timestamp_millis();
        let end_ms = parse_date(end)?.timestamp_millis();
        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start_ms;

        while cursor < end_ms {
            let batch = self
                .source
                .klines_between(symbol, interval, cursor, end_ms - 1)
                .await?;
            let Some(last) = batch.last() else { break };
            let next = last.open_time + 1;
            info!("Fetched {} {} candles up to {}", batch.len(), symbol, last.open_datetime().format("%Y-%m-%d %H:%M"));
            candles.extend(batch.into_iter().filter(|c| c.open_time >= cursor && c.open_time < end_ms));
            if next <= cursor {
                break;
            }
            cursor = next;
            if !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }
        }

        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        Ok(candles)
    }
}
