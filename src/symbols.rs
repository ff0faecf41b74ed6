use crate::constants::{ATR_PERIOD, SYMBOL_ROTATION_INTERVAL_SECS, VOLUME_PERIOD};
use crate::indicators;
use crate::market_data::Candle;
use crate::signals::to_f64;
use chrono::{DateTime, Utc};
use log::info;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

const MOMENTUM_LOOKBACK: usize = 20;

/// Momentum score mixing price change, volume surge and relative volatility.
pub fn momentum_score(candles: &[Candle]) -> f64 {
    if candles.len() < MOMENTUM_LOOKBACK + 1 {
        return 0.0;
    }
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<Decimal> = candles.iter().map(|c| c.volume).collect();

    let change = to_f64(indicators::price_change_percent(&closes, MOMENTUM_LOOKBACK)).abs();
    let volume_ratio = to_f64(indicators::volume_ratio(&volumes, VOLUME_PERIOD));
    let price = closes.last().copied().unwrap_or(Decimal::ZERO);
    let atr = indicators::atr(candles, ATR_PERIOD);
    let volatility = if price > Decimal::ZERO { to_f64(atr / price) } else { 0.0 };

    change * 10.0 * 0.4 + (volume_ratio * 20.0).min(100.0) * 0.3 + volatility * 1000.0 * 0.3
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationStatus {
    pub active: Vec<String>,
    pub pool_size: usize,
    pub max_active: usize,
    pub last_rotation: Option<DateTime<Utc>>,
    pub seconds_until_next: i64,
}

/// Keeps `max_active` symbols out of a larger pool, rotating by momentum.
#[derive(Debug, Clone)]
pub struct SymbolManager {
    pool: Vec<String>,
    max_active: usize,
    active: Vec<String>,
    scores: HashMap<String, f64>,
    last_rotation: Option<DateTime<Utc>>,
}

impl SymbolManager {
    pub fn new(pool: Vec<String>, max_active: usize) -> Self {
        let max_active = max_active.max(1);
        let active = pool.iter().take(max_active).cloned().collect();
        Self {
            pool,
            max_active,
            active,
            scores: HashMap::new(),
            last_rotation: None,
        }
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    pub fn active(&self) -> &[String] {
        &self.active
    }

    pub fn update_score(&mut self, symbol: &str, candles: &[Candle]) {
        self.scores.insert(symbol.to_string(), momentum_score(candles));
    }

    pub fn score(&self, symbol: &str) -> f64 {
        self.scores.get(symbol).copied().unwrap_or(0.0)
    }

    pub fn top(&self, n: usize) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .pool
            .iter()
            .map(|s| (s.clone(), self.score(s)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    pub fn rotation_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_rotation {
            None => true,
            Some(last) => (now - last).num_seconds() >= SYMBOL_ROTATION_INTERVAL_SECS,
        }
    }

    /// Re-pick the active list. Symbols with open positions always stay.
    /// Returns true when the active set changed.
    pub fn rotate(&mut self, now: DateTime<Utc>, held: &[String]) -> bool {
        if !self.rotation_due(now) {
            return false;
        }
        self.last_rotation = Some(now);

        let mut next: Vec<String> = held
            .iter()
            .filter(|s| self.pool.contains(s))
            .cloned()
            .collect();
        next.dedup();

        for (symbol, _) in self.top(self.pool.len()) {
            if next.len() >= self.max_active {
                break;
            }
            if !next.contains(&symbol) {
                next.push(symbol);
            }
        }

        let changed = {
            let mut a = self.active.clone();
            let mut b = next.clone();
            a.sort();
            b.sort();
            a != b
        };
        if changed {
            info!("Symbol rotation: {:?} -> {:?}", self.active, next);
        }
        self.active = next;
        changed
    }

    pub fn status(&self, now: DateTime<Utc>) -> RotationStatus {
        let seconds_until_next = match self.last_rotation {
            None => 0,
            Some(last) => (SYMBOL_ROTATION_INTERVAL_SECS - (now - last).num_seconds()).max(0),
        };
        RotationStatus {
            active: self.active.clone(),
            pool_size: self.pool.len(),
            max_active: self.max_active,
            last_rotation: self.last_rotation,
            seconds_until_next,
        }
    }
}
