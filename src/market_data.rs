use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64, // milliseconds
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

impl Candle {
    pub fn open_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.open_time)
            .single()
            .unwrap_or_default()
    }

    pub fn close_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.close_time)
            .single()
            .unwrap_or_default()
    }
}

/// Rolling candle buffer for one symbol and timeframe.
#[derive(Debug, Clone)]
pub struct MarketData {
    pub candles: VecDeque<Candle>,
    max_size: usize,
}

impl MarketData {
    pub fn new(max_size: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Replace the buffer with a fresh snapshot from the exchange.
    pub fn replace(&mut self, candles: Vec<Candle>) {
        self.candles.clear();
        for candle in candles {
            self.push(candle);
        }
    }

    /// Append a candle, updating in place when it shares the last open time.
    pub fn push(&mut self, candle: Candle) {
        if let Some(last) = self.candles.back_mut() {
            if last.open_time == candle.open_time {
                *last = candle;
                return;
            }
        }
        self.candles.push_back(candle);
        while self.candles.len() > self.max_size {
            self.candles.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn latest_price(&self) -> Option<Decimal> {
        self.candles.back().map(|c| c.close)
    }

    pub fn closes(&self) -> Vec<Decimal> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn volumes(&self) -> Vec<Decimal> {
        self.candles.iter().map(|c| c.volume).collect()
    }

    pub fn as_vec(&self) -> Vec<Candle> {
        self.candles.iter().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Candle;
    use rust_decimal::Decimal;

    /// One-minute candles with the given closes; high/low bracket the close by 0.1%.
    pub fn candles_from_closes(closes: &[Decimal]) -> Vec<Candle> {
        let spread = Decimal::new(1, 3);
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                let open_time = 1_700_000_000_000 + i as i64 * 60_000;
                Candle {
                    open_time,
                    open: *close,
                    high: *close * (Decimal::ONE + spread),
                    low: *close * (Decimal::ONE - spread),
                    close: *close,
                    volume: Decimal::from(100),
                    close_time: open_time + 59_999,
                }
            })
            .collect()
    }

    pub fn linear_closes(start: i64, step: i64, count: usize) -> Vec<Decimal> {
        (0..count)
            .map(|i| Decimal::from(start + step * i as i64))
            .collect()
    }
}
