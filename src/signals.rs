//! Weighted confluence scoring.
//!
//! Each indicator condition adds to a buy or sell strength; volume and trend
//! act as multipliers. The number of contributing conditions is kept as the
//! confluence count.

use crate::bot_config::BotType;
use crate::constants::*;
use crate::indicators::{self, BollingerBands, Macd};
use crate::market_data::Candle;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Trend {
    Up,
    Down,
    Sideways,
}

/// Trend from fast/slow EMAs with a 0.2% dead band.
pub fn trend_from_emas(fast: Decimal, slow: Decimal) -> Trend {
    if fast > slow * dec!(1.002) {
        Trend::Up
    } else if fast < slow * dec!(0.998) {
        Trend::Down
    } else {
        Trend::Sideways
    }
}

/// Trend of a higher timeframe; `None` until enough candles exist for the slow EMA.
pub fn higher_timeframe_trend(candles: &[Candle]) -> Option<Trend> {
    if candles.len() < EMA_SLOW {
        return None;
    }
    let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
    Some(trend_from_emas(
        indicators::ema(&closes, EMA_FAST),
        indicators::ema(&closes, EMA_SLOW),
    ))
}

/// Indicator values for one symbol at the latest closed candle.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub rsi: Decimal,
    #[serde(skip)]
    pub bb: BollingerBands,
    #[serde(skip)]
    pub macd: Macd,
    pub prev_histogram: Decimal,
    pub volume_ratio: Decimal,
    pub atr: Decimal,
    pub ema_fast: Decimal,
    pub ema_slow: Decimal,
    pub price_change_pct: Decimal,
    pub higher_trends: Vec<Trend>,
}

impl MarketSnapshot {
    pub fn from_candles(symbol: &str, candles: &[Candle], higher_trends: Vec<Trend>) -> Option<Self> {
        let last = candles.last()?;
        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<Decimal> = candles.iter().map(|c| c.volume).collect();

        let macd_history = indicators::macd_series(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
        let macd = macd_history.last().copied().unwrap_or_default();
        let prev_histogram = macd_history
            .len()
            .checked_sub(2)
            .map(|i| macd_history[i].histogram)
            .unwrap_or(Decimal::ZERO);

        let ema_fast = if closes.len() >= EMA_FAST {
            indicators::ema(&closes, EMA_FAST)
        } else {
            last.close
        };
        let ema_slow = if closes.len() >= EMA_SLOW {
            indicators::ema(&closes, EMA_SLOW)
        } else {
            last.close
        };

        Some(Self {
            symbol: symbol.to_string(),
            price: last.close,
            rsi: indicators::rsi(&closes, RSI_PERIOD),
            bb: indicators::bollinger_bands(&closes, BB_PERIOD, BB_STD_DEV),
            macd,
            prev_histogram,
            volume_ratio: indicators::volume_ratio(&volumes, VOLUME_PERIOD),
            atr: indicators::atr(candles, ATR_PERIOD),
            ema_fast,
            ema_slow,
            price_change_pct: indicators::price_change_percent(&closes, 20),
            higher_trends,
        })
    }

    pub fn is_uptrend(&self) -> bool {
        self.ema_fast > self.ema_slow
    }

    pub fn is_downtrend(&self) -> bool {
        self.ema_fast < self.ema_slow
    }

    pub fn bb_width_percent(&self) -> Decimal {
        self.bb.width_percent()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalScore {
    pub buy_strength: f64,
    pub sell_strength: f64,
    pub buy_confluence: u32,
    pub sell_confluence: u32,
    pub details: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalDecision {
    pub side: Side,
    pub strength: f64,
    pub confluence: u32,
    pub details: Vec<String>,
}

impl SignalScore {
    /// Pick the side whose strength clears `min_strength` and beats the other side.
    pub fn decide(&self, min_strength: f64) -> Option<SignalDecision> {
        let (side, strength, confluence) = if self.buy_strength >= min_strength
            && self.buy_strength > self.sell_strength
        {
            (Side::Buy, self.buy_strength, self.buy_confluence)
        } else if self.sell_strength >= min_strength && self.sell_strength > self.buy_strength {
            (Side::Sell, self.sell_strength, self.sell_confluence)
        } else {
            return None;
        };

        Some(SignalDecision {
            side,
            strength,
            confluence,
            details: self.details.clone(),
        })
    }
}

pub fn score(snapshot: &MarketSnapshot, bot_type: BotType) -> SignalScore {
    match bot_type {
        BotType::Scalping => score_scalping(snapshot),
        BotType::AggressiveRecovery => score_aggressive(snapshot),
    }
}

fn score_scalping(s: &MarketSnapshot) -> SignalScore {
    let mut out = SignalScore::default();

    // RSI, weighted by extremity
    if s.rsi < RSI_OVERSOLD {
        if s.rsi < RSI_EXTREME_THRESHOLD {
            out.buy_strength += 2.0;
            out.details.push(format!("RSI<{RSI_EXTREME_THRESHOLD}*"));
        } else {
            out.buy_strength += 1.0;
            out.details.push("RSI<30".into());
        }
        out.buy_confluence += 1;
    } else if s.rsi > RSI_OVERBOUGHT {
        let extreme = Decimal::from(100) - RSI_EXTREME_THRESHOLD;
        if s.rsi > extreme {
            out.sell_strength += 2.0;
            out.details.push(format!("RSI>{extreme}*"));
        } else {
            out.sell_strength += 1.0;
            out.details.push("RSI>70".into());
        }
        out.sell_confluence += 1;
    }

    // Bollinger, weighted by closeness to the broken band
    let width = s.bb.width();
    if width > Decimal::ZERO {
        if s.price < s.bb.lower {
            if (s.price - s.bb.lower).abs() / width < dec!(0.1) {
                out.buy_strength += 2.0;
                out.details.push("BB<<Lower*".into());
            } else {
                out.buy_strength += 1.0;
                out.details.push("BB<Lower".into());
            }
            out.buy_confluence += 1;
        } else if s.price > s.bb.upper {
            if (s.price - s.bb.upper).abs() / width < dec!(0.1) {
                out.sell_strength += 2.0;
                out.details.push("BB>>Upper*".into());
            } else {
                out.sell_strength += 1.0;
                out.details.push("BB>Upper".into());
            }
            out.sell_confluence += 1;
        }
    }

    // MACD histogram crossing zero
    let hist = s.macd.histogram;
    let prev = s.prev_histogram;
    if prev < Decimal::ZERO && hist > Decimal::ZERO {
        if hist.abs() > prev.abs() {
            out.buy_strength += 1.5;
            out.details.push("MACD-up*".into());
        } else {
            out.buy_strength += 1.0;
            out.details.push("MACD-up".into());
        }
        out.buy_confluence += 1;
    } else if prev > Decimal::ZERO && hist < Decimal::ZERO {
        if hist.abs() > prev.abs() {
            out.sell_strength += 1.5;
            out.details.push("MACD-down*".into());
        } else {
            out.sell_strength += 1.0;
            out.details.push("MACD-down".into());
        }
        out.sell_confluence += 1;
    }

    if s.volume_ratio > VOLUME_MULTIPLIER {
        out.buy_strength *= 1.3;
        out.sell_strength *= 1.3;
        if out.buy_strength > 0.0 {
            out.buy_confluence += 1;
        }
        if out.sell_strength > 0.0 {
            out.sell_confluence += 1;
        }
        out.details.push(format!("Vol{:.1}x", s.volume_ratio));
    }

    // Primary trend
    if s.is_uptrend() && out.buy_strength > 0.0 {
        out.buy_strength += 0.5;
        out.buy_confluence += 1;
        out.details.push("Trend-up".into());
    } else if s.is_downtrend() && out.sell_strength > 0.0 {
        out.sell_strength += 0.5;
        out.sell_confluence += 1;
        out.details.push("Trend-down".into());
    } else {
        out.buy_strength *= 0.7;
        out.sell_strength *= 0.7;
    }

    // Higher timeframe confirmation
    if out.buy_strength > 0.0 {
        let alignment = alignment_score(&s.higher_trends, Trend::Up);
        out.buy_strength *= alignment_factor(alignment);
    } else if out.sell_strength > 0.0 {
        let alignment = alignment_score(&s.higher_trends, Trend::Down);
        out.sell_strength *= alignment_factor(alignment);
    }

    out
}

fn alignment_score(trends: &[Trend], wanted: Trend) -> f64 {
    trends.iter().filter(|t| **t == wanted).count() as f64 * 0.5
}

fn alignment_factor(alignment: f64) -> f64 {
    if alignment >= MIN_TF_ALIGNMENT_SCORE {
        1.0 + alignment * 0.15
    } else {
        0.85
    }
}

fn score_aggressive(s: &MarketSnapshot) -> SignalScore {
    let mut out = SignalScore::default();

    if s.rsi < RSI_OVERSOLD {
        out.buy_strength += if s.rsi < RSI_EXTREME_THRESHOLD { 2.0 } else { 1.0 };
        out.buy_confluence += 1;
        out.details.push("RSI<30".into());
    } else if s.rsi > RSI_OVERBOUGHT {
        let extreme = Decimal::from(100) - RSI_EXTREME_THRESHOLD;
        out.sell_strength += if s.rsi > extreme { 2.0 } else { 1.0 };
        out.sell_confluence += 1;
        out.details.push("RSI>70".into());
    }

    if s.bb.width() > Decimal::ZERO {
        if s.price < s.bb.lower {
            out.buy_strength += 1.5;
            out.buy_confluence += 1;
            out.details.push("BB<Lower".into());
        } else if s.price > s.bb.upper {
            out.sell_strength += 1.5;
            out.sell_confluence += 1;
            out.details.push("BB>Upper".into());
        }
    }

    if s.prev_histogram < Decimal::ZERO && s.macd.histogram > Decimal::ZERO {
        out.buy_strength += 1.5;
        out.buy_confluence += 1;
        out.details.push("MACD-up".into());
    } else if s.prev_histogram > Decimal::ZERO && s.macd.histogram < Decimal::ZERO {
        out.sell_strength += 1.5;
        out.sell_confluence += 1;
        out.details.push("MACD-down".into());
    }

    if s.volume_ratio > VOLUME_MULTIPLIER {
        out.buy_strength *= 1.2;
        out.sell_strength *= 1.2;
        out.details.push(format!("Vol{:.1}x", s.volume_ratio));
    }

    if s.is_uptrend() && out.buy_strength > 0.0 {
        out.buy_strength += 0.5;
        out.buy_confluence += 1;
        out.details.push("Trend-up".into());
    } else if s.is_downtrend() && out.sell_strength > 0.0 {
        out.sell_strength += 0.5;
        out.sell_confluence += 1;
        out.details.push("Trend-down".into());
    }

    out
}

/// Decimal to f64 for ratio arithmetic.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::test_support::*;

    fn snapshot() -> MarketSnapshot {
        MarketSnapshot {
            symbol: "BTCUSDT".into(),
            price: dec!(100),
            rsi: dec!(50),
            bb: BollingerBands {
                upper: dec!(110),
                middle: dec!(105),
                lower: dec!(100.5),
            },
            macd: Macd::default(),
            prev_histogram: Decimal::ZERO,
            volume_ratio: Decimal::ONE,
            atr: dec!(0.5),
            ema_fast: dec!(101),
            ema_slow: dec!(100),
            price_change_pct: Decimal::ZERO,
            higher_trends: vec![Trend::Up, Trend::Up],
        }
    }

    #[test]
    fn trend_dead_band() {
        assert_eq!(trend_from_emas(dec!(100.3), dec!(100)), Trend::Up);
        assert_eq!(trend_from_emas(dec!(99.7), dec!(100)), Trend::Down);
        assert_eq!(trend_from_emas(dec!(100.1), dec!(100)), Trend::Sideways);
    }

    #[test]
    fn strong_oversold_setup_scores_buy() {
        let mut s = snapshot();
        s.rsi = dec!(20);
        s.macd.histogram = dec!(0.3);
        s.prev_histogram = dec!(-0.1);
        s.volume_ratio = dec!(2);

        let score = score(&s, BotType::Scalping);
        // (2 RSI + 2 BB + 1.5 MACD) * 1.3 + 0.5 trend, then * 1.15 alignment
        let expected = ((2.0 + 2.0 + 1.5) * 1.3 + 0.5) * 1.15;
        assert!((score.buy_strength - expected).abs() < 1e-9);
        assert_eq!(score.sell_strength, 0.0);
        assert_eq!(score.buy_confluence, 5);

        let decision = score.decide(MIN_SIGNAL_STRENGTH).unwrap();
        assert_eq!(decision.side, Side::Buy);
        assert_eq!(decision.confluence, 5);
    }

    #[test]
    fn counter_trend_is_penalised() {
        let mut s = snapshot();
        s.rsi = dec!(80);
        s.price = dec!(110.2);
        s.higher_trends = vec![Trend::Up, Trend::Sideways];

        let score = score(&s, BotType::Scalping);
        // RSI>75 = 2, just above the upper band = 2
        let raw = 2.0 + 2.0;
        let expected = raw * 0.7 * 0.85;
        assert!((score.sell_strength - expected).abs() < 1e-9);
        assert!(score.decide(MIN_SIGNAL_STRENGTH).is_none());
    }

    #[test]
    fn aggressive_weights() {
        let mut s = snapshot();
        s.rsi = dec!(28);
        s.macd.histogram = dec!(0.2);
        s.prev_histogram = dec!(-0.2);
        s.volume_ratio = dec!(1.6);

        let score = score(&s, BotType::AggressiveRecovery);
        let expected = (1.0 + 1.5 + 1.5) * 1.2 + 0.5;
        assert!((score.buy_strength - expected).abs() < 1e-9);
        assert!(score.decide(AGGRESSIVE_MIN_SIGNAL_STRENGTH).is_some());
    }

    #[test]
    fn tie_is_no_trade() {
        let score = SignalScore {
            buy_strength: 4.0,
            sell_strength: 4.0,
            ..Default::default()
        };
        assert!(score.decide(3.5).is_none());
    }

    #[test]
    fn snapshot_from_candles() {
        let candles = candles_from_closes(&linear_closes(100, 1, 80));
        let snap = MarketSnapshot::from_candles("ETHUSDT", &candles, vec![]).unwrap();
        assert_eq!(snap.price, dec!(179));
        assert_eq!(snap.rsi, dec!(100));
        assert!(snap.is_uptrend());
        assert!(snap.atr > Decimal::ZERO);
        assert_eq!(higher_timeframe_trend(&candles), Some(Trend::Up));
        assert_eq!(higher_timeframe_trend(&candles[..10]), None);
        assert!(MarketSnapshot::from_candles("ETHUSDT", &[], vec![]).is_none());
    }
}
