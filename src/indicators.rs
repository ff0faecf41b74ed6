use crate::market_data::Candle;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Helper function to calculate the square root of Decimal
pub fn decimal_sqrt(value: Decimal) -> Decimal {
    if value <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    // Use Newton's method for approximation
    let mut x = value / Decimal::from(2);
    let mut prev_x = value;

    for _ in 0..40 {
        if (x - prev_x).abs() < Decimal::new(1, 10) {
            break;
        }
        prev_x = x;
        x = (x + value / x) / Decimal::from(2);
    }

    x
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().sum::<Decimal>() / Decimal::from(values.len())
}

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    multiplier: Decimal,
    current_value: Option<Decimal>,
}

impl ExponentialMovingAverage {
    pub fn new(period: usize) -> Self {
        let multiplier = Decimal::from(2) / (Decimal::from(period) + Decimal::ONE);
        Self {
            multiplier,
            current_value: None,
        }
    }

    // Seeded with the first value
    pub fn update(&mut self, value: Decimal) -> Decimal {
        let next = match self.current_value {
            Some(current) => (value * self.multiplier) + (current * (Decimal::ONE - self.multiplier)),
            None => value,
        };
        self.current_value = Some(next);
        next
    }

    pub fn current(&self) -> Option<Decimal> {
        self.current_value
    }
}

pub fn ema_series(values: &[Decimal], span: usize) -> Vec<Decimal> {
    let mut ema = ExponentialMovingAverage::new(span);
    values.iter().map(|v| ema.update(*v)).collect()
}

/// Last EMA value, or zero for an empty series.
pub fn ema(values: &[Decimal], span: usize) -> Decimal {
    ema_series(values, span).last().copied().unwrap_or(Decimal::ZERO)
}

pub fn sma(values: &[Decimal], period: usize) -> Decimal {
    if values.len() < period || period == 0 {
        return Decimal::ZERO;
    }
    mean(&values[values.len() - period..])
}

/// RSI from the simple average of the last `period` gains and losses.
/// Returns 50 when there is not enough data.
pub fn rsi(closes: &[Decimal], period: usize) -> Decimal {
    if closes.len() < period + 1 {
        return dec!(50);
    }

    let deltas: Vec<Decimal> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let recent = &deltas[deltas.len() - period..];

    let gains: Vec<Decimal> = recent.iter().map(|d| (*d).max(Decimal::ZERO)).collect();
    let losses: Vec<Decimal> = recent.iter().map(|d| (-*d).max(Decimal::ZERO)).collect();

    let avg_gain = mean(&gains);
    let avg_loss = mean(&losses);

    if avg_loss == Decimal::ZERO {
        return Decimal::from(100);
    }

    let rs = avg_gain / avg_loss;
    Decimal::from(100) - (Decimal::from(100) / (Decimal::ONE + rs))
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BollingerBands {
    pub upper: Decimal,
    pub middle: Decimal,
    pub lower: Decimal,
}

impl BollingerBands {
    pub fn width(&self) -> Decimal {
        self.upper - self.lower
    }

    /// Band width as a percentage of the middle band.
    pub fn width_percent(&self) -> Decimal {
        if self.middle > Decimal::ZERO {
            self.width() / self.middle * Decimal::from(100)
        } else {
            Decimal::ZERO
        }
    }

    /// Where `price` sits inside the band: 0 at the lower band, 1 at the upper.
    pub fn position(&self, price: Decimal) -> Decimal {
        let width = self.width();
        if width > Decimal::ZERO {
            (price - self.lower) / width
        } else {
            dec!(0.5)
        }
    }
}

/// SMA +/- `std_dev` population standard deviations. All zero with too few closes.
pub fn bollinger_bands(closes: &[Decimal], period: usize, std_dev: Decimal) -> BollingerBands {
    if closes.len() < period || period == 0 {
        return BollingerBands::default();
    }

    let window = &closes[closes.len() - period..];
    let middle = mean(window);
    let variance = window
        .iter()
        .map(|v| (*v - middle) * (*v - middle))
        .sum::<Decimal>()
        / Decimal::from(period);
    let sd = decimal_sqrt(variance);

    BollingerBands {
        upper: middle + sd * std_dev,
        middle,
        lower: middle - sd * std_dev,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Macd {
    pub macd: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

impl Macd {
    pub fn is_bullish(&self) -> bool {
        self.macd > self.signal
    }

    pub fn is_bearish(&self) -> bool {
        self.macd < self.signal
    }
}

/// Full histogram history; empty when there are fewer than `slow + signal` closes.
pub fn macd_series(closes: &[Decimal], fast: usize, slow: usize, signal: usize) -> Vec<Macd> {
    if closes.len() < slow + signal {
        return Vec::new();
    }

    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    let macd_line: Vec<Decimal> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| *f - *s)
        .collect();
    let signal_line = ema_series(&macd_line, signal);

    macd_line
        .iter()
        .zip(signal_line.iter())
        .map(|(m, s)| Macd {
            macd: *m,
            signal: *s,
            histogram: *m - *s,
        })
        .collect()
}

pub fn macd(closes: &[Decimal], fast: usize, slow: usize, signal: usize) -> Macd {
    macd_series(closes, fast, slow, signal)
        .last()
        .copied()
        .unwrap_or_default()
}

/// Mean of the last `period` true ranges. Zero with fewer than `period + 1` candles.
pub fn atr(candles: &[Candle], period: usize) -> Decimal {
    if candles.len() < period + 1 || period == 0 {
        return Decimal::ZERO;
    }

    let true_ranges: Vec<Decimal> = candles
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let c = &w[1];
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect();

    mean(&true_ranges[true_ranges.len() - period..])
}

/// Last volume over the mean of the last `period` volumes (current bar included).
pub fn volume_ratio(volumes: &[Decimal], period: usize) -> Decimal {
    if volumes.is_empty() {
        return Decimal::ONE;
    }
    let start = volumes.len().saturating_sub(period);
    let avg = mean(&volumes[start..]);
    if avg == Decimal::ZERO {
        return Decimal::ONE;
    }
    volumes[volumes.len() - 1] / avg
}

/// Percent change between the last close and the close `lookback` bars earlier.
pub fn price_change_percent(closes: &[Decimal], lookback: usize) -> Decimal {
    if closes.len() < lookback + 1 {
        return Decimal::ZERO;
    }
    let current = closes[closes.len() - 1];
    let previous = closes[closes.len() - 1 - lookback];
    if previous > Decimal::ZERO {
        (current - previous) / previous * Decimal::from(100)
    } else {
        Decimal::ZERO
    }
}

/// Local minima and maxima over +/- `window` bars; the three highest unique levels of each.
pub fn support_resistance(closes: &[Decimal], window: usize) -> (Vec<Decimal>, Vec<Decimal>) {
    if closes.len() < window * 2 {
        return (Vec::new(), Vec::new());
    }

    let mut supports = Vec::new();
    let mut resistances = Vec::new();

    for i in window..closes.len().saturating_sub(window) {
        let slice = &closes[i - window..=i + window];
        let price = closes[i];
        if slice.iter().all(|p| *p >= price) {
            supports.push(price);
        }
        if slice.iter().all(|p| *p <= price) {
            resistances.push(price);
        }
    }

    (last_unique_levels(supports), last_unique_levels(resistances))
}

fn last_unique_levels(mut levels: Vec<Decimal>) -> Vec<Decimal> {
    levels.sort();
    levels.dedup();
    let skip = levels.len().saturating_sub(3);
    levels.into_iter().skip(skip).collect()
}
