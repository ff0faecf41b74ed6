use crate::positions::Position;
use crate::signals::Side;
use rust_decimal::Decimal;

/// Percentage trailing stop. Arms once the position is `activation_percent`
/// in profit and then follows the best price at `trail_percent` distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingStop {
    pub trail_percent: Decimal,
    pub activation_percent: Decimal,
}

impl TrailingStop {
    pub fn new(trail_percent: Decimal, activation_percent: Decimal) -> Self {
        Self {
            trail_percent,
            activation_percent,
        }
    }

    pub fn should_activate(&self, position: &Position, price: Decimal) -> bool {
        position.trailing_active || position.profit_percent(price) >= self.activation_percent
    }

    /// Returns true when the stop was moved.
    pub fn update(&self, position: &mut Position, price: Decimal) -> bool {
        if !self.should_activate(position, price) {
            return false;
        }
        let offset = price * self.trail_percent / Decimal::from(100);
        ratchet(position, price, offset)
    }
}

/// Trailing stop whose distance is a multiple of the current ATR.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtrTrailingStop {
    pub atr_multiplier: Decimal,
    pub activation_percent: Decimal,
}

impl AtrTrailingStop {
    pub fn new(atr_multiplier: Decimal, activation_percent: Decimal) -> Self {
        Self {
            atr_multiplier,
            activation_percent,
        }
    }

    pub fn update(&self, position: &mut Position, price: Decimal, atr: Decimal) -> bool {
        if position.profit_percent(price) < self.activation_percent {
            return false;
        }
        ratchet(position, price, atr * self.atr_multiplier)
    }
}

// Moves the stop toward the new best price. The stop never loosens.
fn ratchet(position: &mut Position, price: Decimal, offset: Decimal) -> bool {
    match position.side {
        Side::Buy => {
            if price <= position.best_price && position.trailing_active {
                return false;
            }
            position.best_price = position.best_price.max(price);
            let new_stop = position.best_price - offset;
            if new_stop > position.stop_loss {
                position.stop_loss = new_stop;
                position.trailing_active = true;
                return true;
            }
        }
        Side::Sell => {
            if price >= position.best_price && position.trailing_active {
                return false;
            }
            position.best_price = position.best_price.min(price);
            let new_stop = position.best_price + offset;
            if new_stop < position.stop_loss {
                position.stop_loss = new_stop;
                position.trailing_active = true;
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::test_position;
    use rust_decimal_macros::dec;

    #[test]
    fn waits_for_activation() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(105));
        let trail = TrailingStop::new(dec!(0.2), dec!(0.5));

        assert!(!trail.update(&mut pos, dec!(100.3)));
        assert_eq!(pos.stop_loss, dec!(99));

        assert!(trail.update(&mut pos, dec!(101)));
        assert_eq!(pos.stop_loss, dec!(100.798));
        assert!(pos.trailing_active);
    }

    #[test]
    fn never_loosens() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(105));
        let trail = TrailingStop::new(dec!(0.2), dec!(0.5));
        trail.update(&mut pos, dec!(102));
        let stop = pos.stop_loss;

        assert!(!trail.update(&mut pos, dec!(101)));
        assert_eq!(pos.stop_loss, stop);
        assert_eq!(pos.best_price, dec!(102));
    }

    #[test]
    fn short_trails_above() {
        let mut pos = test_position(Side::Sell, dec!(100), dec!(101), dec!(95));
        let trail = TrailingStop::new(dec!(0.3), dec!(0.5));

        assert!(trail.update(&mut pos, dec!(99)));
        assert_eq!(pos.stop_loss, dec!(99.297));
        assert!(!trail.update(&mut pos, dec!(99.5)));
    }

    #[test]
    fn atr_distance() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(105));
        let trail = AtrTrailingStop::new(dec!(2), dec!(0.3));

        assert!(!trail.update(&mut pos, dec!(100.1), dec!(0.2)));
        assert!(trail.update(&mut pos, dec!(101), dec!(0.2)));
        assert_eq!(pos.stop_loss, dec!(100.6));
    }
}
