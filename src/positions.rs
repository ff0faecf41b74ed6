use crate::constants::*;
use crate::history::ClosedTrade;
use crate::signals::Side;
use crate::trailing_stop::TrailingStop;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub entry_time: DateTime<Utc>,
    pub signal_strength: f64,
    pub confluence: u32,
    pub is_recovery: bool,
    pub time_stop_secs: i64,
    pub partial_stages_hit: u8,
    pub trailing_active: bool,
    pub best_price: Decimal,    // highest for longs, lowest for shorts
    pub realized_pnl: Decimal,  // from partial closes
    #[serde(default)]
    pub fees: Decimal,
}

/// Parameters an entry is opened with.
#[derive(Debug, Clone)]
pub struct EntryPlan {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub signal_strength: f64,
    pub confluence: u32,
    pub is_recovery: bool,
    pub time_stop_secs: i64,
}

impl Position {
    pub fn open(plan: EntryPlan, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}_{}", plan.symbol, now.timestamp_micros()),
            symbol: plan.symbol,
            side: plan.side,
            entry_price: plan.entry_price,
            quantity: plan.quantity,
            remaining_quantity: plan.quantity,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            entry_time: now,
            signal_strength: plan.signal_strength,
            confluence: plan.confluence,
            is_recovery: plan.is_recovery,
            time_stop_secs: plan.time_stop_secs,
            partial_stages_hit: 0,
            trailing_active: false,
            best_price: plan.entry_price,
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
        }
    }

    /// Unrealised move in percent, positive when in profit.
    pub fn profit_percent(&self, price: Decimal) -> Decimal {
        if self.entry_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let diff = match self.side {
            Side::Buy => price - self.entry_price,
            Side::Sell => self.entry_price - price,
        };
        diff / self.entry_price * Decimal::from(100)
    }

    pub fn notional(&self) -> Decimal {
        self.entry_price * self.remaining_quantity
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_time).num_seconds()
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.profit_percent(price) / Decimal::from(100) * self.notional()
    }

    /// Book a partial close that was filled at `price`.
    pub fn apply_partial(&mut self, fill: &PartialFill, price: Decimal) {
        let sold = fill.quantity.min(self.remaining_quantity);
        self.realized_pnl += self.profit_percent(price) / Decimal::from(100) * self.entry_price * sold;
        self.remaining_quantity -= sold;
        self.partial_stages_hit = fill.stage;

        if fill.stage == 1 && MOVE_SL_TO_BREAKEVEN_AFTER_PARTIAL {
            self.stop_loss = match self.side {
                Side::Buy => self.stop_loss.max(self.entry_price),
                Side::Sell => self.stop_loss.min(self.entry_price),
            };
        }
    }

    /// Exchange fee paid on any fill of this position.
    pub fn add_fee(&mut self, fee: Decimal) {
        self.fees += fee;
    }

    /// PnL is net of every fee booked with `add_fee`.
    pub fn close(self, exit_price: Decimal, exit_time: DateTime<Utc>, reason: ExitReason) -> ClosedTrade {
        let pnl_amount = self.realized_pnl + self.unrealized_pnl(exit_price) - self.fees;
        let invested = self.entry_price * self.quantity;
        let pnl_percent = if invested > Decimal::ZERO {
            pnl_amount / invested * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        ClosedTrade {
            id: self.id,
            symbol: self.symbol,
            side: self.side,
            entry_price: self.entry_price,
            exit_price,
            quantity: self.quantity,
            entry_time: self.entry_time,
            exit_time,
            pnl_amount,
            pnl_percent,
            exit_reason: reason.as_str().to_string(),
            signal_strength: self.signal_strength,
            is_recovery: self.is_recovery,
            fees: self.fees,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    FinalTarget,
    StopLoss,
    TrailingStop,
    MaxLoss,
    Time,
    Signal,
    Manual,
    DailyStop,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TP",
            ExitReason::FinalTarget => "TP3",
            ExitReason::StopLoss => "SL",
            ExitReason::TrailingStop => "Trail_SL",
            ExitReason::MaxLoss => "Max_Loss",
            ExitReason::Time => "Time",
            ExitReason::Signal => "Signal",
            ExitReason::Manual => "Manual",
            ExitReason::DailyStop => "Daily_Stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartialFill {
    pub stage: u8,
    pub quantity: Decimal,
    pub profit_percent: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct ExitRules {
    pub partial_take_profit: bool,
    pub trailing: Option<TrailingStop>,
    pub max_loss_percent: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitCheck {
    pub trailing_moved: bool,
    pub partial: Option<PartialFill>,
    pub close: Option<ExitReason>,
}

/// Walk the exit rules for one position at `price`. Trailing stop updates are
/// applied to the position; partial fills are only proposed.
pub fn evaluate_exit(
    position: &mut Position,
    price: Decimal,
    now: DateTime<Utc>,
    rules: &ExitRules,
) -> ExitCheck {
    let mut check = ExitCheck::default();

    if let Some(trailing) = &rules.trailing {
        check.trailing_moved = trailing.update(position, price);
    }

    let profit = position.profit_percent(price);

    if rules.partial_take_profit {
        match position.partial_stages_hit {
            0 if profit >= PARTIAL_TP_1_PERCENT => {
                check.partial = Some(PartialFill {
                    stage: 1,
                    quantity: position.quantity * PARTIAL_TP_1_SIZE,
                    profit_percent: profit,
                });
            }
            1 if profit >= PARTIAL_TP_2_PERCENT => {
                check.partial = Some(PartialFill {
                    stage: 2,
                    quantity: position.quantity * PARTIAL_TP_2_SIZE,
                    profit_percent: profit,
                });
            }
            2 if profit >= PARTIAL_TP_3_PERCENT => {
                check.close = Some(ExitReason::FinalTarget);
            }
            _ => {}
        }
    }

    if check.close.is_none() {
        let hit_tp = match position.side {
            Side::Buy => price >= position.take_profit,
            Side::Sell => price <= position.take_profit,
        };
        let hit_sl = match position.side {
            Side::Buy => price <= position.stop_loss,
            Side::Sell => price >= position.stop_loss,
        };

        check.close = if hit_tp {
            Some(ExitReason::TakeProfit)
        } else if hit_sl {
            Some(if position.trailing_active {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopLoss
            })
        } else if rules.max_loss_percent > Decimal::ZERO && profit <= -rules.max_loss_percent {
            Some(ExitReason::MaxLoss)
        } else if position.time_stop_secs > 0 && position.age_secs(now) >= position.time_stop_secs {
            Some(ExitReason::Time)
        } else {
            None
        };
    }

    if check.close.is_some() {
        check.partial = None;
    }
    check
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionsSummary {
    pub total: usize,
    pub by_symbol: BTreeMap<String, usize>,
    pub buys: usize,
    pub sells: usize,
    pub total_exposure: Decimal,
}

/// Open positions across symbols with total and per-symbol caps.
#[derive(Debug, Clone)]
pub struct PositionManager {
    pub max_total_positions: usize,
    pub max_per_symbol: usize,
    positions: HashMap<String, Position>,
    symbol_index: HashMap<String, Vec<String>>,
}

impl PositionManager {
    pub fn new(max_total_positions: usize, max_per_symbol: usize) -> Self {
        Self {
            max_total_positions,
            max_per_symbol,
            positions: HashMap::new(),
            symbol_index: HashMap::new(),
        }
    }

    pub fn can_open_position(&self, symbol: &str) -> bool {
        self.count() < self.max_total_positions && self.symbol_count(symbol) < self.max_per_symbol
    }

    /// Returns false when a cap is already reached.
    pub fn add(&mut self, position: Position) -> bool {
        if !self.can_open_position(&position.symbol) {
            return false;
        }
        self.symbol_index
            .entry(position.symbol.clone())
            .or_default()
            .push(position.id.clone());
        self.positions.insert(position.id.clone(), position);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Position> {
        let position = self.positions.remove(id)?;
        if let Some(ids) = self.symbol_index.get_mut(&position.symbol) {
            ids.retain(|p| p != id);
            if ids.is_empty() {
                self.symbol_index.remove(&position.symbol);
            }
        }
        Some(position)
    }

    pub fn get(&self, id: &str) -> Option<&Position> {
        self.positions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Position> {
        self.positions.get_mut(id)
    }

    /// All positions, oldest first.
    pub fn all(&self) -> Vec<&Position> {
        let mut all: Vec<&Position> = self.positions.values().collect();
        all.sort_by_key(|p| p.entry_time);
        all
    }

    pub fn ids(&self) -> Vec<String> {
        self.all().into_iter().map(|p| p.id.clone()).collect()
    }

    pub fn for_symbol(&self, symbol: &str) -> Vec<&Position> {
        self.symbol_index
            .get(symbol)
            .map(|ids| ids.iter().filter_map(|id| self.positions.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn by_side(&self, side: Side) -> Vec<&Position> {
        self.all().into_iter().filter(|p| p.side == side).collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.symbol_index.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn count(&self) -> usize {
        self.positions.len()
    }

    pub fn symbol_count(&self, symbol: &str) -> usize {
        self.symbol_index.get(symbol).map_or(0, Vec::len)
    }

    pub fn total_exposure(&self) -> Decimal {
        self.positions.values().map(Position::notional).sum()
    }

    pub fn symbol_exposure(&self, symbol: &str) -> Decimal {
        self.for_symbol(symbol).iter().map(|p| p.notional()).sum()
    }

    pub fn oldest(&self, symbol: Option<&str>) -> Option<&Position> {
        match symbol {
            Some(s) => self.for_symbol(s).into_iter().min_by_key(|p| p.entry_time),
            None => self.positions.values().min_by_key(|p| p.entry_time),
        }
    }

    pub fn summary(&self) -> PositionsSummary {
        PositionsSummary {
            total: self.count(),
            by_symbol: self
                .symbol_index
                .iter()
                .map(|(s, ids)| (s.clone(), ids.len()))
                .collect(),
            buys: self.by_side(Side::Buy).len(),
            sells: self.by_side(Side::Sell).len(),
            total_exposure: self.total_exposure(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_position(side: Side, entry: Decimal, stop: Decimal, target: Decimal) -> Position {
    Position::open(
        EntryPlan {
            symbol: "BTCUSDT".into(),
            side,
            entry_price: entry,
            quantity: Decimal::ONE,
            stop_loss: stop,
            take_profit: target,
            signal_strength: 4.0,
            confluence: 3,
            is_recovery: false,
            time_stop_secs: TIME_STOP_BASE,
        },
        Utc::now(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn rules() -> ExitRules {
        ExitRules {
            partial_take_profit: true,
            trailing: None,
            max_loss_percent: MAX_LOSS_PER_POSITION,
        }
    }

    #[test]
    fn profit_is_signed_by_side() {
        let long = test_position(Side::Buy, dec!(100), dec!(99), dec!(102));
        let short = test_position(Side::Sell, dec!(100), dec!(101), dec!(98));
        assert_eq!(long.profit_percent(dec!(101)), dec!(1));
        assert_eq!(short.profit_percent(dec!(101)), dec!(-1));
    }

    #[test]
    fn partial_ladder_moves_stop_to_breakeven() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(105));
        let now = pos.entry_time;

        let check = evaluate_exit(&mut pos, dec!(100.4), now, &rules());
        let fill = check.partial.clone().unwrap();
        assert_eq!(fill.stage, 1);
        assert_eq!(fill.quantity, dec!(0.40));
        assert!(check.close.is_none());

        pos.apply_partial(&fill, dec!(100.4));
        assert_eq!(pos.remaining_quantity, dec!(0.60));
        assert_eq!(pos.stop_loss, dec!(100));
        assert_eq!(pos.realized_pnl, dec!(0.16));

        let check = evaluate_exit(&mut pos, dec!(100.8), now, &rules());
        let fill = check.partial.unwrap();
        assert_eq!(fill.stage, 2);
        pos.apply_partial(&fill, dec!(100.8));
        assert_eq!(pos.remaining_quantity, dec!(0.30));

        // Back at entry: the breakeven stop closes the runner
        let check = evaluate_exit(&mut pos, dec!(100), now, &rules());
        assert_eq!(check.close, Some(ExitReason::StopLoss));
    }

    #[test]
    fn runner_closes_at_final_target() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(110));
        pos.partial_stages_hit = 2;
        let entry_time = pos.entry_time;
        let check = evaluate_exit(&mut pos, dec!(102), entry_time, &rules());
        assert_eq!(check.close, Some(ExitReason::FinalTarget));
        assert!(check.partial.is_none());
    }

    #[test]
    fn take_profit_beats_partial() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(100.3));
        let entry_time = pos.entry_time;
        let check = evaluate_exit(&mut pos, dec!(100.5), entry_time, &rules());
        assert_eq!(check.close, Some(ExitReason::TakeProfit));
        assert!(check.partial.is_none());
    }

    #[test]
    fn trailing_stop_reason() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(110));
        let rules = ExitRules {
            partial_take_profit: false,
            trailing: Some(TrailingStop::new(dec!(0.2), dec!(0.5))),
            max_loss_percent: MAX_LOSS_PER_POSITION,
        };
        let now = pos.entry_time;
        evaluate_exit(&mut pos, dec!(101), now, &rules);
        let check = evaluate_exit(&mut pos, dec!(100.7), now, &rules);
        assert_eq!(check.close, Some(ExitReason::TrailingStop));
    }

    #[test]
    fn time_stop_and_max_loss() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(90), dec!(110));
        let later = pos.entry_time + Duration::seconds(TIME_STOP_BASE);
        let check = evaluate_exit(&mut pos, dec!(100), later, &rules());
        assert_eq!(check.close, Some(ExitReason::Time));

        let entry_time = pos.entry_time;
        let check = evaluate_exit(&mut pos, dec!(94), entry_time, &rules());
        assert_eq!(check.close, Some(ExitReason::MaxLoss));
    }

    #[test]
    fn close_includes_partials() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(105));
        pos.apply_partial(
            &PartialFill {
                stage: 1,
                quantity: dec!(0.5),
                profit_percent: dec!(1),
            },
            dec!(101),
        );
        let trade = pos.close(dec!(102), Utc::now(), ExitReason::TakeProfit);
        // 0.5 + 0.5 * 2
        assert_eq!(trade.pnl_amount, dec!(1.5));
        assert_eq!(trade.pnl_percent, dec!(1.5));
        assert_eq!(trade.exit_reason, "TP");
    }

    #[test]
    fn close_is_net_of_fees() {
        let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(105));
        pos.add_fee(dec!(0.1));
        pos.apply_partial(
            &PartialFill {
                stage: 1,
                quantity: dec!(0.5),
                profit_percent: dec!(1),
            },
            dec!(101),
        );
        pos.add_fee(dec!(0.05));
        pos.add_fee(dec!(0.05));
        let trade = pos.close(dec!(102), Utc::now(), ExitReason::TakeProfit);
        assert_eq!(trade.fees, dec!(0.2));
        assert_eq!(trade.pnl_amount, dec!(1.3));
        assert_eq!(trade.pnl_percent, dec!(1.3));
    }

    #[test]
    fn manager_enforces_caps() {
        let mut manager = PositionManager::new(3, 2);
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut pos = test_position(Side::Buy, dec!(100), dec!(99), dec!(101));
            pos.id = format!("p{i}");
            ids.push(pos.id.clone());
            let added = manager.add(pos);
            assert_eq!(added, i < 2);
        }
        assert_eq!(manager.symbol_count("BTCUSDT"), 2);
        assert!(!manager.can_open_position("BTCUSDT"));
        assert!(manager.can_open_position("ETHUSDT"));
        assert_eq!(manager.total_exposure(), dec!(200));

        assert!(manager.remove("p0").is_some());
        assert!(manager.remove("p0").is_none());
        assert_eq!(manager.summary().total, 1);

        manager.remove("p1");
        assert!(manager.is_empty());
        assert!(manager.symbols().is_empty());
    }
}
