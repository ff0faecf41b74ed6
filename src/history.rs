use crate::signals::{to_f64, Side};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub pnl_amount: Decimal,
    pub pnl_percent: Decimal,
    pub exit_reason: String,
    pub signal_strength: f64,
    pub is_recovery: bool,
    #[serde(default)]
    pub fees: Decimal,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl_amount > Decimal::ZERO
    }

    pub fn duration_secs(&self) -> i64 {
        (self.exit_time - self.entry_time).num_seconds()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SymbolStats {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub pnl: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub daily_pnl_percent: f64,
    pub current_balance: Decimal,
}

/// Closed trades plus the running balance they produced.
#[derive(Debug, Clone)]
pub struct TradeHistory {
    pub trades: Vec<ClosedTrade>,
    pub current_balance: Decimal,
    pub daily_start_balance: Decimal,
    pub daily_peak_balance: Decimal,
    symbol_stats: HashMap<String, SymbolStats>,
}

impl TradeHistory {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            trades: Vec::new(),
            current_balance: starting_balance,
            daily_start_balance: starting_balance,
            daily_peak_balance: starting_balance,
            symbol_stats: HashMap::new(),
        }
    }

    pub fn add_trade(&mut self, trade: ClosedTrade) {
        self.current_balance += trade.pnl_amount;
        self.daily_peak_balance = self.daily_peak_balance.max(self.current_balance);

        let stats = self.symbol_stats.entry(trade.symbol.clone()).or_default();
        stats.trades += 1;
        stats.pnl += trade.pnl_percent;
        if trade.is_win() {
            stats.wins += 1;
        } else {
            stats.losses += 1;
        }

        self.trades.push(trade);
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades.is_empty() {
            return 0.0;
        }
        let wins = self.trades.iter().filter(|t| t.is_win()).count();
        wins as f64 / self.trades.len() as f64 * 100.0
    }

    pub fn symbol_win_rate(&self, symbol: &str) -> f64 {
        match self.symbol_stats.get(symbol) {
            Some(s) if s.wins + s.losses > 0 => s.wins as f64 / (s.wins + s.losses) as f64 * 100.0,
            _ => 0.0,
        }
    }

    pub fn symbol_stats(&self, symbol: &str) -> Option<&SymbolStats> {
        self.symbol_stats.get(symbol)
    }

    pub fn daily_pnl_percent(&self) -> f64 {
        percent_change(self.daily_start_balance, self.current_balance)
    }

    /// Drop from today's best balance, as a negative percent.
    pub fn intraday_drawdown_percent(&self) -> f64 {
        percent_change(self.daily_peak_balance, self.current_balance)
    }

    pub fn should_stop_trading_today(&self, daily_loss_limit: f64) -> bool {
        self.daily_pnl_percent() <= -daily_loss_limit.abs()
    }

    pub fn should_lock_profit(&self, daily_target: f64) -> bool {
        self.daily_pnl_percent() >= daily_target
    }

    pub fn reset_daily(&mut self) {
        self.daily_start_balance = self.current_balance;
        self.daily_peak_balance = self.current_balance;
    }

    pub fn best_symbols(&self, top_n: usize) -> Vec<String> {
        let mut ranked: Vec<(&String, &SymbolStats)> = self.symbol_stats.iter().collect();
        ranked.sort_by(|a, b| b.1.pnl.cmp(&a.1.pnl).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().take(top_n).map(|(s, _)| s.clone()).collect()
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.trades.iter().rev().take_while(|t| !t.is_win()).count() as u32
    }

    pub fn consecutive_wins(&self) -> u32 {
        self.trades.iter().rev().take_while(|t| t.is_win()).count() as u32
    }

    pub fn trades_on(&self, day: chrono::NaiveDate) -> Vec<&ClosedTrade> {
        self.trades
            .iter()
            .filter(|t| t.exit_time.date_naive() == day)
            .collect()
    }

    pub fn daily_stats(&self, now: DateTime<Utc>) -> DailyStats {
        DailyStats {
            total_trades: self.trades_on(now.date_naive()).len(),
            win_rate: self.win_rate(),
            daily_pnl_percent: self.daily_pnl_percent(),
            current_balance: self.current_balance,
        }
    }

    pub fn recent(&self, n: usize) -> &[ClosedTrade] {
        let start = self.trades.len().saturating_sub(n);
        &self.trades[start..]
    }
}

fn percent_change(from: Decimal, to: Decimal) -> f64 {
    if from <= Decimal::ZERO {
        return 0.0;
    }
    to_f64((to - from) / from * Decimal::from(100))
}

#[cfg(test)]
pub(crate) fn test_trade(symbol: &str, pnl: Decimal) -> ClosedTrade {
    let now = Utc::now();
    ClosedTrade {
        id: format!("{symbol}_{}", now.timestamp_micros()),
        symbol: symbol.to_string(),
        side: Side::Buy,
        entry_price: Decimal::from(100),
        exit_price: Decimal::from(100) + pnl,
        quantity: Decimal::ONE,
        entry_time: now - chrono::Duration::seconds(60),
        exit_time: now,
        pnl_amount: pnl,
        pnl_percent: pnl,
        exit_reason: if pnl > Decimal::ZERO { "TP" } else { "SL" }.to_string(),
        signal_strength: 4.0,
        is_recovery: false,
        fees: Decimal::ZERO,
    }
}
