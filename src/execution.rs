use crate::binance::BinanceClient;
use crate::constants::{EXPECTED_SLIPPAGE_PERCENT, TAKER_FEE};
use crate::error::BotError;
use crate::signals::Side;
use anyhow::Result;
use async_trait::async_trait;
use log::info;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fill {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
}

impl Fill {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Where orders go. `price` is the last seen market price, used by paper
/// fills and as a fallback when the exchange reports no average price.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn market_buy(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Result<Fill>;
    async fn market_sell(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Result<Fill>;
    async fn balance(&self) -> Result<Decimal>;
    fn is_paper(&self) -> bool;
}

pub struct LiveExecutor {
    client: BinanceClient,
}

impl LiveExecutor {
    pub fn new(client: BinanceClient) -> Self {
        Self { client }
    }

    async fn market(&self, symbol: &str, side: Side, quantity: Decimal, price: Decimal) -> Result<Fill> {
        let response = self
            .client
            .place_market_order(symbol, side.as_str(), quantity)
            .await?;
        let executed = response.executed_quantity();
        let fill_price = response.average_price().unwrap_or(price);
        info!(
            "Order {} {} {} {} @ {} ({})",
            response.order_id, side, executed, symbol, fill_price, response.status
        );
        Ok(Fill {
            symbol: symbol.to_string(),
            side,
            quantity: executed,
            price: fill_price,
            fee: executed * fill_price * TAKER_FEE,
        })
    }
}

#[async_trait]
impl OrderExecutor for LiveExecutor {
    async fn market_buy(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Result<Fill> {
        self.market(symbol, Side::Buy, quantity, price).await
    }

    async fn market_sell(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Result<Fill> {
        self.market(symbol, Side::Sell, quantity, price).await
    }

    async fn balance(&self) -> Result<Decimal> {
        self.client.get_usdt_balance().await
    }

    fn is_paper(&self) -> bool {
        false
    }
}

/// Simulated fills against an in-memory USDT balance.
pub struct PaperExecutor {
    balance: Mutex<Decimal>,
    slippage_percent: Decimal,
    fee_rate: Decimal,
}

impl PaperExecutor {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            balance: Mutex::new(starting_balance),
            slippage_percent: EXPECTED_SLIPPAGE_PERCENT,
            fee_rate: TAKER_FEE,
        }
    }

    pub fn with_costs(mut self, slippage_percent: Decimal, fee_rate: Decimal) -> Self {
        self.slippage_percent = slippage_percent;
        self.fee_rate = fee_rate;
        self
    }

    fn fill_price(&self, side: Side, price: Decimal) -> Decimal {
        let slip = self.slippage_percent / Decimal::from(100);
        match side {
            Side::Buy => price * (Decimal::ONE + slip),
            Side::Sell => price * (Decimal::ONE - slip),
        }
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    async fn market_buy(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Result<Fill> {
        let fill_price = self.fill_price(Side::Buy, price);
        let cost = quantity * fill_price;
        let fee = cost * self.fee_rate;

        let mut balance = self.balance.lock().await;
        if cost + fee > *balance {
            return Err(BotError::InsufficientBalance {
                required: (cost + fee).round_dp(4).to_string(),
                available: balance.round_dp(4).to_string(),
            }
            .into());
        }
        *balance -= cost + fee;

        info!("[PAPER] BUY {} {} @ {} (fee {})", quantity, symbol, fill_price.round_dp(6), fee.round_dp(6));
        Ok(Fill {
            symbol: symbol.to_string(),
            side: Side::Buy,
            quantity,
            price: fill_price,
            fee,
        })
    }

    async fn market_sell(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Result<Fill> {
        let fill_price = self.fill_price(Side::Sell, price);
        let proceeds = quantity * fill_price;
        let fee = proceeds * self.fee_rate;

        let mut balance = self.balance.lock().await;
        *balance += proceeds - fee;

        info!("[PAPER] SELL {} {} @ {} (fee {})", quantity, symbol, fill_price.round_dp(6), fee.round_dp(6));
        Ok(Fill {
            symbol: symbol.to_string(),
            side: Side::Sell,
            quantity,
            price: fill_price,
            fee,
        })
    }

    async fn balance(&self) -> Result<Decimal> {
        Ok(*self.balance.lock().await)
    }

    fn is_paper(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn paper_round_trip_pays_costs() {
        let exec = PaperExecutor::new(dec!(1000));
        let buy = exec.market_buy("BTCUSDT", dec!(1), dec!(100)).await.unwrap();
        assert_eq!(buy.price, dec!(100.03));
        assert_eq!(buy.fee, dec!(0.10003));
        assert_eq!(exec.balance().await.unwrap(), dec!(1000) - dec!(100.03) - dec!(0.10003));

        let sell = exec.market_sell("BTCUSDT", dec!(1), dec!(100)).await.unwrap();
        assert_eq!(sell.price, dec!(99.97));
        assert!(exec.balance().await.unwrap() < dec!(1000));
        assert!(exec.is_paper());
    }

    #[tokio::test]
    async fn paper_rejects_oversized_buy() {
        let exec = PaperExecutor::new(dec!(50)).with_costs(Decimal::ZERO, Decimal::ZERO);
        let err = exec.market_buy("ETHUSDT", dec!(1), dec!(60)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BotError>(),
            Some(BotError::InsufficientBalance { .. })
        ));
        assert_eq!(exec.balance().await.unwrap(), dec!(50));
    }
}
