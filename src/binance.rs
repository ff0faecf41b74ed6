use crate::constants::API_TIMEOUT_SECS;
use crate::error::BotError;
use crate::market_data::Candle;
use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use reqwest::{Client, Response};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const KLINES_PER_REQUEST: u16 = 1000;

#[derive(Debug, Clone)]
pub struct BinanceClient {
    pub client: Client,
    api_key: String,
    secret_key: String,
    pub base_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OrderBookTicker {
    pub symbol: String,
    #[serde(rename = "bidPrice")]
    pub bid_price: String,
    #[serde(rename = "bidQty")]
    pub bid_qty: String,
    #[serde(rename = "askPrice")]
    pub ask_price: String,
    #[serde(rename = "askQty")]
    pub ask_qty: String,
}

impl OrderBookTicker {
    pub fn mid_price(&self) -> Option<Decimal> {
        let bid = Decimal::from_str(&self.bid_price).ok()?;
        let ask = Decimal::from_str(&self.ask_price).ok()?;
        Some((bid + ask) / Decimal::from(2))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AccountInfo {
    #[serde(rename = "makerCommission")]
    pub maker_commission: u32,
    #[serde(rename = "takerCommission")]
    pub taker_commission: u32,
    #[serde(rename = "canTrade")]
    pub can_trade: bool,
    pub balances: Vec<Balance>,
}

impl AccountInfo {
    /// Free balance of `asset`, zero when absent.
    pub fn free(&self, asset: &str) -> Decimal {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .and_then(|b| Decimal::from_str(&b.free).ok())
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Balance {
    pub asset: String,
    pub free: String,
    pub locked: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NewOrderResponse {
    pub symbol: String,
    #[serde(rename = "orderId")]
    pub order_id: u64,
    #[serde(rename = "clientOrderId")]
    pub client_order_id: String,
    #[serde(rename = "transactTime")]
    pub transact_time: u64,
    #[serde(rename = "origQty")]
    pub orig_qty: String,
    #[serde(rename = "executedQty")]
    pub executed_qty: String,
    #[serde(rename = "cummulativeQuoteQty")]
    pub cummulative_quote_qty: String,
    pub status: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
}

impl NewOrderResponse {
    /// Volume weighted fill price, if anything executed.
    pub fn average_price(&self) -> Option<Decimal> {
        let qty = Decimal::from_str(&self.executed_qty).ok()?;
        let quote = Decimal::from_str(&self.cummulative_quote_qty).ok()?;
        if qty > Decimal::ZERO {
            Some(quote / qty)
        } else {
            None
        }
    }

    pub fn executed_quantity(&self) -> Decimal {
        Decimal::from_str(&self.executed_qty).unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Ticker24hr {
    pub symbol: String,
    #[serde(rename = "priceChangePercent")]
    pub price_change_percent: String,
    #[serde(rename = "lastPrice")]
    pub last_price: String,
    #[serde(rename = "highPrice")]
    pub high_price: String,
    #[serde(rename = "lowPrice")]
    pub low_price: String,
    pub volume: String,
    #[serde(rename = "quoteVolume")]
    pub quote_volume: String,
}

fn decimal_field(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => n
            .as_i64()
            .map(Decimal::from)
            .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        _ => None,
    }
}

/// One row of the klines array. Malformed rows yield `None`.
pub fn parse_kline_row(row: &Value) -> Option<Candle> {
    let fields = row.as_array()?;
    if fields.len() < 7 {
        return None;
    }
    Some(Candle {
        open_time: fields[0].as_i64()?,
        open: decimal_field(&fields[1])?,
        high: decimal_field(&fields[2])?,
        low: decimal_field(&fields[3])?,
        close: decimal_field(&fields[4])?,
        volume: decimal_field(&fields[5])?,
        close_time: fields[6].as_i64()?,
    })
}

pub fn parse_klines(body: &Value) -> Vec<Candle> {
    let Some(rows) = body.as_array() else {
        return Vec::new();
    };
    let candles: Vec<Candle> = rows.iter().filter_map(parse_kline_row).collect();
    if candles.len() != rows.len() {
        warn!("Skipped {} malformed kline rows", rows.len() - candles.len());
    }
    candles
}

/// Binance wants plain decimal strings without exponent or trailing zeros.
pub fn format_quantity(quantity: Decimal) -> String {
    quantity.round_dp(6).normalize().to_string()
}

async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BotError::Exchange(format!("HTTP {}: {}", status.as_u16(), body)).into())
}

impl BinanceClient {
    pub fn new(api_key: String, secret_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_key,
            secret_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty()
    }

    fn sign(&self, query_string: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| BotError::Config(format!("invalid secret key: {e}")))?;
        mac.update(query_string.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode(params: &BTreeMap<String, String>) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in params {
            serializer.append_pair(k, v);
        }
        serializer.finish()
    }

    fn build_signed_query(&self, params: &BTreeMap<String, String>) -> Result<String> {
        let mut query_params = params.clone();
        query_params.insert("timestamp".to_string(), Utc::now().timestamp_millis().to_string());
        query_params
            .entry("recvWindow".to_string())
            .or_insert_with(|| "5000".to_string());

        let query_string = Self::encode(&query_params);
        let signature = self.sign(&query_string)?;
        Ok(format!("{query_string}&signature={signature}"))
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str, params: &BTreeMap<String, String>) -> Result<T> {
        let url = format!("{}{}?{}", self.base_url, path, Self::encode(params));
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        let response = check_response(response).await?;
        Ok(response.json::<T>().await?)
    }

    pub async fn get_account_info(&self) -> Result<AccountInfo> {
        let query_string = self.build_signed_query(&BTreeMap::new())?;
        let url = format!("{}/api/v3/account?{}", self.base_url, query_string);

        let response = self
            .client
            .get(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let response = check_response(response).await?;
        Ok(response.json::<AccountInfo>().await?)
    }

    pub async fn get_usdt_balance(&self) -> Result<Decimal> {
        let account = self
            .get_account_info()
            .await
            .context("Failed to fetch account info")?;
        Ok(account.free("USDT"))
    }

    pub async fn get_order_book_ticker(&self, symbol: &str) -> Result<OrderBookTicker> {
        let params = BTreeMap::from([("symbol".to_string(), symbol.to_string())]);
        self.get_public("/api/v3/ticker/bookTicker", &params).await
    }

    pub async fn get_24hr_ticker(&self, symbol: &str) -> Result<Ticker24hr> {
        let params = BTreeMap::from([("symbol".to_string(), symbol.to_string())]);
        self.get_public("/api/v3/ticker/24hr", &params).await
    }

    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u16) -> Result<Vec<Candle>> {
        let params = BTreeMap::from([
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
            ("limit".to_string(), limit.to_string()),
        ]);
        let body: Value = self.get_public("/api/v3/klines", &params).await?;
        Ok(parse_klines(&body))
    }

    /// Up to `KLINES_PER_REQUEST` candles opening in `[start_ms, end_ms]`.
    pub async fn get_klines_range(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let params = BTreeMap::from([
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
            ("startTime".to_string(), start_ms.to_string()),
            ("endTime".to_string(), end_ms.to_string()),
            ("limit".to_string(), KLINES_PER_REQUEST.to_string()),
        ]);
        let body: Value = self.get_public("/api/v3/klines", &params).await?;
        Ok(parse_klines(&body))
    }

    async fn post_order(&self, params: BTreeMap<String, String>) -> Result<NewOrderResponse> {
        let query_string = self.build_signed_query(&params)?;
        let url = format!("{}/api/v3/order", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(query_string)
            .send()
            .await?;
        let response = check_response(response).await?;
        Ok(response.json::<NewOrderResponse>().await?)
    }

    pub async fn place_market_order(&self, symbol: &str, side: &str, quantity: Decimal) -> Result<NewOrderResponse> {
        let params = BTreeMap::from([
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.to_string()),
            ("type".to_string(), "MARKET".to_string()),
            ("quantity".to_string(), format_quantity(quantity)),
        ]);
        self.post_order(params)
            .await
            .with_context(|| format!("Market {side} {symbol} failed"))
    }

    pub async fn place_limit_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: Decimal,
        price: Decimal,
        time_in_force: &str,
    ) -> Result<NewOrderResponse> {
        let params = BTreeMap::from([
            ("symbol".to_string(), symbol.to_string()),
            ("side".to_string(), side.to_string()),
            ("type".to_string(), "LIMIT".to_string()),
            ("timeInForce".to_string(), time_in_force.to_string()),
            ("quantity".to_string(), format_quantity(quantity)),
            ("price".to_string(), price.round_dp(8).normalize().to_string()),
        ]);
        self.post_order(params)
            .await
            .with_context(|| format!("Limit {side} {symbol} failed"))
    }
}
