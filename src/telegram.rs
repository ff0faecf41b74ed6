use crate::bot::BotCommand;
use crate::config::TelegramConfig;
use crate::history::{ClosedTrade, DailyStats};
use crate::positions::Position;
use anyhow::Result;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

const API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_SECS: u64 = 30;

pub const HELP_TEXT: &str = "<b>Commands</b>\n\
/status - balance, daily PnL and mode\n\
/positions - open positions\n\
/pause - stop opening new trades\n\
/resume - resume trading\n\
/stop - close the bot\n\
/help - this message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    Bot(BotCommand),
    Help,
}

/// `/status`, `/status@my_bot` and friends. Anything else is ignored.
pub fn parse_command(text: &str) -> Option<ChatCommand> {
    let word = text.split_whitespace().next()?;
    let word = word.strip_prefix('/')?;
    let name = word.split('@').next().unwrap_or(word);
    let command = match name.to_lowercase().as_str() {
        "status" => ChatCommand::Bot(BotCommand::Status),
        "positions" => ChatCommand::Bot(BotCommand::Positions),
        "pause" => ChatCommand::Bot(BotCommand::Pause),
        "resume" => ChatCommand::Bot(BotCommand::Resume),
        "stop" => ChatCommand::Bot(BotCommand::Stop),
        "help" | "start" => ChatCommand::Help,
        _ => return None,
    };
    Some(command)
}

pub fn format_entry(position: &Position) -> String {
    format!(
        "🟢 <b>{} {}</b>\nEntry: {}\nQty: {}\nSL: {} | TP: {}\nStrength: {:.2} ({} signals){}",
        position.side,
        position.symbol,
        position.entry_price.round_dp(6),
        position.quantity,
        position.stop_loss.round_dp(6),
        position.take_profit.round_dp(6),
        position.signal_strength,
        position.confluence,
        if position.is_recovery { "\n♻️ Recovery entry" } else { "" }
    )
}

pub fn format_exit(trade: &ClosedTrade) -> String {
    let icon = if trade.is_win() { "✅" } else { "❌" };
    format!(
        "{} <b>{} closed</b> ({})\nExit: {}\nPnL: {} USDT ({}%)\nHeld: {}s",
        icon,
        trade.symbol,
        trade.exit_reason,
        trade.exit_price.round_dp(6),
        trade.pnl_amount.round_dp(4),
        trade.pnl_percent.round_dp(2),
        trade.duration_secs()
    )
}

pub fn format_daily_summary(stats: &DailyStats) -> String {
    format!(
        "📊 <b>Daily summary</b>\nTrades: {}\nWin rate: {:.1}%\nDaily PnL: {:+.2}%\nBalance: {} USDT",
        stats.total_trades,
        stats.win_rate,
        stats.daily_pnl_percent,
        stats.current_balance.round_dp(2)
    )
}

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
    enabled: bool,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Self {
        let enabled = config.enabled && !config.bot_token.is_empty() && !config.chat_id.is_empty();
        if config.enabled && !enabled {
            warn!("Telegram enabled but token or chat id missing, notifications off");
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SECS + 10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(&TelegramConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", API_BASE, self.bot_token, method)
    }

    pub async fn send(&self, text: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        let response = self.client.post(self.url("sendMessage")).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("Telegram sendMessage failed: {} {}", status, detail);
        }
        Ok(())
    }

    /// Fire and forget; failures are only logged.
    pub async fn notify(&self, text: &str) {
        if let Err(e) = self.send(text).await {
            warn!("Telegram notification failed: {}", e);
        }
    }

    pub async fn notify_entry(&self, position: &Position) {
        self.notify(&format_entry(position)).await;
    }

    pub async fn notify_exit(&self, trade: &ClosedTrade) {
        self.notify(&format_exit(trade)).await;
    }

    pub async fn notify_daily_summary(&self, stats: &DailyStats) {
        self.notify(&format_daily_summary(stats)).await;
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let response = self
            .client
            .get(self.url("getUpdates"))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", LONG_POLL_SECS.to_string()),
            ])
            .send()
            .await?;
        let updates: UpdatesResponse = response.json().await?;
        if !updates.ok {
            anyhow::bail!("Telegram getUpdates returned ok=false");
        }
        Ok(updates.result)
    }

    /// Long-poll for chat commands and forward them to the bot until the
    /// receiving side hangs up.
    pub async fn poll_commands(self, commands: mpsc::Sender<BotCommand>) {
        if !self.enabled {
            return;
        }
        let allowed_chat: i64 = match self.chat_id.trim().parse() {
            Ok(id) => id,
            Err(_) => {
                error!("Telegram chat id {:?} is not numeric, command polling disabled", self.chat_id);
                return;
            }
        };
        info!("Telegram command polling started");

        let mut offset = 0;
        loop {
            if commands.is_closed() {
                break;
            }
            let updates = match self.get_updates(offset).await {
                Ok(u) => u,
                Err(e) => {
                    warn!("Telegram polling error: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(message) = update.message else { continue };
                if message.chat.id != allowed_chat {
                    debug!("Ignoring message from chat {}", message.chat.id);
                    continue;
                }
                match message.text.as_deref().and_then(parse_command) {
                    Some(ChatCommand::Help) => self.notify(HELP_TEXT).await,
                    Some(ChatCommand::Bot(command)) => {
                        if commands.send(command).await.is_err() {
                            return;
                        }
                    }
                    None => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::test_trade;
    use crate::positions::test_position;
    use crate::signals::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("/status"), Some(ChatCommand::Bot(BotCommand::Status)));
        assert_eq!(parse_command("/Pause@scalper_bot now"), Some(ChatCommand::Bot(BotCommand::Pause)));
        assert_eq!(parse_command("/help"), Some(ChatCommand::Help));
        assert_eq!(parse_command("status"), None);
        assert_eq!(parse_command("/buy BTC"), None);
        assert_eq!(parse_command(""), None);
    }

    #[test]
    fn formats_messages() {
        let position = test_position(Side::Buy, dec!(100), dec!(99), dec!(102));
        let entry = format_entry(&position);
        assert!(entry.contains("BUY BTCUSDT"));
        assert!(entry.contains("SL: 99"));

        let exit = format_exit(&test_trade("ETHUSDT", dec!(-1.5)));
        assert!(exit.starts_with("❌"));
        assert!(exit.contains("(SL)"));
    }

    #[tokio::test]
    async fn disabled_notifier_is_noop() {
        let notifier = TelegramNotifier::disabled();
        assert!(!notifier.is_enabled());
        assert!(notifier.send("hello").await.is_ok());
    }
}
