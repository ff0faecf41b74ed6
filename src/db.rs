//! SQLite persistence for the dashboard: users, bot configs, trades and
//! daily performance rows.

use crate::bot_config::BotConfig;
use crate::error::{BotError, BotResult};
use crate::history::ClosedTrade;
use crate::signals::to_f64;
use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        hashed_password TEXT NOT NULL,
        api_key_encrypted TEXT,
        api_secret_encrypted TEXT,
        is_active BOOLEAN NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        last_login TEXT
    )",
    "CREATE TABLE IF NOT EXISTS bot_configs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        config_toml TEXT NOT NULL,
        config_version TEXT NOT NULL,
        strategy_name TEXT NOT NULL,
        bot_type TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        is_active BOOLEAN NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_used_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_bot_configs_user ON bot_configs(user_id)",
    "CREATE TABLE IF NOT EXISTS trades (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        status TEXT NOT NULL,
        entry_price REAL NOT NULL,
        exit_price REAL,
        quantity REAL NOT NULL,
        profit_loss_usd REAL NOT NULL DEFAULT 0,
        profit_loss_percent REAL NOT NULL DEFAULT 0,
        exit_reason TEXT,
        strategy TEXT,
        signal_strength REAL,
        entry_time TEXT NOT NULL,
        exit_time TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_trades_user_time ON trades(user_id, entry_time)",
    "CREATE TABLE IF NOT EXISTS daily_performance (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        date TEXT NOT NULL,
        total_trades INTEGER NOT NULL DEFAULT 0,
        winning_trades INTEGER NOT NULL DEFAULT 0,
        losing_trades INTEGER NOT NULL DEFAULT 0,
        total_profit_loss REAL NOT NULL DEFAULT 0,
        max_drawdown REAL NOT NULL DEFAULT 0,
        win_rate REAL NOT NULL DEFAULT 0,
        best_trade_profit REAL NOT NULL DEFAULT 0,
        worst_trade_loss REAL NOT NULL DEFAULT 0,
        UNIQUE(user_id, date)
    )",
];

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub hashed_password: String,
    pub api_key_encrypted: Option<String>,
    pub api_secret_encrypted: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    pub fn has_api_keys(&self) -> bool {
        self.api_key_encrypted.is_some() && self.api_secret_encrypted.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct StoredConfig {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub config_toml: String,
    pub config_version: String,
    pub strategy_name: String,
    pub bot_type: String,
    pub version: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct TradeRecord {
    pub id: i64,
    pub user_id: i64,
    pub symbol: String,
    pub side: String,
    pub status: String,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub quantity: f64,
    pub profit_loss_usd: f64,
    pub profit_loss_percent: f64,
    pub exit_reason: Option<String>,
    pub strategy: Option<String>,
    pub signal_strength: Option<f64>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct DailyPerformance {
    pub user_id: i64,
    pub date: NaiveDate,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub total_profit_loss: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub best_trade_profit: f64,
    pub worst_trade_loss: f64,
}

fn unique_violation(err: sqlx::Error, what: &str) -> BotError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => BotError::Conflict(what.to_string()),
        _ => BotError::Database(err),
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) and migrate. In-memory URLs get a single
    /// connection so every query sees the same database.
    pub async fn connect(url: &str) -> BotResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        info!("Database ready at {}", url);
        Ok(db)
    }

    pub async fn in_memory() -> BotResult<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> BotResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- users ----

    pub async fn create_user(&self, username: &str, email: &str, hashed_password: &str) -> BotResult<User> {
        let id = sqlx::query(
            "INSERT INTO users (username, email, hashed_password, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(username)
        .bind(email)
        .bind(hashed_password)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "Username or email already registered"))?
        .last_insert_rowid();
        self.user_by_id(id).await
    }

    pub async fn user_by_id(&self, id: i64) -> BotResult<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BotError::NotFound("User".into()))
    }

    pub async fn user_by_username(&self, username: &str) -> BotResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn user_by_email(&self, email: &str) -> BotResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn touch_login(&self, user_id: i64) -> BotResult<()> {
        sqlx::query("UPDATE users SET last_login = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_api_keys(&self, user_id: i64, api_key_encrypted: &str, api_secret_encrypted: &str) -> BotResult<()> {
        let result = sqlx::query("UPDATE users SET api_key_encrypted = ?, api_secret_encrypted = ? WHERE id = ?")
            .bind(api_key_encrypted)
            .bind(api_secret_encrypted)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BotError::NotFound("User".into()));
        }
        Ok(())
    }

    pub async fn clear_api_keys(&self, user_id: i64) -> BotResult<()> {
        sqlx::query("UPDATE users SET api_key_encrypted = NULL, api_secret_encrypted = NULL WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_users(&self) -> BotResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM users").fetch_one(&self.pool).await?)
    }

    // ---- bot configs ----

    pub async fn list_configs(&self, user_id: i64) -> BotResult<Vec<StoredConfig>> {
        Ok(sqlx::query_as::<_, StoredConfig>(
            "SELECT * FROM bot_configs WHERE user_id = ? ORDER BY updated_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Only returns configs owned by `user_id`.
    pub async fn get_config(&self, user_id: i64, id: i64) -> BotResult<StoredConfig> {
        sqlx::query_as::<_, StoredConfig>("SELECT * FROM bot_configs WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BotError::NotFound("Configuration".into()))
    }

    pub async fn create_config(&self, user_id: i64, name: &str, config: &BotConfig) -> BotResult<StoredConfig> {
        let text = config.to_toml().map_err(|e| BotError::Config(e.to_string()))?;
        let now = Utc::now();
        let id = sqlx::query(
            "INSERT INTO bot_configs
                (user_id, name, config_toml, config_version, strategy_name, bot_type, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(&text)
        .bind(&config.config_version)
        .bind(&config.strategy_name)
        .bind(config.bot_type.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        self.get_config(user_id, id).await
    }

    /// Replace the stored document and bump its version.
    pub async fn update_config(
        &self,
        user_id: i64,
        id: i64,
        name: Option<&str>,
        config: &BotConfig,
    ) -> BotResult<StoredConfig> {
        let existing = self.get_config(user_id, id).await?;
        let text = config.to_toml().map_err(|e| BotError::Config(e.to_string()))?;
        sqlx::query(
            "UPDATE bot_configs
             SET name = ?, config_toml = ?, config_version = ?, strategy_name = ?, bot_type = ?,
                 version = version + 1, updated_at = ?
             WHERE id = ? AND user_id = ?",
        )
        .bind(name.unwrap_or(&existing.name))
        .bind(&text)
        .bind(&config.config_version)
        .bind(&config.strategy_name)
        .bind(config.bot_type.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        self.get_config(user_id, id).await
    }

    pub async fn delete_config(&self, user_id: i64, id: i64) -> BotResult<()> {
        let result = sqlx::query("DELETE FROM bot_configs WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BotError::NotFound("Configuration".into()));
        }
        Ok(())
    }

    /// Mark one config active; every other config of the user is deactivated.
    pub async fn activate_config(&self, user_id: i64, id: i64) -> BotResult<StoredConfig> {
        self.get_config(user_id, id).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE bot_configs SET is_active = 0 WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE bot_configs SET is_active = 1, last_used_at = ? WHERE id = ? AND user_id = ?")
            .bind(Utc::now())
            .bind(id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.get_config(user_id, id).await
    }

    pub async fn active_config(&self, user_id: i64) -> BotResult<Option<StoredConfig>> {
        Ok(sqlx::query_as::<_, StoredConfig>(
            "SELECT * FROM bot_configs WHERE user_id = ? AND is_active = 1 LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn count_configs(&self) -> BotResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM bot_configs").fetch_one(&self.pool).await?)
    }

    // ---- trades ----

    pub async fn record_trade(&self, user_id: i64, trade: &ClosedTrade, strategy: &str) -> BotResult<i64> {
        let id = sqlx::query(
            "INSERT INTO trades
                (user_id, symbol, side, status, entry_price, exit_price, quantity, profit_loss_usd,
                 profit_loss_percent, exit_reason, strategy, signal_strength, entry_time, exit_time)
             VALUES (?, ?, ?, 'CLOSED', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(to_f64(trade.entry_price))
        .bind(to_f64(trade.exit_price))
        .bind(to_f64(trade.quantity))
        .bind(to_f64(trade.pnl_amount))
        .bind(to_f64(trade.pnl_percent))
        .bind(&trade.exit_reason)
        .bind(strategy)
        .bind(trade.signal_strength)
        .bind(trade.entry_time)
        .bind(trade.exit_time)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn list_trades(&self, user_id: i64, limit: i64) -> BotResult<Vec<TradeRecord>> {
        Ok(sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE user_id = ? ORDER BY entry_time DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Profit of every trade the user closed on `date`, in exit order.
    pub async fn closed_pnls_on(&self, user_id: i64, date: NaiveDate) -> BotResult<Vec<f64>> {
        let rows: Vec<(f64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT profit_loss_usd, exit_time FROM trades
             WHERE user_id = ? AND exit_time IS NOT NULL
             ORDER BY exit_time, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter(|(_, exit)| exit.date_naive() == date)
            .map(|(pnl, _)| pnl)
            .collect())
    }

    pub async fn count_trades(&self) -> BotResult<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM trades").fetch_one(&self.pool).await?)
    }

    // ---- daily performance ----

    pub async fn upsert_daily_performance(&self, row: &DailyPerformance) -> BotResult<()> {
        sqlx::query(
            "INSERT INTO daily_performance
                (user_id, date, total_trades, winning_trades, losing_trades, total_profit_loss,
                 max_drawdown, win_rate, best_trade_profit, worst_trade_loss)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, date) DO UPDATE SET
                total_trades = excluded.total_trades,
                winning_trades = excluded.winning_trades,
                losing_trades = excluded.losing_trades,
                total_profit_loss = excluded.total_profit_loss,
                max_drawdown = excluded.max_drawdown,
                win_rate = excluded.win_rate,
                best_trade_profit = excluded.best_trade_profit,
                worst_trade_loss = excluded.worst_trade_loss",
        )
        .bind(row.user_id)
        .bind(row.date)
        .bind(row.total_trades)
        .bind(row.winning_trades)
        .bind(row.losing_trades)
        .bind(row.total_profit_loss)
        .bind(row.max_drawdown)
        .bind(row.win_rate)
        .bind(row.best_trade_profit)
        .bind(row.worst_trade_loss)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rebuild the user's row for `date` from the stored trades.
    pub async fn refresh_daily_performance(&self, user_id: i64, date: NaiveDate) -> BotResult<DailyPerformance> {
        let pnls = self.closed_pnls_on(user_id, date).await?;
        let row = daily_row(user_id, date, &pnls);
        self.upsert_daily_performance(&row).await?;
        Ok(row)
    }

    pub async fn daily_performance(&self, user_id: i64, date: NaiveDate) -> BotResult<Option<DailyPerformance>> {
        Ok(sqlx::query_as::<_, DailyPerformance>(
            "SELECT user_id, date, total_trades, winning_trades, losing_trades, total_profit_loss,
                    max_drawdown, win_rate, best_trade_profit, worst_trade_loss
             FROM daily_performance WHERE user_id = ? AND date = ?",
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?)
    }
}

/// Summarise one day of trade results, given in exit order.
///
/// `max_drawdown` is the deepest fall of the running PnL from its peak.
pub fn daily_row(user_id: i64, date: NaiveDate, pnls: &[f64]) -> DailyPerformance {
    let winning = pnls.iter().filter(|p| **p > 0.0).count() as i64;
    let losing = pnls.iter().filter(|p| **p < 0.0).count() as i64;
    let total = pnls.len() as i64;

    let (mut running, mut peak, mut max_drawdown) = (0.0_f64, 0.0_f64, 0.0_f64);
    for pnl in pnls {
        running += pnl;
        peak = peak.max(running);
        max_drawdown = max_drawdown.max(peak - running);
    }

    DailyPerformance {
        user_id,
        date,
        total_trades: total,
        winning_trades: winning,
        losing_trades: losing,
        total_profit_loss: pnls.iter().sum(),
        max_drawdown,
        win_rate: if total > 0 { winning as f64 / total as f64 * 100.0 } else { 0.0 },
        best_trade_profit: pnls.iter().copied().fold(0.0, f64::max),
        worst_trade_loss: pnls.iter().copied().fold(0.0, f64::min),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot_config::template;
    use crate::history::test_trade;
    use rust_decimal_macros::dec;

    async fn db_with_user() -> (Database, User) {
        let db = Database::in_memory().await.unwrap();
        let user = db.create_user("alice", "alice@example.com", "salt$hash").await.unwrap();
        (db, user)
    }

    #[tokio::test]
    async fn users_are_unique() {
        let (db, user) = db_with_user().await;
        assert_eq!(db.user_by_username("alice").await.unwrap().unwrap().id, user.id);
        assert!(db.user_by_email("bob@example.com").await.unwrap().is_none());

        let err = db.create_user("alice", "other@example.com", "x").await.unwrap_err();
        assert!(matches!(err, BotError::Conflict(_)));
        assert!(matches!(db.user_by_id(999).await, Err(BotError::NotFound(_))));
    }

    #[tokio::test]
    async fn api_keys_set_and_clear() {
        let (db, user) = db_with_user().await;
        assert!(!user.has_api_keys());
        db.set_api_keys(user.id, "enc-key", "enc-secret").await.unwrap();
        assert!(db.user_by_id(user.id).await.unwrap().has_api_keys());
        db.clear_api_keys(user.id).await.unwrap();
        assert!(!db.user_by_id(user.id).await.unwrap().has_api_keys());
    }

    #[tokio::test]
    async fn config_lifecycle_is_scoped_and_versioned() {
        let (db, user) = db_with_user().await;
        let other = db.create_user("bob", "bob@example.com", "x").await.unwrap();

        let safe = template("safe").unwrap();
        let first = db.create_config(user.id, "Safe", &safe).await.unwrap();
        assert_eq!(first.version, 1);
        assert!(!first.is_active);

        let mut changed = safe.clone();
        changed.max_positions = 2;
        let updated = db.update_config(user.id, first.id, None, &changed).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.name, "Safe");
        assert!(updated.config_toml.contains("max_positions = 2"));

        assert!(matches!(db.get_config(other.id, first.id).await, Err(BotError::NotFound(_))));

        let second = db
            .create_config(user.id, "Aggressive", &template("aggressive").unwrap())
            .await
            .unwrap();
        db.activate_config(user.id, first.id).await.unwrap();
        db.activate_config(user.id, second.id).await.unwrap();
        let active = db.active_config(user.id).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert!(active.last_used_at.is_some());
        assert!(!db.get_config(user.id, first.id).await.unwrap().is_active);

        db.delete_config(user.id, first.id).await.unwrap();
        assert_eq!(db.list_configs(user.id).await.unwrap().len(), 1);
        assert!(db.delete_config(user.id, first.id).await.is_err());
    }

    #[tokio::test]
    async fn trades_and_daily_performance() {
        let (db, user) = db_with_user().await;
        let win = test_trade("BTCUSDT", dec!(2));
        let loss = test_trade("ETHUSDT", dec!(-1));
        db.record_trade(user.id, &win, "SCALPING").await.unwrap();
        db.record_trade(user.id, &loss, "SCALPING").await.unwrap();
        let trades = db.list_trades(user.id, 10).await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(db.count_trades().await.unwrap(), 2);

        let date = win.exit_time.date_naive();
        let mut row = daily_row(user.id, date, &[2.0, -1.0]);
        assert_eq!(row.win_rate, 50.0);
        assert_eq!(row.total_profit_loss, 1.0);
        assert_eq!(row.max_drawdown, 1.0);
        db.upsert_daily_performance(&row).await.unwrap();

        row.total_trades = 3;
        db.upsert_daily_performance(&row).await.unwrap();
        let stored = db.daily_performance(user.id, date).await.unwrap().unwrap();
        assert_eq!(stored.total_trades, 3);
        assert_eq!(stored.worst_trade_loss, -1.0);
    }

    #[tokio::test]
    async fn daily_row_is_rebuilt_from_stored_trades() {
        let (db, user) = db_with_user().await;
        let other = db.create_user("bob", "bob@example.com", "x").await.unwrap();
        let first = test_trade("BTCUSDT", dec!(3));
        let date = first.exit_time.date_naive();

        db.record_trade(user.id, &first, "SCALPING").await.unwrap();
        db.record_trade(other.id, &test_trade("BTCUSDT", dec!(9)), "SCALPING").await.unwrap();
        let row = db.refresh_daily_performance(user.id, date).await.unwrap();
        assert_eq!(row.total_trades, 1);

        let mut yesterday = test_trade("ETHUSDT", dec!(-5));
        yesterday.exit_time -= chrono::Duration::days(1);
        db.record_trade(user.id, &yesterday, "SCALPING").await.unwrap();
        db.record_trade(user.id, &test_trade("ETHUSDT", dec!(-1)), "SCALPING").await.unwrap();

        let row = db.refresh_daily_performance(user.id, date).await.unwrap();
        assert_eq!(row.total_trades, 2);
        assert_eq!(row.total_profit_loss, 2.0);
        let stored = db.daily_performance(user.id, date).await.unwrap().unwrap();
        assert_eq!(stored.total_trades, 2);
        assert_eq!(stored.worst_trade_loss, -1.0);
    }
}
