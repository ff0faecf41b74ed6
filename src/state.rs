use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bot flags and balances that survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotState {
    pub recovery_mode: bool,
    pub profit_locked: bool,
    pub current_balance: Decimal,
    pub daily_start_balance: Decimal,
    pub last_update: DateTime<Utc>,
}

impl BotState {
    pub fn new(balance: Decimal) -> Self {
        Self {
            recovery_mode: false,
            profit_locked: false,
            current_balance: balance,
            daily_start_balance: balance,
            last_update: Utc::now(),
        }
    }

    /// Missing or unreadable files fall back to a fresh state.
    pub fn load_or_default(path: impl AsRef<Path>, balance: Decimal) -> Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => {
                info!("No saved state at {}, starting fresh", path.display());
                return Self::new(balance);
            }
        };

        match serde_json::from_str::<BotState>(&content) {
            Ok(state) => {
                info!(
                    "Loaded state from {} (balance {}, recovery {}, locked {})",
                    path.display(),
                    state.current_balance,
                    state.recovery_mode,
                    state.profit_locked
                );
                state
            }
            Err(e) => {
                warn!("Corrupted state file {}: {}. Using defaults", path.display(), e);
                Self::new(balance)
            }
        }
    }

    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.last_update = Utc::now();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write state to {}", path.as_ref().display()))?;
        Ok(())
    }

    /// True when the saved day differs from `now`'s UTC day.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.last_update.date_naive() != now.date_naive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot_state.json");

        let mut state = BotState::new(dec!(250));
        state.recovery_mode = true;
        state.current_balance = dec!(243.5);
        state.save(&path).unwrap();

        let loaded = BotState::load_or_default(&path, dec!(100));
        assert!(loaded.recovery_mode);
        assert!(!loaded.profit_locked);
        assert_eq!(loaded.current_balance, dec!(243.5));
        assert_eq!(loaded.daily_start_balance, dec!(250));
    }

    #[test]
    fn missing_or_corrupt_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = BotState::load_or_default(dir.path().join("nope.json"), dec!(100));
        assert_eq!(missing.current_balance, dec!(100));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let corrupt = BotState::load_or_default(&path, dec!(75));
        assert_eq!(corrupt.current_balance, dec!(75));
        assert!(!corrupt.recovery_mode);
    }

    #[test]
    fn staleness_follows_utc_day() {
        let state = BotState::new(dec!(1));
        assert!(!state.is_stale(state.last_update));
        assert!(state.is_stale(state.last_update + chrono::Duration::days(1)));
    }
}
