//! Severity-tiered alerts with per-title throttling on top of the
//! Telegram notifier.

use crate::telegram::TelegramNotifier;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    /// Minimum gap between two alerts with the same category and title.
    pub fn throttle(&self) -> Duration {
        match self {
            Severity::Critical => Duration::zero(),
            Severity::High => Duration::seconds(30),
            Severity::Medium => Duration::seconds(60),
            Severity::Low => Duration::minutes(5),
            Severity::Info => Duration::minutes(10),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Critical => "🔴 CRITICAL",
            Severity::High => "🟠 HIGH",
            Severity::Medium => "🟡 MEDIUM",
            Severity::Low => "🟢 LOW",
            Severity::Info => "ℹ️ INFO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCategory {
    Trade,
    Risk,
    System,
    Performance,
}

impl AlertCategory {
    pub fn label(&self) -> &'static str {
        match self {
            AlertCategory::Trade => "💰 TRADE",
            AlertCategory::Risk => "⚠️ RISK",
            AlertCategory::System => "⚙️ SYSTEM",
            AlertCategory::Performance => "📊 PERFORMANCE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub category: AlertCategory,
    pub title: String,
    pub message: String,
    pub fields: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: Severity, category: AlertCategory, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            title: title.into(),
            message: message.into(),
            fields: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn field(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    fn throttle_key(&self) -> String {
        format!("{:?}:{}", self.category, self.title)
    }

    pub fn format_html(&self) -> String {
        let rule = "━━━━━━━━━━━━━━━━━";
        let mut lines = vec![
            format!("{} {}", self.severity.label(), self.category.label()),
            rule.to_string(),
            format!("<b>{}</b>", self.title),
            String::new(),
            self.message.clone(),
        ];
        if !self.fields.is_empty() {
            lines.push(String::new());
            lines.extend(self.fields.iter().map(|(k, v)| format!("• {k}: {v}")));
        }
        lines.push(rule.to_string());
        lines.push(format!("🕐 {}", self.timestamp.format("%H:%M:%S UTC")));
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertStats {
    pub total: usize,
    pub throttled: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<AlertCategory, usize>,
    pub last_hour: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AlertManager {
    last_sent: HashMap<String, DateTime<Utc>>,
    history: VecDeque<Alert>,
    throttled: usize,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `alert` goes out, recording it if so. `force` skips
    /// throttling; critical alerts are never throttled.
    pub fn admit(&mut self, alert: &Alert, force: bool) -> bool {
        let key = alert.throttle_key();
        if !force {
            if let Some(last) = self.last_sent.get(&key) {
                if alert.timestamp - *last < alert.severity.throttle() {
                    debug!("Alert throttled: {}", alert.title);
                    self.throttled += 1;
                    return false;
                }
            }
        }

        self.last_sent.insert(key, alert.timestamp);
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(alert.clone());
        true
    }

    /// Deliver through Telegram unless throttled. Returns whether it was sent.
    pub async fn send(&mut self, notifier: &TelegramNotifier, alert: Alert, force: bool) -> bool {
        if !self.admit(&alert, force) {
            return false;
        }
        notifier.notify(&alert.format_html()).await;
        true
    }

    pub fn recent(&self, n: usize) -> Vec<&Alert> {
        self.history.iter().rev().take(n).collect()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> AlertStats {
        let mut stats = AlertStats {
            total: self.history.len(),
            throttled: self.throttled,
            ..AlertStats::default()
        };
        for alert in &self.history {
            *stats.by_severity.entry(alert.severity).or_default() += 1;
            *stats.by_category.entry(alert.category).or_default() += 1;
            if now - alert.timestamp < Duration::hours(1) {
                stats.last_hour += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(alert: Alert, secs: i64) -> Alert {
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        Alert {
            timestamp: base + Duration::seconds(secs),
            ..alert
        }
    }

    #[test]
    fn same_title_is_throttled_by_severity() {
        let mut alerts = AlertManager::new();
        let error = Alert::new(Severity::High, AlertCategory::System, "Cycle error", "timeout");

        assert!(alerts.admit(&at(error.clone(), 0), false));
        assert!(!alerts.admit(&at(error.clone(), 10), false));
        assert!(alerts.admit(&at(error.clone(), 31), false));

        // A different title has its own window
        let other = Alert::new(Severity::High, AlertCategory::System, "Balance error", "");
        assert!(alerts.admit(&at(other, 32), false));

        // Forced alerts always pass
        assert!(alerts.admit(&at(error, 33), true));

        let stats = alerts.stats(DateTime::from_timestamp(1_700_000_100, 0).unwrap());
        assert_eq!(stats.total, 4);
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.by_severity[&Severity::High], 4);
        assert_eq!(stats.last_hour, 4);
    }

    #[test]
    fn critical_is_never_throttled() {
        let mut alerts = AlertManager::new();
        let stop = Alert::new(Severity::Critical, AlertCategory::Risk, "Trading stopped", "daily loss");
        assert!(alerts.admit(&at(stop.clone(), 0), false));
        assert!(alerts.admit(&at(stop, 0), false));
        assert_eq!(alerts.recent(5).len(), 2);
    }

    #[test]
    fn html_lists_fields() {
        let alert = Alert::new(Severity::Info, AlertCategory::Trade, "Closed BTCUSDT", "TP hit")
            .field("PnL", "+1.20")
            .field("Balance", 101.2);
        let html = alert.format_html();
        assert!(html.starts_with("ℹ️ INFO 💰 TRADE"));
        assert!(html.contains("<b>Closed BTCUSDT</b>"));
        assert!(html.contains("• Balance: 101.2"));
    }

    #[tokio::test]
    async fn disabled_notifier_still_tracks() {
        let mut alerts = AlertManager::new();
        let notifier = TelegramNotifier::disabled();
        let alert = Alert::new(Severity::Low, AlertCategory::Performance, "Summary", "");
        assert!(alerts.send(&notifier, alert.clone(), false).await);
        assert!(!alerts.send(&notifier, alert, false).await);
        assert_eq!(alerts.stats(Utc::now()).total, 1);
    }
}
