use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::NotificationConfig;
use crate::core::{AlertRecord, Market};

/// Desktop notification sender with cooldown to prevent spam.
pub struct Notifier {
    enabled: bool,
    min_level: u8,
    cooldown: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl Notifier {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_level: config.min_level,
            cooldown: Duration::from_secs(config.cooldown_seconds),
            last_sent: Mutex::new(None),
        }
    }

    /// Try to send a desktop notification for a level transition.
    /// Returns true if a notification was sent, false if skipped.
    pub fn notify(&self, market: &Market, alert: &AlertRecord) -> bool {
        if !self.enabled {
            return false;
        }
        if alert.new_level.as_u8() < self.min_level {
            return false;
        }
        if !self.check_cooldown() {
            return false;
        }

        self.send_notification(market, alert);
        true
    }

    /// Check and update cooldown. Returns true if enough time has passed.
    fn check_cooldown(&self) -> bool {
        let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.cooldown {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Fire-and-forget: send the actual desktop notification.
    fn send_notification(&self, market: &Market, alert: &AlertRecord) {
        let title = format!(
            "{} chainmonitor: {} {}",
            alert.new_level.emoji(),
            market.label,
            alert.new_level.as_str()
        );
        let direction = if alert.new_level > alert.previous_level { "↑" } else { "↓" };
        let body = format!(
            "{direction} {} → {} | {}",
            alert.previous_level.as_str(),
            alert.new_level.as_str(),
            alert.message
        );

        // Background thread so a slow notification daemon never stalls a pass
        std::thread::spawn(move || {
            if let Err(e) = notify_rust::Notification::new()
                .summary(&title)
                .body(&body)
                .show()
            {
                tracing::debug!("Desktop notification failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MarketType, RiskLevel};
    use chrono::Utc;

    fn market() -> Market {
        Market {
            id: "pool".into(),
            label: "UNISWAP_USDC_WETH".into(),
            market_type: MarketType::DexPool,
            address: "0xb4e16d0168e52d35cacd2c6185b44281ec28c9dc".into(),
            description: None,
            base_token: None,
            base_token_index: 0,
            baseline_volume: None,
        }
    }

    fn alert(new_level: RiskLevel) -> AlertRecord {
        AlertRecord {
            id: None,
            market_id: "pool".into(),
            timestamp: Utc::now(),
            previous_level: RiskLevel::Low,
            new_level,
            severity: new_level,
            message: "test".into(),
        }
    }

    #[test]
    fn cooldown_blocks_rapid_notifications() {
        let config = NotificationConfig {
            enabled: true,
            min_level: 2,
            cooldown_seconds: 30,
        };
        let notifier = Notifier::new(&config);

        assert!(notifier.check_cooldown());
        assert!(!notifier.check_cooldown());
    }

    #[test]
    fn cooldown_zero_allows_all() {
        let config = NotificationConfig {
            enabled: true,
            min_level: 2,
            cooldown_seconds: 0,
        };
        let notifier = Notifier::new(&config);
        assert!(notifier.check_cooldown());
        assert!(notifier.check_cooldown());
    }

    #[test]
    fn disabled_notifier_skips() {
        let notifier = Notifier::new(&NotificationConfig::default());
        assert!(!notifier.notify(&market(), &alert(RiskLevel::Critical)));
    }

    #[test]
    fn below_min_level_skips() {
        let config = NotificationConfig {
            enabled: true,
            min_level: 2,
            cooldown_seconds: 0,
        };
        let notifier = Notifier::new(&config);
        assert!(!notifier.notify(&market(), &alert(RiskLevel::Medium)));
    }
}
