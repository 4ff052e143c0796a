//! Configuration from the environment

use crate::error::{Error, Result};
use chrono::Weekday;
use std::path::PathBuf;

/// All configurable values for the daemon and jobs
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind_addr: String,
    /// Shared secret for the cron endpoints; required to serve, and there
    /// is deliberately no default literal
    pub cron_secret: Option<String>,
    /// Webhook signature secret; `None` skips validation (local development only)
    pub webhook_secret: Option<String>,
    /// Public URL the gateway signs webhook requests against
    pub webhook_url: String,
    pub gateway_url: String,
    pub gateway_account: Option<String>,
    pub gateway_token: Option<String>,
    pub gateway_sender: String,
    pub checkin_stale_hours: i64,
    pub reminder_window_hours: i64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub weigh_day: Weekday,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: i64,
}

impl Config {
    /// Build config from the environment
    pub fn from_env() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("could not find home directory".to_string()))?;

        let db_path = std::env::var("CARELOOP_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join(".careloop/careloop.db"));

        let cron_secret = std::env::var("CRON_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let bind_addr = env_or("BIND_ADDR", "127.0.0.1:8700");
        Ok(Self {
            db_path,
            cron_secret,
            webhook_secret: std::env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
            webhook_url: env_or(
                "WEBHOOK_URL",
                &format!("http://{}/webhook/whatsapp", bind_addr),
            ),
            bind_addr,
            gateway_url: env_or("GATEWAY_URL", "https://api.twilio.com"),
            gateway_account: std::env::var("GATEWAY_ACCOUNT_SID").ok(),
            gateway_token: std::env::var("GATEWAY_AUTH_TOKEN").ok(),
            gateway_sender: env_or("GATEWAY_SENDER", "whatsapp:+14155238886"),
            checkin_stale_hours: env_parsed("CHECKIN_STALE_HOURS", 4)?,
            reminder_window_hours: env_parsed("REMINDER_WINDOW_HOURS", 8)?,
            retry_max_attempts: env_parsed("RETRY_MAX_ATTEMPTS", 3)?,
            retry_initial_delay_ms: env_parsed("RETRY_INITIAL_DELAY_MS", 500)?,
            weigh_day: parse_weigh_day(&env_or("WEIGH_DAY", "mon"))?,
            rate_limit_max: env_parsed("RATE_LIMIT_MAX", 20)?,
            rate_limit_window_secs: env_parsed("RATE_LIMIT_WINDOW_SECS", 60)?,
        })
    }

    /// Create config for testing with custom paths
    pub fn for_test(temp_dir: &std::path::Path) -> Self {
        Self {
            db_path: temp_dir.join("careloop.db"),
            bind_addr: "127.0.0.1:0".to_string(),
            cron_secret: Some("test-cron-secret".to_string()),
            webhook_secret: None,
            webhook_url: "http://127.0.0.1:8700/webhook/whatsapp".to_string(),
            gateway_url: "http://127.0.0.1:1".to_string(),
            gateway_account: None,
            gateway_token: None,
            gateway_sender: "whatsapp:+10000000000".to_string(),
            checkin_stale_hours: 4,
            reminder_window_hours: 8,
            retry_max_attempts: 3,
            retry_initial_delay_ms: 1,
            weigh_day: Weekday::Mon,
            rate_limit_max: 20,
            rate_limit_window_secs: 60,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

fn parse_weigh_day(raw: &str) -> Result<Weekday> {
    raw.parse()
        .map_err(|_| Error::Config(format!("invalid WEIGH_DAY: {}", raw)))
}

/// Default cron send schedule for protocols that don't declare one (09:00 daily)
pub const DEFAULT_SEND_SCHEDULE: &str = "0 9 * * *";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_config() {
        let temp = std::env::temp_dir();
        let config = Config::for_test(&temp);
        assert_eq!(config.db_path, temp.join("careloop.db"));
        assert!(config.gateway_account.is_none());
        assert_eq!(config.weigh_day, Weekday::Mon);
    }

    #[test]
    fn test_parse_weigh_day() {
        assert_eq!(parse_weigh_day("mon").unwrap(), Weekday::Mon);
        assert_eq!(parse_weigh_day("sunday").unwrap(), Weekday::Sun);
        assert!(parse_weigh_day("someday").is_err());
    }

    #[test]
    fn test_default_send_schedule_parses() {
        // Normalized to 6 fields before handing to the cron crate
        let full = format!("0 {}", DEFAULT_SEND_SCHEDULE);
        assert!(<cron::Schedule as std::str::FromStr>::from_str(&full).is_ok());
    }
}
