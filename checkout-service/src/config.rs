use anyhow::{Context, Result};
use std::env;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::controller::ControllerSettings;
use crate::draft::DraftRules;
use crate::poller::PollSettings;

const MIN_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub order_service_url: String,
    pub payment_service_url: String,
    /// Unset means the cart lives in this process and is loaded via `PUT /cart`.
    pub cart_service_url: Option<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub reconcile_interval: Duration,
    pub http_timeout: Duration,
    pub min_address_len: usize,
    pub phone_digits: RangeInclusive<usize>,
    pub host: String,
    pub port: u16,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            order_service_url: "http://localhost:8084".to_string(),
            payment_service_url: "http://localhost:8086".to_string(),
            cart_service_url: None,
            poll_interval: Duration::from_millis(3_000),
            poll_timeout: Duration::from_millis(120_000),
            reconcile_interval: Duration::from_millis(2_000),
            http_timeout: Duration::from_millis(10_000),
            min_address_len: 10,
            phone_digits: 10..=11,
            host: "0.0.0.0".to_string(),
            port: 8090,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

/// `"10..=11"`, `"10-11"` or a single digit count.
fn parse_digit_range(raw: &str) -> Option<RangeInclusive<usize>> {
    let raw = raw.trim();
    let (lo, hi) = raw
        .split_once("..=")
        .or_else(|| raw.split_once('-'))
        .unwrap_or((raw, raw));
    let lo = lo.trim().parse::<usize>().ok()?;
    let hi = hi.trim().parse::<usize>().ok()?;
    (lo > 0 && lo <= hi).then_some(lo..=hi)
}

impl CheckoutConfig {
    pub fn from_env() -> Result<Self> {
        let order_service_url = env::var("ORDER_SERVICE_URL").context("ORDER_SERVICE_URL must be set")?;
        let payment_service_url =
            env::var("PAYMENT_SERVICE_URL").context("PAYMENT_SERVICE_URL must be set")?;
        let cart_service_url = env::var("CART_SERVICE_URL").ok().filter(|v| !v.trim().is_empty());
        let poll_interval_ms = env_u64("CHECKOUT_POLL_INTERVAL_MS", 3_000).max(MIN_POLL_INTERVAL_MS);
        let poll_timeout_ms = env_u64("CHECKOUT_POLL_TIMEOUT_MS", 120_000).max(poll_interval_ms);
        let reconcile_interval_ms = env_u64("CHECKOUT_RECONCILE_INTERVAL_MS", 2_000).max(MIN_POLL_INTERVAL_MS);
        let http_timeout_ms = env_u64("CHECKOUT_HTTP_TIMEOUT_MS", 10_000).max(500);
        let min_address_len = env::var("CHECKOUT_MIN_ADDRESS_LEN")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10);
        let phone_digits = env::var("CHECKOUT_PHONE_DIGITS")
            .ok()
            .and_then(|v| parse_digit_range(&v))
            .unwrap_or(10..=11);
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8090);

        Ok(Self {
            order_service_url,
            payment_service_url,
            cart_service_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            reconcile_interval: Duration::from_millis(reconcile_interval_ms),
            http_timeout: Duration::from_millis(http_timeout_ms),
            min_address_len,
            phone_digits,
            host,
            port,
        })
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            poll: PollSettings { interval: self.poll_interval, timeout: self.poll_timeout },
            reconcile_interval: self.reconcile_interval,
        }
    }

    pub fn draft_rules(&self) -> DraftRules {
        DraftRules { min_address_len: self.min_address_len, phone_digits: self.phone_digits.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_range_forms() {
        assert_eq!(parse_digit_range("10..=11"), Some(10..=11));
        assert_eq!(parse_digit_range(" 9-12 "), Some(9..=12));
        assert_eq!(parse_digit_range("10"), Some(10..=10));
        assert_eq!(parse_digit_range("12-9"), None);
        assert_eq!(parse_digit_range("abc"), None);
    }

    #[test]
    fn default_matches_documented_values() {
        let cfg = CheckoutConfig::default();
        let settings = cfg.controller_settings();
        assert_eq!(settings.poll.interval, Duration::from_secs(3));
        assert_eq!(settings.poll.timeout, Duration::from_secs(120));
        assert_eq!(cfg.draft_rules().min_address_len, 10);
    }
}
