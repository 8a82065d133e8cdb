use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{BookingSettings, RetryPolicy};
use crate::maintenance::MaintenanceConfig;
use crate::model::*;

/// Daemon settings, read from `VIEWINGS_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub booking: BookingSettings,
    pub maintenance: MaintenanceConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse(&lookup, "VIEWINGS_RETRY_ATTEMPTS")
                .unwrap_or(retry_defaults.max_attempts),
            initial_delay: parse(&lookup, "VIEWINGS_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(retry_defaults.initial_delay),
            ..retry_defaults
        };

        // Negative or overflowing leads would admit bookings in the past.
        let min_lead = parse::<i64>(&lookup, "VIEWINGS_MIN_LEAD_MINUTES")
            .filter(|m| *m >= 0)
            .and_then(|m| m.checked_mul(MINUTE_MS))
            .unwrap_or(HOUR_MS);

        let maintenance = MaintenanceConfig {
            compact_threshold: parse(&lookup, "VIEWINGS_COMPACT_THRESHOLD").unwrap_or(1000),
            ..MaintenanceConfig::default()
        };

        Self {
            data_dir: lookup("VIEWINGS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: parse(&lookup, "VIEWINGS_METRICS_PORT"),
            booking: BookingSettings { min_lead, retry },
            maintenance,
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
