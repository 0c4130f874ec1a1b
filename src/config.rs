use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::engine::SlotPolicy;
use crate::limits::{DAY_MS, HOUR_MS};

/// Server settings, read from `SLOTD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub reaper_interval: Duration,
    pub policy: SlotPolicy,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. A variable that is set but does
    /// not parse is an error, not a silent fallback to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let parsed = |key: &str| non_empty(&lookup, key);

        let min_notice_hours: i64 = parse_or(&lookup, "SLOTD_MIN_NOTICE_HOURS", 24)?;
        let max_advance_days: i64 = parse_or(&lookup, "SLOTD_MAX_ADVANCE_DAYS", 30)?;
        anyhow::ensure!(min_notice_hours >= 0, "SLOTD_MIN_NOTICE_HOURS must not be negative");
        anyhow::ensure!(max_advance_days > 0, "SLOTD_MAX_ADVANCE_DAYS must be positive");
        let min_notice_ms = min_notice_hours
            .checked_mul(HOUR_MS)
            .with_context(|| format!("SLOTD_MIN_NOTICE_HOURS={min_notice_hours} is out of range"))?;
        let max_advance_ms = max_advance_days
            .checked_mul(DAY_MS)
            .with_context(|| format!("SLOTD_MAX_ADVANCE_DAYS={max_advance_days} is out of range"))?;

        let max_connections: usize = parse_or(&lookup, "SLOTD_MAX_CONNECTIONS", 256)?;
        anyhow::ensure!(max_connections > 0, "SLOTD_MAX_CONNECTIONS must be positive");
        let reaper_secs: u64 = parse_or(&lookup, "SLOTD_REAPER_INTERVAL_SECS", 30)?;
        anyhow::ensure!(reaper_secs > 0, "SLOTD_REAPER_INTERVAL_SECS must be positive");

        let metrics_port = match parsed("SLOTD_METRICS_PORT") {
            Some(v) => Some(v.parse().with_context(|| format!("SLOTD_METRICS_PORT={v}"))?),
            None => None,
        };

        Ok(Self {
            port: parse_or(&lookup, "SLOTD_PORT", 5433)?,
            bind: parsed("SLOTD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(parsed("SLOTD_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("SLOTD_PASSWORD").unwrap_or_else(|| "slotd".into()),
            max_connections,
            compact_threshold: parse_or(&lookup, "SLOTD_COMPACT_THRESHOLD", 1000)?,
            reaper_interval: Duration::from_secs(reaper_secs),
            policy: SlotPolicy {
                min_notice_ms,
                max_advance_ms,
            },
            metrics_port,
            tls_cert: parsed("SLOTD_TLS_CERT"),
            tls_key: parsed("SLOTD_TLS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotd.wal")
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match non_empty(lookup, key) {
        Some(v) => v.parse().with_context(|| format!("{key}={v}")),
        None => Ok(default),
    }
}
