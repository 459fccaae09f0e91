//! Recognized configuration options.
//!
//! Every option is env-driven with a documented default; values outside
//! their valid range are clamped with a warning. Unknown environment
//! variables are simply ignored.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Default admin key shipped in .env.example; running with it is unsafe.
pub const DEFAULT_ADMIN_KEY: &str = "change-me-admin-key";

/// Minimum collateral for a single collateral UTXO (5 ada).
pub const DEFAULT_MIN_COLLATERAL_LOVELACE: i64 = 5_000_000;

/// How long a sync lock may be held before peers treat it as expired.
pub const DEFAULT_SYNC_LOCK_TIMEOUT: Duration = Duration::from_secs(180);

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Listen port for the HTTP layer above the core; accepted, unused here.
    pub port: u16,
    pub database_url: String,
    pub admin_key: String,
    /// Confirmations a transaction needs before the sync loop applies it.
    /// 0 disables the block lookup entirely.
    pub block_confirmations_threshold: u64,
    pub sync_lock_timeout: Duration,
    /// Parallel fan-out for extended tx fetches and dispatcher batches.
    pub max_parallel_tx: usize,
    /// Ancestry hops when verifying a transition's lineage.
    pub max_history_levels: u32,
    pub min_collateral_lovelace: i64,
    /// Validity window for revealed data in API responses (ms).
    pub reveal_data_validity_time: i64,
    /// Sync loop cadence per payment source.
    pub sync_interval: Duration,
    /// Dispatcher cadence.
    pub dispatch_interval: Duration,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize_min(name: &str, default: usize, min: usize) -> usize {
    let value = env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default);
    if value < min {
        warn!("{} below minimum {}, using minimum", name, min);
        min
    } else {
        value
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let admin_key =
            env::var("ADMIN_KEY").unwrap_or_else(|_| DEFAULT_ADMIN_KEY.to_string());
        if admin_key == DEFAULT_ADMIN_KEY {
            warn!("ADMIN_KEY is the shipped default - set a real key before exposing this instance");
        }

        Self {
            port: env_u64("PORT", 3001) as u16,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "coordinator.sqlite".to_string()),
            admin_key,
            block_confirmations_threshold: env_u64("BLOCK_CONFIRMATIONS_THRESHOLD", 1),
            sync_lock_timeout: Duration::from_secs(env_u64(
                "SYNC_LOCK_TIMEOUT_INTERVAL",
                DEFAULT_SYNC_LOCK_TIMEOUT.as_secs(),
            )),
            max_parallel_tx: env_usize_min("MAX_PARALLEL_TX", 10, 1),
            max_history_levels: env_u64("MAX_HISTORY_LEVELS", 20) as u32,
            min_collateral_lovelace: env_u64(
                "MIN_COLLATERAL_LOVELACE",
                DEFAULT_MIN_COLLATERAL_LOVELACE as u64,
            ) as i64,
            reveal_data_validity_time: env_u64("REVEAL_DATA_VALIDITY_TIME", 15 * 60 * 1000)
                as i64,
            sync_interval: Duration::from_secs(env_u64("SYNC_INTERVAL_SECONDS", 10)),
            dispatch_interval: Duration::from_secs(env_u64("DISPATCH_INTERVAL_SECONDS", 60)),
        }
    }

    pub fn sync_lock_timeout_ms(&self) -> i64 {
        self.sync_lock_timeout.as_millis() as i64
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            database_url: "coordinator.sqlite".to_string(),
            admin_key: DEFAULT_ADMIN_KEY.to_string(),
            block_confirmations_threshold: 1,
            sync_lock_timeout: DEFAULT_SYNC_LOCK_TIMEOUT,
            max_parallel_tx: 10,
            max_history_levels: 20,
            min_collateral_lovelace: DEFAULT_MIN_COLLATERAL_LOVELACE,
            reveal_data_validity_time: 15 * 60 * 1000,
            sync_interval: Duration::from_secs(10),
            dispatch_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel_tx, 10);
        assert_eq!(config.max_history_levels, 20);
        assert_eq!(config.min_collateral_lovelace, 5_000_000);
        assert_eq!(config.sync_lock_timeout, Duration::from_secs(180));
    }
}
