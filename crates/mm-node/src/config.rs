//! # Node Configuration
//!
//! Runtime parameters for the chain sync node, loaded from the environment.
//!
//! ## Security Requirements
//!
//! - The signer seed MUST NOT be the default zero value in production
//! - Invalid environment values are logged and the default is kept

use mm_chain_sync::SyncConfig;
use mm_telemetry::TelemetryConfig;
use thiserror::Error;
use tracing::{info, warn};

/// Complete node configuration.
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Indexer retry and health parameters.
    pub sync: SyncConfig,
    /// Transaction signing account.
    pub signer: SignerConfig,
    /// Development ledger parameters.
    pub dev_chain: DevChainConfig,
    /// Logging configuration.
    pub telemetry: TelemetryConfig,
}

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "SECURITY VIOLATION: signer seed is default zero value. \
         Set MM_SIGNER_SEED environment variable."
    )]
    InsecureSignerSeed,
}

/// Transaction signing account.
#[derive(Clone, Default)]
pub struct SignerConfig {
    /// ed25519 seed (32 bytes). MUST NOT be default in production.
    pub seed: [u8; 32],
}

impl std::fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerConfig")
            .field("seed", &"<redacted>")
            .finish()
    }
}

/// Development ledger configuration.
#[derive(Debug, Clone)]
pub struct DevChainConfig {
    /// Interval between produced blocks. Zero disables the producer.
    pub block_time_ms: u64,
}

impl Default for DevChainConfig {
    fn default() -> Self {
        Self {
            block_time_ms: 6000,
        }
    }
}

impl NodeConfig {
    /// Load configuration from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `MM_SIGNER_SEED`: signer seed, 64 hex chars
    /// - `MM_RETRY_DELAY_MS`: indexer retry delay (default: 1000)
    /// - `MM_STATUS_TIMEOUT_MS`: health freshness window (default: 30000)
    /// - `MM_BLOCK_TIME_MS`: dev ledger block interval (default: 6000)
    /// - telemetry variables, see [`TelemetryConfig::from_env`]
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok());
        config.telemetry = TelemetryConfig::from_env();
        config
    }

    /// Load configuration through `lookup`, keeping defaults for missing or
    /// invalid values. Telemetry settings are left at their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(seed_hex) = lookup("MM_SIGNER_SEED") {
            match hex::decode(seed_hex.trim_start_matches("0x")) {
                Ok(bytes) if bytes.len() == 32 => {
                    config.signer.seed.copy_from_slice(&bytes);
                    info!("Loaded signer seed from environment");
                }
                _ => warn!("MM_SIGNER_SEED must be 32 bytes (64 hex chars)"),
            }
        }

        if let Some(value) = parse_u64(&lookup, "MM_RETRY_DELAY_MS") {
            config.sync.retry_delay_ms = value;
        }
        if let Some(value) = parse_u64(&lookup, "MM_STATUS_TIMEOUT_MS") {
            config.sync.status_timeout_ms = value;
        }
        if let Some(value) = parse_u64(&lookup, "MM_BLOCK_TIME_MS") {
            config.dev_chain.block_time_ms = value;
        }

        config
    }

    /// Validate configuration for production readiness.
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.signer.seed == [0u8; 32] {
            return Err(ConfigError::InsecureSignerSeed);
        }
        Ok(())
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid numeric setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::from_lookup(lookup(&[]));
        assert_eq!(config.sync.retry_delay_ms, 1000);
        assert_eq!(config.sync.status_timeout_ms, 30_000);
        assert_eq!(config.dev_chain.block_time_ms, 6000);
        assert_eq!(
            config.validate_for_production(),
            Err(ConfigError::InsecureSignerSeed)
        );
    }

    #[test]
    fn test_overrides() {
        let seed = "11".repeat(32);
        let config = NodeConfig::from_lookup(lookup(&[
            ("MM_SIGNER_SEED", seed.as_str()),
            ("MM_RETRY_DELAY_MS", "250"),
            ("MM_STATUS_TIMEOUT_MS", "9000"),
            ("MM_BLOCK_TIME_MS", "0"),
        ]));

        assert_eq!(config.signer.seed, [0x11; 32]);
        assert_eq!(config.sync.retry_delay_ms, 250);
        assert_eq!(config.sync.status_timeout_ms, 9000);
        assert_eq!(config.dev_chain.block_time_ms, 0);
        assert!(config.validate_for_production().is_ok());
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("MM_SIGNER_SEED", "abcd"),
            ("MM_RETRY_DELAY_MS", "soon"),
        ]));

        assert_eq!(config.signer.seed, [0u8; 32]);
        assert_eq!(config.sync.retry_delay_ms, 1000);
    }

    #[test]
    fn test_seed_is_not_printed() {
        let config = SignerConfig { seed: [0x42; 32] };
        assert!(!format!("{config:?}").contains("42"));
    }
}
