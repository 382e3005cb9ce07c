//! Layered configuration loading: built-in defaults, an optional config
//! file, then `PNL__`-prefixed environment variables, each layer overriding
//! the previous one.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration loading error: {0}")]
    Loading(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub system: SystemSettings,
    pub filter: FilterSettings,
    pub provider: ProviderSettings,
    /// Chain identifier applied to batch jobs when the caller does not name
    /// one explicitly.
    pub default_chain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    pub debug_mode: bool,
    /// Upper bound on wallets analyzed concurrently within a batch.
    pub max_concurrent_wallets: usize,
    /// Hard per-wallet deadline; a wallet exceeding it is recorded as failed.
    pub wallet_timeout_seconds: u64,
}

/// Thresholds for the routing-intermediary filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSettings {
    pub short_hold_seconds: i64,
    pub near_zero_pnl_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub api_base_url: String,
    pub request_timeout_seconds: u64,
    pub rate_limit_delay_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            system: SystemSettings {
                debug_mode: false,
                max_concurrent_wallets: 10,
                wallet_timeout_seconds: 600,
            },
            filter: FilterSettings {
                short_hold_seconds: 6,
                near_zero_pnl_usd: 0.01,
            },
            provider: ProviderSettings {
                api_base_url: "http://localhost:8080".to_string(),
                request_timeout_seconds: 30,
                rate_limit_delay_ms: 200,
            },
            default_chain: "solana".to_string(),
        }
    }
}

impl SystemConfig {
    /// Load configuration from `config.toml` (if present) and environment
    /// variables. Env vars use the `PNL__` prefix with `__` as the section
    /// separator, e.g. `PNL__SYSTEM__MAX_CONCURRENT_WALLETS=4`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Some("config.toml"))
    }

    pub fn load_from(file: Option<&str>) -> Result<Self, ConfigError> {
        let defaults = SystemConfig::default();

        let mut builder = Config::builder()
            .set_default("system.debug_mode", defaults.system.debug_mode)?
            .set_default(
                "system.max_concurrent_wallets",
                defaults.system.max_concurrent_wallets as i64,
            )?
            .set_default(
                "system.wallet_timeout_seconds",
                defaults.system.wallet_timeout_seconds as i64,
            )?
            .set_default("filter.short_hold_seconds", defaults.filter.short_hold_seconds)?
            .set_default("filter.near_zero_pnl_usd", defaults.filter.near_zero_pnl_usd)?
            .set_default("provider.api_base_url", defaults.provider.api_base_url)?
            .set_default(
                "provider.request_timeout_seconds",
                defaults.provider.request_timeout_seconds as i64,
            )?
            .set_default(
                "provider.rate_limit_delay_ms",
                defaults.provider.rate_limit_delay_ms as i64,
            )?
            .set_default("default_chain", defaults.default_chain)?;

        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("PNL")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: SystemConfig = settings.try_deserialize()?;
        config.validate()?;

        debug!(
            "Configuration loaded: max_concurrent_wallets={}, wallet_timeout={}s",
            config.system.max_concurrent_wallets, config.system.wallet_timeout_seconds
        );
        if config.system.debug_mode {
            info!("Debug mode enabled");
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.max_concurrent_wallets == 0 {
            return Err(ConfigError::Validation(
                "system.max_concurrent_wallets must be at least 1".to_string(),
            ));
        }
        if self.system.wallet_timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "system.wallet_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.filter.short_hold_seconds < 0 {
            return Err(ConfigError::Validation(
                "filter.short_hold_seconds must not be negative".to_string(),
            ));
        }
        if self.filter.near_zero_pnl_usd < 0.0 {
            return Err(ConfigError::Validation(
                "filter.near_zero_pnl_usd must not be negative".to_string(),
            ));
        }
        if self.provider.api_base_url.is_empty() {
            return Err(ConfigError::Validation(
                "provider.api_base_url must not be empty".to_string(),
            ));
        }
        if self.default_chain.is_empty() {
            return Err(ConfigError::Validation(
                "default_chain must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = SystemConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.system.max_concurrent_wallets, 10);
        assert_eq!(config.filter.short_hold_seconds, 6);
        assert_eq!(config.default_chain, "solana");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = SystemConfig::default();
        config.system.max_concurrent_wallets = 0;

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn negative_filter_thresholds_are_rejected() {
        let mut config = SystemConfig::default();
        config.filter.short_hold_seconds = -1;
        assert!(config.validate().is_err());

        let mut config = SystemConfig::default();
        config.filter.near_zero_pnl_usd = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let config = SystemConfig::load_from(None).expect("defaults load");
        assert_eq!(
            config.system.wallet_timeout_seconds,
            SystemConfig::default().system.wallet_timeout_seconds
        );
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = SystemConfig::default();
        let json = serde_json::to_string(&config).expect("serialize");
        let back: SystemConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(
            back.system.max_concurrent_wallets,
            config.system.max_concurrent_wallets
        );
        assert_eq!(back.provider.api_base_url, config.provider.api_base_url);
    }
}
