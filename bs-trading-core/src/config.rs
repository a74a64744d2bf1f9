//! Configuration for the trading core.
//!
//! Settings are stored in TOML. Every field has a default so a partial file,
//! or no file at all, yields a usable configuration.
//!
//! ```toml
//! [selection]
//! dust_threshold_sat = 546
//! rfq_headroom_percent = 10
//!
//! [settlement]
//! timeout_secs = 30
//! fee_target_blocks = 2
//! ```

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::logging::LogConfig;
use crate::types::{DUST_THRESHOLD, MAX_STANDARD_TX_VSIZE};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub selection: SelectionConfig,

    #[serde(default)]
    pub settlement: SettlementConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Coin selection and reservation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionConfig {
    /// Change below this value is folded into the fee
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold_sat: u64,

    /// Results above this virtual size are flagged for confirmation
    #[serde(default = "default_max_tx_vsize")]
    pub max_tx_vsize: u64,

    /// Largest subset tried when looking for an exact match
    #[serde(default = "default_max_exact_match_inputs")]
    pub max_exact_match_inputs: usize,

    /// Upper bound on subsets visited by the exhaustive search
    #[serde(default = "default_search_node_budget")]
    pub search_node_budget: usize,

    /// Extra amount reserved on top of an RFQ quantity, in percent
    #[serde(default = "default_rfq_headroom_percent")]
    pub rfq_headroom_percent: u32,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            dust_threshold_sat: default_dust_threshold(),
            max_tx_vsize: default_max_tx_vsize(),
            max_exact_match_inputs: default_max_exact_match_inputs(),
            search_node_budget: default_search_node_budget(),
            rfq_headroom_percent: default_rfq_headroom_percent(),
        }
    }
}

/// Settlement container settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Time allowed between activation and acceptance
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Confirmation target passed to the fee estimator
    #[serde(default = "default_fee_target_blocks")]
    pub fee_target_blocks: u32,

    /// Estimates below this rate are rejected
    #[serde(default = "default_min_fee_per_byte")]
    pub min_fee_per_byte: f32,

    /// Estimates above this rate are rejected
    #[serde(default = "default_max_fee_per_byte")]
    pub max_fee_per_byte: f32,

    /// Allowed deviation between expected and offered CC payment
    #[serde(default = "default_cc_price_tolerance_sat")]
    pub cc_price_tolerance_sat: u64,

    /// Confirmations after which a pay-in counts as settled
    #[serde(default = "default_confirmed_threshold")]
    pub confirmed_threshold: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            fee_target_blocks: default_fee_target_blocks(),
            min_fee_per_byte: default_min_fee_per_byte(),
            max_fee_per_byte: default_max_fee_per_byte(),
            cc_price_tolerance_sat: default_cc_price_tolerance_sat(),
            confirmed_threshold: default_confirmed_threshold(),
        }
    }
}

impl SettlementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_dust_threshold() -> u64 {
    DUST_THRESHOLD
}

fn default_max_tx_vsize() -> u64 {
    MAX_STANDARD_TX_VSIZE
}

fn default_max_exact_match_inputs() -> usize {
    4
}

fn default_search_node_budget() -> usize {
    100_000
}

fn default_rfq_headroom_percent() -> u32 {
    10
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_fee_target_blocks() -> u32 {
    2
}

fn default_min_fee_per_byte() -> f32 {
    1.0
}

fn default_max_fee_per_byte() -> f32 {
    10_000.0
}

fn default_cc_price_tolerance_sat() -> u64 {
    3
}

fn default_confirmed_threshold() -> u32 {
    6
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| anyhow!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content =
            toml::to_string_pretty(self).map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let selection = &self.selection;
        if selection.max_tx_vsize == 0 {
            return Err(anyhow!("selection.max_tx_vsize must be positive"));
        }
        if selection.max_exact_match_inputs == 0 || selection.max_exact_match_inputs > 16 {
            return Err(anyhow!("selection.max_exact_match_inputs must be between 1 and 16"));
        }
        if selection.search_node_budget == 0 {
            return Err(anyhow!("selection.search_node_budget must be positive"));
        }
        if selection.rfq_headroom_percent > 100 {
            return Err(anyhow!("selection.rfq_headroom_percent must not exceed 100"));
        }

        let settlement = &self.settlement;
        if settlement.timeout_secs == 0 {
            return Err(anyhow!("settlement.timeout_secs must be positive"));
        }
        if settlement.fee_target_blocks == 0 {
            return Err(anyhow!("settlement.fee_target_blocks must be positive"));
        }
        if !settlement.min_fee_per_byte.is_finite() || settlement.min_fee_per_byte < 0.0 {
            return Err(anyhow!("settlement.min_fee_per_byte must be a non-negative number"));
        }
        if !settlement.max_fee_per_byte.is_finite() || settlement.max_fee_per_byte < settlement.min_fee_per_byte {
            return Err(anyhow!("settlement.max_fee_per_byte must be a number not below min_fee_per_byte"));
        }
        if settlement.confirmed_threshold == 0 {
            return Err(anyhow!("settlement.confirmed_threshold must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.selection.dust_threshold_sat, 546);
        assert_eq!(config.selection.max_tx_vsize, 100_000);
        assert_eq!(config.settlement.timeout(), Duration::from_secs(30));
        assert_eq!(config.settlement.fee_target_blocks, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = Config::from_toml_str("[settlement]\ntimeout_secs = 45\n").unwrap();
        assert_eq!(config.settlement.timeout_secs, 45);
        assert_eq!(config.settlement.min_fee_per_byte, 1.0);
        assert_eq!(config.settlement.max_fee_per_byte, 10_000.0);
        assert_eq!(config.selection, SelectionConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::from_toml_str("[settlement]\ntimeout_secs = 0\n").is_err());
        assert!(Config::from_toml_str("[selection]\nmax_exact_match_inputs = 0\n").is_err());
        assert!(Config::from_toml_str("[selection]\nrfq_headroom_percent = 250\n").is_err());
    }
}
