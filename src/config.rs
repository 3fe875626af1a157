//! Configuration of forest creation and balance.

use serde::Deserialize;

use crate::error::ForestError;

/// Options for [Forest::new](crate::forest::Forest::new).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CreateOptions {
    /// Minimum number of octants per process.
    pub min_octants: u64,
    /// Minimum level of the initial octants.
    pub min_level: u8,
    /// Fill the forest with octants of one level. Otherwise every process
    /// covers its range with the coarsest possible octants.
    pub fill_uniform: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            min_octants: 0,
            min_level: 0,
            fill_uniform: true,
        }
    }
}

impl CreateOptions {
    /// Uniform forest on a fixed level.
    pub fn uniform(level: u8) -> Self {
        Self {
            min_octants: 0,
            min_level: level,
            fill_uniform: true,
        }
    }
}

/// How a process learns which processes send balance messages to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discovery {
    /// Every process advertises its receivers and learns its senders exactly.
    #[default]
    Notify,
    /// Every process advertises a few rank intervals covering its receivers.
    /// Processes in an interval that are no receiver get an empty message.
    Ranges,
}

/// Options for [Forest::balance](crate::forest::Forest::balance).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalanceConfig {
    /// The discovery strategy used to route messages.
    pub discovery: Discovery,
    /// Run both strategies and fail if they disagree.
    pub verify: bool,
    /// Maximum number of intervals of the ranges strategy.
    pub max_ranges: usize,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            discovery: Discovery::Notify,
            verify: false,
            max_ranges: 25,
        }
    }
}

/// Full configuration of a forest.
#[derive(Clone, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForestConfig {
    /// Creation options.
    pub create: CreateOptions,
    /// Balance options.
    pub balance: BalanceConfig,
}

impl ForestConfig {
    /// Parse a configuration from TOML. Missing fields take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ForestError> {
        let config: ForestConfig = toml::from_str(text)?;
        if config.balance.max_ranges == 0 {
            return Err(ForestError::Invariant(
                "max_ranges must be at least one".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::{BalanceConfig, Discovery, ForestConfig};
    use crate::error::ForestError;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(ForestConfig::from_toml_str("").unwrap(), ForestConfig::default());
    }

    #[test]
    fn test_parse_config() {
        let config = ForestConfig::from_toml_str(
            r#"
            [create]
            min_level = 3
            fill_uniform = false

            [balance]
            discovery = "ranges"
            verify = true
            "#,
        )
        .unwrap();

        assert_eq!(config.create.min_level, 3);
        assert_eq!(config.create.min_octants, 0);
        assert!(!config.create.fill_uniform);
        assert_eq!(
            config.balance,
            BalanceConfig {
                discovery: Discovery::Ranges,
                verify: true,
                max_ranges: 25
            }
        );
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            ForestConfig::from_toml_str("[balance]\ndiscovery = \"broadcast\""),
            Err(ForestError::Config(_))
        ));
        assert!(matches!(
            ForestConfig::from_toml_str("[balance]\nmax_ranges = 0"),
            Err(ForestError::Invariant(_))
        ));
    }
}
