//! Capture session configuration
//!
//! Layered the usual way: built-in defaults, then an optional YAML file,
//! then `RTUSNIFF_` environment variables (`__` separates nesting, e.g.
//! `RTUSNIFF_LINK__BAUD_RATE=19200`).

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    DEFAULT_BYTE_CHANNEL_CAPACITY, DEFAULT_RESPONSE_TIMEOUT_FACTOR, DEFAULT_SUBSCRIBER_CAPACITY,
    MAX_CONFIG_TIMEOUT, MAX_RESPONSE_TIMEOUT_FACTOR, RTU_DATA_BITS,
};
use crate::error::{Result, SnifferError};
use crate::timing::TimingConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "RTUSNIFF_";

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    #[default]
    Even,
    Odd,
}

impl Parity {
    /// Extra bit per character
    pub fn bits(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Even | Parity::Odd => 1,
        }
    }
}

impl FromStr for Parity {
    type Err = SnifferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "even" | "e" => Ok(Parity::Even),
            "odd" | "o" => Ok(Parity::Odd),
            other => Err(SnifferError::invalid_config(
                "link.parity",
                format!("unknown parity '{other}' (expected none, even or odd)"),
            )),
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
        };
        f.write_str(s)
    }
}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: u8,
    pub data_bits: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            parity: Parity::Even,
            stop_bits: 1,
            data_bits: RTU_DATA_BITS,
        }
    }
}

/// Capture session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial line parameters
    pub link: LinkConfig,
    /// Explicit inter-frame silence; computed from `link` when absent
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub inter_frame_timeout: Option<Duration>,
    /// Explicit transaction window; derived from the silence when absent
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub transaction_timeout: Option<Duration>,
    /// Transaction window in multiples of the inter-frame silence
    pub response_timeout_factor: u32,
    /// Transport → pipeline byte channel capacity
    pub channel_capacity: usize,
    /// Per-consumer event queue capacity
    pub subscriber_capacity: usize,
    /// Period of the background timeout sweep
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub sweep_interval: Option<Duration>,
    /// Allowance for late byte delivery before an idle frame is flushed;
    /// one inter-frame silence when absent
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub delivery_lag: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            inter_frame_timeout: None,
            transaction_timeout: None,
            response_timeout_factor: DEFAULT_RESPONSE_TIMEOUT_FACTOR,
            channel_capacity: DEFAULT_BYTE_CHANNEL_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            sweep_interval: None,
            delivery_lag: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration: defaults < YAML file (if given) < environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(SessionConfig::default()));
        if let Some(path) = path {
            debug!("Loading capture config: {}", path.display());
            figment = figment.merge(Yaml::file(path));
        }
        Self::finish(figment)
    }

    /// Load configuration from an in-memory YAML document (plus environment)
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let figment =
            Figment::from(Serialized::defaults(SessionConfig::default())).merge(Yaml::string(yaml));
        Self::finish(figment)
    }

    fn finish(figment: Figment) -> Result<Self> {
        let config: SessionConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.link.baud_rate == 0 {
            return Err(SnifferError::invalid_config(
                "link.baud_rate",
                "must be greater than 0",
            ));
        }
        if !matches!(self.link.stop_bits, 1 | 2) {
            return Err(SnifferError::invalid_config(
                "link.stop_bits",
                format!("{} not in {{1, 2}}", self.link.stop_bits),
            ));
        }
        if self.link.data_bits != RTU_DATA_BITS {
            return Err(SnifferError::invalid_config(
                "link.data_bits",
                format!("RTU requires 8 data bits, got {}", self.link.data_bits),
            ));
        }
        if !(1..=MAX_RESPONSE_TIMEOUT_FACTOR).contains(&self.response_timeout_factor) {
            return Err(SnifferError::invalid_config(
                "response_timeout_factor",
                format!(
                    "{} not in 1..={}",
                    self.response_timeout_factor, MAX_RESPONSE_TIMEOUT_FACTOR
                ),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(SnifferError::invalid_config(
                "channel_capacity",
                "must be greater than 0",
            ));
        }
        if self.subscriber_capacity == 0 {
            return Err(SnifferError::invalid_config(
                "subscriber_capacity",
                "must be greater than 0",
            ));
        }

        let explicit = [
            ("inter_frame_timeout", self.inter_frame_timeout),
            ("transaction_timeout", self.transaction_timeout),
            ("sweep_interval", self.sweep_interval),
        ];
        for (field, value) in explicit {
            if value == Some(Duration::ZERO) {
                return Err(SnifferError::invalid_config(field, "must be non-zero"));
            }
        }

        let bounded = [
            ("inter_frame_timeout", self.inter_frame_timeout),
            ("transaction_timeout", self.transaction_timeout),
            ("sweep_interval", self.sweep_interval),
            ("delivery_lag", self.delivery_lag),
        ];
        for (field, value) in bounded {
            if let Some(value) = value.filter(|value| *value > MAX_CONFIG_TIMEOUT) {
                return Err(SnifferError::invalid_config(
                    field,
                    format!("{value:?} exceeds {MAX_CONFIG_TIMEOUT:?}"),
                ));
            }
        }
        Ok(())
    }

    /// Immutable timing parameters for a session built from this config
    pub fn timing(&self) -> TimingConfig {
        TimingConfig::from_session(self)
    }

    /// Override the link parameters (builder style)
    pub fn with_link(mut self, baud_rate: u32, parity: Parity, stop_bits: u8) -> Self {
        self.link = LinkConfig {
            baud_rate,
            parity,
            stop_bits,
            data_bits: RTU_DATA_BITS,
        };
        self
    }

    /// Force the inter-frame silence
    pub fn with_inter_frame_timeout(mut self, timeout: Duration) -> Self {
        self.inter_frame_timeout = Some(timeout);
        self
    }

    /// Force the transaction window
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_match_sniffer_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.link.baud_rate, 9600);
        assert_eq!(config.link.parity, Parity::Even);
        assert_eq!(config.link.stop_bits, 1);
        assert_eq!(config.inter_frame_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parity_from_str() {
        assert_eq!("none".parse::<Parity>().unwrap(), Parity::None);
        assert_eq!("EVEN".parse::<Parity>().unwrap(), Parity::Even);
        assert_eq!("o".parse::<Parity>().unwrap(), Parity::Odd);
        assert!("mark".parse::<Parity>().is_err());
    }

    #[test]
    fn test_yaml_with_humantime_durations() {
        Jail::expect_with(|_jail| {
            let config = SessionConfig::from_yaml_str(
                r#"
link:
  baud_rate: 19200
  parity: none
  stop_bits: 2
inter_frame_timeout: 2ms
transaction_timeout: 250ms
"#,
            )
            .map_err(|e| e.to_string())?;

            assert_eq!(config.link.baud_rate, 19200);
            assert_eq!(config.link.parity, Parity::None);
            assert_eq!(config.link.stop_bits, 2);
            assert_eq!(config.link.data_bits, 8);
            assert_eq!(config.inter_frame_timeout, Some(Duration::from_millis(2)));
            assert_eq!(config.transaction_timeout, Some(Duration::from_millis(250)));
            assert_eq!(config.response_timeout_factor, DEFAULT_RESPONSE_TIMEOUT_FACTOR);
            Ok(())
        });
    }

    #[test]
    fn test_file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("sniffer.yaml", "link:\n  baud_rate: 4800\n")?;
            jail.set_env("RTUSNIFF_LINK__BAUD_RATE", "38400");
            jail.set_env("RTUSNIFF_RESPONSE_TIMEOUT_FACTOR", "20");

            let config =
                SessionConfig::load(Some(Path::new("sniffer.yaml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.link.baud_rate, 38400);
            assert_eq!(config.response_timeout_factor, 20);
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SessionConfig::default();
        config.link.baud_rate = 0;
        assert!(matches!(
            config.validate(),
            Err(SnifferError::InvalidConfig { field, .. }) if field == "link.baud_rate"
        ));

        let mut config = SessionConfig::default();
        config.link.stop_bits = 3;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.link.data_bits = 7;
        assert!(config.validate().is_err());

        let config = SessionConfig::default().with_inter_frame_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(SnifferError::InvalidConfig { field, .. }) if field == "inter_frame_timeout"
        ));
    }

    #[test]
    fn test_validation_bounds_timeouts_and_factor() {
        let config = SessionConfig {
            response_timeout_factor: u32::MAX,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SnifferError::InvalidConfig { field, .. }) if field == "response_timeout_factor"
        ));

        let config = SessionConfig::default().with_inter_frame_timeout(Duration::from_secs(3600));
        assert!(matches!(
            config.validate(),
            Err(SnifferError::InvalidConfig { field, .. }) if field == "inter_frame_timeout"
        ));

        let config = SessionConfig {
            delivery_lag: Some(Duration::from_secs(61)),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            delivery_lag: Some(Duration::ZERO),
            response_timeout_factor: MAX_RESPONSE_TIMEOUT_FACTOR,
            ..Default::default()
        }
        .with_inter_frame_timeout(MAX_CONFIG_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_exported_yaml_reloads() {
        Jail::expect_with(|_jail| {
            let config = SessionConfig::default()
                .with_link(4800, Parity::Odd, 2)
                .with_inter_frame_timeout(Duration::from_micros(7_500));
            let yaml = serde_yaml::to_string(&config).map_err(|e| e.to_string())?;
            assert!(yaml.contains("7ms 500us"));
            assert!(!yaml.contains("transaction_timeout"));

            let reloaded = SessionConfig::from_yaml_str(&yaml).map_err(|e| e.to_string())?;
            assert_eq!(reloaded, config);
            Ok(())
        });
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file("broken.yaml", "link: [not, a, map]\n")?;
            let err = SessionConfig::load(Some(Path::new("broken.yaml"))).unwrap_err();
            assert!(matches!(err, SnifferError::Config(_)));
            Ok(())
        });
    }
}
