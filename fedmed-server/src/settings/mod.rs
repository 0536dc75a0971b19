//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. Examples of
//! configuration files can be found in the `configs/` directory located in the repository root.

use std::{fmt, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub round: RoundSettings,
    #[validate]
    pub cipher: CipherSettings,
    #[validate]
    pub validation: ValidationSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(Environment::with_prefix("fedmed").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// The default round parameters.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_round"))]
pub struct RoundSettings {
    /// The number of accepted updates at which a round closes early, before
    /// its deadline. Must be greater or equal to `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// quorum = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_ROUND__QUORUM=3
    /// ```
    pub quorum: u32,

    /// The fixed collection deadline of a round, in seconds. Must be greater
    /// or equal to `1`. The deadline is never extended; updates arriving
    /// after it are rejected.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [round]
    /// deadline = 600
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_ROUND__DEADLINE=600
    /// ```
    pub deadline: u64,
}

impl RoundSettings {
    fn validate_round(&self) -> Result<(), ValidationError> {
        if self.quorum >= 1 && self.deadline >= 1 {
            Ok(())
        } else {
            Err(ValidationError::new("invalid round parameters"))
        }
    }
}

fn validate_round(settings: &RoundSettings) -> Result<(), ValidationError> {
    settings.validate_round()
}

/// The encryption scheme parameters of the deployment.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_cipher"))]
pub struct CipherSettings {
    /// The identifier of the shared encryption context (key set). All
    /// participating nodes must encrypt their updates under this context.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cipher]
    /// context_id = 1
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_CIPHER__CONTEXT_ID=1
    /// ```
    pub context_id: u64,

    /// The number of fractional bits of the fixed-point plaintext encoding.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cipher]
    /// scale_bits = 16
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_CIPHER__SCALE_BITS=16
    /// ```
    pub scale_bits: u8,

    /// The headroom reserved for aggregation weights. The total weight of
    /// one aggregate must stay below `2^weight_bits`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cipher]
    /// weight_bits = 24
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_CIPHER__WEIGHT_BITS=24
    /// ```
    pub weight_bits: u8,

    /// The number of weights of the shared model architecture. Submitted
    /// ciphertexts must carry exactly this many slots.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cipher]
    /// model_length = 1024
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_CIPHER__MODEL_LENGTH=1024
    /// ```
    pub model_length: usize,
}

impl CipherSettings {
    fn validate_cipher(&self) -> Result<(), ValidationError> {
        // the validate attribute only accepts literals, therefore we check the invariants here
        if self.model_length >= 1
            && self.scale_bits >= 1
            && self.weight_bits >= 1
            && (self.scale_bits as u32 + self.weight_bits as u32) < 64
        {
            Ok(())
        } else {
            Err(ValidationError::new("invalid cipher parameters"))
        }
    }
}

fn validate_cipher(settings: &CipherSettings) -> Result<(), ValidationError> {
    settings.validate_cipher()
}

/// The update validation settings.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_validation"))]
pub struct ValidationSettings {
    /// The upper bound on the self-reported training sample count of a
    /// single update. Sample counts are also used as aggregation weights, so
    /// this bound caps the influence any one node can claim.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [validation]
    /// max_sample_count = 100000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_VALIDATION__MAX_SAMPLE_COUNT=100000
    /// ```
    pub max_sample_count: u64,

    /// The z-score above which a declared update norm bound is considered
    /// anomalous relative to the other updates of the round.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [validation]
    /// anomaly_threshold = 2.5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_VALIDATION__ANOMALY_THRESHOLD=2.5
    /// ```
    pub anomaly_threshold: f64,

    /// The minimal number of already accepted updates required before the
    /// anomaly screen is applied. With fewer peers there is no meaningful
    /// population to score against.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [validation]
    /// min_anomaly_peers = 2
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_VALIDATION__MIN_ANOMALY_PEERS=2
    /// ```
    pub min_anomaly_peers: usize,
}

impl ValidationSettings {
    fn validate_validation(&self) -> Result<(), ValidationError> {
        if self.max_sample_count >= 1 && self.anomaly_threshold > 0.0 && self.min_anomaly_peers >= 1
        {
            Ok(())
        } else {
            Err(ValidationError::new("invalid validation parameters"))
        }
    }
}

fn validate_validation(settings: &ValidationSettings) -> Result<(), ValidationError> {
    settings.validate_validation()
}

/// The ledger persistence settings.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageSettings {
    /// The directory the round ledger and model version snapshots are
    /// written to. If unset, the coordinator keeps its ledger in memory and
    /// nothing survives a restart.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [storage]
    /// snapshot_dir = "/var/lib/fedmed"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_STORAGE__SNAPSHOT_DIR=/var/lib/fedmed
    /// ```
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDMED_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    const VALID_CONFIG: &str = r#"
        [round]
        quorum = 3
        deadline = 600

        [cipher]
        context_id = 1
        scale_bits = 16
        weight_bits = 24
        model_length = 8

        [validation]
        max_sample_count = 100000
        anomaly_threshold = 2.5
        min_anomaly_peers = 2

        [log]
        filter = "info"
    "#;

    fn from_str(toml: &str) -> Result<Settings, SettingsError> {
        let settings: Settings = Config::builder()
            .add_source(config::File::from_str(toml, FileFormat::Toml))
            .build()
            .map_err(SettingsError::Loading)?
            .try_deserialize()
            .map_err(SettingsError::Loading)?;
        settings.validate()?;
        Ok(settings)
    }

    #[test]
    fn valid_config_loads() {
        let settings = from_str(VALID_CONFIG).unwrap();
        assert_eq!(settings.round.quorum, 3);
        assert_eq!(settings.cipher.model_length, 8);
        assert!(settings.storage.snapshot_dir.is_none());
    }

    #[test]
    fn zero_quorum_fails_validation() {
        let toml = VALID_CONFIG.replace("quorum = 3", "quorum = 0");
        assert!(matches!(
            from_str(&toml),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn cipher_headroom_must_fit_in_slots() {
        let toml = VALID_CONFIG.replace("scale_bits = 16", "scale_bits = 48");
        assert!(matches!(
            from_str(&toml),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn zero_anomaly_threshold_fails_validation() {
        let toml = VALID_CONFIG.replace("anomaly_threshold = 2.5", "anomaly_threshold = 0.0");
        assert!(matches!(
            from_str(&toml),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn bad_log_filter_fails_loading() {
        let toml = VALID_CONFIG.replace("filter = \"info\"", "filter = \"info,,,=\"");
        assert!(matches!(from_str(&toml), Err(SettingsError::Loading(_))));
    }
}
