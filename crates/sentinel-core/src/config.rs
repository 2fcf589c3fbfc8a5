//! Environment-driven configuration.
//!
//! Every knob has a default; recognized keys with unparseable or
//! out-of-range values refuse startup rather than limping along with a
//! guess.

use std::env;
use std::path::PathBuf;

use chrono::Duration;
use thiserror::Error;

use crate::anchor::AnchorNetwork;
use crate::crypto::KemAlgorithm;

/// Errors that refuse startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A recognized key holds a value that does not parse.
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// The environment key.
        key: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Core configuration.
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Root directory for persistent state (`asr/`, `batches/`,
    /// `keys/`).
    pub data_dir: PathBuf,
    /// ML-KEM parameter set for new keypairs.
    pub pqc_level: KemAlgorithm,
    /// Key rotation interval.
    pub key_rotation: Duration,
    /// Post-rotation decapsulation grace period.
    pub key_grace: Duration,
    /// Fallback per-minute quota for agents without a tier quota.
    pub rate_limit_default: u32,
    /// Strikes required for a ban.
    pub strike_threshold: u8,
    /// Inactivity that arms the heir transfer.
    pub heir_inactivity: Duration,
    /// Ledger network selection.
    pub anchor_network: AnchorNetwork,
    /// Maximum records per batch.
    pub batch_max: usize,
    /// Maximum age of an open batch.
    pub batch_max_age: Duration,
    /// Session token lifetime.
    pub session_lifetime: Duration,
    /// Nonce lifetime.
    pub nonce_lifetime: Duration,
    /// Server HMAC key for session tokens; generated when absent.
    pub session_hmac_key: Vec<u8>,
    /// Passphrase sealing the key store at rest.
    pub keystore_passphrase: String,
    /// Sliding window for threat scoring.
    pub threat_window: Duration,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            pqc_level: KemAlgorithm::MlKem768,
            key_rotation: Duration::days(90),
            key_grace: Duration::days(30),
            rate_limit_default: 5,
            strike_threshold: 3,
            heir_inactivity: Duration::days(90),
            anchor_network: AnchorNetwork::None,
            batch_max: 50,
            batch_max_age: Duration::seconds(30),
            session_lifetime: Duration::seconds(86_400),
            nonce_lifetime: Duration::seconds(300),
            session_hmac_key: random_key(),
            keystore_passphrase: String::new(),
            threat_window: Duration::hours(24),
        }
    }
}

impl SentinelConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for any recognized key whose value does
    /// not parse; startup must not proceed in that case.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = read("SENTINEL_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }
        if let Some(value) = read("PQC_SECURITY_LEVEL") {
            let level: u32 = parse("PQC_SECURITY_LEVEL", &value)?;
            config.pqc_level = KemAlgorithm::from_security_level(level).ok_or(
                ConfigError::Invalid {
                    key: "PQC_SECURITY_LEVEL",
                    value,
                },
            )?;
        }
        if let Some(value) = read("KEY_ROTATION_DAYS") {
            config.key_rotation = Duration::days(parse_positive("KEY_ROTATION_DAYS", &value)?);
        }
        if let Some(value) = read("KEY_GRACE_DAYS") {
            config.key_grace = Duration::days(parse_positive("KEY_GRACE_DAYS", &value)?);
        }
        if let Some(value) = read("RATE_LIMIT_DEFAULT") {
            config.rate_limit_default = parse("RATE_LIMIT_DEFAULT", &value)?;
        }
        if let Some(value) = read("STRIKE_THRESHOLD") {
            config.strike_threshold = parse("STRIKE_THRESHOLD", &value)?;
            if config.strike_threshold == 0 {
                return Err(ConfigError::Invalid {
                    key: "STRIKE_THRESHOLD",
                    value,
                });
            }
        }
        if let Some(value) = read("HEIR_INACTIVITY_DAYS") {
            config.heir_inactivity =
                Duration::days(parse_positive("HEIR_INACTIVITY_DAYS", &value)?);
        }
        if let Some(value) = read("ANCHOR_NETWORK") {
            config.anchor_network =
                AnchorNetwork::parse(&value).ok_or(ConfigError::Invalid {
                    key: "ANCHOR_NETWORK",
                    value,
                })?;
        }
        if let Some(value) = read("BATCH_MAX") {
            config.batch_max = parse("BATCH_MAX", &value)?;
            if config.batch_max == 0 {
                return Err(ConfigError::Invalid {
                    key: "BATCH_MAX",
                    value,
                });
            }
        }
        if let Some(value) = read("BATCH_MAX_AGE_SEC") {
            config.batch_max_age =
                Duration::seconds(parse_positive("BATCH_MAX_AGE_SEC", &value)?);
        }
        if let Some(value) = read("SESSION_LIFETIME_SEC") {
            config.session_lifetime =
                Duration::seconds(parse_positive("SESSION_LIFETIME_SEC", &value)?);
        }
        if let Some(value) = read("NONCE_LIFETIME_SEC") {
            config.nonce_lifetime =
                Duration::seconds(parse_positive("NONCE_LIFETIME_SEC", &value)?);
        }
        if let Some(value) = read("SESSION_HMAC_KEY") {
            config.session_hmac_key = hex::decode(&value).map_err(|_| ConfigError::Invalid {
                key: "SESSION_HMAC_KEY",
                value,
            })?;
        }
        if let Some(value) = read("KEYSTORE_PASSPHRASE") {
            config.keystore_passphrase = value;
        }

        Ok(config)
    }
}

fn read(key: &'static str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_positive(key: &'static str, value: &str) -> Result<i64, ConfigError> {
    let parsed: i64 = parse(key, value)?;
    if parsed <= 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

fn random_key() -> Vec<u8> {
    use rand::RngCore;
    let mut key = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}
