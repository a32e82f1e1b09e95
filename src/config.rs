//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use crate::state::RetryPolicy;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// Timeouts, retry policy and history bound for the state controller
    pub controller: ControllerConfig,

    /// Number of rendered utterances kept by the synthesizer
    pub speech_cache_size: usize,

    /// Consecutive empty recognitions retried before reporting no speech
    pub no_speech_retries: u32,
}

/// Override points for the state controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Time allowed in `listening` before falling back to `idle`
    pub listening_timeout: Duration,
    /// Time allowed in `processing` before falling back to `error`
    pub processing_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub max_retries: u32,
    /// Number of transitions kept in the history log
    pub history_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listening_timeout: Duration::from_millis(10_000),
            processing_timeout: Duration::from_millis(8_000),
            retry_base_delay: Duration::from_millis(1_000),
            retry_max_delay: Duration::from_millis(30_000),
            max_retries: 3,
            history_limit: 10,
        }
    }
}

impl ControllerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            max_retries: self.max_retries,
        }
    }
}

/// Errors raised while reading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HOME is not set")]
    MissingHome,

    #[error("invalid value for {key}: {value:?}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("{key} must be at least 1")]
    Zero { key: &'static str },
}

const DEFAULT_SPEECH_CACHE_SIZE: usize = 5;
const DEFAULT_NO_SPEECH_RETRIES: u32 = 3;

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = lookup("HOME").ok_or(ConfigError::MissingHome)?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("alicia");

        let socket_path = data_dir.join("daemon.sock");

        let defaults = ControllerConfig::default();
        let millis = |key, default: Duration| {
            parse_number::<u64, _>(&lookup, key)
                .map(|value| value.map(Duration::from_millis).unwrap_or(default))
        };

        let controller = ControllerConfig {
            listening_timeout: millis("ALICIA_LISTENING_TIMEOUT_MS", defaults.listening_timeout)?,
            processing_timeout: millis("ALICIA_PROCESSING_TIMEOUT_MS", defaults.processing_timeout)?,
            retry_base_delay: millis("ALICIA_RETRY_BASE_DELAY_MS", defaults.retry_base_delay)?,
            retry_max_delay: millis("ALICIA_RETRY_MAX_DELAY_MS", defaults.retry_max_delay)?,
            max_retries: parse_number(&lookup, "ALICIA_MAX_RETRIES")?
                .unwrap_or(defaults.max_retries),
            history_limit: parse_number(&lookup, "ALICIA_HISTORY_LIMIT")?
                .unwrap_or(defaults.history_limit),
        };

        if controller.history_limit == 0 {
            return Err(ConfigError::Zero {
                key: "ALICIA_HISTORY_LIMIT",
            });
        }

        let speech_cache_size = parse_number(&lookup, "ALICIA_SPEECH_CACHE_SIZE")?
            .unwrap_or(DEFAULT_SPEECH_CACHE_SIZE);
        let no_speech_retries = parse_number(&lookup, "ALICIA_NO_SPEECH_RETRIES")?
            .unwrap_or(DEFAULT_NO_SPEECH_RETRIES);

        Ok(Self {
            socket_path,
            data_dir,
            controller,
            speech_cache_size,
            no_speech_retries,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

fn parse_number<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}
