use std::path::PathBuf;
use thiserror::Error;

/// Default directory for persisted settings and timers
pub const DEFAULT_DATA_DIR: &str = "data";
/// Default seconds between timer checks
pub const DEFAULT_TIMER_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DISCORD_TOKEN must be set")]
    MissingToken,
    #[error("TIMER_INTERVAL_SECS must be a positive integer, got {0:?}")]
    InvalidInterval(String),
}

/// Process configuration read from the environment
#[derive(Clone)]
pub struct BotConfig {
    pub token: String,
    pub data_dir: PathBuf,
    pub timer_interval_secs: u64,
}

impl std::fmt::Debug for BotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotConfig")
            .field("token", &"<redacted>")
            .field("data_dir", &self.data_dir)
            .field("timer_interval_secs", &self.timer_interval_secs)
            .finish()
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            timer_interval_secs: DEFAULT_TIMER_INTERVAL_SECS,
        }
    }
}

impl BotConfig {
    /// Read `DISCORD_TOKEN`, `DATA_DIR` and `TIMER_INTERVAL_SECS`
    ///
    /// # Errors
    /// Fails if the token is missing or the interval is not a positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup
    ///
    /// # Errors
    /// Same as [`BotConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = lookup("DISCORD_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::MissingToken)?;

        let data_dir = lookup("DATA_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_DATA_DIR), PathBuf::from);

        let timer_interval_secs = match lookup("TIMER_INTERVAL_SECS") {
            None => DEFAULT_TIMER_INTERVAL_SECS,
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidInterval(raw))?,
        };

        Ok(Self {
            token,
            data_dir,
            timer_interval_secs,
        })
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.yaml")
    }

    pub fn timers_file(&self) -> PathBuf {
        self.data_dir.join("timers.yaml")
    }
}
