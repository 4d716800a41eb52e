use std::{
    ops::Deref,
    path::Path,
    sync::{Arc, OnceLock},
};

use crate::config::BotConfig;
use crate::moderation::{
    BannedPhraseEngine, GuildSettings, PlatformClient, PunishmentManager, RaidPreventionEngine,
    RemovablePunishment, SettingsStore, SpamPreventionEngine, TimerEffects, TimerRequest,
    TimerService,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

/// Centralized data structure for the bot
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

impl Default for Data {
    fn default() -> Self {
        Self::new(BotConfig::default())
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("config", &self.config)
            .field("guilds", &self.settings.all().len())
            .field("pending_timers", &self.timers.len())
            .field("platform_attached", &self.manager.get().is_some())
            .finish()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Data {
    #[must_use]
    pub fn new(config: BotConfig) -> Self {
        Self(Arc::new(DataInner::with_settings(config, SettingsStore::new())))
    }

    /// Load settings and pending timers from the data directory
    pub async fn load(config: BotConfig) -> Self {
        Self(Arc::new(DataInner::load(config).await))
    }

    /// # Errors
    /// Fails if the data directory cannot be created or a file cannot be
    /// serialized or written.
    pub async fn save(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0.save().await
    }
}

/// Main centralized data structure for the bot
pub struct DataInner {
    pub config: BotConfig,
    pub settings: SettingsStore,
    pub timers: TimerService,
    pub phrases: BannedPhraseEngine,
    pub spam: SpamPreventionEngine,
    pub raid: RaidPreventionEngine,
    /// Set once the gateway connection provides an HTTP client
    manager: OnceLock<Arc<PunishmentManager>>,
    timer_tx: OnceLock<Sender<TimerRequest>>,
}

impl DataInner {
    fn with_settings(config: BotConfig, settings: SettingsStore) -> Self {
        Self {
            config,
            phrases: BannedPhraseEngine::new(settings.clone()),
            spam: SpamPreventionEngine::new(settings.clone()),
            raid: RaidPreventionEngine::new(settings.clone()),
            settings,
            timers: TimerService::new(),
            manager: OnceLock::new(),
            timer_tx: OnceLock::new(),
        }
    }

    /// Build the punishment manager on top of `platform`
    ///
    /// Only the first call has an effect; later calls return the manager
    /// that is already in place.
    pub fn attach_platform(&self, platform: Arc<dyn PlatformClient>) -> Arc<PunishmentManager> {
        Arc::clone(self.manager.get_or_init(|| {
            Arc::new(PunishmentManager::new(
                platform,
                self.timers.clone(),
                self.settings.clone(),
            ))
        }))
    }

    /// The punishment manager, once a platform is attached
    pub fn manager(&self) -> Option<&Arc<PunishmentManager>> {
        self.manager.get()
    }

    /// Start the timer loop against the attached manager
    ///
    /// Returns `false` if no platform is attached yet or the loop already runs.
    pub fn start_timers(&self) -> bool {
        let Some(manager) = self.manager.get() else {
            return false;
        };
        let (tx, rx) = TimerService::channel();
        if self.timer_tx.set(tx).is_err() {
            return false;
        }
        self.timers.clone().start(
            Arc::clone(manager) as Arc<dyn TimerEffects>,
            rx,
            self.config.timer_interval_secs,
        );
        true
    }

    /// Ask the timer loop to stop
    pub async fn stop_timers(&self) {
        if let Some(tx) = self.timer_tx.get() {
            if tx.send(TimerRequest::Shutdown).await.is_err() {
                warn!("Timer loop already stopped");
            }
        }
    }

    /// Drop everything kept for a guild the bot left
    pub fn purge_guild(&self, guild_id: u64) {
        self.timers.purge_guild(guild_id);
        self.settings.remove_guild(guild_id);
        self.phrases.purge_guild(guild_id);
        self.spam.purge_guild(guild_id);
        info!(guild_id, "Purged guild state");
    }

    /// Load data from YAML files
    ///
    /// Missing files start empty. Files that fail to parse are logged and
    /// ignored so a bad edit never keeps the bot from starting.
    pub async fn load(config: BotConfig) -> Self {
        let settings: Vec<GuildSettings> = read_yaml(&config.settings_file()).await;
        let timers: Vec<RemovablePunishment> = read_yaml(&config.timers_file()).await;

        let data = Self::with_settings(config, SettingsStore::from_settings(settings));
        data.timers.restore(timers);
        info!(
            guilds = data.settings.all().len(),
            pending_timers = data.timers.len(),
            "Loaded persisted data"
        );
        data
    }

    /// Save settings and pending timers as YAML
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - The data directory cannot be created
    /// - The settings or timers cannot be serialized to YAML
    /// - The YAML cannot be written
    pub async fn save(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if !self.config.data_dir.exists() {
            tokio::fs::create_dir_all(&self.config.data_dir).await?;
        }

        let settings_yaml = serde_yaml::to_string(&self.settings.all())?;
        tokio::fs::write(self.config.settings_file(), settings_yaml).await?;

        let timers_yaml = serde_yaml::to_string(&self.timers.snapshot())?;
        tokio::fs::write(self.config.timers_file(), timers_yaml).await?;

        Ok(())
    }
}

async fn read_yaml<T: DeserializeOwned + Default>(path: &Path) -> T {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return T::default();
    };
    serde_yaml::from_str(&content).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Ignoring unreadable data file");
        T::default()
    })
}
