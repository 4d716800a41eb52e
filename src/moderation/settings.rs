//! Per-guild moderation settings
//!
//! The detectors read their configuration from [`SettingsStore`] on every
//! evaluation and write counters and vote sets back through it. Each guild's
//! entry is locked independently, so guilds never wait on each other.

use crate::moderation::PunishmentType;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Kinds of spam the engine watches for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum SpamType {
    /// Too many messages within an interval
    Messages,
    /// Messages with many mentions
    Mentions,
    /// Messages with many links
    Links,
    /// Messages with many attachments or embeds
    Images,
    /// Very long messages
    #[display("Long Messages")]
    LongMessages,
}

impl SpamType {
    pub const ALL: [Self; 5] = [
        Self::Messages,
        Self::Mentions,
        Self::Links,
        Self::Images,
        Self::LongMessages,
    ];

    /// Whether `required_amount_or_interval` is a window in seconds
    #[must_use]
    pub fn is_interval_based(self) -> bool {
        matches!(self, Self::Messages)
    }
}

/// Spam detection settings for one spam type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpamPreventionInfo {
    pub punishment: PunishmentType,
    /// Qualifying messages needed before a user is flagged
    pub message_count_threshold: u32,
    /// Interval in seconds for `Messages`, per-message amount otherwise
    pub required_amount_or_interval: u32,
    /// Distinct users who must confirm a flag; 0 punishes on detection
    pub vote_threshold: u32,
    pub enabled: bool,
    /// Seconds until the resulting punishment is lifted
    #[serde(default)]
    pub duration: Option<u32>,
    /// Flagged user -> users who confirmed the flag; lives only as long as
    /// the flag, which is never persisted
    #[serde(skip)]
    pub votes: HashMap<u64, HashSet<u64>>,
}

impl SpamPreventionInfo {
    /// Disabled settings with sensible thresholds for `spam_type`
    #[must_use]
    pub fn default_for(spam_type: SpamType) -> Self {
        let (count, amount) = match spam_type {
            SpamType::Messages => (5, 10),
            SpamType::Mentions => (3, 5),
            SpamType::Links => (3, 3),
            SpamType::Images => (3, 4),
            SpamType::LongMessages => (3, 1500),
        };
        Self {
            punishment: PunishmentType::RoleMute,
            message_count_threshold: count,
            required_amount_or_interval: amount,
            vote_threshold: 2,
            enabled: false,
            duration: Some(600),
            votes: HashMap::new(),
        }
    }
}

/// Kinds of raid the engine watches for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum RaidType {
    /// Any burst of joins
    Joins,
    /// Bursts of joins from freshly created accounts
    #[display("New Accounts")]
    NewAccounts,
}

impl RaidType {
    pub const ALL: [Self; 2] = [Self::Joins, Self::NewAccounts];
}

/// A member join remembered by the raid detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRecord {
    pub user_id: u64,
    pub joined_at: DateTime<Utc>,
}

/// Raid detection settings for one raid type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidPreventionInfo {
    pub punishment: PunishmentType,
    pub user_count_threshold: u32,
    pub interval_seconds: u32,
    pub enabled: bool,
    #[serde(default)]
    pub duration: Option<u32>,
    /// Accounts younger than this count for `NewAccounts`
    #[serde(default)]
    pub min_account_age_hours: u32,
    /// Recent joins, oldest first
    #[serde(skip)]
    pub recent_joins: VecDeque<JoinRecord>,
}

impl RaidPreventionInfo {
    #[must_use]
    pub fn default_for(raid_type: RaidType) -> Self {
        let (threshold, interval, age) = match raid_type {
            RaidType::Joins => (10, 10, 0),
            RaidType::NewAccounts => (5, 60, 24),
        };
        Self {
            punishment: PunishmentType::Kick,
            user_count_threshold: threshold,
            interval_seconds: interval,
            enabled: false,
            duration: None,
            min_account_age_hours: age,
            recent_joins: VecDeque::new(),
        }
    }
}

/// Counter a banned phrase feeds
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
pub enum InfractionChannel {
    #[default]
    #[display("role")]
    Role,
    #[display("kick")]
    Kick,
    #[display("ban")]
    Ban,
}

/// How a banned phrase matches message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhraseMatcher {
    /// Case-insensitive substring
    Contains(String),
    /// Case-insensitive match of the whole message
    Exact(String),
    /// Regular expression, validated when it was added
    Regex(String),
}

impl PhraseMatcher {
    /// Match against already lower-cased content; regexes are handled elsewhere
    pub(crate) fn matches_literal(&self, lowered: &str) -> bool {
        match self {
            Self::Contains(text) => lowered.contains(&text.to_lowercase()),
            Self::Exact(text) => lowered.trim() == text.to_lowercase(),
            Self::Regex(_) => false,
        }
    }
}

impl std::fmt::Display for PhraseMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contains(text) => write!(f, "*{text}*"),
            Self::Exact(text) => write!(f, "\"{text}\""),
            Self::Regex(source) => write!(f, "/{source}/"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedPhrase {
    pub matcher: PhraseMatcher,
    #[serde(default)]
    pub channel: InfractionChannel,
}

/// Escalation step applied when a counter reaches `threshold`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedPhrasePunishment {
    pub threshold: u32,
    pub punishment: PunishmentType,
    #[serde(default)]
    pub role_id: Option<u64>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub channel: InfractionChannel,
}

/// Banned-phrase matches of one user, per channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfractionCounter {
    pub counts: HashMap<InfractionChannel, u32>,
}

impl InfractionCounter {
    #[must_use]
    pub fn get(&self, channel: InfractionChannel) -> u32 {
        self.counts.get(&channel).copied().unwrap_or(0)
    }

    /// Increment and return the new count
    pub fn increment(&mut self, channel: InfractionChannel) -> u32 {
        let count = self.counts.entry(channel).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn reset(&mut self, channel: InfractionChannel) {
        self.counts.remove(&channel);
    }

    pub fn is_empty(&self) -> bool {
        self.counts.values().all(|count| *count == 0)
    }
}

/// All moderation settings of a guild
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSettings {
    pub guild_id: u64,
    #[serde(default)]
    pub mute_role_id: Option<u64>,
    #[serde(default)]
    pub spam: HashMap<SpamType, SpamPreventionInfo>,
    #[serde(default)]
    pub raid: HashMap<RaidType, RaidPreventionInfo>,
    #[serde(default)]
    pub phrases: Vec<BannedPhrase>,
    #[serde(default)]
    pub phrase_punishments: Vec<BannedPhrasePunishment>,
    #[serde(default)]
    pub infractions: HashMap<u64, InfractionCounter>,
}

impl GuildSettings {
    pub fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            ..Default::default()
        }
    }

    /// Spam settings for a type, created disabled on first access
    pub fn spam_mut(&mut self, spam_type: SpamType) -> &mut SpamPreventionInfo {
        self.spam
            .entry(spam_type)
            .or_insert_with(|| SpamPreventionInfo::default_for(spam_type))
    }

    /// Raid settings for a type, created disabled on first access
    pub fn raid_mut(&mut self, raid_type: RaidType) -> &mut RaidPreventionInfo {
        self.raid
            .entry(raid_type)
            .or_insert_with(|| RaidPreventionInfo::default_for(raid_type))
    }
}

/// Shared per-guild settings
#[derive(Clone, Default)]
pub struct SettingsStore {
    guilds: Arc<DashMap<u64, GuildSettings>>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from persisted settings
    pub fn from_settings(settings: impl IntoIterator<Item = GuildSettings>) -> Self {
        let store = Self::new();
        for guild in settings {
            store.guilds.insert(guild.guild_id, guild);
        }
        store
    }

    /// A copy of a guild's settings, or defaults if it has none yet
    #[must_use]
    pub fn get(&self, guild_id: u64) -> GuildSettings {
        self.guilds
            .get(&guild_id)
            .map_or_else(|| GuildSettings::new(guild_id), |entry| entry.value().clone())
    }

    /// Run `f` with the guild's settings locked for writing
    pub fn update<R>(&self, guild_id: u64, f: impl FnOnce(&mut GuildSettings) -> R) -> R {
        let mut entry = self
            .guilds
            .entry(guild_id)
            .or_insert_with(|| GuildSettings::new(guild_id));
        f(entry.value_mut())
    }

    /// Run `f` against a guild's settings without creating an entry
    pub fn read<R>(&self, guild_id: u64, f: impl FnOnce(&GuildSettings) -> R) -> Option<R> {
        self.guilds.get(&guild_id).map(|entry| f(entry.value()))
    }

    #[must_use]
    pub fn mute_role(&self, guild_id: u64) -> Option<u64> {
        self.guilds.get(&guild_id).and_then(|entry| entry.mute_role_id)
    }

    pub fn set_mute_role(&self, guild_id: u64, role_id: Option<u64>) {
        self.update(guild_id, |settings| settings.mute_role_id = role_id);
    }

    pub fn remove_guild(&self, guild_id: u64) -> bool {
        self.guilds.remove(&guild_id).is_some()
    }

    /// Every guild's settings, for persistence
    #[must_use]
    pub fn all(&self) -> Vec<GuildSettings> {
        let mut all: Vec<_> = self.guilds.iter().map(|entry| entry.value().clone()).collect();
        all.sort_by_key(|settings| settings.guild_id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increment_and_reset() {
        let mut counter = InfractionCounter::default();
        assert_eq!(counter.get(InfractionChannel::Kick), 0);
        assert_eq!(counter.increment(InfractionChannel::Kick), 1);
        assert_eq!(counter.increment(InfractionChannel::Kick), 2);
        assert_eq!(counter.increment(InfractionChannel::Ban), 1);

        counter.reset(InfractionChannel::Kick);
        assert_eq!(counter.get(InfractionChannel::Kick), 0);
        assert!(!counter.is_empty());
        counter.reset(InfractionChannel::Ban);
        assert!(counter.is_empty());
    }

    #[test]
    fn test_literal_matching() {
        let contains = PhraseMatcher::Contains("BadWord".to_string());
        assert!(contains.matches_literal("this has a badword inside"));
        assert!(!contains.matches_literal("clean message"));

        let exact = PhraseMatcher::Exact("hello there".to_string());
        assert!(exact.matches_literal("hello there"));
        assert!(exact.matches_literal("  hello there "));
        assert!(!exact.matches_literal("hello there friend"));
    }

    #[test]
    fn test_store_isolates_guilds() {
        let store = SettingsStore::new();
        store.set_mute_role(1, Some(42));
        store.update(2, |settings| settings.spam_mut(SpamType::Links).enabled = true);

        assert_eq!(store.mute_role(1), Some(42));
        assert_eq!(store.mute_role(2), None);
        assert!(store.get(2).spam[&SpamType::Links].enabled);
        assert!(store.get(1).spam.is_empty());
        assert_eq!(store.get(3), GuildSettings::new(3));
        assert_eq!(store.all().len(), 2);
    }

    #[test]
    fn test_settings_serialization() {
        let mut settings = GuildSettings::new(12345);
        settings.mute_role_id = Some(777);
        settings.phrases.push(BannedPhrase {
            matcher: PhraseMatcher::Regex(r"free\s+nitro".to_string()),
            channel: InfractionChannel::Ban,
        });
        settings.phrase_punishments.push(BannedPhrasePunishment {
            threshold: 3,
            punishment: PunishmentType::RoleMute,
            role_id: None,
            duration_minutes: Some(10),
            channel: InfractionChannel::Role,
        });
        settings
            .spam_mut(SpamType::Messages)
            .votes
            .insert(5, HashSet::from([6, 7]));
        settings.raid_mut(RaidType::Joins).recent_joins.push_back(JoinRecord {
            user_id: 8,
            joined_at: Utc::now(),
        });
        settings
            .infractions
            .entry(5)
            .or_default()
            .increment(InfractionChannel::Ban);

        let serialized = serde_yaml::to_string(&settings).expect("Failed to serialize");
        assert!(serialized.contains("guild_id: 12345"));
        assert!(serialized.contains("mute_role_id: 777"));
        assert!(serialized.contains("Regex"));

        let deserialized: GuildSettings =
            serde_yaml::from_str(&serialized).expect("Failed to deserialize");
        assert_eq!(deserialized.phrases, settings.phrases);
        assert_eq!(deserialized.spam, settings.spam);
        assert_eq!(deserialized.infractions, settings.infractions);

        // Join history is runtime state only
        assert!(deserialized.raid[&RaidType::Joins].recent_joins.is_empty());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let settings: GuildSettings =
            serde_yaml::from_str("guild_id: 9\n").expect("Failed to deserialize");
        assert_eq!(settings, GuildSettings::new(9));
    }
}
