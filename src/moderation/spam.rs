//! Spam prevention
//!
//! Detection and punishment are two steps. Qualifying messages go into a
//! per-user log; once the log is long enough the user is flagged, and other
//! members confirm the flag by voting. The punishment only fires once enough
//! distinct members have voted.

use crate::moderation::{
    ModerationError, ModerationResult, PunishmentArgs, PunishmentRequest, PunishmentType,
    SettingsStore, SpamPreventionInfo, SpamType,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info};

/// Seconds without a qualifying message after which a log, and any flag on
/// it, is forgotten
pub const STALE_LOG_SECS: i64 = 3_600;
/// Least time between two sweeps for stale logs
const SWEEP_INTERVAL_SECS: i64 = 60;

/// What a single message contributes to spam detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpamEvent {
    pub at: DateTime<Utc>,
    pub mentions: u32,
    pub links: u32,
    pub images: u32,
    /// Length in characters
    pub length: u32,
}

impl SpamEvent {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            mentions: 0,
            links: 0,
            images: 0,
            length: 0,
        }
    }

    /// Build an event from message content plus the counts the platform reports
    pub fn from_content(at: DateTime<Utc>, content: &str, mentions: u32, images: u32) -> Self {
        let links = content
            .split_whitespace()
            .filter(|word| word.starts_with("http://") || word.starts_with("https://"))
            .count();
        Self {
            at,
            mentions,
            links: u32::try_from(links).unwrap_or(u32::MAX),
            images,
            length: u32::try_from(content.chars().count()).unwrap_or(u32::MAX),
        }
    }

    /// Whether this message counts toward `spam_type`
    fn qualifies(&self, spam_type: SpamType, required: u32) -> bool {
        match spam_type {
            SpamType::Messages => true,
            SpamType::Mentions => self.mentions >= required,
            SpamType::Links => self.links >= required,
            SpamType::Images => self.images >= required,
            SpamType::LongMessages => self.length >= required,
        }
    }
}

/// A user newly flagged for a spam type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpamFlag {
    pub guild_id: u64,
    pub user_id: u64,
    pub spam_type: SpamType,
    pub votes_needed: u32,
}

/// Result of recording one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpamDetection {
    /// Types the user was just flagged for and that now wait for votes
    pub flags: Vec<SpamFlag>,
    /// Punishments for types that need no votes
    pub punishments: Vec<PunishmentRequest>,
}

/// Result of a vote on a flagged user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The user is not flagged for this type
    NotFlagged,
    /// Users cannot vote on themselves
    SelfVote,
    /// This voter already voted
    DuplicateVote,
    /// Vote counted, more are needed
    Recorded { votes: u32, needed: u32 },
    /// Enough votes, the punishment should be applied
    Punish(PunishmentRequest),
}

/// Optional changes to a spam type's settings
#[derive(Debug, Clone, Default)]
pub struct SpamConfig {
    pub punishment: Option<PunishmentType>,
    pub message_count_threshold: Option<u32>,
    pub required_amount_or_interval: Option<u32>,
    pub vote_threshold: Option<u32>,
    pub duration: Option<Option<u32>>,
}

type LogKey = (u64, u64, SpamType);

#[derive(Debug, Default)]
struct SpamLog {
    entries: VecDeque<DateTime<Utc>>,
    flagged: bool,
}

/// Settings of one enabled type, copied out for a single evaluation
struct Rule {
    spam_type: SpamType,
    threshold: u32,
    required: u32,
    vote_threshold: u32,
    punishment: PunishmentType,
    duration: Option<u32>,
}

pub struct SpamPreventionEngine {
    settings: SettingsStore,
    logs: DashMap<LogKey, SpamLog>,
    /// Unix seconds of the last stale-log sweep
    last_sweep: AtomicI64,
}

impl SpamPreventionEngine {
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            settings,
            logs: DashMap::new(),
            last_sweep: AtomicI64::new(i64::MIN),
        }
    }

    /// Current settings for a type, defaults if never configured
    pub fn info(&self, guild_id: u64, spam_type: SpamType) -> SpamPreventionInfo {
        self.settings
            .read(guild_id, |settings| settings.spam.get(&spam_type).cloned())
            .flatten()
            .unwrap_or_else(|| SpamPreventionInfo::default_for(spam_type))
    }

    /// Apply the given changes and return the resulting settings
    ///
    /// # Errors
    /// Returns [`ModerationError::NotTimeLimited`] if the resulting
    /// punishment cannot expire but a duration is set.
    pub fn configure(
        &self,
        guild_id: u64,
        spam_type: SpamType,
        config: SpamConfig,
    ) -> ModerationResult<SpamPreventionInfo> {
        let mut updated = self.info(guild_id, spam_type);
        if let Some(punishment) = config.punishment {
            updated.punishment = punishment;
        }
        if let Some(threshold) = config.message_count_threshold {
            updated.message_count_threshold = threshold.max(1);
        }
        if let Some(amount) = config.required_amount_or_interval {
            updated.required_amount_or_interval = amount;
        }
        if let Some(votes) = config.vote_threshold {
            updated.vote_threshold = votes;
        }
        if let Some(duration) = config.duration {
            updated.duration = duration;
        }
        if updated.duration.is_some_and(|d| d > 0) && !updated.punishment.supports_expiry() {
            return Err(ModerationError::NotTimeLimited(updated.punishment));
        }

        info!(
            guild_id,
            %spam_type,
            punishment = %updated.punishment,
            threshold = updated.message_count_threshold,
            amount = updated.required_amount_or_interval,
            votes = updated.vote_threshold,
            "Configured spam prevention"
        );
        // Flags are reset below, so no vote may carry over to a later flag
        updated.votes.clear();
        let result = updated.clone();
        self.settings.update(guild_id, |settings| {
            *settings.spam_mut(spam_type) = updated;
        });
        self.reset_logs(guild_id, Some(spam_type));
        Ok(result)
    }

    pub fn enable(&self, guild_id: u64, spam_type: SpamType) -> SpamPreventionInfo {
        info!(guild_id, %spam_type, "Enabling spam prevention");
        self.settings.update(guild_id, |settings| {
            let info = settings.spam_mut(spam_type);
            info.enabled = true;
            info.clone()
        })
    }

    /// Disable a type and drop its logs, flags and votes
    pub fn disable(&self, guild_id: u64, spam_type: SpamType) -> SpamPreventionInfo {
        info!(guild_id, %spam_type, "Disabling spam prevention");
        let info = self.settings.update(guild_id, |settings| {
            let info = settings.spam_mut(spam_type);
            info.enabled = false;
            info.votes.clear();
            info.clone()
        });
        self.reset_logs(guild_id, Some(spam_type));
        info
    }

    /// Record a message from `user_id`
    pub fn record(&self, guild_id: u64, user_id: u64, event: SpamEvent) -> SpamDetection {
        self.maybe_sweep(event.at);

        let rules: Vec<Rule> = self
            .settings
            .read(guild_id, |settings| {
                settings
                    .spam
                    .iter()
                    .filter(|(_, info)| info.enabled)
                    .map(|(spam_type, info)| Rule {
                        spam_type: *spam_type,
                        threshold: info.message_count_threshold.max(1),
                        required: info.required_amount_or_interval,
                        vote_threshold: info.vote_threshold,
                        punishment: info.punishment,
                        duration: info.duration,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut detection = SpamDetection::default();
        for rule in rules {
            if !event.qualifies(rule.spam_type, rule.required) {
                continue;
            }

            let key = (guild_id, user_id, rule.spam_type);
            let mut log = self.logs.entry(key).or_default();
            log.entries.push_back(event.at);

            let threshold = usize::try_from(rule.threshold).unwrap_or(usize::MAX);
            if rule.spam_type.is_interval_based() {
                let cutoff = event.at - Duration::seconds(i64::from(rule.required));
                while log.entries.front().is_some_and(|at| *at < cutoff) {
                    log.entries.pop_front();
                }
            } else {
                while log.entries.len() > threshold {
                    log.entries.pop_front();
                }
            }

            if log.entries.len() < threshold || log.flagged {
                continue;
            }

            if rule.vote_threshold == 0 {
                log.entries.clear();
                drop(log);
                info!(guild_id, user_id, spam_type = %rule.spam_type, "Spam detected, punishing");
                detection.punishments.push(rule.request(
                    guild_id,
                    user_id,
                    format!("{} spam detected", rule.spam_type),
                ));
                continue;
            }

            log.flagged = true;
            info!(
                guild_id,
                user_id,
                spam_type = %rule.spam_type,
                votes_needed = rule.vote_threshold,
                "User flagged for spam"
            );
            detection.flags.push(SpamFlag {
                guild_id,
                user_id,
                spam_type: rule.spam_type,
                votes_needed: rule.vote_threshold,
            });
        }
        detection
    }

    /// Count a vote from `voter_id` confirming that `target_id` is spamming
    ///
    /// Only distinct members other than the target count. Once enough votes
    /// are in, the log and the vote set are cleared and the punishment is
    /// returned for the caller to dispatch.
    pub fn vote(
        &self,
        guild_id: u64,
        spam_type: SpamType,
        target_id: u64,
        voter_id: u64,
    ) -> VoteOutcome {
        let key = (guild_id, target_id, spam_type);
        if !self.logs.get(&key).is_some_and(|log| log.flagged) {
            return VoteOutcome::NotFlagged;
        }
        if voter_id == target_id {
            return VoteOutcome::SelfVote;
        }

        let outcome = self.settings.update(guild_id, |settings| {
            let info = settings.spam_mut(spam_type);
            let voters = info.votes.entry(target_id).or_default();
            if !voters.insert(voter_id) {
                return VoteOutcome::DuplicateVote;
            }

            let votes = u32::try_from(voters.len()).unwrap_or(u32::MAX);
            let needed = info.vote_threshold.max(1);
            if votes < needed {
                return VoteOutcome::Recorded { votes, needed };
            }

            info.votes.remove(&target_id);
            let rule = Rule {
                spam_type,
                threshold: info.message_count_threshold,
                required: info.required_amount_or_interval,
                vote_threshold: info.vote_threshold,
                punishment: info.punishment,
                duration: info.duration,
            };
            VoteOutcome::Punish(rule.request(
                guild_id,
                target_id,
                format!("{spam_type} spam confirmed by {votes} members"),
            ))
        });

        match &outcome {
            VoteOutcome::Punish(_) => {
                self.logs.remove(&key);
                info!(guild_id, target_id, %spam_type, "Spam flag confirmed by vote");
            }
            other => debug!(guild_id, target_id, voter_id, %spam_type, outcome = ?other, "Spam vote"),
        }
        outcome
    }

    /// Whether a user is currently flagged for a type
    pub fn is_flagged(&self, guild_id: u64, user_id: u64, spam_type: SpamType) -> bool {
        self.logs
            .get(&(guild_id, user_id, spam_type))
            .is_some_and(|log| log.flagged)
    }

    /// Forget the runtime state of a guild, pending votes included
    pub fn purge_guild(&self, guild_id: u64) {
        self.reset_logs(guild_id, None);
        if self.settings.read(guild_id, |_| ()).is_some() {
            self.settings.update(guild_id, |settings| {
                for info in settings.spam.values_mut() {
                    info.votes.clear();
                }
            });
        }
    }

    /// Drop logs without a qualifying message for [`STALE_LOG_SECS`]
    ///
    /// Expired flags take their votes with them. Returns how many logs were
    /// dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(STALE_LOG_SECS);
        let mut expired_flags: Vec<LogKey> = Vec::new();
        let before = self.logs.len();
        self.logs.retain(|key, log| {
            let fresh = log.entries.back().is_some_and(|at| *at >= cutoff);
            if !fresh && log.flagged {
                expired_flags.push(*key);
            }
            fresh
        });
        let dropped = before.saturating_sub(self.logs.len());

        for (guild_id, user_id, spam_type) in expired_flags {
            self.settings.update(guild_id, |settings| {
                if let Some(info) = settings.spam.get_mut(&spam_type) {
                    info.votes.remove(&user_id);
                }
            });
            debug!(guild_id, user_id, %spam_type, "Spam flag expired");
        }
        if dropped > 0 {
            debug!(dropped, "Pruned stale spam logs");
        }
        dropped
    }

    fn maybe_sweep(&self, now: DateTime<Utc>) {
        let now_secs = now.timestamp();
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now_secs.saturating_sub(last) < SWEEP_INTERVAL_SECS {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now_secs, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.prune(now);
        }
    }

    fn reset_logs(&self, guild_id: u64, spam_type: Option<SpamType>) {
        self.logs.retain(|(guild, _, kind), _| {
            *guild != guild_id || spam_type.is_some_and(|t| t != *kind)
        });
    }
}

impl Rule {
    fn request(&self, guild_id: u64, user_id: u64, reason: String) -> PunishmentRequest {
        let duration = self.duration.filter(|_| self.punishment.supports_expiry());
        PunishmentRequest::new(
            guild_id,
            user_id,
            self.punishment,
            PunishmentArgs::new(reason).with_duration(duration),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUILD: u64 = 1;
    const SPAMMER: u64 = 10;

    fn engine_with(spam_type: SpamType, config: SpamConfig) -> SpamPreventionEngine {
        let engine = SpamPreventionEngine::new(SettingsStore::new());
        engine.configure(GUILD, spam_type, config).unwrap();
        engine.enable(GUILD, spam_type);
        engine
    }

    fn message_rate(votes: u32) -> SpamPreventionEngine {
        engine_with(
            SpamType::Messages,
            SpamConfig {
                punishment: Some(PunishmentType::RoleMute),
                message_count_threshold: Some(5),
                required_amount_or_interval: Some(10),
                vote_threshold: Some(votes),
                duration: Some(Some(300)),
            },
        )
    }

    #[test]
    fn test_five_in_ten_seconds_then_two_votes() {
        let engine = message_rate(2);
        let start = Utc::now();

        for i in 0..4 {
            let detection = engine.record(GUILD, SPAMMER, SpamEvent::new(start + Duration::seconds(i * 2)));
            assert!(detection.flags.is_empty());
        }
        let detection = engine.record(GUILD, SPAMMER, SpamEvent::new(start + Duration::seconds(9)));
        assert_eq!(detection.flags.len(), 1);
        assert!(detection.punishments.is_empty());
        assert!(engine.is_flagged(GUILD, SPAMMER, SpamType::Messages));

        assert_eq!(engine.vote(GUILD, SpamType::Messages, SPAMMER, SPAMMER), VoteOutcome::SelfVote);
        assert_eq!(
            engine.vote(GUILD, SpamType::Messages, SPAMMER, 20),
            VoteOutcome::Recorded { votes: 1, needed: 2 }
        );
        assert_eq!(engine.vote(GUILD, SpamType::Messages, SPAMMER, 20), VoteOutcome::DuplicateVote);

        let VoteOutcome::Punish(request) = engine.vote(GUILD, SpamType::Messages, SPAMMER, 21) else {
            panic!("second distinct vote should punish");
        };
        assert_eq!(request.user_id, SPAMMER);
        assert_eq!(request.punishment, PunishmentType::RoleMute);
        assert_eq!(request.args.duration, Some(300));

        // Log and votes are cleared
        assert!(!engine.is_flagged(GUILD, SPAMMER, SpamType::Messages));
        assert!(engine.info(GUILD, SpamType::Messages).votes.is_empty());
        assert_eq!(engine.vote(GUILD, SpamType::Messages, SPAMMER, 22), VoteOutcome::NotFlagged);
    }

    #[test]
    fn test_messages_outside_window_do_not_count() {
        let engine = message_rate(2);
        let start = Utc::now();

        for i in 0..4 {
            engine.record(GUILD, SPAMMER, SpamEvent::new(start + Duration::seconds(i)));
        }
        let late = engine.record(GUILD, SPAMMER, SpamEvent::new(start + Duration::seconds(25)));
        assert!(late.flags.is_empty());
        assert!(!engine.is_flagged(GUILD, SPAMMER, SpamType::Messages));
    }

    #[test]
    fn test_no_votes_needed_punishes_immediately() {
        let engine = message_rate(0);
        let start = Utc::now();

        let mut punishments = Vec::new();
        for i in 0..5 {
            punishments.extend(engine.record(GUILD, SPAMMER, SpamEvent::new(start + Duration::seconds(i))).punishments);
        }
        assert_eq!(punishments.len(), 1);
        assert!(!engine.is_flagged(GUILD, SPAMMER, SpamType::Messages));
    }

    #[test]
    fn test_mentions_count_only_qualifying_messages() {
        let engine = engine_with(
            SpamType::Mentions,
            SpamConfig {
                message_count_threshold: Some(2),
                required_amount_or_interval: Some(5),
                vote_threshold: Some(1),
                ..Default::default()
            },
        );
        let now = Utc::now();
        let heavy = SpamEvent {
            mentions: 6,
            ..SpamEvent::new(now)
        };
        let light = SpamEvent {
            mentions: 1,
            ..SpamEvent::new(now)
        };

        assert!(engine.record(GUILD, SPAMMER, heavy).flags.is_empty());
        assert!(engine.record(GUILD, SPAMMER, light).flags.is_empty());
        assert_eq!(engine.record(GUILD, SPAMMER, heavy).flags.len(), 1);
        // Already flagged, not announced again
        assert!(engine.record(GUILD, SPAMMER, heavy).flags.is_empty());

        assert!(matches!(
            engine.vote(GUILD, SpamType::Mentions, SPAMMER, 2),
            VoteOutcome::Punish(_)
        ));
    }

    fn flag(engine: &SpamPreventionEngine, start: DateTime<Utc>) {
        for i in 0..5 {
            engine.record(GUILD, SPAMMER, SpamEvent::new(start + Duration::seconds(i)));
        }
        assert!(engine.is_flagged(GUILD, SPAMMER, SpamType::Messages));
    }

    #[test]
    fn test_votes_do_not_survive_configure() {
        let engine = message_rate(2);
        let start = Utc::now();
        flag(&engine, start);
        assert_eq!(
            engine.vote(GUILD, SpamType::Messages, SPAMMER, 20),
            VoteOutcome::Recorded { votes: 1, needed: 2 }
        );

        engine
            .configure(
                GUILD,
                SpamType::Messages,
                SpamConfig {
                    duration: Some(Some(60)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!engine.is_flagged(GUILD, SPAMMER, SpamType::Messages));
        assert!(engine.info(GUILD, SpamType::Messages).votes.is_empty());

        // A fresh flag starts from zero votes
        flag(&engine, start + Duration::seconds(30));
        assert_eq!(
            engine.vote(GUILD, SpamType::Messages, SPAMMER, 21),
            VoteOutcome::Recorded { votes: 1, needed: 2 }
        );
    }

    #[test]
    fn test_votes_are_not_persisted() {
        let engine = message_rate(2);
        flag(&engine, Utc::now());
        engine.vote(GUILD, SpamType::Messages, SPAMMER, 20);
        assert_eq!(engine.info(GUILD, SpamType::Messages).votes.len(), 1);

        let yaml = serde_yaml::to_string(&engine.info(GUILD, SpamType::Messages)).unwrap();
        let restored: SpamPreventionInfo = serde_yaml::from_str(&yaml).unwrap();
        assert!(restored.votes.is_empty());
        assert!(restored.enabled);
    }

    #[test]
    fn test_purge_guild_clears_votes() {
        let engine = message_rate(2);
        flag(&engine, Utc::now());
        engine.vote(GUILD, SpamType::Messages, SPAMMER, 20);

        engine.purge_guild(GUILD);
        assert!(!engine.is_flagged(GUILD, SPAMMER, SpamType::Messages));
        assert!(engine.info(GUILD, SpamType::Messages).votes.is_empty());
    }

    #[test]
    fn test_stale_logs_are_dropped() {
        let engine = message_rate(2);
        let start = Utc::now();
        for user in 0..1_000 {
            engine.record(GUILD, 1_000 + user, SpamEvent::new(start));
        }
        assert_eq!(engine.logs.len(), 1_000);

        engine.record(GUILD, SPAMMER, SpamEvent::new(start + Duration::days(30)));
        assert_eq!(engine.logs.len(), 1);
    }

    #[test]
    fn test_stale_flag_expires_with_its_votes() {
        let engine = message_rate(2);
        let start = Utc::now();
        flag(&engine, start);
        engine.vote(GUILD, SpamType::Messages, SPAMMER, 20);

        assert_eq!(engine.prune(start + Duration::seconds(STALE_LOG_SECS - 60)), 0);
        assert!(engine.is_flagged(GUILD, SPAMMER, SpamType::Messages));

        assert_eq!(engine.prune(start + Duration::seconds(STALE_LOG_SECS + 60)), 1);
        assert!(!engine.is_flagged(GUILD, SPAMMER, SpamType::Messages));
        assert!(engine.info(GUILD, SpamType::Messages).votes.is_empty());
        assert_eq!(engine.vote(GUILD, SpamType::Messages, SPAMMER, 21), VoteOutcome::NotFlagged);
    }

    #[test]
    fn test_disabled_types_are_ignored() {
        let engine = message_rate(1);
        engine.disable(GUILD, SpamType::Messages);
        let now = Utc::now();
        for _ in 0..10 {
            assert_eq!(engine.record(GUILD, SPAMMER, SpamEvent::new(now)), SpamDetection::default());
        }
    }

    #[test]
    fn test_duration_rejected_for_kick() {
        let engine = SpamPreventionEngine::new(SettingsStore::new());
        let err = engine
            .configure(
                GUILD,
                SpamType::Links,
                SpamConfig {
                    punishment: Some(PunishmentType::Kick),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ModerationError::NotTimeLimited(PunishmentType::Kick)));

        let info = engine
            .configure(
                GUILD,
                SpamType::Links,
                SpamConfig {
                    punishment: Some(PunishmentType::Kick),
                    duration: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(info.punishment, PunishmentType::Kick);
    }

    #[test]
    fn test_event_from_content() {
        let event = SpamEvent::from_content(
            Utc::now(),
            "see https://a.example and http://b.example now",
            2,
            1,
        );
        assert_eq!(event.links, 2);
        assert_eq!(event.mentions, 2);
        assert_eq!(event.images, 1);
        assert_eq!(event.length, 46);
    }
}
