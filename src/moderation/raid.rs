//! Raid prevention
//!
//! Tracks recent joins per guild and raid type. When too many qualifying
//! users join within the interval, the most recent of them are swept with the
//! configured punishment right away.

use crate::moderation::{
    JoinRecord, ModerationError, ModerationResult, PunishmentArgs, PunishmentRequest,
    PunishmentType, RaidPreventionInfo, RaidType, SettingsStore,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

/// Most users a single sweep punishes
pub const MAX_SWEEP: usize = 25;

/// Optional changes to a raid type's settings
#[derive(Debug, Clone, Default)]
pub struct RaidConfig {
    pub punishment: Option<PunishmentType>,
    pub user_count_threshold: Option<u32>,
    pub interval_seconds: Option<u32>,
    pub duration: Option<Option<u32>>,
    pub min_account_age_hours: Option<u32>,
}

pub struct RaidPreventionEngine {
    settings: SettingsStore,
}

impl RaidPreventionEngine {
    pub fn new(settings: SettingsStore) -> Self {
        Self { settings }
    }

    pub fn info(&self, guild_id: u64, raid_type: RaidType) -> RaidPreventionInfo {
        self.settings
            .read(guild_id, |settings| settings.raid.get(&raid_type).cloned())
            .flatten()
            .unwrap_or_else(|| RaidPreventionInfo::default_for(raid_type))
    }

    /// # Errors
    /// Returns [`ModerationError::NotTimeLimited`] if the resulting
    /// punishment cannot expire but a duration is set.
    pub fn configure(
        &self,
        guild_id: u64,
        raid_type: RaidType,
        config: RaidConfig,
    ) -> ModerationResult<RaidPreventionInfo> {
        self.settings.update(guild_id, |settings| {
            let info = settings.raid_mut(raid_type);
            let mut updated = info.clone();
            if let Some(punishment) = config.punishment {
                updated.punishment = punishment;
            }
            if let Some(threshold) = config.user_count_threshold {
                updated.user_count_threshold = threshold.max(1);
            }
            if let Some(interval) = config.interval_seconds {
                updated.interval_seconds = interval;
            }
            if let Some(duration) = config.duration {
                updated.duration = duration;
            }
            if let Some(hours) = config.min_account_age_hours {
                updated.min_account_age_hours = hours;
            }
            if updated.duration.is_some_and(|d| d > 0) && !updated.punishment.supports_expiry() {
                return Err(ModerationError::NotTimeLimited(updated.punishment));
            }

            updated.recent_joins.clear();
            info!(
                guild_id,
                %raid_type,
                punishment = %updated.punishment,
                threshold = updated.user_count_threshold,
                interval = updated.interval_seconds,
                "Configured raid prevention"
            );
            *info = updated.clone();
            Ok(updated)
        })
    }

    pub fn enable(&self, guild_id: u64, raid_type: RaidType) -> RaidPreventionInfo {
        info!(guild_id, %raid_type, "Enabling raid prevention");
        self.settings.update(guild_id, |settings| {
            let info = settings.raid_mut(raid_type);
            info.enabled = true;
            info.clone()
        })
    }

    pub fn disable(&self, guild_id: u64, raid_type: RaidType) -> RaidPreventionInfo {
        info!(guild_id, %raid_type, "Disabling raid prevention");
        self.settings.update(guild_id, |settings| {
            let info = settings.raid_mut(raid_type);
            info.enabled = false;
            info.recent_joins.clear();
            info.clone()
        })
    }

    /// Record a member join and return the punishments of any sweep it triggers
    ///
    /// A user swept by one raid type is not punished again by another in the
    /// same call.
    pub fn record_join(
        &self,
        guild_id: u64,
        user_id: u64,
        joined_at: DateTime<Utc>,
        account_created_at: Option<DateTime<Utc>>,
    ) -> Vec<PunishmentRequest> {
        let watching = self
            .settings
            .read(guild_id, |settings| settings.raid.values().any(|info| info.enabled))
            .unwrap_or(false);
        if !watching {
            return Vec::new();
        }

        self.settings.update(guild_id, |settings| {
            let mut requests: Vec<PunishmentRequest> = Vec::new();

            for raid_type in RaidType::ALL {
                let Some(info) = settings.raid.get_mut(&raid_type) else {
                    continue;
                };
                if !info.enabled || !qualifies(raid_type, info, joined_at, account_created_at) {
                    continue;
                }

                info.recent_joins.push_back(JoinRecord { user_id, joined_at });
                let cutoff = joined_at - Duration::seconds(i64::from(info.interval_seconds));
                while info
                    .recent_joins
                    .front()
                    .is_some_and(|join| join.joined_at < cutoff)
                {
                    info.recent_joins.pop_front();
                }

                let threshold = usize::try_from(info.user_count_threshold.max(1)).unwrap_or(usize::MAX);
                let available = info.recent_joins.len();
                if available < threshold {
                    continue;
                }

                let take = threshold.min(available).min(MAX_SWEEP);
                let swept: Vec<JoinRecord> = info.recent_joins.drain(available - take..).collect();
                warn!(
                    guild_id,
                    %raid_type,
                    joins = available,
                    swept = swept.len(),
                    interval = info.interval_seconds,
                    "Raid detected, sweeping recent joins"
                );

                let duration = info.duration.filter(|_| info.punishment.supports_expiry());
                for join in swept {
                    if requests.iter().any(|r| r.user_id == join.user_id) {
                        continue;
                    }
                    let args = PunishmentArgs::new(format!(
                        "Raid protection ({raid_type}): {available} joins in {}s",
                        info.interval_seconds
                    ))
                    .with_duration(duration);
                    requests.push(PunishmentRequest::new(
                        guild_id,
                        join.user_id,
                        info.punishment,
                        args,
                    ));
                }
            }

            requests
        })
    }
}

fn qualifies(
    raid_type: RaidType,
    info: &RaidPreventionInfo,
    joined_at: DateTime<Utc>,
    account_created_at: Option<DateTime<Utc>>,
) -> bool {
    match raid_type {
        RaidType::Joins => true,
        RaidType::NewAccounts => account_created_at.is_some_and(|created| {
            joined_at - created < Duration::hours(i64::from(info.min_account_age_hours))
        }),
    }
}
