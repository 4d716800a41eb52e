//! Punishment manager
//!
//! Applies and lifts punishments through the platform client and keeps the
//! timer service in step: time-limited punishments get a pending removal,
//! manual removals cancel it. Callers are expected to have validated the
//! hierarchy already.

use crate::MODERATION_TARGET;
use crate::moderation::{
    ModerationError, ModerationResult, PlatformClient, PunishmentArgs, PunishmentOutcome,
    PunishmentRequest, PunishmentType, RemovableMessage, RemovablePunishment, SettingsStore,
    TimerEffects, TimerService,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Reason used when a timer lifts a punishment
const EXPIRED_REASON: &str = "Punishment expired";

pub struct PunishmentManager {
    platform: Arc<dyn PlatformClient>,
    timers: TimerService,
    settings: SettingsStore,
}

impl PunishmentManager {
    pub fn new(platform: Arc<dyn PlatformClient>, timers: TimerService, settings: SettingsStore) -> Self {
        Self {
            platform,
            timers,
            settings,
        }
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub fn platform(&self) -> &dyn PlatformClient {
        self.platform.as_ref()
    }

    /// Apply a punishment on behalf of a moderator
    ///
    /// Mutes and deafens already in place are lifted instead, so running the
    /// same command twice undoes it.
    ///
    /// # Errors
    /// Returns an error if the punishment cannot expire but a duration was
    /// given, if no mute role is configured, or if the platform call fails.
    pub async fn give(
        &self,
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
        args: &PunishmentArgs,
    ) -> ModerationResult<PunishmentOutcome> {
        let result = self.give_inner(guild_id, user_id, punishment, args, true).await;
        absorb_missing_target(guild_id, user_id, punishment, result)
    }

    /// Make sure a punishment is in place, never lifting an existing one
    ///
    /// Used for automatic punishments, where a second detection must not
    /// unmute the user.
    ///
    /// # Errors
    /// Same as [`PunishmentManager::give`].
    pub async fn enforce(
        &self,
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
        args: &PunishmentArgs,
    ) -> ModerationResult<PunishmentOutcome> {
        let result = self.give_inner(guild_id, user_id, punishment, args, false).await;
        absorb_missing_target(guild_id, user_id, punishment, result)
    }

    /// Lift a punishment and cancel its pending removal
    ///
    /// Lifting a punishment that is not in place is a no-op.
    ///
    /// # Errors
    /// Returns an error if a role mute has no role to remove or the platform
    /// call fails.
    pub async fn remove(
        &self,
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
        args: &PunishmentArgs,
    ) -> ModerationResult<PunishmentOutcome> {
        let cancelled = self.timers.remove(guild_id, user_id, punishment);
        if let Some(entry) = &cancelled {
            info!(
                target: MODERATION_TARGET,
                timer_id = %entry.id,
                guild_id,
                user_id,
                punishment = %punishment,
                "Cancelled pending punishment removal"
            );
        }

        let role_id = cancelled.and_then(|entry| entry.role_id);
        let result = self
            .lift(guild_id, user_id, punishment, role_id, &args.reason, args.role)
            .await;
        absorb_missing_target(guild_id, user_id, punishment, result)
    }

    /// Apply a detector's request in the background
    ///
    /// Failures are logged; the detector's own state is left as it is.
    pub fn dispatch(self: &Arc<Self>, request: PunishmentRequest) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let PunishmentRequest {
                guild_id,
                user_id,
                punishment,
                args,
            } = request;

            match manager.enforce(guild_id, user_id, punishment, &args).await {
                Ok(outcome) => info!(
                    target: MODERATION_TARGET,
                    guild_id,
                    user_id,
                    punishment = %punishment,
                    outcome = ?outcome,
                    reason = %args.reason,
                    "Automatic punishment processed"
                ),
                Err(e) => error!(
                    target: MODERATION_TARGET,
                    guild_id,
                    user_id,
                    punishment = %punishment,
                    error = %e,
                    "Automatic punishment failed"
                ),
            }
        })
    }

    async fn give_inner(
        &self,
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
        args: &PunishmentArgs,
        toggle: bool,
    ) -> ModerationResult<PunishmentOutcome> {
        if args.has_duration() && !punishment.supports_expiry() {
            return Err(ModerationError::NotTimeLimited(punishment));
        }

        let role_id = match punishment {
            PunishmentType::RoleMute => Some(self.mute_role(guild_id, args.role)?),
            _ => None,
        };

        if punishment.is_toggle() && self.is_applied(guild_id, user_id, punishment, role_id).await? {
            if toggle {
                info!(
                    target: MODERATION_TARGET,
                    guild_id,
                    user_id,
                    punishment = %punishment,
                    "Punishment already in place, lifting it"
                );
                return match self.remove(guild_id, user_id, punishment, args).await? {
                    PunishmentOutcome::Removed => Ok(PunishmentOutcome::Reverted),
                    other => Ok(other),
                };
            }
            self.schedule(guild_id, user_id, punishment, role_id, args);
            return Ok(PunishmentOutcome::NoOp);
        }

        let reason = args.reason.as_str();
        match punishment {
            PunishmentType::Ban => {
                self.platform.ban(guild_id, user_id, args.days, reason).await?;
            }
            PunishmentType::Softban => {
                self.platform.ban(guild_id, user_id, args.days, reason).await?;
                self.platform.unban(guild_id, user_id, reason).await?;
            }
            PunishmentType::Kick => self.platform.kick(guild_id, user_id, reason).await?,
            PunishmentType::Deafen => {
                self.platform.set_voice_deafen(guild_id, user_id, true, reason).await?;
            }
            PunishmentType::VoiceMute => {
                self.platform.set_voice_mute(guild_id, user_id, true, reason).await?;
            }
            PunishmentType::RoleMute => {
                if let Some(role_id) = role_id {
                    self.platform.add_role(guild_id, user_id, role_id, reason).await?;
                }
            }
        }

        self.schedule(guild_id, user_id, punishment, role_id, args);

        info!(
            target: MODERATION_TARGET,
            guild_id,
            user_id,
            punishment = %punishment,
            duration = ?args.duration,
            reason,
            "Punishment applied"
        );
        Ok(PunishmentOutcome::Applied)
    }

    /// Register, replace or drop the pending removal after applying
    fn schedule(
        &self,
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
        role_id: Option<u64>,
        args: &PunishmentArgs,
    ) {
        if !punishment.supports_expiry() {
            return;
        }
        match args.duration.filter(|seconds| *seconds > 0) {
            Some(seconds) => {
                self.timers.add(RemovablePunishment::new(
                    guild_id,
                    user_id,
                    punishment,
                    role_id,
                    Utc::now(),
                    seconds,
                ));
            }
            None => {
                // A permanent punishment supersedes an earlier temporary one
                self.timers.remove(guild_id, user_id, punishment);
            }
        }
    }

    async fn lift(
        &self,
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
        timer_role: Option<u64>,
        reason: &str,
        explicit_role: Option<u64>,
    ) -> ModerationResult<PunishmentOutcome> {
        match punishment {
            PunishmentType::Kick | PunishmentType::Softban => Ok(PunishmentOutcome::NoOp),
            // An unknown ban means there is nothing to lift, not a missing member
            PunishmentType::Ban => match self.platform.unban(guild_id, user_id, reason).await {
                Ok(()) => Ok(PunishmentOutcome::Removed),
                Err(ModerationError::TargetNotFound(_)) => Ok(PunishmentOutcome::NoOp),
                Err(e) => Err(e),
            },
            PunishmentType::Deafen | PunishmentType::VoiceMute | PunishmentType::RoleMute => {
                let role_id = match punishment {
                    PunishmentType::RoleMute => {
                        Some(self.mute_role(guild_id, explicit_role.or(timer_role))?)
                    }
                    _ => None,
                };
                if !self.is_applied(guild_id, user_id, punishment, role_id).await? {
                    return Ok(PunishmentOutcome::NoOp);
                }

                match (punishment, role_id) {
                    (PunishmentType::Deafen, _) => {
                        self.platform.set_voice_deafen(guild_id, user_id, false, reason).await?;
                    }
                    (PunishmentType::VoiceMute, _) => {
                        self.platform.set_voice_mute(guild_id, user_id, false, reason).await?;
                    }
                    (_, Some(role_id)) => {
                        self.platform.remove_role(guild_id, user_id, role_id, reason).await?;
                    }
                    (_, None) => return Ok(PunishmentOutcome::NoOp),
                }

                info!(
                    target: MODERATION_TARGET,
                    guild_id,
                    user_id,
                    punishment = %punishment,
                    reason,
                    "Punishment lifted"
                );
                Ok(PunishmentOutcome::Removed)
            }
        }
    }

    async fn is_applied(
        &self,
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
        role_id: Option<u64>,
    ) -> ModerationResult<bool> {
        match (punishment, role_id) {
            (PunishmentType::RoleMute, Some(role_id)) => {
                self.platform.has_role(guild_id, user_id, role_id).await
            }
            (PunishmentType::VoiceMute, _) => {
                Ok(self.platform.voice_state(guild_id, user_id).await?.muted)
            }
            (PunishmentType::Deafen, _) => {
                Ok(self.platform.voice_state(guild_id, user_id).await?.deafened)
            }
            _ => Ok(false),
        }
    }

    fn mute_role(&self, guild_id: u64, explicit: Option<u64>) -> ModerationResult<u64> {
        explicit
            .or_else(|| self.settings.mute_role(guild_id))
            .ok_or(ModerationError::MuteRoleNotConfigured(guild_id))
    }
}

/// A user who already left is the desired end state for most punishments
fn absorb_missing_target(
    guild_id: u64,
    user_id: u64,
    punishment: PunishmentType,
    result: ModerationResult<PunishmentOutcome>,
) -> ModerationResult<PunishmentOutcome> {
    match result {
        Err(ModerationError::TargetNotFound(what)) => {
            warn!(
                target: MODERATION_TARGET,
                guild_id,
                user_id,
                punishment = %punishment,
                missing = %what,
                "Target not found, nothing to do"
            );
            Ok(PunishmentOutcome::TargetGone)
        }
        other => other,
    }
}

#[async_trait]
impl TimerEffects for PunishmentManager {
    async fn punishment_expired(&self, entry: &RemovablePunishment) -> ModerationResult<()> {
        let args = PunishmentArgs::new(EXPIRED_REASON).with_role(entry.role_id);
        let outcome = self
            .remove(entry.guild_id, entry.user_id, entry.punishment, &args)
            .await?;
        info!(
            target: MODERATION_TARGET,
            timer_id = %entry.id,
            guild_id = entry.guild_id,
            user_id = entry.user_id,
            punishment = %entry.punishment,
            outcome = ?outcome,
            "Expired punishment processed"
        );
        Ok(())
    }

    async fn message_expired(&self, entry: &RemovableMessage) -> ModerationResult<()> {
        self.platform
            .delete_message(entry.channel_id, entry.message_id)
            .await
    }
}
