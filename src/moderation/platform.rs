//! Chat platform access
//!
//! The engine only talks to Discord through [`PlatformClient`], so everything
//! above this module can be exercised without a gateway connection.

use crate::moderation::{ModerationError, ModerationResult};
use async_trait::async_trait;
use serenity::all::{
    Cache, ChannelId, EditMember, GuildId, Http, MessageId, RoleId, UserId,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Voice flags of a guild member
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoiceState {
    pub muted: bool,
    pub deafened: bool,
}

/// Operations the engine needs from the chat platform
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn ban(&self, guild_id: u64, user_id: u64, purge_days: u8, reason: &str)
    -> ModerationResult<()>;

    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> ModerationResult<()>;

    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> ModerationResult<()>;

    async fn set_voice_mute(
        &self,
        guild_id: u64,
        user_id: u64,
        muted: bool,
        reason: &str,
    ) -> ModerationResult<()>;

    async fn set_voice_deafen(
        &self,
        guild_id: u64,
        user_id: u64,
        deafened: bool,
        reason: &str,
    ) -> ModerationResult<()>;

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> ModerationResult<()>;

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> ModerationResult<()>;

    async fn voice_state(&self, guild_id: u64, user_id: u64) -> ModerationResult<VoiceState>;

    async fn has_role(&self, guild_id: u64, user_id: u64, role_id: u64) -> ModerationResult<bool>;

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> ModerationResult<()>;
}

/// [`PlatformClient`] backed by serenity's HTTP client and cache
#[derive(Clone)]
pub struct SerenityPlatform {
    http: Arc<Http>,
    cache: Option<Arc<Cache>>,
}

impl SerenityPlatform {
    pub fn new(http: Arc<Http>, cache: Option<Arc<Cache>>) -> Self {
        Self { http, cache }
    }

    /// Voice flags from the gateway cache, if the guild is cached
    fn cached_voice_state(&self, guild_id: GuildId, user_id: UserId) -> Option<VoiceState> {
        let cache = self.cache.as_ref()?;
        let guild = cache.guild(guild_id)?;
        let state = guild.voice_states.get(&user_id)?;
        Some(VoiceState {
            muted: state.mute,
            deafened: state.deaf,
        })
    }
}

#[async_trait]
impl PlatformClient for SerenityPlatform {
    async fn ban(
        &self,
        guild_id: u64,
        user_id: u64,
        purge_days: u8,
        reason: &str,
    ) -> ModerationResult<()> {
        GuildId::new(guild_id)
            .ban_with_reason(&self.http, UserId::new(user_id), purge_days, reason)
            .await?;
        Ok(())
    }

    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> ModerationResult<()> {
        info!(guild_id, user_id, reason, "Unbanning user");
        self.http
            .remove_ban(GuildId::new(guild_id), UserId::new(user_id), Some(reason))
            .await?;
        Ok(())
    }

    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> ModerationResult<()> {
        GuildId::new(guild_id)
            .kick_with_reason(&self.http, UserId::new(user_id), reason)
            .await?;
        Ok(())
    }

    async fn set_voice_mute(
        &self,
        guild_id: u64,
        user_id: u64,
        muted: bool,
        reason: &str,
    ) -> ModerationResult<()> {
        GuildId::new(guild_id)
            .edit_member(
                &self.http,
                UserId::new(user_id),
                EditMember::new().mute(muted).audit_log_reason(reason),
            )
            .await?;
        Ok(())
    }

    async fn set_voice_deafen(
        &self,
        guild_id: u64,
        user_id: u64,
        deafened: bool,
        reason: &str,
    ) -> ModerationResult<()> {
        GuildId::new(guild_id)
            .edit_member(
                &self.http,
                UserId::new(user_id),
                EditMember::new().deafen(deafened).audit_log_reason(reason),
            )
            .await?;
        Ok(())
    }

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> ModerationResult<()> {
        self.http
            .add_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await?;
        Ok(())
    }

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> ModerationResult<()> {
        self.http
            .remove_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some(reason),
            )
            .await?;
        Ok(())
    }

    async fn voice_state(&self, guild_id: u64, user_id: u64) -> ModerationResult<VoiceState> {
        let (guild_id, user_id) = (GuildId::new(guild_id), UserId::new(user_id));
        if let Some(state) = self.cached_voice_state(guild_id, user_id) {
            return Ok(state);
        }

        debug!(%guild_id, %user_id, "Voice state not cached, fetching member");
        let member = guild_id.member(&self.http, user_id).await?;
        Ok(VoiceState {
            muted: member.mute,
            deafened: member.deaf,
        })
    }

    async fn has_role(&self, guild_id: u64, user_id: u64, role_id: u64) -> ModerationResult<bool> {
        let member = GuildId::new(guild_id)
            .member(&self.http, UserId::new(user_id))
            .await?;
        Ok(member.roles.contains(&RoleId::new(role_id)))
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> ModerationResult<()> {
        match ChannelId::new(channel_id)
            .delete_message(&self.http, MessageId::new(message_id))
            .await
            .map_err(ModerationError::from)
        {
            Err(ModerationError::TargetNotFound(_)) => {
                // Already gone, nothing left to do
                Ok(())
            }
            other => other,
        }
    }
}
