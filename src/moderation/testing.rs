//! In-memory platform used by the unit tests

use crate::moderation::{ModerationError, ModerationResult, PlatformClient, VoiceState};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Keeps just enough guild state to observe what the engine did
#[derive(Default)]
pub struct FakePlatform {
    pub bans: Mutex<HashSet<(u64, u64)>>,
    pub roles: Mutex<HashSet<(u64, u64, u64)>>,
    pub voice: Mutex<HashMap<(u64, u64), VoiceState>>,
    pub deleted_messages: Mutex<Vec<u64>>,
    /// Every mutating call, in order, e.g. `"ban 1 2"`
    pub calls: Mutex<Vec<String>>,
    /// Users that have left the guild
    pub absent: Mutex<HashSet<u64>>,
}

impl FakePlatform {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn ensure_present(&self, user_id: u64) -> ModerationResult<()> {
        if self.absent.lock().unwrap().contains(&user_id) {
            return Err(ModerationError::TargetNotFound(format!("Unknown Member {user_id}")));
        }
        Ok(())
    }

    pub fn is_banned(&self, guild_id: u64, user_id: u64) -> bool {
        self.bans.lock().unwrap().contains(&(guild_id, user_id))
    }

    pub fn has(&self, guild_id: u64, user_id: u64, role_id: u64) -> bool {
        self.roles.lock().unwrap().contains(&(guild_id, user_id, role_id))
    }

    pub fn voice_of(&self, guild_id: u64, user_id: u64) -> VoiceState {
        self.voice
            .lock()
            .unwrap()
            .get(&(guild_id, user_id))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn ban(&self, guild_id: u64, user_id: u64, purge_days: u8, _reason: &str) -> ModerationResult<()> {
        self.record(format!("ban {guild_id} {user_id} {purge_days}"));
        self.bans.lock().unwrap().insert((guild_id, user_id));
        Ok(())
    }

    async fn unban(&self, guild_id: u64, user_id: u64, _reason: &str) -> ModerationResult<()> {
        self.record(format!("unban {guild_id} {user_id}"));
        if self.bans.lock().unwrap().remove(&(guild_id, user_id)) {
            Ok(())
        } else {
            Err(ModerationError::TargetNotFound("Unknown Ban".to_string()))
        }
    }

    async fn kick(&self, guild_id: u64, user_id: u64, _reason: &str) -> ModerationResult<()> {
        self.ensure_present(user_id)?;
        self.record(format!("kick {guild_id} {user_id}"));
        self.absent.lock().unwrap().insert(user_id);
        Ok(())
    }

    async fn set_voice_mute(&self, guild_id: u64, user_id: u64, muted: bool, _reason: &str) -> ModerationResult<()> {
        self.ensure_present(user_id)?;
        self.record(format!("mute {guild_id} {user_id} {muted}"));
        self.voice
            .lock()
            .unwrap()
            .entry((guild_id, user_id))
            .or_default()
            .muted = muted;
        Ok(())
    }

    async fn set_voice_deafen(&self, guild_id: u64, user_id: u64, deafened: bool, _reason: &str) -> ModerationResult<()> {
        self.ensure_present(user_id)?;
        self.record(format!("deafen {guild_id} {user_id} {deafened}"));
        self.voice
            .lock()
            .unwrap()
            .entry((guild_id, user_id))
            .or_default()
            .deafened = deafened;
        Ok(())
    }

    async fn add_role(&self, guild_id: u64, user_id: u64, role_id: u64, _reason: &str) -> ModerationResult<()> {
        self.ensure_present(user_id)?;
        self.record(format!("add_role {guild_id} {user_id} {role_id}"));
        self.roles.lock().unwrap().insert((guild_id, user_id, role_id));
        Ok(())
    }

    async fn remove_role(&self, guild_id: u64, user_id: u64, role_id: u64, _reason: &str) -> ModerationResult<()> {
        self.ensure_present(user_id)?;
        self.record(format!("remove_role {guild_id} {user_id} {role_id}"));
        self.roles.lock().unwrap().remove(&(guild_id, user_id, role_id));
        Ok(())
    }

    async fn voice_state(&self, guild_id: u64, user_id: u64) -> ModerationResult<VoiceState> {
        self.ensure_present(user_id)?;
        Ok(self.voice_of(guild_id, user_id))
    }

    async fn has_role(&self, guild_id: u64, user_id: u64, role_id: u64) -> ModerationResult<bool> {
        self.ensure_present(user_id)?;
        Ok(self.has(guild_id, user_id, role_id))
    }

    async fn delete_message(&self, _channel_id: u64, message_id: u64) -> ModerationResult<()> {
        self.deleted_messages.lock().unwrap().push(message_id);
        Ok(())
    }
}
