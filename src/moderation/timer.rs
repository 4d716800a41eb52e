//! Timer service
//!
//! Holds every pending delayed action and fires it once its deadline passes.
//! A single loop owns the schedule; entries are keyed so that a user can only
//! have one pending removal per punishment kind.

use crate::moderation::{ModerationResult, PunishmentType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A punishment waiting to be lifted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovablePunishment {
    /// Unique ID, used to correlate log lines
    pub id: String,
    pub guild_id: u64,
    pub user_id: u64,
    pub punishment: PunishmentType,
    /// Role to take away again, only for role mutes
    pub role_id: Option<u64>,
    pub expires_at: DateTime<Utc>,
}

impl RemovablePunishment {
    /// Create an entry that expires `seconds` from `now`
    pub fn new(
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
        role_id: Option<u64>,
        now: DateTime<Utc>,
        seconds: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            guild_id,
            user_id,
            punishment,
            role_id,
            expires_at: now + Duration::seconds(i64::from(seconds)),
        }
    }

    #[must_use]
    pub fn key(&self) -> TimerKey {
        TimerKey {
            guild_id: self.guild_id,
            user_id: self.user_id,
            punishment: self.punishment,
        }
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A bot message scheduled for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovableMessage {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub expires_at: DateTime<Utc>,
}

/// Identity of a pending punishment removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub guild_id: u64,
    pub user_id: u64,
    pub punishment: PunishmentType,
}

/// Effects the timer invokes when entries come due
#[async_trait]
pub trait TimerEffects: Send + Sync {
    async fn punishment_expired(&self, entry: &RemovablePunishment) -> ModerationResult<()>;

    async fn message_expired(&self, entry: &RemovableMessage) -> ModerationResult<()>;
}

/// Requests accepted by the running timer loop
#[derive(Debug, Clone)]
pub enum TimerRequest {
    /// Run a tick right away instead of waiting for the interval
    CheckNow,
    /// Stop the loop
    Shutdown,
}

/// Pending delayed actions
#[derive(Clone, Default)]
pub struct TimerService {
    punishments: Arc<DashMap<TimerKey, RemovablePunishment>>,
    messages: Arc<DashMap<u64, RemovableMessage>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a punishment removal, replacing any entry with the same key
    pub fn add(&self, entry: RemovablePunishment) -> Option<RemovablePunishment> {
        debug!(
            timer_id = %entry.id,
            guild_id = entry.guild_id,
            user_id = entry.user_id,
            punishment = %entry.punishment,
            expires_at = %entry.expires_at,
            "Scheduling punishment removal"
        );
        let replaced = self.punishments.insert(entry.key(), entry);
        if let Some(old) = &replaced {
            info!(
                timer_id = %old.id,
                guild_id = old.guild_id,
                user_id = old.user_id,
                punishment = %old.punishment,
                "Replaced pending punishment removal"
            );
        }
        replaced
    }

    /// Cancel a pending punishment removal
    pub fn remove(
        &self,
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
    ) -> Option<RemovablePunishment> {
        let key = TimerKey {
            guild_id,
            user_id,
            punishment,
        };
        self.punishments.remove(&key).map(|(_, entry)| entry)
    }

    pub fn get(
        &self,
        guild_id: u64,
        user_id: u64,
        punishment: PunishmentType,
    ) -> Option<RemovablePunishment> {
        let key = TimerKey {
            guild_id,
            user_id,
            punishment,
        };
        self.punishments.get(&key).map(|entry| entry.value().clone())
    }

    /// Every pending removal for a user in a guild
    pub fn pending_for_user(&self, guild_id: u64, user_id: u64) -> Vec<RemovablePunishment> {
        let mut pending: Vec<_> = self
            .punishments
            .iter()
            .filter(|entry| entry.guild_id == guild_id && entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|entry| entry.expires_at);
        pending
    }

    pub fn len(&self) -> usize {
        self.punishments.len() + self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedule a message for deletion
    pub fn add_message(&self, entry: RemovableMessage) {
        self.messages.insert(entry.message_id, entry);
    }

    pub fn remove_message(&self, message_id: u64) -> bool {
        self.messages.remove(&message_id).is_some()
    }

    /// Drop everything scheduled for a guild the bot is no longer in
    pub fn purge_guild(&self, guild_id: u64) -> usize {
        let before = self.len();
        self.punishments.retain(|key, _| key.guild_id != guild_id);
        self.messages.retain(|_, entry| entry.guild_id != guild_id);
        let purged = before - self.len();
        if purged > 0 {
            info!(guild_id, purged, "Purged pending timers for departed guild");
        }
        purged
    }

    /// Pending punishment removals, for persistence
    pub fn snapshot(&self) -> Vec<RemovablePunishment> {
        let mut entries: Vec<_> = self
            .punishments
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by_key(|entry| entry.expires_at);
        entries
    }

    /// Re-register punishment removals persisted by a previous process
    pub fn restore(&self, entries: impl IntoIterator<Item = RemovablePunishment>) -> usize {
        let mut restored = 0;
        for entry in entries {
            // Keep the later deadline if the same key shows up twice
            let key = entry.key();
            let keep_existing = self
                .punishments
                .get(&key)
                .is_some_and(|existing| existing.expires_at >= entry.expires_at);
            if !keep_existing {
                self.punishments.insert(key, entry);
                restored += 1;
            }
        }
        info!(restored, "Restored pending punishment removals");
        restored
    }

    /// Fire every entry due at `now`
    ///
    /// Each entry is taken out of the schedule before its effect runs, so a
    /// concurrent [`TimerService::remove`] either wins and nothing fires, or
    /// loses and finds nothing to cancel. Failed effects are logged and not
    /// retried. Returns the number of entries consumed.
    pub async fn tick(&self, now: DateTime<Utc>, effects: &dyn TimerEffects) -> usize {
        let due_keys: Vec<TimerKey> = self
            .punishments
            .iter()
            .filter(|entry| entry.is_due(now))
            .map(|entry| *entry.key())
            .collect();

        let mut fired = 0;
        for key in due_keys {
            // A replacement with a later deadline may have landed in between
            let Some((_, entry)) = self.punishments.remove_if(&key, |_, entry| entry.is_due(now))
            else {
                continue;
            };
            fired += 1;

            if let Err(e) = effects.punishment_expired(&entry).await {
                error!(
                    timer_id = %entry.id,
                    guild_id = entry.guild_id,
                    user_id = entry.user_id,
                    punishment = %entry.punishment,
                    error = %e,
                    "Failed to lift expired punishment"
                );
            }
        }

        let due_messages: Vec<u64> = self
            .messages
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| *entry.key())
            .collect();

        for message_id in due_messages {
            let Some((_, entry)) = self.messages.remove(&message_id) else {
                continue;
            };
            fired += 1;

            if let Err(e) = effects.message_expired(&entry).await {
                warn!(
                    channel_id = entry.channel_id,
                    message_id = entry.message_id,
                    error = %e,
                    "Failed to delete expired message"
                );
            }
        }

        fired
    }

    /// Create the request channel for the timer loop
    pub fn channel() -> (Sender<TimerRequest>, Receiver<TimerRequest>) {
        mpsc::channel(16)
    }

    /// Spawn the timer loop on the current runtime
    pub fn start(
        self,
        effects: Arc<dyn TimerEffects>,
        rx: Receiver<TimerRequest>,
        check_interval_seconds: u64,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(effects, rx, check_interval_seconds).await;
        })
    }

    async fn run(
        &self,
        effects: Arc<dyn TimerEffects>,
        mut rx: Receiver<TimerRequest>,
        check_interval_seconds: u64,
    ) {
        info!("Starting timer loop with {check_interval_seconds}s interval");

        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(check_interval_seconds.max(1)));

        loop {
            tokio::select! {
                request = rx.recv() => {
                    match request {
                        Some(TimerRequest::CheckNow) => {
                            self.tick(Utc::now(), effects.as_ref()).await;
                        }
                        Some(TimerRequest::Shutdown) | None => {
                            info!("Received shutdown request for timer loop");
                            break;
                        }
                    }
                }

                _ = interval.tick() => {
                    let fired = self.tick(Utc::now(), effects.as_ref()).await;
                    if fired > 0 {
                        debug!(fired, "Timer tick fired entries");
                    }
                }
            }
        }

        info!("Timer loop shut down");
    }
}
