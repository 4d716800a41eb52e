//! Punishment kinds and their parameters
//!
//! This module defines the punishments the engine can apply to a guild member
//! and the transient argument bundle that travels with every request.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest message-purge window a ban may request, in days
pub const MAX_PURGE_DAYS: u8 = 7;

/// Kind of punishment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunishmentType {
    /// Server ban with an optional message purge
    Ban,
    /// Ban immediately followed by an unban, used to purge messages
    Softban,
    /// Server kick
    Kick,
    /// Voice deafen
    Deafen,
    /// Voice mute
    VoiceMute,
    /// Adds the guild's mute role
    RoleMute,
}

impl fmt::Display for PunishmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ban => write!(f, "Ban"),
            Self::Softban => write!(f, "Softban"),
            Self::Kick => write!(f, "Kick"),
            Self::Deafen => write!(f, "Deafen"),
            Self::VoiceMute => write!(f, "Voice Mute"),
            Self::RoleMute => write!(f, "Role Mute"),
        }
    }
}

impl PunishmentType {
    /// Every punishment kind, in escalating order
    pub const ALL: [Self; 6] = [
        Self::VoiceMute,
        Self::Deafen,
        Self::RoleMute,
        Self::Kick,
        Self::Softban,
        Self::Ban,
    ];

    /// Whether a punishment of this kind can be scheduled for automatic removal
    #[must_use]
    pub fn supports_expiry(self) -> bool {
        !matches!(self, Self::Kick | Self::Softban)
    }

    /// Whether applying this punishment a second time means "undo"
    #[must_use]
    pub fn is_toggle(self) -> bool {
        matches!(self, Self::RoleMute | Self::VoiceMute | Self::Deafen)
    }
}

/// Arguments that accompany a punishment request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PunishmentArgs {
    /// Ban message-purge window in days
    pub days: u8,
    /// Seconds until the punishment is lifted automatically
    pub duration: Option<u32>,
    /// Role to use for a role mute instead of the guild's mute role
    pub role: Option<u64>,
    /// Audit-log reason
    pub reason: String,
}

impl PunishmentArgs {
    /// Create arguments carrying only a reason
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    /// Set the automatic-removal delay
    #[must_use]
    pub fn with_duration(mut self, duration: impl Into<Option<u32>>) -> Self {
        self.duration = duration.into();
        self
    }

    /// Set the ban purge window, clamped to what the platform accepts
    #[must_use]
    pub fn with_days(mut self, days: u8) -> Self {
        self.days = days.min(MAX_PURGE_DAYS);
        self
    }

    /// Set an explicit role for a role mute
    #[must_use]
    pub fn with_role(mut self, role: impl Into<Option<u64>>) -> Self {
        self.role = role.into();
        self
    }

    /// Check if the punishment should be lifted automatically
    pub fn has_duration(&self) -> bool {
        self.duration.is_some_and(|d| d > 0)
    }
}

/// A punishment decided by a detector, waiting to be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunishmentRequest {
    pub guild_id: u64,
    pub user_id: u64,
    pub punishment: PunishmentType,
    pub args: PunishmentArgs,
}

impl PunishmentRequest {
    pub fn new(guild_id: u64, user_id: u64, punishment: PunishmentType, args: PunishmentArgs) -> Self {
        Self {
            guild_id,
            user_id,
            punishment,
            args,
        }
    }
}

/// What a call into the punishment manager ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunishmentOutcome {
    /// The punishment was applied
    Applied,
    /// The punishment was already in place, so it was lifted instead
    Reverted,
    /// The punishment was lifted
    Removed,
    /// Nothing needed to change
    NoOp,
    /// The member, ban or role was gone by the time the platform was asked
    TargetGone,
}
