//! Moderation engine
//!
//! Hierarchy checks, the punishment manager with its timer service, and the
//! three automatic detectors. Nothing in here depends on the gateway; the
//! platform is reached through [`PlatformClient`].

pub mod error;
pub mod hierarchy;
pub mod manager;
pub mod phrases;
pub mod platform;
pub mod punishment;
pub mod raid;
pub mod settings;
pub mod spam;
pub mod timer;

#[cfg(test)]
mod testing;

pub use error::{ModerationError, ModerationResult};
pub use hierarchy::{Actor, Rank, Target, ValidationError, Verif, validate, validate_both};
pub use manager::PunishmentManager;
pub use phrases::{BannedPhraseEngine, PhraseVerdict, validate_pattern};
pub use platform::{PlatformClient, SerenityPlatform, VoiceState};
pub use punishment::{
    MAX_PURGE_DAYS, PunishmentArgs, PunishmentOutcome, PunishmentRequest, PunishmentType,
};
pub use raid::{RaidConfig, RaidPreventionEngine};
pub use settings::{
    BannedPhrase, BannedPhrasePunishment, GuildSettings, InfractionChannel, InfractionCounter,
    JoinRecord, PhraseMatcher, RaidPreventionInfo, RaidType, SettingsStore, SpamPreventionInfo,
    SpamType,
};
pub use spam::{SpamConfig, SpamDetection, SpamEvent, SpamFlag, SpamPreventionEngine, VoteOutcome};
pub use timer::{
    RemovableMessage, RemovablePunishment, TimerEffects, TimerKey, TimerRequest, TimerService,
};
