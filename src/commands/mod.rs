//! Slash commands
//!
//! Every command that punishes someone resolves both the invoking member and
//! the bot from the cache and runs the hierarchy checks before handing off to
//! the punishment manager.

mod automod;
mod phrase;
mod punish;

pub use automod::{raid, spam};
pub use phrase::phrase;
pub use punish::{ban, deafen, kick, muterole, rolemute, softban, unpunish, voicemute};

use crate::moderation::{
    Actor, InfractionChannel, ModerationError, PunishmentManager, PunishmentType, RaidType,
    SpamType, Target, Verif, validate_both,
};
use crate::{Context, Data, Error, logging};
use poise::FrameworkError;
use poise::serenity_prelude as serenity;
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::warn;

/// Rules every member punishment is checked against
pub const MEMBER_CHECKS: &[Verif] = &[Verif::CanBeEdited];

/// Rules for a role the bot is asked to hand out
pub const ASSIGNABLE_ROLE_CHECKS: &[Verif] = &[
    Verif::IsNotEveryoneRole,
    Verif::IsNotManagedRole,
    Verif::CanBeEdited,
];

/// Every command the bot registers
pub fn all() -> Vec<poise::Command<Data, Error>> {
    vec![
        ban(),
        softban(),
        kick(),
        voicemute(),
        deafen(),
        rolemute(),
        unpunish(),
        muterole(),
        spam(),
        raid(),
        phrase(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub enum PunishmentChoice {
    Ban,
    Softban,
    Kick,
    Deafen,
    #[name = "Voice Mute"]
    VoiceMute,
    #[name = "Role Mute"]
    RoleMute,
}

impl From<PunishmentChoice> for PunishmentType {
    fn from(choice: PunishmentChoice) -> Self {
        match choice {
            PunishmentChoice::Ban => Self::Ban,
            PunishmentChoice::Softban => Self::Softban,
            PunishmentChoice::Kick => Self::Kick,
            PunishmentChoice::Deafen => Self::Deafen,
            PunishmentChoice::VoiceMute => Self::VoiceMute,
            PunishmentChoice::RoleMute => Self::RoleMute,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub enum SpamChoice {
    Messages,
    Mentions,
    Links,
    Images,
    #[name = "Long Messages"]
    LongMessages,
}

impl From<SpamChoice> for SpamType {
    fn from(choice: SpamChoice) -> Self {
        match choice {
            SpamChoice::Messages => Self::Messages,
            SpamChoice::Mentions => Self::Mentions,
            SpamChoice::Links => Self::Links,
            SpamChoice::Images => Self::Images,
            SpamChoice::LongMessages => Self::LongMessages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub enum RaidChoice {
    Joins,
    #[name = "New Accounts"]
    NewAccounts,
}

impl From<RaidChoice> for RaidType {
    fn from(choice: RaidChoice) -> Self {
        match choice {
            RaidChoice::Joins => Self::Joins,
            RaidChoice::NewAccounts => Self::NewAccounts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub enum ChannelChoice {
    Role,
    Kick,
    Ban,
}

impl From<ChannelChoice> for InfractionChannel {
    fn from(choice: ChannelChoice) -> Self {
        match choice {
            ChannelChoice::Role => Self::Role,
            ChannelChoice::Kick => Self::Kick,
            ChannelChoice::Ban => Self::Ban,
        }
    }
}

static DURATION_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+[dhms])+$").expect("valid regex"));
static DURATION_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)([dhms])").expect("valid regex"));

/// Parse durations like `90`, `10m`, `1h30m` or `2d` into seconds
///
/// A bare number is taken as minutes. Returns `None` for anything else or
/// for a total of zero.
pub fn parse_duration(input: &str) -> Option<u32> {
    let input = input.trim().to_lowercase();
    if let Ok(minutes) = input.parse::<u32>() {
        return minutes.checked_mul(60).filter(|secs| *secs > 0);
    }
    if !DURATION_FORMAT.is_match(&input) {
        return None;
    }

    let mut total: u64 = 0;
    for caps in DURATION_PART.captures_iter(&input) {
        let value: u64 = caps[1].parse().ok()?;
        let unit: u64 = match &caps[2] {
            "d" => 86_400,
            "h" => 3_600,
            "m" => 60,
            _ => 1,
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
    }

    u32::try_from(total).ok().filter(|secs| *secs > 0)
}

/// Render seconds the way [`parse_duration`] reads them
pub fn format_duration(seconds: u32) -> String {
    let (days, rest) = (seconds / 86_400, seconds % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let (minutes, secs) = (rest / 60, rest % 60);

    let parts: Vec<String> = [(days, 'd'), (hours, 'h'), (minutes, 'm'), (secs, 's')]
        .into_iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    if parts.is_empty() {
        "0s".to_string()
    } else {
        parts.concat()
    }
}

/// Parse an optional duration argument, rejecting malformed input
fn duration_arg(input: Option<&str>) -> Result<Option<u32>, Error> {
    input
        .map(|raw| parse_duration(raw).ok_or_else(|| format!("Invalid duration `{raw}`, try 10m, 1h30m or 2d")))
        .transpose()
        .map_err(Into::into)
}

fn guild_id(ctx: Context<'_>) -> Result<u64, Error> {
    ctx.guild_id()
        .map(serenity::GuildId::get)
        .ok_or_else(|| "This command only works in a server".into())
}

fn manager(ctx: Context<'_>) -> Result<Arc<PunishmentManager>, Error> {
    ctx.data()
        .manager()
        .cloned()
        .ok_or_else(|| "The bot is still starting up, try again shortly".into())
}

/// Resolve the invoking member and the bot from the cached guild
fn resolve_actors(ctx: Context<'_>) -> Result<(Actor, Actor), Error> {
    let bot_id = ctx.cache().current_user().id;
    let guild = ctx.guild().ok_or("This server is not cached yet")?;
    let invoker = guild
        .members
        .get(&ctx.author().id)
        .ok_or("Could not find you in this server")?;
    let bot = guild
        .members
        .get(&bot_id)
        .ok_or("Could not find the bot in this server")?;
    Ok((
        Actor::from_guild_member(&guild, invoker),
        Actor::from_guild_member(&guild, bot),
    ))
}

/// Resolve a member target; members who already left rank lowest
fn resolve_member(ctx: Context<'_>, user_id: serenity::UserId) -> Result<Target, Error> {
    let guild = ctx.guild().ok_or("This server is not cached yet")?;
    Ok(guild.members.get(&user_id).map_or_else(
        || Target::absent_member(user_id.get()),
        |member| Target::member(&guild, member),
    ))
}

fn role_target(guild_id: u64, role_id: u64, position: u16, managed: bool) -> Target {
    Target::Role {
        role_id,
        position,
        is_everyone: role_id == guild_id,
        managed,
    }
}

/// Both actors must outrank a role before it is assigned to anyone
fn check_assignable(invoker: &Actor, bot: &Actor, target: &Target) -> Result<(), ModerationError> {
    validate_both(invoker, bot, target, ASSIGNABLE_ROLE_CHECKS)?;
    Ok(())
}

/// Check the invoker and the bot against a role they want to hand out
fn check_role(ctx: Context<'_>, role: &serenity::Role) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let (invoker, bot) = resolve_actors(ctx)?;
    let target = role_target(guild_id, role.id.get(), role.position, role.managed);
    check_assignable(&invoker, &bot, &target)?;
    Ok(())
}

/// Check the invoker and the bot against a member
fn check_member(ctx: Context<'_>, user_id: serenity::UserId) -> Result<(), Error> {
    let (invoker, bot) = resolve_actors(ctx)?;
    let target = resolve_member(ctx, user_id)?;
    validate_both(&invoker, &bot, &target, MEMBER_CHECKS).map_err(ModerationError::from)?;
    Ok(())
}

/// Persist settings after a change; failures are logged, not reported
async fn persist(ctx: Context<'_>) {
    if let Err(e) = ctx.data().save().await {
        warn!(error = %e, "Failed to save data");
    }
}

/// Log a framework error and tell the invoking user what went wrong
pub async fn on_error(error: FrameworkError<'_, Data, Error>) {
    logging::log_command_error(&error);

    match error {
        FrameworkError::Command { error, ctx, .. } => {
            let message = match error.downcast_ref::<ModerationError>() {
                Some(e) if !e.is_user_facing() => {
                    "Something went wrong talking to Discord, check the bot's permissions and try again"
                        .to_string()
                }
                _ => error.to_string(),
            };
            if let Err(e) = ctx.say(message).await {
                warn!(error = %e, "Failed to report command error");
            }
        }
        other => {
            if let Err(e) = poise::builtins::on_error(other).await {
                warn!(error = %e, "Failed to report framework error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10m30s"), Some(630));
        assert_eq!(parse_duration("1h30m"), Some(5400));
        assert_eq!(parse_duration("1D"), Some(86_400));
        assert_eq!(parse_duration("15"), Some(900));
        assert_eq!(parse_duration(" 45s "), Some(45));

        assert_eq!(parse_duration("invalid"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration("10m5"), None);
        assert_eq!(parse_duration("h30"), None);
        assert_eq!(parse_duration("1h 30m"), None);
        assert_eq!(parse_duration("-5m"), None);
        assert_eq!(parse_duration("0m"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("99999999d"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5400), "1h30m");
        assert_eq!(format_duration(90_061), "1d1h1m1s");
        assert_eq!(format_duration(0), "0s");
        assert_eq!(parse_duration(&format_duration(3_723)), Some(3_723));
    }

    #[test]
    fn test_duration_arg() {
        assert_eq!(duration_arg(None).unwrap(), None);
        assert_eq!(duration_arg(Some("2h")).unwrap(), Some(7200));
        assert!(duration_arg(Some("soon")).is_err());
    }

    #[test]
    fn test_assignable_role_checks() {
        use crate::moderation::{Rank, ValidationError};
        use poise::serenity_prelude::Permissions;

        const GUILD: u64 = 500;
        let invoker = Actor::new(1, Rank::Position(5), Permissions::MANAGE_ROLES);
        let bot = Actor::new(2, Rank::Position(10), Permissions::MANAGE_ROLES);

        assert!(check_assignable(&invoker, &bot, &role_target(GUILD, 40, 3, false)).is_ok());

        // Above the invoker but below the bot
        let err = check_assignable(&invoker, &bot, &role_target(GUILD, 41, 8, false)).unwrap_err();
        assert!(matches!(
            err,
            ModerationError::Hierarchy(ValidationError::ActorCannotModify { actor: 1, .. })
        ));

        // Above both
        let owner = Actor::new(1, Rank::Owner, Permissions::empty());
        let err = check_assignable(&owner, &bot, &role_target(GUILD, 42, 12, false)).unwrap_err();
        assert!(matches!(
            err,
            ModerationError::Hierarchy(ValidationError::ActorCannotModify { actor: 2, .. })
        ));

        assert!(matches!(
            check_assignable(&invoker, &bot, &role_target(GUILD, 43, 1, true)),
            Err(ModerationError::Hierarchy(ValidationError::ManagedRole))
        ));
        assert!(matches!(
            check_assignable(&invoker, &bot, &role_target(GUILD, GUILD, 0, false)),
            Err(ModerationError::Hierarchy(ValidationError::EveryoneRole))
        ));
    }

    #[test]
    fn test_choices_map_to_domain() {
        assert_eq!(PunishmentType::from(PunishmentChoice::VoiceMute), PunishmentType::VoiceMute);
        assert_eq!(SpamType::from(SpamChoice::LongMessages), SpamType::LongMessages);
        assert_eq!(RaidType::from(RaidChoice::NewAccounts), RaidType::NewAccounts);
        assert_eq!(InfractionChannel::from(ChannelChoice::Kick), InfractionChannel::Kick);
    }

    #[test]
    fn test_all_commands_registered() {
        let names: Vec<String> = all().into_iter().map(|cmd| cmd.name).collect();
        for expected in [
            "ban", "softban", "kick", "voicemute", "deafen", "rolemute", "unpunish", "muterole",
            "spam", "raid", "phrase",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_all_commands_are_guild_only_slash_commands() {
        for cmd in all() {
            assert!(cmd.guild_only, "{} should be guild only", cmd.name);
            assert!(cmd.create_as_slash_command().is_some(), "{}", cmd.name);
        }
    }
}
