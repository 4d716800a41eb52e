use super::{
    MEMBER_CHECKS, PunishmentChoice, RaidChoice, SpamChoice, duration_arg, format_duration,
    guild_id, manager, persist, resolve_actors, resolve_member,
};
use crate::moderation::{
    ModerationError, PunishmentType, RaidConfig, RaidPreventionInfo, RaidType, RemovableMessage,
    SpamConfig, SpamPreventionInfo, SpamType, VoteOutcome, validate,
};
use crate::{Context, Error};
use chrono::{Duration, Utc};
use poise::serenity_prelude as serenity;
use tracing::warn;

/// Seconds a vote confirmation stays in the channel
const VOTE_REPLY_TTL_SECS: i64 = 30;

fn expiry_text(duration: Option<u32>) -> String {
    duration
        .filter(|d| *d > 0)
        .map_or_else(|| "permanent".to_string(), format_duration)
}

pub(crate) fn describe_spam(spam_type: SpamType, info: &SpamPreventionInfo) -> String {
    let amount = if spam_type.is_interval_based() {
        format!("within {}s", info.required_amount_or_interval)
    } else {
        format!("with at least {} each", info.required_amount_or_interval)
    };
    let votes = match info.vote_threshold {
        0 => "no votes".to_string(),
        1 => "1 vote".to_string(),
        n => format!("{n} votes"),
    };
    format!(
        "**{spam_type}** spam is {}: {} messages {amount}, {votes}, then {} ({})",
        if info.enabled { "on" } else { "off" },
        info.message_count_threshold,
        info.punishment,
        expiry_text(info.duration),
    )
}

pub(crate) fn describe_raid(raid_type: RaidType, info: &RaidPreventionInfo) -> String {
    let mut text = format!(
        "**{raid_type}** raid protection is {}: {} joins within {}s, then {} ({})",
        if info.enabled { "on" } else { "off" },
        info.user_count_threshold,
        info.interval_seconds,
        info.punishment,
        expiry_text(info.duration),
    );
    if raid_type == RaidType::NewAccounts {
        text.push_str(&format!(", accounts younger than {}h", info.min_account_age_hours));
    }
    text
}

/// Configure spam prevention and vote on flagged members
#[poise::command(
    slash_command,
    guild_only,
    subcommands("spam_enable", "spam_disable", "spam_configure", "spam_vote")
)]
pub async fn spam(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Turn on detection for a spam type
#[poise::command(
    slash_command,
    guild_only,
    rename = "enable",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn spam_enable(
    ctx: Context<'_>,
    #[description = "Spam type"] kind: SpamChoice,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let spam_type = SpamType::from(kind);
    let info = ctx.data().spam.enable(guild_id, spam_type);
    persist(ctx).await;
    ctx.say(describe_spam(spam_type, &info)).await?;
    Ok(())
}

/// Turn off detection for a spam type and drop pending votes
#[poise::command(
    slash_command,
    guild_only,
    rename = "disable",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn spam_disable(
    ctx: Context<'_>,
    #[description = "Spam type"] kind: SpamChoice,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let spam_type = SpamType::from(kind);
    let info = ctx.data().spam.disable(guild_id, spam_type);
    persist(ctx).await;
    ctx.say(describe_spam(spam_type, &info)).await?;
    Ok(())
}

/// Change the thresholds and punishment of a spam type
#[poise::command(
    slash_command,
    guild_only,
    rename = "configure",
    required_permissions = "MANAGE_GUILD"
)]
#[allow(clippy::too_many_arguments)]
pub async fn spam_configure(
    ctx: Context<'_>,
    #[description = "Spam type"] kind: SpamChoice,
    #[description = "Punishment once confirmed"] punishment: Option<PunishmentChoice>,
    #[description = "Qualifying messages before a member is flagged"]
    #[min = 1]
    messages: Option<u32>,
    #[description = "Window in seconds for message spam, per-message amount otherwise"]
    amount: Option<u32>,
    #[description = "Members who must confirm a flag (0 punishes right away)"] votes: Option<u32>,
    #[description = "How long the punishment lasts (e.g. 10m)"] duration: Option<String>,
    #[description = "Make the punishment permanent"] permanent: Option<bool>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let spam_type = SpamType::from(kind);
    let duration = if permanent.unwrap_or(false) {
        Some(None)
    } else {
        duration_arg(duration.as_deref())?.map(Some)
    };

    let info = ctx.data().spam.configure(
        guild_id,
        spam_type,
        SpamConfig {
            punishment: punishment.map(PunishmentType::from),
            message_count_threshold: messages,
            required_amount_or_interval: amount,
            vote_threshold: votes,
            duration,
        },
    )?;
    persist(ctx).await;
    ctx.say(describe_spam(spam_type, &info)).await?;
    Ok(())
}

/// Confirm that a flagged member is spamming
#[poise::command(slash_command, guild_only, rename = "vote")]
pub async fn spam_vote(
    ctx: Context<'_>,
    #[description = "Flagged member"] user: serenity::User,
    #[description = "Spam type they were flagged for"] kind: SpamChoice,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let spam_type = SpamType::from(kind);

    let outcome = ctx
        .data()
        .spam
        .vote(guild_id, spam_type, user.id.get(), ctx.author().id.get());

    let text = match outcome {
        VoteOutcome::NotFlagged => {
            format!("<@{}> is not flagged for {spam_type} spam.", user.id)
        }
        VoteOutcome::SelfVote => "You cannot vote on yourself.".to_string(),
        VoteOutcome::DuplicateVote => "You already voted.".to_string(),
        VoteOutcome::Recorded { votes, needed } => {
            format!("Vote recorded against <@{}> ({votes}/{needed}).", user.id)
        }
        VoteOutcome::Punish(request) => {
            let manager = manager(ctx)?;
            let (_, bot) = resolve_actors(ctx)?;
            let target = resolve_member(ctx, user.id)?;
            validate(&bot, &target, MEMBER_CHECKS, bot.user_id).map_err(ModerationError::from)?;

            let punishment = request.punishment;
            manager.dispatch(request);
            format!("Enough votes: {punishment} applied to <@{}>.", user.id)
        }
    };

    let reply = ctx.say(text).await?;
    match reply.message().await {
        Ok(message) => ctx.data().timers.add_message(RemovableMessage {
            guild_id,
            channel_id: message.channel_id.get(),
            message_id: message.id.get(),
            expires_at: Utc::now() + Duration::seconds(VOTE_REPLY_TTL_SECS),
        }),
        Err(e) => warn!(error = %e, "Could not schedule vote reply for deletion"),
    }
    persist(ctx).await;
    Ok(())
}

/// Configure raid protection
#[poise::command(
    slash_command,
    guild_only,
    subcommands("raid_enable", "raid_disable", "raid_configure")
)]
pub async fn raid(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Turn on a raid detector
#[poise::command(
    slash_command,
    guild_only,
    rename = "enable",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn raid_enable(
    ctx: Context<'_>,
    #[description = "Raid type"] kind: RaidChoice,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let raid_type = RaidType::from(kind);
    let info = ctx.data().raid.enable(guild_id, raid_type);
    persist(ctx).await;
    ctx.say(describe_raid(raid_type, &info)).await?;
    Ok(())
}

/// Turn off a raid detector
#[poise::command(
    slash_command,
    guild_only,
    rename = "disable",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn raid_disable(
    ctx: Context<'_>,
    #[description = "Raid type"] kind: RaidChoice,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let raid_type = RaidType::from(kind);
    let info = ctx.data().raid.disable(guild_id, raid_type);
    persist(ctx).await;
    ctx.say(describe_raid(raid_type, &info)).await?;
    Ok(())
}

/// Change the thresholds and punishment of a raid detector
#[poise::command(
    slash_command,
    guild_only,
    rename = "configure",
    required_permissions = "MANAGE_GUILD"
)]
#[allow(clippy::too_many_arguments)]
pub async fn raid_configure(
    ctx: Context<'_>,
    #[description = "Raid type"] kind: RaidChoice,
    #[description = "Punishment for swept members"] punishment: Option<PunishmentChoice>,
    #[description = "Joins that count as a raid"]
    #[min = 1]
    joins: Option<u32>,
    #[description = "Window in seconds"] interval: Option<u32>,
    #[description = "How long the punishment lasts (e.g. 1d)"] duration: Option<String>,
    #[description = "Make the punishment permanent"] permanent: Option<bool>,
    #[description = "Accounts younger than this many hours count as new"] account_age: Option<u32>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let raid_type = RaidType::from(kind);
    let duration = if permanent.unwrap_or(false) {
        Some(None)
    } else {
        duration_arg(duration.as_deref())?.map(Some)
    };

    let info = ctx.data().raid.configure(
        guild_id,
        raid_type,
        RaidConfig {
            punishment: punishment.map(PunishmentType::from),
            user_count_threshold: joins,
            interval_seconds: interval,
            duration,
            min_account_age_hours: account_age,
        },
    )?;
    persist(ctx).await;
    ctx.say(describe_raid(raid_type, &info)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_spam() {
        let info = SpamPreventionInfo::default_for(SpamType::Messages);
        assert_eq!(
            describe_spam(SpamType::Messages, &info),
            "**Messages** spam is off: 5 messages within 10s, 2 votes, then Role Mute (10m)"
        );

        let mut info = SpamPreventionInfo::default_for(SpamType::Links);
        info.enabled = true;
        info.vote_threshold = 0;
        info.punishment = PunishmentType::Kick;
        info.duration = None;
        assert_eq!(
            describe_spam(SpamType::Links, &info),
            "**Links** spam is on: 3 messages with at least 3 each, no votes, then Kick (permanent)"
        );
    }

    #[test]
    fn test_describe_raid() {
        let info = RaidPreventionInfo::default_for(RaidType::NewAccounts);
        let text = describe_raid(RaidType::NewAccounts, &info);
        assert!(text.starts_with("**New Accounts** raid protection is off: 5 joins within 60s"));
        assert!(text.ends_with("accounts younger than 24h"));

        let info = RaidPreventionInfo::default_for(RaidType::Joins);
        assert!(!describe_raid(RaidType::Joins, &info).contains("younger"));
    }

    #[test]
    fn test_subcommands() {
        let names: Vec<String> = spam().subcommands.into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["enable", "disable", "configure", "vote"]);

        let names: Vec<String> = raid().subcommands.into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["enable", "disable", "configure"]);
    }
}
