use super::{
    PunishmentChoice, check_member, check_role, duration_arg, format_duration, guild_id, manager,
    persist,
};
use crate::moderation::{PunishmentArgs, PunishmentOutcome, PunishmentType};
use crate::{Context, Error};
use poise::serenity_prelude as serenity;

const NO_REASON: &str = "No reason provided";

/// Validate, apply and report a punishment
async fn punish(
    ctx: Context<'_>,
    user: &serenity::User,
    punishment: PunishmentType,
    args: PunishmentArgs,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let manager = manager(ctx)?;
    check_member(ctx, user.id)?;

    let outcome = manager.give(guild_id, user.id.get(), punishment, &args).await?;
    ctx.say(describe(outcome, punishment, user.id.get(), args.duration))
        .await?;
    Ok(())
}

fn reason_or_default(ctx: Context<'_>, reason: Option<String>) -> String {
    let reason = reason.unwrap_or_else(|| NO_REASON.to_string());
    format!("{reason} (by {})", ctx.author().name)
}

/// Reply text for a punishment outcome
pub(crate) fn describe(
    outcome: PunishmentOutcome,
    punishment: PunishmentType,
    user_id: u64,
    duration: Option<u32>,
) -> String {
    match outcome {
        PunishmentOutcome::Applied => match duration.filter(|d| *d > 0) {
            Some(secs) => format!("{punishment} applied to <@{user_id}> for {}.", format_duration(secs)),
            None => format!("{punishment} applied to <@{user_id}>."),
        },
        PunishmentOutcome::Reverted => {
            format!("<@{user_id}> already had a {punishment}, so it was lifted.")
        }
        PunishmentOutcome::Removed => format!("{punishment} lifted from <@{user_id}>."),
        PunishmentOutcome::NoOp => format!("Nothing to do: <@{user_id}> has no {punishment}."),
        PunishmentOutcome::TargetGone => {
            format!("Could not find <@{user_id}> in this server, no {punishment} was changed.")
        }
    }
}

/// Ban a member, optionally for a limited time
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "BAN_MEMBERS",
    required_bot_permissions = "BAN_MEMBERS"
)]
pub async fn ban(
    ctx: Context<'_>,
    #[description = "User to ban"] user: serenity::User,
    #[description = "How long the ban lasts (e.g. 1d, 1h, 10m30s)"] duration: Option<String>,
    #[description = "Days of messages to delete (0-7)"]
    #[max = 7]
    days: Option<u8>,
    #[description = "Reason for the ban"] reason: Option<String>,
) -> Result<(), Error> {
    let args = PunishmentArgs::new(reason_or_default(ctx, reason))
        .with_days(days.unwrap_or(0))
        .with_duration(duration_arg(duration.as_deref())?);
    punish(ctx, &user, PunishmentType::Ban, args).await
}

/// Ban and immediately unban a member to delete their recent messages
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "BAN_MEMBERS",
    required_bot_permissions = "BAN_MEMBERS"
)]
pub async fn softban(
    ctx: Context<'_>,
    #[description = "User to softban"] user: serenity::User,
    #[description = "Days of messages to delete (0-7)"]
    #[max = 7]
    days: Option<u8>,
    #[description = "Reason for the softban"] reason: Option<String>,
) -> Result<(), Error> {
    let args = PunishmentArgs::new(reason_or_default(ctx, reason)).with_days(days.unwrap_or(1));
    punish(ctx, &user, PunishmentType::Softban, args).await
}

/// Kick a member
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "KICK_MEMBERS",
    required_bot_permissions = "KICK_MEMBERS"
)]
pub async fn kick(
    ctx: Context<'_>,
    #[description = "User to kick"] user: serenity::User,
    #[description = "Reason for the kick"] reason: Option<String>,
) -> Result<(), Error> {
    let args = PunishmentArgs::new(reason_or_default(ctx, reason));
    punish(ctx, &user, PunishmentType::Kick, args).await
}

/// Server-mute a member in voice; running it again unmutes
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MUTE_MEMBERS",
    required_bot_permissions = "MUTE_MEMBERS"
)]
pub async fn voicemute(
    ctx: Context<'_>,
    #[description = "User to mute"] user: serenity::User,
    #[description = "How long the mute lasts (e.g. 10m)"] duration: Option<String>,
    #[description = "Reason for the mute"] reason: Option<String>,
) -> Result<(), Error> {
    let args = PunishmentArgs::new(reason_or_default(ctx, reason))
        .with_duration(duration_arg(duration.as_deref())?);
    punish(ctx, &user, PunishmentType::VoiceMute, args).await
}

/// Server-deafen a member in voice; running it again undeafens
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "DEAFEN_MEMBERS",
    required_bot_permissions = "DEAFEN_MEMBERS"
)]
pub async fn deafen(
    ctx: Context<'_>,
    #[description = "User to deafen"] user: serenity::User,
    #[description = "How long the deafen lasts (e.g. 10m)"] duration: Option<String>,
    #[description = "Reason for the deafen"] reason: Option<String>,
) -> Result<(), Error> {
    let args = PunishmentArgs::new(reason_or_default(ctx, reason))
        .with_duration(duration_arg(duration.as_deref())?);
    punish(ctx, &user, PunishmentType::Deafen, args).await
}

/// Give a member the mute role; running it again takes it away
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_ROLES",
    required_bot_permissions = "MANAGE_ROLES"
)]
pub async fn rolemute(
    ctx: Context<'_>,
    #[description = "User to mute"] user: serenity::User,
    #[description = "How long the mute lasts (e.g. 1h)"] duration: Option<String>,
    #[description = "Role to use instead of the server's mute role"] role: Option<serenity::Role>,
    #[description = "Reason for the mute"] reason: Option<String>,
) -> Result<(), Error> {
    if let Some(role) = &role {
        check_role(ctx, role)?;
    }
    let args = PunishmentArgs::new(reason_or_default(ctx, reason))
        .with_duration(duration_arg(duration.as_deref())?)
        .with_role(role.map(|r| r.id.get()));
    punish(ctx, &user, PunishmentType::RoleMute, args).await
}

/// Lift a punishment and cancel its timer
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MODERATE_MEMBERS"
)]
pub async fn unpunish(
    ctx: Context<'_>,
    #[description = "User to pardon"] user: serenity::User,
    #[description = "Punishment to lift"] punishment: PunishmentChoice,
    #[description = "Reason"] reason: Option<String>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let manager = manager(ctx)?;
    check_member(ctx, user.id)?;

    let punishment = PunishmentType::from(punishment);
    let args = PunishmentArgs::new(reason_or_default(ctx, reason));
    let outcome = manager
        .remove(guild_id, user.id.get(), punishment, &args)
        .await?;
    ctx.say(describe(outcome, punishment, user.id.get(), None))
        .await?;
    Ok(())
}

/// Set or clear the role used for role mutes
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_GUILD"
)]
pub async fn muterole(
    ctx: Context<'_>,
    #[description = "Mute role; leave empty to clear"] role: Option<serenity::Role>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;

    let Some(role) = role else {
        ctx.data().settings.set_mute_role(guild_id, None);
        persist(ctx).await;
        ctx.say("Mute role cleared.").await?;
        return Ok(());
    };

    check_role(ctx, &role)?;

    ctx.data().settings.set_mute_role(guild_id, Some(role.id.get()));
    persist(ctx).await;
    ctx.say(format!("Mute role set to <@&{}>.", role.id.get()))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_outcomes() {
        assert_eq!(
            describe(PunishmentOutcome::Applied, PunishmentType::Ban, 5, Some(3600)),
            "Ban applied to <@5> for 1h."
        );
        assert_eq!(
            describe(PunishmentOutcome::Applied, PunishmentType::Kick, 5, None),
            "Kick applied to <@5>."
        );
        assert_eq!(
            describe(PunishmentOutcome::Reverted, PunishmentType::RoleMute, 5, None),
            "<@5> already had a Role Mute, so it was lifted."
        );
        assert_eq!(
            describe(PunishmentOutcome::NoOp, PunishmentType::Deafen, 5, None),
            "Nothing to do: <@5> has no Deafen."
        );
        assert_eq!(
            describe(PunishmentOutcome::TargetGone, PunishmentType::Kick, 5, None),
            "Could not find <@5> in this server, no Kick was changed."
        );
    }

    #[test]
    fn test_punish_command_definitions() {
        let cmd = ban();
        assert_eq!(cmd.name, "ban");
        assert!(cmd.guild_only);
        assert_eq!(cmd.parameters.len(), 4);
        assert!(cmd.required_permissions.contains(serenity::Permissions::BAN_MEMBERS));

        let cmd = rolemute();
        assert!(cmd.required_bot_permissions.contains(serenity::Permissions::MANAGE_ROLES));
        assert!(cmd.description.unwrap_or_default().contains("mute role"));
    }
}
