use super::{
    ChannelChoice, PunishmentChoice, check_role, duration_arg, format_duration, guild_id, persist,
};
use crate::moderation::{
    BannedPhrase, BannedPhrasePunishment, InfractionChannel, PhraseMatcher, PunishmentType,
};
use crate::{Context, Error};
use poise::serenity_prelude as serenity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, poise::ChoiceParameter)]
pub enum MatchChoice {
    Contains,
    Exact,
}

pub(crate) fn list_text(phrases: &[BannedPhrase], steps: &[BannedPhrasePunishment]) -> String {
    if phrases.is_empty() && steps.is_empty() {
        return "No banned phrases configured.".to_string();
    }

    let mut lines = vec!["**Banned phrases**".to_string()];
    lines.extend(
        phrases
            .iter()
            .enumerate()
            .map(|(i, phrase)| format!("`{i}` {} ({} counter)", phrase.matcher, phrase.channel)),
    );

    let mut steps: Vec<&BannedPhrasePunishment> = steps.iter().collect();
    steps.sort_by_key(|step| (step.channel, step.threshold));
    if !steps.is_empty() {
        lines.push("**Thresholds**".to_string());
    }
    for step in steps {
        let lasts = step
            .duration_minutes
            .filter(|m| *m > 0)
            .map_or_else(String::new, |m| {
                format!(" for {}", format_duration(m.saturating_mul(60)))
            });
        lines.push(format!(
            "{} #{}: {}{lasts}",
            step.channel, step.threshold, step.punishment
        ));
    }
    lines.join("\n")
}

/// Manage banned phrases and their escalation
#[poise::command(
    slash_command,
    guild_only,
    required_permissions = "MANAGE_MESSAGES",
    subcommands(
        "phrase_add",
        "phrase_regex",
        "phrase_remove",
        "phrase_list",
        "phrase_threshold",
        "phrase_clear"
    )
)]
pub async fn phrase(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Ban a word or phrase
#[poise::command(
    slash_command,
    guild_only,
    rename = "add",
    required_permissions = "MANAGE_MESSAGES"
)]
pub async fn phrase_add(
    ctx: Context<'_>,
    #[description = "Text to ban"] text: String,
    #[description = "Match anywhere in a message or the whole message"] mode: Option<MatchChoice>,
    #[description = "Counter the phrase feeds"] channel: Option<ChannelChoice>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let matcher = match mode.unwrap_or(MatchChoice::Contains) {
        MatchChoice::Contains => PhraseMatcher::Contains(text),
        MatchChoice::Exact => PhraseMatcher::Exact(text),
    };
    let channel = channel.map(InfractionChannel::from).unwrap_or_default();
    let shown = matcher.to_string();

    let index = ctx.data().phrases.add_phrase(guild_id, matcher, channel)?;
    persist(ctx).await;
    ctx.say(format!("Added `{index}` {shown} to the {channel} counter."))
        .await?;
    Ok(())
}

/// Ban messages matching a regular expression
#[poise::command(
    slash_command,
    guild_only,
    rename = "regex",
    required_permissions = "MANAGE_MESSAGES"
)]
pub async fn phrase_regex(
    ctx: Context<'_>,
    #[description = "Pattern to ban"] pattern: String,
    #[description = "Counter the pattern feeds"] channel: Option<ChannelChoice>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let channel = channel.map(InfractionChannel::from).unwrap_or_default();

    let index = ctx.data().phrases.add_regex(guild_id, &pattern, channel)?;
    persist(ctx).await;
    ctx.say(format!("Added `{index}` /{pattern}/ to the {channel} counter."))
        .await?;
    Ok(())
}

/// Remove a banned phrase by its number in `/phrase list`
#[poise::command(
    slash_command,
    guild_only,
    rename = "remove",
    required_permissions = "MANAGE_MESSAGES"
)]
pub async fn phrase_remove(
    ctx: Context<'_>,
    #[description = "Phrase number"] index: usize,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let removed = ctx.data().phrases.remove_phrase(guild_id, index)?;
    persist(ctx).await;
    ctx.say(format!("Removed {}.", removed.matcher)).await?;
    Ok(())
}

/// Show banned phrases and thresholds
#[poise::command(
    slash_command,
    guild_only,
    rename = "list",
    required_permissions = "MANAGE_MESSAGES"
)]
pub async fn phrase_list(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let data = ctx.data();
    let steps = data
        .settings
        .read(guild_id, |settings| settings.phrase_punishments.clone())
        .unwrap_or_default();
    ctx.say(list_text(&data.phrases.phrases(guild_id), &steps))
        .await?;
    Ok(())
}

/// Set what happens when a counter reaches a number; omit the punishment to remove the step
#[poise::command(
    slash_command,
    guild_only,
    rename = "threshold",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn phrase_threshold(
    ctx: Context<'_>,
    #[description = "Counter"] channel: ChannelChoice,
    #[description = "Count that triggers the punishment"]
    #[min = 1]
    count: u32,
    #[description = "Punishment to apply"] punishment: Option<PunishmentChoice>,
    #[description = "How long the punishment lasts (e.g. 1h)"] duration: Option<String>,
    #[description = "Role to use for role mutes"] role: Option<serenity::Role>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let channel = InfractionChannel::from(channel);

    let Some(punishment) = punishment.map(PunishmentType::from) else {
        ctx.data()
            .phrases
            .remove_threshold(guild_id, channel, count)?;
        persist(ctx).await;
        ctx.say(format!("Removed {channel} threshold #{count}."))
            .await?;
        return Ok(());
    };

    if let Some(role) = &role {
        check_role(ctx, role)?;
    }
    let duration_minutes = duration_arg(duration.as_deref())?.map(|secs| secs.div_ceil(60));
    if duration_minutes.is_some() && !punishment.supports_expiry() {
        return Err(format!("A {punishment} cannot be time limited").into());
    }

    ctx.data().phrases.set_threshold(
        guild_id,
        BannedPhrasePunishment {
            threshold: count,
            punishment,
            role_id: role.map(|r| r.id.get()),
            duration_minutes,
            channel,
        },
    );
    persist(ctx).await;
    ctx.say(format!("{channel} threshold #{count} now applies {punishment}."))
        .await?;
    Ok(())
}

/// Reset a member's banned phrase counters
#[poise::command(
    slash_command,
    guild_only,
    rename = "clear",
    required_permissions = "MANAGE_MESSAGES"
)]
pub async fn phrase_clear(
    ctx: Context<'_>,
    #[description = "Member to pardon"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let text = if ctx.data().phrases.clear(guild_id, user.id.get()) {
        persist(ctx).await;
        format!("Cleared infractions of <@{}>.", user.id)
    } else {
        format!("<@{}> has no infractions.", user.id)
    };
    ctx.say(text).await?;
    Ok(())
}
