use crate::commands::MEMBER_CHECKS;
use crate::moderation::{
    Actor, PunishmentRequest, SpamEvent, SpamFlag, Target, validate,
};
use crate::{Data, EVENT_TARGET};
use chrono::{DateTime, Utc};
use poise::serenity_prelude::{
    self as serenity, Context, EventHandler, Guild, GuildId, Member, Message, Ready,
    UnavailableGuild, UserId,
};
use tracing::{debug, info, warn};

/// A guild message reduced to what the detectors look at
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub guild_id: u64,
    pub user_id: u64,
    pub content: String,
    pub mentions: u32,
    pub images: u32,
    pub at: DateTime<Utc>,
}

impl IncomingMessage {
    /// `None` for DMs and messages from bots
    pub fn from_message(msg: &Message) -> Option<Self> {
        let guild_id = msg.guild_id?;
        if msg.author.bot {
            return None;
        }
        let mentions = msg.mentions.len() + msg.mention_roles.len() + usize::from(msg.mention_everyone);
        let images = msg.attachments.len() + msg.embeds.len();
        Some(Self {
            guild_id: guild_id.get(),
            user_id: msg.author.id.get(),
            content: msg.content.clone(),
            mentions: u32::try_from(mentions).unwrap_or(u32::MAX),
            images: u32::try_from(images).unwrap_or(u32::MAX),
            at: to_utc(msg.timestamp).unwrap_or_else(Utc::now),
        })
    }
}

/// What the detectors decided about one message
#[derive(Debug, Default)]
pub struct MessageVerdict {
    /// A banned phrase matched, the message should go
    pub delete: bool,
    pub punishments: Vec<PunishmentRequest>,
    /// Spam flags waiting for votes
    pub flags: Vec<SpamFlag>,
}

pub struct Handler {
    data: Data,
}

impl Handler {
    pub fn new(data: Data) -> Self {
        Self { data }
    }

    /// Run a message through the banned phrase and spam detectors
    pub fn inspect(&self, msg: &IncomingMessage) -> MessageVerdict {
        let phrases = self
            .data
            .phrases
            .evaluate(msg.guild_id, msg.user_id, &msg.content);
        let spam = self.data.spam.record(
            msg.guild_id,
            msg.user_id,
            SpamEvent::from_content(msg.at, &msg.content, msg.mentions, msg.images),
        );

        let mut verdict = MessageVerdict {
            delete: phrases.is_match(),
            punishments: phrases.punishments,
            flags: spam.flags,
        };
        verdict.punishments.extend(spam.punishments);
        verdict
    }

    /// Hand detector punishments to the manager, skipping members the bot cannot touch
    fn dispatch(&self, ctx: &Context, requests: Vec<PunishmentRequest>) {
        let Some(manager) = self.data.manager() else {
            warn!(target: EVENT_TARGET, count = requests.len(), "Dropping punishments, no platform attached");
            return;
        };
        for request in requests {
            if bot_outranks(ctx, request.guild_id, request.user_id) {
                manager.dispatch(request);
            }
        }
    }
}

fn to_utc(ts: serenity::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.unix_timestamp(), 0)
}

/// Whether the bot may punish a member; refuses when the guild or the bot is not cached
fn bot_outranks(ctx: &Context, guild_id: u64, user_id: u64) -> bool {
    let bot_id = ctx.cache.current_user().id;
    let (bot, target) = match ctx.cache.guild(GuildId::new(guild_id)) {
        Some(guild) => {
            let bot = guild
                .members
                .get(&bot_id)
                .map(|member| Actor::from_guild_member(&guild, member));
            let target = guild
                .members
                .get(&UserId::new(user_id))
                .map_or_else(|| Target::absent_member(user_id), |member| Target::member(&guild, member));
            (bot, target)
        }
        None => (None, Target::absent_member(user_id)),
    };
    bot_may_punish(bot.as_ref(), &target, guild_id, user_id)
}

fn bot_may_punish(bot: Option<&Actor>, target: &Target, guild_id: u64, user_id: u64) -> bool {
    let Some(bot) = bot else {
        warn!(target: EVENT_TARGET, guild_id, user_id, "Skipping automatic punishment, bot member not cached");
        return false;
    };
    match validate(bot, target, MEMBER_CHECKS, bot.user_id) {
        Ok(()) => true,
        Err(e) => {
            warn!(target: EVENT_TARGET, guild_id, user_id, error = %e, "Skipping automatic punishment");
            false
        }
    }
}

fn flag_announcement(flag: &SpamFlag) -> String {
    format!(
        "<@{}> was flagged for {} spam. Use `/spam vote` to confirm ({} needed).",
        flag.user_id, flag.spam_type, flag.votes_needed
    )
}

#[serenity::async_trait]
impl EventHandler for Handler {
    /// Called when the bot is ready, but the cache may not be fully populated yet.
    async fn ready(&self, ctx: Context, ready: Ready) {
        let user_name = ready.user.name.clone();
        let shard_id = ctx.shard_id;
        info!(target: EVENT_TARGET, "Connected as {user_name}, shard {shard_id}");
    }

    /// Called when the cache is fully populated.
    async fn cache_ready(&self, ctx: Context, guilds: Vec<GuildId>) {
        let guild_count_cache = ctx.cache.guild_count();
        let guild_count = guilds.len();
        if guild_count != guild_count_cache {
            warn!(
                target: EVENT_TARGET,
                "Cache guild count mismatch: {guild_count_cache} (cache) vs {guild_count} (actual)"
            );
        }
        info!(target: EVENT_TARGET, "Cache ready! The bot is in {guild_count} guild(s)");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let Some(incoming) = IncomingMessage::from_message(&msg) else {
            return;
        };
        let verdict = self.inspect(&incoming);

        if verdict.delete {
            debug!(target: EVENT_TARGET, guild_id = incoming.guild_id, user_id = incoming.user_id, "Deleting banned phrase");
            if let Err(e) = msg.delete(&ctx.http).await {
                warn!(target: EVENT_TARGET, error = %e, "Failed to delete message");
            }
        }
        self.dispatch(&ctx, verdict.punishments);

        for flag in &verdict.flags {
            if let Err(e) = msg.channel_id.say(&ctx.http, flag_announcement(flag)).await {
                warn!(target: EVENT_TARGET, error = %e, "Failed to announce spam flag");
            }
        }
    }

    async fn guild_member_addition(&self, ctx: Context, member: Member) {
        let joined_at = member.joined_at.and_then(to_utc).unwrap_or_else(Utc::now);
        let created_at = to_utc(member.user.id.created_at());
        let requests = self.data.raid.record_join(
            member.guild_id.get(),
            member.user.id.get(),
            joined_at,
            created_at,
        );
        if !requests.is_empty() {
            info!(
                target: EVENT_TARGET,
                guild_id = member.guild_id.get(),
                swept = requests.len(),
                "Raid detected"
            );
        }
        self.dispatch(&ctx, requests);
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // An outage also removes the guild from the cache
        if incomplete.unavailable {
            return;
        }
        self.data.purge_guild(incomplete.id.get());
        if let Err(e) = self.data.save().await {
            warn!(target: EVENT_TARGET, error = %e, "Failed to save after leaving guild");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{
        BannedPhrasePunishment, InfractionChannel, PhraseMatcher, PunishmentType, Rank,
        SpamConfig, SpamType,
    };
    use poise::serenity_prelude::Permissions;
    use chrono::Duration;

    const GUILD: u64 = 10;

    fn message(user_id: u64, content: &str, at: DateTime<Utc>) -> IncomingMessage {
        IncomingMessage {
            guild_id: GUILD,
            user_id,
            content: content.to_string(),
            mentions: 0,
            images: 0,
            at,
        }
    }

    #[test]
    fn test_handler_implements_event_handler() {
        fn assert_impl<T: EventHandler>() {}
        assert_impl::<Handler>();
    }

    #[test]
    fn test_automatic_punishment_needs_cached_bot() {
        let target = Target::absent_member(5);
        assert!(!bot_may_punish(None, &target, GUILD, 5));
    }

    #[test]
    fn test_automatic_punishment_respects_hierarchy() {
        let bot = Actor::new(99, Rank::Position(10), Permissions::ADMINISTRATOR);
        let below = Target::Member { user_id: 5, rank: Rank::Position(3) };
        let above = Target::Member { user_id: 6, rank: Rank::Position(12) };
        let owner = Target::Member { user_id: 7, rank: Rank::Owner };

        assert!(bot_may_punish(Some(&bot), &below, GUILD, 5));
        assert!(bot_may_punish(Some(&bot), &Target::absent_member(8), GUILD, 8));
        assert!(!bot_may_punish(Some(&bot), &above, GUILD, 6));
        assert!(!bot_may_punish(Some(&bot), &owner, GUILD, 7));
    }

    #[test]
    fn test_clean_message_passes() {
        let handler = Handler::new(Data::default());
        let verdict = handler.inspect(&message(1, "hello there", Utc::now()));
        assert!(!verdict.delete);
        assert!(verdict.punishments.is_empty());
        assert!(verdict.flags.is_empty());
    }

    #[test]
    fn test_banned_phrase_deletes_and_escalates() {
        let data = Data::default();
        data.phrases
            .add_phrase(GUILD, PhraseMatcher::Contains("scam".into()), InfractionChannel::Kick)
            .unwrap();
        data.phrases.set_threshold(
            GUILD,
            BannedPhrasePunishment {
                threshold: 2,
                punishment: PunishmentType::Kick,
                role_id: None,
                duration_minutes: None,
                channel: InfractionChannel::Kick,
            },
        );
        let handler = Handler::new(data);
        let now = Utc::now();

        let first = handler.inspect(&message(1, "free SCAM here", now));
        assert!(first.delete);
        assert!(first.punishments.is_empty());

        let second = handler.inspect(&message(1, "another scam", now));
        assert!(second.delete);
        assert_eq!(second.punishments.len(), 1);
        assert_eq!(second.punishments[0].punishment, PunishmentType::Kick);
        assert_eq!(second.punishments[0].user_id, 1);
    }

    #[test]
    fn test_spam_flag_reported() {
        let data = Data::default();
        data.spam.enable(GUILD, SpamType::Messages);
        let handler = Handler::new(data);
        let start = Utc::now();

        let flags: Vec<SpamFlag> = (0..5)
            .flat_map(|i| handler.inspect(&message(2, "hi", start + Duration::seconds(i))).flags)
            .collect();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].spam_type, SpamType::Messages);
        assert_eq!(
            flag_announcement(&flags[0]),
            "<@2> was flagged for Messages spam. Use `/spam vote` to confirm (2 needed)."
        );
    }

    #[test]
    fn test_spam_without_votes_punishes() {
        let data = Data::default();
        data.spam.enable(GUILD, SpamType::Links);
        data.spam
            .configure(
                GUILD,
                SpamType::Links,
                SpamConfig {
                    vote_threshold: Some(0),
                    message_count_threshold: Some(1),
                    required_amount_or_interval: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        let handler = Handler::new(data);

        let verdict = handler.inspect(&message(3, "https://a.example https://b.example", Utc::now()));
        assert!(!verdict.delete);
        assert!(verdict.flags.is_empty());
        assert_eq!(verdict.punishments.len(), 1);
        assert_eq!(verdict.punishments[0].punishment, PunishmentType::RoleMute);
    }
}
