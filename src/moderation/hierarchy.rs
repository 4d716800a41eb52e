//! Hierarchy and permission validation
//!
//! Every punishment is gated twice: once for the member who asked for it and
//! once for the bot, which may lack a permission the moderator has. The rules
//! are expressed as an ordered list of [`Verif`] values interpreted by
//! [`validate`].

use derive_more::Display;
use serenity::all::{Guild, Member, Permissions};
use std::collections::HashMap;
use thiserror::Error;

/// Position of a member or role in the guild hierarchy
///
/// Variants are ordered so that the guild owner outranks every role position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rank {
    /// Highest role position held (0 is `@everyone`)
    Position(u16),
    /// The guild owner
    Owner,
}

/// A single hierarchy or permission rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Verif {
    CanBeEdited,
    IsNotEveryoneRole,
    IsNotManagedRole,
    CanMoveUsers,
    CanBeManaged,
    CanModifyPermissions,
    CanBeReordered,
    CanDeleteMessages,
    CanCreateInstantInvite,
    CanManageWebhooks,
    CanBeViewed,
}

impl Verif {
    /// Channel permission bits this rule requires
    #[must_use]
    pub fn channel_permissions(self) -> Permissions {
        match self {
            Self::CanBeEdited | Self::CanBeManaged | Self::CanBeReordered => {
                Permissions::MANAGE_CHANNELS
            }
            Self::CanMoveUsers => Permissions::MOVE_MEMBERS | Permissions::VIEW_CHANNEL,
            Self::CanModifyPermissions => Permissions::MANAGE_ROLES,
            Self::CanDeleteMessages => {
                Permissions::MANAGE_MESSAGES
                    | Permissions::VIEW_CHANNEL
                    | Permissions::READ_MESSAGE_HISTORY
            }
            Self::CanCreateInstantInvite => Permissions::CREATE_INSTANT_INVITE,
            Self::CanManageWebhooks => Permissions::MANAGE_WEBHOOKS,
            Self::CanBeViewed => Permissions::VIEW_CHANNEL,
            Self::IsNotEveryoneRole | Self::IsNotManagedRole => Permissions::empty(),
        }
    }
}

/// The member attempting an action, resolved against the guild
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: u64,
    pub rank: Rank,
    /// Guild-level permissions
    pub permissions: Permissions,
    /// Effective permissions in specific channels, after overwrites
    pub channel_permissions: HashMap<u64, Permissions>,
}

impl Actor {
    pub fn new(user_id: u64, rank: Rank, permissions: Permissions) -> Self {
        Self {
            user_id,
            rank,
            permissions,
            channel_permissions: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_channel_permissions(mut self, channel_id: u64, permissions: Permissions) -> Self {
        self.channel_permissions.insert(channel_id, permissions);
        self
    }

    /// Resolve an actor from a cached guild and one of its members
    pub fn from_guild_member(guild: &Guild, member: &Member) -> Self {
        let rank = if guild.owner_id == member.user.id {
            Rank::Owner
        } else {
            Rank::Position(guild.member_highest_role(member).map_or(0, |role| role.position))
        };

        let channel_permissions = guild
            .channels
            .iter()
            .map(|(id, channel)| (id.get(), guild.user_permissions_in(channel, member)))
            .collect();

        Self {
            user_id: member.user.id.get(),
            rank,
            permissions: guild.member_permissions(member),
            channel_permissions,
        }
    }

    fn permissions_in(&self, channel_id: u64) -> Permissions {
        self.channel_permissions
            .get(&channel_id)
            .copied()
            .unwrap_or(self.permissions)
    }
}

/// The object of an action
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Target {
    #[display("member {user_id}")]
    Member { user_id: u64, rank: Rank },
    #[display("role {role_id}")]
    Role {
        role_id: u64,
        position: u16,
        is_everyone: bool,
        managed: bool,
    },
    #[display("channel {channel_id}")]
    Channel { channel_id: u64 },
}

impl Target {
    /// Resolve a member target from a cached guild
    pub fn member(guild: &Guild, member: &Member) -> Self {
        let actor = Actor::from_guild_member(guild, member);
        Self::Member {
            user_id: actor.user_id,
            rank: actor.rank,
        }
    }

    /// A member who is no longer in the guild, e.g. for an unban
    pub fn absent_member(user_id: u64) -> Self {
        Self::Member {
            user_id,
            rank: Rank::Position(0),
        }
    }
}

/// Reasons a rule can fail
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("<@{actor}> cannot modify {target} ({check})")]
    ActorCannotModify {
        actor: u64,
        target: String,
        check: Verif,
    },
    #[error("the @everyone role cannot be targeted")]
    EveryoneRole,
    #[error("roles managed by an integration cannot be targeted")]
    ManagedRole,
}

/// Check `actor` against `target` for every rule in `checks`, in order
///
/// `bot_id` enables the only self-targeting exemption: the bot may act on
/// itself.
///
/// # Errors
/// Returns the first failing rule.
pub fn validate(
    actor: &Actor,
    target: &Target,
    checks: &[Verif],
    bot_id: u64,
) -> Result<(), ValidationError> {
    checks
        .iter()
        .try_for_each(|check| check_one(actor, target, *check, bot_id))
}

/// Validate the invoking member first and then the bot
///
/// # Errors
/// Returns the first failure of either actor.
pub fn validate_both(
    invoker: &Actor,
    bot: &Actor,
    target: &Target,
    checks: &[Verif],
) -> Result<(), ValidationError> {
    validate(invoker, target, checks, bot.user_id)?;
    validate(bot, target, checks, bot.user_id)
}

fn check_one(
    actor: &Actor,
    target: &Target,
    check: Verif,
    bot_id: u64,
) -> Result<(), ValidationError> {
    let denied = || ValidationError::ActorCannotModify {
        actor: actor.user_id,
        target: target.to_string(),
        check,
    };

    match (check, target) {
        (Verif::IsNotEveryoneRole, Target::Role { is_everyone: true, .. }) => {
            Err(ValidationError::EveryoneRole)
        }
        (Verif::IsNotManagedRole, Target::Role { managed: true, .. }) => {
            Err(ValidationError::ManagedRole)
        }
        (Verif::IsNotEveryoneRole | Verif::IsNotManagedRole, _) => Ok(()),
        (_, Target::Member { user_id, rank }) => {
            if actor.user_id == *user_id && *user_id == bot_id {
                return Ok(());
            }
            if actor.rank > *rank { Ok(()) } else { Err(denied()) }
        }
        (_, Target::Role { position, .. }) => {
            if actor.rank > Rank::Position(*position) {
                Ok(())
            } else {
                Err(denied())
            }
        }
        (_, Target::Channel { channel_id }) => {
            let held = actor.permissions_in(*channel_id);
            if actor.rank == Rank::Owner
                || held.contains(Permissions::ADMINISTRATOR)
                || actor.permissions.contains(Permissions::ADMINISTRATOR)
                || held.contains(check.channel_permissions())
            {
                Ok(())
            } else {
                Err(denied())
            }
        }
    }
}
