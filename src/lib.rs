pub mod commands;
pub mod config;
pub mod data;
pub mod handlers;
pub mod logging;
pub mod moderation;

pub const BOT_NAME: &str = "guild_sentinel";
pub const COMMAND_TARGET: &str = "guild_sentinel::command";
pub const ERROR_TARGET: &str = "guild_sentinel::error";
pub const EVENT_TARGET: &str = "guild_sentinel::handlers";
pub const CONSOLE_TARGET: &str = "guild_sentinel";
/// Prefix of every log target written to the moderation log
pub const MODERATION_TARGET: &str = "guild_sentinel::moderation";

pub use config::BotConfig;
pub use data::{Data, DataInner};
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
