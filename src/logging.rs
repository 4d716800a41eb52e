use crate::{COMMAND_TARGET, CONSOLE_TARGET, Context, Data, ERROR_TARGET, Error, MODERATION_TARGET};
use poise::FrameworkError;
use std::path::Path;
use std::time::Instant;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::filter_fn,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log directory name
pub const LOG_DIR: &str = "logs";
/// Command log file name
pub const COMMAND_LOG_FILE: &str = "commands";
/// Punishment log file name
pub const MODERATION_LOG_FILE: &str = "moderation";

fn is_moderation_target(target: &str) -> bool {
    target.starts_with(MODERATION_TARGET)
}

/// Initialize the logging system with console and file outputs
///
/// Punishments and detector decisions go to their own file so they can be
/// audited without the command noise.
///
/// # Errors
/// Fails if the log directory cannot be created or the default filter
/// directive does not parse.
pub fn init() -> Result<(), Error> {
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    let command_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, COMMAND_LOG_FILE);
    let moderation_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, MODERATION_LOG_FILE);

    let console_layer = fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_ansi(true);

    let command_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(command_file)
        .with_filter(filter_fn(|meta| !is_moderation_target(meta.target())));

    let moderation_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .json()
        .with_writer(moderation_file)
        .with_filter(filter_fn(|meta| is_moderation_target(meta.target())));

    // Serenity's heartbeat chatter stays out unless RUST_LOG asks for it
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info").add_directive("serenity=error".parse()?),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(command_layer)
        .with(moderation_layer)
        .init();

    info!("Logging system initialized");
    Ok(())
}

thread_local! {
    static COMMAND_START_TIME: std::cell::RefCell<Option<Instant>> = const { std::cell::RefCell::new(None) };
}

/// Who ran what, where
struct Invocation {
    command: String,
    guild_id: String,
    user_id: u64,
}

impl Invocation {
    fn of(ctx: Context<'_>) -> Self {
        Self {
            command: ctx.command().qualified_name.clone(),
            guild_id: ctx
                .guild_id()
                .map_or_else(|| "DM".to_string(), |id| id.get().to_string()),
            user_id: ctx.author().id.get(),
        }
    }
}

/// Pre-command hook
pub fn log_command_start(ctx: Context<'_>) {
    COMMAND_START_TIME.with(|cell| {
        *cell.borrow_mut() = Some(Instant::now());
    });

    let invocation = Invocation::of(ctx);
    info!(
        target: COMMAND_TARGET,
        command = %invocation.command,
        guild_id = %invocation.guild_id,
        user_id = invocation.user_id,
        invocation = %ctx.invocation_string(),
        event = "start",
        "Command execution started"
    );
}

/// Post-command hook
pub fn log_command_end(ctx: Context<'_>) {
    let elapsed =
        COMMAND_START_TIME.with(|cell| cell.borrow_mut().take().map(|start| start.elapsed()));
    let duration_ms = u64::try_from(elapsed.map_or(0, |d| d.as_millis())).unwrap_or_default();

    let invocation = Invocation::of(ctx);
    info!(
        target: COMMAND_TARGET,
        command = %invocation.command,
        guild_id = %invocation.guild_id,
        user_id = invocation.user_id,
        duration_ms,
        event = "end",
        "Command execution completed"
    );
}

/// Log errors that occur during command execution
pub fn log_command_error(error: &FrameworkError<'_, Data, Error>) {
    match error {
        FrameworkError::Command { error, ctx, .. } => {
            let invocation = Invocation::of(*ctx);
            error!(
                target: ERROR_TARGET,
                command = %invocation.command,
                guild_id = %invocation.guild_id,
                user_id = invocation.user_id,
                error = %error,
                "Command error"
            );
        }
        FrameworkError::CommandCheckFailed { error, ctx, .. } => {
            let invocation = Invocation::of(*ctx);
            let reason = error
                .as_ref()
                .map_or_else(|| "Check failed".to_string(), ToString::to_string);
            error!(
                target: ERROR_TARGET,
                command = %invocation.command,
                guild_id = %invocation.guild_id,
                user_id = invocation.user_id,
                error = %reason,
                "Command check failed"
            );
        }
        other => {
            error!(
                target: ERROR_TARGET,
                error = ?other,
                "Other framework error"
            );
        }
    }
}

pub fn log_console(message: &str) {
    info!(
        target: CONSOLE_TARGET,
        message = %message,
        event = "console",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moderation_targets() {
        assert!(is_moderation_target(MODERATION_TARGET));
        assert!(is_moderation_target("guild_sentinel::moderation::spam"));
        assert!(!is_moderation_target(COMMAND_TARGET));
        assert!(!is_moderation_target("serenity::gateway"));
    }
}
