//! Error types for the moderation engine
//!
//! Only hierarchy violations and rejected phrases or patterns are meant to reach the
//! user who asked for an action; everything else is logged by the detectors and
//! the timer loop.

use crate::moderation::hierarchy::ValidationError;
use thiserror::Error;

/// Errors that can occur during moderation operations
#[derive(Debug, Error)]
pub enum ModerationError {
    /// The invoking user or the bot is not allowed to act on the target
    #[error("Hierarchy violation: {0}")]
    Hierarchy(#[from] ValidationError),

    /// User, role or message vanished before the action ran
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// The chat platform rejected or failed the call
    #[error("Platform call failed: {0}")]
    Platform(String),

    /// A literal banned phrase has no text once trimmed
    #[error("Banned phrase cannot be empty")]
    EmptyPhrase,

    /// A banned-phrase regex was refused at registration
    #[error("Invalid regex pattern: {0}")]
    InvalidRegexPattern(String),

    /// A role mute was requested but the guild has no mute role
    #[error("No mute role configured for guild {0}")]
    MuteRoleNotConfigured(u64),

    /// A duration was given for a punishment that cannot expire
    #[error("{0} cannot be time-limited")]
    NotTimeLimited(crate::moderation::PunishmentType),

    /// A configured item does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<serenity::Error> for ModerationError {
    fn from(error: serenity::Error) -> Self {
        use serenity::http::{HttpError, StatusCode};

        // Unknown member/ban/message surfaces as 404 from the REST API
        if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = &error {
            if response.status_code == StatusCode::NOT_FOUND {
                return Self::TargetNotFound(response.error.message.clone());
            }
        }
        Self::Platform(error.to_string())
    }
}

impl ModerationError {
    /// Whether this error should be shown to the user who triggered the action
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Hierarchy(_)
                | Self::EmptyPhrase
                | Self::InvalidRegexPattern(_)
                | Self::MuteRoleNotConfigured(_)
                | Self::NotTimeLimited(_)
                | Self::NotFound(_)
        )
    }
}

/// Result type for moderation operations
pub type ModerationResult<T> = Result<T, ModerationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::PunishmentType;

    #[test]
    fn test_error_display() {
        let error = ModerationError::TargetNotFound("Unknown Member".to_string());
        assert_eq!(error.to_string(), "Target not found: Unknown Member");

        let error = ModerationError::NotTimeLimited(PunishmentType::Kick);
        assert_eq!(error.to_string(), "Kick cannot be time-limited");

        let error = ModerationError::from(ValidationError::EveryoneRole);
        assert!(error.to_string().starts_with("Hierarchy violation"));
    }

    #[test]
    fn test_user_facing() {
        assert!(ModerationError::from(ValidationError::ManagedRole).is_user_facing());
        assert!(ModerationError::InvalidRegexPattern("x".into()).is_user_facing());
        assert!(ModerationError::EmptyPhrase.is_user_facing());
        assert!(!ModerationError::Platform("rate limited".into()).is_user_facing());
        assert!(!ModerationError::TargetNotFound("gone".into()).is_user_facing());
    }
}
