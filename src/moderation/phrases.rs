//! Banned phrase engine
//!
//! Matches message content against each guild's banned phrases, counts the
//! matches per user and infraction channel, and turns counts that hit a
//! configured threshold into punishment requests.
//!
//! Regex patterns are validated when they are added. Compiled patterns are
//! cached per guild and dropped whenever the guild's phrase list changes.

use crate::moderation::{
    BannedPhrase, BannedPhrasePunishment, InfractionChannel, InfractionCounter, ModerationError,
    ModerationResult, PhraseMatcher, PunishmentArgs, PunishmentRequest, SettingsStore,
};
use dashmap::DashMap;
use rand::{Rng, SeedableRng, distr::Alphanumeric, rngs::StdRng};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on the compiled size of a single pattern
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Random strings a pattern is tried against before it is accepted
const SAMPLE_COUNT: usize = 50;
const SAMPLE_SEED: u64 = 0x5EED_0F_BAD;

/// Whitespace-only inputs a pattern must not match
const WHITESPACE_SAMPLES: [&str; 4] = [" ", "   ", "\t", " \n\t "];

/// Compile a pattern the way the engine matches it
///
/// # Errors
/// Returns [`ModerationError::InvalidRegexPattern`] if the pattern does not
/// compile within the size limit.
pub fn compile_pattern(source: &str) -> ModerationResult<Regex> {
    RegexBuilder::new(source)
        .case_insensitive(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| ModerationError::InvalidRegexPattern(e.to_string()))
}

/// Compile a pattern and reject ones that would match nearly everything
///
/// # Errors
/// Returns [`ModerationError::InvalidRegexPattern`] with the reason the
/// pattern was refused.
pub fn validate_pattern(source: &str) -> ModerationResult<Regex> {
    let regex = compile_pattern(source)?;

    if regex.is_match("") {
        return Err(ModerationError::InvalidRegexPattern(
            "pattern matches an empty message".to_string(),
        ));
    }

    if WHITESPACE_SAMPLES.iter().any(|sample| regex.is_match(sample)) {
        return Err(ModerationError::InvalidRegexPattern(
            "pattern matches whitespace".to_string(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(SAMPLE_SEED);
    let matched = (0..SAMPLE_COUNT)
        .filter(|_| {
            let len = rng.random_range(10..40);
            let sample: String = (&mut rng)
                .sample_iter(Alphanumeric)
                .take(len)
                .map(char::from)
                .collect();
            regex.is_match(&sample)
        })
        .count();

    if matched * 2 > SAMPLE_COUNT {
        return Err(ModerationError::InvalidRegexPattern(format!(
            "pattern matches {matched} of {SAMPLE_COUNT} random messages"
        )));
    }

    Ok(regex)
}

/// Result of checking one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhraseVerdict {
    /// Phrases that matched
    pub matched: Vec<PhraseMatcher>,
    /// Punishments triggered by the new counts
    pub punishments: Vec<PunishmentRequest>,
}

impl PhraseVerdict {
    pub fn is_match(&self) -> bool {
        !self.matched.is_empty()
    }
}

/// Compiled regexes of one guild, keyed by source
#[derive(Default)]
struct CompiledPatterns {
    by_source: HashMap<String, Regex>,
}

pub struct BannedPhraseEngine {
    settings: SettingsStore,
    compiled: DashMap<u64, Arc<CompiledPatterns>>,
}

impl BannedPhraseEngine {
    pub fn new(settings: SettingsStore) -> Self {
        Self {
            settings,
            compiled: DashMap::new(),
        }
    }

    /// Add a literal phrase, returning its index
    ///
    /// # Errors
    /// Returns [`ModerationError::EmptyPhrase`] for blank text. Regex matchers
    /// go through [`BannedPhraseEngine::add_regex`] and fail the same way.
    pub fn add_phrase(
        &self,
        guild_id: u64,
        matcher: PhraseMatcher,
        channel: InfractionChannel,
    ) -> ModerationResult<usize> {
        if let PhraseMatcher::Regex(source) = matcher {
            return self.add_regex(guild_id, &source, channel);
        }
        if let PhraseMatcher::Contains(text) | PhraseMatcher::Exact(text) = &matcher {
            if text.trim().is_empty() {
                return Err(ModerationError::EmptyPhrase);
            }
        }

        info!(guild_id, phrase = %matcher, %channel, "Adding banned phrase");
        Ok(self.settings.update(guild_id, |settings| {
            settings.phrases.push(BannedPhrase { matcher, channel });
            settings.phrases.len() - 1
        }))
    }

    /// Validate and add a regex phrase, returning its index
    ///
    /// # Errors
    /// Returns [`ModerationError::InvalidRegexPattern`] if the pattern is
    /// refused; nothing is stored in that case.
    pub fn add_regex(
        &self,
        guild_id: u64,
        source: &str,
        channel: InfractionChannel,
    ) -> ModerationResult<usize> {
        validate_pattern(source)?;

        info!(guild_id, pattern = source, %channel, "Adding banned regex");
        let index = self.settings.update(guild_id, |settings| {
            settings.phrases.push(BannedPhrase {
                matcher: PhraseMatcher::Regex(source.to_string()),
                channel,
            });
            settings.phrases.len() - 1
        });
        self.invalidate(guild_id);
        Ok(index)
    }

    /// Remove a phrase by index
    ///
    /// # Errors
    /// Returns [`ModerationError::NotFound`] if there is no phrase at `index`.
    pub fn remove_phrase(&self, guild_id: u64, index: usize) -> ModerationResult<BannedPhrase> {
        let removed = self
            .settings
            .update(guild_id, |settings| {
                (index < settings.phrases.len()).then(|| settings.phrases.remove(index))
            })
            .ok_or_else(|| ModerationError::NotFound(format!("banned phrase #{index}")))?;

        info!(guild_id, index, phrase = %removed.matcher, "Removed banned phrase");
        self.invalidate(guild_id);
        Ok(removed)
    }

    pub fn phrases(&self, guild_id: u64) -> Vec<BannedPhrase> {
        self.settings
            .read(guild_id, |settings| settings.phrases.clone())
            .unwrap_or_default()
    }

    /// Set an escalation step, replacing one at the same channel and count
    pub fn set_threshold(
        &self,
        guild_id: u64,
        step: BannedPhrasePunishment,
    ) -> Option<BannedPhrasePunishment> {
        info!(
            guild_id,
            threshold = step.threshold,
            punishment = %step.punishment,
            channel = %step.channel,
            "Setting banned phrase threshold"
        );
        self.settings.update(guild_id, |settings| {
            let existing = settings
                .phrase_punishments
                .iter_mut()
                .find(|p| p.channel == step.channel && p.threshold == step.threshold);
            match existing {
                Some(existing) => Some(std::mem::replace(existing, step)),
                None => {
                    settings.phrase_punishments.push(step);
                    None
                }
            }
        })
    }

    /// # Errors
    /// Returns [`ModerationError::NotFound`] if no such step exists.
    pub fn remove_threshold(
        &self,
        guild_id: u64,
        channel: InfractionChannel,
        threshold: u32,
    ) -> ModerationResult<BannedPhrasePunishment> {
        self.settings
            .update(guild_id, |settings| {
                let position = settings
                    .phrase_punishments
                    .iter()
                    .position(|p| p.channel == channel && p.threshold == threshold)?;
                Some(settings.phrase_punishments.remove(position))
            })
            .ok_or_else(|| ModerationError::NotFound(format!("{channel} threshold {threshold}")))
    }

    /// Reset every counter of a user; returns whether there was anything to reset
    pub fn clear(&self, guild_id: u64, user_id: u64) -> bool {
        let cleared = self
            .settings
            .read(guild_id, |settings| settings.infractions.contains_key(&user_id))
            .unwrap_or(false)
            && self
                .settings
                .update(guild_id, |settings| settings.infractions.remove(&user_id))
                .is_some_and(|counter| !counter.is_empty());
        if cleared {
            info!(guild_id, user_id, "Cleared banned phrase infractions");
        }
        cleared
    }

    pub fn counters(&self, guild_id: u64, user_id: u64) -> InfractionCounter {
        self.settings
            .read(guild_id, |settings| settings.infractions.get(&user_id).cloned())
            .flatten()
            .unwrap_or_default()
    }

    /// Check a message and advance the author's counters
    ///
    /// Each channel is incremented at most once per message, however many of
    /// its phrases match. For every incremented channel the steps are checked
    /// in ascending order and the first equal to the new count fires. Once the
    /// highest step of a channel is reached the channel starts over.
    pub fn evaluate(&self, guild_id: u64, user_id: u64, content: &str) -> PhraseVerdict {
        let has_phrases = self
            .settings
            .read(guild_id, |settings| !settings.phrases.is_empty())
            .unwrap_or(false);
        if !has_phrases {
            return PhraseVerdict::default();
        }

        let compiled = self.compiled_for(guild_id);
        let lowered = content.to_lowercase();
        let mut stale = false;

        let verdict = self.settings.update(guild_id, |settings| {
            let mut matched = Vec::new();
            let mut channels: Vec<InfractionChannel> = Vec::new();
            for phrase in &settings.phrases {
                let hit = match &phrase.matcher {
                    PhraseMatcher::Regex(source) => match compiled.by_source.get(source) {
                        Some(regex) => regex.is_match(content),
                        None => {
                            stale = true;
                            compile_pattern(source).is_ok_and(|regex| regex.is_match(content))
                        }
                    },
                    literal => literal.matches_literal(&lowered),
                };
                if hit {
                    matched.push(phrase.matcher.clone());
                    if !channels.contains(&phrase.channel) {
                        channels.push(phrase.channel);
                    }
                }
            }

            if matched.is_empty() {
                return PhraseVerdict::default();
            }

            let counter = settings.infractions.entry(user_id).or_default();
            let mut punishments = Vec::new();
            for channel in channels {
                let count = counter.increment(channel);

                let mut steps: Vec<&BannedPhrasePunishment> = settings
                    .phrase_punishments
                    .iter()
                    .filter(|p| p.channel == channel)
                    .collect();
                steps.sort_by_key(|p| p.threshold);

                if let Some(step) = steps.iter().find(|p| p.threshold == count) {
                    let args = PunishmentArgs::new(format!(
                        "Banned phrase infraction #{count} ({channel})"
                    ))
                    .with_role(step.role_id)
                    .with_duration(step.duration_minutes.map(|m| m.saturating_mul(60)));
                    punishments.push(PunishmentRequest::new(
                        guild_id,
                        user_id,
                        step.punishment,
                        args,
                    ));
                }

                if steps.last().is_some_and(|highest| count >= highest.threshold) {
                    debug!(guild_id, user_id, %channel, count, "Highest threshold reached, resetting");
                    counter.reset(channel);
                }
            }

            PhraseVerdict {
                matched,
                punishments,
            }
        });

        if stale {
            self.invalidate(guild_id);
        }
        if verdict.is_match() {
            info!(
                guild_id,
                user_id,
                matched = verdict.matched.len(),
                triggered = verdict.punishments.len(),
                "Banned phrase matched"
            );
        }
        verdict
    }

    fn compiled_for(&self, guild_id: u64) -> Arc<CompiledPatterns> {
        if let Some(entry) = self.compiled.get(&guild_id) {
            return Arc::clone(entry.value());
        }

        let sources: Vec<String> = self
            .settings
            .read(guild_id, |settings| {
                settings
                    .phrases
                    .iter()
                    .filter_map(|phrase| match &phrase.matcher {
                        PhraseMatcher::Regex(source) => Some(source.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut patterns = CompiledPatterns::default();
        for source in sources {
            match compile_pattern(&source) {
                Ok(regex) => {
                    patterns.by_source.insert(source, regex);
                }
                Err(e) => warn!(guild_id, pattern = %source, error = %e, "Skipping stored pattern"),
            }
        }

        let patterns = Arc::new(patterns);
        self.compiled.insert(guild_id, Arc::clone(&patterns));
        patterns
    }

    fn invalidate(&self, guild_id: u64) {
        self.compiled.remove(&guild_id);
    }

    /// Forget a guild's compiled patterns
    pub fn purge_guild(&self, guild_id: u64) {
        self.invalidate(guild_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::PunishmentType;

    const GUILD: u64 = 1;
    const USER: u64 = 2;

    fn engine() -> BannedPhraseEngine {
        BannedPhraseEngine::new(SettingsStore::new())
    }

    fn step(threshold: u32, punishment: PunishmentType) -> BannedPhrasePunishment {
        BannedPhrasePunishment {
            threshold,
            punishment,
            role_id: None,
            duration_minutes: None,
            channel: InfractionChannel::Role,
        }
    }

    #[test]
    fn test_rejects_useless_patterns() {
        for pattern in ["(", "a*", r"\s*", r"\s+", "[a-z]", "[0-9a-z]{3}"] {
            assert!(
                matches!(validate_pattern(pattern), Err(ModerationError::InvalidRegexPattern(_))),
                "accepted {pattern:?}"
            );
        }
    }

    #[test]
    fn test_accepts_specific_patterns() {
        for pattern in [r"free\s+nitro", r"disc[o0]rd\.gift", "badword"] {
            assert!(validate_pattern(pattern).is_ok(), "rejected {pattern:?}");
        }
    }

    #[test]
    fn test_invalid_regex_is_not_stored() {
        let engine = engine();
        let err = engine.add_regex(GUILD, "x*", InfractionChannel::Ban).unwrap_err();
        assert!(matches!(err, ModerationError::InvalidRegexPattern(_)));
        assert!(engine.phrases(GUILD).is_empty());
    }

    #[test]
    fn test_blank_phrases_are_rejected() {
        let engine = engine();
        for matcher in [
            PhraseMatcher::Contains(String::new()),
            PhraseMatcher::Contains("   ".into()),
            PhraseMatcher::Exact("\t\n".into()),
        ] {
            let err = engine.add_phrase(GUILD, matcher, InfractionChannel::Role).unwrap_err();
            assert!(matches!(err, ModerationError::EmptyPhrase));
        }
        assert!(engine.phrases(GUILD).is_empty());
        assert!(!engine.evaluate(GUILD, 1, "anything at all").is_match());
    }

    #[test]
    fn test_escalation_three_five_ten() {
        let engine = engine();
        engine
            .add_phrase(GUILD, PhraseMatcher::Contains("badword".into()), InfractionChannel::Role)
            .unwrap();
        engine.set_threshold(GUILD, step(5, PunishmentType::Kick));
        engine.set_threshold(GUILD, step(10, PunishmentType::Ban));
        engine.set_threshold(GUILD, step(3, PunishmentType::RoleMute));

        let mut fired = Vec::new();
        for n in 1..=10 {
            let verdict = engine.evaluate(GUILD, USER, "you BADWORD you");
            assert!(verdict.is_match());
            for request in verdict.punishments {
                fired.push((n, request.punishment));
            }
        }

        assert_eq!(
            fired,
            vec![
                (3, PunishmentType::RoleMute),
                (5, PunishmentType::Kick),
                (10, PunishmentType::Ban)
            ]
        );
        // Highest step reached, so the next round starts from zero
        assert_eq!(engine.counters(GUILD, USER).get(InfractionChannel::Role), 0);
    }

    #[test]
    fn test_channels_count_independently() {
        let engine = engine();
        engine
            .add_phrase(GUILD, PhraseMatcher::Contains("spoiler".into()), InfractionChannel::Role)
            .unwrap();
        engine.add_regex(GUILD, r"free\s+nitro", InfractionChannel::Ban).unwrap();
        engine.set_threshold(GUILD, step(2, PunishmentType::RoleMute));
        engine.set_threshold(
            GUILD,
            BannedPhrasePunishment {
                duration_minutes: Some(60),
                channel: InfractionChannel::Ban,
                ..step(1, PunishmentType::Ban)
            },
        );

        let verdict = engine.evaluate(GUILD, USER, "Free   Nitro here");
        assert_eq!(verdict.punishments.len(), 1);
        assert_eq!(verdict.punishments[0].punishment, PunishmentType::Ban);
        assert_eq!(verdict.punishments[0].args.duration, Some(3600));

        let verdict = engine.evaluate(GUILD, USER, "spoiler alert");
        assert!(verdict.punishments.is_empty());
        let counters = engine.counters(GUILD, USER);
        assert_eq!(counters.get(InfractionChannel::Role), 1);
        assert_eq!(counters.get(InfractionChannel::Ban), 0);
    }

    #[test]
    fn test_one_increment_per_channel_per_message() {
        let engine = engine();
        for word in ["foo", "bar"] {
            engine
                .add_phrase(GUILD, PhraseMatcher::Contains(word.into()), InfractionChannel::Kick)
                .unwrap();
        }

        let verdict = engine.evaluate(GUILD, USER, "foo and bar");
        assert_eq!(verdict.matched.len(), 2);
        assert_eq!(engine.counters(GUILD, USER).get(InfractionChannel::Kick), 1);
    }

    #[test]
    fn test_exact_phrase_and_clean_messages() {
        let engine = engine();
        engine
            .add_phrase(GUILD, PhraseMatcher::Exact("ping".into()), InfractionChannel::Role)
            .unwrap();

        assert!(!engine.evaluate(GUILD, USER, "ping pong").is_match());
        assert!(engine.evaluate(GUILD, USER, "PING").is_match());
        assert!(!engine.evaluate(3, USER, "ping").is_match());
    }

    #[test]
    fn test_clear_and_remove() {
        let engine = engine();
        engine
            .add_phrase(GUILD, PhraseMatcher::Contains("bad".into()), InfractionChannel::Role)
            .unwrap();
        engine.add_regex(GUILD, r"very\s+bad", InfractionChannel::Kick).unwrap();
        engine.evaluate(GUILD, USER, "very bad");

        assert!(engine.clear(GUILD, USER));
        assert!(!engine.clear(GUILD, USER));
        assert!(engine.counters(GUILD, USER).is_empty());

        let removed = engine.remove_phrase(GUILD, 1).unwrap();
        assert_eq!(removed.matcher, PhraseMatcher::Regex(r"very\s+bad".into()));
        assert!(matches!(engine.remove_phrase(GUILD, 5), Err(ModerationError::NotFound(_))));

        engine.evaluate(GUILD, USER, "very bad");
        assert_eq!(engine.counters(GUILD, USER).get(InfractionChannel::Kick), 0);
    }

    #[test]
    fn test_threshold_replace_and_remove() {
        let engine = engine();
        assert!(engine.set_threshold(GUILD, step(3, PunishmentType::RoleMute)).is_none());
        let replaced = engine.set_threshold(GUILD, step(3, PunishmentType::Kick));
        assert_eq!(replaced.map(|p| p.punishment), Some(PunishmentType::RoleMute));

        let removed = engine.remove_threshold(GUILD, InfractionChannel::Role, 3).unwrap();
        assert_eq!(removed.punishment, PunishmentType::Kick);
        assert!(engine.remove_threshold(GUILD, InfractionChannel::Role, 3).is_err());
    }
}
