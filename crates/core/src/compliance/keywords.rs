use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ComplianceBuildError;

pub const DEFAULT_STOP_KEYWORDS: &[&str] =
    &["STOP", "STOPALL", "UNSUBSCRIBE", "CANCEL", "END", "QUIT"];
pub const DEFAULT_HELP_KEYWORDS: &[&str] = &["HELP", "INFO"];
pub const DEFAULT_START_KEYWORDS: &[&str] = &["START", "UNSTOP", "YES"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keyword {
    Stop,
    Help,
    Start,
    None,
}

impl Keyword {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Help => "help",
            Self::Start => "start",
            Self::None => "none",
        }
    }
}

/// Start words that are also ordinary replies. They opt the sender in only
/// when they make up the whole message, so "Yes, Tuesday works" still reaches
/// the conversation engine.
pub const AFFIRMATIVE_START_KEYWORDS: &[&str] = &["YES"];

/// Classifies an inbound message against the opt-out, help and opt-in
/// keyword sets. Help and start need the keyword as the leading word. Stop
/// does too, unless the message opens with a help or start keyword, in which
/// case a stop keyword anywhere in it still opts the sender out.
#[derive(Clone, Debug)]
pub struct KeywordDetector {
    stop: Regex,
    stop_anywhere: Regex,
    help: Regex,
    /// Every start word in leading position; only used to spot a mixed
    /// message that also says stop.
    start_opening: Regex,
    start: Option<Regex>,
    start_alone: Option<Regex>,
}

impl Default for KeywordDetector {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| (*w).to_string()).collect::<Vec<_>>();
        // Built from constant word lists, so the patterns always compile.
        Self::new(
            &owned(DEFAULT_STOP_KEYWORDS),
            &owned(DEFAULT_HELP_KEYWORDS),
            &owned(DEFAULT_START_KEYWORDS),
        )
        .unwrap_or_else(|_| unreachable!("default keyword patterns are valid"))
    }
}

impl KeywordDetector {
    pub fn new(
        stop: &[String],
        help: &[String],
        start: &[String],
    ) -> Result<Self, ComplianceBuildError> {
        let stop_words = alternatives("stop", stop)?;
        let help_words = alternatives("help", help)?;
        let start_words = alternatives("start", start)?;
        let (affirmative, leading): (Vec<String>, Vec<String>) =
            start_words.iter().cloned().partition(|word| {
                AFFIRMATIVE_START_KEYWORDS.iter().any(|yes| yes.eq_ignore_ascii_case(word))
            });

        Ok(Self {
            stop: compile(&leading_pattern(&stop_words))?,
            stop_anywhere: compile(&format!(r"(?i)\b(?:{})\b", stop_words.join("|")))?,
            help: compile(&leading_pattern(&help_words))?,
            start_opening: compile(&leading_pattern(&start_words))?,
            start: (!leading.is_empty()).then(|| compile(&leading_pattern(&leading))).transpose()?,
            start_alone: (!affirmative.is_empty())
                .then(|| {
                    compile(&format!(
                        r"(?i)^(?:please\s+)?(?:{})[\s[:punct:]]*$",
                        affirmative.join("|")
                    ))
                })
                .transpose()?,
        })
    }

    pub fn classify(&self, text: &str) -> Keyword {
        let text = text.trim();
        if text.is_empty() {
            return Keyword::None;
        }
        if self.stop.is_match(text) {
            return Keyword::Stop;
        }

        let help = self.help.is_match(text);
        let opens_with_start = self.start_opening.is_match(text);
        if (help || opens_with_start) && self.stop_anywhere.is_match(text) {
            return Keyword::Stop;
        }
        if help {
            return Keyword::Help;
        }
        let start = self.start.as_ref().is_some_and(|pattern| pattern.is_match(text))
            || self.start_alone.as_ref().is_some_and(|pattern| pattern.is_match(text));
        if start {
            Keyword::Start
        } else {
            Keyword::None
        }
    }

    pub fn is_stop(&self, text: &str) -> bool {
        self.classify(text) == Keyword::Stop
    }
}

fn alternatives(set: &'static str, words: &[String]) -> Result<Vec<String>, ComplianceBuildError> {
    let escaped: Vec<String> = words
        .iter()
        .map(|word| word.trim())
        .filter(|word| !word.is_empty())
        .map(regex::escape)
        .collect();
    if escaped.is_empty() {
        return Err(ComplianceBuildError::EmptyKeywordSet(set));
    }
    Ok(escaped)
}

fn leading_pattern(words: &[String]) -> String {
    format!(r"(?i)^(?:please\s+)?(?:{})\b", words.join("|"))
}

fn compile(pattern: &str) -> Result<Regex, ComplianceBuildError> {
    Regex::new(pattern).map_err(|err| ComplianceBuildError::Pattern(err.to_string()))
}
