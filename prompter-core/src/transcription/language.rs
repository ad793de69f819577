//! Script-presence language heuristic.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    English,
    Hindi,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::English => "english",
            Language::Hindi => "hindi",
        }
    }
}

const DEVANAGARI: std::ops::RangeInclusive<char> = '\u{0900}'..='\u{097F}';

/// Update the detected language from a finalized transcript.
///
/// Devanagari anywhere in `text` flips the tag to Hindi. Absence never flips
/// it back; the tag only resets when a new listening session starts.
pub fn detect_language(text: &str, current: Language) -> Language {
    if text.chars().any(|c| DEVANAGARI.contains(&c)) {
        Language::Hindi
    } else {
        current
    }
}
