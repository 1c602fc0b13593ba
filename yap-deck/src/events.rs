use std::collections::BTreeSet;

use language_utils::{Language, Lexeme, PatternPosition, transcription_challenge};
use serde::{Deserialize, Serialize};
use weapon::data_model::Event;

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub enum CardType {
    TargetLanguage,
    Listening,
    LetterPronunciation,
}

pub const CARD_TYPES: [CardType; 3] = [
    CardType::TargetLanguage,
    CardType::Listening,
    CardType::LetterPronunciation,
];

impl CardType {
    pub fn challenge_type(&self) -> ChallengeRequirements {
        match self {
            CardType::TargetLanguage => ChallengeRequirements::Text,
            CardType::Listening => ChallengeRequirements::Listening,
            CardType::LetterPronunciation => ChallengeRequirements::Speaking,
        }
    }
}

/// What a challenge asks of the learner. The learner can temporarily ban any of these.
#[derive(Eq, PartialEq, Hash, Serialize, Deserialize, Debug, Clone, Copy, PartialOrd, Ord)]
pub enum ChallengeRequirements {
    Text,
    Listening,
    Speaking,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub enum CardIndicator {
    TargetLanguage { lexeme: Lexeme },
    ListeningHomophonous { pronunciation: String },
    ListeningLexeme { lexeme: Lexeme },
    LetterPronunciation { pattern: String, position: PatternPosition },
}

impl CardIndicator {
    pub fn target_language(&self) -> Option<&Lexeme> {
        match self {
            CardIndicator::TargetLanguage { lexeme } => Some(lexeme),
            _ => None,
        }
    }

    pub fn listening_homophonous(&self) -> Option<&String> {
        match self {
            CardIndicator::ListeningHomophonous { pronunciation } => Some(pronunciation),
            _ => None,
        }
    }

    pub fn listening_lexeme(&self) -> Option<&Lexeme> {
        match self {
            CardIndicator::ListeningLexeme { lexeme } => Some(lexeme),
            _ => None,
        }
    }

    pub fn letter_pronunciation(&self) -> Option<&String> {
        match self {
            CardIndicator::LetterPronunciation { pattern, .. } => Some(pattern),
            _ => None,
        }
    }

    pub fn card_type(&self) -> CardType {
        match self {
            CardIndicator::TargetLanguage { .. } => CardType::TargetLanguage,
            CardIndicator::ListeningHomophonous { .. } => CardType::Listening,
            CardIndicator::ListeningLexeme { .. } => CardType::Listening,
            CardIndicator::LetterPronunciation { .. } => CardType::LetterPronunciation,
        }
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Again,
    Remembered, // generic rating for when the user picked "remembered" without choosing a specific rating

    Hard,
    Good,
    Easy,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd)]
pub enum SentenceReviewResult {
    Perfect {
        #[serde(default)]
        lexemes_needed_hint: BTreeSet<Lexeme>,
    },
    Wrong {
        submission: String,
        lexemes_remembered: BTreeSet<Lexeme>,
        lexemes_forgotten: BTreeSet<Lexeme>,
        #[serde(default)]
        lexemes_needed_hint: BTreeSet<Lexeme>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd)]
pub enum SentenceReviewIndicator {
    TargetToNative {
        challenge_sentence: String,
        result: SentenceReviewResult,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd)]
pub struct LanguageEvent {
    #[serde(alias = "language")]
    pub target_language: Language,
    #[serde(default = "default_native_language")]
    pub native_language: Language,
    pub content: LanguageEventContent,
}

fn default_native_language() -> Language {
    Language::English
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd)]
pub enum LanguageEventContent {
    AddCards {
        cards: Vec<CardIndicator>,
    },
    ReviewCard {
        reviewed: CardIndicator,
        rating: Rating,
    },
    #[serde(rename = "ReviewSentence")]
    TranslationChallenge {
        review: SentenceReviewIndicator,
    },
    TranscriptionChallenge {
        challenge: Vec<transcription_challenge::PartGraded>,
    },
}

impl LanguageEventContent {
    /// Events that count as the learner doing a review, for stats.
    pub fn is_review(&self) -> bool {
        !matches!(self, LanguageEventContent::AddCards { .. })
    }
}

// Event types
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Ord, PartialOrd)]
pub enum DeckEvent {
    Language(LanguageEvent),
}

#[derive(Clone, Debug, Serialize, Deserialize, Ord, PartialOrd, Eq, PartialEq)]
#[serde(tag = "version")]
pub enum VersionedDeckEvent {
    V1(DeckEvent),
}

impl Event for DeckEvent {
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        let versioned = VersionedDeckEvent::from(self.clone());
        serde_json::to_value(versioned)
    }

    fn from_json(json: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value::<VersionedDeckEvent>(json.clone()).map(|versioned| versioned.into())
    }
}

impl From<DeckEvent> for VersionedDeckEvent {
    fn from(event: DeckEvent) -> Self {
        VersionedDeckEvent::V1(event)
    }
}

impl From<VersionedDeckEvent> for DeckEvent {
    fn from(event: VersionedDeckEvent) -> Self {
        match event {
            VersionedDeckEvent::V1(event) => event,
        }
    }
}
