#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use language_utils::{Frequency, Heteronym, Language, Lexeme, Literal, PartOfSpeech};
use weapon::data_model::Timestamped;
use weapon::persistence::MemoryEventLog;
use yap_deck::language_pack::{DictionaryEntry, SentenceData};
use yap_deck::{
    CardIndicator, Context, Deck, DeckEvent, Engine, EngineConfig, LanguageEvent,
    LanguageEventContent, LanguagePack, LanguagePackData,
};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 8, 30, 0).unwrap()
}

pub fn heteronym(word: &str, pos: PartOfSpeech) -> Heteronym {
    Heteronym {
        word: word.to_string(),
        lemma: word.to_string(),
        pos,
    }
}

pub fn vocab(word: &str, pos: PartOfSpeech) -> CardIndicator {
    CardIndicator::TargetLanguage {
        lexeme: Lexeme::Heteronym(heteronym(word, pos)),
    }
}

/// Six French words and one sentence built from them.
pub fn pack() -> Arc<LanguagePack> {
    use PartOfSpeech::*;

    let words = [
        ("la", Det, "la", 900),
        ("pomme", Noun, "pɔm", 400),
        ("est", Aux, "ɛ", 380),
        ("rouge", Adj, "ʁuʒ", 200),
        ("elle", Pron, "ɛl", 150),
        ("aile", Noun, "ɛl", 40),
    ];

    let sentence_words = [
        ("La", "la", Det),
        ("pomme", "pomme", Noun),
        ("est", "est", Aux),
        ("rouge", "rouge", Adj),
    ];
    let mut literals: Vec<Literal> = sentence_words
        .iter()
        .map(|(text, word, pos)| Literal {
            text: text.to_string(),
            whitespace: " ".to_string(),
            heteronym: Some(heteronym(word, *pos)),
        })
        .collect();
    literals.push(Literal {
        text: ".".to_string(),
        whitespace: String::new(),
        heteronym: None,
    });

    let data = LanguagePackData {
        course: Some(language_utils::COURSES[0]),
        word_frequencies: words
            .iter()
            .map(|(word, pos, _, count)| {
                (Lexeme::Heteronym(heteronym(word, *pos)), Frequency { count: *count })
            })
            .collect(),
        sentences: vec![SentenceData {
            text: "La pomme est rouge.".to_string(),
            literals,
            lexemes: sentence_words
                .iter()
                .map(|(_, word, pos)| Lexeme::Heteronym(heteronym(word, *pos)))
                .collect(),
            translations: vec!["The apple is red.".to_string()],
            movie_ids: vec![],
        }],
        pronunciations: words
            .iter()
            .map(|(word, _, pronunciation, _)| (word.to_string(), pronunciation.to_string()))
            .collect(),
        dictionary: words
            .iter()
            .map(|(word, pos, _, _)| DictionaryEntry {
                heteronym: heteronym(word, *pos),
                definitions: vec![format!("meaning of {word}")],
            })
            .collect(),
        ..Default::default()
    };
    Arc::new(LanguagePack::new(language_utils::COURSES[0], data))
}

pub fn empty_deck() -> Deck {
    Deck::new(
        Context {
            language_pack: pack(),
            target_language: Language::French,
            native_language: Language::English,
        },
        EngineConfig::default(),
    )
}

pub fn french(content: LanguageEventContent) -> DeckEvent {
    DeckEvent::Language(LanguageEvent {
        target_language: Language::French,
        native_language: Language::English,
        content,
    })
}

pub fn stamped(
    index: usize,
    clock: u64,
    timestamp: DateTime<Utc>,
    event: DeckEvent,
) -> Timestamped<DeckEvent> {
    Timestamped {
        within_device_events_index: index,
        logical_clock: clock,
        timestamp,
        event,
    }
}

/// An engine on `event_log` with both streams requested and French selected.
pub fn french_engine(event_log: MemoryEventLog, device_id: &str) -> Engine<MemoryEventLog> {
    let engine = Engine::new(
        event_log,
        Some("learner".to_string()),
        device_id.to_string(),
        EngineConfig::default(),
    );
    engine.request_reviews();
    engine.request_deck_selection();
    engine.insert_language_pack(pack());
    engine
        .select_languages(Language::English, Language::French)
        .unwrap();
    engine
}
