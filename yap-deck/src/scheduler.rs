use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use language_utils::{Heteronym, Language, Lexeme, Literal, transcription_challenge};
use ordered_float::NotNan;

use crate::deck::Deck;
use crate::events::{
    CARD_TYPES, CardIndicator, CardType, ChallengeRequirements, DeckEvent, LanguageEvent,
    LanguageEventContent, Rating, SentenceReviewIndicator, SentenceReviewResult,
};
use crate::language_pack::{PronunciationGuide, SentenceData};
use crate::next_cards::{AllowedCards, NextCardsIterator};

/// Text to synthesize for a challenge.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct AudioRequest {
    pub text: String,
    pub language: Language,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CardContent {
    Heteronym {
        heteronym: Heteronym,
        definitions: Vec<String>,
    },
    Multiword {
        term: String,
        meaning: String,
    },
    Listening {
        pronunciation: String,
        /// Every word with this pronunciation, and whether the learner knows it.
        possible_words: Vec<(bool, String)>,
    },
    LetterPronunciation {
        pattern: String,
        guide: PronunciationGuide,
    },
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranslateComprehensibleSentence {
    pub audio: AudioRequest,
    pub target_language: String,
    pub target_language_literals: Vec<Literal>,
    pub primary_expression: Lexeme,
    pub unique_target_language_lexemes: Vec<Lexeme>,
    pub native_translations: Vec<String>,
    pub movie_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranscribeComprehensibleSentence {
    pub target_language: String,
    pub audio: AudioRequest,
    pub native_language: Option<String>,
    pub parts: Vec<transcription_challenge::Part>,
    pub movie_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum Challenge {
    FlashCardReview {
        indicator: CardIndicator,
        content: CardContent,
        audio: Option<AudioRequest>,
        is_new: bool,
        listening_prefix: Option<String>,
    },
    TranslateComprehensibleSentence(TranslateComprehensibleSentence),
    TranscribeComprehensibleSentence(TranscribeComprehensibleSentence),
}

impl Challenge {
    pub fn audio_request(&self) -> Option<AudioRequest> {
        match self {
            Challenge::FlashCardReview { audio, .. } => audio.clone(),
            Challenge::TranslateComprehensibleSentence(translate) => Some(translate.audio.clone()),
            Challenge::TranscribeComprehensibleSentence(transcribe) => {
                Some(transcribe.audio.clone())
            }
        }
    }
}

/// Challenge types the learner has switched off for a while ("can't listen right now").
#[derive(Clone, Debug, Default)]
pub struct ChallengeBans {
    banned_at: BTreeMap<ChallengeRequirements, DateTime<Utc>>,
}

impl ChallengeBans {
    pub fn ban(&mut self, requirement: ChallengeRequirements, now: DateTime<Utc>) {
        log::info!("Banning {requirement:?} challenges");
        self.banned_at.insert(requirement, now);
    }

    pub fn unban(&mut self, requirement: ChallengeRequirements) {
        self.banned_at.remove(&requirement);
    }

    /// Bans still in effect at `now`. Expired bans are forgotten.
    pub fn active(
        &mut self,
        now: DateTime<Utc>,
        cooldown: std::time::Duration,
    ) -> Vec<ChallengeRequirements> {
        let cooldown =
            chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::days(365));
        self.banned_at
            .retain(|_, banned_at| now.signed_duration_since(*banned_at) < cooldown);
        self.banned_at.keys().copied().collect()
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AddCardOptions {
    /// How many cards of each type the learner could add right now.
    pub manual_add: Vec<(u32, CardType)>,
    pub smart_add: u32,
}

#[derive(Debug, Clone)]
pub struct ReviewInfo {
    due_cards: Vec<CardIndicator>,
    due_but_banned_cards: Vec<CardIndicator>,
    future_cards: Vec<CardIndicator>,
    reveal_answer_below_total_cards: usize,
}

impl ReviewInfo {
    pub fn due_cards(&self) -> &[CardIndicator] {
        &self.due_cards
    }

    pub fn due_count(&self) -> usize {
        self.due_cards.len()
    }

    pub fn due_but_banned_count(&self) -> usize {
        self.due_but_banned_cards.len()
    }

    pub fn future_count(&self) -> usize {
        self.future_cards.len()
    }

    pub fn total_count(&self) -> usize {
        self.due_cards.len() + self.future_cards.len()
    }

    /// Small decks make the learner look at the answer before they may grade themselves.
    pub fn must_reveal_answer(&self) -> bool {
        self.total_count() < self.reveal_answer_below_total_cards
    }

    pub fn next_challenge(&self, deck: &Deck) -> Option<Challenge> {
        let due_card = self.due_cards.first()?;
        self.get_challenge_for_card(deck, due_card)
    }

    pub fn get_challenge_for_card(
        &self,
        deck: &Deck,
        card_indicator: &CardIndicator,
    ) -> Option<Challenge> {
        let is_new = deck.card(card_indicator)?.is_new();
        let pack = &deck.context.language_pack;
        let target_language = deck.context.target_language;

        let challenge = match card_indicator {
            CardIndicator::ListeningLexeme { lexeme } => {
                if let Some(sentence) = deck.listening_lexeme_sentence(lexeme) {
                    // words are transcribed, punctuation is provided
                    let mut parts: Vec<transcription_challenge::Part> = Vec::new();
                    let mut current_words: Vec<Literal> = Vec::new();
                    for literal in &sentence.literals {
                        if literal.heteronym.is_some() {
                            current_words.push(literal.clone());
                        } else {
                            if !current_words.is_empty() {
                                parts.push(transcription_challenge::Part::AskedToTranscribe {
                                    parts: std::mem::take(&mut current_words),
                                });
                            }
                            parts.push(transcription_challenge::Part::Provided {
                                part: literal.clone(),
                            });
                        }
                    }
                    if !current_words.is_empty() {
                        parts.push(transcription_challenge::Part::AskedToTranscribe {
                            parts: current_words,
                        });
                    }
                    Challenge::TranscribeComprehensibleSentence(transcribe(
                        sentence,
                        parts,
                        target_language,
                    ))
                } else {
                    let Lexeme::Heteronym(heteronym) = lexeme else {
                        log::warn!("Multiword listening card {lexeme:?} cannot be reviewed");
                        return None;
                    };
                    let pronunciation = pack.word_to_pronunciation.get(&heteronym.word)?;
                    deck.homophonous_listening_challenge(card_indicator, is_new, pronunciation)?
                }
            }
            CardIndicator::ListeningHomophonous { pronunciation } => {
                deck.homophonous_listening_challenge(card_indicator, is_new, pronunciation)?
            }
            CardIndicator::TargetLanguage { lexeme } => {
                let flashcard = {
                    let content = match lexeme {
                        Lexeme::Heteronym(heteronym) => {
                            let Some(definitions) = pack.dictionary.get(heteronym) else {
                                log::warn!("{heteronym:?} is in the deck, but not in the dictionary");
                                return None;
                            };
                            CardContent::Heteronym {
                                heteronym: heteronym.clone(),
                                definitions: definitions.clone(),
                            }
                        }
                        Lexeme::Multiword(term) => {
                            let Some(meaning) = pack.phrasebook.get(term) else {
                                log::warn!("{term:?} is in the deck, but not in the phrasebook");
                                return None;
                            };
                            CardContent::Multiword {
                                term: term.clone(),
                                meaning: meaning.clone(),
                            }
                        }
                    };
                    Challenge::FlashCardReview {
                        indicator: card_indicator.clone(),
                        content,
                        audio: Some(AudioRequest {
                            text: lexeme.text().to_string(),
                            language: target_language,
                        }),
                        is_new,
                        listening_prefix: None,
                    }
                };
                if is_new {
                    flashcard
                } else if let Some(sentence) = deck.comprehensible_sentence_containing(
                    Some(lexeme),
                    deck.comprehensible_written_lexemes(),
                ) {
                    Challenge::TranslateComprehensibleSentence(TranslateComprehensibleSentence {
                        audio: AudioRequest {
                            text: sentence.text.clone(),
                            language: target_language,
                        },
                        target_language: sentence.text.clone(),
                        target_language_literals: sentence.literals.clone(),
                        primary_expression: lexeme.clone(),
                        unique_target_language_lexemes: unique_lexemes(sentence),
                        native_translations: sentence.translations.clone(),
                        movie_ids: sentence.movie_ids.clone(),
                    })
                } else {
                    flashcard
                }
            }
            CardIndicator::LetterPronunciation { pattern, position } => {
                let Some(guide) = pack.guide(pattern, *position) else {
                    log::warn!("Pattern {pattern} ({position:?}) is in the deck, but has no guide");
                    return None;
                };
                Challenge::FlashCardReview {
                    indicator: card_indicator.clone(),
                    content: CardContent::LetterPronunciation {
                        pattern: pattern.clone(),
                        guide: guide.clone(),
                    },
                    audio: None,
                    is_new,
                    listening_prefix: None,
                }
            }
        };
        Some(challenge)
    }

    fn get_listening_prefix(language: Language) -> &'static str {
        match language {
            Language::French => "Le mot est",
            Language::Spanish => "La palabra es",
            Language::English => "The word is",
            Language::Korean => "단어는",
            Language::German => "Das Wort ist",
            Language::Chinese => "单词是",
            Language::Japanese => "単語は",
            Language::Russian => "слово",
            Language::Portuguese => "A palavra é",
            Language::Italian => "La parola è",
        }
    }
}

fn transcribe(
    sentence: &SentenceData,
    parts: Vec<transcription_challenge::Part>,
    language: Language,
) -> TranscribeComprehensibleSentence {
    TranscribeComprehensibleSentence {
        target_language: sentence.text.clone(),
        audio: AudioRequest {
            text: sentence.text.clone(),
            language,
        },
        native_language: sentence.translations.first().cloned(),
        parts,
        movie_ids: sentence.movie_ids.clone(),
    }
}

fn unique_lexemes(sentence: &SentenceData) -> Vec<Lexeme> {
    let mut seen = BTreeSet::new();
    sentence
        .lexemes
        .iter()
        .filter(|lexeme| seen.insert(*lexeme))
        .cloned()
        .collect()
}

impl Deck {
    /// Splits the added, non-leech cards into due, due-but-banned and future, each soonest first.
    pub fn get_review_info(
        &self,
        banned_challenge_types: &[ChallengeRequirements],
        now: DateTime<Utc>,
    ) -> ReviewInfo {
        let mut due_cards = vec![];
        let mut future_cards = vec![];
        let mut due_but_banned_cards = vec![];

        // the queue is already ordered by (due, added order)
        for indicator in &self.queue {
            let Some(card) = self.cards.get(indicator) else {
                continue;
            };
            if card.due() <= now {
                if banned_challenge_types.contains(&indicator.card_type().challenge_type()) {
                    due_but_banned_cards.push(indicator.clone());
                } else {
                    due_cards.push(indicator.clone());
                }
            } else {
                future_cards.push(indicator.clone());
            }
        }

        ReviewInfo {
            due_cards,
            due_but_banned_cards,
            future_cards,
            reveal_answer_below_total_cards: self.config.reveal_answer_below_total_cards,
        }
    }

    pub(crate) fn next_unknown_cards(&self, allowed_cards: AllowedCards) -> NextCardsIterator<'_> {
        NextCardsIterator::new(self, allowed_cards)
    }

    fn max_cards_to_add(&self) -> usize {
        let current_cards = self.num_cards();

        if current_cards < 5 {
            1
        } else if current_cards < 11 {
            2
        } else {
            5
        }
    }

    pub fn add_card_options(&self, banned_challenge_types: &[ChallengeRequirements]) -> AddCardOptions {
        let banned_types_set = banned_challenge_types
            .iter()
            .copied()
            .collect::<BTreeSet<_>>();
        let max_cards_to_add = self.max_cards_to_add();

        AddCardOptions {
            manual_add: CARD_TYPES
                .iter()
                .map(|card_type| {
                    let count = if banned_types_set.contains(&card_type.challenge_type()) {
                        0
                    } else {
                        self.next_unknown_cards(AllowedCards::Type(*card_type))
                            .take(max_cards_to_add)
                            .count() as u32
                    };
                    (count, *card_type)
                })
                .collect(),
            smart_add: self
                .next_unknown_cards(AllowedCards::BannedRequirements(banned_types_set))
                .take(max_cards_to_add)
                .count() as u32,
        }
    }

    fn language_event(&self, content: LanguageEventContent) -> DeckEvent {
        DeckEvent::Language(LanguageEvent {
            target_language: self.context.target_language,
            native_language: self.context.native_language,
            content,
        })
    }

    /// The event adding the `count` most useful cards not in the deck yet, if there are any.
    pub fn add_next_unknown_cards(
        &self,
        card_type: Option<CardType>,
        count: usize,
        banned_challenge_types: &[ChallengeRequirements],
    ) -> Option<DeckEvent> {
        if count == 0 {
            return None;
        }

        let allowed_cards = match card_type {
            Some(card_type) => AllowedCards::Type(card_type),
            None => AllowedCards::BannedRequirements(
                banned_challenge_types.iter().copied().collect(),
            ),
        };

        let cards = self
            .next_unknown_cards(allowed_cards)
            .take(count)
            .collect::<Vec<_>>();

        (!cards.is_empty()).then(|| self.language_event(LanguageEventContent::AddCards { cards }))
    }

    /// `None` unless the card is in the deck.
    pub fn review_card(&self, reviewed: CardIndicator, rating: Rating) -> Option<DeckEvent> {
        self.card(&reviewed)?;
        Some(self.language_event(LanguageEventContent::ReviewCard { reviewed, rating }))
    }

    pub fn translate_sentence_perfect(
        &self,
        words_tapped: Vec<Lexeme>,
        challenge_sentence: String,
    ) -> Option<DeckEvent> {
        Some(self.language_event(LanguageEventContent::TranslationChallenge {
            review: SentenceReviewIndicator::TargetToNative {
                challenge_sentence,
                result: SentenceReviewResult::Perfect {
                    lexemes_needed_hint: words_tapped.into_iter().collect(),
                },
            },
        }))
    }

    pub fn translate_sentence_wrong(
        &self,
        challenge_sentence: String,
        submission: String,
        words_remembered: Vec<Lexeme>,
        words_forgotten: Vec<Lexeme>,
        words_tapped: Vec<Lexeme>,
    ) -> Option<DeckEvent> {
        Some(self.language_event(LanguageEventContent::TranslationChallenge {
            review: SentenceReviewIndicator::TargetToNative {
                challenge_sentence,
                result: SentenceReviewResult::Wrong {
                    submission,
                    lexemes_remembered: words_remembered.into_iter().collect(),
                    lexemes_forgotten: words_forgotten.into_iter().collect(),
                    lexemes_needed_hint: words_tapped.into_iter().collect(),
                },
            },
        }))
    }

    /// `None` for a challenge with nothing graded.
    pub fn transcribe_sentence(
        &self,
        challenge: Vec<transcription_challenge::PartGraded>,
    ) -> Option<DeckEvent> {
        if challenge.iter().all(|part| part.graded_parts().is_empty()) {
            return None;
        }
        Some(self.language_event(LanguageEventContent::TranscriptionChallenge { challenge }))
    }

    /// A sentence containing `required_lexeme` whose every lexeme is comprehensible, preferring
    /// the sentences reviewed least.
    pub(crate) fn comprehensible_sentence_containing(
        &self,
        required_lexeme: Option<&Lexeme>,
        mut comprehensible_words: BTreeSet<Lexeme>,
    ) -> Option<&SentenceData> {
        let pack = &self.context.language_pack;
        if let Some(required_lexeme) = required_lexeme {
            comprehensible_words.insert(required_lexeme.clone());
        }

        let candidate_sentences: Vec<usize> = match required_lexeme {
            Some(required_lexeme) => pack.sentences_containing_lexeme.get(required_lexeme)?.clone(),
            None => (0..pack.sentences.len()).collect(),
        };

        candidate_sentences
            .into_iter()
            .filter_map(|index| pack.sentences.get(index))
            .filter(|sentence| {
                sentence
                    .lexemes
                    .iter()
                    .all(|lexeme| comprehensible_words.contains(lexeme))
            })
            .min_by_key(|sentence| {
                let reviewed = self
                    .stats
                    .sentences_reviewed
                    .get(&sentence.text)
                    .copied()
                    .unwrap_or(0);
                // among equally practiced sentences, the one with the most common words
                let familiarity: f64 = sentence
                    .lexemes
                    .iter()
                    .filter_map(|lexeme| pack.word_frequencies.get(lexeme))
                    .map(|frequency| frequency.sqrt_frequency())
                    .sum::<f64>()
                    / sentence.lexemes.len().max(1) as f64;
                (reviewed, Reverse(NotNan::new(familiarity).ok()))
            })
    }

    /// A sentence made only of words the learner has listening cards for.
    fn listening_lexeme_sentence(&self, required_lexeme: &Lexeme) -> Option<&SentenceData> {
        let listening_lexemes: BTreeSet<Lexeme> = self
            .cards
            .keys()
            .filter_map(|card| card.listening_lexeme().cloned())
            .collect();
        if listening_lexemes.is_empty() {
            return None;
        }
        self.comprehensible_sentence_containing(Some(required_lexeme), listening_lexemes)
    }

    fn homophonous_listening_challenge(
        &self,
        card_indicator: &CardIndicator,
        is_new: bool,
        pronunciation: &str,
    ) -> Option<Challenge> {
        let pack = &self.context.language_pack;
        let listening_prefix = ReviewInfo::get_listening_prefix(self.context.target_language);

        let Some(words) = pack.pronunciation_to_words.get(pronunciation) else {
            log::warn!("Pronunciation {pronunciation:?} is in the deck, but has no words");
            return None;
        };
        let possible_words: Vec<(bool, String)> = words
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|word| {
                let word_known = pack
                    .pronunciation_to_lexemes(pronunciation)
                    .filter(|lexeme| lexeme.text() == word)
                    .any(|lexeme| {
                        self.card(&CardIndicator::TargetLanguage {
                            lexeme: lexeme.clone(),
                        })
                        .is_some_and(|card| !card.is_new())
                    });
                (word_known, word.clone())
            })
            .collect();
        let spoken_word = possible_words
            .iter()
            .find(|(known, _)| *known)
            .or(possible_words.first())?
            .1
            .clone();

        let flashcard = Challenge::FlashCardReview {
            indicator: card_indicator.clone(),
            content: CardContent::Listening {
                pronunciation: pronunciation.to_string(),
                possible_words,
            },
            audio: Some(AudioRequest {
                text: format!("{listening_prefix}... \"{spoken_word}\"."),
                language: self.context.target_language,
            }),
            is_new,
            listening_prefix: Some(listening_prefix.to_string()),
        };
        if is_new {
            return Some(flashcard);
        }

        // known homophones, least practiced by ear first
        let mut heteronyms: Vec<&Heteronym> = pack
            .pronunciation_to_lexemes(pronunciation)
            .filter(|lexeme| self.lexeme_known(lexeme))
            .filter_map(Lexeme::heteronym)
            .collect();
        heteronyms.sort_by_key(|heteronym| {
            self.stats
                .words_listened_to
                .get(*heteronym)
                .copied()
                .unwrap_or(0)
        });

        let comprehensible_lexemes = self.comprehensible_written_lexemes();
        let found = heteronyms.into_iter().find_map(|heteronym| {
            let sentence = self.comprehensible_sentence_containing(
                Some(&Lexeme::Heteronym(heteronym.clone())),
                comprehensible_lexemes.clone(),
            )?;
            Some((heteronym, sentence))
        });

        let Some((target_heteronym, sentence)) = found else {
            return Some(flashcard);
        };
        let parts = sentence
            .literals
            .iter()
            .map(|literal| {
                if literal.heteronym.as_ref() == Some(target_heteronym) {
                    transcription_challenge::Part::AskedToTranscribe {
                        parts: vec![literal.clone()],
                    }
                } else {
                    transcription_challenge::Part::Provided {
                        part: literal.clone(),
                    }
                }
            })
            .collect();
        Some(Challenge::TranscribeComprehensibleSentence(transcribe(
            sentence,
            parts,
            self.context.target_language,
        )))
    }
}
