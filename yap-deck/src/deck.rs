//! The deck: a fold of the `reviews` stream into cards and stats for one language pair.
//!
//! Applying an event never fails. Events that make no sense against the current state
//! (a review of a card that was never added, a word the language pack doesn't know) are
//! logged and skipped, so one bad event can't stop a long history from loading.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use im::{OrdMap, OrdSet};
use language_utils::{Heteronym, Language, Lexeme, transcription_challenge};
use rs_fsrs::FSRS;
use weapon::data_model::Timestamped;

use crate::config::EngineConfig;
use crate::events::{
    CardIndicator, DeckEvent, LanguageEvent, LanguageEventContent, Rating, SentenceReviewIndicator,
    SentenceReviewResult,
};
use crate::language_pack::LanguagePack;

/// Where a card is in its life. Cards only ever move right: `New < Learning < Review < Leech`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardState {
    New,
    Learning,
    Review,
    Leech,
}

impl From<rs_fsrs::State> for CardState {
    fn from(state: rs_fsrs::State) -> Self {
        match state {
            rs_fsrs::State::New => CardState::New,
            rs_fsrs::State::Learning => CardState::Learning,
            // a lapsed card keeps its place in the lattice; fsrs tracks the relearning steps
            rs_fsrs::State::Review | rs_fsrs::State::Relearning => CardState::Review,
        }
    }
}

/// Position of the event that added a card, in replay order. Breaks ties between cards
/// that are due at the same instant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddedOrder {
    pub logical_clock: u64,
    pub device_id: String,
    /// Index of the card within its `AddCards` event.
    pub position: usize,
}

#[derive(Clone, Debug)]
pub struct CardData {
    pub(crate) fsrs_card: rs_fsrs::Card,
    pub(crate) state: CardState,
    pub(crate) review_count: u32,
    pub(crate) consecutive_failures: u32,
    pub(crate) added_order: AddedOrder,
    /// Not formally added, but reviewed as part of a sentence. Ghosts inform what the
    /// learner knows but never show up as due.
    pub(crate) ghost: bool,
}

impl CardData {
    fn new(timestamp: DateTime<Utc>, added_order: AddedOrder, ghost: bool) -> Self {
        let mut fsrs_card = rs_fsrs::Card::new(timestamp);
        fsrs_card.due = timestamp;
        Self {
            fsrs_card,
            state: CardState::New,
            review_count: 0,
            consecutive_failures: 0,
            added_order,
            ghost,
        }
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn due(&self) -> DateTime<Utc> {
        self.fsrs_card.due
    }

    pub fn due_timestamp_ms(&self) -> i64 {
        self.fsrs_card.due.timestamp_millis()
    }

    pub fn stability(&self) -> f64 {
        self.fsrs_card.stability
    }

    pub fn difficulty(&self) -> f64 {
        self.fsrs_card.difficulty
    }

    pub fn review_count(&self) -> u32 {
        self.review_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_ghost(&self) -> bool {
        self.ghost
    }

    pub fn is_new(&self) -> bool {
        self.fsrs_card.state == rs_fsrs::State::New
    }

    fn review(&mut self, fsrs: &FSRS, rating: Rating, timestamp: DateTime<Utc>, leech_threshold: u32) {
        let fsrs_rating = match rating {
            Rating::Again => rs_fsrs::Rating::Again,
            Rating::Remembered => {
                // for new cards, we use Easy. Otherwise, we use Good
                if self.fsrs_card.state == rs_fsrs::State::New {
                    rs_fsrs::Rating::Easy
                } else {
                    rs_fsrs::Rating::Good
                }
            }
            Rating::Hard => rs_fsrs::Rating::Hard,
            Rating::Good => rs_fsrs::Rating::Good,
            Rating::Easy => rs_fsrs::Rating::Easy,
        };

        // another device's clock may be behind ours; never review into the past
        let review_time = timestamp.max(self.fsrs_card.last_review);
        self.fsrs_card = fsrs.next(self.fsrs_card.clone(), review_time, fsrs_rating).card;
        self.review_count += 1;

        if rating == Rating::Again {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }

        let mut state = self.state.max(CardState::from(self.fsrs_card.state));
        if self.consecutive_failures >= leech_threshold {
            state = CardState::Leech;
        }
        if state == CardState::Leech && self.state != CardState::Leech {
            log::info!(
                "Card became a leech after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.state = state;
    }
}

/// The language pair a deck belongs to, and the pack describing that language.
#[derive(Clone, Debug)]
pub struct Context {
    pub language_pack: Arc<LanguagePack>,
    pub target_language: Language,
    pub native_language: Language,
}

impl Context {
    /// Whether the language pack knows enough about a card to ever show it.
    pub fn is_card_valid(&self, card: &CardIndicator) -> bool {
        let pack = &self.language_pack;
        match card {
            CardIndicator::TargetLanguage { lexeme } => pack.word_frequencies.contains_key(lexeme),
            CardIndicator::ListeningHomophonous { pronunciation } => {
                pack.pronunciation_to_words.contains_key(pronunciation)
            }
            CardIndicator::ListeningLexeme { lexeme } => match lexeme {
                Lexeme::Heteronym(heteronym) => {
                    pack.word_frequencies.contains_key(lexeme)
                        && pack.word_to_pronunciation.contains_key(&heteronym.word)
                }
                // Multiword lexemes are not valid for ListeningLexeme cards yet
                Lexeme::Multiword(_) => false,
            },
            CardIndicator::LetterPronunciation { pattern, position } => {
                pack.guide(pattern, *position).is_some()
            }
        }
    }

    pub(crate) fn card_frequency(&self, card: &CardIndicator) -> Option<language_utils::Frequency> {
        let pack = &self.language_pack;
        match card {
            CardIndicator::TargetLanguage { lexeme } | CardIndicator::ListeningLexeme { lexeme } => {
                pack.word_frequencies.get(lexeme).copied()
            }
            CardIndicator::ListeningHomophonous { pronunciation } => {
                pack.pronunciation_max_frequency(pronunciation)
            }
            CardIndicator::LetterPronunciation { pattern, position } => pack
                .guide(pattern, *position)
                .map(|guide| language_utils::Frequency {
                    count: guide.frequency,
                }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    pub sentences_reviewed: BTreeMap<String, u32>,
    pub words_listened_to: BTreeMap<Heteronym, u32>,
    /// Reviews, translations and transcriptions in this deck's language pair.
    pub total_reviews: u64,
    /// Events of the same stream that belong to a different language pair.
    pub other_language_events: u64,
    pub xp: f64,
    /// UTC days on which the learner reviewed anything, in any language.
    pub review_days: BTreeSet<NaiveDate>,
    pub last_review: Option<DateTime<Utc>>,
    /// Sentence challenges completed per day, keyed by days since the epoch.
    pub past_week_challenges: BTreeMap<i64, u32>,
    /// Timestamp of the earliest event (when the user started using the app).
    pub start_time: Option<DateTime<Utc>>,
}

/// The deck while events are still being applied. [`Deck`] adds the indices queries need.
#[derive(Clone, Debug)]
pub struct DeckState {
    cards: OrdMap<CardIndicator, CardData>,
    fsrs: FSRS,
    stats: Stats,
    context: Context,
    config: EngineConfig,
    applied: OrdSet<(String, usize)>,
    last_applied: Option<(u64, String)>,
}

#[derive(Clone, Debug)]
pub struct Deck {
    pub(crate) cards: OrdMap<CardIndicator, CardData>,
    fsrs: FSRS,
    pub(crate) stats: Stats,
    pub(crate) context: Context,
    pub(crate) config: EngineConfig,
    applied: OrdSet<(String, usize)>,
    last_applied: Option<(u64, String)>,
    /// Added, non-leech cards ordered by `(due, added_order)`.
    pub(crate) queue: Vec<CardIndicator>,
    pub(crate) leeches: Vec<CardIndicator>,
}

impl From<Deck> for DeckState {
    fn from(deck: Deck) -> Self {
        DeckState {
            cards: deck.cards,
            fsrs: deck.fsrs,
            stats: deck.stats,
            context: deck.context,
            config: deck.config,
            applied: deck.applied,
            last_applied: deck.last_applied,
        }
    }
}

impl weapon::PartialAppState for Deck {
    type Event = DeckEvent;
    type Partial = DeckState;

    fn process_event(
        mut deck: Self::Partial,
        device_id: &str,
        event: &Timestamped<Self::Event>,
    ) -> Self::Partial {
        let Timestamped::<DeckEvent> {
            event,
            timestamp,
            logical_clock,
            within_device_events_index,
        } = event;

        if deck
            .applied
            .insert((device_id.to_string(), *within_device_events_index))
            .is_some()
        {
            log::debug!("Skipping already applied event {device_id}#{within_device_events_index}");
            return deck;
        }
        let position = (*logical_clock, device_id.to_string());
        if deck.last_applied.as_ref().is_none_or(|last| *last < position) {
            deck.last_applied = Some(position);
        }

        let DeckEvent::Language(LanguageEvent {
            target_language,
            native_language,
            content,
        }) = event;

        let same_course = *target_language == deck.context.target_language
            && *native_language == deck.context.native_language;
        if same_course {
            if let LanguageEventContent::ReviewCard { reviewed, .. } = content {
                if !deck.cards.contains_key(reviewed) {
                    log::warn!("Review of {reviewed:?}, which is not in the deck; ignoring");
                    return deck;
                }
            }
        }

        deck.stats.start_time = Some(match deck.stats.start_time {
            Some(start_time) => start_time.min(*timestamp),
            None => *timestamp,
        });

        if content.is_review() {
            deck.stats.review_days.insert(timestamp.date_naive());
            deck.stats.last_review = deck.stats.last_review.max(Some(*timestamp));
        }

        if !same_course {
            deck.stats.other_language_events += 1;
            return deck;
        }

        if content.is_review() {
            deck.stats.total_reviews += 1;
        }

        let order = |position: usize| AddedOrder {
            logical_clock: *logical_clock,
            device_id: device_id.to_string(),
            position,
        };

        match content {
            LanguageEventContent::AddCards { cards } => {
                for (position, card) in cards.iter().enumerate() {
                    deck.add_card(card, *timestamp, order(position));
                }
            }
            LanguageEventContent::ReviewCard { reviewed, rating } => {
                deck.log_review(reviewed.clone(), *rating, *timestamp, order(0));
            }
            LanguageEventContent::TranslationChallenge { review } => {
                track_challenge(&mut deck.stats, timestamp);
                deck.apply_translation(review, *timestamp, order(0));
            }
            LanguageEventContent::TranscriptionChallenge { challenge } => {
                track_challenge(&mut deck.stats, timestamp);
                deck.apply_transcription(challenge, *timestamp, order(0));
            }
        }

        deck
    }

    fn finalize(state: Self::Partial) -> Self {
        let mut queue: Vec<(i64, &AddedOrder, &CardIndicator)> = Vec::new();
        let mut leeches = Vec::new();
        for (indicator, card) in state.cards.iter() {
            if card.ghost {
                continue;
            }
            if card.state == CardState::Leech {
                leeches.push(indicator.clone());
            } else {
                queue.push((card.due_timestamp_ms(), &card.added_order, indicator));
            }
        }
        queue.sort();
        let queue = queue
            .into_iter()
            .map(|(_, _, indicator)| indicator.clone())
            .collect();

        Deck {
            cards: state.cards,
            fsrs: state.fsrs,
            stats: state.stats,
            context: state.context,
            config: state.config,
            applied: state.applied,
            last_applied: state.last_applied,
            queue,
            leeches,
        }
    }
}

fn track_challenge(stats: &mut Stats, timestamp: &DateTime<Utc>) {
    let days_since_epoch = timestamp.timestamp().div_euclid(86400);
    *stats.past_week_challenges.entry(days_since_epoch).or_insert(0) += 1;
}

impl DeckState {
    pub fn new(context: Context, config: EngineConfig) -> Self {
        Self {
            cards: OrdMap::new(),
            fsrs: FSRS::new(rs_fsrs::Parameters {
                request_retention: config.request_retention,
                ..Default::default()
            }),
            stats: Stats::default(),
            context,
            config,
            applied: OrdSet::new(),
            last_applied: None,
        }
    }

    fn add_card(&mut self, card: &CardIndicator, timestamp: DateTime<Utc>, order: AddedOrder) {
        // Make sure the card is valid and can be added
        if !self.context.is_card_valid(card) {
            log::debug!("Skipping {card:?}, which the language pack does not know");
            return;
        }
        match self.cards.get_mut(card) {
            Some(existing) if existing.ghost => {
                // formally adding a ghost makes it due now, keeping what we learned about it
                existing.ghost = false;
                existing.fsrs_card.due = timestamp;
                existing.added_order = order;
            }
            Some(_) => {}
            None => {
                self.cards
                    .insert(card.clone(), CardData::new(timestamp, order, false));
            }
        }
    }

    fn log_review(
        &mut self,
        card: CardIndicator,
        rating: Rating,
        timestamp: DateTime<Utc>,
        order: AddedOrder,
    ) {
        if !self.context.is_card_valid(&card) {
            log::debug!("Skipping review of {card:?}, which the language pack does not know");
            return;
        }

        if !self.cards.contains_key(&card) {
            self.cards
                .insert(card.clone(), CardData::new(timestamp, order, true));
        }
        let leech_threshold = self.config.leech_consecutive_failures;
        if let Some(card_data) = self.cards.get_mut(&card) {
            card_data.review(&self.fsrs, rating, timestamp, leech_threshold);
        }

        // Award XP based on review outcome
        self.stats.xp += match rating {
            Rating::Again => 5.0,
            _ => 1.0,
        };
    }

    fn apply_translation(
        &mut self,
        review: &SentenceReviewIndicator,
        timestamp: DateTime<Utc>,
        order: AddedOrder,
    ) {
        let SentenceReviewIndicator::TargetToNative {
            challenge_sentence,
            result,
        } = review;

        match result {
            SentenceReviewResult::Perfect {
                lexemes_needed_hint,
            } => {
                let Some(sentence) = self.context.language_pack.sentence(challenge_sentence) else {
                    log::warn!("Translated sentence {challenge_sentence:?} is not in the language pack");
                    return;
                };
                let lexemes = sentence.lexemes.iter().cloned().collect::<BTreeSet<_>>();
                *self
                    .stats
                    .sentences_reviewed
                    .entry(challenge_sentence.clone())
                    .or_insert(0) += 1;

                for lexeme in lexemes.difference(lexemes_needed_hint) {
                    self.log_review(
                        CardIndicator::TargetLanguage {
                            lexeme: lexeme.clone(),
                        },
                        Rating::Remembered,
                        timestamp,
                        order.clone(),
                    );
                }
                for lexeme in lexemes_needed_hint {
                    self.log_review(
                        CardIndicator::TargetLanguage {
                            lexeme: lexeme.clone(),
                        },
                        Rating::Again,
                        timestamp,
                        order.clone(),
                    );
                }
            }
            SentenceReviewResult::Wrong {
                submission: _,
                lexemes_remembered,
                lexemes_forgotten,
                lexemes_needed_hint,
            } => {
                for lexeme in lexemes_remembered.difference(lexemes_needed_hint) {
                    self.log_review(
                        CardIndicator::TargetLanguage {
                            lexeme: lexeme.clone(),
                        },
                        Rating::Remembered,
                        timestamp,
                        order.clone(),
                    );
                }
                for lexeme in lexemes_forgotten.union(lexemes_needed_hint) {
                    self.log_review(
                        CardIndicator::TargetLanguage {
                            lexeme: lexeme.clone(),
                        },
                        Rating::Again,
                        timestamp,
                        order.clone(),
                    );
                }
            }
        }
    }

    fn apply_transcription(
        &mut self,
        challenge: &[transcription_challenge::PartGraded],
        timestamp: DateTime<Utc>,
        order: AddedOrder,
    ) {
        let mut perfect = true;

        // full sentence transcriptions only provide punctuation, never words
        let is_full_sentence_transcription = !challenge.iter().any(|part| {
            matches!(part, transcription_challenge::PartGraded::Provided { part } if part.heteronym.is_some())
        });

        // worse grades sort later, so max is the worst
        let mut worst_grades: BTreeMap<Heteronym, transcription_challenge::WordGrade> =
            BTreeMap::new();
        for graded_part in challenge.iter().flat_map(|part| part.graded_parts()) {
            if let Some(heteronym) = &graded_part.heard.heteronym {
                let worst = worst_grades
                    .entry(heteronym.clone())
                    .or_insert_with(|| graded_part.grade.clone());
                if graded_part.grade > *worst {
                    *worst = graded_part.grade.clone();
                }
            }
        }

        for (heteronym, grade) in worst_grades {
            let Some(pronunciation) = self
                .context
                .language_pack
                .word_to_pronunciation
                .get(&heteronym.word)
                .cloned()
            else {
                log::debug!("No pronunciation for transcribed word {:?}", heteronym.word);
                continue;
            };

            let rating = match grade {
                transcription_challenge::WordGrade::Perfect { .. }
                | transcription_challenge::WordGrade::CorrectWithTypo { .. } => Rating::Remembered,
                transcription_challenge::WordGrade::PhoneticallyIdenticalButContextuallyIncorrect {
                    ..
                } => Rating::Hard,
                transcription_challenge::WordGrade::PhoneticallySimilarButContextuallyIncorrect {
                    ..
                }
                | transcription_challenge::WordGrade::Incorrect { .. }
                | transcription_challenge::WordGrade::Missed {} => Rating::Again,
            };

            if rating != Rating::Again {
                *self
                    .stats
                    .words_listened_to
                    .entry(heteronym.clone())
                    .or_insert(0) += 1;
            } else {
                perfect = false;
            }

            self.log_review(
                CardIndicator::ListeningHomophonous { pronunciation },
                rating,
                timestamp,
                order.clone(),
            );

            let listening_lexeme_card = CardIndicator::ListeningLexeme {
                lexeme: Lexeme::Heteronym(heteronym),
            };
            if rating == Rating::Remembered
                && !self.cards.contains_key(&listening_lexeme_card)
                && self.context.is_card_valid(&listening_lexeme_card)
            {
                self.cards.insert(
                    listening_lexeme_card.clone(),
                    CardData::new(timestamp, order.clone(), false),
                );
            }
            if is_full_sentence_transcription {
                self.log_review(listening_lexeme_card, rating, timestamp, order.clone());
            }
        }

        if perfect {
            let challenge_sentence = challenge
                .iter()
                .flat_map(|part| match part {
                    transcription_challenge::PartGraded::AskedToTranscribe { parts, .. } => parts
                        .iter()
                        .map(|part| format!("{}{}", part.heard.text, part.heard.whitespace))
                        .collect::<Vec<_>>(),
                    transcription_challenge::PartGraded::Provided { part } => {
                        vec![format!("{}{}", part.text, part.whitespace)]
                    }
                })
                .collect::<String>();
            if self
                .context
                .language_pack
                .sentence(challenge_sentence.trim_end())
                .is_some()
            {
                *self
                    .stats
                    .sentences_reviewed
                    .entry(challenge_sentence.trim_end().to_string())
                    .or_insert(0) += 1;
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct CardSummary {
    pub card_indicator: CardIndicator,
    pub due_timestamp_ms: i64,
    pub state: CardState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct UpcomingReviewStats {
    pub total_reviews: u32,
    pub max_per_day: u32,
}

/// Everything a deck knows, in a form that can be compared for equality.
#[derive(Clone, Debug, PartialEq)]
pub struct DeckSnapshot {
    pub cards: Vec<CardSnapshot>,
    pub stats: Stats,
    pub applied_events: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CardSnapshot {
    pub indicator: CardIndicator,
    pub state: CardState,
    pub stability: f64,
    pub difficulty: f64,
    pub due_timestamp_ms: i64,
    pub review_count: u32,
    pub consecutive_failures: u32,
    pub added_order: AddedOrder,
    pub ghost: bool,
}

impl Deck {
    pub fn new(context: Context, config: EngineConfig) -> Self {
        <Deck as weapon::PartialAppState>::finalize(DeckState::new(context, config))
    }

    /// Applies events in the order given and recomputes the derived indices once.
    pub fn apply_events<'a>(
        self,
        events: impl IntoIterator<Item = (&'a str, &'a Timestamped<DeckEvent>)>,
    ) -> Deck {
        let mut state = DeckState::from(self);
        for (device_id, event) in events {
            state = <Deck as weapon::PartialAppState>::process_event(state, device_id, event);
        }
        <Deck as weapon::PartialAppState>::finalize(state)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn get_target_language(&self) -> Language {
        self.context.target_language
    }

    pub fn card(&self, indicator: &CardIndicator) -> Option<&CardData> {
        self.cards.get(indicator)
    }

    pub fn has_applied(&self, device_id: &str, within_device_events_index: usize) -> bool {
        self.applied
            .contains(&(device_id.to_string(), within_device_events_index))
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// `(logical_clock, device)` of the latest event applied, in replay order.
    pub fn last_applied(&self) -> Option<&(u64, String)> {
        self.last_applied.as_ref()
    }

    pub(crate) fn added_cards(&self) -> impl Iterator<Item = (&CardIndicator, &CardData)> {
        self.cards.iter().filter(|(_, card)| !card.ghost)
    }

    fn card_to_summary(indicator: &CardIndicator, card: &CardData) -> CardSummary {
        CardSummary {
            card_indicator: indicator.clone(),
            due_timestamp_ms: card.due_timestamp_ms(),
            state: card.state,
        }
    }

    /// Every added card except leeches, soonest due first.
    pub fn get_all_cards_summary(&self) -> Vec<CardSummary> {
        self.queue
            .iter()
            .filter_map(|indicator| {
                self.cards
                    .get(indicator)
                    .map(|card| Self::card_to_summary(indicator, card))
            })
            .collect()
    }

    pub fn get_leeches(&self) -> Vec<CardSummary> {
        self.leeches
            .iter()
            .filter_map(|indicator| {
                self.cards
                    .get(indicator)
                    .map(|card| Self::card_to_summary(indicator, card))
            })
            .collect()
    }

    pub fn num_cards(&self) -> usize {
        self.added_cards().count()
    }

    pub fn get_total_reviews(&self) -> u64 {
        self.stats.total_reviews
    }

    pub fn get_xp(&self) -> f64 {
        self.stats.xp
    }

    /// Consecutive UTC days with a review, ending on the day of the latest review. A streak
    /// lapses once `streak_grace_hours` have passed since that review.
    pub fn get_daily_streak(&self, now: DateTime<Utc>) -> u32 {
        let Some(last_review) = self.stats.last_review else {
            return 0;
        };
        if now >= last_review + chrono::Duration::hours(self.config.streak_grace_hours) {
            return 0;
        }
        let mut day = last_review.date_naive();
        let mut streak = 0;
        while self.stats.review_days.contains(&day) {
            streak += 1;
            let Some(previous) = day.pred_opt() else {
                break;
            };
            day = previous;
        }
        streak
    }

    /// Share of the corpus's running words covered by reviewed vocabulary cards.
    pub fn get_percent_of_words_known(&self) -> f64 {
        let pack = &self.context.language_pack;
        if pack.total_word_count == 0 {
            return 0.0;
        }
        let known: u64 = self
            .cards
            .iter()
            .filter(|(_, card)| card.state != CardState::Leech && !card.is_new())
            .filter_map(|(indicator, _)| indicator.target_language())
            .filter_map(|lexeme| pack.word_frequencies.get(lexeme))
            .map(|frequency| frequency.count as u64)
            .sum();
        known as f64 / pack.total_word_count as f64
    }

    /// Average number of sentence challenges per day over the seven days ending `now`.
    pub fn get_past_week_challenge_average(&self, now: DateTime<Utc>) -> f64 {
        let today = now.timestamp().div_euclid(86400);
        let total: u32 = self
            .stats
            .past_week_challenges
            .range(today - 6..=today)
            .map(|(_, count)| *count)
            .sum();
        total as f64 / 7.0
    }

    /// Reviews coming due in the three weeks after `now`, and the busiest day among them.
    pub fn get_upcoming_week_review_stats(&self, now: DateTime<Utc>) -> UpcomingReviewStats {
        let three_weeks_later = now + chrono::Duration::days(21);
        let mut daily_counts: BTreeMap<i64, u32> = BTreeMap::new();
        let mut total_reviews = 0;

        for (_, card) in self.added_cards() {
            // Skip new cards (they haven't been reviewed yet)
            if card.is_new() || card.state == CardState::Leech {
                continue;
            }
            let due = card.due();
            if due > now && due <= three_weeks_later {
                total_reviews += 1;
                *daily_counts.entry((due - now).num_days()).or_insert(0) += 1;
            }
        }

        UpcomingReviewStats {
            total_reviews,
            max_per_day: daily_counts.values().max().copied().unwrap_or(0),
        }
    }

    /// Vocabulary the learner can be assumed to read: cards that graduated to review.
    pub(crate) fn comprehensible_written_lexemes(&self) -> BTreeSet<Lexeme> {
        self.cards
            .iter()
            .filter(|(_, card)| card.state == CardState::Review)
            .filter_map(|(indicator, _)| indicator.target_language().cloned())
            .collect()
    }

    pub(crate) fn lexeme_known(&self, lexeme: &Lexeme) -> bool {
        self.cards
            .get(&CardIndicator::TargetLanguage {
                lexeme: lexeme.clone(),
            })
            .is_some_and(|card| !card.ghost)
    }

    pub fn snapshot(&self) -> DeckSnapshot {
        DeckSnapshot {
            cards: self
                .cards
                .iter()
                .map(|(indicator, card)| CardSnapshot {
                    indicator: indicator.clone(),
                    state: card.state,
                    stability: card.stability(),
                    difficulty: card.difficulty(),
                    due_timestamp_ms: card.due_timestamp_ms(),
                    review_count: card.review_count,
                    consecutive_failures: card.consecutive_failures,
                    added_order: card.added_order.clone(),
                    ghost: card.ghost,
                })
                .collect(),
            stats: self.stats.clone(),
            applied_events: self.applied.len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::language_pack::tests::{heteronym, sample_pack, word};
    use chrono::TimeZone;
    use language_utils::transcription_challenge::{PartGraded, PartGradedPart, WordGrade};
    use language_utils::{Literal, PartOfSpeech};

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
    }

    pub(crate) fn french_deck() -> Deck {
        Deck::new(
            Context {
                language_pack: sample_pack(),
                target_language: Language::French,
                native_language: Language::English,
            },
            EngineConfig::default(),
        )
    }

    pub(crate) fn french(content: LanguageEventContent) -> DeckEvent {
        DeckEvent::Language(LanguageEvent {
            target_language: Language::French,
            native_language: Language::English,
            content,
        })
    }

    pub(crate) fn at(
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

    pub(crate) fn vocab(text: &str, pos: PartOfSpeech) -> CardIndicator {
        CardIndicator::TargetLanguage {
            lexeme: word(text, pos),
        }
    }

    fn add(cards: Vec<CardIndicator>) -> DeckEvent {
        french(LanguageEventContent::AddCards { cards })
    }

    fn review(card: &CardIndicator, rating: Rating) -> DeckEvent {
        french(LanguageEventContent::ReviewCard {
            reviewed: card.clone(),
            rating,
        })
    }

    fn fold(events: &[(&str, Timestamped<DeckEvent>)]) -> Deck {
        french_deck().apply_events(events.iter().map(|(device, event)| (*device, event)))
    }

    #[test]
    fn added_card_is_new_and_due_immediately() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let deck = fold(&[("a", at(0, 1, t0(), add(vec![chat.clone()])))]);

        let card = deck.card(&chat).unwrap();
        assert_eq!(card.state(), CardState::New);
        assert_eq!(card.due(), t0());
        assert_eq!(deck.num_cards(), 1);
        assert_eq!(deck.get_total_reviews(), 0);
    }

    #[test]
    fn reviewing_a_missing_card_changes_nothing() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let deck = fold(&[("a", at(0, 1, t0(), review(&chat, Rating::Good)))]);
        assert!(deck.card(&chat).is_none());
        assert_eq!(deck.get_xp(), 0.0);
        assert_eq!(deck.get_total_reviews(), 0);
        assert!(deck.stats().review_days.is_empty());
        assert_eq!(deck.stats().last_review, None);
        assert_eq!(deck.stats().start_time, None);
        assert_eq!(deck.get_daily_streak(t0()), 0);
        // still applied, so a replay does not count it either
        assert_eq!(deck.applied_count(), 1);
    }

    #[test]
    fn cards_unknown_to_the_pack_are_skipped() {
        let unknown = vocab("ordinateur", PartOfSpeech::Noun);
        let deck = fold(&[("a", at(0, 1, t0(), add(vec![unknown.clone()])))]);
        assert!(deck.card(&unknown).is_none());
    }

    #[test]
    fn again_schedules_sooner_than_good() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let added = at(0, 1, t0(), add(vec![chat.clone()]));
        let later = t0() + chrono::Duration::minutes(1);

        let again = fold(&[("a", added.clone()), ("a", at(1, 2, later, review(&chat, Rating::Again)))]);
        let good = fold(&[("a", added), ("a", at(1, 2, later, review(&chat, Rating::Good)))]);

        let again = again.card(&chat).unwrap();
        let good = good.card(&chat).unwrap();
        assert!(again.due_timestamp_ms() < good.due_timestamp_ms());
        assert!(again.due() > later);
        assert!(again.due() <= later + chrono::Duration::minutes(30));
        assert_ne!(again.state(), CardState::Leech);
    }

    #[test]
    fn repeated_failures_make_a_leech() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let mut events = vec![("a", at(0, 1, t0(), add(vec![chat.clone()])))];
        for i in 1..=8 {
            events.push((
                "a",
                at(i, i as u64 + 1, t0() + chrono::Duration::hours(i as i64), review(&chat, Rating::Again)),
            ));
        }

        let deck = fold(&events[..8]);
        assert_eq!(deck.card(&chat).unwrap().state(), CardState::Learning);
        assert_eq!(deck.queue, vec![chat.clone()]);

        let deck = fold(&events);
        assert_eq!(deck.card(&chat).unwrap().state(), CardState::Leech);
        assert!(deck.queue.is_empty());
        assert_eq!(deck.get_leeches().len(), 1);
        assert!(deck.get_all_cards_summary().is_empty());
    }

    #[test]
    fn states_never_move_backwards() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let deck = fold(&[
            ("a", at(0, 1, t0(), add(vec![chat.clone()]))),
            ("a", at(1, 2, t0(), review(&chat, Rating::Easy))),
        ]);
        assert_eq!(deck.card(&chat).unwrap().state(), CardState::Review);

        let lapse = t0() + chrono::Duration::days(30);
        let deck = deck.apply_events([("a", &at(2, 3, lapse, review(&chat, Rating::Again)))]);
        assert_eq!(deck.card(&chat).unwrap().state(), CardState::Review);
    }

    #[test]
    fn applying_an_event_twice_is_a_no_op() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let events = [
            ("a", at(0, 1, t0(), add(vec![chat.clone()]))),
            ("a", at(1, 2, t0(), review(&chat, Rating::Good))),
        ];
        let once = fold(&events);
        let twice = once
            .clone()
            .apply_events(events.iter().map(|(device, event)| (*device, event)));
        assert_eq!(once.snapshot(), twice.snapshot());
        assert_eq!(twice.get_total_reviews(), 1);
    }

    #[test]
    fn due_ties_are_broken_by_insertion_order() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let le = vocab("le", PartOfSpeech::Det);
        let noir = vocab("noir", PartOfSpeech::Adj);
        let deck = fold(&[
            ("b", at(0, 1, t0(), add(vec![noir.clone()]))),
            ("a", at(0, 1, t0(), add(vec![le.clone(), chat.clone()]))),
        ]);
        assert_eq!(deck.queue, vec![le, chat, noir]);
    }

    #[test]
    fn other_language_pairs_do_not_touch_cards() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let spanish = DeckEvent::Language(LanguageEvent {
            target_language: Language::Spanish,
            native_language: Language::English,
            content: LanguageEventContent::AddCards {
                cards: vec![chat.clone()],
            },
        });
        let deck = fold(&[("a", at(0, 1, t0(), spanish))]);
        assert!(deck.card(&chat).is_none());
        assert_eq!(deck.stats().other_language_events, 1);
        assert_eq!(deck.stats().start_time, Some(t0()));
    }

    #[test]
    fn perfect_translation_reviews_every_word_and_creates_ghosts() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let noir = vocab("noir", PartOfSpeech::Adj);
        let translation = french(LanguageEventContent::TranslationChallenge {
            review: SentenceReviewIndicator::TargetToNative {
                challenge_sentence: "Le chat est noir.".to_string(),
                result: SentenceReviewResult::Perfect {
                    lexemes_needed_hint: [word("noir", PartOfSpeech::Adj)].into_iter().collect(),
                },
            },
        });
        let deck = fold(&[
            ("a", at(0, 1, t0(), add(vec![chat.clone()]))),
            ("a", at(1, 2, t0(), translation)),
        ]);

        assert_eq!(deck.card(&chat).unwrap().review_count(), 1);
        let noir_card = deck.card(&noir).unwrap();
        assert!(noir_card.is_ghost());
        assert_eq!(noir_card.consecutive_failures(), 1);
        assert_eq!(deck.num_cards(), 1);
        assert_eq!(deck.queue, vec![chat]);
        assert_eq!(deck.stats().sentences_reviewed["Le chat est noir."], 1);
        // three words remembered, one needed a hint
        assert_eq!(deck.get_xp(), 3.0 + 5.0);
    }

    #[test]
    fn adding_a_ghost_promotes_it() {
        let noir = vocab("noir", PartOfSpeech::Adj);
        let wrong = french(LanguageEventContent::TranslationChallenge {
            review: SentenceReviewIndicator::TargetToNative {
                challenge_sentence: "Le chat est noir.".to_string(),
                result: SentenceReviewResult::Wrong {
                    submission: "the dog".to_string(),
                    lexemes_remembered: BTreeSet::new(),
                    lexemes_forgotten: [word("noir", PartOfSpeech::Adj)].into_iter().collect(),
                    lexemes_needed_hint: BTreeSet::new(),
                },
            },
        });
        let added_at = t0() + chrono::Duration::days(2);
        let deck = fold(&[
            ("a", at(0, 1, t0(), wrong)),
            ("a", at(1, 2, added_at, add(vec![noir.clone()]))),
        ]);
        let card = deck.card(&noir).unwrap();
        assert!(!card.is_ghost());
        assert_eq!(card.due(), added_at);
        assert_eq!(card.review_count(), 1);
    }

    #[test]
    fn transcription_grades_review_listening_cards() {
        let challenge = vec![
            PartGraded::AskedToTranscribe {
                parts: vec![
                    PartGradedPart {
                        heard: Literal {
                            text: "Il".to_string(),
                            whitespace: " ".to_string(),
                            heteronym: Some(heteronym("il", PartOfSpeech::Pron)),
                        },
                        grade: WordGrade::Perfect { wrote: None },
                    },
                    PartGradedPart {
                        heard: Literal {
                            text: "mange".to_string(),
                            whitespace: String::new(),
                            heteronym: Some(heteronym("mange", PartOfSpeech::Verb)),
                        },
                        grade: WordGrade::Missed {},
                    },
                ],
                submission: "il".to_string(),
            },
            PartGraded::Provided {
                part: Literal {
                    text: ".".to_string(),
                    whitespace: String::new(),
                    heteronym: None,
                },
            },
        ];
        let deck = fold(&[(
            "a",
            at(0, 1, t0(), french(LanguageEventContent::TranscriptionChallenge { challenge })),
        )]);

        let il = CardIndicator::ListeningHomophonous {
            pronunciation: "il".to_string(),
        };
        let mange = CardIndicator::ListeningHomophonous {
            pronunciation: "mɑ̃ʒ".to_string(),
        };
        assert_eq!(deck.card(&il).unwrap().consecutive_failures(), 0);
        assert_eq!(deck.card(&mange).unwrap().consecutive_failures(), 1);
        // a remembered word gets a listening card of its own
        let il_lexeme = CardIndicator::ListeningLexeme {
            lexeme: word("il", PartOfSpeech::Pron),
        };
        assert!(!deck.card(&il_lexeme).unwrap().is_ghost());
        assert_eq!(deck.stats().words_listened_to.len(), 1);
        assert!(deck.stats().sentences_reviewed.is_empty());
        assert_eq!(deck.stats().past_week_challenges.values().sum::<u32>(), 1);
    }

    #[test]
    fn streak_counts_consecutive_days_until_it_lapses() {
        let chat = vocab("chat", PartOfSpeech::Noun);
        let mut events = vec![("a", at(0, 1, t0(), add(vec![chat.clone()])))];
        for day in 0..3 {
            events.push((
                "a",
                at(
                    day + 1,
                    day as u64 + 2,
                    t0() + chrono::Duration::days(day as i64),
                    review(&chat, Rating::Good),
                ),
            ));
        }
        let deck = fold(&events);
        let last = t0() + chrono::Duration::days(2);
        assert_eq!(deck.get_daily_streak(last + chrono::Duration::hours(1)), 3);
        assert_eq!(deck.get_daily_streak(last + chrono::Duration::hours(31)), 0);
        assert_eq!(french_deck().get_daily_streak(t0()), 0);
    }

    #[test]
    fn percent_known_counts_reviewed_vocabulary() {
        let le = vocab("le", PartOfSpeech::Det);
        let deck = fold(&[
            ("a", at(0, 1, t0(), add(vec![le.clone()]))),
            ("a", at(1, 2, t0(), review(&le, Rating::Good))),
        ]);
        let pack = sample_pack();
        let expected = 1000.0 / pack.total_word_count as f64;
        assert!((deck.get_percent_of_words_known() - expected).abs() < 1e-9);
    }
}
