use chrono::{DateTime, Duration, Utc};
use language_utils::transcription_challenge;
use weapon::data_model::Timestamped;

use crate::deck::Deck;
use crate::events::{DeckEvent, Rating};
use crate::scheduler::{Challenge, TranscribeComprehensibleSentence, TranslateComprehensibleSentence};

const SIMULATED_DEVICE: &str = "simulation";

/// Iterator that simulates daily usage of a deck, yielding all challenges for each day
pub struct DailySimulationIterator {
    deck: Deck,
    current_time: DateTime<Utc>,
    event_index: usize,
    logical_clock: u64,
}

impl DailySimulationIterator {
    pub fn new(deck: Deck, current_time: DateTime<Utc>) -> Self {
        let logical_clock = deck.last_applied().map(|(clock, _)| *clock).unwrap_or(0);
        Self {
            deck,
            current_time,
            event_index: 0,
            logical_clock,
        }
    }

    pub fn deck(&self) -> &Deck {
        &self.deck
    }

    fn apply(&mut self, event: DeckEvent) {
        self.logical_clock += 1;
        let timestamped = Timestamped {
            timestamp: self.current_time,
            logical_clock: self.logical_clock,
            within_device_events_index: self.event_index,
            event,
        };
        self.event_index += 1;
        self.deck = self
            .deck
            .clone()
            .apply_events([(SIMULATED_DEVICE, &timestamped)]);
    }

    pub fn next(mut self) -> (Self, Vec<Challenge>) {
        let mut day_challenges = Vec::new();

        // Process all due reviews for the day
        loop {
            let review_info = self.deck.get_review_info(&[], self.current_time);
            let Some(challenge) = review_info.next_challenge(&self.deck) else {
                break;
            };
            day_challenges.push(challenge.clone());

            // Answer the challenge, marking new flashcards as forgotten once
            let event = match challenge {
                Challenge::FlashCardReview {
                    indicator, is_new, ..
                } => {
                    let rating = if is_new {
                        Rating::Again
                    } else {
                        Rating::Remembered
                    };
                    self.deck.review_card(indicator, rating)
                }
                Challenge::TranslateComprehensibleSentence(TranslateComprehensibleSentence {
                    target_language,
                    ..
                }) => self.deck.translate_sentence_perfect(vec![], target_language),
                Challenge::TranscribeComprehensibleSentence(TranscribeComprehensibleSentence {
                    parts,
                    ..
                }) => {
                    let graded = parts
                        .into_iter()
                        .map(|part| match part {
                            transcription_challenge::Part::AskedToTranscribe { parts } => {
                                let submission = parts
                                    .iter()
                                    .map(|p| p.text.clone())
                                    .collect::<Vec<_>>()
                                    .join(" ");
                                transcription_challenge::PartGraded::AskedToTranscribe {
                                    submission,
                                    parts: parts
                                        .into_iter()
                                        .map(|p| transcription_challenge::PartGradedPart {
                                            heard: p,
                                            grade: transcription_challenge::WordGrade::Perfect {
                                                wrote: None,
                                            },
                                        })
                                        .collect(),
                                }
                            }
                            transcription_challenge::Part::Provided { part } => {
                                transcription_challenge::PartGraded::Provided { part }
                            }
                        })
                        .collect();
                    self.deck.transcribe_sentence(graded)
                }
            };

            match event {
                Some(event) => self.apply(event),
                None => {
                    log::warn!("Simulated challenge produced no event; ending the day early");
                    break;
                }
            }
        }

        let new_cards = self.deck.config.new_cards_per_day_in_simulation;
        if let Some(event) = self.deck.add_next_unknown_cards(None, new_cards, &[]) {
            self.apply(event);
        }

        // Advance to next day
        self.current_time += Duration::days(1);

        (self, day_challenges)
    }
}

impl Deck {
    /// Simulates a learner who answers everything correctly, starting at `start_time`.
    /// Each step of the iterator is one day; new cards are added at the end of each day.
    pub fn simulate_usage(&self, start_time: DateTime<Utc>) -> DailySimulationIterator {
        DailySimulationIterator::new(self.clone(), start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::tests::{french_deck, t0};

    #[test]
    fn test_simulator_is_deterministic() {
        let mut results = Vec::new();

        for _ in 0..3 {
            let mut simulator = french_deck().simulate_usage(t0());

            let mut challenges_per_day = Vec::new();
            for _ in 0..5 {
                let (next_sim, challenges) = simulator.next();
                simulator = next_sim;
                challenges_per_day.push(challenges);
            }

            results.push((challenges_per_day, simulator.deck().snapshot()));
        }

        assert_eq!(results[0], results[1], "First and second simulation runs differ");
        assert_eq!(results[1], results[2], "Second and third simulation runs differ");
    }

    #[test]
    fn simulated_learner_adds_and_reviews_cards() {
        let simulator = french_deck().simulate_usage(t0());
        let (simulator, first_day) = simulator.next();
        // the deck starts empty
        assert!(first_day.is_empty());
        assert!(simulator.deck().num_cards() > 0);

        let (simulator, second_day) = simulator.next();
        assert!(!second_day.is_empty());
        assert!(simulator.deck().get_total_reviews() > 0);
    }
}
