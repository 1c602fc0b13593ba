use std::collections::BTreeSet;

use im::OrdSet;
use language_utils::Lexeme;

use crate::deck::{Context, Deck};
use crate::events::{CARD_TYPES, CardIndicator, CardType, ChallengeRequirements};

/// Which cards the learner is willing to add.
pub(crate) enum AllowedCards {
    Type(CardType),
    /// Any type whose challenges are not banned.
    BannedRequirements(BTreeSet<ChallengeRequirements>),
}

/// The cards worth adding next, most useful first. Each card yielded counts as added for the
/// rest of the iteration, so `take(n)` never yields the same card twice.
pub(crate) struct NextCardsIterator<'a> {
    added: OrdSet<CardIndicator>,
    permitted_types: Vec<CardType>,
    context: &'a Context,
}

impl<'a> NextCardsIterator<'a> {
    pub fn new(deck: &'a Deck, allowed_cards: AllowedCards) -> Self {
        let permitted_types = match allowed_cards {
            AllowedCards::Type(card_type) => vec![card_type],
            AllowedCards::BannedRequirements(banned) => CARD_TYPES
                .into_iter()
                .filter(|card_type| !banned.contains(&card_type.challenge_type()))
                .collect(),
        };
        Self {
            added: deck
                .added_cards()
                .map(|(indicator, _)| indicator.clone())
                .collect(),
            permitted_types,
            context: &deck.context,
        }
    }

    fn count_added(&self, card_type: CardType) -> usize {
        self.added
            .iter()
            .filter(|card| card.card_type() == card_type)
            .count()
    }

    fn next_text_card(&self) -> Option<CardIndicator> {
        // None of the first 20 cards can be multiword cards
        let added_over_20_cards = self.added.len() > 20;

        self.context
            .language_pack
            .words
            .iter()
            .filter(|lexeme| added_over_20_cards || lexeme.multiword().is_none())
            .map(|lexeme| CardIndicator::TargetLanguage {
                lexeme: lexeme.clone(),
            })
            .find(|card| !self.added.contains(card))
    }

    fn next_listening_card(&self) -> Option<CardIndicator> {
        let known_words: BTreeSet<&Lexeme> = self
            .added
            .iter()
            .filter_map(CardIndicator::target_language)
            .collect();

        let pack = &self.context.language_pack;
        pack.pronunciations
            .iter()
            // only pronunciations of at least one word the learner already knows
            .filter(|pronunciation| {
                pack.pronunciation_to_lexemes(pronunciation)
                    .any(|lexeme| known_words.contains(lexeme))
            })
            .map(|pronunciation| CardIndicator::ListeningHomophonous {
                pronunciation: pronunciation.clone(),
            })
            .find(|card| !self.added.contains(card))
    }

    fn next_letter_pronunciation_card(&self) -> Option<CardIndicator> {
        self.context
            .language_pack
            .pronunciation_guides
            .iter()
            .map(|guide| CardIndicator::LetterPronunciation {
                pattern: guide.pattern.clone(),
                position: guide.position,
            })
            .find(|card| !self.added.contains(card))
    }

    fn next_card_of_type(&self, card_type: CardType) -> Option<CardIndicator> {
        match card_type {
            CardType::TargetLanguage => self.next_text_card(),
            CardType::Listening => self.next_listening_card(),
            CardType::LetterPronunciation => self.next_letter_pronunciation_card(),
        }
    }

    fn next_card(&self) -> Option<CardIndicator> {
        match self.permitted_types.as_slice() {
            [] => return None,
            [card_type] => return self.next_card_of_type(*card_type),
            _ => {}
        }
        let permitted = |card_type: &CardType| self.permitted_types.contains(card_type);

        // a new learner starts with vocabulary only
        if self.added.len() < 20 && permitted(&CardType::TargetLanguage) {
            return self.next_text_card();
        }

        let text_count = self.count_added(CardType::TargetLanguage);
        let listening_count = self.count_added(CardType::Listening);
        let (desired, other) = if listening_count < text_count / 2 {
            (CardType::Listening, CardType::TargetLanguage)
        } else {
            (CardType::TargetLanguage, CardType::Listening)
        };

        [desired, other, CardType::LetterPronunciation]
            .iter()
            .filter(|card_type| permitted(*card_type))
            .find_map(|card_type| self.next_card_of_type(*card_type))
    }
}

impl Iterator for NextCardsIterator<'_> {
    type Item = CardIndicator;

    fn next(&mut self) -> Option<Self::Item> {
        let card = self.next_card()?;
        self.added.insert(card.clone());
        Some(card)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::tests::{at, french, french_deck, t0, vocab};
    use crate::events::LanguageEventContent;
    use language_utils::PartOfSpeech;

    #[test]
    fn words_come_in_frequency_order_without_repeats() {
        let deck = french_deck();
        let cards: Vec<_> = deck
            .next_unknown_cards(AllowedCards::Type(CardType::TargetLanguage))
            .collect();
        // the multiword expression waits until the deck has grown
        assert_eq!(cards.len(), 8);
        assert_eq!(cards[0], vocab("le", PartOfSpeech::Det));
        assert_eq!(cards[1], vocab("chat", PartOfSpeech::Noun));
    }

    #[test]
    fn listening_cards_need_a_known_word() {
        let deck = french_deck();
        assert_eq!(
            deck.next_unknown_cards(AllowedCards::Type(CardType::Listening))
                .count(),
            0
        );

        let event = at(
            0,
            1,
            t0(),
            french(LanguageEventContent::AddCards {
                cards: vec![vocab("verre", PartOfSpeech::Noun)],
            }),
        );
        let deck = deck.apply_events([("a", &event)]);
        let listening: Vec<_> = deck
            .next_unknown_cards(AllowedCards::Type(CardType::Listening))
            .collect();
        assert_eq!(
            listening,
            vec![CardIndicator::ListeningHomophonous {
                pronunciation: "vɛʁ".to_string()
            }]
        );
    }

    #[test]
    fn letter_pronunciations_follow_guide_frequency() {
        let deck = french_deck();
        let cards: Vec<_> = deck
            .next_unknown_cards(AllowedCards::Type(CardType::LetterPronunciation))
            .collect();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].letter_pronunciation(), Some(&"ch".to_string()));
    }

    #[test]
    fn everything_banned_means_nothing_to_add() {
        let deck = french_deck();
        let banned = [
            ChallengeRequirements::Text,
            ChallengeRequirements::Listening,
            ChallengeRequirements::Speaking,
        ];
        assert!(deck
            .next_unknown_cards(AllowedCards::BannedRequirements(banned.into_iter().collect()))
            .next()
            .is_none());
    }
}
