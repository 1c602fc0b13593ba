mod common;

use chrono::Duration;
use common::{empty_deck, french, pack, stamped, t0, vocab};
use language_utils::{Language, PartOfSpeech};
use weapon::data_model::{EventStore, Timestamped};
use yap_deck::deck::DeckSnapshot;
use yap_deck::{
    CardState, Context, Deck, DeckEvent, DeckState, EngineConfig, LanguageEvent,
    LanguageEventContent, Rating,
};

fn add(cards: Vec<yap_deck::CardIndicator>) -> DeckEvent {
    french(LanguageEventContent::AddCards { cards })
}

fn review(card: &yap_deck::CardIndicator, rating: Rating) -> DeckEvent {
    french(LanguageEventContent::ReviewCard {
        reviewed: card.clone(),
        rating,
    })
}

fn fold(events: &[(&str, Timestamped<DeckEvent>)]) -> Deck {
    empty_deck().apply_events(events.iter().map(|(device, event)| (*device, event)))
}

/// One device adding a card and reviewing it `ratings.len()` times, a minute apart.
fn history(ratings: &[Rating]) -> Vec<(&'static str, Timestamped<DeckEvent>)> {
    let pomme = vocab("pomme", PartOfSpeech::Noun);
    let mut events = vec![("a", stamped(0, 1, t0(), add(vec![pomme.clone()])))];
    for (i, rating) in ratings.iter().enumerate() {
        let index = i + 1;
        events.push((
            "a",
            stamped(
                index,
                index as u64 + 1,
                t0() + Duration::minutes(index as i64),
                review(&pomme, *rating),
            ),
        ));
    }
    events
}

#[test]
fn replaying_the_same_events_gives_the_same_deck() {
    let events = history(&[Rating::Again, Rating::Good, Rating::Hard]);
    assert_eq!(fold(&events).snapshot(), fold(&events).snapshot());
}

#[test]
fn applying_an_event_twice_changes_nothing() {
    let events = history(&[Rating::Again, Rating::Good]);
    let once = fold(&events);

    let mut doubled = events.clone();
    doubled.extend(events.iter().cloned());
    let twice = fold(&doubled);

    assert_eq!(once.snapshot(), twice.snapshot());
    assert_eq!(twice.get_total_reviews(), 2);
}

#[test]
fn independent_cards_fold_the_same_in_either_order() {
    let pomme = vocab("pomme", PartOfSpeech::Noun);
    let la = vocab("la", PartOfSpeech::Det);
    let pomme_added = ("a", stamped(0, 1, t0(), add(vec![pomme.clone()])));
    let pomme_failed = (
        "a",
        stamped(1, 2, t0() + Duration::minutes(2), review(&pomme, Rating::Again)),
    );
    let la_added = ("b", stamped(0, 1, t0() + Duration::minutes(1), add(vec![la.clone()])));
    let la_passed = (
        "b",
        stamped(1, 2, t0() + Duration::minutes(3), review(&la, Rating::Good)),
    );

    let a_then_b = fold(&[
        pomme_added.clone(),
        pomme_failed.clone(),
        la_added.clone(),
        la_passed.clone(),
    ]);
    let b_then_a = fold(&[la_added, la_passed, pomme_added, pomme_failed]);
    assert_eq!(a_then_b.snapshot(), b_then_a.snapshot());
    assert_eq!(a_then_b.num_cards(), 2);
    assert_eq!(a_then_b.get_total_reviews(), 2);
}

/// Merges each device's batch into a fresh store, in the order given, and folds the result.
fn merged(deliveries: [(&str, &[Timestamped<DeckEvent>]); 2]) -> DeckSnapshot {
    let mut store = EventStore::<String, String>::default();
    for (device, events) in deliveries {
        store.add_device_events("reviews".to_string(), device.to_string(), events.to_vec(), None);
    }
    store
        .get::<DeckEvent>("reviews".to_string())
        .unwrap()
        .state::<Deck>(DeckState::new(
            Context {
                language_pack: pack(),
                target_language: Language::French,
                native_language: Language::English,
            },
            EngineConfig::default(),
        ))
        .snapshot()
}

#[test]
fn delivery_order_does_not_change_the_deck() {
    let pomme = vocab("pomme", PartOfSpeech::Noun);
    let la = vocab("la", PartOfSpeech::Det);
    let from_a = vec![
        stamped(0, 1, t0(), add(vec![pomme.clone()])),
        stamped(1, 3, t0() + Duration::minutes(3), review(&pomme, Rating::Again)),
    ];
    let from_b = vec![
        stamped(
            0,
            2,
            t0() + Duration::minutes(1),
            add(vec![la.clone(), pomme.clone()]),
        ),
        stamped(1, 4, t0() + Duration::minutes(2), review(&pomme, Rating::Good)),
    ];

    let a_first = merged([("a", from_a.as_slice()), ("b", from_b.as_slice())]);
    let b_first = merged([("b", from_b.as_slice()), ("a", from_a.as_slice())]);
    assert_eq!(a_first, b_first);
    assert_eq!(a_first.cards.len(), 2);
    // the add with the lower logical clock decides the tie-break position
    let pomme_snapshot = a_first.cards.iter().find(|card| card.indicator == pomme).unwrap();
    assert_eq!(pomme_snapshot.added_order.device_id, "a");
    assert_eq!(pomme_snapshot.review_count, 2);
}

#[test]
fn card_state_never_moves_backwards() {
    let pomme = vocab("pomme", PartOfSpeech::Noun);
    let ratings = [
        Rating::Again,
        Rating::Good,
        Rating::Easy,
        Rating::Again,
        Rating::Hard,
        Rating::Good,
    ];
    let events = history(&ratings);

    let mut deck = empty_deck();
    let mut previous = CardState::New;
    for (device, event) in &events {
        deck = deck.apply_events([(*device, event)]);
        let card = deck.card(&pomme).unwrap();
        assert!(card.state() >= previous, "{:?} after {:?}", card.state(), previous);
        assert!(card.due() >= event.timestamp);
        previous = card.state();
    }
}

#[test]
fn consecutive_failures_make_a_leech() {
    let pomme = vocab("pomme", PartOfSpeech::Noun);
    let threshold = EngineConfig::default().leech_consecutive_failures as usize;

    let deck = fold(&history(&[Rating::Again].repeat(threshold - 1)));
    assert_ne!(deck.card(&pomme).unwrap().state(), CardState::Leech);

    let mut ratings = vec![Rating::Again; threshold];
    ratings.push(Rating::Easy);
    let deck = fold(&history(&ratings));
    assert_eq!(deck.card(&pomme).unwrap().state(), CardState::Leech);
    assert_eq!(deck.get_leeches().len(), 1);

    let far_future = t0() + Duration::days(365);
    let review_info = deck.get_review_info(&[], far_future);
    assert!(!review_info.due_cards().contains(&pomme));
}

#[test]
fn events_for_another_course_leave_the_cards_alone() {
    let spanish = DeckEvent::Language(LanguageEvent {
        target_language: Language::Spanish,
        native_language: Language::English,
        content: LanguageEventContent::AddCards {
            cards: vec![vocab("pomme", PartOfSpeech::Noun)],
        },
    });
    let deck = fold(&[("a", stamped(0, 1, t0(), spanish))]);
    assert_eq!(deck.num_cards(), 0);
    assert_eq!(deck.stats().other_language_events, 1);
}
