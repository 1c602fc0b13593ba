#![deny(clippy::string_slice)]

pub mod config;
pub mod deck;
pub mod deck_selection;
pub mod engine;
pub mod events;
pub mod language_pack;
pub mod movie_cache;
mod next_cards;
pub mod prefetch;
pub mod scheduler;
pub mod simulation;

use std::sync::LazyLock;

pub use config::EngineConfig;
pub use deck::{CardData, CardState, CardSummary, Context, Deck, DeckState, Stats};
pub use deck_selection::{DeckSelection, DeckSelectionEvent};
pub use engine::{Engine, EngineError};
pub use events::{
    CardIndicator, CardType, ChallengeRequirements, DeckEvent, LanguageEvent, LanguageEventContent,
    Rating,
};
pub use language_pack::{LanguageDataError, LanguagePack, LanguagePackData, LanguagePackSource};
pub use scheduler::{Challenge, ReviewInfo};
pub use simulation::DailySimulationIterator;

/// The stream holding every deck event, across all language pairs.
pub const REVIEWS_STREAM: &str = "reviews";
/// The stream holding the learner's language selection.
pub const DECK_SELECTION_STREAM: &str = "deck_selection";

pub fn get_available_courses() -> Vec<language_utils::Course> {
    language_utils::COURSES.to_vec()
}

// putting this inside LOGGER prevents us from accidentally initializing the logger more than once
#[allow(clippy::declare_interior_mutable_const)]
const LOGGER: LazyLock<()> = LazyLock::new(|| {
    // a host that installed its own logger keeps it
    if env_logger::Builder::from_default_env().try_init().is_ok() {
        log::info!("Logging initialized");
    }
});

/// Installs `env_logger` (configured through `RUST_LOG`) unless a logger is already set.
pub fn init_logging() {
    #[allow(clippy::borrow_interior_mutable_const)]
    *LOGGER;
}
