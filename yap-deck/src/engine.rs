//! The engine a UI talks to: one event store, the language packs it has loaded, and the
//! deck folded from the `reviews` stream.
//!
//! Everything here runs on one thread. Listener callbacks are always invoked outside any
//! borrow of the store, so they may call straight back into the engine.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use language_utils::{Course, Language, Lexeme, transcription_challenge};
use weapon::cross_tab::{CrossTabMessage, TabBus, TabChannel};
use weapon::data_model::{EventStore, ListenerKey, SyncState, SyncTarget, Timestamped};
use weapon::persistence::{EventLog, LocalSyncResult, PersistenceError};
use weapon::replicator::{IngestOutcome, RemoteError, RemoteRow, RemoteStore};

use crate::config::EngineConfig;
use crate::deck::{CardSummary, Context, Deck, DeckState, UpcomingReviewStats};
use crate::deck_selection::{DeckSelection, DeckSelectionEvent};
use crate::events::{CardIndicator, CardType, ChallengeRequirements, DeckEvent, Rating};
use crate::language_pack::{LanguageDataError, LanguagePack, LanguagePackSource, MovieMetadata};
use crate::movie_cache::MovieCache;
use crate::prefetch::AudioFetcher;
use crate::scheduler::{AddCardOptions, ChallengeBans, ReviewInfo};
use crate::{DECK_SELECTION_STREAM, REVIEWS_STREAM};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("local storage: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("remote store: {0}")]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    LanguageData(#[from] LanguageDataError),

    #[error("no language has been selected yet")]
    NoLanguageSelected,

    #[error("the language pack for {0:?} has not been loaded")]
    LanguagePackNotLoaded(Course),

    #[error("stream {0:?} holds a different kind of event")]
    StreamTypeMismatch(String),

    #[error("no user is logged in")]
    LoggedOut,
}

pub struct Engine<L: EventLog> {
    store: Rc<RefCell<EventStore<String, String>>>,
    event_log: L,
    user_id: Option<String>,
    /// The writer id claimed from `event_log`: the device id, unless another open engine
    /// already writes as it.
    device_id: String,
    config: EngineConfig,
    tab: Option<TabChannel>,

    language_packs: RefCell<BTreeMap<Course, Arc<LanguagePack>>>,
    /// The last deck built, extended in place while new events sort after it.
    hot_deck: RefCell<Option<Deck>>,
    movie_cache: RefCell<MovieCache>,
    bans: RefCell<ChallengeBans>,
}

#[cfg(not(target_arch = "wasm32"))]
impl Engine<weapon::fs_log::FsEventLog> {
    /// Opens the engine over the `.weapon` directory under `root`. Logging in for the first
    /// time on this device adopts whatever was recorded while logged out.
    pub async fn open(
        root: impl AsRef<std::path::Path>,
        user_id: Option<String>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let directory = weapon::fs_log::WeaponDirectory::open(root)
            .await
            .inspect_err(|e| log::error!("Error opening the weapon directory: {e:?}"))?;

        if let Some(user_id) = &user_id {
            directory
                .import_logged_out_user_data(user_id)
                .await
                .inspect_err(|e| log::error!("Error importing logged out data: {e:?}"))?;
        }

        let device_id = directory
            .get_or_create_device_id(user_id.as_deref())
            .await
            .inspect_err(|e| log::error!("Error getting device ID: {e:?}"))?;
        let event_log = directory.user_log(user_id.as_deref());

        Ok(Self::new(event_log, user_id, device_id, config))
    }
}

impl<L: EventLog> Engine<L> {
    pub fn new(event_log: L, user_id: Option<String>, device_id: String, config: EngineConfig) -> Self {
        crate::init_logging();

        let writer_id = event_log.claim_writer(&device_id);
        log::info!(
            "Starting deck engine for device {device_id} as writer {writer_id} (user: {})",
            user_id.as_deref().unwrap_or("logged out")
        );
        let device_id = writer_id;

        Self {
            store: Rc::new(RefCell::new(EventStore::default())),
            event_log,
            user_id,
            device_id,
            config,
            tab: None,
            language_packs: RefCell::new(BTreeMap::new()),
            hot_deck: RefCell::new(None),
            movie_cache: RefCell::new(MovieCache::default()),
            bans: RefCell::new(ChallengeBans::default()),
        }
    }

    /// Joins the tabs sharing this engine's local storage. Saves are announced to them, and
    /// [`Engine::process_cross_tab_messages`] picks up theirs.
    pub fn with_cross_tab(mut self, bus: &TabBus) -> Self {
        self.tab = Some(bus.join());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_log(&self) -> &L {
        &self.event_log
    }

    // =======
    // streams and listeners
    // =======

    pub fn subscribe_to_stream(&self, stream_id: String, callback: impl Fn() + 'static) -> ListenerKey {
        let _flusher = FlushLater::new(self);

        self.store
            .borrow_mut()
            .register_listener(move |_, event_stream_id| {
                if event_stream_id == stream_id {
                    callback();
                }
            })
    }

    pub fn unsubscribe(&self, key: ListenerKey) {
        self.store.borrow_mut().unregister_listener(key)
    }

    pub fn request_reviews(&self) {
        // a new stream can trigger listeners
        let _flusher = FlushLater::new(self);
        self.store
            .borrow_mut()
            .get_or_insert_default::<DeckEvent>(REVIEWS_STREAM.to_string(), None);
    }

    pub fn request_deck_selection(&self) {
        let _flusher = FlushLater::new(self);
        self.store
            .borrow_mut()
            .get_or_insert_default::<DeckSelectionEvent>(DECK_SELECTION_STREAM.to_string(), None);
    }

    /// `None` until the stream has been loaded from local storage at least once, so a UI
    /// can tell "still loading" apart from "empty".
    pub fn get_stream_num_events(&self, stream_id: &str) -> Option<usize> {
        let store = self.store.borrow();
        if !store.loaded_at_least_once(&stream_id.to_string()) {
            return None;
        }
        store.get_raw(stream_id.to_string()).map(|s| s.num_events())
    }

    pub fn num_events(&self) -> usize {
        self.store
            .borrow()
            .vector_clock()
            .values()
            .map(|device_counts| device_counts.values().sum::<usize>())
            .sum()
    }

    pub fn get_sync_state(&self, target: SyncTarget) -> SyncState<String, String> {
        self.store
            .borrow()
            .sync_state(target)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_timestamp_of_earliest_unsynced_event(&self, target: SyncTarget) -> Option<DateTime<Utc>> {
        self.store
            .borrow()
            .get_timestamp_of_earliest_unsynced_event(target)
    }

    // =======
    // language selection and packs
    // =======

    pub fn get_deck_selection_state(&self) -> Option<DeckSelection> {
        let store = self.store.borrow();
        store
            .get::<DeckSelectionEvent>(DECK_SELECTION_STREAM.to_string())
            .map(|s| s.state(DeckSelection::default()))
    }

    /// The selected course. Selections written before the native language was chosen
    /// assumed an English speaker.
    pub fn current_course(&self) -> Result<Course, EngineError> {
        let selection = self.get_deck_selection_state().unwrap_or_default();
        let target_language = selection
            .target_language
            .ok_or(EngineError::NoLanguageSelected)?;
        Ok(Course {
            native_language: selection.native_language.unwrap_or(Language::English),
            target_language,
        })
    }

    pub fn select_languages(
        &self,
        native_language: Language,
        target_language: Language,
    ) -> Result<Timestamped<DeckSelectionEvent>, EngineError> {
        let _flusher = FlushLater::new(self);
        log::info!("Selecting {target_language} for {native_language} speakers");
        self.store
            .borrow_mut()
            .add_raw_event(
                DECK_SELECTION_STREAM.to_string(),
                self.device_id.clone(),
                DeckSelectionEvent::SelectLanguages {
                    native_language,
                    target_language,
                },
                None,
            )
            .ok_or_else(|| EngineError::StreamTypeMismatch(DECK_SELECTION_STREAM.to_string()))
    }

    /// Fetches the pack for `course` unless it is already loaded.
    pub async fn load_language_pack<S: LanguagePackSource>(
        &self,
        source: &S,
        course: Course,
    ) -> Result<Arc<LanguagePack>, EngineError> {
        if let Some(pack) = self.language_packs.borrow().get(&course) {
            return Ok(Arc::clone(pack));
        }

        let data = source
            .fetch(course)
            .await
            .inspect_err(|e| log::error!("Failed to load language pack for {course:?}: {e}"))?;
        let pack = Arc::new(LanguagePack::new(course, data));
        Ok(self.insert_language_pack(pack))
    }

    /// Makes `pack` the pack of its course. Decks built on a previous pack are rebuilt.
    pub fn insert_language_pack(&self, pack: Arc<LanguagePack>) -> Arc<LanguagePack> {
        self.language_packs
            .borrow_mut()
            .insert(pack.course, Arc::clone(&pack));
        pack
    }

    // =======
    // the deck
    // =======

    /// The deck of the current course, with every event of the `reviews` stream applied.
    pub fn deck(&self) -> Result<Deck, EngineError> {
        self.with_deck(Deck::clone)
    }

    fn with_deck<T>(&self, f: impl FnOnce(&Deck) -> T) -> Result<T, EngineError> {
        let course = self.current_course()?;
        let pack = self
            .language_packs
            .borrow()
            .get(&course)
            .cloned()
            .ok_or(EngineError::LanguagePackNotLoaded(course))?;

        let mut hot_deck = self.hot_deck.borrow_mut();
        let deck = match hot_deck.take() {
            Some(deck)
                if Arc::ptr_eq(&deck.context().language_pack, &pack)
                    && deck.context().native_language == course.native_language =>
            {
                deck
            }
            _ => Deck::new(self.context(course, pack.clone()), self.config.clone()),
        };
        let deck = self.refresh(deck, course, pack);
        let result = f(&deck);
        *hot_deck = Some(deck);
        Ok(result)
    }

    fn context(&self, course: Course, language_pack: Arc<LanguagePack>) -> Context {
        Context {
            language_pack,
            target_language: course.target_language,
            native_language: course.native_language,
        }
    }

    /// Brings `deck` up to date with the stream. Events that sort after everything already
    /// applied are folded in directly; anything earlier (a merge from another device) means
    /// replaying the whole stream.
    fn refresh(&self, deck: Deck, course: Course, pack: Arc<LanguagePack>) -> Deck {
        let store = self.store.borrow();
        let Some(stream) = store.get::<DeckEvent>(REVIEWS_STREAM.to_string()) else {
            return deck;
        };
        if deck.applied_count() == stream.num_events() {
            return deck;
        }

        let pending: Vec<(&str, &Timestamped<DeckEvent>)> = stream
            .iter_with_device()
            .filter(|(device, event)| !deck.has_applied(device, event.within_device_events_index))
            .map(|(device, event)| (device.as_str(), event))
            .collect();

        let out_of_order = match (pending.first(), deck.last_applied()) {
            (Some((device, event)), Some((clock, last_device))) => {
                (event.logical_clock, *device) < (*clock, last_device.as_str())
            }
            _ => false,
        };

        if out_of_order {
            log::debug!("Merged events sort before the deck's latest; rebuilding");
            stream.state::<Deck>(DeckState::new(self.context(course, pack), self.config.clone()))
        } else {
            deck.apply_events(pending)
        }
    }

    pub fn get_review_info(&self, now: DateTime<Utc>) -> Result<ReviewInfo, EngineError> {
        let banned = self.banned_challenge_types(now);
        self.with_deck(|deck| deck.get_review_info(&banned, now))
    }

    pub fn add_card_options(&self, now: DateTime<Utc>) -> Result<AddCardOptions, EngineError> {
        let banned = self.banned_challenge_types(now);
        self.with_deck(|deck| deck.add_card_options(&banned))
    }

    pub fn get_all_cards_summary(&self) -> Result<Vec<CardSummary>, EngineError> {
        self.with_deck(Deck::get_all_cards_summary)
    }

    pub fn get_leeches(&self) -> Result<Vec<CardSummary>, EngineError> {
        self.with_deck(Deck::get_leeches)
    }

    pub fn num_cards(&self) -> Result<usize, EngineError> {
        self.with_deck(Deck::num_cards)
    }

    pub fn get_total_reviews(&self) -> Result<u64, EngineError> {
        self.with_deck(Deck::get_total_reviews)
    }

    pub fn get_xp(&self) -> Result<f64, EngineError> {
        self.with_deck(Deck::get_xp)
    }

    pub fn get_daily_streak(&self, now: DateTime<Utc>) -> Result<u32, EngineError> {
        self.with_deck(|deck| deck.get_daily_streak(now))
    }

    pub fn get_percent_of_words_known(&self) -> Result<f64, EngineError> {
        self.with_deck(Deck::get_percent_of_words_known)
    }

    pub fn get_past_week_challenge_average(&self, now: DateTime<Utc>) -> Result<f64, EngineError> {
        self.with_deck(|deck| deck.get_past_week_challenge_average(now))
    }

    pub fn get_upcoming_week_review_stats(
        &self,
        now: DateTime<Utc>,
    ) -> Result<UpcomingReviewStats, EngineError> {
        self.with_deck(|deck| deck.get_upcoming_week_review_stats(now))
    }

    pub fn get_movie_metadata(&self, movie_ids: &[String]) -> Result<Vec<MovieMetadata>, EngineError> {
        self.with_deck(|deck| {
            self.movie_cache
                .borrow_mut()
                .get_movie_metadata(&deck.context().language_pack, movie_ids)
        })
    }

    // =======
    // commands
    // =======

    /// Appends an event to the `reviews` stream and notifies its listeners.
    pub fn add_deck_event(&self, event: DeckEvent) -> Result<Timestamped<DeckEvent>, EngineError> {
        self.add_deck_event_at(event, Utc::now())
    }

    pub fn add_deck_event_at(
        &self,
        event: DeckEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<Timestamped<DeckEvent>, EngineError> {
        let _flusher = FlushLater::new(self);
        self.store
            .borrow_mut()
            .add_raw_event_at(
                REVIEWS_STREAM.to_string(),
                self.device_id.clone(),
                event,
                timestamp,
                None,
            )
            .ok_or_else(|| EngineError::StreamTypeMismatch(REVIEWS_STREAM.to_string()))
    }

    /// Builds an event from the current deck and appends it. `Ok(None)` when the deck had
    /// nothing to record.
    fn commit(
        &self,
        command: impl FnOnce(&Deck) -> Option<DeckEvent>,
    ) -> Result<Option<Timestamped<DeckEvent>>, EngineError> {
        match self.with_deck(command)? {
            Some(event) => self.add_deck_event(event).map(Some),
            None => Ok(None),
        }
    }

    pub fn add_next_unknown_cards(
        &self,
        card_type: Option<CardType>,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Timestamped<DeckEvent>>, EngineError> {
        let banned = self.banned_challenge_types(now);
        self.commit(|deck| deck.add_next_unknown_cards(card_type, count, &banned))
    }

    pub fn review_card(
        &self,
        reviewed: CardIndicator,
        rating: Rating,
    ) -> Result<Option<Timestamped<DeckEvent>>, EngineError> {
        self.commit(|deck| deck.review_card(reviewed, rating))
    }

    pub fn translate_sentence_perfect(
        &self,
        words_tapped: Vec<Lexeme>,
        challenge_sentence: String,
    ) -> Result<Option<Timestamped<DeckEvent>>, EngineError> {
        self.commit(|deck| deck.translate_sentence_perfect(words_tapped, challenge_sentence))
    }

    pub fn translate_sentence_wrong(
        &self,
        challenge_sentence: String,
        submission: String,
        words_remembered: Vec<Lexeme>,
        words_forgotten: Vec<Lexeme>,
        words_tapped: Vec<Lexeme>,
    ) -> Result<Option<Timestamped<DeckEvent>>, EngineError> {
        self.commit(|deck| {
            deck.translate_sentence_wrong(
                challenge_sentence,
                submission,
                words_remembered,
                words_forgotten,
                words_tapped,
            )
        })
    }

    pub fn transcribe_sentence(
        &self,
        challenge: Vec<transcription_challenge::PartGraded>,
    ) -> Result<Option<Timestamped<DeckEvent>>, EngineError> {
        self.commit(|deck| deck.transcribe_sentence(challenge))
    }

    pub fn ban_challenge_type(&self, requirement: ChallengeRequirements, now: DateTime<Utc>) {
        self.bans.borrow_mut().ban(requirement, now);
    }

    pub fn unban_challenge_type(&self, requirement: ChallengeRequirements) {
        self.bans.borrow_mut().unban(requirement);
    }

    pub fn banned_challenge_types(&self, now: DateTime<Utc>) -> Vec<ChallengeRequirements> {
        self.bans
            .borrow_mut()
            .active(now, self.config.challenge_ban_cooldown)
    }

    // =======
    // local storage and other tabs
    // =======

    /// Loads what other writers saved for `stream_id`, then saves this replica's events.
    /// Other tabs are told when anything was written.
    pub async fn sync(
        &self,
        stream_id: String,
        modifier: Option<ListenerKey>,
    ) -> Result<LocalSyncResult, EngineError> {
        let _flusher = FlushLater::new(self);

        let result = EventStore::sync_with_local_storage(
            &self.store,
            &self.event_log,
            Some(stream_id.clone()),
            modifier,
        )
        .await
        .inspect_err(|e| log::error!("Failed to sync {stream_id} with local storage: {e}"))?;

        if result.written > 0 {
            if let Some(tab) = &self.tab {
                tab.announce_written(&stream_id);
            }
        }
        log::debug!(
            "Synced {stream_id}: loaded {}, wrote {}",
            result.loaded,
            result.written
        );
        Ok(result)
    }

    /// Saves `stream_id` without loading first.
    pub async fn save(&self, stream_id: String) -> Result<usize, EngineError> {
        let written = match &self.tab {
            Some(tab) => {
                EventStore::save_and_announce(&self.store, &self.event_log, tab, stream_id).await?
            }
            None => EventStore::save_to_local_storage(&self.store, &self.event_log, stream_id).await?,
        };
        Ok(written)
    }

    pub async fn on_cross_tab_message(&self, message: &CrossTabMessage) -> Result<usize, EngineError> {
        let _flusher = FlushLater::new(self);
        let loaded =
            EventStore::handle_cross_tab_message(&self.store, &self.event_log, message, None).await?;
        Ok(loaded)
    }

    /// Reloads every stream another tab announced since the last call. Returns how many
    /// events were new.
    pub async fn process_cross_tab_messages(&mut self) -> Result<usize, EngineError> {
        let mut messages = Vec::new();
        if let Some(tab) = &mut self.tab {
            while let Some(message) = tab.try_recv() {
                messages.push(message);
            }
        }
        // announcements of the same stream collapse into one reload
        messages.dedup();

        let mut loaded = 0;
        for message in &messages {
            loaded += self.on_cross_tab_message(message).await?;
        }
        Ok(loaded)
    }

    // =======
    // remote
    // =======

    pub fn ingest_remote_row(&self, row: &RemoteRow) -> IngestOutcome {
        let _flusher = FlushLater::new(self);
        EventStore::ingest_remote_row(&self.store, row, &self.device_id, None)
    }

    pub async fn push_to_remote<R: RemoteStore>(&self, remote: &R) -> Result<usize, EngineError> {
        let user_id = self.user_id.as_deref().ok_or(EngineError::LoggedOut)?;
        let pushed = EventStore::push_unacknowledged(&self.store, remote, user_id)
            .await
            .inspect_err(|e| log::warn!("Push failed: {e}"))?;
        Ok(pushed)
    }

    pub async fn pull_from_remote<R: RemoteStore>(&self, remote: &R) -> Result<usize, EngineError> {
        let _flusher = FlushLater::new(self);
        let user_id = self.user_id.as_deref().ok_or(EngineError::LoggedOut)?;
        let added = EventStore::pull_missing(&self.store, remote, user_id, None).await?;
        Ok(added)
    }

    /// A replicator over this engine's store. Listeners hear about merged events as soon as
    /// the replicator adds them.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn replicator<R: RemoteStore + 'static>(
        &self,
        remote: Rc<R>,
    ) -> Result<weapon::replicator::Replicator<R>, EngineError> {
        let user_id = self.user_id.clone().ok_or(EngineError::LoggedOut)?;
        let store = Rc::clone(&self.store);
        Ok(
            weapon::replicator::Replicator::new(
                Rc::clone(&self.store),
                remote,
                user_id,
                self.device_id.clone(),
            )
            .with_after_merge(move || flush_store_notifications(&store)),
        )
    }

    // =======
    // background work
    // =======

    /// Pushes every [`EngineConfig::push_interval`] and merges rows from `rows` as they
    /// arrive, until the subscription ends. Must run within a `LocalSet`.
    #[cfg(not(target_arch = "wasm32"))]
    pub async fn replicate<R: RemoteStore + 'static>(
        &self,
        remote: Rc<R>,
        rows: impl futures::Stream<Item = RemoteRow> + Unpin,
    ) -> Result<(), EngineError> {
        let replicator = self.replicator(remote)?;
        let push = std::pin::pin!(replicator.run_push_loop(self.config.push_interval));
        let pull = std::pin::pin!(replicator.run_pull_loop(rows));
        // the push loop never finishes on its own
        futures::future::select(push, pull).await;
        Ok(())
    }

    /// Starts fetching the audio of the next few days of challenges on the current `LocalSet`.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn prefetch_audio<F: AudioFetcher + 'static>(
        &self,
        fetcher: F,
        now: DateTime<Utc>,
    ) -> Result<crate::prefetch::PrefetchHandle, EngineError> {
        let deck = self.deck()?;
        Ok(crate::prefetch::PrefetchHandle::spawn(
            deck,
            fetcher,
            now,
            self.config.prefetch_days,
        ))
    }

    /// Forgets the caches. The event store is kept.
    pub fn reset_caches(&self) {
        self.hot_deck.borrow_mut().take();
        self.movie_cache.borrow_mut().clear();
        *self.bans.borrow_mut() = ChallengeBans::default();
    }

    fn flush_notifications(&self) {
        flush_store_notifications(&self.store);
    }
}

impl<L: EventLog> Drop for Engine<L> {
    fn drop(&mut self) {
        self.event_log.release_writer(&self.device_id);
    }
}

fn flush_store_notifications(store: &RefCell<EventStore<String, String>>) {
    // collect first: the callbacks may borrow the store again
    let notifications = store.borrow_mut().drain_due_notifications();
    for notification in notifications {
        notification();
    }
}

struct FlushLater<'a, L: EventLog> {
    engine: &'a Engine<L>,
}

impl<'a, L: EventLog> FlushLater<'a, L> {
    fn new(engine: &'a Engine<L>) -> Self {
        Self { engine }
    }
}

impl<L: EventLog> Drop for FlushLater<'_, L> {
    fn drop(&mut self) {
        self.engine.flush_notifications();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::tests::{t0, vocab};
    use crate::language_pack::tests::sample_pack;
    use language_utils::PartOfSpeech;
    use std::cell::Cell;
    use weapon::persistence::MemoryEventLog;

    fn french_engine(device_id: &str) -> Engine<MemoryEventLog> {
        let engine = Engine::new(
            MemoryEventLog::default(),
            Some("user".to_string()),
            device_id.to_string(),
            EngineConfig::default(),
        );
        engine.request_reviews();
        engine.request_deck_selection();
        engine.insert_language_pack(sample_pack());
        engine
            .select_languages(Language::English, Language::French)
            .unwrap();
        engine
    }

    #[test]
    fn deck_needs_a_selected_language() {
        let engine = Engine::new(
            MemoryEventLog::default(),
            None,
            "device".to_string(),
            EngineConfig::default(),
        );
        assert!(matches!(engine.deck(), Err(EngineError::NoLanguageSelected)));

        engine.request_deck_selection();
        engine
            .select_languages(Language::English, Language::Spanish)
            .unwrap();
        assert!(matches!(
            engine.deck(),
            Err(EngineError::LanguagePackNotLoaded(_))
        ));
    }

    #[test]
    fn listeners_hear_appended_events() {
        let engine = french_engine("device");
        let calls = Rc::new(Cell::new(0));
        let key = engine.subscribe_to_stream(REVIEWS_STREAM.to_string(), {
            let calls = Rc::clone(&calls);
            move || calls.set(calls.get() + 1)
        });

        engine.add_next_unknown_cards(None, 1, t0()).unwrap();
        assert_eq!(calls.get(), 1);

        engine.unsubscribe(key);
        engine.add_next_unknown_cards(None, 1, t0()).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn listeners_can_call_back_into_the_engine() {
        let engine = Rc::new(french_engine("device"));
        let seen = Rc::new(Cell::new(0));
        engine.subscribe_to_stream(REVIEWS_STREAM.to_string(), {
            let engine = Rc::downgrade(&engine);
            let seen = Rc::clone(&seen);
            move || {
                if let Some(engine) = engine.upgrade() {
                    seen.set(engine.num_cards().unwrap());
                }
            }
        });
        engine.add_next_unknown_cards(None, 1, t0()).unwrap();
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn hot_deck_follows_appended_events() {
        let engine = french_engine("device");
        assert_eq!(engine.num_cards().unwrap(), 0);

        engine.add_next_unknown_cards(None, 1, t0()).unwrap();
        let le = vocab("le", PartOfSpeech::Det);
        assert!(engine.deck().unwrap().card(&le).is_some());

        engine.review_card(le, Rating::Remembered).unwrap();
        assert_eq!(engine.get_total_reviews().unwrap(), 1);
    }

    #[test]
    fn reviewing_a_card_not_in_the_deck_records_nothing() {
        let engine = french_engine("device");
        let event = engine
            .review_card(vocab("chat", PartOfSpeech::Noun), Rating::Again)
            .unwrap();
        assert!(event.is_none());
        assert_eq!(engine.get_stream_num_events(REVIEWS_STREAM), None);
        assert_eq!(engine.num_events(), 1);
    }

    #[test]
    fn banned_challenges_expire() {
        let engine = french_engine("device");
        engine.ban_challenge_type(ChallengeRequirements::Listening, t0());
        assert_eq!(
            engine.banned_challenge_types(t0()),
            vec![ChallengeRequirements::Listening]
        );
        let later = t0() + chrono::Duration::minutes(16);
        assert!(engine.banned_challenge_types(later).is_empty());
    }

    #[tokio::test]
    async fn sync_loads_what_another_engine_saved() {
        let first = french_engine("device-a");
        first.add_next_unknown_cards(None, 1, t0()).unwrap();
        first.sync(REVIEWS_STREAM.to_string(), None).await.unwrap();

        let second = Engine::new(
            first.event_log().clone(),
            Some("user".to_string()),
            "device-b".to_string(),
            EngineConfig::default(),
        );
        second.request_reviews();
        assert_eq!(second.get_stream_num_events(REVIEWS_STREAM), None);

        let result = second.sync(REVIEWS_STREAM.to_string(), None).await.unwrap();
        assert_eq!(result.loaded, 1);
        assert_eq!(second.get_stream_num_events(REVIEWS_STREAM), Some(1));
    }

    #[test]
    fn engines_sharing_a_device_id_write_as_different_writers() {
        let log = MemoryEventLog::default();
        let open = |log: &MemoryEventLog| {
            Engine::new(log.clone(), None, "device".to_string(), EngineConfig::default())
        };
        let first = open(&log);
        let second = open(&log);
        assert_eq!(first.device_id(), "device");
        assert_eq!(second.device_id(), "device.1");

        drop(first);
        assert_eq!(open(&log).device_id(), "device");
    }

    #[tokio::test]
    async fn replication_pushes_on_the_configured_interval() {
        use futures::StreamExt as _;
        use std::time::Duration;

        let config = EngineConfig {
            push_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let engine = Engine::new(
            MemoryEventLog::default(),
            Some("user".to_string()),
            "device".to_string(),
            config,
        );
        engine.request_reviews();
        engine.request_deck_selection();
        engine.insert_language_pack(sample_pack());
        engine
            .select_languages(Language::English, Language::French)
            .unwrap();

        let remote = Rc::new(weapon::replicator::MemoryRemote::default());
        // a subscription that ends after a while, which ends replication
        let rows = futures::stream::once(tokio::time::sleep(Duration::from_millis(200)))
            .filter_map(|()| futures::future::ready(None::<RemoteRow>));

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let add_card_later = async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    engine.add_next_unknown_cards(None, 1, t0()).unwrap();
                };
                let (replicated, ()) = futures::join!(
                    engine.replicate(Rc::clone(&remote), Box::pin(rows)),
                    add_card_later
                );
                replicated.unwrap();
            })
            .await;

        // the language selection on the first tick, the card on a later one
        assert_eq!(remote.rows().len(), 2);
    }

    #[tokio::test]
    async fn logged_out_engines_do_not_push() {
        let engine = Engine::new(
            MemoryEventLog::default(),
            None,
            "device".to_string(),
            EngineConfig::default(),
        );
        let remote = weapon::replicator::MemoryRemote::default();
        assert!(matches!(
            engine.push_to_remote(&remote).await,
            Err(EngineError::LoggedOut)
        ));
    }
}
