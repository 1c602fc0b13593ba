//! Warms the audio cache for the challenges the learner is likely to see soon.
//!
//! The upcoming challenges come from simulating the next few days of usage. Prefetching only
//! reads the deck, so cancelling it halfway leaves nothing inconsistent behind.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use futures::future::{AbortHandle, Abortable};

use crate::deck::Deck;
use crate::scheduler::AudioRequest;

/// Requests at most this many clips at once.
const CONCURRENT_FETCHES: usize = 3;

/// Fetches (and caches) synthesized audio. Implemented by the host.
#[allow(async_fn_in_trait)]
pub trait AudioFetcher {
    type Error: std::fmt::Display;

    async fn fetch(&self, request: &AudioRequest) -> Result<(), Self::Error>;
}

/// Fetches the audio of every challenge in the next `days` simulated days.
/// Returns the requests that were fetched successfully.
pub async fn prefetch_challenge_audio<F: AudioFetcher>(
    deck: &Deck,
    fetcher: &F,
    start_time: DateTime<Utc>,
    days: u32,
) -> BTreeSet<AudioRequest> {
    let mut requested = BTreeSet::new();
    let mut fetched = BTreeSet::new();
    let mut simulation = deck.simulate_usage(start_time);

    for _ in 0..days {
        let challenges;
        (simulation, challenges) = simulation.next();

        let requests: Vec<AudioRequest> = challenges
            .iter()
            .filter_map(|challenge| challenge.audio_request())
            .filter(|request| requested.insert(request.clone()))
            .collect();

        fetched.extend(
            futures::stream::iter(requests)
                .map(|request| async move {
                    match fetcher.fetch(&request).await {
                        Ok(()) => Some(request),
                        Err(e) => {
                            // one missing clip is not worth failing the rest for
                            log::warn!("Failed to prefetch audio for {:?}: {e}", request.text);
                            None
                        }
                    }
                })
                .buffered(CONCURRENT_FETCHES)
                .filter_map(|fetched| async { fetched })
                .collect::<Vec<_>>()
                .await,
        );
    }

    log::info!("Prefetched {} audio clip(s)", fetched.len());
    fetched
}

/// A prefetch running in the background. Dropping the handle cancels it.
pub struct PrefetchHandle {
    abort: AbortHandle,
    done: Option<futures::channel::oneshot::Receiver<BTreeSet<AudioRequest>>>,
}

impl PrefetchHandle {
    /// Starts prefetching on the current `LocalSet`.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn spawn<F: AudioFetcher + 'static>(
        deck: Deck,
        fetcher: F,
        start_time: DateTime<Utc>,
        days: u32,
    ) -> Self {
        let (abort, registration) = AbortHandle::new_pair();
        let (sender, done) = futures::channel::oneshot::channel();
        let task = Abortable::new(
            async move {
                let fetched = prefetch_challenge_audio(&deck, &fetcher, start_time, days).await;
                let _ = sender.send(fetched);
            },
            registration,
        );
        tokio::task::spawn_local(async move {
            if task.await.is_err() {
                log::debug!("Audio prefetch cancelled");
            }
        });
        Self {
            abort,
            done: Some(done),
        }
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Waits for the prefetch to finish. `None` if it was cancelled.
    pub async fn finished(&mut self) -> Option<BTreeSet<AudioRequest>> {
        self.done.take()?.await.ok()
    }
}

impl Drop for PrefetchHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::tests::{french_deck, t0};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct RecordingFetcher {
        fetched: Rc<RefCell<Vec<AudioRequest>>>,
    }

    impl AudioFetcher for RecordingFetcher {
        type Error = String;

        async fn fetch(&self, request: &AudioRequest) -> Result<(), Self::Error> {
            if request.text == "chat" {
                return Err("tts unavailable".to_string());
            }
            self.fetched.borrow_mut().push(request.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn prefetches_each_clip_once_and_skips_failures() {
        let fetcher = RecordingFetcher::default();
        let fetched = prefetch_challenge_audio(&french_deck(), &fetcher, t0(), 3).await;

        let recorded = fetcher.fetched.borrow().clone();
        assert!(!fetched.is_empty());
        assert_eq!(recorded.len(), fetched.len());
        assert!(fetched.iter().all(|request| request.text != "chat"));
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels_the_prefetch() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let fetcher = RecordingFetcher::default();
                let mut handle = PrefetchHandle::spawn(french_deck(), fetcher.clone(), t0(), 3);
                handle.cancel();
                assert!(handle.is_cancelled());
                assert_eq!(handle.finished().await, None);
                assert!(fetcher.fetched.borrow().is_empty());
            })
            .await;
    }
}
