use language_utils::{Course, Language};
use weapon::data_model::{Event, Timestamped};

/// Which language pair the learner is studying. Lives in its own stream so every device
/// opens the same deck.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckSelection {
    pub target_language: Option<Language>,
    pub native_language: Option<Language>,
}

impl DeckSelection {
    pub fn course(&self) -> Option<Course> {
        Some(Course {
            native_language: self.native_language?,
            target_language: self.target_language?,
        })
    }
}

impl weapon::PartialAppState for DeckSelection {
    type Event = DeckSelectionEvent;
    type Partial = Self; // For now, partial state is the same as final state

    fn process_event(
        mut partial: Self::Partial,
        _device_id: &str,
        event: &Timestamped<Self::Event>,
    ) -> Self::Partial {
        match &event.event {
            DeckSelectionEvent::SelectLanguage(language) => {
                partial.target_language = Some(*language);
            }
            DeckSelectionEvent::SelectLanguages {
                native_language,
                target_language,
            } => {
                partial.native_language = Some(*native_language);
                partial.target_language = Some(*target_language);
            }
        }
        partial
    }

    fn finalize(partial: Self::Partial) -> Self {
        partial
    }
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq, Ord, PartialOrd)]
pub enum DeckSelectionEvent {
    /// Only the target language; written by versions that assumed an English speaker.
    SelectLanguage(Language),
    SelectLanguages {
        native_language: Language,
        target_language: Language,
    },
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, Ord, PartialOrd, Eq, PartialEq)]
#[serde(tag = "version")]
pub enum VersionedDeckSelectionEvent {
    V1(DeckSelectionEvent),
}

impl Event for DeckSelectionEvent {
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        let versioned = VersionedDeckSelectionEvent::from(self.clone());
        serde_json::to_value(versioned)
    }

    fn from_json(json: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value::<VersionedDeckSelectionEvent>(json.clone())
            .map(|versioned| versioned.into())
    }
}

impl From<DeckSelectionEvent> for VersionedDeckSelectionEvent {
    fn from(event: DeckSelectionEvent) -> Self {
        VersionedDeckSelectionEvent::V1(event)
    }
}

impl From<VersionedDeckSelectionEvent> for DeckSelectionEvent {
    fn from(event: VersionedDeckSelectionEvent) -> Self {
        match event {
            VersionedDeckSelectionEvent::V1(event) => event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weapon::data_model::EventStore;

    #[test]
    fn latest_selection_wins() {
        let mut store = EventStore::<String, String>::default();
        store.add_raw_event(
            "deck_selection".to_string(),
            "phone".to_string(),
            DeckSelectionEvent::SelectLanguage(Language::Spanish),
            None,
        );
        store.add_raw_event(
            "deck_selection".to_string(),
            "phone".to_string(),
            DeckSelectionEvent::SelectLanguages {
                native_language: Language::English,
                target_language: Language::French,
            },
            None,
        );

        let selection: DeckSelection = store
            .get::<DeckSelectionEvent>("deck_selection".to_string())
            .unwrap()
            .state(DeckSelection::default());
        assert_eq!(
            selection.course(),
            Some(Course {
                native_language: Language::English,
                target_language: Language::French,
            })
        );
    }
}
