//! The vocabulary, sentences and pronunciations of one course, as produced by the asset pipeline.
//!
//! The deck only ever reads a pack. Fetching one can fail for reasons unrelated to the event
//! log (network, missing asset), so those failures get their own retryable error type.

use std::collections::BTreeMap;
use std::path::PathBuf;

use language_utils::{Course, Frequency, Heteronym, Language, Lexeme, Literal, PatternPosition};
use rustc_hash::FxHashMap;

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct LanguagePackData {
    pub course: Option<Course>,
    /// Most frequent first.
    pub word_frequencies: Vec<(Lexeme, Frequency)>,
    #[serde(default)]
    pub sentences: Vec<SentenceData>,
    /// Written word to its pronunciation key. Homophones share a key.
    #[serde(default)]
    pub pronunciations: BTreeMap<String, String>,
    #[serde(default)]
    pub dictionary: Vec<DictionaryEntry>,
    #[serde(default)]
    pub phrasebook: Vec<PhrasebookEntry>,
    #[serde(default)]
    pub pronunciation_guides: Vec<PronunciationGuide>,
    #[serde(default)]
    pub movies: Vec<MovieMetadata>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SentenceData {
    pub text: String,
    pub literals: Vec<Literal>,
    pub lexemes: Vec<Lexeme>,
    pub translations: Vec<String>,
    #[serde(default)]
    pub movie_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DictionaryEntry {
    pub heteronym: Heteronym,
    pub definitions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PhrasebookEntry {
    pub term: String,
    pub meaning: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PronunciationGuide {
    pub pattern: String,
    pub position: PatternPosition,
    pub description: String,
    #[serde(default)]
    pub example_words: Vec<String>,
    /// How many words of the corpus contain the pattern at this position.
    pub frequency: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MovieMetadata {
    pub id: String,
    pub title: String,
    pub year: Option<u16>,
}

/// A [`LanguagePackData`] with the lookup indices the deck needs.
#[derive(Debug)]
pub struct LanguagePack {
    pub course: Course,
    pub words: Vec<Lexeme>,
    pub word_frequencies: FxHashMap<Lexeme, Frequency>,
    pub total_word_count: u64,
    pub sentences: Vec<SentenceData>,
    pub sentence_index: FxHashMap<String, usize>,
    pub sentences_containing_lexeme: FxHashMap<Lexeme, Vec<usize>>,
    pub word_to_pronunciation: FxHashMap<String, String>,
    /// Pronunciations in the order their most frequent word appears.
    pub pronunciations: Vec<String>,
    pub pronunciation_to_words: FxHashMap<String, Vec<String>>,
    pub dictionary: FxHashMap<Heteronym, Vec<String>>,
    pub phrasebook: FxHashMap<String, String>,
    pub pronunciation_guides: Vec<PronunciationGuide>,
    pub movies: Vec<MovieMetadata>,
}

impl LanguagePack {
    pub fn new(course: Course, data: LanguagePackData) -> Self {
        let LanguagePackData {
            course: _,
            word_frequencies: word_list,
            sentences,
            pronunciations: word_to_pronunciation,
            dictionary,
            phrasebook,
            mut pronunciation_guides,
            movies,
        } = data;

        let mut words = Vec::with_capacity(word_list.len());
        let mut word_frequencies = FxHashMap::default();
        let mut total_word_count = 0u64;
        for (lexeme, frequency) in word_list {
            if word_frequencies.insert(lexeme.clone(), frequency).is_none() {
                total_word_count += frequency.count as u64;
                words.push(lexeme);
            }
        }

        let mut sentence_index = FxHashMap::default();
        let mut sentences_containing_lexeme: FxHashMap<Lexeme, Vec<usize>> = FxHashMap::default();
        for (index, sentence) in sentences.iter().enumerate() {
            sentence_index.insert(sentence.text.clone(), index);
            let mut seen = Vec::new();
            for lexeme in &sentence.lexemes {
                if !seen.contains(lexeme) {
                    seen.push(lexeme.clone());
                    sentences_containing_lexeme
                        .entry(lexeme.clone())
                        .or_default()
                        .push(index);
                }
            }
        }

        let mut pronunciations = Vec::new();
        let mut pronunciation_to_words: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for lexeme in &words {
            let Lexeme::Heteronym(heteronym) = lexeme else {
                continue;
            };
            let Some(pronunciation) = word_to_pronunciation.get(&heteronym.word) else {
                continue;
            };
            let homophones = pronunciation_to_words.entry(pronunciation.clone()).or_default();
            if homophones.is_empty() {
                pronunciations.push(pronunciation.clone());
            }
            if !homophones.contains(&heteronym.word) {
                homophones.push(heteronym.word.clone());
            }
        }

        pronunciation_guides.sort_by(|a, b| b.frequency.cmp(&a.frequency));

        Self {
            course,
            words,
            word_frequencies,
            total_word_count,
            sentences,
            sentence_index,
            sentences_containing_lexeme,
            word_to_pronunciation: word_to_pronunciation.into_iter().collect(),
            pronunciations,
            pronunciation_to_words,
            dictionary: dictionary
                .into_iter()
                .map(|entry| (entry.heteronym, entry.definitions))
                .collect(),
            phrasebook: phrasebook
                .into_iter()
                .map(|entry| (entry.term, entry.meaning))
                .collect(),
            pronunciation_guides,
            movies,
        }
    }

    pub fn target_language(&self) -> Language {
        self.course.target_language
    }

    /// Every lexeme a homophonous pronunciation could stand for.
    pub fn pronunciation_to_lexemes<'a>(
        &'a self,
        pronunciation: &str,
    ) -> impl Iterator<Item = &'a Lexeme> + 'a {
        let homophones = self
            .pronunciation_to_words
            .get(pronunciation)
            .cloned()
            .unwrap_or_default();
        self.words.iter().filter(move |lexeme| {
            lexeme
                .heteronym()
                .is_some_and(|heteronym| homophones.contains(&heteronym.word))
        })
    }

    pub fn pronunciation_max_frequency(&self, pronunciation: &str) -> Option<Frequency> {
        self.pronunciation_to_lexemes(pronunciation)
            .filter_map(|lexeme| self.word_frequencies.get(lexeme).copied())
            .max()
    }

    pub fn guide(&self, pattern: &str, position: PatternPosition) -> Option<&PronunciationGuide> {
        self.pronunciation_guides
            .iter()
            .find(|guide| guide.pattern == pattern && guide.position == position)
    }

    pub fn sentence(&self, text: &str) -> Option<&SentenceData> {
        self.sentence_index
            .get(text)
            .and_then(|index| self.sentences.get(*index))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LanguageDataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("language data could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("asset server error: {0}")]
    Server(String),

    #[error("Unsupported course: {0:?}")]
    UnsupportedCourse(Course),
}

impl LanguageDataError {
    /// Whether trying again later could succeed. The UI offers a retry button for these.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LanguageDataError::Io(_) | LanguageDataError::Server(_))
    }
}

pub fn course_directory_slug(course: Course) -> String {
    format!(
        "{}_for_{}",
        course.target_language.iso_639_3(),
        course.native_language.iso_639_3()
    )
}

/// Where language packs come from.
#[allow(async_fn_in_trait)]
pub trait LanguagePackSource {
    async fn fetch(&self, course: Course) -> Result<LanguagePackData, LanguageDataError>;
}

/// Packs laid out as `<root>/<target>_for_<native>/language_data.json`.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Clone, Debug)]
pub struct DirectorySource {
    pub root: PathBuf,
}

#[cfg(not(target_arch = "wasm32"))]
impl LanguagePackSource for DirectorySource {
    async fn fetch(&self, course: Course) -> Result<LanguagePackData, LanguageDataError> {
        if !language_utils::COURSES.contains(&course) {
            return Err(LanguageDataError::UnsupportedCourse(course));
        }
        let path = self
            .root
            .join(course_directory_slug(course))
            .join("language_data.json");
        log::info!("Loading language data for {course:?} from {}", path.display());
        let bytes = tokio::fs::read(&path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
