use language_utils::Language;
use rustc_hash::FxHashMap;

use crate::language_pack::{LanguagePack, MovieMetadata};

/// Movie metadata looked up so far, keyed by `(language, movie id)`.
///
/// Unbounded: a course references a few thousand movies at most. [`MovieCache::clear`]
/// empties it when the engine is reset.
#[derive(Debug, Default)]
pub struct MovieCache {
    entries: FxHashMap<(Language, String), MovieMetadata>,
}

impl MovieCache {
    pub fn get(&self, language: Language, movie_id: &str) -> Option<&MovieMetadata> {
        self.entries.get(&(language, movie_id.to_string()))
    }

    pub fn insert(&mut self, language: Language, metadata: MovieMetadata) {
        self.entries
            .insert((language, metadata.id.clone()), metadata);
    }

    /// Metadata for each id the pack knows, in the order requested. Unknown ids are skipped.
    pub fn get_movie_metadata(
        &mut self,
        pack: &LanguagePack,
        movie_ids: &[String],
    ) -> Vec<MovieMetadata> {
        let language = pack.target_language();
        movie_ids
            .iter()
            .filter_map(|movie_id| {
                if let Some(metadata) = self.get(language, movie_id) {
                    return Some(metadata.clone());
                }
                let metadata = pack.movies.iter().find(|movie| &movie.id == movie_id)?.clone();
                self.insert(language, metadata.clone());
                Some(metadata)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
