//! Vocabulary types shared by the deck engine and whatever produces language packs.

pub mod transcription_challenge;

/// Universal Dependencies part-of-speech tags, as the tagger writes them (`"NOUN"`, `"PROPN"`).
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartOfSpeech {
    Adj,
    Adp,
    Adv,
    Aux,
    Cconj,
    Det,
    Intj,
    Noun,
    Num,
    Part,
    Pron,
    Propn,
    Punct,
    Sconj,
    Sym,
    Verb,
    Space,
    X,
}

/// A word together with the meaning it has in context: "est" the verb is a different heteronym from "est" the noun.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Heteronym {
    pub word: String,
    pub lemma: String,
    pub pos: PartOfSpeech,
}

/// A single unit of vocabulary that can be learned.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Lexeme {
    Heteronym(Heteronym),
    Multiword(String),
}

impl Lexeme {
    pub fn heteronym(&self) -> Option<&Heteronym> {
        match self {
            Lexeme::Heteronym(heteronym) => Some(heteronym),
            _ => None,
        }
    }

    pub fn multiword(&self) -> Option<&String> {
        match self {
            Lexeme::Multiword(multiword) => Some(multiword),
            _ => None,
        }
    }

    /// The written form of the lexeme.
    pub fn text(&self) -> &str {
        match self {
            Lexeme::Heteronym(heteronym) => &heteronym.word,
            Lexeme::Multiword(multiword) => multiword,
        }
    }
}

/// One token of a sentence, with the whitespace that follows it.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Literal {
    pub text: String,
    pub whitespace: String,
    pub heteronym: Option<Heteronym>,
}

/// Where in a word a spelling pattern has to appear for its pronunciation guide to apply.
#[derive(Copy, Clone, Debug, serde::Serialize, serde::Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum PatternPosition {
    Beginning,
    End,
    Anywhere,
}

#[derive(
    Copy, Clone, Debug, serde::Serialize, serde::Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd,
)]
pub enum Language {
    French,
    English,
    Spanish,
    Korean,
    German,
    Chinese,
    Japanese,
    Russian,
    Portuguese,
    Italian,
}

impl Language {
    /// `(ISO 639-3 code, English name)`.
    fn codes(self) -> (&'static str, &'static str) {
        match self {
            Language::French => ("fra", "French"),
            Language::English => ("eng", "English"),
            Language::Spanish => ("spa", "Spanish"),
            Language::Korean => ("kor", "Korean"),
            Language::German => ("deu", "German"),
            Language::Chinese => ("zho", "Chinese"),
            Language::Japanese => ("jpn", "Japanese"),
            Language::Russian => ("rus", "Russian"),
            Language::Portuguese => ("por", "Portuguese"),
            Language::Italian => ("ita", "Italian"),
        }
    }

    pub fn iso_639_3(&self) -> &'static str {
        self.codes().0
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.codes().1)
    }
}

/// A language pair: learning `target_language` from `native_language`.
#[derive(Copy, Clone, Debug, serde::Serialize, serde::Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub native_language: Language,
    pub target_language: Language,
}

pub const COURSES: &[Course] = &[
    Course {
        native_language: Language::English,
        target_language: Language::French,
    },
    Course {
        native_language: Language::French,
        target_language: Language::English,
    },
    Course {
        native_language: Language::English,
        target_language: Language::Spanish,
    },
    Course {
        native_language: Language::English,
        target_language: Language::Korean,
    },
    Course {
        native_language: Language::English,
        target_language: Language::German,
    },
];

/// Occurrences of a word in the subtitle corpus.
#[derive(Copy, Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Frequency {
    pub count: u32,
}

impl Frequency {
    pub fn sqrt_frequency(&self) -> f64 {
        (self.count as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexeme_serializes_as_tagged_variant() {
        let lexeme = Lexeme::Heteronym(Heteronym {
            word: "chat".to_string(),
            lemma: "chat".to_string(),
            pos: PartOfSpeech::Noun,
        });
        let json = serde_json::to_value(&lexeme).unwrap();
        assert_eq!(json["Heteronym"]["pos"], "NOUN");
        assert_eq!(lexeme.text(), "chat");
    }

    #[test]
    fn course_uses_camel_case() {
        let json = serde_json::to_string(&COURSES[0]).unwrap();
        assert_eq!(json, r#"{"nativeLanguage":"English","targetLanguage":"French"}"#);
    }

    #[test]
    fn part_of_speech_uses_tagger_names() {
        let json = serde_json::to_string(&PartOfSpeech::Propn).unwrap();
        assert_eq!(json, r#""PROPN""#);
        assert_eq!(Language::German.iso_639_3(), "deu");
        assert_eq!(Language::German.to_string(), "German");
    }
}
