use super::*;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Part {
    AskedToTranscribe { parts: Vec<Literal> },
    Provided { part: Literal },
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartGraded {
    AskedToTranscribe {
        parts: Vec<PartGradedPart>,
        submission: String,
    },
    Provided {
        part: Literal,
    },
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartGradedPart {
    pub heard: Literal,
    pub grade: WordGrade,
}

/// How well a single heard word was transcribed. Variants are ordered from best to worst,
/// so `max` over several grades yields the worst one.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WordGrade {
    Perfect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wrote: Option<String>,
    },
    CorrectWithTypo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wrote: Option<String>,
    },
    PhoneticallyIdenticalButContextuallyIncorrect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wrote: Option<String>,
    },
    PhoneticallySimilarButContextuallyIncorrect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wrote: Option<String>,
    },
    Incorrect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wrote: Option<String>,
    },
    Missed {},
}

impl WordGrade {
    pub fn is_correct(&self) -> bool {
        matches!(
            self,
            WordGrade::Perfect { .. } | WordGrade::CorrectWithTypo { .. }
        )
    }
}

impl PartGraded {
    /// The graded words of this part, empty for parts that were shown to the learner.
    pub fn graded_parts(&self) -> &[PartGradedPart] {
        match self {
            PartGraded::AskedToTranscribe { parts, .. } => parts,
            PartGraded::Provided { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worse_grades_sort_later() {
        let perfect = WordGrade::Perfect { wrote: None };
        let typo = WordGrade::CorrectWithTypo {
            wrote: Some("chta".to_string()),
        };
        let missed = WordGrade::Missed {};
        assert!(perfect < typo);
        assert!(typo < missed);
        assert_eq!(
            [perfect.clone(), missed.clone(), typo].into_iter().max(),
            Some(missed)
        );
        assert!(perfect.is_correct());
    }

    #[test]
    fn missing_wrote_field_deserializes() {
        let grade: WordGrade = serde_json::from_str(r#"{"Incorrect":{}}"#).unwrap();
        assert_eq!(grade, WordGrade::Incorrect { wrote: None });
    }
}
