use chrono::{DateTime, Utc};
use nlmkit_core::{Error, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Flashcards and quizzes share a type code; the options variant tells them apart.
const FLASHCARDS_VARIANT: i64 = 1;
const QUIZ_VARIANT: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Audio,
    Report,
    Video,
    Flashcards,
    Quiz,
    MindMap,
    Infographic,
    SlideDeck,
    DataTable,
    Other(i64),
}

impl ArtifactKind {
    pub fn type_code(&self) -> i64 {
        match self {
            Self::Audio => 1,
            Self::Report => 2,
            Self::Video => 3,
            Self::Flashcards | Self::Quiz => 4,
            Self::MindMap => 5,
            Self::Infographic => 7,
            Self::SlideDeck => 8,
            Self::DataTable => 9,
            Self::Other(code) => *code,
        }
    }

    /// Kind for a remote type code. `options` is the kind-specific options
    /// blob, consulted only for the shared flashcards/quiz code.
    pub fn from_code(code: i64, options: Option<&Value>) -> Self {
        match code {
            1 => Self::Audio,
            2 => Self::Report,
            3 => Self::Video,
            4 => {
                let variant = options
                    .and_then(|o| o.get(1))
                    .and_then(|o| o.get(0))
                    .and_then(Value::as_i64);
                if variant == Some(QUIZ_VARIANT) {
                    Self::Quiz
                } else {
                    Self::Flashcards
                }
            }
            5 => Self::MindMap,
            7 => Self::Infographic,
            8 => Self::SlideDeck,
            9 => Self::DataTable,
            other => Self::Other(other),
        }
    }

    /// Index of the options blob inside the creation content array.
    pub fn options_slot(&self) -> Option<usize> {
        match self {
            Self::Audio => Some(6),
            Self::Report => Some(7),
            Self::Video => Some(8),
            Self::Flashcards | Self::Quiz => Some(9),
            Self::Infographic => Some(14),
            Self::SlideDeck => Some(16),
            Self::MindMap | Self::DataTable | Self::Other(_) => None,
        }
    }

    /// Options used when the caller supplies none.
    pub fn default_options(&self) -> Value {
        match self {
            Self::Flashcards => json!([null, [FLASHCARDS_VARIANT]]),
            Self::Quiz => json!([null, [QUIZ_VARIANT]]),
            _ => Value::Null,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Report => write!(f, "report"),
            Self::Video => write!(f, "video"),
            Self::Flashcards => write!(f, "flashcards"),
            Self::Quiz => write!(f, "quiz"),
            Self::MindMap => write!(f, "mind-map"),
            Self::Infographic => write!(f, "infographic"),
            Self::SlideDeck => write!(f, "slide-deck"),
            Self::DataTable => write!(f, "data-table"),
            Self::Other(code) => write!(f, "other({})", code),
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "audio" => Ok(Self::Audio),
            "report" => Ok(Self::Report),
            "video" => Ok(Self::Video),
            "flashcards" => Ok(Self::Flashcards),
            "quiz" => Ok(Self::Quiz),
            "mind-map" | "mindmap" => Ok(Self::MindMap),
            "infographic" => Ok(Self::Infographic),
            "slide-deck" | "slides" => Ok(Self::SlideDeck),
            "data-table" => Ok(Self::DataTable),
            other => Err(Error::Validation(format!("unknown artifact kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Requested,
    InProgress,
    Completed,
    Failed,
    /// Remote status code this client does not recognize.
    Unknown,
}

impl ArtifactStatus {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 | 2 => Self::InProgress,
            3 => Self::Completed,
            4 => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Requested | Self::Unknown => 0,
            Self::InProgress => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Status after observing `observed`. Never moves backwards; an
    /// unrecognized observation only replaces a status that carries no
    /// information yet.
    pub fn advance(self, observed: Self) -> Self {
        if observed == Self::Unknown {
            return if self == Self::Requested { observed } else { self };
        }
        if observed.rank() > self.rank() {
            observed
        } else {
            self
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A server-side generation job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub notebook_id: String,
    pub kind: ArtifactKind,
    pub title: Option<String>,
    pub status: ArtifactStatus,
    /// Set when this artifact was produced by revising another one.
    pub origin_artifact_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The last listing of the notebook no longer contained this artifact.
    pub removed_remotely: bool,
}

impl Artifact {
    pub fn requested(
        artifact_id: impl Into<String>,
        notebook_id: impl Into<String>,
        kind: ArtifactKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            artifact_id: artifact_id.into(),
            notebook_id: notebook_id.into(),
            kind,
            title: None,
            status: ArtifactStatus::Requested,
            origin_artifact_id: None,
            created_at: now,
            updated_at: now,
            removed_remotely: false,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.artifact_id.trim().is_empty() {
            return Err(Error::Validation("artifact id must not be empty".to_string()));
        }
        if self.origin_artifact_id.as_deref() == Some(self.artifact_id.as_str()) {
            return Err(Error::Validation(format!(
                "artifact {} cannot originate from itself",
                self.artifact_id
            )));
        }
        Ok(())
    }
}

/// What to generate and from which sources.
#[derive(Debug, Clone, Default)]
pub struct ArtifactConfig {
    pub notebook_id: String,
    pub source_ids: Vec<String>,
    /// Kind-specific options blob; null selects the kind's defaults.
    pub options: Value,
}

/// A revision request as users phrase it: slides numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideInstruction {
    pub slide: u32,
    pub instruction: String,
}

/// Convert 1-based slide numbers to the 0-based indices the service expects.
pub fn to_transport_instructions(instructions: &[SlideInstruction]) -> Result<Vec<(i64, String)>> {
    instructions
        .iter()
        .map(|i| {
            if i.slide == 0 {
                return Err(Error::Validation(
                    "slide numbers start at 1".to_string(),
                ));
            }
            Ok((i64::from(i.slide) - 1, i.instruction.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        assert_eq!(ArtifactStatus::from_code(1), ArtifactStatus::InProgress);
        assert_eq!(ArtifactStatus::from_code(2), ArtifactStatus::InProgress);
        assert_eq!(ArtifactStatus::from_code(3), ArtifactStatus::Completed);
        assert_eq!(ArtifactStatus::from_code(4), ArtifactStatus::Failed);
        assert_eq!(ArtifactStatus::from_code(0), ArtifactStatus::Unknown);
        assert_eq!(ArtifactStatus::from_code(99), ArtifactStatus::Unknown);
    }

    #[test]
    fn test_status_never_regresses() {
        use ArtifactStatus::*;
        assert_eq!(Requested.advance(InProgress), InProgress);
        assert_eq!(InProgress.advance(Completed), Completed);
        assert_eq!(Completed.advance(InProgress), Completed);
        assert_eq!(Completed.advance(Failed), Completed);
        assert_eq!(Failed.advance(Requested), Failed);
        assert_eq!(InProgress.advance(Requested), InProgress);
    }

    #[test]
    fn test_unknown_status_transitions() {
        use ArtifactStatus::*;
        assert_eq!(Requested.advance(Unknown), Unknown);
        assert_eq!(InProgress.advance(Unknown), InProgress);
        assert_eq!(Completed.advance(Unknown), Completed);
        assert_eq!(Unknown.advance(InProgress), InProgress);
        assert_eq!(Unknown.advance(Failed), Failed);
        assert_eq!(Unknown.advance(Requested), Unknown);
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(ArtifactKind::from_code(1, None), ArtifactKind::Audio);
        assert_eq!(ArtifactKind::from_code(8, None), ArtifactKind::SlideDeck);
        assert_eq!(ArtifactKind::from_code(42, None), ArtifactKind::Other(42));
        assert_eq!(ArtifactKind::Other(42).type_code(), 42);
        assert_eq!(ArtifactKind::Quiz.type_code(), 4);
        assert_eq!(ArtifactKind::DataTable.type_code(), 9);
    }

    #[test]
    fn test_flashcards_and_quiz_share_code() {
        let quiz = ArtifactKind::Quiz.default_options();
        let cards = ArtifactKind::Flashcards.default_options();
        assert_eq!(ArtifactKind::from_code(4, Some(&quiz)), ArtifactKind::Quiz);
        assert_eq!(ArtifactKind::from_code(4, Some(&cards)), ArtifactKind::Flashcards);
        assert_eq!(ArtifactKind::from_code(4, None), ArtifactKind::Flashcards);
    }

    #[test]
    fn test_kind_parse_and_display() {
        for kind in [
            ArtifactKind::Audio,
            ArtifactKind::MindMap,
            ArtifactKind::SlideDeck,
            ArtifactKind::DataTable,
            ArtifactKind::Quiz,
        ] {
            assert_eq!(kind.to_string().parse::<ArtifactKind>().unwrap(), kind);
        }
        assert_eq!("slide_deck".parse::<ArtifactKind>().unwrap(), ArtifactKind::SlideDeck);
        assert!("podcast".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn test_slide_numbers_are_one_based() {
        let converted = to_transport_instructions(&[
            SlideInstruction {
                slide: 1,
                instruction: "Bigger title".to_string(),
            },
            SlideInstruction {
                slide: 3,
                instruction: "Fewer bullets".to_string(),
            },
        ])
        .unwrap();
        assert_eq!(
            converted,
            vec![(0, "Bigger title".to_string()), (2, "Fewer bullets".to_string())]
        );

        let err = to_transport_instructions(&[SlideInstruction {
            slide: 0,
            instruction: "x".to_string(),
        }])
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_self_origin_is_invalid() {
        let mut artifact = Artifact::requested("a1", "nb", ArtifactKind::SlideDeck);
        assert!(artifact.validate().is_ok());
        artifact.origin_artifact_id = Some("a1".to_string());
        assert!(artifact.validate().is_err());
    }

    #[test]
    fn test_serialized_names() {
        let artifact = Artifact::requested("a1", "nb", ArtifactKind::SlideDeck);
        let v = serde_json::to_value(&artifact).unwrap();
        assert_eq!(v["kind"], "slide-deck");
        assert_eq!(v["status"], "requested");
    }
}
