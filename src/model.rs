//! Core data model shared by every phase and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immutable per-run book metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookDescriptor {
    pub title: String,
    pub author: String,
    pub total_pages: u32,
    pub source_path: String,
    pub chapters: Vec<ChapterDescriptor>,
}

/// Immutable per-chapter metadata. Chapters are the unit of scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterDescriptor {
    /// Dense integer 1..N in reading order.
    pub number: u32,
    pub title: String,
    pub content: String,
    pub page_start: u32,
    pub page_end: u32,
    pub token_estimate: u64,
}

impl ChapterDescriptor {
    pub fn page_count(&self) -> u32 {
        self.page_end.saturating_sub(self.page_start) + 1
    }
}

/// One of `pending | in_progress | completed | failed`.
///
/// Transitions form a lattice: `pending -> in_progress -> {completed, failed}`;
/// `failed -> pending` only via an explicit clear-errors action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl PhaseStatus {
    /// Rank used to compute a phase's aggregate status from its chapters:
    /// "else the greatest-remaining status".
    fn rank(self) -> u8 {
        match self {
            PhaseStatus::Completed => 0,
            PhaseStatus::Pending => 1,
            PhaseStatus::Failed => 2,
            PhaseStatus::InProgress => 3,
        }
    }

    /// Aggregate a phase's global state from its per-chapter states.
    pub fn aggregate(chapter_states: impl IntoIterator<Item = PhaseStatus>) -> PhaseStatus {
        let mut worst = PhaseStatus::Completed;
        let mut any_in_progress = false;
        let mut all_completed = true;
        for s in chapter_states {
            if s != PhaseStatus::Completed {
                all_completed = false;
            }
            if s == PhaseStatus::InProgress {
                any_in_progress = true;
            }
            if s.rank() > worst.rank() {
                worst = s;
            }
        }
        if all_completed {
            PhaseStatus::Completed
        } else if any_in_progress {
            PhaseStatus::InProgress
        } else {
            worst
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyze,
    Extract,
    Enrich,
    Illustrate,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Analyze,
        Phase::Extract,
        Phase::Enrich,
        Phase::Illustrate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Analyze => "analyze",
            Phase::Extract => "extract",
            Phase::Enrich => "enrich",
            Phase::Illustrate => "illustrate",
        }
    }
}

/// Per-(phase, chapter) bookkeeping, plus timestamps for the state-store invariant
/// "completed implies at least one timestamp".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterPhaseRecord {
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_response: Option<String>,
}

impl Default for ChapterPhaseRecord {
    fn default() -> Self {
        ChapterPhaseRecord {
            status: PhaseStatus::Pending,
            started_at: None,
            completed_at: None,
            failure_reason: None,
            failure_response: None,
        }
    }
}

/// A model-identified visual moment within a chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub chapter: u32,
    pub chapter_title: String,
    /// Dense 1..K order within the chapter.
    pub index: u32,
    pub quote: String,
    pub description: String,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Character,
    Creature,
    Place,
    Item,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportingQuote {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrichment {
    pub detail: String,
    pub source_chapter: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirstAppearance {
    pub book_id: String,
    pub chapter: u32,
}

/// A named story element tracked across chapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: EntityType,
    pub name: String,
    pub quotes: Vec<SupportingQuote>,
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub first_appearance: FirstAppearance,
    #[serde(default)]
    pub appearances: Vec<u32>,
    #[serde(default)]
    pub enrichments: Vec<Enrichment>,
}

impl Entity {
    pub fn canonical_key(&self) -> String {
        Self::key_for(&self.name)
    }

    pub fn key_for(name: &str) -> String {
        name.trim().to_lowercase()
    }
}

/// Structured description produced once after the style bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualStyleGuide {
    pub art_style: String,
    pub palette: String,
    pub lighting: String,
    pub mood: String,
    pub composition: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Immutable progress record; also the payload carried on the dashboard socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub level: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(rename = "chapterNum", skip_serializing_if = "Option::is_none")]
    pub chapter_num: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub chapters_completed: u32,
    pub scenes_produced: u32,
    pub entities_catalogued: u32,
    pub images_generated: u32,
    pub tokens_consumed: u64,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_ms: Option<u64>,
}

/// Map of canonical name -> currently known facts, used to bias the analyze
/// prompt toward consistency ("element context").
pub type ElementContext = HashMap<String, String>;

/// A scene paired with its fully assembled illustration prompt, produced by
/// the enrich phase without any AI call — pure string
/// assembly from the scene and the entity registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedScene {
    pub chapter: u32,
    pub chapter_title: String,
    pub scene_index: u32,
    pub illustration_prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_all_completed_is_completed() {
        let states = vec![PhaseStatus::Completed, PhaseStatus::Completed];
        assert_eq!(PhaseStatus::aggregate(states), PhaseStatus::Completed);
    }

    #[test]
    fn aggregate_any_in_progress_is_in_progress() {
        let states = vec![
            PhaseStatus::Completed,
            PhaseStatus::InProgress,
            PhaseStatus::Pending,
        ];
        assert_eq!(PhaseStatus::aggregate(states), PhaseStatus::InProgress);
    }

    #[test]
    fn aggregate_no_in_progress_takes_greatest_remaining() {
        let states = vec![PhaseStatus::Completed, PhaseStatus::Failed, PhaseStatus::Pending];
        assert_eq!(PhaseStatus::aggregate(states), PhaseStatus::Failed);
    }

    #[test]
    fn aggregate_empty_is_completed() {
        assert_eq!(PhaseStatus::aggregate(std::iter::empty()), PhaseStatus::Completed);
    }

    #[test]
    fn canonical_key_is_lowercase_trimmed() {
        let e = Entity {
            entity_type: EntityType::Creature,
            name: "  Dragon ".to_string(),
            quotes: vec![],
            description: String::new(),
            aliases: vec![],
            first_appearance: FirstAppearance { book_id: "b".into(), chapter: 1 },
            appearances: vec![1],
            enrichments: vec![],
        };
        assert_eq!(e.canonical_key(), "dragon");
    }
}
