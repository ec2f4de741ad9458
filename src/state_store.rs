//! State Store: load/save the durable pipeline state document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::atomic;
use crate::lock;
use crate::model::{ChapterPhaseRecord, Phase, PhaseStatus};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state schema version mismatch: file has {found}, expected {expected}")]
    StateVersionMismatch { found: u32, expected: u32 },
    #[error("io error reading/writing state: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed state document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("atomic write failed: {0}")]
    Write(#[from] atomic::AtomicWriteError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub schema_version: u32,
    pub book_title: String,
    pub total_chapters: Vec<u32>,
    /// (phase, chapter) -> record.
    pub chapters: HashMap<Phase, HashMap<u32, ChapterPhaseRecord>>,
    pub token_usage: u64,
    pub last_updated: DateTime<Utc>,
}

impl PipelineState {
    pub fn new(book_title: impl Into<String>, chapter_numbers: Vec<u32>) -> Self {
        let mut chapters = HashMap::new();
        for phase in Phase::ALL {
            let mut per_chapter = HashMap::new();
            for &n in &chapter_numbers {
                per_chapter.insert(n, ChapterPhaseRecord::default());
            }
            chapters.insert(phase, per_chapter);
        }
        PipelineState {
            schema_version: CURRENT_SCHEMA_VERSION,
            book_title: book_title.into(),
            total_chapters: chapter_numbers,
            chapters,
            token_usage: 0,
            last_updated: Utc::now(),
        }
    }

    /// Aggregate status of `phase` across all selected chapters.
    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        let Some(per_chapter) = self.chapters.get(&phase) else {
            return PhaseStatus::Completed;
        };
        PhaseStatus::aggregate(per_chapter.values().map(|r| r.status))
    }

    /// Invariant (3): the catalog of chapters is a permutation of 1..N.
    pub fn is_dense_permutation(&self) -> bool {
        let mut sorted = self.total_chapters.clone();
        sorted.sort_unstable();
        sorted.iter().enumerate().all(|(i, &n)| n == (i as u32 + 1))
    }
}

pub struct StateStore {
    path: PathBuf,
    inner: Mutex<()>,
}

#[derive(Debug, Clone)]
pub struct Discrepancy {
    pub description: String,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore {
            path: path.into(),
            inner: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<Option<PipelineState>, StateError> {
        let _guard = self.inner.lock().await;
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&self.path).await?;
        let state: PipelineState = serde_json::from_slice(&bytes)?;
        if state.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(StateError::StateVersionMismatch {
                found: state.schema_version,
                expected: CURRENT_SCHEMA_VERSION,
            });
        }
        Ok(Some(state))
    }

    pub async fn save(&self, state: &mut PipelineState) -> Result<(), StateError> {
        let _guard = self.inner.lock().await;
        state.last_updated = Utc::now();
        let bytes = serde_json::to_vec_pretty(state)?;
        let path = self.path.clone();
        lock::with_lock(&path, || async move {
            atomic::write(&path, &bytes)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// `updatePhase`: bulk-transition every selected chapter's record for `phase`.
    pub async fn update_phase(
        &self,
        state: &mut PipelineState,
        phase: Phase,
        chapters: &[u32],
        status: PhaseStatus,
    ) -> Result<(), StateError> {
        let per_chapter = state.chapters.entry(phase).or_default();
        for &n in chapters {
            let record = per_chapter.entry(n).or_default();
            record.status = status;
            match status {
                PhaseStatus::InProgress if record.started_at.is_none() => {
                    record.started_at = Some(Utc::now())
                }
                PhaseStatus::Completed => record.completed_at = Some(Utc::now()),
                _ => {}
            }
        }
        self.save(state).await
    }

    /// `updateChapter`: transition a single (phase, chapter) record.
    pub async fn update_chapter(
        &self,
        state: &mut PipelineState,
        phase: Phase,
        chapter: u32,
        status: PhaseStatus,
    ) -> Result<(), StateError> {
        self.update_phase(state, phase, &[chapter], status).await
    }

    pub async fn mark_failed(
        &self,
        state: &mut PipelineState,
        phase: Phase,
        chapter: u32,
        reason: impl Into<String>,
        response: Option<String>,
    ) -> Result<(), StateError> {
        let record = state
            .chapters
            .entry(phase)
            .or_default()
            .entry(chapter)
            .or_default();
        record.status = PhaseStatus::Failed;
        record.failure_reason = Some(reason.into());
        record.failure_response = response;
        self.save(state).await
    }

    /// `clearErrors(phase) -> count`: failed -> pending for every chapter of `phase`.
    pub async fn clear_errors(
        &self,
        state: &mut PipelineState,
        phase: Phase,
    ) -> Result<usize, StateError> {
        let mut count = 0;
        if let Some(per_chapter) = state.chapters.get_mut(&phase) {
            for record in per_chapter.values_mut() {
                if record.status == PhaseStatus::Failed {
                    record.status = PhaseStatus::Pending;
                    record.failure_reason = None;
                    record.failure_response = None;
                    count += 1;
                }
            }
        }
        self.save(state).await?;
        Ok(count)
    }

    /// `validateConsistency`: surfaces discrepancies without mutating state.
    pub fn validate_consistency(
        &self,
        state: &PipelineState,
        chapters_md_exists: bool,
        elements_md_exists: bool,
    ) -> Vec<Discrepancy> {
        let mut out = Vec::new();

        if !state.is_dense_permutation() {
            out.push(Discrepancy {
                description: "chapter catalog is not a dense permutation of 1..N".to_string(),
            });
        }

        if let (Some(analyze), Some(illustrate)) =
            (state.chapters.get(&Phase::Analyze), state.chapters.get(&Phase::Illustrate))
        {
            for (&chapter, illustrate_record) in illustrate {
                if illustrate_record.status == PhaseStatus::Completed {
                    let analyze_ok = analyze
                        .get(&chapter)
                        .map(|r| r.status == PhaseStatus::Completed)
                        .unwrap_or(false);
                    if !analyze_ok {
                        out.push(Discrepancy {
                            description: format!(
                                "chapter {chapter} completed illustrate without completed analyze"
                            ),
                        });
                    }
                }
            }
        }

        if state.phase_status(Phase::Analyze) == PhaseStatus::Completed && !chapters_md_exists {
            out.push(Discrepancy {
                description: "analyze reports completed but Chapters.md is missing".to_string(),
            });
        }
        if !elements_md_exists && state.chapters.values().any(|m| {
            m.values().any(|r| r.status == PhaseStatus::Completed)
        }) {
            out.push(Discrepancy {
                description: "chapters completed but Elements.md is missing".to_string(),
            });
        }

        out
    }
}

fn validate_monotonic(previous: u64, next: u64) -> Result<(), StateError> {
    if next < previous {
        return Err(anyhow::anyhow!(
            "token usage counter must be monotonically non-decreasing: {previous} -> {next}"
        )
        .into());
    }
    Ok(())
}

impl StateStore {
    pub async fn add_tokens(&self, state: &mut PipelineState, delta: u64) -> Result<(), StateError> {
        let next = state.token_usage + delta;
        validate_monotonic(state.token_usage, next)?;
        state.token_usage = next;
        self.save(state).await
    }
}
