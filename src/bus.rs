//! Progress Bus: a process-wide typed event emitter fanning out to a log
//! sink and a dashboard sink, each running as its own independent task over
//! a broadcast channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::atomic;
use crate::lock;
use crate::model::{Phase, ProgressEvent, RunStatistics, Severity};

/// Discriminated union of every event the bus fans out.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "kebab-case")]
pub enum BusEvent {
    #[serde(rename = "initial-state")]
    Initialized(InitialState),
    PhaseStart { phase: Phase },
    ChapterStart { #[serde(rename = "chapterNum")] chapter_num: u32 },
    ChapterComplete {
        #[serde(rename = "chapterNum")]
        chapter_num: u32,
        #[serde(rename = "conceptsFound")]
        concepts_found: u32,
    },
    ImageComplete { #[serde(rename = "chapterNum")] chapter_num: u32, scene: u32 },
    Stats(RunStatistics),
    Progress(ProgressEvent),
}

#[derive(Debug, Clone, Serialize)]
pub struct InitialState {
    pub book_title: String,
    pub current_phase: Option<Phase>,
    pub current_chapter: Option<u32>,
    pub stats: RunStatistics,
    pub start_time: chrono::DateTime<Utc>,
}

struct Counters {
    chapters_completed: AtomicU32,
    scenes_produced: AtomicU32,
    entities_catalogued: AtomicU32,
    images_generated: AtomicU32,
    tokens_consumed: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Counters {
            chapters_completed: AtomicU32::new(0),
            scenes_produced: AtomicU32::new(0),
            entities_catalogued: AtomicU32::new(0),
            images_generated: AtomicU32::new(0),
            tokens_consumed: AtomicU64::new(0),
        }
    }
}

/// The bus itself. Every state-mutating operation in the orchestrator calls
/// one of its methods, which compute derived stats and publish a fresh
/// `Stats` event alongside the primary one.
pub struct ProgressBus {
    sender: broadcast::Sender<BusEvent>,
    counters: Counters,
    started_at: Instant,
    total_chapters: u32,
    book_title: String,
    progress_md_path: PathBuf,
}

impl ProgressBus {
    pub fn new(book_title: impl Into<String>, total_chapters: u32, progress_md_path: PathBuf) -> Arc<Self> {
        let (sender, _) = broadcast::channel(1024);
        Arc::new(ProgressBus {
            sender,
            counters: Counters::new(),
            started_at: Instant::now(),
            total_chapters,
            book_title: book_title.into(),
            progress_md_path,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: BusEvent) {
        // A slow/absent subscriber must never block the pipeline;
        // `broadcast::Sender::send` never blocks — it only errors when there
        // are zero receivers, which we ignore.
        let _ = self.sender.send(event);
    }

    fn stats(&self) -> RunStatistics {
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        let completed = self.counters.chapters_completed.load(Ordering::Relaxed);
        let eta_ms = if completed > 0 && completed < self.total_chapters {
            let remaining = self.total_chapters - completed;
            Some(elapsed_ms / completed as u64 * remaining as u64)
        } else {
            None
        };
        RunStatistics {
            chapters_completed: completed,
            scenes_produced: self.counters.scenes_produced.load(Ordering::Relaxed),
            entities_catalogued: self.counters.entities_catalogued.load(Ordering::Relaxed),
            images_generated: self.counters.images_generated.load(Ordering::Relaxed),
            tokens_consumed: self.counters.tokens_consumed.load(Ordering::Relaxed),
            elapsed_ms,
            eta_ms,
        }
    }

    pub fn initial_state(&self, current_phase: Option<Phase>, current_chapter: Option<u32>) -> InitialState {
        InitialState {
            book_title: self.book_title.clone(),
            current_phase,
            current_chapter,
            stats: self.stats(),
            start_time: Utc::now(),
        }
    }

    pub fn set_phase(&self, phase: Phase) {
        self.publish(BusEvent::PhaseStart { phase });
        self.publish(BusEvent::Stats(self.stats()));
    }

    pub fn start_chapter(&self, chapter_num: u32) {
        self.publish(BusEvent::ChapterStart { chapter_num });
    }

    pub fn complete_chapter(&self, chapter_num: u32, concepts_found: u32) {
        self.counters.chapters_completed.fetch_add(1, Ordering::Relaxed);
        self.publish(BusEvent::ChapterComplete { chapter_num, concepts_found });
        self.publish(BusEvent::Stats(self.stats()));
    }

    pub fn log_image_generation(&self, chapter_num: u32, scene: u32) {
        self.counters.images_generated.fetch_add(1, Ordering::Relaxed);
        self.publish(BusEvent::ImageComplete { chapter_num, scene });
        self.publish(BusEvent::Stats(self.stats()));
    }

    pub fn add_scenes(&self, n: u32) {
        self.counters.scenes_produced.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_entities(&self, n: u32) {
        self.counters.entities_catalogued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_tokens(&self, n: u64) {
        self.counters.tokens_consumed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn log(&self, level: Severity, phase: Option<Phase>, chapter_num: Option<u32>, message: impl Into<String>) {
        self.publish(BusEvent::Progress(ProgressEvent {
            timestamp: Utc::now(),
            level,
            phase,
            chapter_num,
            message: message.into(),
        }));
    }

    /// Spawns the log sink as an independent task: appends a timestamped
    /// markdown line to `progress.md` via Atomic Writer under File Lock.
    pub fn spawn_log_sink(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.subscribe();
        let path = self.progress_md_path.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let BusEvent::Progress(p) = event {
                    let line = format!(
                        "{} {} {}\n",
                        glyph(p.level),
                        p.timestamp.to_rfc3339(),
                        p.message
                    );
                    let _ = append_under_lock(&path, &line).await;
                }
            }
        })
    }
}

fn glyph(level: Severity) -> &'static str {
    match level {
        Severity::Info => "ℹ",
        Severity::Success => "✓",
        Severity::Warning => "⚠",
        Severity::Error => "✗",
    }
}

async fn append_under_lock(path: &std::path::Path, line: &str) -> anyhow::Result<()> {
    let path = path.to_path_buf();
    let line = line.to_string();
    lock::with_lock(&path, move || async move {
        let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        existing.push_str(&line);
        atomic::write_str(&path, &existing)?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chapter_start_precedes_progress_precedes_complete() {
        let dir = tempfile::tempdir().unwrap();
        let bus = ProgressBus::new("Book", 2, dir.path().join("progress.md"));
        let mut rx = bus.subscribe();

        bus.start_chapter(1);
        bus.log(Severity::Info, Some(Phase::Analyze), Some(1), "working");
        bus.complete_chapter(1, 3);

        let mut order = Vec::new();
        for _ in 0..4 {
            match rx.recv().await.unwrap() {
                BusEvent::ChapterStart { .. } => order.push("start"),
                BusEvent::Progress(_) => order.push("progress"),
                BusEvent::ChapterComplete { .. } => order.push("complete"),
                BusEvent::Stats(_) => order.push("stats"),
                other => panic!("unexpected event in this scenario: {other:?}"),
            }
        }
        let start_idx = order.iter().position(|s| *s == "start").unwrap();
        let progress_idx = order.iter().position(|s| *s == "progress").unwrap();
        let complete_idx = order.iter().position(|s| *s == "complete").unwrap();
        assert!(start_idx < progress_idx);
        assert!(progress_idx < complete_idx);
    }

    #[tokio::test]
    async fn stats_are_monotonic_and_eta_computed() {
        let dir = tempfile::tempdir().unwrap();
        let bus = ProgressBus::new("Book", 4, dir.path().join("progress.md"));
        bus.complete_chapter(1, 2);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        bus.complete_chapter(2, 2);
        let stats = bus.stats();
        assert_eq!(stats.chapters_completed, 2);
        assert!(stats.eta_ms.is_some());
    }

    #[tokio::test]
    async fn log_sink_appends_to_progress_md() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.md");
        let bus = ProgressBus::new("Book", 1, path.clone());
        let handle = bus.spawn_log_sink();
        bus.log(Severity::Info, None, None, "hello world");
        // Give the spawned sink a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(bus);
        let _ = handle.abort();
        let content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        assert!(content.contains("hello world"));
    }

    #[tokio::test]
    async fn no_subscribers_does_not_panic_or_block() {
        let dir = tempfile::tempdir().unwrap();
        let bus = ProgressBus::new("Book", 1, dir.path().join("progress.md"));
        bus.log(Severity::Info, None, None, "nobody listening");
    }
}
