//! Orchestrator: loads the book, resolves which chapters and phases to run
//! against the durable state, drives each phase in turn, and maps the
//! outcome onto an exit code.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::ai::gemini::{looks_like_gemini, GeminiClient, GeminiConfig};
use crate::ai::openai::{OpenAiClient, OpenAiConfig};
use crate::ai::AiClient;
use crate::artifacts;
use crate::bus::ProgressBus;
use crate::cli::{Cli, ElementsFilter, PhaseSelection};
use crate::config::ResolvedConfig;
use crate::dashboard::DashboardServer;
use crate::model::{BookDescriptor, ChapterDescriptor, Phase, PhaseStatus};
use crate::phases::{analyze, enrich, extract, illustrate, PhaseContext};
use crate::registry::{EntityRegistry, MergeStrategy};
use crate::registry::cache::MatcherCache;
use crate::retry::RetryPolicy;
use crate::state_store::{PipelineState, StateStore};
use crate::tokens::{ModelCost, TokenLimits};

/// Exit code mapping: `0` every selected phase/chapter completed, `1` the
/// run finished with some chapters skipped as failed, or halted on any
/// unrecoverable error after all retries or a fatal state-consistency
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    CompletedWithFailures,
    Halted,
}

impl ExitOutcome {
    pub fn code(self) -> i32 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::CompletedWithFailures => 1,
            ExitOutcome::Halted => 1,
        }
    }
}

fn load_book(book_path: &Path) -> Result<BookDescriptor> {
    let path = if book_path.is_dir() {
        book_path.join("book.json")
    } else {
        book_path.to_path_buf()
    };
    let bytes = std::fs::read(&path).with_context(|| format!("failed to read book descriptor at {}", path.display()))?;
    let book: BookDescriptor =
        serde_json::from_slice(&bytes).with_context(|| format!("failed to parse book descriptor at {}", path.display()))?;
    Ok(book)
}

const CLIENT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

fn build_ai_client(config: &ResolvedConfig) -> Result<Arc<dyn AiClient>> {
    if config.provider.eq_ignore_ascii_case("gemini") || looks_like_gemini(&config.base_url) {
        let client = GeminiClient::new(GeminiConfig {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout: CLIENT_TIMEOUT,
        })?;
        Ok(Arc::new(client))
    } else {
        let client = OpenAiClient::new(OpenAiConfig {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            image_api_key: config.image_api_key.clone(),
            model: config.model.clone(),
            image_model: "dall-e-3".to_string(),
            timeout: CLIENT_TIMEOUT,
        })?;
        Ok(Arc::new(client))
    }
}

pub struct Orchestrator {
    pub cli: Cli,
    pub config: ResolvedConfig,
}

impl Orchestrator {
    pub fn new(cli: Cli, config: ResolvedConfig) -> Self {
        Orchestrator { cli, config }
    }

    pub async fn run(self) -> Result<ExitOutcome> {
        let book = load_book(&self.cli.book_path)?;
        let output_dir = self
            .cli
            .output_dir
            .clone()
            .unwrap_or_else(|| self.cli.book_path.clone());
        tokio::fs::create_dir_all(&output_dir).await.ok();

        let chapter_numbers: Vec<u32> = book.chapters.iter().map(|c| c.number).collect();
        let state_store = Arc::new(StateStore::new(output_dir.join(".state.json")));
        let mut state = match state_store.load().await? {
            Some(existing) => existing,
            None => PipelineState::new(book.title.clone(), chapter_numbers.clone()),
        };

        if self.cli.clear_errors {
            let mut total_cleared = 0usize;
            for phase in Phase::ALL {
                total_cleared += state_store.clear_errors(&mut state, phase).await?;
            }
            if total_cleared > 0 {
                println!("Cleared {total_cleared} failed chapter(s) for retry");
            }
        }

        let registry_path = crate::registry::default_persist_path(&output_dir);
        let registry = Arc::new(EntityRegistry::load(registry_path, MergeStrategy::Concatenate)?);
        let matcher_cache = Arc::new(MatcherCache::new(
            crate::registry::cache::DEFAULT_CAPACITY,
            crate::registry::cache::DEFAULT_TTL,
        ));
        let bus = ProgressBus::new(book.title.clone(), chapter_numbers.len() as u32, output_dir.join("progress.md"));
        bus.spawn_log_sink();

        let dashboard = if self.cli.dashboard {
            let server = DashboardServer::new(bus.clone());
            server.start(&self.cli.dashboard_host, self.cli.dashboard_port).await?;
            Some(server)
        } else {
            None
        };

        let ai_client = build_ai_client(&self.config)?;
        let phase_ctx = Arc::new(PhaseContext {
            ai: ai_client,
            registry: registry.clone(),
            matcher_cache,
            confidence_threshold: self.config.entity_match_confidence_threshold,
            bus: bus.clone(),
            state_store: state_store.clone(),
            retry_policy: RetryPolicy::default(),
            max_concurrency: self.config.max_concurrency,
            pages_per_image: self.config.pages_per_image,
            style_bootstrap_count: self.config.style_bootstrap_count,
            output_dir: output_dir.clone(),
            book_id: book.title.clone(),
            model_cost: ModelCost::default(),
            token_limits: TokenLimits::default(),
        });

        let target_chapters = self.resolve_target_chapters(&book)?;
        let state = Arc::new(tokio::sync::Mutex::new(state));
        let mut outcome = ExitOutcome::Success;

        for phase in self.cli.selected_phases() {
            let result = self.run_phase(phase, &phase_ctx, &state, &book, &target_chapters, &output_dir).await;
            match result {
                Ok(PhaseOutcome::Clean) => {}
                Ok(PhaseOutcome::WithFailures) => outcome = outcome.max(ExitOutcome::CompletedWithFailures),
                Err(err) => {
                    warn!(%err, phase = ?phase, "phase halted on an unrecovered error");
                    bus.log(crate::model::Severity::Error, None, None, format!("{err}"));
                    outcome = ExitOutcome::Halted;
                    break;
                }
            }
        }

        registry.persist().await?;
        {
            let mut guard = state.lock().await;
            state_store.save(&mut guard).await?;
        }

        if let Some(server) = dashboard {
            server.stop().await;
        }

        Ok(outcome)
    }

    fn resolve_target_chapters(&self, book: &BookDescriptor) -> Result<Vec<u32>> {
        match &self.cli.chapters {
            None => Ok(book.chapters.iter().map(|c| c.number).collect()),
            Some(spec) => {
                let positions = crate::cli::parse_chapter_filter(spec)?;
                let chapter_numbers: Vec<u32> = book.chapters.iter().map(|c| c.number).collect();
                crate::cli::map_positions_to_chapter_numbers(&positions, &chapter_numbers)
            }
        }
    }

    async fn run_phase(
        &self,
        phase: PhaseSelection,
        ctx: &Arc<PhaseContext>,
        state: &Arc<tokio::sync::Mutex<PipelineState>>,
        book: &BookDescriptor,
        target_chapters: &[u32],
        output_dir: &Path,
    ) -> Result<PhaseOutcome> {
        let chapters = self.select_chapters_for(phase, state, target_chapters).await?;
        if chapters.is_empty() {
            info!(phase = ?phase, "no chapters to process (already completed; pass --force to redo)");
            return Ok(PhaseOutcome::Clean);
        }

        let descriptors: Vec<ChapterDescriptor> = book
            .chapters
            .iter()
            .filter(|c| chapters.contains(&c.number))
            .cloned()
            .collect();

        match phase {
            PhaseSelection::Analyze => {
                let results = analyze::run(ctx.clone(), state.clone(), descriptors, self.cli.skip_failed).await?;
                let chapters_md = artifacts::render_chapters_md(
                    &book.chapters,
                    &results.iter().map(|r| (r.chapter, r.scenes.clone())).collect::<Vec<_>>(),
                );
                artifacts::write_chapters_md(output_dir, &chapters_md).await?;
                self.outcome_for(chapters.len(), results.len())
            }
            PhaseSelection::Extract => {
                extract::run(ctx.clone(), state.clone(), &book.title, descriptors).await?;
                let entities = ctx.registry.snapshot();
                let elements_md = artifacts::render_elements_md(&entities);
                artifacts::write_elements_md(output_dir, &elements_md).await?;
                Ok(PhaseOutcome::Clean)
            }
            PhaseSelection::Enrich => {
                let chapters_md = tokio::fs::read_to_string(output_dir.join("Chapters.md")).await.unwrap_or_default();
                let mut scenes = artifacts::parse_chapters_md(&chapters_md);
                if let Some(filter_spec) = &self.cli.elements_filter {
                    let filter = ElementsFilter::parse(filter_spec)?;
                    let entities = ctx.registry.snapshot();
                    scenes.retain(|s| entities.iter().any(|e| filter.matches(entity_type_str(e.entity_type), &e.name) && s.description.to_lowercase().contains(&e.name.to_lowercase())));
                }
                enrich::run(ctx.clone(), state.clone(), scenes).await?;
                Ok(PhaseOutcome::Clean)
            }
            PhaseSelection::Illustrate => {
                let enriched = enrich::load(ctx)?.unwrap_or_default();
                let unfinished: Vec<_> = enriched
                    .into_iter()
                    .filter(|s| chapters.contains(&s.chapter))
                    .filter(|s| !illustrate::image_path(ctx, s).exists())
                    .collect();
                let results = illustrate::run(ctx.clone(), state.clone(), unfinished, self.cli.skip_failed).await?;
                let contents_md = artifacts::render_contents_md(&book.title, book.chapters.len(), results.len(), ctx.registry.len());
                artifacts::write_contents_md(output_dir, &contents_md).await?;
                self.outcome_for(chapters.len(), results.len())
            }
        }
    }

    fn outcome_for(&self, requested: usize, completed: usize) -> Result<PhaseOutcome> {
        if completed < requested {
            Ok(PhaseOutcome::WithFailures)
        } else {
            Ok(PhaseOutcome::Clean)
        }
    }

    /// Applies `--force`/`--continue`/`--retry-failed`/`--limit` against the
    /// state store's per-chapter record for this phase.
    async fn select_chapters_for(
        &self,
        phase: PhaseSelection,
        state: &Arc<tokio::sync::Mutex<PipelineState>>,
        target_chapters: &[u32],
    ) -> Result<Vec<u32>> {
        let model_phase = match phase {
            PhaseSelection::Analyze => Phase::Analyze,
            PhaseSelection::Extract => Phase::Extract,
            PhaseSelection::Enrich => Phase::Enrich,
            PhaseSelection::Illustrate => Phase::Illustrate,
        };

        let guard = state.lock().await;
        let mut selected: Vec<u32> = target_chapters
            .iter()
            .copied()
            .filter(|n| {
                if self.cli.force {
                    return true;
                }
                let status = guard
                    .chapters
                    .get(&model_phase)
                    .and_then(|m| m.get(n))
                    .map(|r| r.status)
                    .unwrap_or(PhaseStatus::Pending);
                match status {
                    PhaseStatus::Completed => false,
                    PhaseStatus::Failed => self.cli.retry_failed,
                    PhaseStatus::Pending | PhaseStatus::InProgress => true,
                }
            })
            .collect();
        drop(guard);

        if let Some(limit) = self.cli.limit {
            selected.truncate(limit);
        }
        Ok(selected)
    }
}

fn entity_type_str(t: crate::model::EntityType) -> &'static str {
    match t {
        crate::model::EntityType::Character => "character",
        crate::model::EntityType::Creature => "creature",
        crate::model::EntityType::Place => "place",
        crate::model::EntityType::Item => "item",
        crate::model::EntityType::Object => "object",
    }
}

enum PhaseOutcome {
    Clean,
    WithFailures,
}

impl ExitOutcome {
    fn max(self, other: ExitOutcome) -> ExitOutcome {
        fn rank(o: ExitOutcome) -> u8 {
            match o {
                ExitOutcome::Success => 0,
                ExitOutcome::CompletedWithFailures => 1,
                ExitOutcome::Halted => 2,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}
