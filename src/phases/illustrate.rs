//! Phase: Illustrate — generates one image per scene. The
//! first `style_bootstrap_count` scenes run serially and seed a visual style
//! guide (via a vision-capable summarization call over the images just
//! produced); every later scene runs concurrently with that style guide
//! folded into its prompt, so the whole book reads as one consistent set of
//! illustrations rather than N independent ones.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::atomic;
use crate::model::{EnrichedScene, Phase, PhaseStatus, Severity, VisualStyleGuide};
use crate::retry::{self, AttemptError, Classification};
use crate::state_store::PipelineState;

use super::PhaseContext;

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
struct ChatError {
    classification: Classification,
    message: String,
}

impl AttemptError for ChatError {
    fn classification(&self) -> Classification {
        self.classification
    }
    fn describe(&self) -> String {
        self.message.clone()
    }
}

fn classify_anyhow(err: &anyhow::Error) -> ChatError {
    let message = err.to_string();
    ChatError {
        classification: retry::classify(None, &message),
        message,
    }
}

#[derive(Debug, Clone)]
pub struct ImageResult {
    pub chapter: u32,
    pub scene_index: u32,
    pub path: String,
}

/// Slugifies a chapter title for use in a filename: lowercased, non-alphanumeric
/// runs collapsed to a single underscore, leading/trailing underscores trimmed.
fn sanitize_title(title: &str) -> String {
    let mut out = String::new();
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Image filename contract: `chapter_{n}_{sanitizedTitle}_scene_{k}.png` at
/// the output directory root.
pub fn image_path(ctx: &PhaseContext, scene: &EnrichedScene) -> std::path::PathBuf {
    ctx.output_dir.join(format!(
        "chapter_{}_{}_scene_{}.png",
        scene.chapter,
        sanitize_title(&scene.chapter_title),
        scene.scene_index
    ))
}

fn style_guide_path(ctx: &PhaseContext) -> std::path::PathBuf {
    ctx.output_dir.join(".style-guide.json")
}

fn load_style_guide(ctx: &PhaseContext) -> Option<VisualStyleGuide> {
    let bytes = std::fs::read(style_guide_path(ctx)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn persist_style_guide(ctx: &PhaseContext, guide: &VisualStyleGuide) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(guide)?;
    atomic::write(&style_guide_path(ctx), &bytes)?;
    Ok(())
}

/// Folds a structured style guide into the single instruction string
/// appended to every later scene's illustration prompt.
fn render_style_guide(guide: &VisualStyleGuide) -> String {
    format!(
        "art style: {}; palette: {}; lighting: {}; mood: {}; composition: {}",
        guide.art_style, guide.palette, guide.lighting, guide.mood, guide.composition
    )
}

/// Parses the vision-summarization reply into a `VisualStyleGuide`. Accepts
/// the documented JSON object; if the reply is not JSON, the whole text is
/// kept as `art_style` rather than discarded.
fn parse_style_guide(text: &str) -> VisualStyleGuide {
    #[derive(serde::Deserialize, Default)]
    struct Raw {
        #[serde(default)]
        art_style: String,
        #[serde(default)]
        palette: String,
        #[serde(default)]
        lighting: String,
        #[serde(default)]
        mood: String,
        #[serde(default)]
        composition: String,
    }
    let trimmed = text.trim();
    let json_slice = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s).trim())
        .unwrap_or(trimmed);

    match serde_json::from_str::<Raw>(json_slice) {
        Ok(raw) => VisualStyleGuide {
            art_style: raw.art_style,
            palette: raw.palette,
            lighting: raw.lighting,
            mood: raw.mood,
            composition: raw.composition,
        },
        Err(_) => VisualStyleGuide {
            art_style: text.to_string(),
            palette: String::new(),
            lighting: String::new(),
            mood: String::new(),
            composition: String::new(),
        },
    }
}

async fn generate_one(ctx: &PhaseContext, scene: &EnrichedScene, style_guide: Option<&str>) -> anyhow::Result<(ImageResult, Vec<u8>)> {
    let prompt = match style_guide {
        Some(guide) => format!("{}\n\nMaintain this visual style: {guide}", scene.illustration_prompt),
        None => scene.illustration_prompt.clone(),
    };

    let response = retry::run(
        || {
            let prompt = prompt.clone();
            async move { ctx.ai.image_generate(&prompt).await.map_err(|e| classify_anyhow(&e)) }
        },
        &ctx.retry_policy,
        |report| {
            if report.next_delay.is_some() {
                warn!(attempt = report.attempt, chapter = scene.chapter, scene = scene.scene_index, "illustrate attempt failed, retrying");
            }
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("illustrate chapter {} scene {}: {e}", scene.chapter, scene.scene_index))?;

    let path = image_path(ctx, scene);
    atomic::write(&path, &response.bytes)?;

    Ok((
        ImageResult {
            chapter: scene.chapter,
            scene_index: scene.scene_index,
            path: path.to_string_lossy().to_string(),
        },
        response.bytes,
    ))
}

/// Runs the serial style-bootstrap prefix, returning the derived style guide
/// and the images it already generated (so they are not regenerated).
async fn bootstrap(ctx: &PhaseContext, prefix: &[EnrichedScene]) -> anyhow::Result<(Option<VisualStyleGuide>, Vec<ImageResult>)> {
    if prefix.is_empty() {
        return Ok((None, vec![]));
    }

    let mut results = Vec::with_capacity(prefix.len());
    let mut bytes_collected = Vec::with_capacity(prefix.len());
    for scene in prefix {
        let (result, bytes) = generate_one(ctx, scene, None).await?;
        results.push(result);
        bytes_collected.push(bytes);
    }

    let summary_prompt = "Describe the consistent visual art style (palette, lighting, \
         linework, mood, composition) these illustrations share, so it can be reused as a \
         style instruction for further images. Respond as JSON: {\"art_style\": \"...\", \
         \"palette\": \"...\", \"lighting\": \"...\", \"mood\": \"...\", \"composition\": \"...\"}.";
    let style_guide = match ctx.ai.summarize_images(&bytes_collected, summary_prompt).await {
        Ok(response) => Some(parse_style_guide(&response.text)),
        Err(err) => {
            warn!(%err, "style bootstrap summarization failed, continuing without a shared style guide");
            None
        }
    };

    Ok((style_guide, results))
}

/// Runs the illustrate phase over `scenes`, which must already carry their
/// enriched illustration prompts.
pub async fn run(
    ctx: Arc<PhaseContext>,
    state: Arc<tokio::sync::Mutex<PipelineState>>,
    mut scenes: Vec<EnrichedScene>,
    skip_failed: bool,
) -> anyhow::Result<Vec<ImageResult>> {
    ctx.bus.set_phase(Phase::Illustrate);
    scenes.sort_by_key(|s| (s.chapter, s.scene_index));

    let chapter_numbers: Vec<u32> = {
        let mut numbers: Vec<u32> = scenes.iter().map(|s| s.chapter).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    };
    {
        let mut guard = state.lock().await;
        ctx.state_store
            .update_phase(&mut guard, Phase::Illustrate, &chapter_numbers, PhaseStatus::InProgress)
            .await?;
    }

    let persisted_guide = load_style_guide(&ctx);
    let bootstrap_count = if persisted_guide.is_some() {
        0
    } else {
        (ctx.style_bootstrap_count as usize).min(scenes.len())
    };
    let (prefix, rest) = scenes.split_at(bootstrap_count);

    let (style_guide, mut results) = if let Some(guide) = persisted_guide {
        info!("reusing persisted style guide, skipping serial bootstrap");
        (Some(render_style_guide(&guide)), vec![])
    } else {
        let (guide, results) = bootstrap(&ctx, prefix).await?;
        if let Some(guide) = &guide {
            if let Err(err) = persist_style_guide(&ctx, guide) {
                warn!(%err, "failed to persist style guide");
            }
        }
        info!(style_guide_present = guide.is_some(), "style bootstrap complete");
        (guide.map(|g| render_style_guide(&g)), results)
    };

    let semaphore = Arc::new(Semaphore::new(ctx.max_concurrency.max(1)));
    let mut join_set = tokio::task::JoinSet::new();
    let mut remaining_per_chapter: HashMap<u32, usize> = HashMap::new();
    for n in &chapter_numbers {
        *remaining_per_chapter.entry(*n).or_insert(0) += scenes.iter().filter(|s| s.chapter == *n).count();
    }
    for r in &results {
        if let Some(count) = remaining_per_chapter.get_mut(&r.chapter) {
            *count = count.saturating_sub(1);
        }
    }

    let mut halted = false;
    for scene in rest.to_vec() {
        if halted {
            break;
        }
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let ctx = ctx.clone();
        let style_guide = style_guide.clone();
        join_set.spawn(async move {
            let _permit = permit;
            let chapter = scene.chapter;
            let scene_index = scene.scene_index;
            let outcome = generate_one(&ctx, &scene, style_guide.as_deref()).await;
            (chapter, scene_index, outcome.map(|(r, _)| r))
        });

        while join_set.len() >= ctx.max_concurrency {
            let (chapter, scene_index, outcome) = join_set.join_next().await.expect("just checked len").expect("illustrate task panicked");
            if !handle_outcome(&ctx, &state, chapter, scene_index, outcome, skip_failed, &mut results, &mut remaining_per_chapter).await? {
                halted = true;
                break;
            }
        }
    }

    while let Some(joined) = join_set.join_next().await {
        let (chapter, scene_index, outcome) = joined.expect("illustrate task panicked");
        handle_outcome(&ctx, &state, chapter, scene_index, outcome, skip_failed, &mut results, &mut remaining_per_chapter).await?;
    }

    Ok(results)
}

async fn handle_outcome(
    ctx: &Arc<PhaseContext>,
    state: &Arc<tokio::sync::Mutex<PipelineState>>,
    chapter: u32,
    scene_index: u32,
    outcome: anyhow::Result<ImageResult>,
    skip_failed: bool,
    results: &mut Vec<ImageResult>,
    remaining_per_chapter: &mut HashMap<u32, usize>,
) -> anyhow::Result<bool> {
    let should_continue = match outcome {
        Ok(result) => {
            ctx.bus.log_image_generation(chapter, scene_index);
            results.push(result);
            true
        }
        Err(err) => {
            ctx.bus.log(
                Severity::Error,
                Some(Phase::Illustrate),
                Some(chapter),
                format!("image generation failed for chapter {chapter} scene {scene_index}: {err}"),
            );
            if !skip_failed {
                let mut guard = state.lock().await;
                ctx.state_store
                    .mark_failed(&mut guard, Phase::Illustrate, chapter, err.to_string(), None)
                    .await?;
            }
            skip_failed
        }
    };

    if let Some(count) = remaining_per_chapter.get_mut(&chapter) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            let mut guard = state.lock().await;
            ctx.state_store
                .update_chapter(&mut guard, Phase::Illustrate, chapter, PhaseStatus::Completed)
                .await?;
        }
    }

    Ok(should_continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockAiClient;
    use crate::bus::ProgressBus;
    use crate::registry::{EntityRegistry, MergeStrategy};
    use crate::registry::cache::MatcherCache;
    use crate::retry::RetryPolicy;
    use crate::state_store::StateStore;
    use crate::tokens::{ModelCost, TokenLimits};
    use std::time::Duration;

    fn test_ctx(dir: &std::path::Path, style_bootstrap_count: u32) -> Arc<PhaseContext> {
        Arc::new(PhaseContext {
            ai: Arc::new(MockAiClient::json_replies(vec![])),
            registry: Arc::new(EntityRegistry::new(dir.join("registry.json"), MergeStrategy::Concatenate)),
            matcher_cache: Arc::new(MatcherCache::new(10, Duration::from_secs(60))),
            confidence_threshold: 0.7,
            bus: ProgressBus::new("Book", 1, dir.join("progress.md")),
            state_store: Arc::new(StateStore::new(dir.join(".state.json"))),
            retry_policy: RetryPolicy {
                max_attempts: 2,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                rate_limit_initial: Duration::from_millis(1),
                rate_limit_max: Duration::from_millis(2),
            },
            max_concurrency: 2,
            pages_per_image: 5,
            style_bootstrap_count,
            output_dir: dir.to_path_buf(),
            book_id: "book".to_string(),
            model_cost: ModelCost::default(),
            token_limits: TokenLimits::default(),
        })
    }

    fn enriched(chapter: u32, index: u32) -> EnrichedScene {
        EnrichedScene {
            chapter,
            chapter_title: "Dawn Over the Hills".to_string(),
            scene_index: index,
            illustration_prompt: format!("scene {chapter}-{index}"),
        }
    }

    #[tokio::test]
    async fn bootstrap_count_zero_skips_serial_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 0);
        let state = Arc::new(tokio::sync::Mutex::new(PipelineState::new("Book", vec![1])));

        let results = run(ctx, state, vec![enriched(1, 1), enriched(1, 2)], false).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn every_scene_gets_an_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 1);
        let state = Arc::new(tokio::sync::Mutex::new(PipelineState::new("Book", vec![1])));

        let results = run(ctx, state, vec![enriched(1, 1), enriched(1, 2), enriched(1, 3)], false)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        for r in &results {
            assert!(std::path::Path::new(&r.path).exists());
        }
    }

    #[tokio::test]
    async fn chapter_marked_completed_once_all_its_scenes_finish() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 0);
        let state = Arc::new(tokio::sync::Mutex::new(PipelineState::new("Book", vec![1, 2])));

        run(ctx.clone(), state.clone(), vec![enriched(1, 1), enriched(2, 1)], false).await.unwrap();
        let guard = state.lock().await;
        assert_eq!(guard.chapters[&Phase::Illustrate][&1].status, PhaseStatus::Completed);
        assert_eq!(guard.chapters[&Phase::Illustrate][&2].status, PhaseStatus::Completed);
    }

    #[test]
    fn image_filename_follows_the_documented_contract() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 0);
        let path = image_path(&ctx, &enriched(3, 2));
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "chapter_3_dawn_over_the_hills_scene_2.png");
    }

    #[test]
    fn persisted_style_guide_short_circuits_bootstrap_gate() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), 3);
        assert!(load_style_guide(&ctx).is_none());

        let guide = VisualStyleGuide {
            art_style: "watercolor".into(),
            palette: "warm earth tones".into(),
            lighting: "soft".into(),
            mood: "wistful".into(),
            composition: "wide".into(),
        };
        persist_style_guide(&ctx, &guide).unwrap();

        let loaded = load_style_guide(&ctx).unwrap();
        assert_eq!(loaded.art_style, "watercolor");
        assert!(render_style_guide(&loaded).contains("watercolor"));
    }
}
