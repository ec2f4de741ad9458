//! Phase: Analyze — unified per-chapter extraction. Each selected chapter is
//! scheduled onto a bounded worker pool; a single prompt per chapter asks the
//! model for both scenes and entity mentions in one call, since the text is
//! already loaded and re-reading it for a second call would waste tokens.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::model::{ChapterDescriptor, ElementContext, EntityType, Phase, PhaseStatus, Scene, SupportingQuote};
use crate::registry::{NewEntity, UpsertContext};
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

#[derive(Debug, Deserialize)]
struct RawScene {
    quote: String,
    description: String,
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    #[serde(rename = "type")]
    entity_type: EntityType,
    name: String,
    description: String,
    #[serde(default)]
    quotes: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AnalyzeResponse {
    #[serde(default)]
    scenes: Vec<RawScene>,
    #[serde(default)]
    entities: Vec<RawEntity>,
}

/// Parses the model's reply. Accepts the documented `{scenes, entities}`
/// object, but also a bare array (tolerated as a scenes-only reply).
fn parse_response(text: &str) -> anyhow::Result<AnalyzeResponse> {
    let trimmed = text.trim();
    let json_slice = extract_json(trimmed).unwrap_or(trimmed);

    if let Ok(parsed) = serde_json::from_str::<AnalyzeResponse>(json_slice) {
        if !parsed.scenes.is_empty() || !parsed.entities.is_empty() {
            return Ok(parsed);
        }
    }
    if let Ok(scenes) = serde_json::from_str::<Vec<RawScene>>(json_slice) {
        return Ok(AnalyzeResponse { scenes, entities: vec![] });
    }
    serde_json::from_str::<AnalyzeResponse>(json_slice).map_err(|e| e.into())
}

/// Strips a leading/trailing markdown code fence if present.
fn extract_json(text: &str) -> Option<&str> {
    let text = text.strip_prefix("```json").or_else(|| text.strip_prefix("```"))?;
    let text = text.strip_suffix("```").unwrap_or(text);
    Some(text.trim())
}

/// Number of scenes to request for a chapter: one per `pages_per_image`
/// pages, rounded up, never fewer than one.
fn scenes_wanted(chapter: &ChapterDescriptor, pages_per_image: u32) -> u32 {
    let pages_per_image = pages_per_image.max(1);
    chapter.page_count().div_ceil(pages_per_image).max(1)
}

fn build_prompt(chapter: &ChapterDescriptor, element_context: &ElementContext, pages_per_image: u32) -> String {
    let mut context_block = String::new();
    if !element_context.is_empty() {
        context_block.push_str("Known story elements so far:\n");
        for (name, fact) in element_context {
            context_block.push_str(&format!("- {name}: {fact}\n"));
        }
    }
    let k = scenes_wanted(chapter, pages_per_image);
    format!(
        "You are analyzing chapter {} (\"{}\") of a book for illustration planning.\n\
         {context_block}\n\
         Identify a dense list of exactly {k} of the most visually compelling scenes\n\
         (with a supporting quote, a description, and your reasoning for choosing it),\n\
         and every named character, creature, place, or notable object mentioned.\n\n\
         Respond as JSON: {{\"scenes\": [{{\"quote\": \"...\", \"description\": \"...\", \"reasoning\": \"...\"}}],\n\
         \"entities\": [{{\"type\": \"character|creature|place|item|object\", \"name\": \"...\", \"description\": \"...\", \"quotes\": [\"...\"]}}]}}\n\n\
         Chapter text:\n{}",
        chapter.number, chapter.title, chapter.content
    )
}

pub struct ChapterResult {
    pub chapter: u32,
    pub scenes: Vec<Scene>,
    pub entity_count: u32,
    pub tokens_used: u64,
}

async fn analyze_one_chapter(
    ctx: &PhaseContext,
    book_id: &str,
    chapter: &ChapterDescriptor,
    element_context: &ElementContext,
) -> anyhow::Result<ChapterResult> {
    let prompt = build_prompt(chapter, element_context, ctx.pages_per_image);

    let report = retry::run(
        || {
            let prompt = prompt.clone();
            async move {
                ctx.ai
                    .chat_complete("", &prompt, true)
                    .await
                    .map_err(|e| classify_anyhow(&e))
            }
        },
        &ctx.retry_policy,
        |report| {
            if report.next_delay.is_some() {
                warn!(attempt = report.attempt, chapter = chapter.number, "analyze attempt failed, retrying");
            }
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("analyze chapter {}: {e}", chapter.number))?;

    let parsed = parse_response(&report.text)
        .map_err(|e| anyhow::anyhow!("analyze chapter {} returned unparseable JSON: {e}", chapter.number))?;

    let mut scenes = Vec::with_capacity(parsed.scenes.len());
    for (i, raw) in parsed.scenes.into_iter().enumerate() {
        scenes.push(Scene {
            chapter: chapter.number,
            chapter_title: chapter.title.clone(),
            index: i as u32 + 1,
            quote: raw.quote,
            description: raw.description,
            reasoning: raw.reasoning,
            image_path: None,
        });
    }

    for raw in parsed.entities.iter() {
        let new_entity = NewEntity {
            entity_type: raw.entity_type,
            name: raw.name.clone(),
            description: raw.description.clone(),
            quotes: raw
                .quotes
                .iter()
                .map(|q| SupportingQuote { text: q.clone(), page: None })
                .collect(),
        };
        ctx.registry
            .upsert(
                ctx.ai.as_ref(),
                &ctx.matcher_cache,
                ctx.confidence_threshold,
                new_entity,
                UpsertContext { book_id: book_id.to_string(), chapter: chapter.number },
            )
            .await;
    }

    Ok(ChapterResult {
        chapter: chapter.number,
        entity_count: parsed.entities.len() as u32,
        tokens_used: report.usage.input_tokens + report.usage.output_tokens,
        scenes,
    })
}

/// Builds the "known elements so far" context passed into each chapter's
/// prompt, biasing the model toward consistent naming.
fn element_context_snapshot(ctx: &PhaseContext) -> ElementContext {
    let mut map = HashMap::new();
    for entity in ctx.registry.snapshot() {
        map.insert(entity.name.clone(), entity.description.clone());
    }
    map
}

/// Runs the analyze phase over `chapters`, honoring `skip_failed`: when
/// true, a chapter's failure is recorded and scheduling continues; when
/// false, the first failure halts the phase.
pub async fn run(
    ctx: Arc<PhaseContext>,
    state: Arc<tokio::sync::Mutex<PipelineState>>,
    chapters: Vec<ChapterDescriptor>,
    skip_failed: bool,
) -> anyhow::Result<Vec<ChapterResult>> {
    ctx.bus.set_phase(Phase::Analyze);
    let book_id = ctx.book_id.clone();
    let semaphore = Arc::new(Semaphore::new(ctx.max_concurrency.max(1)));
    let mut join_set = tokio::task::JoinSet::new();
    let mut results = Vec::new();
    let mut halted = false;

    for chapter in chapters {
        if halted {
            break;
        }
        {
            let mut guard = state.lock().await;
            ctx.state_store
                .update_chapter(&mut guard, Phase::Analyze, chapter.number, PhaseStatus::InProgress)
                .await?;
        }
        ctx.bus.start_chapter(chapter.number);

        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let task_ctx = ctx.clone();
        let element_context = element_context_snapshot(&ctx);
        let book_id = book_id.clone();

        join_set.spawn(async move {
            let _permit = permit;
            let number = chapter.number;
            let result = analyze_one_chapter(&task_ctx, &book_id, &chapter, &element_context).await;
            (number, result)
        });

        // Worker-pool scheduling: drain completions as they arrive so a slow
        // chapter never blocks scheduling the rest.
        while join_set.len() >= ctx.max_concurrency {
            let (number, result) = join_set.join_next().await.expect("just checked len").expect("analyze task panicked");
            let should_continue = handle_result(&ctx, &state, number, result, skip_failed, &mut results).await?;
            if !should_continue {
                halted = true;
                break;
            }
        }
    }

    while let Some(joined) = join_set.join_next().await {
        let (number, result) = joined.expect("analyze task panicked");
        handle_result(&ctx, &state, number, result, skip_failed, &mut results).await?;
    }

    Ok(results)
}

async fn handle_result(
    ctx: &Arc<PhaseContext>,
    state: &Arc<tokio::sync::Mutex<PipelineState>>,
    chapter_number: u32,
    result: anyhow::Result<ChapterResult>,
    skip_failed: bool,
    results: &mut Vec<ChapterResult>,
) -> anyhow::Result<bool> {
    match result {
        Ok(r) => {
            ctx.bus.add_scenes(r.scenes.len() as u32);
            ctx.bus.add_entities(r.entity_count);
            ctx.bus.add_tokens(r.tokens_used);
            ctx.bus.complete_chapter(chapter_number, r.entity_count);
            let mut guard = state.lock().await;
            ctx.state_store.add_tokens(&mut guard, r.tokens_used).await?;
            ctx.state_store
                .update_chapter(&mut guard, Phase::Analyze, chapter_number, PhaseStatus::Completed)
                .await?;
            info!(chapter = chapter_number, scenes = r.scenes.len(), "chapter analyzed");
            results.push(r);
            Ok(true)
        }
        Err(err) => {
            let mut guard = state.lock().await;
            ctx.state_store
                .mark_failed(&mut guard, Phase::Analyze, chapter_number, err.to_string(), None)
                .await?;
            ctx.bus.log(
                crate::model::Severity::Error,
                Some(Phase::Analyze),
                Some(chapter_number),
                format!("chapter {chapter_number} failed: {err}"),
            );
            Ok(skip_failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_response() {
        let text = r#"{"scenes": [{"quote": "q", "description": "d", "reasoning": "r"}], "entities": []}"#;
        let parsed = parse_response(text).unwrap();
        assert_eq!(parsed.scenes.len(), 1);
    }

    #[test]
    fn tolerates_bare_array_response() {
        let text = r#"[{"quote": "q", "description": "d", "reasoning": "r"}]"#;
        let parsed = parse_response(text).unwrap();
        assert_eq!(parsed.scenes.len(), 1);
        assert!(parsed.entities.is_empty());
    }

    #[test]
    fn strips_markdown_code_fence() {
        let text = "```json\n{\"scenes\": [], \"entities\": []}\n```";
        let parsed = parse_response(text).unwrap();
        assert!(parsed.scenes.is_empty());
    }

    #[test]
    fn element_context_is_injected_into_prompt() {
        let chapter = ChapterDescriptor {
            number: 1,
            title: "Dawn".into(),
            content: "text".into(),
            page_start: 1,
            page_end: 2,
            token_estimate: 10,
        };
        let mut ctx = ElementContext::new();
        ctx.insert("Dragon".to_string(), "green scales".to_string());
        let prompt = build_prompt(&chapter, &ctx, 5);
        assert!(prompt.contains("Dragon"));
        assert!(prompt.contains("green scales"));
    }

    #[test]
    fn scenes_wanted_rounds_up_and_floors_at_one() {
        let chapter = ChapterDescriptor {
            number: 1,
            title: "Dawn".into(),
            content: "text".into(),
            page_start: 1,
            page_end: 11,
            token_estimate: 10,
        };
        assert_eq!(scenes_wanted(&chapter, 5), 3);
        assert_eq!(scenes_wanted(&chapter, 100), 1);
    }
}
