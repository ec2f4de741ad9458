//! Phase: Extract — a second entity-catalog pass over the
//! whole book, reconciling what Analyze already found against a full-text
//! read. Prefers one bulk call over the concatenated book; falls back to an
//! iterative per-chapter pass when the whole book will not fit the model's
//! context window.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::model::{ChapterDescriptor, EntityType, Phase, PhaseStatus, SupportingQuote};
use crate::registry::{NewEntity, UpsertContext};
use crate::retry::{self, AttemptError, Classification};
use crate::state_store::PipelineState;
use crate::tokens;

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

#[derive(Debug, Deserialize, Default)]
struct ExtractResponse {
    #[serde(default)]
    entities: Vec<RawEntity>,
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

fn prompt_for(text: &str, book_title: &str) -> String {
    format!(
        "You are cataloging every named character, creature, place, item, and\n\
         notable object that appears in \"{book_title}\". Read the text below and\n\
         list each one once, with its best single description and up to three\n\
         supporting quotes.\n\n\
         Respond as JSON: {{\"entities\": [{{\"type\": \"character|creature|place|item|object\",\n\
         \"name\": \"...\", \"description\": \"...\", \"quotes\": [\"...\"]}}]}}\n\n\
         Text:\n{text}"
    )
}

async fn call_and_upsert(
    ctx: &PhaseContext,
    prompt: String,
    chapter_for_provenance: u32,
) -> anyhow::Result<(u32, u64)> {
    let response = retry::run(
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
                warn!(attempt = report.attempt, "extract attempt failed, retrying");
            }
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("extract call failed: {e}"))?;

    let parsed: ExtractResponse = serde_json::from_str(response.text.trim())
        .map_err(|e| anyhow::anyhow!("extract returned unparseable JSON: {e}"))?;

    for raw in &parsed.entities {
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
                UpsertContext {
                    book_id: ctx.book_id.clone(),
                    chapter: chapter_for_provenance,
                },
            )
            .await;
    }

    let tokens_used = response.usage.input_tokens + response.usage.output_tokens;
    Ok((parsed.entities.len() as u32, tokens_used))
}

/// Runs the extract phase. `book_title` and `chapters` come from the
/// immutable book descriptor; chapters must already be in reading order.
pub async fn run(
    ctx: Arc<PhaseContext>,
    state: Arc<tokio::sync::Mutex<PipelineState>>,
    book_title: &str,
    chapters: Vec<ChapterDescriptor>,
) -> anyhow::Result<u32> {
    ctx.bus.set_phase(Phase::Extract);
    let chapter_numbers: Vec<u32> = chapters.iter().map(|c| c.number).collect();

    {
        let mut guard = state.lock().await;
        ctx.state_store
            .update_phase(&mut guard, Phase::Extract, &chapter_numbers, PhaseStatus::InProgress)
            .await?;
    }

    let whole_book: String = chapters
        .iter()
        .map(|c| format!("### {}\n{}", c.title, c.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let estimate = tokens::estimate(&whole_book, 4000, ctx.model_cost, ctx.token_limits);

    let total_entities = if !estimate.will_exceed_limit {
        info!(tokens = estimate.total, "extract: whole book fits in one bulk call");
        let prompt = prompt_for(&whole_book, book_title);
        let provenance_chapter = chapters.first().map(|c| c.number).unwrap_or(1);
        match call_and_upsert(&ctx, prompt, provenance_chapter).await {
            Ok((count, tokens_used)) => {
                let mut guard = state.lock().await;
                ctx.state_store.add_tokens(&mut guard, tokens_used).await?;
                ctx.bus.add_tokens(tokens_used);
                count
            }
            Err(err) => {
                warn!(%err, "bulk extract failed, falling back to iterative per-chapter pass");
                iterative_fallback(&ctx, &state, &chapters).await?
            }
        }
    } else {
        info!(
            tokens = estimate.total,
            suggested_splits = ?estimate.suggested_splits,
            "extract: whole book exceeds context budget, running iterative per-chapter pass"
        );
        iterative_fallback(&ctx, &state, &chapters).await?
    };

    {
        let mut guard = state.lock().await;
        ctx.state_store
            .update_phase(&mut guard, Phase::Extract, &chapter_numbers, PhaseStatus::Completed)
            .await?;
    }
    ctx.bus.add_entities(total_entities);

    Ok(total_entities)
}

/// Fallback path: one call per chapter ("iterative whole-book fallback").
/// Each chapter is itself split via the Token Accountant's
/// paragraph-boundary splitter when it alone exceeds the budget.
async fn iterative_fallback(
    ctx: &Arc<PhaseContext>,
    state: &Arc<tokio::sync::Mutex<PipelineState>>,
    chapters: &[ChapterDescriptor],
) -> anyhow::Result<u32> {
    let mut total = 0u32;
    let budget_chars = (ctx.token_limits.context_length as f64 * ctx.token_limits.safety_margin * 3.5) as usize;

    for chapter in chapters {
        let chunks = tokens::split_for_budget(&chapter.content, budget_chars.max(1));
        for chunk in chunks {
            let prompt = prompt_for(&chunk, &chapter.title);
            match call_and_upsert(ctx, prompt, chapter.number).await {
                Ok((count, tokens_used)) => {
                    total += count;
                    let mut guard = state.lock().await;
                    ctx.state_store.add_tokens(&mut guard, tokens_used).await?;
                    ctx.bus.add_tokens(tokens_used);
                }
                Err(err) => {
                    ctx.bus.log(
                        crate::model::Severity::Warning,
                        Some(Phase::Extract),
                        Some(chapter.number),
                        format!("extract chunk failed for chapter {}: {err}", chapter.number),
                    );
                }
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockAiClient;
    use crate::bus::ProgressBus;
    use crate::registry::{EntityRegistry, MergeStrategy};
    use crate::registry::cache::MatcherCache;
    use crate::retry::RetryPolicy;
    use crate::state_store::{PipelineState, StateStore};
    use crate::tokens::{ModelCost, TokenLimits};
    use std::time::Duration;

    fn chapter(number: u32, content: &str) -> ChapterDescriptor {
        ChapterDescriptor {
            number,
            title: format!("Chapter {number}"),
            content: content.to_string(),
            page_start: 1,
            page_end: 2,
            token_estimate: 10,
        }
    }

    async fn test_ctx(dir: &std::path::Path, ai: MockAiClient) -> Arc<PhaseContext> {
        Arc::new(PhaseContext {
            ai: Arc::new(ai),
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
            style_bootstrap_count: 3,
            output_dir: dir.to_path_buf(),
            book_id: "book".to_string(),
            model_cost: ModelCost::default(),
            token_limits: TokenLimits::default(),
        })
    }

    #[tokio::test]
    async fn small_book_runs_a_single_bulk_call() {
        let dir = tempfile::tempdir().unwrap();
        let ai = MockAiClient::json_replies(vec![
            r#"{"entities": [{"type": "character", "name": "Alice", "description": "the protagonist", "quotes": []}]}"#.to_string(),
        ]);
        let ctx = test_ctx(dir.path(), ai).await;
        let state = Arc::new(tokio::sync::Mutex::new(PipelineState::new("Book", vec![1])));
        let chapters = vec![chapter(1, "Alice walked into the forest.")];

        let count = run(ctx.clone(), state, "Book", chapters).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(ctx.registry.len(), 1);
    }

    #[tokio::test]
    async fn oversized_book_falls_back_to_iterative_pass() {
        let dir = tempfile::tempdir().unwrap();
        let ai = MockAiClient::json_replies(vec![
            r#"{"entities": [{"type": "place", "name": "Forest", "description": "dark woods", "quotes": []}]}"#.to_string(),
            r#"{"entities": [{"type": "place", "name": "Castle", "description": "ancient keep", "quotes": []}]}"#.to_string(),
        ]);
        let mut ctx_arc = test_ctx(dir.path(), ai).await;
        Arc::get_mut(&mut ctx_arc).unwrap().token_limits = TokenLimits {
            context_length: 10,
            safety_margin: 0.9,
        };
        let state = Arc::new(tokio::sync::Mutex::new(PipelineState::new("Book", vec![1, 2])));
        let chapters = vec![chapter(1, "word ".repeat(50).as_str()), chapter(2, "word ".repeat(50).as_str())];

        let count = run(ctx_arc.clone(), state, "Book", chapters).await.unwrap();
        assert_eq!(count, 2);
    }
}
