//! Phase: Enrich — assembles each scene's illustration
//! prompt from its own description and the entity registry's known facts.
//! Makes no AI calls: it is a pure, idempotent function of the scene catalog
//! and the registry snapshot, so re-running it is always safe and cheap.

use std::sync::Arc;

use crate::atomic;
use crate::model::{EnrichedScene, Phase, PhaseStatus, Scene};
use crate::state_store::PipelineState;

use super::PhaseContext;

fn enrich_one(ctx: &PhaseContext, scene: &Scene) -> EnrichedScene {
    let base = format!("{}\n\nSupporting quote: \"{}\"", scene.description, scene.quote);
    let illustration_prompt = ctx.registry.enrich_prompt(&base);
    EnrichedScene {
        chapter: scene.chapter,
        chapter_title: scene.chapter_title.clone(),
        scene_index: scene.index,
        illustration_prompt,
    }
}

fn persist_path(ctx: &PhaseContext) -> std::path::PathBuf {
    ctx.output_dir.join(".enriched-scenes.json")
}

/// Enriches every scene in `scenes`, persists the result, and marks every
/// touched chapter's enrich record completed.
pub async fn run(
    ctx: Arc<PhaseContext>,
    state: Arc<tokio::sync::Mutex<PipelineState>>,
    scenes: Vec<Scene>,
) -> anyhow::Result<Vec<EnrichedScene>> {
    ctx.bus.set_phase(Phase::Enrich);
    let chapter_numbers: Vec<u32> = {
        let mut numbers: Vec<u32> = scenes.iter().map(|s| s.chapter).collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    };

    {
        let mut guard = state.lock().await;
        ctx.state_store
            .update_phase(&mut guard, Phase::Enrich, &chapter_numbers, PhaseStatus::InProgress)
            .await?;
    }

    let enriched: Vec<EnrichedScene> = scenes.iter().map(|s| enrich_one(&ctx, s)).collect();

    let bytes = serde_json::to_vec_pretty(&enriched)?;
    atomic::write(&persist_path(&ctx), &bytes)?;

    {
        let mut guard = state.lock().await;
        ctx.state_store
            .update_phase(&mut guard, Phase::Enrich, &chapter_numbers, PhaseStatus::Completed)
            .await?;
    }

    for chapter in &chapter_numbers {
        ctx.bus.complete_chapter(*chapter, 0);
    }

    Ok(enriched)
}

/// Loads a previously persisted enrich output, for the illustrate phase to
/// resume from when the enrich pass already ran.
pub fn load(ctx: &PhaseContext) -> anyhow::Result<Option<Vec<EnrichedScene>>> {
    let path = persist_path(ctx);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}
