//! Entity Matcher: "does `new` refer to `existing`?", cached
//! by `(type, lower(new.name), lower(existing.name))`.

use serde::Deserialize;

use crate::ai::AiClient;
use crate::model::Entity;
use crate::registry::cache::{MatchKey, MatchVerdict, MatcherCache};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

#[derive(Debug, Deserialize)]
struct MatchResponse {
    is_match: bool,
    #[serde(default)]
    #[allow(dead_code)]
    matched_index: Option<usize>,
    confidence: f64,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: String,
}

pub struct EntityMatcher<'a> {
    pub client: &'a dyn AiClient,
    pub cache: &'a MatcherCache,
    pub confidence_threshold: f64,
}

impl<'a> EntityMatcher<'a> {
    /// Returns `Some(index into candidates)` when `new` should merge into that
    /// existing entity, `None` when it should become a distinct entity.
    ///
    /// Edge cases: zero candidates -> `None` (accept as new);
    /// matcher call failure -> fall back to lowercase-name equality only.
    pub async fn find_match(&self, new: &Entity, candidates: &[Entity]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        for (i, existing) in candidates.iter().enumerate() {
            let key = MatchKey::new(new.entity_type, &new.name, &existing.name);

            let verdict = if let Some(cached) = self.cache.get(&key).await {
                cached
            } else {
                let verdict = match self.ask_model(new, existing).await {
                    Ok(v) => v,
                    Err(_) => MatchVerdict {
                        is_match: crate::model::Entity::key_for(&new.name)
                            == crate::model::Entity::key_for(&existing.name),
                        confidence: 1.0,
                    },
                };
                self.cache.put(key, verdict).await;
                verdict
            };

            if verdict.is_match && verdict.confidence >= self.confidence_threshold {
                return Some(i);
            }
        }
        None
    }

    async fn ask_model(&self, new: &Entity, existing: &Entity) -> anyhow::Result<MatchVerdict> {
        let prompt = format!(
            "Does the entity described as \"{}\" ({}) refer to the same story entity as \"{}\" ({})?\n\
             Respond as JSON: {{\"is_match\": bool, \"matched_index\": 0, \"confidence\": 0.0, \"reasoning\": \"...\"}}",
            new.name, new.description, existing.name, existing.description
        );
        let response = self.client.chat_complete_json(&prompt).await?;
        let parsed: MatchResponse = serde_json::from_str(&response)?;
        Ok(MatchVerdict {
            is_match: parsed.is_match,
            confidence: parsed.confidence,
        })
    }
}
