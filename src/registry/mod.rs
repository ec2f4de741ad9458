//! Entity Registry: arena + index layout — entities live in a stable
//! vector; the canonical-key map and the alias
//! map both hold indices into it, so there are no cyclic references between
//! aliases and owners.

pub mod cache;
pub mod matcher;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ai::AiClient;
use crate::atomic;
use crate::model::{Entity, EntityType, Enrichment, FirstAppearance, SupportingQuote};
use crate::registry::cache::MatcherCache;
use crate::registry::matcher::EntityMatcher;

#[derive(Debug, Clone)]
pub struct UpsertContext {
    pub book_id: String,
    pub chapter: u32,
}

/// A candidate entity extracted for one chapter, before it is reconciled
/// against the registry.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub entity_type: EntityType,
    pub name: String,
    pub description: String,
    pub quotes: Vec<SupportingQuote>,
}

#[derive(Serialize, Deserialize)]
struct RegistrySnapshot {
    entities: Vec<Entity>,
}

/// Feature flag: AI-consolidated merge description vs simple concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Concatenate,
    AiConsolidate,
}

pub struct EntityRegistry {
    /// Stable arena: entities never move once inserted, so indices survive merges.
    arena: RwLock<Vec<Entity>>,
    /// canonical key -> index into `arena`.
    canonical_index: DashMap<String, usize>,
    /// alias key -> index into `arena`.
    alias_index: DashMap<String, usize>,
    persist_path: PathBuf,
    merge_strategy: MergeStrategy,
}

impl EntityRegistry {
    pub fn new(persist_path: impl Into<PathBuf>, merge_strategy: MergeStrategy) -> Self {
        EntityRegistry {
            arena: RwLock::new(Vec::new()),
            canonical_index: DashMap::new(),
            alias_index: DashMap::new(),
            persist_path: persist_path.into(),
            merge_strategy,
        }
    }

    pub fn load(path: impl Into<PathBuf>, merge_strategy: MergeStrategy) -> anyhow::Result<Self> {
        let path = path.into();
        let registry = EntityRegistry::new(path.clone(), merge_strategy);
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let snapshot: RegistrySnapshot = serde_json::from_slice(&bytes)?;
            let mut arena = registry.arena.write().unwrap();
            for entity in snapshot.entities {
                let idx = arena.len();
                registry.canonical_index.insert(entity.canonical_key(), idx);
                for alias in &entity.aliases {
                    registry.alias_index.insert(Entity::key_for(alias), idx);
                }
                arena.push(entity);
            }
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.arena.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Entity> {
        self.arena.read().unwrap().clone()
    }

    fn resolve_index(&self, name: &str) -> Option<usize> {
        let key = Entity::key_for(name);
        self.canonical_index
            .get(&key)
            .map(|r| *r)
            .or_else(|| self.alias_index.get(&key).map(|r| *r))
    }

    fn candidates_of_type(&self, entity_type: EntityType) -> Vec<Entity> {
        self.arena
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect()
    }

    /// `upsert(new, ctx)`: choose the canonical key via the Entity Matcher,
    /// then merge or insert.
    pub async fn upsert(
        &self,
        client: &dyn AiClient,
        cache: &MatcherCache,
        confidence_threshold: f64,
        new: NewEntity,
        ctx: UpsertContext,
    ) -> usize {
        let candidate = Entity {
            entity_type: new.entity_type,
            name: new.name.clone(),
            quotes: new.quotes.clone(),
            description: new.description.clone(),
            aliases: vec![],
            first_appearance: FirstAppearance {
                book_id: ctx.book_id.clone(),
                chapter: ctx.chapter,
            },
            appearances: vec![ctx.chapter],
            enrichments: vec![],
        };

        // Self-match: an existing canonical key identical to the new name is
        // always the same entity — no need to ask the matcher
        // ("self-match attempt, same canonical key -> no-op").
        if let Some(idx) = self.resolve_index(&new.name) {
            self.merge(idx, candidate, ctx);
            return idx;
        }

        let same_type = self.candidates_of_type(new.entity_type);
        let matcher = EntityMatcher {
            client,
            cache,
            confidence_threshold,
        };
        let matched = matcher.find_match(&candidate, &same_type).await;

        match matched {
            Some(local_idx) => {
                let global_idx = self.canonical_index.get(&same_type[local_idx].canonical_key()).map(|r| *r)
                    .unwrap_or_else(|| self.resolve_index(&same_type[local_idx].name).expect("matched candidate must be indexed"));
                self.merge(global_idx, candidate, ctx);
                global_idx
            }
            None => self.insert_new(candidate),
        }
    }

    fn insert_new(&self, entity: Entity) -> usize {
        let mut arena = self.arena.write().unwrap();
        let idx = arena.len();
        self.canonical_index.insert(entity.canonical_key(), idx);
        arena.push(entity);
        idx
    }

    /// `merge(existing, new)`: appends unique quotes, records an alias if the
    /// name differs, unifies the description, tracks appearances.
    fn merge(&self, idx: usize, new: Entity, ctx: UpsertContext) {
        let mut arena = self.arena.write().unwrap();
        let existing = &mut arena[idx];

        let new_key = Entity::key_for(&new.name);
        if new_key != existing.canonical_key() && !existing.aliases.iter().any(|a| Entity::key_for(a) == new_key) {
            existing.aliases.push(new.name.clone());
            self.alias_index.insert(new_key, idx);
        }

        for q in new.quotes {
            if !existing.quotes.iter().any(|e| e.text == q.text) {
                existing.quotes.push(q);
            }
        }

        if !existing.appearances.contains(&ctx.chapter) {
            existing.appearances.push(ctx.chapter);
        }

        existing.description = match self.merge_strategy {
            MergeStrategy::Concatenate => {
                if existing.description.contains(&new.description) || new.description.is_empty() {
                    existing.description.clone()
                } else {
                    format!("{}; {}", existing.description, new.description)
                }
            }
            // AI consolidation is performed by the caller (it needs an async
            // AiClient call); here we record the raw addition as an
            // enrichment and leave the description for the caller to replace.
            MergeStrategy::AiConsolidate => existing.description.clone(),
        };

        existing.enrichments.push(Enrichment {
            detail: new.description,
            source_chapter: ctx.chapter,
            timestamp: Utc::now(),
        });
    }

    /// `getMentions(text) -> [Entity]`: case-insensitive substring matching
    /// of canonical names and aliases.
    pub fn get_mentions(&self, text: &str) -> Vec<Entity> {
        let lower = text.to_lowercase();
        self.arena
            .read()
            .unwrap()
            .iter()
            .filter(|e| {
                lower.contains(&e.canonical_key())
                    || e.aliases.iter().any(|a| lower.contains(&Entity::key_for(a)))
            })
            .cloned()
            .collect()
    }

    /// `enrichPrompt(prompt) -> prompt'`: appends structured facts about
    /// mentioned entities.
    pub fn enrich_prompt(&self, prompt: &str) -> String {
        let mentions = self.get_mentions(prompt);
        if mentions.is_empty() {
            return prompt.to_string();
        }
        let mut out = prompt.to_string();
        out.push_str("\n\n--- Known entity details ---\n");
        for entity in mentions {
            out.push_str(&format!("- {}: {}\n", entity.name, entity.description));
        }
        out
    }

    /// Persist every mutation, under the registry's write lock.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = RegistrySnapshot {
            entities: self.snapshot(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.persist_path.clone();
        crate::lock::with_lock(&path, || async move {
            atomic::write(&path, &bytes)?;
            Ok(())
        })
        .await
    }
}

pub fn default_persist_path(output_dir: &Path) -> PathBuf {
    output_dir.join(".entity-registry.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockAiClient;
    use std::time::Duration;

    fn new_entity(name: &str, desc: &str) -> NewEntity {
        NewEntity {
            entity_type: EntityType::Creature,
            name: name.to_string(),
            description: desc.to_string(),
            quotes: vec![SupportingQuote { text: format!("quote about {name}"), page: Some(1) }],
        }
    }

    #[tokio::test]
    async fn scenario_dragon_fuses_descriptions_across_chapters() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EntityRegistry::new(dir.path().join("registry.json"), MergeStrategy::Concatenate);
        let client = MockAiClient::json_replies(vec![
            r#"{"is_match": true, "matched_index": 0, "confidence": 0.9, "reasoning": "same dragon"}"#.to_string(),
        ]);
        let cache = MatcherCache::new(10, Duration::from_secs(60));

        registry
            .upsert(
                &client,
                &cache,
                matcher::DEFAULT_CONFIDENCE_THRESHOLD,
                new_entity("Dragon", "Green scales"),
                UpsertContext { book_id: "b".into(), chapter: 1 },
            )
            .await;
        registry
            .upsert(
                &client,
                &cache,
                matcher::DEFAULT_CONFIDENCE_THRESHOLD,
                new_entity("Dragon", "Emerald eyes"),
                UpsertContext { book_id: "b".into(), chapter: 2 },
            )
            .await;

        assert_eq!(registry.len(), 1);
        let entities = registry.snapshot();
        let dragon = &entities[0];
        assert!(dragon.description.contains("Green scales"));
        assert!(dragon.description.contains("Emerald eyes"));
        assert_eq!(dragon.appearances, vec![1, 2]);
    }

    #[tokio::test]
    async fn distinct_entities_of_same_type_stay_separate() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EntityRegistry::new(dir.path().join("registry.json"), MergeStrategy::Concatenate);
        let client = MockAiClient::json_replies(vec![
            r#"{"is_match": false, "matched_index": 0, "confidence": 0.1, "reasoning": "different"}"#.to_string(),
        ]);
        let cache = MatcherCache::new(10, Duration::from_secs(60));

        registry
            .upsert(&client, &cache, matcher::DEFAULT_CONFIDENCE_THRESHOLD, new_entity("Dragon", "A"), UpsertContext { book_id: "b".into(), chapter: 1 })
            .await;
        registry
            .upsert(&client, &cache, matcher::DEFAULT_CONFIDENCE_THRESHOLD, new_entity("Wyrm", "B"), UpsertContext { book_id: "b".into(), chapter: 2 })
            .await;

        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn alias_reverse_maps_to_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EntityRegistry::new(dir.path().join("registry.json"), MergeStrategy::Concatenate);
        let client = MockAiClient::json_replies(vec![
            r#"{"is_match": true, "matched_index": 0, "confidence": 0.9, "reasoning": "alias"}"#.to_string(),
        ]);
        let cache = MatcherCache::new(10, Duration::from_secs(60));

        registry
            .upsert(&client, &cache, matcher::DEFAULT_CONFIDENCE_THRESHOLD, new_entity("Dragon", "A"), UpsertContext { book_id: "b".into(), chapter: 1 })
            .await;
        registry
            .upsert(&client, &cache, matcher::DEFAULT_CONFIDENCE_THRESHOLD, new_entity("Smaug", "B"), UpsertContext { book_id: "b".into(), chapter: 2 })
            .await;

        let entities = registry.snapshot();
        assert_eq!(entities.len(), 1);
        assert!(entities[0].aliases.contains(&"Smaug".to_string()));
        assert_eq!(registry.resolve_index("Smaug"), Some(0));
    }

    #[tokio::test]
    async fn self_match_is_a_no_op_for_alias_list() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EntityRegistry::new(dir.path().join("registry.json"), MergeStrategy::Concatenate);
        let client = MockAiClient::failing();
        let cache = MatcherCache::new(10, Duration::from_secs(60));

        registry
            .upsert(&client, &cache, matcher::DEFAULT_CONFIDENCE_THRESHOLD, new_entity("Dragon", "A"), UpsertContext { book_id: "b".into(), chapter: 1 })
            .await;
        registry
            .upsert(&client, &cache, matcher::DEFAULT_CONFIDENCE_THRESHOLD, new_entity("Dragon", "B"), UpsertContext { book_id: "b".into(), chapter: 1 })
            .await;

        let entities = registry.snapshot();
        assert_eq!(entities.len(), 1);
        assert!(entities[0].aliases.is_empty());
    }

    #[tokio::test]
    async fn get_mentions_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EntityRegistry::new(dir.path().join("registry.json"), MergeStrategy::Concatenate);
        let client = MockAiClient::failing();
        let cache = MatcherCache::new(10, Duration::from_secs(60));
        registry
            .upsert(&client, &cache, matcher::DEFAULT_CONFIDENCE_THRESHOLD, new_entity("Dragon", "scales"), UpsertContext { book_id: "b".into(), chapter: 1 })
            .await;

        let mentions = registry.get_mentions("The DRAGON roared.");
        assert_eq!(mentions.len(), 1);
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = EntityRegistry::new(path.clone(), MergeStrategy::Concatenate);
        let client = MockAiClient::failing();
        let cache = MatcherCache::new(10, Duration::from_secs(60));
        registry
            .upsert(&client, &cache, matcher::DEFAULT_CONFIDENCE_THRESHOLD, new_entity("Dragon", "scales"), UpsertContext { book_id: "b".into(), chapter: 1 })
            .await;
        registry.persist().await.unwrap();

        let reloaded = EntityRegistry::load(path, MergeStrategy::Concatenate).unwrap();
        assert_eq!(reloaded.len(), 1);
    }
}
