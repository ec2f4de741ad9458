//! Phase implementations. Each phase receives a
//! [`PhaseContext`] bundling the shared services every phase needs, so the
//! orchestrator stays the only place that wires concrete implementations.

pub mod analyze;
pub mod enrich;
pub mod extract;
pub mod illustrate;

use std::path::PathBuf;
use std::sync::Arc;

use crate::ai::AiClient;
use crate::bus::ProgressBus;
use crate::registry::cache::MatcherCache;
use crate::registry::EntityRegistry;
use crate::retry::RetryPolicy;
use crate::state_store::StateStore;
use crate::tokens::{ModelCost, TokenLimits};

pub struct PhaseContext {
    pub ai: Arc<dyn AiClient>,
    pub registry: Arc<EntityRegistry>,
    pub matcher_cache: Arc<MatcherCache>,
    pub confidence_threshold: f64,
    pub bus: Arc<ProgressBus>,
    pub state_store: Arc<StateStore>,
    pub retry_policy: RetryPolicy,
    pub max_concurrency: usize,
    pub pages_per_image: u32,
    pub style_bootstrap_count: u32,
    pub output_dir: PathBuf,
    pub book_id: String,
    pub model_cost: ModelCost,
    pub token_limits: TokenLimits,
}
