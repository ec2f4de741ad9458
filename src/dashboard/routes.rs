//! HTTP routes: `GET /api/state`, `GET /api/health`, and the
//! websocket upgrade at `/`.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::{ws, DashboardState};

#[derive(Serialize)]
pub struct StateSnapshot {
    #[serde(rename = "bookTitle")]
    pub book_title: String,
    #[serde(rename = "currentPhase")]
    pub current_phase: Option<crate::model::Phase>,
    #[serde(rename = "currentChapter", skip_serializing_if = "Option::is_none")]
    pub current_chapter: Option<u32>,
    pub stats: crate::model::RunStatistics,
    #[serde(rename = "startTime")]
    pub start_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub connections: usize,
    pub uptime: u64,
}

pub fn router(state: Arc<DashboardState>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/health", get(get_health))
        .route("/", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn get_state(State(state): State<Arc<DashboardState>>) -> Json<StateSnapshot> {
    let initial = state.bus.initial_state(
        *state.current_phase.read().unwrap(),
        *state.current_chapter.read().unwrap(),
    );
    Json(StateSnapshot {
        book_title: initial.book_title,
        current_phase: initial.current_phase,
        current_chapter: initial.current_chapter,
        stats: initial.stats,
        start_time: initial.start_time,
    })
}

async fn get_health(State(state): State<Arc<DashboardState>>) -> Json<HealthSnapshot> {
    Json(HealthSnapshot {
        status: "ok",
        connections: state.connections.load(Ordering::Relaxed),
        uptime: state.started_at.elapsed().as_secs(),
    })
}
