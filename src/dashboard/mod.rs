//! Dashboard Server: HTTP + streaming socket on the same
//! port, replicating the Progress Bus to browsers.

pub mod routes;
pub mod ws;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use crate::bus::ProgressBus;
use crate::model::Phase;

pub struct DashboardState {
    pub bus: Arc<ProgressBus>,
    pub started_at: Instant,
    pub connections: AtomicUsize,
    pub current_phase: std::sync::RwLock<Option<Phase>>,
    pub current_chapter: std::sync::RwLock<Option<u32>>,
    /// Per-subscriber outbound buffer bound: slow subscribers
    /// are dropped rather than allowed to block the pipeline.
    pub outbound_buffer: usize,
    pub shutdown: Notify,
}

pub struct DashboardServer {
    state: Arc<DashboardState>,
    join_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DashboardServer {
    pub fn new(bus: Arc<ProgressBus>) -> Self {
        let state = Arc::new(DashboardState {
            bus,
            started_at: Instant::now(),
            connections: AtomicUsize::new(0),
            current_phase: std::sync::RwLock::new(None),
            current_chapter: std::sync::RwLock::new(None),
            outbound_buffer: 256,
            shutdown: Notify::new(),
        });
        DashboardServer {
            state,
            join_handle: std::sync::Mutex::new(None),
        }
    }

    pub fn set_current(&self, phase: Option<Phase>, chapter: Option<u32>) {
        *self.state.current_phase.write().unwrap() = phase;
        *self.state.current_chapter.write().unwrap() = chapter;
    }

    /// `start(host, port)`: opens an HTTP listener and a streaming-socket
    /// listener on the same port.
    pub async fn start(&self, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
        let app: Router = routes::router(self.state.clone());
        let listener = TcpListener::bind((host, port)).await?;
        let bound = listener.local_addr()?;
        info!(%bound, "dashboard server listening");

        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let shutdown_signal = async move {
                state.shutdown.notified().await;
            };
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal)
                .await;
        });
        *self.join_handle.lock().unwrap() = Some(handle);
        Ok(bound)
    }

    /// `stop()`: closes all subscribers and joins the listener.
    pub async fn stop(&self) {
        self.state.shutdown.notify_waiters();
        let handle = self.join_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
