//! File Lock: scoped advisory mutual exclusion keyed by path.
//!
//! Within one process, a `DashMap` of per-path `tokio::sync::Mutex`s serializes
//! holders of the same key. Across processes, a sidecar `<path>.lock` file
//! provides best-effort advisory exclusion on filesystems that support
//! exclusive file creation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out waiting for cross-process lock on {0}")]
    Timeout(PathBuf),
}

/// Process-wide registry of per-path in-process locks.
fn registry() -> &'static DashMap<PathBuf, Arc<Mutex<()>>> {
    static REGISTRY: OnceLock<DashMap<PathBuf, Arc<Mutex<()>>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    path.with_extension(format!("lock-{:x}", hasher.finish()))
}

/// RAII guard releasing both the in-process mutex permit and the sidecar file
/// on every exit path of the caller, including panics.
struct CrossProcessGuard {
    sidecar: PathBuf,
}

impl Drop for CrossProcessGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.sidecar);
    }
}

/// Serializes all holders of `path` within this process and, via a sidecar
/// lock file, across processes on filesystems that support atomic create.
pub async fn with_lock<F, Fut, T>(path: &Path, fn_: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let key = path.to_path_buf();
    let mutex = registry()
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    let _permit = mutex.lock().await;

    let sidecar = sidecar_path(path);
    let _cross_process = acquire_sidecar(&sidecar).await?;

    fn_().await
}

async fn acquire_sidecar(sidecar: &Path) -> anyhow::Result<CrossProcessGuard> {
    const ATTEMPTS: u32 = 50;
    const BACKOFF: Duration = Duration::from_millis(20);

    for _ in 0..ATTEMPTS {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(sidecar)
        {
            Ok(_) => {
                return Ok(CrossProcessGuard {
                    sidecar: sidecar.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tokio::time::sleep(BACKOFF).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(LockError::Timeout(sidecar.to_path_buf()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn serializes_concurrent_holders() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.md");
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let path = path.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                with_lock(&path, || async {
                    let before = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(before, 0, "no other holder should be inside the critical section");
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn released_on_fn_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x");
        let result: anyhow::Result<()> =
            with_lock(&path, || async { anyhow::bail!("boom") }).await;
        assert!(result.is_err());
        // A subsequent acquisition must not deadlock or time out.
        with_lock(&path, || async { Ok(()) }).await.unwrap();
    }
}
