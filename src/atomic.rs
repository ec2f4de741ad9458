//! Atomic Writer: write to a sibling temp file, flush, then rename-over the
//! target, so readers never observe a partially written file.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtomicWriteError {
    #[error("cross-device rename from {tmp} to {target}: {source}")]
    FilesystemCrossDevice {
        tmp: PathBuf,
        target: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn temp_path_for(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmp".to_string());
    target.with_file_name(format!(".{file_name}.tmp"))
}

/// Write `bytes` to `path`, guaranteeing a reader never observes a truncated
/// intermediate state: either the prior contents or the new contents, never both.
pub fn write(path: &Path, bytes: &[u8]) -> Result<(), AtomicWriteError> {
    let tmp = temp_path_for(path);

    std::fs::write(&tmp, bytes).map_err(|source| AtomicWriteError::Write {
        path: tmp.clone(),
        source,
    })?;

    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(source) => {
            let _ = std::fs::remove_file(&tmp);
            if source.raw_os_error() == Some(libc_exdev()) {
                Err(AtomicWriteError::FilesystemCrossDevice {
                    tmp,
                    target: path.to_path_buf(),
                    source,
                })
            } else {
                Err(AtomicWriteError::Write {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
}

pub fn write_str(path: &Path, contents: &str) -> Result<(), AtomicWriteError> {
    write(path, contents.as_bytes())
}

/// EXDEV, the errno raised by `rename(2)` across filesystem boundaries.
/// Hardcoded rather than pulled from `libc` to avoid adding a dependency for
/// one constant; value is POSIX-stable across Linux/macOS.
fn libc_exdev() -> i32 {
    18
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_str(&path, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn overwrite_leaves_no_temp_file_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_str(&path, "first").unwrap();
        write_str(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftover: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftover.is_empty());
    }

    #[test]
    fn prior_contents_intact_if_never_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(!path.exists());
    }
}
