use std::{
    io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    queue::QueueReceiver,
    tracker::{WorkTicket, WorkTracker},
};

/// Downloaded bytes waiting to be persisted.
#[derive(Debug)]
pub struct WriteJob {
    /// Path relative to the crawl root, `/` separated.
    pub relative: String,
    pub contents: Vec<u8>,
    pub ticket: WorkTicket,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("tried to write {path:?} outside of output dir {}", root.display())]
    EscapesRoot { path: String, root: PathBuf },
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    pub files: u64,
    pub bytes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone)]
pub struct LocalWriter {
    root: PathBuf,
}

impl LocalWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps a crawl-relative path to its location on disk, refusing anything
    /// that would land outside of the output root.
    ///
    /// `.` and `..` are folded lexically, so `refs/../config` is just `config`.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, WriteError> {
        let escapes = || WriteError::EscapesRoot {
            path: relative.to_owned(),
            root: self.root.clone(),
        };

        let mut inside = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => inside.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !inside.pop() {
                        return Err(escapes());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escapes()),
            }
        }

        // the root itself is a directory, never a file
        if inside.as_os_str().is_empty() {
            return Err(escapes());
        }

        Ok(self.root.join(inside))
    }

    pub async fn write(&self, relative: &str, contents: &[u8]) -> Result<PathBuf, WriteError> {
        let path = self.resolve(relative)?;
        let io_err = |source| WriteError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&path, contents).await.map_err(io_err)?;

        Ok(path)
    }
}

/// Persists jobs until every sender is gone.
///
/// A path escaping the output root aborts the whole run, any other failure is
/// only reported.
pub async fn run_writer(
    writer: LocalWriter,
    mut rx: QueueReceiver<WriteJob>,
    tracker: WorkTracker,
) -> WriteStats {
    let mut stats = WriteStats::default();

    while let Some(job) = rx.recv().await {
        match writer.write(&job.relative, &job.contents).await {
            Ok(path) => {
                stats.files += 1;
                stats.bytes += job.contents.len() as u64;
                debug!("Wrote {} ({} bytes)", path.display(), job.contents.len());
            }
            Err(e @ WriteError::EscapesRoot { .. }) => {
                error!("{e}, is someone trying to prank you?");
                stats.failures += 1;
                tracker.abort(e.to_string());
            }
            Err(e) => {
                warn!("{e}");
                stats.failures += 1;
            }
        }
    }

    stats
}
