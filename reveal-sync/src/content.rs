//! "Is there shared content to reveal?" collaborator.
//!
//! Storage and retrieval of the content live elsewhere; the coordinator only
//! needs a yes/no answer for `full_state.hasImage`, plus a revision marker so
//! the server can notice a new upload. Probes are consulted outside the
//! coordinator lock since they may touch the filesystem.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

/// Marker that changes whenever the content does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRevision {
    File {
        modified: Option<SystemTime>,
        len: u64,
    },
    Counter(u64),
}

#[async_trait]
pub trait ContentProbe: Send + Sync {
    /// Current revision, `None` while no content is available.
    async fn revision(&self) -> Option<ContentRevision>;

    async fn has_content(&self) -> bool {
        self.revision().await.is_some()
    }
}

/// Content backed by a single file on disk.
#[derive(Debug, Clone)]
pub struct FileContent {
    path: PathBuf,
}

impl FileContent {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContentProbe for FileContent {
    /// Regular files only; directories and stat errors count as absent.
    async fn revision(&self) -> Option<ContentRevision> {
        let meta = tokio::fs::metadata(&self.path).await.ok()?;
        if meta.is_dir() {
            return None;
        }
        Some(ContentRevision::File {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// In-memory switch, for deployments without files and for tests.
#[derive(Debug, Default)]
pub struct StaticContent {
    available: AtomicBool,
    revision: AtomicU64,
}

impl StaticContent {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
            revision: AtomicU64::new(0),
        }
    }

    pub fn set(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Simulate a fresh upload.
    pub fn replace(&self) {
        self.revision.fetch_add(1, Ordering::Relaxed);
        self.available.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl ContentProbe for StaticContent {
    async fn revision(&self) -> Option<ContentRevision> {
        self.available
            .load(Ordering::Relaxed)
            .then(|| ContentRevision::Counter(self.revision.load(Ordering::Relaxed)))
    }
}
