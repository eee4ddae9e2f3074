//! Worker identity lookup.
//!
//! Worker records live in an external registry; the engine only needs to
//! know that a reference names a real worker before it books a slot.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use async_trait::async_trait;

use crate::limits::MAX_WORKER_REF_LEN;

#[async_trait]
pub trait WorkerDirectory: Send + Sync {
    /// The canonical form of `worker_ref`, or `None` if no such worker exists.
    async fn resolve(&self, worker_ref: &str) -> Option<String>;
}

/// Accepts every well-formed reference. Used when no registry is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

#[async_trait]
impl WorkerDirectory for OpenDirectory {
    async fn resolve(&self, worker_ref: &str) -> Option<String> {
        let trimmed = worker_ref.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_WORKER_REF_LEN {
            return None;
        }
        Some(trimmed.to_string())
    }
}

/// A fixed roster of known workers.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    workers: HashSet<String>,
}

impl StaticDirectory {
    pub fn new<I, S>(workers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            workers: workers.into_iter().map(Into::into).collect(),
        }
    }

    /// One reference per line; blank lines and `#` comments are skipped.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        ))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[async_trait]
impl WorkerDirectory for StaticDirectory {
    async fn resolve(&self, worker_ref: &str) -> Option<String> {
        let trimmed = worker_ref.trim();
        self.workers.get(trimmed).cloned()
    }
}
