//! Query batches and the in-memory batch store.
//!
//! Input format: one query per line, a blank line closes the current batch.
//! Lines are trimmed. Consecutive blank lines yield empty batches.

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An ordered, immutable group of queries.
///
/// One batch is one admission slot and one latency sample, regardless of how
/// many queries it holds. Cloning is cheap; the feeder republishes the same
/// batches forever.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    queries: Arc<[Arc<str>]>,
}

impl Batch {
    pub fn new<I, S>(queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        Self {
            queries: queries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn queries(&self) -> &[Arc<str>] {
        &self.queries
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to read input {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Batches loaded once at startup and replayed for the life of the process.
#[derive(Debug, Clone, Default)]
pub struct BatchStore {
    batches: Vec<Batch>,
}

impl BatchStore {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }

    pub fn from_text(text: &str) -> Self {
        Self::new(parse_batches(text))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, BatchError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| BatchError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::from_text(&text);
        tracing::info!(
            path = %path.display(),
            batches = store.len(),
            queries = store.total_queries(),
            "Loaded query batches"
        );
        Ok(store)
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Batch> {
        self.batches.iter()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn total_queries(&self) -> usize {
        self.batches.iter().map(Batch::len).sum()
    }
}

/// Split input text into batches.
///
/// There is always a current batch; each blank line pushes a fresh one. A
/// trailing newline does not add a batch, but a trailing blank line does.
pub fn parse_batches(text: &str) -> Vec<Batch> {
    let mut groups: Vec<Vec<&str>> = vec![Vec::new()];
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            groups.push(Vec::new());
        } else if let Some(current) = groups.last_mut() {
            current.push(line);
        }
    }
    groups.into_iter().map(Batch::new).collect()
}
