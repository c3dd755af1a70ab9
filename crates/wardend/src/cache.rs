//! Process-wide cache of known faces.
//!
//! Matching never reads the database directly: frame processing works
//! against an immutable snapshot published here. A reload builds a fresh
//! snapshot off to the side and swaps the `Arc` in one step, so readers
//! either see the fully-old or fully-new set, never a mix.

use std::sync::{Arc, RwLock};
use uuid::Uuid;
use warden_core::Embedding;
use warden_store::{Store, StoreError};

/// Broadcast payload telling live sessions to reload the cache.
#[derive(Debug, Clone)]
pub struct ReloadNotice {
    pub message: String,
}

/// Immutable view of all active identities at last load time.
///
/// Parallel sequences: index `i` of each field describes the same
/// identity, and the matcher's returned index applies to all three.
#[derive(Debug, Default)]
pub struct KnownFaceSnapshot {
    pub embeddings: Vec<Embedding>,
    pub names: Vec<String>,
    pub identity_ids: Vec<Uuid>,
}

impl KnownFaceSnapshot {
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Atomically-swappable holder of the current [`KnownFaceSnapshot`].
pub struct KnownFaceCache {
    store: Store,
    current: RwLock<Arc<KnownFaceSnapshot>>,
}

impl KnownFaceCache {
    /// Create an empty cache; call [`reload`](Self::reload) to populate.
    pub fn new(store: Store) -> Self {
        Self {
            store,
            current: RwLock::new(Arc::new(KnownFaceSnapshot::default())),
        }
    }

    /// The current snapshot. Callers fetch once per frame and keep the
    /// `Arc` for all faces in that frame.
    pub fn snapshot(&self) -> Arc<KnownFaceSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rebuild the snapshot from all active identities and publish it.
    ///
    /// Rows with unparseable or wrong-dimension embeddings are skipped
    /// with a warning; an empty result is valid and naturally drops any
    /// previously known faces. Returns the number of faces loaded.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let rows = self.store.active_faces().await?;

        let mut snapshot = KnownFaceSnapshot::default();
        for row in rows {
            let embedding: Embedding = match serde_json::from_str(&row.embedding_json) {
                Ok(embedding) => embedding,
                Err(err) => {
                    tracing::warn!(id = %row.id, error = %err, "skipping identity with malformed embedding");
                    continue;
                }
            };
            if !embedding.has_expected_dim() {
                tracing::warn!(
                    id = %row.id,
                    dim = embedding.values.len(),
                    "skipping identity with unexpected embedding dimensionality"
                );
                continue;
            }
            snapshot.embeddings.push(embedding);
            snapshot.names.push(row.name);
            snapshot.identity_ids.push(row.id);
        }

        let count = snapshot.len();
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
        tracing::info!(count, "known-face cache reloaded");
        Ok(count)
    }
}
