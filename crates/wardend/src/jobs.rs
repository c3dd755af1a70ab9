//! Background jobs: embedding computation, access-log writes and the
//! retention sweep.
//!
//! Jobs run on a single worker task fed by an unbounded queue, off the
//! frame path. Delivery is at-least-once from the caller's perspective:
//! re-running an embedding computation overwrites the same row, and a
//! re-run log write produces a duplicate entry (accepted trade-off).
//! Failures are logged and swallowed; nothing here propagates to a
//! live session.

use crate::cache::ReloadNotice;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;
use warden_core::FaceExtractor;
use warden_store::Store;

/// One unit of background work.
#[derive(Debug)]
pub enum Job {
    /// Compute and persist the embedding for a newly created identity,
    /// then broadcast a cache invalidation to all live sessions.
    ComputeEmbedding { identity_id: Uuid },
    /// Durably record one recognition event. The identity reference was
    /// captured at match time; `None` means a stranger.
    WriteLog {
        identity_id: Option<Uuid>,
        display_name: String,
        message: String,
        matched: bool,
    },
}

/// Clone-safe handle for enqueueing jobs.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    /// Create the queue and its receiving end (passed to [`spawn_worker`]).
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire-and-forget enqueue; never blocks the caller.
    pub fn enqueue(&self, job: Job) {
        if self.tx.send(job).is_err() {
            tracing::error!("job worker is gone; dropping background job");
        }
    }
}

/// Spawn the background worker loop.
pub fn spawn_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    store: Store,
    extractor: Arc<dyn FaceExtractor>,
    reload_tx: broadcast::Sender<ReloadNotice>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("job worker started");
        while let Some(job) = rx.recv().await {
            match job {
                Job::ComputeEmbedding { identity_id } => {
                    compute_embedding(&store, extractor.as_ref(), &reload_tx, identity_id).await;
                }
                Job::WriteLog { identity_id, display_name, message, matched } => {
                    write_log(&store, identity_id, &display_name, &message, matched).await;
                }
            }
        }
        tracing::info!("job worker exiting");
    })
}

/// Compute the embedding for one identity's source image.
///
/// The identity must contain exactly one detectable face; zero or several
/// leave it inactive with a warning and no retry. Success activates the
/// identity and notifies every live session to reload its cache.
pub async fn compute_embedding(
    store: &Store,
    extractor: &dyn FaceExtractor,
    reload_tx: &broadcast::Sender<ReloadNotice>,
    identity_id: Uuid,
) {
    let source = match store.identity_source(identity_id).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            // Race with deletion between trigger and execution.
            tracing::warn!(id = %identity_id, "identity vanished before embedding computation");
            return;
        }
        Err(err) => {
            tracing::error!(id = %identity_id, error = %err, "failed to load identity source");
            return;
        }
    };
    let (name, image_bytes) = source;

    let image = match image::load_from_memory(&image_bytes) {
        Ok(image) => image,
        Err(err) => {
            tracing::warn!(id = %identity_id, name, error = %err, "source image unreadable; identity stays inactive");
            return;
        }
    };

    let faces = match extractor.extract(&image) {
        Ok(faces) => faces,
        Err(err) => {
            tracing::warn!(id = %identity_id, name, error = %err, "extraction failed; identity stays inactive");
            return;
        }
    };

    if faces.len() != 1 {
        tracing::warn!(
            id = %identity_id,
            name,
            faces = faces.len(),
            "source image needs exactly one face; identity stays inactive"
        );
        return;
    }

    let embedding_json = match serde_json::to_string(&faces[0].embedding) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(id = %identity_id, error = %err, "failed to serialize embedding");
            return;
        }
    };

    if let Err(err) = store.store_embedding(identity_id, embedding_json).await {
        tracing::error!(id = %identity_id, error = %err, "failed to persist embedding");
        return;
    }

    tracing::info!(id = %identity_id, name, "embedding computed, identity active");

    // No subscribers is fine; sessions reload on connect anyway.
    let _ = reload_tx.send(ReloadNotice {
        message: format!("New profile {name} saved. Reloading known faces."),
    });
}

/// Append one access-log row.
async fn write_log(
    store: &Store,
    identity_id: Option<Uuid>,
    display_name: &str,
    message: &str,
    matched: bool,
) {
    if let Err(err) = store.append_log(identity_id, matched, message).await {
        // The frame response has already been sent; nothing to raise.
        tracing::error!(display_name, error = %err, "failed to write access log");
    } else {
        tracing::debug!(display_name, matched, "access log written");
    }
}

/// Spawn the periodic retention sweep.
///
/// Deletes access-log entries older than `retention_days` every
/// `interval`. Idempotent by construction; a run that finds nothing
/// expired deletes zero rows.
pub fn spawn_retention_sweep(
    store: Store,
    interval: Duration,
    retention_days: i64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick doubles as a catch-up sweep at startup.
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - ChronoDuration::days(retention_days);
            match store.purge_logs_before(cutoff).await {
                Ok(deleted) => {
                    tracing::info!(deleted, %cutoff, "retention sweep complete");
                }
                Err(err) => {
                    tracing::error!(error = %err, "retention sweep failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use warden_core::{Embedding, ExtractError, Face, FaceBox, EMBEDDING_DIM};

    /// Extractor returning a fixed set of faces, ignoring the image.
    struct FixedExtractor {
        faces: Vec<Face>,
    }

    impl FaceExtractor for FixedExtractor {
        fn extract(&self, _image: &DynamicImage) -> Result<Vec<Face>, ExtractError> {
            Ok(self.faces.clone())
        }
    }

    fn face(seed: f32) -> Face {
        Face {
            bbox: FaceBox { left: 10, top: 10, right: 50, bottom: 50 },
            embedding: Embedding { values: vec![seed; EMBEDDING_DIM] },
        }
    }

    fn png_bytes() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(4, 4, image::Rgb([100, 120, 140]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(image)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_compute_embedding_activates_and_broadcasts() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.create_identity("staff", "Alice", png_bytes()).await.unwrap();

        let (reload_tx, mut reload_rx) = broadcast::channel(4);
        let extractor = FixedExtractor { faces: vec![face(0.3)] };

        compute_embedding(&store, &extractor, &reload_tx, id).await;

        let faces = store.active_faces().await.unwrap();
        assert_eq!(faces.len(), 1);
        let values: Vec<f32> = serde_json::from_str(&faces[0].embedding_json).unwrap();
        assert_eq!(values.len(), EMBEDDING_DIM);

        let notice = reload_rx.try_recv().unwrap();
        assert!(notice.message.contains("Alice"));
    }

    #[tokio::test]
    async fn test_compute_embedding_zero_faces_leaves_inactive() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.create_identity("staff", "NoFace", png_bytes()).await.unwrap();

        let (reload_tx, mut reload_rx) = broadcast::channel(4);
        let extractor = FixedExtractor { faces: vec![] };

        compute_embedding(&store, &extractor, &reload_tx, id).await;

        assert!(store.active_faces().await.unwrap().is_empty());
        assert!(reload_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_compute_embedding_multiple_faces_leaves_inactive() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.create_identity("staff", "Crowd", png_bytes()).await.unwrap();

        let (reload_tx, mut reload_rx) = broadcast::channel(4);
        let extractor = FixedExtractor { faces: vec![face(0.1), face(0.2)] };

        compute_embedding(&store, &extractor, &reload_tx, id).await;

        assert!(store.active_faces().await.unwrap().is_empty());
        assert!(reload_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_compute_embedding_vanished_identity_is_quiet() {
        let store = Store::open_in_memory().await.unwrap();
        let (reload_tx, mut reload_rx) = broadcast::channel(4);
        let extractor = FixedExtractor { faces: vec![face(0.1)] };

        // Never created; must log and return without side effects.
        compute_embedding(&store, &extractor, &reload_tx, Uuid::new_v4()).await;
        assert!(reload_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_compute_embedding_unreadable_image() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store
            .create_identity("staff", "Garbled", vec![0xde, 0xad, 0xbe, 0xef])
            .await
            .unwrap();

        let (reload_tx, _reload_rx) = broadcast::channel(4);
        let extractor = FixedExtractor { faces: vec![face(0.1)] };

        compute_embedding(&store, &extractor, &reload_tx, id).await;
        assert!(store.active_faces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_worker_processes_log_jobs() {
        let store = Store::open_in_memory().await.unwrap();
        let (queue, rx) = JobQueue::channel();
        let (reload_tx, _) = broadcast::channel(4);
        let extractor: Arc<dyn FaceExtractor> = Arc::new(FixedExtractor { faces: vec![] });

        let handle = spawn_worker(rx, store.clone(), extractor, reload_tx);

        queue.enqueue(Job::WriteLog {
            identity_id: None,
            display_name: "Stranger".into(),
            message: "New Stranger detected".into(),
            matched: false,
        });
        drop(queue); // worker drains the queue then exits
        handle.await.unwrap();

        let logs = store.recent_logs(10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].matched);
        assert_eq!(logs[0].message, "New Stranger detected");
    }

    #[tokio::test]
    async fn test_compute_embedding_rerun_is_safe() {
        let store = Store::open_in_memory().await.unwrap();
        let id = store.create_identity("staff", "Alice", png_bytes()).await.unwrap();

        let (reload_tx, _reload_rx) = broadcast::channel(4);
        let extractor = FixedExtractor { faces: vec![face(0.3)] };

        compute_embedding(&store, &extractor, &reload_tx, id).await;
        compute_embedding(&store, &extractor, &reload_tx, id).await;

        // Still exactly one active row; the second run overwrote in place.
        assert_eq!(store.active_faces().await.unwrap().len(), 1);
    }
}
