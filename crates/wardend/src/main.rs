use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use warden_core::{FaceExtractor, OnnxExtractor};
use warden_store::Store;

mod cache;
mod config;
mod http;
mod jobs;
mod pipeline;
mod session;

use cache::KnownFaceCache;
use config::Config;
use jobs::JobQueue;
use pipeline::FrameProcessor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!("wardend starting");

    // Model load is fail-fast: without it nothing can be recognized.
    let extractor: Arc<dyn FaceExtractor> = Arc::new(
        OnnxExtractor::load(
            &config.detector_model_path(),
            &config.recognizer_model_path(),
        )
        .context("loading ONNX models")?,
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;

    let cache = Arc::new(KnownFaceCache::new(store.clone()));
    match cache.reload().await {
        Ok(count) => tracing::info!(count, "known faces loaded at startup"),
        // Sessions reload on connect; starting empty is survivable.
        Err(err) => tracing::warn!(error = %err, "startup cache load failed"),
    }

    let (reload_tx, _) = broadcast::channel::<cache::ReloadNotice>(16);
    let (job_queue, job_rx) = JobQueue::channel();
    let _worker = jobs::spawn_worker(job_rx, store.clone(), extractor.clone(), reload_tx.clone());
    let _sweeper = jobs::spawn_retention_sweep(
        store.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        config.retention_days,
    );

    let processor = Arc::new(FrameProcessor::new(
        extractor,
        cache.clone(),
        job_queue.clone(),
        config.similarity_threshold,
        config.annotate_frames,
    ));

    let state = http::AppState {
        store,
        cache,
        processor,
        jobs: job_queue,
        reload_tx,
        frame_timeout: Duration::from_secs(config.frame_timeout_secs),
        similarity_threshold: config.similarity_threshold,
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "wardend ready");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("wardend shutting down");
        })
        .await?;

    Ok(())
}
