//! `mim run`: acquire the singleton lock, restore state, drive the workers.

use anyhow::Result;
use std::sync::Arc;

use mim_core::config::IngestConfig;
use mim_core::normalize::FfmpegEncoder;
use mim_core::outbox::DirectoryOutbox;
use mim_core::paths::StateLayout;
use mim_core::pipeline::Pipeline;
use mim_core::supervisor::{LockError, SingletonLock, EXIT_ALREADY_RUNNING};

pub async fn run_pipeline(cfg: IngestConfig, layout: StateLayout, drain: bool) -> Result<()> {
    layout.ensure_dirs()?;

    let lock = match SingletonLock::acquire(&layout.lock_file()) {
        Ok(lock) => lock,
        Err(LockError::AlreadyRunning(pid)) => {
            eprintln!("mim is already running (pid {pid})");
            std::process::exit(EXIT_ALREADY_RUNNING);
        }
        Err(e) => return Err(e.into()),
    };

    let delivery_dir = layout.root().join("delivery");
    let outbox = Arc::new(DirectoryOutbox::new(delivery_dir));
    let encoder = Arc::new(FfmpegEncoder::new(cfg.transcode.clone()));

    let pipeline = Pipeline::restore(cfg, layout, outbox, encoder)?;
    let supervisor = pipeline.supervisor();
    let handles = pipeline.spawn();
    tracing::info!("pipeline running");

    if drain {
        pipeline.drain().await?;
        tracing::info!("all queues drained; shutting down");
    } else {
        tokio::signal::ctrl_c().await?;
        tracing::info!("interrupt received; shutting down");
    }

    supervisor.request_shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    lock.release();
    Ok(())
}
