use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use grader::checker::CheckerCache;
use grader::config::{GraderConfig, SandboxKind, StorageBackend};
use grader::languages::Languages;
use grader::redis_manager::RedisManager;
use grader::sandbox::{box_id_base, get_config, init_config, IsolateBackend, LocalBackend, SandboxBackend};
use grader::scheduler::BoxScheduler;
use grader::storage::{ArtifactStore, FsStore, S3Store};
use grader::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("grader=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = GraderConfig::from_env()?;

    // Load language configurations
    let mut languages = Languages::load(config.languages_config.as_deref())
        .context("Failed to load language configuration")?;
    languages.check_availability();
    info!(
        "Enabled languages: {}",
        languages.enabled().map(|l| l.name.as_str()).collect::<Vec<_>>().join(", ")
    );

    info!("Starting Grader Worker...");

    // Allocate unique worker_id from Redis with a lease
    let mut redis = RedisManager::connect(&config.redis_url).await?;
    let worker_id = redis.worker_id();

    init_config(worker_id)?;
    info!("Sandbox config: worker_id={}", get_config().worker_id);

    let store: Arc<dyn ArtifactStore> = match config.storage_backend {
        StorageBackend::Fs => {
            let store = FsStore::new(&config.storage_dir)
                .await
                .with_context(|| format!("Failed to open store at {}", config.storage_dir.display()))?;
            info!("Using filesystem store at {}", config.storage_dir.display());
            Arc::new(store)
        }
        StorageBackend::S3 => {
            let store = S3Store::from_env().await?;
            info!("Connected to MinIO storage");
            Arc::new(store)
        }
    };

    let backend: Arc<dyn SandboxBackend> = match config.sandbox {
        SandboxKind::Isolate => {
            Arc::new(IsolateBackend::detect(&config.isolate_path, config.require_cgroups).await?)
        }
        SandboxKind::Local => {
            warn!("Running submissions WITHOUT isolation (local sandbox backend)");
            Arc::new(LocalBackend::new())
        }
    };

    let scheduler = Arc::new(BoxScheduler::new(
        backend,
        store,
        box_id_base(worker_id),
        config.boxes,
    ));

    let testlib: Option<Arc<[u8]>> = match tokio::fs::read(&config.testlib_path).await {
        Ok(data) => {
            info!("Loaded testlib from {}", config.testlib_path.display());
            Some(Arc::from(data))
        }
        Err(e) => {
            warn!(
                "Couldn't read testlib at {}: {}. Standard checkers must not include it",
                config.testlib_path.display(),
                e
            );
            None
        }
    };

    // Keep SubTest ids (and stored outputs) of workers and restarts apart
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock is before the Unix epoch")?
        .as_secs() as i64;
    let id_base = (started * 16 + worker_id as i64) * 100_000_000;

    let worker = Arc::new(Worker::new(
        scheduler.clone(),
        Arc::new(languages),
        Arc::new(CheckerCache::new()),
        testlib,
        id_base,
    ));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    let permits = Arc::new(Semaphore::new(config.max_submissions));
    info!(
        "Waiting for jobs ({} boxes, {} concurrent submissions)...",
        scheduler.size(),
        config.max_submissions
    );

    let mut in_flight = JoinSet::new();
    loop {
        // Reap finished jobs
        while in_flight.try_join_next().is_some() {}

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => permit?,
            _ = shutdown.cancelled() => break,
        };
        let job = tokio::select! {
            job = redis.pop_job() => job?,
            _ = shutdown.cancelled() => break,
        };

        let worker = worker.clone();
        let mut publisher = redis.publisher();
        let cancel = shutdown.child_token();
        in_flight.spawn(async move {
            let _permit = permit;
            let id = job.submission.id;

            match worker.process_job(job, &cancel).await {
                Ok(report) => {
                    if let Err(e) = publisher.store_report(&report).await {
                        error!("Failed to store report for submission {}: {:#}", id, e);
                    }
                    info!(
                        "Grading job completed: submission_id={}, score={}",
                        id, report.submission.score
                    );
                }
                Err(e) => error!("Failed to process grading job {}: {}", id, e),
            }
        });
    }

    // Cancelled jobs still record their failure and publish a report
    info!("Waiting for {} in-flight jobs", in_flight.len());
    while in_flight.join_next().await.is_some() {}

    scheduler.close();
    info!("Grader worker stopped");
    Ok(())
}
