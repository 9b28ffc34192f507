use std::{sync::Arc, time::Duration};

use tokio::{signal, task::JoinSet};
use tracing_subscriber::EnvFilter;

use comprobantes::{config::AppConfig, db, default_handlers, jobs, state::AppState, Worker};

const STALE_JOB_AFTER: Duration = Duration::from_secs(30 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    let pool_size = (config.worker_concurrency as u32 + 1).max(config.database_max_pool_size);
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size,
        concurrency = config.worker_concurrency,
        notifier_enabled = config.owner_notifier_url.is_some(),
        "loaded configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, pool_size)?;

    {
        let mut conn = db::connection(&pool)?;
        let requeued = jobs::requeue_stale_jobs(&mut conn, STALE_JOB_AFTER)?;
        if requeued > 0 {
            tracing::warn!(requeued, "returned stale jobs to the queue");
        }
    }

    let poll_interval = config.worker_poll_interval;
    let concurrency = config.worker_concurrency;
    let state = Arc::new(AppState::from_config(pool, config)?);
    let worker = Arc::new(Worker::new(state.clone(), default_handlers(), poll_interval));

    let mut workers = JoinSet::new();
    for index in 0..concurrency {
        let worker = worker.clone();
        workers.spawn(async move { worker.run(index).await });
    }

    tokio::select! {
        _ = workers.join_next() => {
            tracing::error!("worker task exited unexpectedly");
        }
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    workers.shutdown().await;
    state.sri_pool.shutdown().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
